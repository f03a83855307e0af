//! Shared fixtures for the cantp integration tests
pub mod hook_driver;
pub mod sim_bus;
pub mod test_upper;
