//! Common types shared by the cantp crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `cantp-engine`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod messages;
pub mod pci;
pub mod traits;

pub use messages::{CanFrame, CanId, FrameError};
pub use traits::{BufferError, CanDriver, CanSendError, PduId, TpError, UpperLayer};
