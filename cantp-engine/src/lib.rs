//! An ISO 15765-2 CAN transport protocol engine in Rust
//!
//! Cantp-engine segments messages of up to 4 GiB into CAN or CAN-FD frames and reassembles them
//! on the receiving side, handling the flow control handshake and the protocol timers. It is
//! primarily intended to be run on microcontrollers, and so it is no_std compatible and performs
//! no heap allocation. It provides the following features:
//!
//! * Single Frame, First Frame, Consecutive Frame and Flow Control handling for classic CAN and
//!   CAN-FD frame lengths.
//! * Standard, Extended, Mixed and NormalFixed addressing.
//! * A fixed pool of channels, so several transfers can run at once in both directions.
//! * Block size and STmin negotiation, with runtime changes of the values announced to peers and
//!   an STmin override for transmissions.
//! * N_As, N_Bs, N_Cs, N_Ar, N_Br and N_Cr supervision, and wait frames while the upper layer has
//!   no buffer.
//!
//! # Getting Started
//!
//! ## Configuration
//!
//! The N-SDUs are described by static tables of [`RxNSduConfig`](config::RxNSduConfig) and
//! [`TxNSduConfig`](config::TxNSduConfig), see the [config] module docs.
//!
//! ## Collaborators
//!
//! The engine talks to two layers, both provided by the application:
//!
//! * A [`CanDriver`](common::CanDriver), which queues frames for transmission. When the CAN
//!   controller reports a frame as sent, the application calls [`CanTp::tx_confirmation`].
//! * An [`UpperLayer`](common::UpperLayer), which provides buffer for received messages and data
//!   for transmitted ones, and receives the outcome of every transfer.
//!
//! ## Instantiating the [`CanTp`] object
//!
//! ```ignore
//! static ENGINE: StaticCell<CanTp<'static, 4>> = StaticCell::new();
//! let engine = ENGINE.init(CanTp::new(&CONFIG, &DRIVER, &ROUTER).unwrap());
//! engine.init();
//! ```
//!
//! ## Handling CAN messages
//!
//! Received frames are passed to [`CanTp::rx_indication`]. This can be done in any thread, a good
//! way to do it is to have the CAN controller receive interrupt call it directly. The engine never
//! blocks: if another context is working on the same channel, the frame is left for that context
//! to process.
//!
//! ```ignore
//! let frame = cantp_engine::common::CanFrame::new(id, &buffer[..len]).unwrap();
//! engine.rx_indication(&frame);
//! ```
//!
//! [`CanTp::main_function`] must be called with the period configured in
//! [`main_function_period_us`](config::CanTpConfig::main_function_period_us). All timers and the
//! separation time between consecutive frames are counted in these periods.
//!
//! ```ignore
//! loop {
//!     lilos::time::sleep_for(Duration::from_millis(1)).await;
//!     engine.main_function();
//! }
//! ```
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
mod cantp;
mod channel;
mod codec;
pub mod config;
mod det;
mod flow_control;
mod lock;
mod rx;
mod timing;
mod tx;

pub use cantp_common as common;
pub use critical_section;

pub use cantp::{CanTp, Parameter};
pub use channel::{ChannelState, DataFrame, Direction, FcKind, RxState, TxState};
pub use config::{CanTpConfig, ConfigError};
pub use det::{ApiId, CanTpError, DetError};
