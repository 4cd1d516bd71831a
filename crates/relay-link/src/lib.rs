//! Persistent framed TCP link to the Kore controller.
//!
//! One dedicated I/O thread owns all link state; `send_frame` and `connect`
//! post commands onto it through a channel plus a `mio::Waker`. Frames are
//! three header bytes (`kind`, `u16` little-endian length) followed by the
//! payload.

mod frame;
mod link;
mod reconnect;

pub use frame::{FrameKind, HEADER_LEN, MAX_PAYLOAD, encode_frame, parse_header};
pub use link::{FrameHandler, KoreLink, LinkConfig, LinkError};
pub use reconnect::{PortRing, ReconnectPolicy, ReconnectState};
