//! Protocol state machine for the relay: opcode classification, the rolling
//! seed/checksum state, and the SEND/RECV transforms that the hook
//! trampolines drive.
//!
//! Everything in this crate is platform-independent; the leaf seed/checksum
//! routines are reached through raw function pointers supplied by the hook
//! layer.

mod checksum;
mod hex;
mod opcodes;
mod pipeline;
mod rules;
mod scanner;
mod state;

pub use checksum::{ChecksumFn, ChecksumService, SeedFn};
pub use hex::hex_preview;
pub use opcodes::{B3_00, C7_0A, C7_0B, MARKER_1C_0B, OP_26_0C, Opcode2};
pub use pipeline::{RecvDisposition, process_recv, transform_send};
pub use rules::{on_recv, on_send_head};
pub use scanner::{ScanResult, scan};
pub use state::ProtocolState;
