//! Slot-patch hook engine: capture of the host's SEND/RECV function-pointer
//! slots, the trampolines that interpose on them, the watchdog that keeps the
//! patches in place, and the injection queue that feeds controller-originated
//! bytes into the client's send path.
//!
//! The page/patch machinery is Windows-only; the trampoline cores, protocol
//! handling and injection queue are portable and exercised with in-process
//! function-pointer doubles on any platform.

mod error;
mod hook;
mod inject;
#[cfg(windows)]
mod mem;
#[cfg(windows)]
mod patcher;
mod resolve;
mod socket;
mod state;
mod tramp;
#[cfg(windows)]
mod watchdog;

pub use error::HookError;
pub use hook::Hook;
pub use resolve::{ResolvedAddrs, parse_hex_addr, resolve};
pub use socket::{INVALID_SOCKET, RawSocket};
#[cfg(not(windows))]
pub use socket::set_last_socket_error;
pub use state::{HookEvents, TrampState};
pub use tramp::{RecvSlotFn, SendSlotFn, hooked_recv, hooked_send, recv_through, send_through};
