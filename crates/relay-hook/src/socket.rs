//! Raw socket plumbing shared by the trampolines and the injection queue.
//!
//! The host hands the slots winsock `SOCKET` handles; we carry them as
//! pointer-sized integers and never interpret them beyond equality.

/// Socket handle exactly as the host passes it to its networking slots.
pub type RawSocket = usize;

/// Winsock `INVALID_SOCKET`.
pub const INVALID_SOCKET: RawSocket = usize::MAX;

/// Winsock `SOCKET_ERROR` return value.
pub const SOCKET_ERROR: i32 = -1;

pub const WSAECONNABORTED: i32 = 10053;
pub const WSAECONNRESET: i32 = 10054;
pub const WSAENOTCONN: i32 = 10057;
pub const WSAESHUTDOWN: i32 = 10058;

/// Error codes after which the connection is gone and protocol state must be
/// reset.
#[inline]
pub fn is_broken_connection(code: i32) -> bool {
    matches!(code, WSAECONNRESET | WSAENOTCONN | WSAECONNABORTED | WSAESHUTDOWN)
}

#[cfg(windows)]
pub fn last_socket_error() -> i32 {
    unsafe { winapi::um::winsock2::WSAGetLastError() }
}

#[cfg(not(windows))]
use std::cell::Cell;

// Non-windows builds have no WSA error domain. The in-process doubles that
// stand in for the host's SEND/RECV record their error code here.
#[cfg(not(windows))]
thread_local! {
    static LAST_SOCKET_ERROR: Cell<i32> = const { Cell::new(0) };
}

#[cfg(not(windows))]
pub fn last_socket_error() -> i32 {
    LAST_SOCKET_ERROR.with(Cell::get)
}

#[cfg(not(windows))]
pub fn set_last_socket_error(code: i32) {
    LAST_SOCKET_ERROR.with(|c| c.set(code));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn broken_codes() {
        for code in [WSAECONNRESET, WSAECONNABORTED, WSAESHUTDOWN, WSAENOTCONN] {
            assert!(is_broken_connection(code));
        }
        assert!(!is_broken_connection(10060)); // WSAETIMEDOUT is not terminal here
        assert!(!is_broken_connection(0));
    }
}
