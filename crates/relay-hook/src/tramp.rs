//! SEND/RECV trampoline cores and the raw slot entry points.
//!
//! The cores take everything they need from [`TrampState`], so tests drive
//! them with in-process function-pointer doubles; the raw `extern "system"`
//! entries are the values actually written into the host's slots.

use std::{mem, slice, sync::atomic::Ordering};

use relay_protocol::{
    ChecksumService, RecvDisposition, hex_preview, on_send_head, process_recv, transform_send,
};
use tracing::{debug, trace, warn};

use crate::{
    socket::{RawSocket, SOCKET_ERROR, is_broken_connection, last_socket_error},
    state::{self, TrampState},
};

/// Signature of the host's SEND slot.
pub type SendSlotFn = unsafe extern "system" fn(RawSocket, *const u8, i32, i32) -> i32;
/// Signature of the host's RECV slot.
pub type RecvSlotFn = unsafe extern "system" fn(RawSocket, *mut u8, i32, i32) -> i32;

/// Bound on consecutive dropped RECV buffers.
const DROP_GUARD_MAX: u32 = 8;

/// Full SEND path: session tracking, head rules, seed/checksum transform,
/// exactly one pass-through, observability. Serialized against concurrent
/// senders by `send_lock`.
pub fn send_through(state: &TrampState, socket: RawSocket, buf: &[u8], flags: i32) -> i32 {
    let original = state.original_send.load(Ordering::Acquire);
    if original == 0 {
        return SOCKET_ERROR;
    }
    let original: SendSlotFn = unsafe { mem::transmute(original) };

    if state.last_socket.load(Ordering::Relaxed) != socket {
        state.begin_session(socket);
        debug!("send: new socket, protocol state reset");
    }
    state.with_observers(|o| o.notify_socket(socket));

    if buf.is_empty() {
        return unsafe { original(socket, buf.as_ptr(), 0, flags) };
    }

    let _transform = state.send_lock.lock().unwrap();

    let mut data = buf.to_vec();

    let seed_fn = state.seed_fn.load(Ordering::Relaxed);
    let checksum_fn = state.checksum_fn.load(Ordering::Relaxed);
    if seed_fn != 0 && checksum_fn != 0 {
        let svc = ChecksumService::new(unsafe { mem::transmute(seed_fn) }, unsafe {
            mem::transmute(checksum_fn)
        });
        transform_send(&svc, &mut data, &state.proto);
    } else {
        // No leaf routines wired (possible mid-install); rules still apply.
        on_send_head(&data, &state.proto);
    }

    trace!(out = %hex_preview(&data, 32), "send");

    if state.suppress_next_emit.swap(false, Ordering::AcqRel) {
        // Controller-originated write: consume the latch, skip the observer.
    } else {
        state.with_observers(|o| o.emit_send(&data));
    }

    let result = unsafe { original(socket, data.as_ptr(), data.len() as i32, flags) };
    if result == SOCKET_ERROR {
        let code = last_socket_error();
        warn!(code, "send: socket error");
        if is_broken_connection(code) {
            state.invalidate_session();
            debug!("send: connection broken, protocol state reset");
        }
    }
    result
}

/// Full RECV path: session tracking, pass-through, reset rules, bounded
/// drop-and-reread, observability.
pub fn recv_through(state: &TrampState, socket: RawSocket, buf: &mut [u8], flags: i32) -> i32 {
    let original = state.original_recv.load(Ordering::Acquire);
    if original == 0 {
        return SOCKET_ERROR;
    }
    let original: RecvSlotFn = unsafe { mem::transmute(original) };

    if state.last_socket.load(Ordering::Relaxed) != socket {
        state.begin_session(socket);
        debug!("recv: new socket, protocol state reset");
    }
    state.with_observers(|o| o.notify_socket(socket));

    let do_recv = |out: &mut [u8]| -> i32 {
        let r = unsafe { original(socket, out.as_mut_ptr(), out.len() as i32, flags) };
        if r == SOCKET_ERROR {
            let code = last_socket_error();
            warn!(code, "recv: socket error");
            if is_broken_connection(code) {
                state.invalidate_session();
                debug!("recv: connection broken, protocol state reset");
            }
        } else if r == 0 {
            state.invalidate_session();
            debug!("recv: connection closed, protocol state reset");
        }
        r
    };

    let mut ret = do_recv(buf);
    if ret <= 0 {
        return ret;
    }

    let mut disposition = process_recv(&buf[..ret as usize], &state.proto);

    let mut drops = 0;
    while disposition == RecvDisposition::DropAndReread {
        debug!("recv: C7 0B head, dropping buffer and reading next");
        state.proto.counter.store(0, Ordering::Relaxed);
        state.proto.found_marker.store(false, Ordering::Relaxed);

        drops += 1;
        if drops > DROP_GUARD_MAX {
            break;
        }

        ret = do_recv(buf);
        if ret <= 0 {
            return ret;
        }
        disposition = process_recv(&buf[..ret as usize], &state.proto);
    }

    trace!(data = %hex_preview(&buf[..ret as usize], 32), "recv");
    state.with_observers(|o| o.emit_recv(&buf[..ret as usize]));
    ret
}

/// Raw SEND entry written into the host's slot.
pub unsafe extern "system" fn hooked_send(
    socket: RawSocket,
    buf: *const u8,
    len: i32,
    flags: i32,
) -> i32 {
    let Some(state) = state::current() else { return SOCKET_ERROR };

    if buf.is_null() || len <= 0 {
        let original = state.original_send.load(Ordering::Acquire);
        if original == 0 {
            return SOCKET_ERROR;
        }
        let original: SendSlotFn = unsafe { mem::transmute(original) };
        return unsafe { original(socket, buf, len, flags) };
    }

    let data = unsafe { slice::from_raw_parts(buf, len as usize) };
    send_through(state, socket, data, flags)
}

/// Raw RECV entry written into the host's slot.
pub unsafe extern "system" fn hooked_recv(
    socket: RawSocket,
    buf: *mut u8,
    len: i32,
    flags: i32,
) -> i32 {
    let Some(state) = state::current() else { return SOCKET_ERROR };

    if buf.is_null() || len <= 0 {
        let original = state.original_recv.load(Ordering::Acquire);
        if original == 0 {
            return SOCKET_ERROR;
        }
        let original: RecvSlotFn = unsafe { mem::transmute(original) };
        return unsafe { original(socket, buf, len, flags) };
    }

    let data = unsafe { slice::from_raw_parts_mut(buf, len as usize) };
    recv_through(state, socket, data, flags)
}
