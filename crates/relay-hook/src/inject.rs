//! Controller-originated byte injection into the client's send path.
//!
//! Messages queue FIFO and are pushed through the SEND trampoline itself, so
//! they interleave with client traffic at send granularity and pick up the
//! same transform. The suppression latch keeps a synthetic send from
//! re-emitting as a client-originated observation.

use std::{
    collections::VecDeque,
    sync::{Mutex, atomic::Ordering},
    time::{Duration, Instant},
};

use relay_protocol::hex_preview;
use tracing::{debug, warn};

use crate::{
    socket::{INVALID_SOCKET, SOCKET_ERROR},
    state::TrampState,
    tramp::send_through,
};

const DRAIN_BATCH_MAX: usize = 64;
const MAX_ATTEMPTS: u8 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Placeholder for the trailing byte; the SEND transform recomputes it when
/// the marker is in flight, otherwise it goes out literally.
pub const PLACEHOLDER_CHECKSUM_BYTE: u8 = 0x69;

struct InjectMsg {
    data: Vec<u8>,
    append_checksum: bool,
    attempts: u8,
    /// `None` means ready immediately.
    earliest_next_try: Option<Instant>,
}

impl InjectMsg {
    fn due(&self, now: Instant) -> bool {
        self.earliest_next_try.is_none_or(|t| t <= now)
    }
}

#[derive(Default)]
pub struct InjectQueue {
    q: Mutex<VecDeque<InjectMsg>>,
    /// Collapses reentrant drains (`drain -> send -> notify -> drain`).
    drain_lock: Mutex<()>,
}

impl InjectQueue {
    pub fn enqueue(&self, bytes: &[u8], append_checksum: bool) {
        let msg = InjectMsg {
            data: bytes.to_vec(),
            append_checksum,
            attempts: 0,
            earliest_next_try: None,
        };
        self.q.lock().unwrap().push_back(msg);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.q.lock().unwrap().len()
    }

    /// Push due messages through the SEND trampoline, at most
    /// [`DRAIN_BATCH_MAX`] per wakeup.
    pub fn drain(&self, state: &TrampState) {
        let Ok(_draining) = self.drain_lock.try_lock() else { return };

        let socket = state.last_socket.load(Ordering::Acquire);
        if socket == INVALID_SOCKET {
            return;
        }

        let mut batch = Vec::new();
        {
            let mut q = self.q.lock().unwrap();
            let now = Instant::now();
            while batch.len() < DRAIN_BATCH_MAX {
                // Stop at the first message that is not due, keeping FIFO order.
                if !q.front().is_some_and(|m| m.due(now)) {
                    break;
                }
                if let Some(m) = q.pop_front() {
                    batch.push(m);
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        let mut iter = batch.into_iter();
        while let Some(msg) = iter.next() {
            if state.original_send.load(Ordering::Acquire) == 0 {
                warn!("inject: originals not captured yet, holding message");
                let mut q = self.q.lock().unwrap();
                for rest in iter.rev() {
                    q.push_front(rest);
                }
                q.push_front(msg);
                return;
            }

            let mut wire = Vec::with_capacity(msg.data.len() + usize::from(msg.append_checksum));
            wire.extend_from_slice(&msg.data);
            if msg.append_checksum {
                wire.push(PLACEHOLDER_CHECKSUM_BYTE);
            }

            debug!(
                socket,
                len = wire.len(),
                append_checksum = msg.append_checksum,
                data = %hex_preview(&wire, 16),
                "inject send"
            );

            let guard = SuppressGuard::set(state);
            let r = send_through(state, socket, &wire, 0);
            drop(guard);

            if r == SOCKET_ERROR {
                // A broken connection already invalidated the socket inside
                // the trampoline; the message itself gets another try.
                self.requeue_with_backoff(msg, "socket error");
            } else if (r as usize) < wire.len() {
                self.requeue_with_backoff(msg, "partial write");
            } else {
                debug!(wrote = r, "inject: sent");
            }
        }
    }

    fn requeue_with_backoff(&self, mut msg: InjectMsg, reason: &str) {
        msg.attempts += 1;
        if msg.attempts > MAX_ATTEMPTS {
            warn!(attempts = msg.attempts, reason, "inject: dropping message after max retries");
            return;
        }

        let delay = BACKOFF_BASE * u32::from(msg.attempts);
        msg.earliest_next_try = Some(Instant::now() + delay);
        warn!(attempts = msg.attempts, delay_ms = delay.as_millis() as u64, reason, "inject: requeued");
        self.q.lock().unwrap().push_back(msg);
    }
}

/// Arms the suppression latch and guarantees it is cleared on every path out
/// of the injection attempt.
struct SuppressGuard<'a>(&'a TrampState);

impl<'a> SuppressGuard<'a> {
    fn set(state: &'a TrampState) -> Self {
        state.suppress_next_emit.store(true, Ordering::Release);
        Self(state)
    }
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.0.suppress_next_emit.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use std::{
        slice,
        sync::atomic::{AtomicI32, AtomicUsize},
        thread,
    };

    use super::*;
    use crate::socket::RawSocket;

    static HOST: Mutex<()> = Mutex::new(());
    static SENT: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
    static SEND_RET: AtomicI32 = AtomicI32::new(i32::MIN);
    static SEND_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn host_send(_s: RawSocket, buf: *const u8, len: i32, _f: i32) -> i32 {
        let data = unsafe { slice::from_raw_parts(buf, len as usize) };
        SENT.lock().unwrap().push(data.to_vec());
        SEND_CALLS.fetch_add(1, Ordering::Relaxed);
        let ret = SEND_RET.load(Ordering::Relaxed);
        if ret == i32::MIN { len } else { ret }
    }

    fn ready_state(socket: RawSocket) -> TrampState {
        SENT.lock().unwrap().clear();
        SEND_RET.store(i32::MIN, Ordering::Relaxed);
        SEND_CALLS.store(0, Ordering::Relaxed);

        let state = TrampState::default();
        state.original_send.store(host_send as usize, Ordering::Release);
        state.last_socket.store(socket, Ordering::Relaxed);
        state
    }

    #[test]
    fn drains_in_fifo_order_with_placeholder() {
        let _host = HOST.lock().unwrap();
        let state = ready_state(9);
        let q = InjectQueue::default();

        q.enqueue(&[0x01, 0x02], true);
        q.enqueue(&[0x03], false);
        q.drain(&state);

        let sent = SENT.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![0x01, 0x02, PLACEHOLDER_CHECKSUM_BYTE]);
        assert_eq!(sent[1], vec![0x03]);
        assert_eq!(q.len(), 0);
        // Latch was consumed by the synthetic sends, not left armed.
        assert!(!state.suppress_next_emit.load(Ordering::Acquire));
    }

    #[test]
    fn no_socket_means_no_drain() {
        let _host = HOST.lock().unwrap();
        let state = ready_state(INVALID_SOCKET);
        let q = InjectQueue::default();

        q.enqueue(&[0x01], true);
        q.drain(&state);

        assert_eq!(SENT.lock().unwrap().len(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn originals_missing_holds_message_at_front() {
        let _host = HOST.lock().unwrap();
        let state = ready_state(9);
        state.original_send.store(0, Ordering::Release);
        let q = InjectQueue::default();

        q.enqueue(&[0x01], true);
        q.enqueue(&[0x02], true);
        q.drain(&state);

        // Both messages survive, in order, ready for the next drain.
        assert_eq!(q.len(), 2);
        state.original_send.store(host_send as usize, Ordering::Release);
        q.drain(&state);
        let sent = SENT.lock().unwrap();
        assert_eq!(sent[0][0], 0x01);
        assert_eq!(sent[1][0], 0x02);
    }

    #[test]
    fn partial_write_requeues_with_backoff() {
        let _host = HOST.lock().unwrap();
        let state = ready_state(9);
        let q = InjectQueue::default();

        SEND_RET.store(2, Ordering::Relaxed);
        q.enqueue(&[0x01, 0x02, 0x03], true);
        q.drain(&state);

        // One attempt happened, message requeued and not yet due.
        assert_eq!(SEND_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(q.len(), 1);
        q.drain(&state);
        assert_eq!(SEND_CALLS.load(Ordering::Relaxed), 1);

        // After the 200 ms backoff the original logical message retries whole.
        SEND_RET.store(i32::MIN, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(250));
        q.drain(&state);
        assert_eq!(SEND_CALLS.load(Ordering::Relaxed), 2);
        let sent = SENT.lock().unwrap();
        assert_eq!(sent[1], vec![0x01, 0x02, 0x03, PLACEHOLDER_CHECKSUM_BYTE]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn retry_exhaustion_drops() {
        let _host = HOST.lock().unwrap();
        let q = InjectQueue::default();

        let msg = InjectMsg {
            data: vec![0x01],
            append_checksum: true,
            attempts: MAX_ATTEMPTS,
            earliest_next_try: None,
        };
        q.requeue_with_backoff(msg, "test");
        assert_eq!(q.len(), 0);

        let msg = InjectMsg {
            data: vec![0x01],
            append_checksum: true,
            attempts: MAX_ATTEMPTS - 1,
            earliest_next_try: None,
        };
        q.requeue_with_backoff(msg, "test");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn broken_connection_requeues_and_socket_invalidated() {
        let _host = HOST.lock().unwrap();
        let state = ready_state(9);
        let q = InjectQueue::default();

        SEND_RET.store(SOCKET_ERROR, Ordering::Relaxed);
        #[cfg(not(windows))]
        crate::socket::set_last_socket_error(crate::socket::WSAECONNRESET);

        q.enqueue(&[0x0A, 0x0B], true);
        q.drain(&state);

        #[cfg(not(windows))]
        {
            crate::socket::set_last_socket_error(0);
            assert_eq!(state.last_socket.load(Ordering::Relaxed), INVALID_SOCKET);
        }
        // The message survives for a later session.
        assert_eq!(q.len(), 1);
    }
}
