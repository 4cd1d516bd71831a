//! Process-wide trampoline state and its publication point.
//!
//! The raw `extern "system"` entries have no context argument, so exactly one
//! [`TrampState`] is published through an acquire/release pointer at install
//! time, mirroring how the originals themselves live in host-owned slots.

use std::sync::{
    Arc, Mutex, RwLock, Weak,
    atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use relay_protocol::ProtocolState;

use crate::socket::{INVALID_SOCKET, RawSocket};

/// Callbacks out of the trampolines toward the hook owner.
///
/// The backreference is non-owning (`Weak`) so the owner's lifetime strictly
/// contains it; uninstall clears the slot.
pub trait HookEvents: Send + Sync {
    fn emit_send(&self, bytes: &[u8]);
    fn emit_recv(&self, bytes: &[u8]);
    fn notify_socket(&self, socket: RawSocket);
}

pub struct TrampState {
    /// Captured original function pointers, zero until patched.
    pub original_send: AtomicUsize,
    pub original_recv: AtomicUsize,
    /// Leaf routine addresses.
    pub seed_fn: AtomicUsize,
    pub checksum_fn: AtomicUsize,

    pub proto: ProtocolState,
    pub last_socket: AtomicUsize,
    pub suppress_next_emit: AtomicBool,
    /// Serializes the whole SEND transform (rules, leaf calls, pass-through).
    pub send_lock: Mutex<()>,

    pub observers: RwLock<Option<Weak<dyn HookEvents>>>,
}

impl Default for TrampState {
    fn default() -> Self {
        Self {
            original_send: AtomicUsize::new(0),
            original_recv: AtomicUsize::new(0),
            seed_fn: AtomicUsize::new(0),
            checksum_fn: AtomicUsize::new(0),
            proto: ProtocolState::new(),
            last_socket: AtomicUsize::new(INVALID_SOCKET),
            suppress_next_emit: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            observers: RwLock::new(None),
        }
    }
}

impl TrampState {
    /// New session: clear protocol state and remember the socket.
    pub fn begin_session(&self, socket: RawSocket) {
        self.last_socket.store(socket, Ordering::Relaxed);
        self.proto.reset_all();
    }

    /// Connection gone: clear protocol state and forget the socket.
    pub fn invalidate_session(&self) {
        self.proto.reset_all();
        self.last_socket.store(INVALID_SOCKET, Ordering::Relaxed);
    }

    pub fn with_observers(&self, f: impl FnOnce(&dyn HookEvents)) {
        let slot = self.observers.read().unwrap();
        if let Some(owner) = slot.as_ref().and_then(Weak::upgrade) {
            f(&*owner);
        }
    }
}

static TRAMP_STATE: AtomicPtr<TrampState> = AtomicPtr::new(std::ptr::null_mut());

/// Publish `state` for the raw entry points. The raw clone taken here is
/// intentionally never reclaimed: a host thread may still be executing inside
/// a trampoline when the hook uninstalls, so the state must outlive any
/// publication window.
pub fn publish(state: &Arc<TrampState>) {
    let raw = Arc::into_raw(Arc::clone(state)) as *mut TrampState;
    let prev = TRAMP_STATE.swap(raw, Ordering::Release);
    debug_assert!(prev.is_null() || prev == raw, "double publish of trampoline state");
}

/// Stop routing the raw entries through the published state.
pub fn unpublish() {
    TRAMP_STATE.store(std::ptr::null_mut(), Ordering::Release);
}

/// Current published state, if installed.
pub fn current() -> Option<&'static TrampState> {
    let ptr = TRAMP_STATE.load(Ordering::Acquire);
    unsafe { ptr.as_ref() }
}
