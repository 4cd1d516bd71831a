//! Hook owner: resolves addresses, installs/uninstalls the slot patches,
//! owns the injection queue, and routes trampoline events to the registered
//! observers.

use std::sync::{
    Arc, RwLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, error};

use crate::{
    error::HookError,
    inject::InjectQueue,
    resolve::{ResolvedAddrs, resolve},
    socket::{INVALID_SOCKET, RawSocket},
    state::{self, HookEvents, TrampState},
};

#[cfg(windows)]
use std::sync::Mutex;

#[cfg(windows)]
use crate::watchdog::SlotWatchdog;

pub type ObserverFn = Box<dyn Fn(&[u8]) + Send + Sync>;

struct HookInner {
    addrs: ResolvedAddrs,
    state: Arc<TrampState>,
    queue: InjectQueue,
    on_send: RwLock<Option<ObserverFn>>,
    on_recv: RwLock<Option<ObserverFn>>,
}

impl HookEvents for HookInner {
    fn emit_send(&self, bytes: &[u8]) {
        if let Some(cb) = self.on_send.read().unwrap().as_ref() {
            cb(bytes);
        }
    }

    fn emit_recv(&self, bytes: &[u8]) {
        if let Some(cb) = self.on_recv.read().unwrap().as_ref() {
            cb(bytes);
        }
    }

    fn notify_socket(&self, _socket: RawSocket) {
        // A live socket may unblock queued injections.
        self.queue.drain(&self.state);
    }
}

pub struct Hook {
    inner: Arc<HookInner>,
    #[cfg(windows)]
    watchdog: Mutex<SlotWatchdog>,
    installed: AtomicBool,
}

impl Hook {
    pub fn new(addrs: ResolvedAddrs) -> Self {
        let inner = Arc::new(HookInner {
            addrs,
            state: Arc::new(TrampState::default()),
            queue: InjectQueue::default(),
            on_send: RwLock::new(None),
            on_recv: RwLock::new(None),
        });
        let hook = Self {
            inner,
            #[cfg(windows)]
            watchdog: Mutex::new(SlotWatchdog::default()),
            installed: AtomicBool::new(false),
        };
        hook.wire_backref();
        hook
    }

    /// Resolve the four configured addresses and build the hook around them.
    pub fn from_config(send: &str, recv: &str, seed: &str, checksum: &str) -> Self {
        Self::new(resolve(send, recv, seed, checksum))
    }

    fn wire_backref(&self) {
        let weak: Weak<HookInner> = Arc::downgrade(&self.inner);
        let weak: Weak<dyn HookEvents> = weak;
        *self.inner.state.observers.write().unwrap() = Some(weak);
    }

    pub fn set_on_send(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.on_send.write().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_recv(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.on_recv.write().unwrap() = Some(Box::new(f));
    }

    /// Patch both slots, start the watchdog, publish the trampoline state.
    ///
    /// Fails without side effects: a RECV patch timeout rolls the SEND slot
    /// back to its captured original.
    #[cfg(windows)]
    pub fn install(&self) -> Result<(), HookError> {
        use tracing::info;

        use crate::{
            patcher::{WAIT_STEP, WAIT_TOTAL, force, wait_and_patch},
            tramp::{hooked_recv, hooked_send},
        };

        if self.installed.load(Ordering::Acquire) {
            return Ok(());
        }

        let a = self.inner.addrs;
        if !a.complete() {
            error!("hook install: missing addresses (send/recv/seed/checksum)");
            return Err(HookError::IncompleteAddresses);
        }

        let st = &self.inner.state;
        st.seed_fn.store(a.seed_fn, Ordering::Relaxed);
        st.checksum_fn.store(a.checksum_fn, Ordering::Relaxed);
        self.wire_backref();
        state::publish(st);

        let send_hook = hooked_send as usize;
        let recv_hook = hooked_recv as usize;

        let orig_send = match wait_and_patch(a.send_slot, send_hook, WAIT_TOTAL, WAIT_STEP) {
            Ok(orig) => orig,
            Err(e) => {
                error!("hook install: failed to patch SEND slot");
                state::unpublish();
                return Err(e);
            }
        };
        st.original_send.store(orig_send, Ordering::Release);

        match wait_and_patch(a.recv_slot, recv_hook, WAIT_TOTAL, WAIT_STEP) {
            Ok(orig) => st.original_recv.store(orig, Ordering::Release),
            Err(e) => {
                error!("hook install: failed to patch RECV slot, rolling back SEND");
                force(a.send_slot, orig_send);
                st.original_send.store(0, Ordering::Release);
                state::unpublish();
                return Err(e);
            }
        }

        info!("SEND/RECV slots patched");
        self.watchdog.lock().unwrap().start(a.send_slot, send_hook, a.recv_slot, recv_hook);
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    #[cfg(not(windows))]
    pub fn install(&self) -> Result<(), HookError> {
        error!("hook install: slot patching requires a windows host");
        Err(HookError::Unsupported)
    }

    /// Stop the watchdog, restore the captured originals (best effort),
    /// clear the trampoline backreference. Idempotent.
    pub fn uninstall(&self) {
        #[cfg(windows)]
        {
            use crate::patcher::force;

            self.watchdog.lock().unwrap().stop();

            let a = self.inner.addrs;
            let st = &self.inner.state;
            let orig_send = st.original_send.load(Ordering::Acquire);
            if a.send_slot != 0 && orig_send != 0 {
                force(a.send_slot, orig_send);
            }
            let orig_recv = st.original_recv.load(Ordering::Acquire);
            if a.recv_slot != 0 && orig_recv != 0 {
                force(a.recv_slot, orig_recv);
            }
        }

        *self.inner.state.observers.write().unwrap() = None;
        state::unpublish();
        self.installed.store(false, Ordering::Release);
    }

    /// Queue bytes for the client's socket. Returns whether a target socket
    /// is currently known; the message stays queued either way.
    pub fn try_inject_send(&self, bytes: &[u8], append_checksum: bool) -> bool {
        let known = self.inner.state.last_socket.load(Ordering::Acquire) != INVALID_SOCKET;
        self.inner.queue.enqueue(bytes, append_checksum);
        self.inner.queue.drain(&self.inner.state);
        known
    }

    /// Receive-path injection has no native mechanism yet; accepted and
    /// dropped so the controller sees success.
    pub fn try_inject_recv(&self, bytes: &[u8]) -> bool {
        debug!(len = bytes.len(), "inject recv: no native receive injection, dropping");
        true
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.uninstall();
    }
}
