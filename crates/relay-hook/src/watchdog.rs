//! Background thread that re-asserts slot ownership against third-party
//! rewrites.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::warn;

use crate::{
    mem::{is_readable, read_slot},
    patcher::force,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct SlotWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SlotWatchdog {
    pub fn start(&mut self, send_slot: usize, send_hook: usize, recv_slot: usize, recv_hook: usize) {
        if self.handle.is_some() {
            return;
        }

        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);

        self.handle = Some(thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                reassert(send_slot, send_hook, "send");
                reassert(recv_slot, recv_hook, "recv");
                thread::sleep(POLL_INTERVAL);
            }
        }));
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlotWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reassert(slot: usize, hook: usize, which: &str) {
    if !is_readable(slot) {
        return;
    }
    let current = unsafe { read_slot(slot) };
    if current != hook {
        force(slot, hook);
        warn!(slot = which, "watchdog re-fixed slot");
    }
}
