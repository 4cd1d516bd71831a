//! Wiring between the hook, the injection path and the Kore link.
//!
//! Outbound: RECV observations go to Kore as `R` frames; SEND observations
//! are logged but deliberately not forwarded. Inbound: `S` frames inject
//! into the client's send path, `R` frames into the (stubbed) receive path,
//! `K` frames tick the keep-alive counter.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use relay_hook::{Hook, HookError};
use relay_link::{FrameKind, KoreLink};
use relay_protocol::hex_preview;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::settings::Settings;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("hook install failed")]
    Hook(#[from] HookError),
    #[error("link io error")]
    Link(#[from] std::io::Error),
}

/// Where inbound controller bytes go. Factored out so frame routing is
/// testable without a patched host.
trait Injector: Send + Sync {
    fn inject_send(&self, bytes: &[u8]) -> bool;
    fn inject_recv(&self, bytes: &[u8]) -> bool;
}

impl Injector for Hook {
    fn inject_send(&self, bytes: &[u8]) -> bool {
        self.try_inject_send(bytes, true)
    }

    fn inject_recv(&self, bytes: &[u8]) -> bool {
        self.try_inject_recv(bytes)
    }
}

struct FrameRouter {
    injector: Arc<dyn Injector>,
    keepalives: AtomicU64,
}

impl FrameRouter {
    fn dispatch(&self, kind: u8, payload: &[u8]) {
        match FrameKind::from_byte(kind) {
            Some(FrameKind::Sent) => {
                debug!(len = payload.len(), data = %hex_preview(payload, 16), "kore -> client send");
                if !self.injector.inject_send(payload) {
                    debug!("client socket not ready, injection queued");
                }
            }
            Some(FrameKind::Received) => {
                debug!(len = payload.len(), "kore -> client recv");
                self.injector.inject_recv(payload);
            }
            Some(FrameKind::KeepAlive) => {
                self.keepalives.fetch_add(1, Ordering::Relaxed);
                trace!("kore keep-alive");
            }
            None => warn!(kind, "unknown frame kind from kore"),
        }
    }
}

pub struct BridgeService {
    settings: Settings,
    hook: Arc<Hook>,
    link: Arc<Mutex<KoreLink>>,
    running: bool,
}

impl BridgeService {
    pub fn new(settings: Settings) -> Self {
        let adv = &settings.advanced;
        let hook = Arc::new(Hook::from_config(
            &adv.fn_send_addr,
            &adv.fn_recv_addr,
            &adv.fn_seed_addr,
            &adv.fn_checksum_addr,
        ));

        let injector: Arc<Hook> = Arc::clone(&hook);
        let injector: Arc<dyn Injector> = injector;
        let router = Arc::new(FrameRouter { injector, keepalives: AtomicU64::new(0) });
        let link = KoreLink::new(settings.link_config(), move |kind, payload| {
            router.dispatch(kind, payload);
        });

        Self { settings, hook, link: Arc::new(Mutex::new(link)), running: false }
    }

    /// Register observers, install the hook, connect the link. Idempotent;
    /// a failed install leaves the bridge stopped.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        if self.running {
            return Ok(());
        }

        self.log_summary();

        // SEND observations are diagnostics only; outbound client traffic is
        // never forwarded to Kore.
        self.hook.set_on_send(|bytes| {
            trace!(len = bytes.len(), data = %hex_preview(bytes, 32), "client send observed");
        });

        let link = Arc::clone(&self.link);
        self.hook.set_on_recv(move |bytes| {
            if let Err(e) = link.lock().unwrap().send_frame(FrameKind::Received, bytes) {
                warn!(error = %e, "could not forward recv observation");
            }
        });

        self.hook.install()?;

        let host = self.settings.kore.host.clone();
        let first_port = self.settings.kore.ports.first().copied().unwrap_or(0);
        self.link.lock().unwrap().connect(&host, first_port)?;

        self.running = true;
        info!("bridge started");
        Ok(())
    }

    /// Uninstall the hook and close the link. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.hook.uninstall();
        self.link.lock().unwrap().close();
        self.running = false;
        info!("bridge stopped");
    }

    fn log_summary(&self) {
        let s = &self.settings;
        let ports = s.kore.ports.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        info!(host = %s.kore.host, ports = %ports, "kore endpoint");
        let adv = &s.advanced;
        for (name, value) in [
            ("fnSendAddr", &adv.fn_send_addr),
            ("fnRecvAddr", &adv.fn_recv_addr),
            ("fnSeedAddr", &adv.fn_seed_addr),
            ("fnChecksumAddr", &adv.fn_checksum_addr),
        ] {
            if !value.is_empty() {
                info!("{name} = {value}");
            }
        }
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        self.stop();
    }
}
