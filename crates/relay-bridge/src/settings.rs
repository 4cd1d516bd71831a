//! TOML settings: recognized keys, defaults, and load-or-create semantics.
//! A missing or unparseable file is rewritten with commented defaults.

use std::{fs, io, path::Path, time::Duration};

use relay_link::{LinkConfig, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings io error")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub advanced: Advanced,
    pub logging: Logging,
    pub kore: Kore,
    pub relay: Relay,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Advanced {
    pub fn_seed_addr: String,
    pub fn_checksum_addr: String,
    pub fn_send_addr: String,
    pub fn_recv_addr: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Logging {
    pub show_console: bool,
    pub save_log: bool,
    pub save_socket_log: bool,
    pub logs_dir: String,
    pub app_log_filename: String,
    pub socket_log_filename: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            show_console: false,
            save_log: true,
            save_socket_log: true,
            logs_dir: "logs".to_string(),
            app_log_filename: "relay_app.log".to_string(),
            socket_log_filename: "relay_socket.log".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Kore {
    pub host: String,
    pub ports: Vec<u16>,
    pub reconnect: Reconnect,
}

impl Default for Kore {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![5293, 5294, 5295],
            reconnect: Reconnect::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Reconnect {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub backoff: f64,
    pub jitter_p: f64,
}

impl Default for Reconnect {
    fn default() -> Self {
        Self { initial_ms: 500, max_ms: 30_000, backoff: 2.0, jitter_p: 0.2 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Relay {
    pub recv_buffer: usize,
    pub send_buffer: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self { recv_buffer: 65_536, send_buffer: 65_536 }
    }
}

impl Settings {
    /// Read settings from `path`, authoring a commented default file when it
    /// is missing or does not parse.
    pub fn load_or_create(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            let s = Self::default();
            s.write_default(path)?;
            return Ok(s);
        }

        let raw = fs::read_to_string(path)?;
        match toml::from_str(&raw) {
            Ok(s) => Ok(s),
            Err(e) => {
                warn!(?path, error = %e, "settings did not parse, rewriting defaults");
                let s = Self::default();
                s.write_default(path)?;
                Ok(s)
            }
        }
    }

    fn write_default(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let ports = self
            .kore
            .ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let body = format!(
            "# Auto-generated initial configuration.\n\
             # Edit as needed and restart.\n\
             \n\
             [advanced]\n\
             fnSeedAddr     = \"{seed}\"\n\
             fnChecksumAddr = \"{checksum}\"\n\
             fnSendAddr     = \"{send}\"\n\
             fnRecvAddr     = \"{recv}\"\n\
             \n\
             [logging]\n\
             showConsole    = {show_console}\n\
             saveLog        = {save_log}\n\
             saveSocketLog  = {save_socket_log}\n\
             logsDir        = \"{logs_dir}\"\n\
             appLogFilename = \"{app_log}\"\n\
             \n\
             [kore]\n\
             host  = \"{host}\"\n\
             ports = [{ports}]\n\
             \n\
             [kore.reconnect]\n\
             initial_ms = {initial_ms}\n\
             max_ms     = {max_ms}\n\
             backoff    = {backoff:.1}\n\
             jitter_p   = {jitter_p:.1}\n\
             \n\
             [relay]\n\
             recv_buffer = {recv_buffer}\n\
             send_buffer = {send_buffer}\n",
            seed = self.advanced.fn_seed_addr,
            checksum = self.advanced.fn_checksum_addr,
            send = self.advanced.fn_send_addr,
            recv = self.advanced.fn_recv_addr,
            show_console = self.logging.show_console,
            save_log = self.logging.save_log,
            save_socket_log = self.logging.save_socket_log,
            logs_dir = self.logging.logs_dir,
            app_log = self.logging.app_log_filename,
            host = self.kore.host,
            ports = ports,
            initial_ms = self.kore.reconnect.initial_ms,
            max_ms = self.kore.reconnect.max_ms,
            backoff = self.kore.reconnect.backoff,
            jitter_p = self.kore.reconnect.jitter_p,
            recv_buffer = self.relay.recv_buffer,
            send_buffer = self.relay.send_buffer,
        );

        fs::write(path, body)?;
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.kore.reconnect.initial_ms),
            max: Duration::from_millis(self.kore.reconnect.max_ms),
            backoff: self.kore.reconnect.backoff,
            jitter_p: self.kore.reconnect.jitter_p,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            host: self.kore.host.clone(),
            ports: self.kore.ports.clone(),
            reconnect: self.reconnect_policy(),
            socket_buf: Some(self.relay.send_buffer.max(self.relay.recv_buffer)),
        }
    }
}
