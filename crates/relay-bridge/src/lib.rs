//! Bridge service: wires the hook's observations into the Kore link and the
//! link's inbound frames into the injection path, plus the settings and
//! logging surface around them.

mod bridge;
mod logging;
mod settings;

pub use bridge::{BridgeError, BridgeService};
pub use logging::init_logging;
pub use settings::{Settings, SettingsError};
