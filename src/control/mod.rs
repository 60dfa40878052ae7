//! Control-plane loops: remote config polling and heartbeats.

pub mod config_poll;
pub mod heartbeat;

pub use config_poll::{apply_config, ConfigPoller, RemoteConfig};
pub use heartbeat::HeartbeatSender;
