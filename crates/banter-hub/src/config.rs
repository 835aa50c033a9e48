use std::time::Duration;

use banter_types::DEFAULT_ROOM;

/// Tunables of the hub. The server fills these from the environment.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Room every new connection joins automatically
    pub default_room: String,
    /// How long a typing indicator lives without a refresh
    pub typing_timeout: Duration,
    pub typing_sweep_interval: Duration,
    /// Ping period; two missed pongs drop the connection
    pub heartbeat_interval: Duration,
    pub max_message_len: usize,
    pub max_room_id_len: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_room: DEFAULT_ROOM.to_string(),
            typing_timeout: Duration::from_secs(5),
            typing_sweep_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            max_message_len: 1000,
            max_room_id_len: 100,
        }
    }
}
