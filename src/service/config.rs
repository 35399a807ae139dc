use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{TransportError, TransportResult};

/// Bounds for the network layer.
///
/// The wire protocol itself carries no size negotiation, so every limit a
/// hostile or buggy peer could push against is pinned here instead of being
/// left to grow without bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listening socket binds to; the port comes from `start`.
    pub bind_ip: String,
    /// Accepted connections above this count wait for a slot to free up.
    pub max_connections: usize,
    /// A frame declaring a larger payload is a protocol violation and
    /// closes the connection.
    pub max_frame_size: usize,
    /// Initial capacity of each connection's receive buffer.
    pub read_buffer_size: usize,
    /// Outbound frames queued per connection; overflow closes the
    /// connection as a stalled peer.
    pub outbound_queue_capacity: usize,
    /// Capacity of the event channel feeding the run loop. Readers wait for
    /// space, which backpressures the sockets.
    pub event_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            bind_ip: "0.0.0.0".to_string(),
            max_connections: 1024,
            max_frame_size: 64 * 1024 * 1024,
            read_buffer_size: 4 * 1024,
            outbound_queue_capacity: 256,
            event_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
}

impl TransportConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> TransportResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| {
                TransportError::IllegalState(format!(
                    "config file path: {}",
                    path.as_ref().to_string_lossy()
                ))
            })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;

        Ok(transport_config)
    }
}
