mod network;
mod service;

pub use network::Connection;
pub use network::PacketFrame;
pub use network::FRAME_HEADER_SIZE;
pub use service::{
    setup_file_tracing, setup_local_tracing, Client, ClientHandle, ClientListener, NetworkConfig,
    Server, ServerHandle, ServerListener, Shutdown, TimerHandle, TransportConfig, TransportError,
    TransportResult,
};
