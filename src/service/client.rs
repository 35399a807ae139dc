use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::{Connection, PacketFrame};
use crate::{TransportConfig, TransportError, TransportResult};

use super::listener::ClientListener;
use super::server::{prepare_connection, spawn_connection_io, TransportEvent};
use super::timer::{spawn_timer, TimerHandle};

/// Establishes one outbound connection to a game server and relays its
/// events to the application listener.
///
/// The outcome of `connect` arrives asynchronously through
/// `on_connection_established` or `on_connection_failed`; from
/// establishment on, the connection behaves exactly like a server-side
/// one: framed packets in arrival order, FIFO sends, and exactly one
/// `on_disconnected`.
pub struct Client<L> {
    listener: L,
    config: Arc<TransportConfig>,
    connection: Option<Arc<Connection>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
    shutdown_token: CancellationToken,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<L: ClientListener> Client<L> {
    pub fn new(config: TransportConfig, listener: L) -> Client<L> {
        let config = Arc::new(config);
        let (event_tx, event_rx) = mpsc::channel(config.network.event_channel_capacity);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Client {
            listener,
            config,
            connection: None,
            event_tx,
            event_rx,
            shutdown_token: CancellationToken::new(),
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    /// Currently established connection, if any.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Starts a connection attempt. The result is delivered through the
    /// listener once the run loop processes it.
    pub fn connect(&self, host: &str, port: u16) {
        let remote_address = format!("{}:{}", host, port);
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let notify_shutdown = self.notify_shutdown.clone();
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let socket = match TcpStream::connect(&remote_address).await {
                Ok(socket) => socket,
                Err(err) => {
                    let _ = event_tx
                        .send(TransportEvent::EndpointFailed(TransportError::Connect(
                            format!("failed to connect to {}: {}", remote_address, err),
                        )))
                        .await;
                    return;
                }
            };
            let (connection, reader_half, writer_half, outbound_rx, cancel) =
                match prepare_connection(socket, &config) {
                    Ok(parts) => parts,
                    Err(err) => {
                        let _ = event_tx
                            .send(TransportEvent::EndpointFailed(TransportError::Connect(
                                format!("failed to connect to {}: {}", remote_address, err),
                            )))
                            .await;
                        return;
                    }
                };
            debug!("established {}", connection);
            if event_tx
                .send(TransportEvent::Connected(connection.clone()))
                .await
                .is_err()
            {
                return;
            }
            spawn_connection_io(
                connection,
                reader_half,
                writer_half,
                outbound_rx,
                cancel,
                &config,
                event_tx,
                notify_shutdown.subscribe(),
                shutdown_complete_tx,
                None,
            );
        });
    }

    /// Drives the event loop until `shutdown` is requested. All listener
    /// callbacks run here.
    pub async fn run(&mut self) -> TransportResult<()> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown_token.cancelled() => None,
                maybe_event = self.event_rx.recv() => maybe_event,
            };
            let Some(event) = event else {
                break;
            };
            self.dispatch(event);
        }
        self.finish_shutdown().await;
        Ok(())
    }

    /// Bounded form of `run`: returns after the duration elapses even if
    /// work remains pending, leaving the client live for the next call.
    pub async fn run_for(&mut self, duration: Duration) -> TransportResult<()> {
        match timeout(duration, self.run()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Ok(()),
        }
    }

    pub fn send_packet(&self, connection: &Arc<Connection>, payload: &[u8]) {
        self.handle().send_packet(connection, payload);
    }

    pub fn close(&self, connection: &Arc<Connection>) {
        self.handle().close(connection);
    }

    pub fn set_timer(&self, duration: Duration) -> TimerHandle {
        spawn_timer(duration, self.event_tx.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(connection) => {
                info!("{} established", connection);
                self.connection = Some(connection.clone());
                self.listener.on_connection_established(&connection);
            }
            TransportEvent::Packet(connection, payload) => {
                if connection.close_requested() {
                    return;
                }
                self.listener.on_packet_received(&connection, payload);
            }
            TransportEvent::Disconnected(connection) => {
                if self
                    .connection
                    .as_ref()
                    .is_some_and(|current| current.id() == connection.id())
                {
                    self.connection = None;
                }
                info!("{} disconnected", connection);
                self.listener.on_disconnected(&connection);
            }
            TransportEvent::Timer => {
                self.listener.on_timer();
            }
            TransportEvent::EndpointFailed(err) => {
                warn!("connection attempt failed: {}", err);
                self.listener.on_connection_failed(err);
            }
        }
    }

    async fn finish_shutdown(&mut self) {
        let (replacement_notify, _) = broadcast::channel(1);
        drop(std::mem::replace(
            &mut self.notify_shutdown,
            replacement_notify,
        ));
        let (replacement_complete_tx, _replacement_complete_rx) = mpsc::channel(1);
        drop(std::mem::replace(
            &mut self.shutdown_complete_tx,
            replacement_complete_tx,
        ));

        enum DrainStep {
            Event(Option<TransportEvent>),
            Complete,
        }
        loop {
            let step = tokio::select! {
                maybe_event = self.event_rx.recv() => DrainStep::Event(maybe_event),
                _ = self.shutdown_complete_rx.recv() => DrainStep::Complete,
            };
            match step {
                DrainStep::Event(Some(event)) => self.dispatch(event),
                DrainStep::Event(None) => break,
                DrainStep::Complete => break,
            }
        }
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch(event);
        }
        info!("client shutdown complete");
    }
}

/// Cloneable control surface for use from listener callbacks or other
/// tasks.
#[derive(Clone)]
pub struct ClientHandle {
    config: Arc<TransportConfig>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_token: CancellationToken,
}

impl ClientHandle {
    /// Frames the payload and appends it to the connection's ordered
    /// outbound queue. Never blocks; a delivery failure is logged rather
    /// than propagated to the caller.
    pub fn send_packet(&self, connection: &Arc<Connection>, payload: &[u8]) {
        if !connection.is_open() {
            warn!("dropping outbound packet, {} is closed", connection);
            return;
        }
        let frame = match PacketFrame::encode(payload, self.config.network.max_frame_size) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping outbound packet for {}: {}", connection, err);
                return;
            }
        };
        match connection.enqueue_frame(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("outbound queue full, closing {}", connection);
                connection.close();
            }
            Err(TrySendError::Closed(_)) => {
                warn!("dropping outbound packet, {} is closed", connection);
            }
        }
    }

    /// Initiates shutdown of the connection; `on_disconnected` fires
    /// exactly once when the teardown completes.
    pub fn close(&self, connection: &Arc<Connection>) {
        debug!("closing {}", connection);
        connection.close();
    }

    /// Schedules a one-shot timer surfaced to the listener's `on_timer`.
    pub fn set_timer(&self, duration: Duration) -> TimerHandle {
        spawn_timer(duration, self.event_tx.clone())
    }

    /// Requests the run loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}
