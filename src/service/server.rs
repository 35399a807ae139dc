use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, timeout};
use tracing::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::network::{
    next_connection_id, Connection, ConnectionReader, ConnectionWriter, PacketFrame,
};
use crate::{TransportConfig, TransportError, TransportResult};

use super::listener::ServerListener;
use super::timer::{spawn_timer, TimerHandle};
use super::Shutdown;

/// Events flowing from the I/O tasks into a run loop.
///
/// Registry mutation and listener notification both happen on the run loop,
/// so everything the listener observes is serialized through this channel.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Connected(Arc<Connection>),
    Packet(Arc<Connection>, Bytes),
    Disconnected(Arc<Connection>),
    Timer,
    /// The listening or connecting endpoint itself failed. Fatal for a
    /// server; reported as a failed connection attempt for a client.
    EndpointFailed(TransportError),
}

/// Accepts connections and manages their lifecycle on behalf of the
/// application listener.
///
/// The server owns the live-connection registry. Each accepted socket is
/// registered, announced through `on_new_connection`, and read from until
/// it dies; whichever of peer EOF, I/O error, protocol violation, or local
/// close happens first, the listener sees exactly one `on_disconnected`
/// and the registry entry is gone by the time it fires.
pub struct Server<L> {
    listener: L,
    config: Arc<TransportConfig>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
    shutdown_token: CancellationToken,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    local_addr: Option<SocketAddr>,
}

impl<L: ServerListener> Server<L> {
    pub fn new(config: TransportConfig, listener: L) -> Server<L> {
        let config = Arc::new(config);
        let (event_tx, event_rx) = mpsc::channel(config.network.event_channel_capacity);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Server {
            listener,
            config,
            connections: Arc::new(DashMap::new()),
            event_tx,
            event_rx,
            shutdown_token: CancellationToken::new(),
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            local_addr: None,
        }
    }

    /// Cloneable control surface for use from listener callbacks or other
    /// tasks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            config: self.config.clone(),
            connections: self.connections.clone(),
            event_tx: self.event_tx.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Binds the listening socket and arms the acceptor.
    ///
    /// A bind failure is fatal to startup and propagates to the caller.
    pub async fn start(&mut self, port: u16) -> TransportResult<()> {
        let listen_address = format!("{}:{}", self.config.network.bind_ip, port);
        let tcp_listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            TransportError::Bind(format!(
                "failed to bind server to address {}: {}",
                listen_address, err
            ))
        })?;
        let local_addr = tcp_listener.local_addr()?;
        info!("listening on {}", local_addr);
        self.local_addr = Some(local_addr);

        let acceptor = Acceptor {
            listener: tcp_listener,
            limit_connections: Arc::new(Semaphore::new(self.config.network.max_connections)),
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            notify_shutdown: self.notify_shutdown.clone(),
            shutdown_complete_tx: self.shutdown_complete_tx.clone(),
        };
        tokio::spawn(acceptor.run());
        Ok(())
    }

    /// Drives the event loop until `shutdown` is requested or the acceptor
    /// fails fatally. All listener callbacks run here.
    pub async fn run(&mut self) -> TransportResult<()> {
        if self.local_addr.is_none() {
            return Err(TransportError::IllegalState(
                "run() called before start()".to_string(),
            ));
        }
        let outcome = loop {
            let event = tokio::select! {
                _ = self.shutdown_token.cancelled() => None,
                maybe_event = self.event_rx.recv() => maybe_event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            if let Some(fatal) = self.dispatch(event) {
                break Err(fatal);
            }
        };
        self.finish_shutdown().await;
        outcome
    }

    /// Bounded form of `run`: returns after the duration elapses even if
    /// work remains pending, leaving the server live for the next call.
    pub async fn run_for(&mut self, duration: Duration) -> TransportResult<()> {
        match timeout(duration, self.run()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Ok(()),
        }
    }

    pub fn send_packet(&self, connection: &Arc<Connection>, payload: &[u8]) {
        self.handle().send_packet(connection, payload);
    }

    pub fn close_connection(&self, connection: &Arc<Connection>) {
        self.handle().close_connection(connection);
    }

    pub fn set_timer(&self, duration: Duration) -> TimerHandle {
        spawn_timer(duration, self.event_tx.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    fn dispatch(&mut self, event: TransportEvent) -> Option<TransportError> {
        match event {
            TransportEvent::Connected(connection) => {
                let previous = self.connections.insert(connection.id(), connection.clone());
                debug_assert!(
                    previous.is_none(),
                    "{} registered twice in the live set",
                    connection
                );
                info!("{} connected", connection);
                self.listener.on_new_connection(&connection);
            }
            TransportEvent::Packet(connection, payload) => {
                // after a local close only the terminal disconnect may reach
                // the listener
                if connection.close_requested() {
                    return None;
                }
                self.listener.on_packet_received(&connection, payload);
            }
            TransportEvent::Disconnected(connection) => {
                let removed = self.connections.remove(&connection.id());
                assert!(
                    removed.is_some(),
                    "disconnect notification for untracked {}",
                    connection
                );
                info!("{} disconnected", connection);
                self.listener.on_disconnected(&connection);
            }
            TransportEvent::Timer => {
                self.listener.on_timer();
            }
            TransportEvent::EndpointFailed(err) => {
                error!("acceptor failed: {}", err);
                return Some(err);
            }
        }
        None
    }

    /// Winds the server down: wakes the acceptor and every connection
    /// handler, then keeps relaying events until the last I/O task is gone
    /// so each surviving connection still gets its disconnect callback.
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
                DrainStep::Event(Some(event)) => {
                    let _ = self.dispatch(event);
                }
                DrainStep::Event(None) => break,
                DrainStep::Complete => break,
            }
        }
        while let Ok(event) = self.event_rx.try_recv() {
            let _ = self.dispatch(event);
        }
        info!("server shutdown complete");
    }
}

/// Control surface shared with the application.
///
/// Clones cheaply; all operations are non-blocking and safe to call from
/// inside listener callbacks.
#[derive(Clone)]
pub struct ServerHandle {
    config: Arc<TransportConfig>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_token: CancellationToken,
}

impl ServerHandle {
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
                // a peer that stopped draining its queue is as good as dead
                warn!("outbound queue full, closing {}", connection);
                connection.close();
            }
            Err(TrySendError::Closed(_)) => {
                warn!("dropping outbound packet, {} is closed", connection);
            }
        }
    }

    /// Initiates shutdown of a tracked connection. The connection leaves
    /// the live set when its single `on_disconnected` notification is
    /// relayed.
    ///
    /// # Panics
    ///
    /// Panics if the connection is not in the live set; closing an
    /// untracked connection is a lifecycle bug in the caller, not a
    /// runtime condition.
    pub fn close_connection(&self, connection: &Arc<Connection>) {
        assert!(
            self.connections.contains_key(&connection.id()),
            "closing untracked {}",
            connection
        );
        debug!("closing {}", connection);
        connection.close();
    }

    /// Schedules a one-shot timer surfaced to the listener's `on_timer`.
    pub fn set_timer(&self, duration: Duration) -> TimerHandle {
        spawn_timer(duration, self.event_tx.clone())
    }

    /// Requests the run loop to stop. Connections are torn down and each
    /// gets its disconnect callback before `run` returns.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    config: Arc<TransportConfig>,
    event_tx: mpsc::Sender<TransportEvent>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    async fn run(mut self) {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => permit.unwrap(),
                _ = shutdown.recv() => break,
            };

            let socket = tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok(socket) => socket,
                    Err(err) => {
                        let _ = self
                            .event_tx
                            .send(TransportEvent::EndpointFailed(err))
                            .await;
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };

            // register first, then start the read loop: packet events can
            // never outrun the connected event in the channel
            let (connection, reader_half, writer_half, outbound_rx, cancel) =
                match prepare_connection(socket, &self.config) {
                    Ok(parts) => parts,
                    Err(err) => {
                        warn!("dropping accepted socket: {}", err);
                        continue;
                    }
                };
            debug!("accepted {}", connection);
            if self
                .event_tx
                .send(TransportEvent::Connected(connection.clone()))
                .await
                .is_err()
            {
                break;
            }
            spawn_connection_io(
                connection,
                reader_half,
                writer_half,
                outbound_rx,
                cancel,
                &self.config,
                self.event_tx.clone(),
                self.notify_shutdown.subscribe(),
                self.shutdown_complete_tx.clone(),
                Some(permit),
            );
        }
        debug!("acceptor exited");
    }

    async fn accept(&mut self) -> TransportResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(TransportError::Accept(format!(
                            "accepting connections failed: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

pub(crate) fn prepare_connection(
    socket: TcpStream,
    config: &TransportConfig,
) -> std::io::Result<(
    Arc<Connection>,
    OwnedReadHalf,
    OwnedWriteHalf,
    mpsc::Receiver<Bytes>,
    CancellationToken,
)> {
    let peer_addr = socket.peer_addr()?;
    let (reader_half, writer_half) = socket.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.network.outbound_queue_capacity);
    let cancel = CancellationToken::new();
    let connection = Arc::new(Connection::new(
        next_connection_id(),
        peer_addr,
        outbound_tx,
        cancel.clone(),
    ));
    Ok((connection, reader_half, writer_half, outbound_rx, cancel))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_connection_io(
    connection: Arc<Connection>,
    reader_half: OwnedReadHalf,
    writer_half: OwnedWriteHalf,
    outbound_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    config: &TransportConfig,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_notify: broadcast::Receiver<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let writer = ConnectionWriter::new(writer_half, outbound_rx, cancel);
    let writer_connection = connection.clone();
    tokio::spawn(async move {
        if let Err(err) = writer.run().await {
            warn!("{} write error: {}", writer_connection, err);
            writer_connection.cancel_io();
        }
    });

    let handler = ConnectionHandler {
        reader: ConnectionReader::new(
            reader_half,
            config.network.read_buffer_size,
            config.network.max_frame_size,
        ),
        connection,
        event_tx,
        shutdown: Shutdown::new(shutdown_notify),
        _shutdown_complete: shutdown_complete_tx,
        _permit: permit,
    };
    tokio::spawn(handler.run());
}

/// Runs one connection's read loop and owns its teardown.
///
/// This task is the only place the disconnect notification originates, so
/// racing close paths (peer EOF, I/O error, malformed frame, local close,
/// server shutdown) all collapse into exactly one notification.
struct ConnectionHandler {
    connection: Arc<Connection>,
    reader: ConnectionReader,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionHandler {
    async fn run(mut self) {
        if let Err(err) = self.read_loop().await {
            // frame oversize or I/O failure, end the connection
            warn!("{} error: {}", self.connection, err);
        }
        self.connection.cancel_io();
        self.connection.mark_closed();
        let _ = self
            .event_tx
            .send(TransportEvent::Disconnected(self.connection.clone()))
            .await;
    }

    async fn read_loop(&mut self) -> TransportResult<()> {
        loop {
            let maybe_frame = tokio::select! {
                read = self.reader.read_frame() => read?,
                _ = self.connection.cancelled() => return Ok(()),
                _ = self.shutdown.recv() => return Ok(()),
            };
            let payload = match maybe_frame {
                Some(payload) => payload,
                // peer closed the connection gracefully
                None => return Ok(()),
            };
            if self
                .event_tx
                .send(TransportEvent::Packet(self.connection.clone(), payload))
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }
}
