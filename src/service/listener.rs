use std::sync::Arc;

use bytes::Bytes;

use crate::network::Connection;
use crate::TransportError;

/// Event callbacks the application implements to drive a server.
///
/// All callbacks are invoked from the server's run loop, one at a time, in
/// the order the underlying events occurred. Per connection, packets are
/// delivered in arrival order and the disconnect callback fires exactly
/// once, after which the connection is no longer in the server's live set.
///
/// The server borrows the listener for as long as it runs; passing
/// `&mut listener` to `Server::new` keeps ownership with the application.
pub trait ServerListener {
    fn on_new_connection(&mut self, connection: &Arc<Connection>);

    fn on_packet_received(&mut self, connection: &Arc<Connection>, payload: Bytes);

    fn on_disconnected(&mut self, connection: &Arc<Connection>);

    /// Process-wide tick requested through `set_timer`; carries no
    /// connection association.
    fn on_timer(&mut self) {}
}

impl<T: ServerListener + ?Sized> ServerListener for &mut T {
    fn on_new_connection(&mut self, connection: &Arc<Connection>) {
        (**self).on_new_connection(connection);
    }

    fn on_packet_received(&mut self, connection: &Arc<Connection>, payload: Bytes) {
        (**self).on_packet_received(connection, payload);
    }

    fn on_disconnected(&mut self, connection: &Arc<Connection>) {
        (**self).on_disconnected(connection);
    }

    fn on_timer(&mut self) {
        (**self).on_timer();
    }
}

/// Event callbacks the application implements to drive a client.
///
/// `connect` reports its outcome through `on_connection_established` or
/// `on_connection_failed`; after establishment the connection behaves
/// exactly like a server-side one.
pub trait ClientListener {
    fn on_connection_established(&mut self, connection: &Arc<Connection>);

    fn on_connection_failed(&mut self, error: TransportError);

    fn on_packet_received(&mut self, connection: &Arc<Connection>, payload: Bytes);

    fn on_disconnected(&mut self, connection: &Arc<Connection>);

    fn on_timer(&mut self) {}
}

impl<T: ClientListener + ?Sized> ClientListener for &mut T {
    fn on_connection_established(&mut self, connection: &Arc<Connection>) {
        (**self).on_connection_established(connection);
    }

    fn on_connection_failed(&mut self, error: TransportError) {
        (**self).on_connection_failed(error);
    }

    fn on_packet_received(&mut self, connection: &Arc<Connection>, payload: Bytes) {
        (**self).on_packet_received(connection, payload);
    }

    fn on_disconnected(&mut self, connection: &Arc<Connection>) {
        (**self).on_disconnected(connection);
    }

    fn on_timer(&mut self) {
        (**self).on_timer();
    }
}
