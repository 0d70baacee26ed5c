//! Shared test doubles for unit tests across the crate. Compiled only under `#[cfg(test)]`.
//!
//! A minimal in-memory `Transport` stands in for the wire, while connections are established
//! against a real local socket so `BackendConnection`'s actual connect/keepalive path runs
//! unmodified.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};

use crate::{
    connection::BackendConnection,
    error::Result,
    transport::{test_support::FakeTransport, RpcValue, Transport},
};

/// Bind a local listener and accept connections in the background for as long as the test runs.
pub(crate) async fn fake_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });
    addr
}

/// A `TransportFactory` producing a default, single-record `FakeTransport` for every connection.
pub(crate) fn fake_transport_factory(
) -> Arc<dyn Fn(TcpStream) -> Box<dyn Transport> + Send + Sync> {
    Arc::new(|_stream| Box::new(FakeTransport::new()) as Box<dyn Transport>)
}

/// Connect a `BackendConnection` to a fresh local listener, wrapped in a default `FakeTransport`.
pub(crate) async fn fake_connection() -> Arc<BackendConnection> {
    fake_connection_with(vec![Ok(RpcValue::Raw(vec![]))]).await
}

/// As [`fake_connection`], but the transport replays `script` for every `rpc()` call.
pub(crate) async fn fake_connection_with(script: Vec<Result<RpcValue>>) -> Arc<BackendConnection> {
    let addr = fake_listener().await;
    let conn = BackendConnection::connect(addr, Duration::from_secs(30), move |_stream| {
        Box::new(FakeTransport::with_script(script)) as Box<dyn Transport>
    })
    .await
    .expect("connect to local test listener");
    Arc::new(conn)
}
