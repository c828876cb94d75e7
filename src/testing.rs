//! In-process emulator harness for tests: serves a [`Server`] on an
//! ephemeral port and hands out connected clients.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;

use crate::proto::{CloudTasksClient, CloudTasksServer};
use crate::server::{Server, ServerOptions};

pub struct EmulatorHandle {
    pub addr: SocketAddr,
    join: tokio::task::JoinHandle<()>,
}

impl EmulatorHandle {
    pub async fn client(&self) -> CloudTasksClient<Channel> {
        CloudTasksClient::connect(format!("http://{}", self.addr))
            .await
            .expect("connect to in-process emulator")
    }
}

impl Drop for EmulatorHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Serves the given emulator on an ephemeral local port.
pub async fn serve(server: Server) -> EmulatorHandle {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind emulator port");
    let addr = listener.local_addr().expect("listener address");
    let join = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(CloudTasksServer::new(server))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("emulator server");
    });
    EmulatorHandle { addr, join }
}

/// Default-options emulator plus a connected client, for the common case.
pub async fn run() -> (CloudTasksClient<Channel>, EmulatorHandle) {
    let handle = serve(Server::new(ServerOptions::default())).await;
    let client = handle.client().await;
    (client, handle)
}

/// A schedule time `delay` from now, for tasks that must (not) fire during a
/// test.
pub fn schedule_in(delay: Duration) -> prost_types::Timestamp {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    crate::proto::timestamp_from_chrono(Utc::now() + delay)
}
