pub mod call;
pub mod context;
pub mod stream;

use crate::cancellation::CallScope;
use crate::config::Config;
use crate::connection::Connection;
use crate::errors::{ConnectionError, RpcError, RpcResult};
use crate::frames::payloads::RequestEnvelope;
use crate::handler::HandlerRegistry;
use crate::server::context::ServerCallContext;
use crate::status::Status;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// RPC server: accepts connections and dispatches one call per connection.
#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config, registry: Arc<HandlerRegistry>) -> Server {
        Server {
            config: Arc::new(config),
            registry,
            shutdown: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the configured address and starts accepting calls.
    ///
    /// Returns the bound address, useful with an ephemeral port.
    pub async fn start(&self) -> RpcResult<SocketAddr> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() || self.shutdown.is_cancelled() {
            return Err(RpcError::Error("Server already started".to_owned()));
        }
        let listener = TcpListener::bind(self.config.server_address)
            .await
            .map_err(ConnectionError::from)?;
        let address = listener.local_addr().map_err(ConnectionError::from)?;
        debug!("Server listening on {}", address);
        *accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        )));
        Ok(address)
    }

    /// Stops accepting, cancels every live call and waits for all of them to end.
    pub async fn shutdown(&self) {
        debug!("Shutting down server");
        self.shutdown.cancel();
        if let Some(accept_task) = self.accept_task.lock().await.take() {
            if let Err(err) = accept_task.await {
                error!("Accept loop failed: {}", err);
            }
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<HandlerRegistry>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!("Accepted connection from {}", peer);
                    connections.spawn(handle_stream(
                        stream,
                        registry.clone(),
                        config.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => accept_failed(err, &shutdown).await,
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = finished {
                    error!("Connection task failed: {}", err);
                }
            }
        }
    }
    drop(listener);
    debug!("Waiting for {} live calls", connections.len());
    while let Some(finished) = connections.join_next().await {
        if let Err(err) = finished {
            error!("Connection task failed: {}", err);
        }
    }
}

/// Pauses after a failed accept, so a persistent failure such as running out of file
/// descriptors does not spin the loop.
async fn accept_failed(err: io::Error, shutdown: &CancellationToken) {
    error!("Failed to accept connection: {}", err);
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
    }
}

async fn handle_stream(
    stream: TcpStream,
    registry: Arc<HandlerRegistry>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    let host = match stream.local_addr() {
        Ok(host) => host,
        Err(err) => {
            debug!("Dropping connection: {}", err);
            return;
        }
    };
    match Connection::from_stream(stream, config.max_frame_length) {
        Ok(connection) => dispatch(connection, host, registry, config, shutdown).await,
        Err(err) => debug!("Dropping connection: {}", err),
    }
}

/// Reads the request envelope and hands the call to its handler.
pub(crate) async fn dispatch(
    connection: Connection,
    host: SocketAddr,
    registry: Arc<HandlerRegistry>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    let peer = connection.peer();
    let (mut reader, writer) = connection.split();
    let envelope = tokio::time::timeout(
        config.envelope_timeout,
        reader.read_typed::<RequestEnvelope>(&shutdown),
    )
    .await
    .unwrap_or_else(|_| {
        Err(ConnectionError::Unavailable(
            "Timed out waiting for request envelope".to_owned(),
        ))
    });
    match envelope {
        Ok(envelope) => match registry.get(envelope.method_name()).await {
            Some(handler) => {
                debug!("Dispatching {} from {}", envelope.method_name(), peer);
                let scope = CallScope::new(Some(&shutdown), envelope.deadline());
                let context = ServerCallContext::new(
                    envelope.method_name().clone(),
                    host,
                    peer,
                    envelope.headers().clone(),
                    scope,
                    writer.clone(),
                );
                call::serve(handler, context, reader, config.clone()).await;
            }
            None => {
                debug!("No handler for {} from {}", envelope.method_name(), peer);
                let status = Status::unimplemented(format!(
                    "Method '{}' is not implemented",
                    envelope.method_name()
                ));
                let written = async {
                    let mut guard = writer.lock(&shutdown).await?;
                    guard.write_status(status, &shutdown).await
                }
                .await;
                if let Err(err) = written {
                    debug!("Failed to reject call from {}: {}", peer, err);
                }
            }
        },
        Err(err) => debug!("No request envelope from {}: {}", peer, err),
    }
    writer.close(config.close_timeout).await;
}
