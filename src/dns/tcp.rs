//! tcp server with pipelined request handling
//!
//! Each connection has a read loop that rents a transit buffer pair, reads
//! one framed request into it and hands it to a freshly spawned task, then
//! goes straight back to reading. Responses are written under a per
//! connection lock in whatever order handlers finish.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dns::context::ServerContext;
use crate::dns::netutil::{self, Result, TransportError};
use crate::dns::pool::PooledTransit;
use crate::dns::server::{DefaultServerHooks, RequestHandler, ServerHooks};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    handler: Arc<dyn RequestHandler>,
    hooks: Arc<dyn ServerHooks>,
}

/// State shared between a connection's read loop and its request tasks.
struct Connection {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    token: CancellationToken,
    failure: Mutex<Option<TransportError>>,
}

impl Connection {
    /// Records the first failure and tears the connection down.
    fn fail(&self, error: TransportError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.token.cancel();
    }

    fn take_failure(&self) -> Option<TransportError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn respond(
        &self,
        handler: &dyn RequestHandler,
        transit: &mut PooledTransit,
        len: usize,
        context: &ServerContext,
    ) -> Result<()> {
        let (request, response) = transit.split_mut();
        let written = handler
            .handle(&request[..len], response, &self.token)
            .await
            .map_err(TransportError::Handler)?;
        if written > response.len() {
            return Err(TransportError::BufferTooSmall {
                needed: written,
                available: response.len(),
            });
        }

        let mut writer = self.writer.lock().await;
        tokio::time::timeout(
            context.config.io_timeout(),
            netutil::write_packet(&mut *writer, &response[..written]),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        trace!(peer = %self.peer, len = written, "response written");

        Ok(())
    }
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, handler: Arc<dyn RequestHandler>) -> DnsTcpServer {
        DnsTcpServer {
            context,
            handler,
            hooks: Arc::new(DefaultServerHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> DnsTcpServer {
        self.hooks = hooks;
        self
    }

    pub async fn listen(self: Arc<Self>, endpoint: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(endpoint).await?;
        self.serve(listener).await
    }

    /// Accepts connections until the context's shutdown token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let shutdown = self.context.shutdown.clone();
        info!(addr = ?listener.local_addr().ok(), "tcp server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("tcp server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // errors like EMFILE persist until something is freed
                        warn!(error = %e, "failed to accept tcp connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.run_connection(stream, peer).await;
            });
        }
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "tcp connection accepted");
        self.hooks.on_connect(peer);

        let (reader, writer) = stream.into_split();
        let connection = Arc::new(Connection {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            token: self.context.shutdown.child_token(),
            failure: Mutex::new(None),
        });

        let result = self.connection_loop(reader, &connection).await;
        match &result {
            Ok(()) => debug!(%peer, "tcp connection closed"),
            Err(e) => warn!(%peer, error = %e, "tcp connection terminated"),
        }

        self.hooks.on_disconnect(peer, result.as_ref().err());
    }

    async fn connection_loop(
        &self,
        mut reader: OwnedReadHalf,
        connection: &Arc<Connection>,
    ) -> Result<()> {
        let config = &self.context.config;
        let mut tasks = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            let mut transit = tokio::select! {
                _ = connection.token.cancelled() => break,
                rented = self.context.pool.rent() => rented?,
            };

            let len = tokio::select! {
                _ = connection.token.cancelled() => break,
                len = tokio::time::timeout(config.idle_timeout(), netutil::read_packet_length(&mut reader)) => {
                    match len {
                        Ok(len) => len?,
                        Err(_) => {
                            debug!(peer = %connection.peer, "closing idle connection");
                            None
                        }
                    }
                }
            };
            let len = match len {
                Some(len) => len,
                None => {
                    // wait for requests already read to be answered
                    while tasks.join_next().await.is_some() {}
                    if let Err(e) = connection.writer.lock().await.shutdown().await {
                        debug!(peer = %connection.peer, error = %e, "shutdown after close failed");
                    }
                    break;
                }
            };
            if len > transit.request().len() {
                return Err(TransportError::MessageTooLarge(len));
            }

            tokio::select! {
                _ = connection.token.cancelled() => break,
                body = tokio::time::timeout(
                    config.io_timeout(),
                    netutil::read_packet_body(&mut reader, &mut transit.request_mut()[..len]),
                ) => body.map_err(|_| TransportError::Timeout)??,
            }

            trace!(peer = %connection.peer, len, "request read");

            let connection = connection.clone();
            let handler = self.handler.clone();
            let context = self.context.clone();
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = connection.token.cancelled() => return,
                    outcome = connection.respond(&*handler, &mut transit, len, &context) => outcome,
                };
                if let Err(e) = outcome {
                    connection.fail(e);
                }
            });
        }

        match connection.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
