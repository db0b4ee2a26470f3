//! tcp client multiplexing queries over one pooled connection per endpoint
//!
//! Any number of queries may be in flight on a socket at once. Whoever holds
//! the read lock reads the next frame; if it answers someone else, it is
//! handed over through that caller's channel and the reader keeps going.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::ReadBuf;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dns::buffer::CodecError;
use crate::dns::context::TransportConfig;
use crate::dns::netutil::{self, Result, TransportError};
use crate::dns::protocol::{DnsMessage, MAX_MESSAGE_SIZE};

#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Sends one raw message to `endpoint` and copies the matching response
    /// into `response`, returning its length.
    async fn send_message(
        &self,
        endpoint: SocketAddr,
        request: &[u8],
        response: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize>;

    async fn send_query(
        &self,
        endpoint: SocketAddr,
        query: &DnsMessage<'_>,
        cancel: &CancellationToken,
    ) -> Result<DnsMessage<'static>> {
        let request = query.to_bytes()?;
        let mut response = vec![0; MAX_MESSAGE_SIZE];
        let len = self
            .send_message(endpoint, &request, &mut response, cancel)
            .await?;

        let message = DnsMessage::from_bytes(&response[..len])?.into_owned()?;
        Ok(message)
    }
}

/// Client side socket lifecycle callbacks.
pub trait ConnectionHooks: Send + Sync {
    fn create_socket(&self, endpoint: SocketAddr) -> io::Result<TcpSocket> {
        if endpoint.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
    }

    fn after_connect(&self, _endpoint: SocketAddr, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)
    }

    /// Called when a pooled socket is found disconnected and dropped.
    fn after_disconnect(&self, _endpoint: SocketAddr) {}
}

pub struct DefaultConnectionHooks;

impl ConnectionHooks for DefaultConnectionHooks {}

struct PooledSocket {
    endpoint: SocketAddr,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>,
    usable: AtomicBool,
    max_message_size: usize,
}

impl PooledSocket {
    fn new(endpoint: SocketAddr, stream: TcpStream, max_message_size: usize) -> PooledSocket {
        let (reader, writer) = stream.into_split();
        PooledSocket {
            endpoint,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            usable: AtomicBool::new(true),
            max_message_size,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u16, oneshot::Sender<Vec<u8>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks whether the socket can take another query. A socket whose peer
    /// has closed reads as end of stream without blocking.
    fn is_connected(&self) -> bool {
        if !self.usable.load(Ordering::Acquire) {
            return false;
        }

        // someone is reading right now and will notice a close themselves
        let mut reader = match self.reader.try_lock() {
            Ok(reader) => reader,
            Err(_) => return true,
        };

        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        let mut cx = Context::from_waker(Waker::noop());
        match reader.poll_peek(&mut cx, &mut buf) {
            Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => {
                self.invalidate();
                false
            }
            _ => true,
        }
    }

    /// Marks the socket unusable and fails every query waiting on it.
    fn invalidate(&self) {
        if self.usable.swap(false, Ordering::AcqRel) {
            debug!(server = %self.endpoint, "marking socket unusable");
        }
        self.pending().clear();
    }

    fn register(&self, id: u16) -> Result<oneshot::Receiver<Vec<u8>>> {
        let mut pending = self.pending();
        if pending.contains_key(&id) {
            return Err(TransportError::DuplicateTransaction(id));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    fn unregister(&self, id: u16) {
        self.pending().remove(&id);
    }

    fn deliver(&self, id: u16, frame: Vec<u8>) {
        let waiter = self.pending().remove(&id);
        match waiter {
            Some(tx) => {
                trace!(server = %self.endpoint, id, "handing response to its waiter");
                let _ = tx.send(frame);
            }
            None => debug!(server = %self.endpoint, id, "discarding unsolicited response"),
        }
    }

    async fn exchange(
        &self,
        id: u16,
        request: &[u8],
        mut rx: oneshot::Receiver<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        {
            let mut writer = self.writer.lock().await;
            let guard = FrameGuard::arm(self);
            netutil::write_packet(&mut *writer, request).await?;
            guard.disarm();
        }

        loop {
            let mut reader = tokio::select! {
                biased;
                delivered = &mut rx => {
                    return delivered.map_err(|_| TransportError::ConnectionClosed);
                }
                reader = self.reader.lock() => reader,
            };

            // the previous lock holder may have handed our frame over while
            // we were queued for the lock
            match rx.try_recv() {
                Ok(frame) => return Ok(frame),
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(TransportError::ConnectionClosed)
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            // nothing is consumed until a frame starts arriving
            let mut first = [0u8; 1];
            match reader.peek(&mut first).await {
                Ok(0) => {
                    self.invalidate();
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    self.invalidate();
                    return Err(e.into());
                }
            }

            let guard = FrameGuard::arm(self);
            let frame = match netutil::read_packet_vec(&mut *reader, self.max_message_size).await? {
                Some(frame) => frame,
                None => return Err(TransportError::ConnectionClosed),
            };
            guard.disarm();

            match netutil::transaction_id(&frame) {
                Some(other) if other == id => {
                    self.unregister(id);
                    return Ok(frame);
                }
                Some(other) => self.deliver(other, frame),
                None => debug!(server = %self.endpoint, "discarding runt response"),
            }
        }
    }
}

/// Invalidates the socket when dropped while armed. Armed for as long as
/// part of a frame has gone out or come in, so an exchange abandoned at that
/// point takes the out of sync stream down with it.
struct FrameGuard<'a> {
    socket: &'a PooledSocket,
    armed: bool,
}

impl<'a> FrameGuard<'a> {
    fn arm(socket: &'a PooledSocket) -> FrameGuard<'a> {
        FrameGuard {
            socket,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.socket.invalidate();
        }
    }
}

pub struct DnsTcpClient {
    config: TransportConfig,
    hooks: Arc<dyn ConnectionHooks>,
    sockets: DashMap<SocketAddr, Arc<PooledSocket>>,
    creating: DashMap<SocketAddr, Arc<tokio::sync::Mutex<()>>>,
}

impl DnsTcpClient {
    pub fn new(config: TransportConfig) -> DnsTcpClient {
        DnsTcpClient {
            config,
            hooks: Arc::new(DefaultConnectionHooks),
            sockets: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> DnsTcpClient {
        self.hooks = hooks;
        self
    }

    /// Number of endpoints with a pooled socket.
    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    fn lookup(&self, endpoint: SocketAddr) -> Option<Arc<PooledSocket>> {
        self.sockets.get(&endpoint).map(|entry| entry.value().clone())
    }

    async fn socket_for(&self, endpoint: SocketAddr) -> Result<Arc<PooledSocket>> {
        if let Some(socket) = self.lookup(endpoint) {
            if socket.is_connected() {
                return Ok(socket);
            }
        }

        let lock = self.creating.entry(endpoint).or_default().clone();
        let _guard = lock.lock().await;

        // another caller may have connected while we waited
        if let Some(existing) = self.lookup(endpoint) {
            if existing.is_connected() {
                return Ok(existing);
            }

            self.sockets.remove(&endpoint);
            existing.invalidate();
            self.hooks.after_disconnect(endpoint);
            info!(server = %endpoint, "replacing disconnected socket");
        }

        let socket = Arc::new(self.connect(endpoint).await?);
        self.sockets.insert(endpoint, socket.clone());

        Ok(socket)
    }

    async fn connect(&self, endpoint: SocketAddr) -> Result<PooledSocket> {
        let socket = self.hooks.create_socket(endpoint)?;
        let stream = tokio::time::timeout(self.config.connect_timeout(), socket.connect(endpoint))
            .await
            .map_err(|_| TransportError::Timeout)??;
        self.hooks.after_connect(endpoint, &stream)?;

        debug!(server = %endpoint, "tcp connection established");

        Ok(PooledSocket::new(
            endpoint,
            stream,
            self.config.message_size(),
        ))
    }
}

#[async_trait]
impl DnsClient for DnsTcpClient {
    async fn send_message(
        &self,
        endpoint: SocketAddr,
        request: &[u8],
        response: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if request.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(request.len()));
        }
        let id = netutil::transaction_id(request).ok_or(CodecError::OutOfRange {
            pos: 2,
            len: request.len(),
        })?;

        let socket = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            socket = self.socket_for(endpoint) => socket?,
        };
        let rx = socket.register(id)?;

        let io_timeout = self.config.io_timeout();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = tokio::time::timeout(io_timeout, socket.exchange(id, request, rx)) => {
                res.unwrap_or(Err(TransportError::Timeout))
            }
        };

        let frame = match outcome {
            Ok(frame) => frame,
            Err(e) => {
                // a late response for this id is discarded by whoever reads it
                socket.unregister(id);
                if matches!(e, TransportError::Timeout) {
                    socket.invalidate();
                }
                warn!(server = %endpoint, id, error = %e, "tcp query failed");
                return Err(e);
            }
        };

        if frame.len() > response.len() {
            return Err(TransportError::BufferTooSmall {
                needed: frame.len(),
                available: response.len(),
            });
        }
        response[..frame.len()].copy_from_slice(&frame);

        debug!(server = %endpoint, id, len = frame.len(), "tcp response received");

        Ok(frame.len())
    }
}

#[cfg(test)]
mod tests {

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::dns::netutil::{read_packet_vec, write_packet};
    use crate::dns::protocol::{DnsQuestion, QueryType};

    fn request_with_id(id: u16, len: usize) -> Vec<u8> {
        let mut request = vec![0xee; len];
        request[..2].copy_from_slice(&id.to_be_bytes());
        request
    }

    fn response_for(request: &[u8], fill: u8, len: usize) -> Vec<u8> {
        let mut response = vec![fill; len];
        response[..2].copy_from_slice(&request[..2]);
        response
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        read_packet_vec(stream, MAX_MESSAGE_SIZE).await.unwrap().unwrap()
    }

    async fn local_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        (listener, endpoint)
    }

    #[derive(Default)]
    struct CountingHooks {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl ConnectionHooks for CountingHooks {
        fn after_connect(&self, _endpoint: SocketAddr, _stream: &TcpStream) -> io::Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn after_disconnect(&self, _endpoint: SocketAddr) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_exchange_is_framed() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await;
            assert_eq!(30, request.len());
            write_packet(&mut stream, &response_for(&request, 7, 100))
                .await
                .unwrap();
            stream
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let mut response = vec![0u8; 512];
        let len = client
            .send_message(
                endpoint,
                &request_with_id(0x1234, 30),
                &mut response,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(100, len);
        assert_eq!(&[0x12, 0x34], &response[..2]);
        assert!(response[2..100].iter().all(|b| *b == 7));
        assert_eq!(1, client.connection_count());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = read_frame(&mut stream).await;
            let second = read_frame(&mut stream).await;

            write_packet(&mut stream, &response_for(&second, 2, 40))
                .await
                .unwrap();
            write_packet(&mut stream, &response_for(&first, 1, 20))
                .await
                .unwrap();
            stream
        });

        let hooks = Arc::new(CountingHooks::default());
        let client = DnsTcpClient::new(TransportConfig::default()).with_hooks(hooks.clone());
        let token = CancellationToken::new();

        let request_a = request_with_id(1, 20);
        let request_b = request_with_id(2, 40);
        let mut response_a = vec![0u8; 512];
        let mut response_b = vec![0u8; 512];

        let (a, b) = tokio::join!(
            client.send_message(endpoint, &request_a, &mut response_a, &token),
            client.send_message(endpoint, &request_b, &mut response_b, &token),
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(response_for(&request_a, 1, 20), &response_a[..a]);
        assert_eq!(response_for(&request_b, 2, 40), &response_b[..b]);
        assert_eq!(1, hooks.connects.load(Ordering::SeqCst));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_response_is_discarded() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await;
            write_packet(&mut stream, &request_with_id(0xdead, 12))
                .await
                .unwrap();
            write_packet(&mut stream, &[0x01]).await.unwrap();
            write_packet(&mut stream, &response_for(&request, 9, 16))
                .await
                .unwrap();
            stream
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let mut response = vec![0u8; 64];
        let len = client
            .send_message(
                endpoint,
                &request_with_id(7, 12),
                &mut response,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(16, len);
        assert_eq!(&[0, 7], &response[..2]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_socket_is_replaced() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_frame(&mut stream).await;
                write_packet(&mut stream, &response_for(&request, 3, 12))
                    .await
                    .unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        let hooks = Arc::new(CountingHooks::default());
        let client = DnsTcpClient::new(TransportConfig::default()).with_hooks(hooks.clone());
        let token = CancellationToken::new();
        let mut response = vec![0u8; 64];

        client
            .send_message(endpoint, &request_with_id(1, 12), &mut response, &token)
            .await
            .unwrap();

        // let the close reach us before the next query
        tokio::time::sleep(Duration::from_millis(100)).await;

        let len = client
            .send_message(endpoint, &request_with_id(2, 12), &mut response, &token)
            .await
            .unwrap();
        assert_eq!(&[0, 2], &response[..2]);
        assert_eq!(12, len);
        assert_eq!(2, hooks.connects.load(Ordering::SeqCst));
        assert_eq!(1, hooks.disconnects.load(Ordering::SeqCst));
        assert_eq!(1, client.connection_count());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let config = TransportConfig {
            io_timeout_ms: 50,
            ..TransportConfig::default()
        };
        let client = DnsTcpClient::new(config);
        let mut response = vec![0u8; 64];

        let result = client
            .send_message(
                endpoint,
                &request_with_id(1, 12),
                &mut response,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));

        let socket = client.lookup(endpoint).unwrap();
        assert!(!socket.is_connected());
        assert!(socket.pending().is_empty());

        server.abort();
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_wait() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut response = vec![0u8; 64];
        let result = client
            .send_message(endpoint, &request_with_id(1, 12), &mut response, &token)
            .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));

        server.abort();
    }

    #[tokio::test]
    async fn test_small_response_buffer_is_reported() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await;
            write_packet(&mut stream, &response_for(&request, 0, 100))
                .await
                .unwrap();
            stream
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let mut response = vec![0u8; 10];
        let result = client
            .send_message(
                endpoint,
                &request_with_id(1, 12),
                &mut response,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(TransportError::BufferTooSmall {
                needed: 100,
                available: 10
            })
        ));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_query_decodes_response() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await;
            let query = DnsMessage::from_bytes(&request).unwrap();
            let response = DnsMessage::response_to(&query).to_bytes().unwrap();
            write_packet(&mut stream, &response).await.unwrap();
            stream
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let query = DnsMessage::query(0x4242, DnsQuestion::new("example.com", QueryType::A));
        let response = client
            .send_query(endpoint, &query, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(0x4242, response.id());
        assert!(response.header().response);
        assert_eq!(query.questions(), response.questions());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_query_leaves_others_running() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _first = read_frame(&mut stream).await;
            let _second = read_frame(&mut stream).await;

            tokio::time::sleep(Duration::from_millis(200)).await;
            write_packet(&mut stream, &response_for(&request_with_id(2, 12), 5, 24))
                .await
                .unwrap();
            stream
        });

        let hooks = Arc::new(CountingHooks::default());
        let client = DnsTcpClient::new(TransportConfig::default()).with_hooks(hooks.clone());

        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        let canceller = token_a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let request_a = request_with_id(1, 12);
        let request_b = request_with_id(2, 12);
        let mut response_a = vec![0u8; 64];
        let mut response_b = vec![0u8; 64];

        let (a, b) = tokio::join!(
            client.send_message(endpoint, &request_a, &mut response_a, &token_a),
            client.send_message(endpoint, &request_b, &mut response_b, &token_b),
        );

        assert!(matches!(a, Err(TransportError::Cancelled)));
        let b = b.unwrap();
        assert_eq!(response_for(&request_b, 5, 24), &response_b[..b]);

        let socket = client.lookup(endpoint).unwrap();
        assert!(socket.is_connected());
        assert!(socket.pending().is_empty());
        assert_eq!(1, hooks.connects.load(Ordering::SeqCst));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_in_flight_is_rejected() {
        let (listener, endpoint) = local_listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            write_packet(&mut stream, &response_for(&request, 4, 12))
                .await
                .unwrap();
            stream
        });

        let client = DnsTcpClient::new(TransportConfig::default());
        let token = CancellationToken::new();
        let request = request_with_id(0x0909, 12);
        let mut response_a = vec![0u8; 64];
        let mut response_b = vec![0u8; 64];

        let (a, b) = tokio::join!(
            client.send_message(endpoint, &request, &mut response_a, &token),
            client.send_message(endpoint, &request, &mut response_b, &token),
        );

        let (answered, rejected) = match (a, b) {
            (Ok(len), Err(e)) => (&response_a[..len], e),
            (Err(e), Ok(len)) => (&response_b[..len], e),
            other => panic!("expected one answer and one rejection, got {:?}", other),
        };
        assert_eq!(response_for(&request, 4, 12), answered);
        assert!(matches!(rejected, TransportError::DuplicateTransaction(0x0909)));

        let socket = client.lookup(endpoint).unwrap();
        assert!(socket.is_connected());

        server.await.unwrap();
    }
}
