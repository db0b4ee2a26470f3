//! contracts between the tcp server and the code it hosts

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dns::netutil::TransportError;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Answers one request.
///
/// The handler receives the raw request bytes and writes its response into
/// `response`, returning how many bytes it wrote. Returning an error closes
/// the connection the request arrived on. `cancel` fires when that
/// connection or the whole server goes away.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: &[u8],
        response: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, HandlerError>;
}

/// Connection lifecycle callbacks for the server side.
pub trait ServerHooks: Send + Sync {
    fn on_connect(&self, _peer: SocketAddr) {}

    /// Called once per connection after its socket is gone. `error` is set
    /// when the connection ended for any reason other than a clean close or
    /// shutdown.
    fn on_disconnect(&self, _peer: SocketAddr, _error: Option<&TransportError>) {}
}

pub struct DefaultServerHooks;

impl ServerHooks for DefaultServerHooks {}
