//! Outbound session server: the switch dials in, one connection per call.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{EslClient, EslConnectOptions, EslEventStream, SessionMode},
    error::{EslError, EslResult},
};

/// Pause after a failed `accept()` so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF_MS: u64 = 100;

/// Settings applied to every accepted session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundServerOptions {
    /// Per-session connection options. `connect_timeout_ms` bounds each handshake command.
    pub connection: EslConnectOptions,
    /// Handshake strategy matching the dialplan's `socket` arguments.
    pub mode: SessionMode,
}

/// Listens for switch-initiated connections and runs a handler per session.
///
/// ```rust,no_run
/// use esl_bridge::{OutboundServer, OutboundServerOptions};
///
/// # async fn example() -> Result<(), esl_bridge::EslError> {
/// let server = OutboundServer::bind("0.0.0.0:8084", OutboundServerOptions::default()).await?;
/// server
///     .serve(|client, _events| async move {
///         client.execute_app("answer", None, None).await?;
///         client.execute_app("playback", Some("ivr/ivr-welcome.wav"), None).await?;
///         Ok::<_, esl_bridge::EslError>(())
///     })
///     .await
/// # }
/// ```
///
/// Configure the switch to connect to it:
/// ```xml
/// <action application="socket" data="127.0.0.1:8084 async full"/>
/// ```
#[derive(Debug)]
pub struct OutboundServer {
    listener: TcpListener,
    options: Arc<OutboundServerOptions>,
}

impl OutboundServer {
    /// Bind the listening socket.
    pub async fn bind(address: impl ToSocketAddrs, options: OutboundServerOptions) -> EslResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(EslError::Io)?;
        Ok(Self::from_listener(listener, options))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener, options: OutboundServerOptions) -> Self {
        Self {
            listener,
            options: Arc::new(options),
        }
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> EslResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(EslError::Io)
    }

    /// Accept sessions forever.
    ///
    /// `handler_factory` is called once per session, after the handshake,
    /// and its future runs on its own task. Whatever the handler does (return,
    /// fail, panic), the connection is closed exactly once afterwards. A
    /// handler that never finishes only holds its own session.
    pub async fn serve<F, Fut>(self, handler_factory: F) -> EslResult<()>
    where
        F: Fn(EslClient, EslEventStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EslResult<()>> + Send + 'static,
    {
        let factory = Arc::new(handler_factory);
        info!(
            "[ACCEPT] Outbound server listening on {}",
            self.local_addr()?
        );

        loop {
            let (stream, peer) = match self
                .listener
                .accept()
                .await
            {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[ACCEPT] accept() failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                    continue;
                }
            };
            debug!("[ACCEPT] Connection from {}", peer);

            tokio::spawn(run_session(
                stream,
                peer,
                self.options
                    .clone(),
                factory.clone(),
            ));
        }
    }
}

/// Bind `address` with default options and serve sessions forever.
pub async fn serve<A, F, Fut>(address: A, handler_factory: F) -> EslResult<()>
where
    A: ToSocketAddrs,
    F: Fn(EslClient, EslEventStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EslResult<()>> + Send + 'static,
{
    OutboundServer::bind(address, OutboundServerOptions::default())
        .await?
        .serve(handler_factory)
        .await
}

async fn run_session<F, Fut>(
    stream: TcpStream,
    peer: SocketAddr,
    options: Arc<OutboundServerOptions>,
    factory: Arc<F>,
) where
    F: Fn(EslClient, EslEventStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EslResult<()>> + Send + 'static,
{
    // A failed handshake has already closed its socket.
    let (client, events) =
        match EslClient::from_outbound_stream(stream, &options.connection, options.mode).await {
            Ok(session) => session,
            Err(e) => {
                warn!("[ACCEPT] Handshake with {} failed: {}", peer, e);
                return;
            }
        };

    let session_uuid = client
        .session_uuid()
        .unwrap_or("<unknown>")
        .to_string();
    info!("[ACCEPT] Session {} from {} started", session_uuid, peer);

    let handler = AssertUnwindSafe(factory(client.clone(), events));
    match handler
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => debug!("[ACCEPT] Session {} handler finished", session_uuid),
        Ok(Err(e)) => warn!("[ACCEPT] Session {} handler failed: {}", session_uuid, e),
        Err(_) => error!("[ACCEPT] Session {} handler panicked", session_uuid),
    }

    if let Err(e) = client
        .disconnect()
        .await
    {
        debug!("[ACCEPT] Session {} close: {}", session_uuid, e);
    }
    info!("[ACCEPT] Session {} closed", session_uuid);
}
