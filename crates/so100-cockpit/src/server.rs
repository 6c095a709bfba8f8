//! [`CockpitServer`] – HTTP + WebSocket server for the observer page.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`CockpitServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with the embedded cockpit HTML.
//! * WebSocket upgrades → one registered observer per connection, bridged
//!   to the [`Session`].
//!
//! Inbound text is handed to a per-connection worker that processes it in
//! arrival order, so a slow chat reply never stalls the event stream going
//! back to the browser.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use so100_runtime::Session;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Default TCP port for the cockpit HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8000;

/// The compiled-in observer page (HTML + CSS + JS).
const COCKPIT_HTML: &str = include_str!("cockpit.html");

#[derive(Error, Debug)]
pub enum CockpitError {
    #[error("bind error on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("I/O error from {peer}: {source}")]
    Io {
        peer: SocketAddr,
        source: std::io::Error,
    },

    #[error("WebSocket handshake from {peer}: {source}")]
    Handshake {
        peer: SocketAddr,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// CockpitServer
// ─────────────────────────────────────────────────────────────────────────────

/// Serves the cockpit page and bridges every WebSocket to a [`Session`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use so100_cockpit::CockpitServer;
/// # async fn demo(session: Arc<so100_runtime::Session>) {
/// CockpitServer::new(session).with_port(8000).run().await.ok();
/// # }
/// ```
pub struct CockpitServer {
    session: Arc<Session>,
    port: u16,
}

impl CockpitServer {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CockpitError::Bind`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), CockpitError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CockpitError::Bind { addr, source })?;
        info!(url = %format!("http://localhost:{}", self.port), "cockpit listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let session = Arc::clone(&self.session);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, session).await {
                            warn!(%peer, error = %e, "cockpit client error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-connection handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, session: Arc<Session>) -> Result<(), CockpitError> {
    // `peek` leaves the request in place for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|source| CockpitError::Io { peer, source })?;

    if is_websocket_upgrade(&buf[..n]) {
        handle_ws(stream, peer, session).await
    } else {
        serve_html(stream, peer).await
    }
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().any(|line| {
        let line = line.to_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

async fn serve_html(mut stream: TcpStream, peer: SocketAddr) -> Result<(), CockpitError> {
    let body = COCKPIT_HTML;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|source| CockpitError::Io { peer, source })?;
    debug!(%peer, "served cockpit page");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket: one observer per connection
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws(stream: TcpStream, peer: SocketAddr, session: Arc<Session>) -> Result<(), CockpitError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|source| CockpitError::Handshake { peer, source })?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (observer, mut events) = session.attach_observer();
    info!(%peer, %observer, "observer connected");

    let (inbound, mut queued) = mpsc::unbounded_channel::<String>();
    tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            while let Some(text) = queued.recv().await {
                session.handle_message(observer, &text).await;
            }
            debug!(%observer, "inbound worker finished");
        }
    });

    loop {
        tokio::select! {
            // ── Downstream: session → browser ───────────────────────────────
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%observer, error = %e, "event serialization failed"),
                }
            }
            // ── Upstream: browser → session ─────────────────────────────────
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%observer, error = %e, "websocket read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Messages already queued still run; the worker exits once they are done.
    drop(inbound);
    session.detach_observer(observer);
    info!(%peer, %observer, "observer disconnected");
    Ok(())
}
