//! Daemon — accept loop and per-connection request routing.
//!
//! Grounded in the teacher's `Runtime`: one long-lived owner of shared
//! state (here, the `IsolateRegistry`) that every accepted connection's
//! request loop reads from. Unlike the teacher's single in-process
//! runtime, a session here is a whole TCP/Unix peer, so the loop
//! additionally handles the `HELLO` handshake and per-session cleanup on
//! disconnect.
//!
//! Transport follows the teacher's own worker binaries (`training`,
//! `continuum-core`), which listen on a Unix domain socket path rather
//! than TCP; TCP is kept as the fallback spec.md names explicitly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::proto::message::{Hello, RespErr, RespOk};
use crate::proto::{WireMessage, PROTOCOL_VERSION};
use crate::registry::IsolateRegistry;
use crate::session::{Inbound, Session};

/// Parsed form of `Config::listen`: a bare `host:port` is TCP, anything
/// else is treated as a Unix socket path (removed and recreated on bind,
/// matching the teacher's worker startup convention).
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<SocketAddr>() {
            Ok(addr) => ListenAddr::Tcp(addr),
            Err(_) => ListenAddr::Unix(PathBuf::from(raw)),
        }
    }
}

pub struct Daemon {
    config: Config,
    registry: Arc<IsolateRegistry>,
}

impl Daemon {
    pub fn new(config: Config, registry: Arc<IsolateRegistry>) -> Self {
        Self { config, registry }
    }

    /// Accept connections until `shutdown` fires, then stop taking new
    /// ones. In-flight sessions are left to drain on their own — callers
    /// that want a hard cutoff should also close the registry's isolates.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> DaemonResult<()> {
        match ListenAddr::parse(&self.config.listen) {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| DaemonError::BindFailure(e.to_string()))?;
                info!(%addr, "isolate daemon listening (tcp)");
                self.accept_loop(listener, shutdown).await
            }
            ListenAddr::Unix(path) => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)
                    .map_err(|e| DaemonError::BindFailure(e.to_string()))?;
                info!(path = %path.display(), "isolate daemon listening (unix)");
                self.accept_loop(listener, shutdown).await
            }
        }
    }

    /// Serve a caller-bound TCP listener directly — used by tests that
    /// need the OS-assigned port before the accept loop starts (`run`
    /// binds `config.listen` itself, which is awkward for `:0`).
    pub async fn serve_tcp(&self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> DaemonResult<()> {
        self.accept_loop(listener, shutdown).await
    }

    async fn accept_loop<L: Acceptor>(&self, listener: L, mut shutdown: broadcast::Receiver<()>) -> DaemonResult<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    info!("connection accepted");
                    let registry = self.registry.clone();
                    let max_frame_bytes = self.config.max_frame_bytes;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry, max_frame_bytes).await {
                            warn!(error = %e, "connection ended with error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("daemon shutting down: no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

/// Narrow seam over `TcpListener`/`UnixListener` so `accept_loop` doesn't
/// need to duplicate itself per transport.
trait Acceptor {
    type Conn: crate::session::AsyncDuplex;
    #[allow(async_fn_in_trait)]
    async fn accept(&self) -> std::io::Result<Self::Conn>;
}

impl Acceptor for TcpListener {
    type Conn = tokio::net::TcpStream;
    async fn accept(&self) -> std::io::Result<Self::Conn> {
        let (stream, _peer) = TcpListener::accept(self).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Acceptor for UnixListener {
    type Conn = tokio::net::UnixStream;
    async fn accept(&self) -> std::io::Result<Self::Conn> {
        let (stream, _peer) = UnixListener::accept(self).await?;
        Ok(stream)
    }
}

async fn handle_connection<D: crate::session::AsyncDuplex>(
    stream: D,
    registry: Arc<IsolateRegistry>,
    max_frame_bytes: u32,
) -> DaemonResult<()> {
    let (session, mut inbound) = Session::spawn(stream, max_frame_bytes);
    registry.register_session(session.clone());

    session.send_message(WireMessage::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
    }))?;

    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Req(req) => {
                let registry = registry.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    let reply = match registry.dispatch(session.id(), &req.op, req.payload).await {
                        Ok(payload) => WireMessage::RespOk(RespOk { id: req.id, payload }),
                        Err(err) => {
                            error!(op = %req.op, error = %err, "request failed");
                            WireMessage::RespErr(RespErr {
                                id: req.id,
                                error: err.to_wire(),
                            })
                        }
                    };
                    let _ = session.send_message(reply);
                });
            }
            Inbound::StreamFrame(msg) => session.route_stream_frame(msg),
            Inbound::Ping(_) | Inbound::WsCmd(_) | Inbound::CbResponseConsumed => {
                // PONG is already sent by the session's reader loop. Outbound
                // WS commands are pushed by the dispatcher directly over the
                // session's write half, not routed through this loop.
            }
        }
    }

    registry.unregister_session(session.id());
    session.close();
    Ok(())
}
