//! Connection layer (§4.4): the shared contract every transport fulfils —
//! an ip, an OPEN/CLOSED state, and a way to send raw message bytes — plus
//! the four independent acceptor loops (TCP, TCP+TLS, WebSocket,
//! WebSocket+TLS) that construct one.
//!
//! Framing differs by transport but is handled entirely here: plain TCP
//! gets a length-prefixed `tokio_util` codec, WebSocket gets one message
//! per frame for free from `tokio-tungstenite`. Either can be wrapped in
//! TLS via `tokio-rustls` first, following the same
//! `TlsAcceptor::from(Arc<ServerConfig>)` + `.accept(stream)` shape used
//! throughout the ecosystem for this.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use uuid::Uuid;

use crate::conn_manager::ConnectionManager;

/// Whether a connection is still accepting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closed,
}

/// The shared handle every transport registers with the
/// [`ConnectionManager`] — ip, state, and a raw-bytes send queue. The
/// writer task for the concrete transport drains the other end and applies
/// whatever framing that transport needs.
pub struct ConnectionHandle {
    id: String,
    ip: String,
    open: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn state(&self) -> ConnState {
        if self.open.load(Ordering::Relaxed) {
            ConnState::Open
        } else {
            ConnState::Closed
        }
    }

    /// Queue a raw (unframed) message for delivery. Fails if the connection
    /// is already closed or its writer task has gone away.
    pub fn send(&self, message: Vec<u8>) -> mb_core::Result<()> {
        if self.state() != ConnState::Open {
            return Err(mb_core::Error::Other("connection is closed".to_string()));
        }
        self.tx.send(message).map_err(|_| mb_core::Error::ChannelClosed)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// Build a standalone handle with no backing transport, for exercising
    /// [`crate::conn_manager::ConnectionManager`] without a real socket.
    pub(crate) fn new_for_test(id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            open: Arc::new(AtomicBool::new(true)),
            tx,
        });
        (handle, rx)
    }
}

/// Load a PEM certificate chain and private key into a server-side TLS
/// config. Accepts PKCS#8 or RSA (PKCS#1) private keys.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> mb_core::Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| mb_core::Error::Tls(e.to_string()))?;

    let key_file = std::fs::File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| mb_core::Error::Tls(e.to_string()))?
        .ok_or_else(|| mb_core::Error::Tls("no private key found in key file".to_string()))?;

    // rustls's default provider only negotiates TLS 1.2 and 1.3, satisfying
    // the minimum-TLS-1.2 requirement without extra configuration.
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| mb_core::Error::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

fn ws_config(max_payload: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_payload);
    config.max_frame_size = Some(max_payload);
    config
}

async fn register_and_pump<R, W>(
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
    ip: String,
    manager: Arc<ConnectionManager>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let open = Arc::new(AtomicBool::new(true));
    let id = Uuid::new_v4().to_string();
    let handle = Arc::new(ConnectionHandle {
        id: id.clone(),
        ip,
        open: open.clone(),
        tx,
    });

    manager.add_connection(handle).await;
    let writer_task = tokio::spawn(pump_tcp_writer(writer, rx));

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(bytes) => manager.handle_message(&id, &bytes).await,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "frame read failed, closing connection");
                break;
            }
        }
    }

    open.store(false, Ordering::Relaxed);
    writer_task.abort();
    manager.remove_connection(&id).await;
}

async fn pump_tcp_writer<W>(mut writer: FramedWrite<W, LengthDelimitedCodec>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if writer.send(Bytes::from(msg)).await.is_err() {
            break;
        }
    }
}

fn length_delimited_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

async fn handle_tcp_stream(stream: TcpStream, ip: String, manager: Arc<ConnectionManager>) {
    let _ = stream.set_nodelay(true);
    let max_frame = manager.max_frame_length();
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, length_delimited_codec(max_frame));
    let writer = FramedWrite::new(write_half, length_delimited_codec(max_frame));
    register_and_pump(reader, writer, ip, manager).await;
}

async fn handle_tls_stream(stream: tokio_rustls::server::TlsStream<TcpStream>, ip: String, manager: Arc<ConnectionManager>) {
    let max_frame = manager.max_frame_length();
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, length_delimited_codec(max_frame));
    let writer = FramedWrite::new(write_half, length_delimited_codec(max_frame));
    register_and_pump(reader, writer, ip, manager).await;
}

async fn register_and_pump_ws<S>(ws: tokio_tungstenite::WebSocketStream<S>, ip: String, manager: Arc<ConnectionManager>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let open = Arc::new(AtomicBool::new(true));
    let id = Uuid::new_v4().to_string();
    let handle = Arc::new(ConnectionHandle {
        id: id.clone(),
        ip,
        open: open.clone(),
        tx,
    });

    manager.add_connection(handle).await;

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match String::from_utf8(msg) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => manager.handle_message(&id, text.as_bytes()).await,
            Ok(Message::Binary(bytes)) => manager.handle_message(&id, &bytes).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "websocket read failed, closing connection");
                break;
            }
        }
    }

    open.store(false, Ordering::Relaxed);
    writer_task.abort();
    manager.remove_connection(&id).await;
}

/// Accept loop for plain (non-TLS) framed TCP connections.
pub async fn accept_tcp_loop(listener: TcpListener, manager: Arc<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let manager = manager.clone();
                tokio::spawn(handle_tcp_stream(stream, ip_of(addr), manager));
            }
            Err(e) => tracing::warn!(error = %e, "tcp accept failed"),
        }
    }
}

/// Accept loop for TLS-wrapped framed TCP connections.
pub async fn accept_tls_loop(listener: TcpListener, acceptor: TlsAcceptor, manager: Arc<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ip = ip_of(addr);
                let acceptor = acceptor.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_tls_stream(tls_stream, ip, manager).await,
                        Err(e) => tracing::debug!(error = %e, "tls handshake failed"),
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "tls accept failed"),
        }
    }
}

/// Accept loop for plain (non-TLS) WebSocket connections.
pub async fn accept_ws_loop(listener: TcpListener, manager: Arc<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ip = ip_of(addr);
                let manager = manager.clone();
                let max_payload = manager.max_payload_length();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config(max_payload))).await {
                        Ok(ws) => register_and_pump_ws(ws, ip, manager).await,
                        Err(e) => tracing::debug!(error = %e, "websocket handshake failed"),
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "ws accept failed"),
        }
    }
}

/// Accept loop for TLS-wrapped WebSocket connections.
pub async fn accept_wss_loop(listener: TcpListener, acceptor: TlsAcceptor, manager: Arc<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ip = ip_of(addr);
                let acceptor = acceptor.clone();
                let manager = manager.clone();
                let max_payload = manager.max_payload_length();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!(error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    match tokio_tungstenite::accept_async_with_config(tls_stream, Some(ws_config(max_payload))).await {
                        Ok(ws) => register_and_pump_ws(ws, ip, manager).await,
                        Err(e) => tracing::debug!(error = %e, "websocket handshake failed"),
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "wss accept failed"),
        }
    }
}

fn ip_of(addr: SocketAddr) -> String {
    addr.ip().to_string()
}
