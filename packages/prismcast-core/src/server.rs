//! The WebSocket media server: accepts connections, runs the HTTP upgrade,
//! and drives one cooperative task per client that interleaves frame
//! reads, dispatch ticks, and opportunistic writes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Buf;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::abr::AbrOptions;
use crate::channel::{ChannelError, ChannelRegistry};
use crate::config::ServerConfig;
use crate::constants::{CLOSE_GRACE_MS, DISPATCH_INTERVAL_MS, MAX_BUFFER_S};
use crate::protocol::{pack, unpack, ServerErrorKind, ServerMessage};
use crate::session::{Session, SessionError};
use crate::ws::{
    handshake, CloseAction, ConnState, Frame, OpCode, WsConnection, WsMessage,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Immutable state shared by every connection task.
pub struct ServerContext {
    pub registry: ChannelRegistry,
    pub config: ServerConfig,
    pub connections: ConnectionTracker,
}

/// Live-connection accounting with RAII cleanup.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: dashmap::DashMap<u64, SocketAddr>,
}

impl ConnectionTracker {
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl ServerContext {
    /// Registers a connection; the returned guard unregisters on drop,
    /// even if the handler task bails early.
    fn track(self: &Arc<Self>, conn_id: u64, peer: SocketAddr) -> ConnectionGuard {
        self.connections.connections.insert(conn_id, peer);
        log::debug!(
            "[conn {conn_id}] registered (total: {})",
            self.connections.count()
        );
        ConnectionGuard {
            conn_id,
            ctx: Arc::clone(self),
        }
    }
}

/// Unregisters the connection when dropped.
struct ConnectionGuard {
    conn_id: u64,
    ctx: Arc<ServerContext>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.ctx.connections.connections.remove(&self.conn_id);
        log::debug!(
            "[conn {}] unregistered (remaining: {})",
            self.conn_id,
            self.ctx.connections.count()
        );
    }
}

pub struct MediaServer {
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_conn_id: AtomicU64,
}

impl MediaServer {
    /// Brings up every configured channel. Channel failures here are
    /// fatal: a server with missing media directories should not start.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let registry = ChannelRegistry::new(&config)?;
        Ok(Self {
            ctx: Arc::new(ServerContext {
                registry,
                config,
                connections: ConnectionTracker::default(),
            }),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Token that stops the accept loop and drains every connection with
    /// a `Maintenance` error.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Binds and serves. Returns after shutdown once live connections
    /// have drained or the grace deadline passes.
    pub async fn run(&self, port: u16) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.run_on(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "listening on {} ({} channels, abr={})",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.ctx.registry.len(),
            self.ctx.config.abr
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let ctx = Arc::clone(&self.ctx);
                    let token = self.shutdown.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, conn_id, ctx, token).await {
                            log::debug!("[conn {conn_id}] ended with error: {e}");
                        }
                    });
                }
            }
        }

        // let connections flush their Maintenance error and Close frames
        self.tracker.close();
        let grace = Duration::from_millis(2 * CLOSE_GRACE_MS);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            log::warn!("shutdown grace period expired with connections still open");
        }
        Ok(())
    }
}

/// Drives one client connection from handshake to close.
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let _guard = ctx.track(conn_id, peer);

    #[cfg(unix)]
    let raw_fd = {
        use std::os::fd::AsRawFd;
        stream.as_raw_fd()
    };

    let mut conn = WsConnection::new(conn_id);

    let upgrade = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_handshake(&mut stream, &mut conn),
    )
    .await
    {
        Ok(Ok(Some(upgrade))) => upgrade,
        Ok(Ok(None)) | Err(_) => return Ok(()),
        Ok(Err(e)) => return Err(e),
    };
    conn.mark_connected();

    log::info!(
        "[conn {conn_id}] open: peer={peer} path={} origin={}",
        upgrade.path,
        upgrade.origin
    );

    if let Ok(hello) = pack(&ServerMessage::Hello {
        channels: ctx.registry.names(),
    }) {
        conn.queue_frame(&Frame::binary(hello));
    }

    let mut session = Session::new(
        conn_id,
        ctx.config.abr.clone(),
        AbrOptions::new(ctx.config.abr_config.clone()),
        MAX_BUFFER_S,
    );

    let (mut rd, mut wr) = stream.split();
    let mut read_chunk = vec![0u8; READ_CHUNK_BYTES];

    let mut tick = tokio::time::interval(Duration::from_millis(DISPATCH_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let idle_timeout = Duration::from_secs(ctx.config.idle_timeout_s);
    let close_grace = Duration::from_millis(CLOSE_GRACE_MS);

    // set when the connection must tear down after the buffer drains
    let mut close_deadline: Option<Instant> = None;
    let mut maintenance_sent = false;

    // a client may pipeline its first frames behind the upgrade request
    if !conn.read_buf.is_empty() {
        match process_incoming(&mut session, &mut conn, &ctx, conn_id) {
            Outcome::Continue => {}
            Outcome::CloseAfterDrain | Outcome::CloseNow => {
                close_deadline = Some(Instant::now() + close_grace);
            }
        }
    }

    loop {
        if let Some(deadline) = close_deadline {
            if conn.send_buffer().is_empty() || Instant::now() >= deadline {
                break;
            }
        }

        // the write future must not borrow `conn`, so the front chunk is
        // cloned out (an Arc bump, not a copy)
        let pending = conn.send_buffer().front().cloned();
        let to_write = pending.as_deref().unwrap_or(&[]);

        tokio::select! {
            biased;

            _ = shutdown.cancelled(), if !maintenance_sent => {
                maintenance_sent = true;
                if let Ok(bytes) = pack(&ServerMessage::Error {
                    init_id: session.init_id(),
                    error: ServerErrorKind::Maintenance,
                }) {
                    conn.queue_frame(&Frame::binary(bytes));
                }
                conn.queue_close();
                close_deadline = Some(Instant::now() + close_grace);
            }

            written = wr.write(to_write), if !to_write.is_empty() => {
                match written {
                    Ok(0) | Err(_) => break,
                    Ok(n) => conn.send_buffer_mut().advance(n),
                }
            }

            read = rd.read(&mut read_chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                conn.read_buf.extend_from_slice(&read_chunk[..n]);

                match process_incoming(&mut session, &mut conn, &ctx, conn_id) {
                    Outcome::Continue => {}
                    Outcome::CloseAfterDrain => {
                        close_deadline = Some(Instant::now() + close_grace);
                    }
                    Outcome::CloseNow => break,
                }
            }

            _ = tick.tick() => {
                if conn.state() != ConnState::Connected {
                    continue;
                }

                if session.last_msg_recv.elapsed() > idle_timeout {
                    log::info!("[conn {conn_id}] idle timeout, closing");
                    conn.queue_close();
                    close_deadline = Some(Instant::now() + close_grace);
                    continue;
                }

                #[cfg(unix)]
                let tcp_info = crate::net::sample_tcp_info(raw_fd).ok();
                #[cfg(not(unix))]
                let tcp_info: Option<crate::net::TcpInfo> = None;

                if let Err(e) =
                    session.dispatch(&mut conn, ctx.config.send_high_watermark, tcp_info)
                {
                    log::warn!("[conn {conn_id}] dispatch failed: {e}");
                    fail_session(&mut conn, &session, e.error_kind());
                    close_deadline = Some(Instant::now() + close_grace);
                    continue;
                }

                // resource exhaustion: shed everything and drop the client
                if conn.buffer_bytes() > ctx.config.send_max {
                    log::warn!(
                        "[conn {conn_id}] send buffer over limit ({} bytes), shedding",
                        conn.buffer_bytes()
                    );
                    conn.clear_buffer();
                    break;
                }
            }
        }
    }

    log::info!("[conn {conn_id}] closed");
    Ok(())
}

/// Reads until a complete HTTP request parses, answering 101 on an
/// accepted upgrade and an error status otherwise. `None` means the
/// client went away or was rejected.
async fn run_handshake(
    stream: &mut TcpStream,
    conn: &mut WsConnection,
) -> std::io::Result<Option<handshake::UpgradeRequest>> {
    let mut chunk = [0u8; 4096];
    loop {
        match handshake::parse_upgrade(&conn.read_buf) {
            Ok(Some((upgrade, consumed))) => {
                conn.read_buf.advance(consumed);
                stream
                    .write_all(handshake::response_101(&upgrade.key).as_bytes())
                    .await?;
                return Ok(Some(upgrade));
            }
            Ok(None) => {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                conn.read_buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                log::debug!("handshake rejected: {e}");
                stream
                    .write_all(handshake::response_error(&e).as_bytes())
                    .await?;
                return Ok(None);
            }
        }
    }
}

/// What the connection loop must do after handling incoming bytes.
enum Outcome {
    Continue,
    CloseAfterDrain,
    CloseNow,
}

/// Parses buffered frames, dispatches complete messages to the session,
/// and translates failures into the teardown the error class calls for.
fn process_incoming(
    session: &mut Session,
    conn: &mut WsConnection,
    ctx: &ServerContext,
    conn_id: u64,
) -> Outcome {
    match conn.process_read() {
        Ok((messages, action)) => {
            for message in messages {
                if let Err(e) = handle_ws_message(session, conn, ctx, message) {
                    log::warn!("[conn {conn_id}] session failed: {e}");
                    fail_session(conn, session, e.error_kind());
                    return Outcome::CloseAfterDrain;
                }
            }
            match action {
                CloseAction::None => Outcome::Continue,
                CloseAction::AfterDrain => Outcome::CloseAfterDrain,
                CloseAction::Now => Outcome::CloseNow,
            }
        }
        Err(e) => {
            log::warn!("[conn {conn_id}] protocol error: {e}");
            conn.queue_close();
            Outcome::CloseAfterDrain
        }
    }
}

/// Unpacks a Binary control message and hands it to the session. Text
/// frames are not part of the protocol.
fn handle_ws_message(
    session: &mut Session,
    conn: &mut WsConnection,
    ctx: &ServerContext,
    message: WsMessage,
) -> Result<(), SessionError> {
    if message.opcode != OpCode::Binary {
        return Err(crate::protocol::ProtocolError::BadLengthPrefix.into());
    }
    let parsed = unpack(&message.payload)?;
    session.handle_message(parsed, &ctx.registry, conn)
}

/// Queues a `server-error` (when the failure maps to one) and a Close.
fn fail_session(conn: &mut WsConnection, session: &Session, kind: Option<ServerErrorKind>) {
    if let Some(error) = kind {
        if let Ok(bytes) = pack(&ServerMessage::Error {
            init_id: session.init_id(),
            error,
        }) {
            conn.queue_frame(&Frame::binary(bytes));
        }
    }
    conn.queue_close();
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::{
        channel_config, make_media_tree, publish, publish_inits, publish_video_ts, VDURATION,
    };
    use bytes::{Bytes, BytesMut};
    use std::path::Path;

    const VDUR: u64 = VDURATION as u64;

    fn server_config(media_dir: &Path) -> ServerConfig {
        ServerConfig {
            media_dir: media_dir.to_path_buf(),
            channels: vec!["abc".to_string()],
            channel_configs: [("abc".to_string(), channel_config())].into_iter().collect(),
            ws_base_port: 0,
            abr: "linear_bba".to_string(),
            abr_config: Default::default(),
            idle_timeout_s: 10,
            send_high_watermark: 2 << 20,
            send_max: 16 << 20,
        }
    }

    /// Publishes enough media for an immediate resume-at-zero start.
    fn seed_media(media_dir: &Path) {
        let config = channel_config();
        make_media_tree(media_dir, "abc", &config);
        let ready = media_dir.join("abc/ready");
        publish_inits(&ready, &config);
        for i in 0..4u64 {
            publish_video_ts(&ready, &config, i * VDUR);
        }
        publish(&ready.join("128k"), "0.chk", b"audio");
    }

    async fn start_server(media_dir: &Path) -> (SocketAddr, CancellationToken) {
        let server = MediaServer::new(server_config(media_dir)).unwrap();
        let token = server.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _ = tokio::spawn(async move { server.run_on(listener).await });
        (addr, token)
    }

    const UPGRADE: &str = "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                           Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                           Origin: https://x\r\n\r\n";

    async fn upgrade(addr: SocketAddr) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(UPGRADE.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        (stream, String::from_utf8(response).unwrap())
    }

    async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = Frame::parse(buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "server closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn client_control(json: serde_json::Value) -> Bytes {
        let body = serde_json::to_vec(&json).unwrap();
        let mut payload = Vec::with_capacity(2 + body.len());
        payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
        payload.extend_from_slice(&body);

        let mut frame = Frame::binary(payload);
        frame.masking_key = Some([0x11, 0x22, 0x33, 0x44]);
        frame.serialize()
    }

    fn control_message(frame: &Frame) -> Option<serde_json::Value> {
        let payload = &frame.payload;
        if payload.len() < 2 {
            return None;
        }
        let declared = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        if declared != payload.len() - 2 {
            return None;
        }
        serde_json::from_slice(&payload[2..]).ok()
    }

    #[tokio::test]
    async fn handshake_returns_rfc6455_accept() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, _token) = start_server(dir.path()).await;

        let (_stream, response) = upgrade(addr).await;
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[tokio::test]
    async fn missing_origin_gets_403() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, _token) = start_server(dir.path()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = UPGRADE.replace("Origin: https://x\r\n", "");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&chunk[..n]);
        }
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 403"));
    }

    #[tokio::test]
    async fn serves_hello_init_and_media() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, _token) = start_server(dir.path()).await;

        let (mut stream, _) = upgrade(addr).await;
        let mut buf = BytesMut::new();

        let hello = read_frame(&mut stream, &mut buf).await;
        let hello = control_message(&hello).expect("server-hello is a control message");
        assert_eq!(hello["type"], "server-hello");
        assert_eq!(hello["channels"][0], "abc");

        let init = serde_json::json!({
            "type": "client-init", "initId": 1, "channel": "abc",
            "sessionKey": "", "userName": "t", "os": "linux", "browser": "ff",
            "screenWidth": 1280, "screenHeight": 720, "nextVts": 0,
        });
        stream.write_all(&client_control(init)).await.unwrap();

        let frame = read_frame(&mut stream, &mut buf).await;
        let server_init = control_message(&frame).expect("server-init");
        assert_eq!(server_init["type"], "server-init");
        assert_eq!(server_init["initVideoTimestamp"], 0);
        assert_eq!(server_init["canResume"], true);
        assert_eq!(server_init["initId"], 1);

        // a server-video control message then its media bytes
        let frame = read_frame(&mut stream, &mut buf).await;
        let video = control_message(&frame).expect("server-video");
        assert_eq!(video["type"], "server-video");
        assert_eq!(video["timestamp"], 0);
        let total = video["totalByteLength"].as_u64().unwrap();

        let mut received = 0;
        while received < total {
            let media = read_frame(&mut stream, &mut buf).await;
            assert_eq!(media.opcode, OpCode::Binary);
            assert!(control_message(&media).is_none(), "expected raw media bytes");
            received += media.payload.len() as u64;
        }
        assert_eq!(received, total);
    }

    #[tokio::test]
    async fn unknown_channel_gets_reinit_error_and_close() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, _token) = start_server(dir.path()).await;

        let (mut stream, _) = upgrade(addr).await;
        let mut buf = BytesMut::new();
        let _hello = read_frame(&mut stream, &mut buf).await;

        let init = serde_json::json!({
            "type": "client-init", "initId": 2, "channel": "nope",
            "screenWidth": 1280, "screenHeight": 720,
        });
        stream.write_all(&client_control(init)).await.unwrap();

        let frame = read_frame(&mut stream, &mut buf).await;
        let error = control_message(&frame).expect("server-error");
        assert_eq!(error["type"], "server-error");
        assert_eq!(error["error"], "reinit");

        let close = read_frame(&mut stream, &mut buf).await;
        assert_eq!(close.opcode, OpCode::Close);
    }

    #[tokio::test]
    async fn shutdown_broadcasts_maintenance() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, token) = start_server(dir.path()).await;

        let (mut stream, _) = upgrade(addr).await;
        let mut buf = BytesMut::new();
        let _hello = read_frame(&mut stream, &mut buf).await;

        token.cancel();

        let frame = read_frame(&mut stream, &mut buf).await;
        let error = control_message(&frame).expect("server-error");
        assert_eq!(error["type"], "server-error");
        assert_eq!(error["error"], "maintenance");

        let close = read_frame(&mut stream, &mut buf).await;
        assert_eq!(close.opcode, OpCode::Close);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let dir = tempfile::tempdir().unwrap();
        seed_media(dir.path());
        let (addr, _token) = start_server(dir.path()).await;

        let (mut stream, _) = upgrade(addr).await;
        let mut buf = BytesMut::new();
        let _hello = read_frame(&mut stream, &mut buf).await;

        let mut ping = Frame::new(true, OpCode::Ping, &b"hb"[..]);
        ping.masking_key = Some([9, 9, 9, 9]);
        stream.write_all(&ping.serialize()).await.unwrap();

        let frame = read_frame(&mut stream, &mut buf).await;
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(frame.payload, Bytes::from_static(b"hb"));
    }
}
