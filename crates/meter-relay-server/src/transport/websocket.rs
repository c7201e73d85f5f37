//! WebSocket listener using tokio-tungstenite, with optional TLS.
//!
//! Each accepted socket is split: a writer task owns the sink and drains the
//! connection's outbound queue, while the read loop decodes client frames and
//! hands them to a [`ClientLink`].

use crate::auth::UpgradeGuard;
use crate::gateway::{ClientLink, Gateway, LinkFlow};
use crate::session::Outbound;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meter_relay_core::{decode, encode, RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Byte stream under a client WebSocket: plain TCP or TLS.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

pub type ClientSocket = WebSocketStream<Box<dyn ClientIo>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: ClientSocket,
    pub remote_addr: SocketAddr,
}

/// Listener settings.
#[derive(Clone)]
pub struct ListenerOptions {
    pub tls: Option<TlsAcceptor>,
    pub guard: Arc<UpgradeGuard>,
    pub max_frame_bytes: usize,
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub max_frame_bytes: usize,
    pub outbound_buffer: usize,
    /// How long to wait for the writer to flush after the read side ends.
    pub close_grace: Duration,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop stops when the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    options: ListenerOptions,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, tls = options.tls.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, &options).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "listener closed, dropping connection");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(stream: TcpStream, options: &ListenerOptions) -> RelayResult<ClientSocket> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let io: Box<dyn ClientIo> = match &options.tls {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .map_err(|e| RelayError::Transport(format!("TLS handshake failed: {e}")))?,
        ),
        None => Box::new(stream),
    };

    let guard = options.guard.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match guard.check(request) {
            Ok(()) => Ok(response),
            Err((status, reason)) => {
                warn!(uri = %request.uri(), status = status.as_u16(), reason, "upgrade rejected");
                let mut rejection = ErrorResponse::new(Some(reason.to_string()));
                *rejection.status_mut() = status;
                Err(rejection)
            }
        }
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(options.max_frame_bytes);
    config.max_frame_size = Some(options.max_frame_bytes);

    tokio_tungstenite::accept_hdr_async_with_config(io, callback, Some(config))
        .await
        .map_err(|e| RelayError::Transport(format!("WS upgrade failed: {e}")))
}

/// Run one client connection until either side closes it.
pub async fn serve_connection(
    conn: WebSocketConnection,
    gateway: Arc<Gateway>,
    options: ConnectionOptions,
) {
    let WebSocketConnection {
        ws_stream,
        remote_addr,
    } = conn;
    info!(remote = %remote_addr, "client connected");

    let (sink, mut stream) = ws_stream.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_buffer);
    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, remote_addr));
    let mut writer_done = false;
    let mut link = ClientLink::new(gateway, outbound_tx, remote_addr.to_string());

    loop {
        let message = tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            message = stream.next() => message,
        };
        let flow = match message {
            Some(Ok(Message::Text(text))) => {
                handle_payload(&mut link, text.as_bytes(), options.max_frame_bytes).await
            }
            Some(Ok(Message::Binary(data))) => {
                handle_payload(&mut link, &data, options.max_frame_bytes).await
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(remote = %remote_addr, "client closed transport");
                break;
            }
            // Pings are answered by tungstenite.
            Some(Ok(_)) => LinkFlow::Continue,
            Some(Err(e)) => {
                debug!(remote = %remote_addr, error = %e, "WebSocket read failed");
                break;
            }
        };
        if flow == LinkFlow::Close {
            break;
        }
    }

    link.on_transport_closed();
    drop(link);

    if !writer_done && tokio::time::timeout(options.close_grace, &mut writer).await.is_err() {
        debug!(remote = %remote_addr, "writer did not finish, aborting");
        writer.abort();
    }
    info!(remote = %remote_addr, "client disconnected");
}

async fn handle_payload(link: &mut ClientLink, data: &[u8], max_frame_bytes: usize) -> LinkFlow {
    if data.len() > max_frame_bytes {
        return link
            .on_decode_error(RelayError::Codec(format!(
                "frame of {} bytes exceeds limit of {max_frame_bytes}",
                data.len()
            )))
            .await;
    }
    match decode(data) {
        Ok(frame) => link.on_frame(frame).await,
        Err(e) => link.on_decode_error(e).await,
    }
}

/// Sole writer of the client sink. Frames go out in queue order.
async fn write_loop(
    mut sink: SplitSink<ClientSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    remote_addr: SocketAddr,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let text = match encode(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(remote = %remote_addr, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(remote = %remote_addr, error = %e, "WebSocket send failed");
                    return;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewaySettings;
    use crate::testing::{eventually, test_gateway, wait_drained, MockBehavior, MockConnector};
    use meter_relay_core::Frame;
    use tokio_tungstenite::tungstenite::Error as WsError;

    async fn start(guard: UpgradeGuard) -> (SocketAddr, Arc<MockConnector>, Arc<Gateway>) {
        let connector = Arc::new(MockConnector::new());
        let gateway = test_gateway(connector.clone(), GatewaySettings::default());
        let options = ListenerOptions {
            tls: None,
            guard: Arc::new(guard),
            max_frame_bytes: 4096,
        };
        let (addr, mut rx) = start_listener("127.0.0.1:0".parse().unwrap(), options)
            .await
            .unwrap();
        let conn_options = ConnectionOptions {
            max_frame_bytes: 4096,
            outbound_buffer: 64,
            close_grace: Duration::from_secs(1),
        };
        let serving = gateway.clone();
        tokio::spawn(async move {
            while let Some(conn) = rx.recv().await {
                tokio::spawn(serve_connection(conn, serving.clone(), conn_options));
            }
        });
        (addr, connector, gateway)
    }

    async fn recv_frame<S>(ws: &mut WebSocketStream<S>) -> Option<Frame>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame");
            match message {
                Some(Ok(Message::Text(text))) => return Some(decode(text.as_bytes()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send_json<S>(ws: &mut WebSocketStream<S>, json: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        ws.send(Message::Text(json.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_over_websocket() {
        let (addr, connector, _) = start(UpgradeGuard::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .unwrap();

        send_json(&mut ws, r#"{"type":"connect","meterId":"M-001","port":9001,"userId":"op-1"}"#).await;
        assert_eq!(recv_frame(&mut ws).await, Some(Frame::Connected));

        send_json(&mut ws, r#"{"type":"input","data":"ls\n"}"#).await;
        assert_eq!(
            recv_frame(&mut ws).await,
            Some(Frame::Output { data: "ls\n".into() })
        );

        send_json(&mut ws, r#"{"type":"resize","rows":40,"cols":120}"#).await;
        send_json(&mut ws, r#"{"type":"disconnect"}"#).await;
        let device = connector.device("M-001");
        eventually(|| device.close_count() == 1).await;
        assert_eq!(device.resizes(), vec![(40, 120)]);
    }

    #[tokio::test]
    async fn stalled_device_released_by_disconnect_and_close() {
        let (addr, connector, gateway) = start(UpgradeGuard::default()).await;
        connector.set("M-001", MockBehavior::StallWrites);
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .unwrap();

        send_json(&mut ws, r#"{"type":"connect","meterId":"M-001","userId":"op-1"}"#).await;
        assert_eq!(recv_frame(&mut ws).await, Some(Frame::Connected));
        for i in 0..100 {
            send_json(&mut ws, &format!(r#"{{"type":"input","data":"line-{i}\n"}}"#)).await;
        }
        send_json(&mut ws, r#"{"type":"disconnect"}"#).await;
        let _ = ws.close(None).await;

        let device = connector.device("M-001");
        eventually(|| device.close_count() == 1).await;
        wait_drained(&gateway).await;
        assert!(device.writes().len() <= 1);
    }

    #[tokio::test]
    async fn malformed_json_closes_transport() {
        let (addr, _, _) = start(UpgradeGuard::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .unwrap();

        send_json(&mut ws, "{not json").await;
        assert_eq!(recv_frame(&mut ws).await, Some(Frame::error("malformed frame")));
        assert_eq!(recv_frame(&mut ws).await, None);
    }

    #[tokio::test]
    async fn unknown_meter_keeps_transport_open() {
        let (addr, _, _) = start(UpgradeGuard::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .unwrap();

        send_json(&mut ws, r#"{"type":"connect","meterId":"M-404","userId":"op-1"}"#).await;
        assert_eq!(
            recv_frame(&mut ws).await,
            Some(Frame::error("meter M-404 is not online"))
        );
        send_json(&mut ws, r#"{"type":"connect","meterId":"M-002","userId":"op-1"}"#).await;
        assert_eq!(recv_frame(&mut ws).await, Some(Frame::Connected));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (addr, _, _) = start(UpgradeGuard::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .unwrap();

        let big = format!(r#"{{"type":"input","data":"{}"}}"#, "x".repeat(8192));
        let _ = ws.send(Message::Text(big.into())).await;
        // The server either answers with an error frame or drops the socket.
        match recv_frame(&mut ws).await {
            Some(Frame::Error { .. }) | None => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrade_guard_rejects_bad_token() {
        let (addr, _, _) = start(UpgradeGuard::new(Some("s3cret".into()), Vec::new())).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal?token=nope"))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("unexpected {other:?}"),
        }

        let ok = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal?token=s3cret")).await;
        assert!(ok.is_ok());
    }
}
