//! WebSocket transport with automatic reconnect.
//!
//! A single supervisor task owns the socket. It connects, pumps frames in
//! both directions, and on failure backs off and tries again until
//! `max_reconnect_attempts` is exhausted. Decoded inbound messages from every
//! session go out on one multiplexed channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use oppi_protocol::{ClientMessage, ServerMessage, codec};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::reconnect_delay;
use super::{ConnectionStatus, SendPolicy, Transport, wait_until_connected};
use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub send: SendPolicy,
    /// Exponential base, in seconds.
    pub reconnect_base: f64,
    pub reconnect_max_delay: Duration,
    /// Give up and report `Disconnected` after this many failed attempts.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub inbound_buffer: usize,
}

impl WsSettings {
    /// URL with the query string stripped, for logging.
    fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

struct Shared {
    settings: WsSettings,
    status: watch::Sender<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    inbound: mpsc::Sender<ServerMessage>,
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct WsTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl WsTransport {
    /// Create the transport and the receiving end of its inbound stream.
    pub fn new(settings: WsSettings) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_buffer.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let transport = Arc::new(Self {
            shared: Arc::new(Shared {
                settings,
                status: status_tx,
                outbound: Mutex::new(None),
                inbound: inbound_tx,
            }),
            supervisor: Mutex::new(None),
        });
        (transport, inbound_rx)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(running) = supervisor.as_ref()
            && !running.handle.is_finished()
        {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        self.shared.status.send_replace(ConnectionStatus::Connecting);
        let handle = tokio::spawn(run_supervisor(Arc::clone(&self.shared), cancel.clone()));
        *supervisor = Some(Supervisor { cancel, handle });
        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let policy = &self.shared.settings.send;
        wait_until_connected(&self.shared.status.subscribe(), policy).await?;

        let text = codec::encode(message)?;
        let sender = self
            .shared
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        match time::timeout(policy.send_timeout, sender.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {
                debug!(
                    command = message.command_name(),
                    request_id = message.request_id(),
                    "queued outbound message"
                );
                Ok(())
            }
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::SendTimeout(policy.send_timeout)),
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                warn!(error = %e, "websocket supervisor ended abnormally");
            }
        }
        *self.shared.outbound.lock().await = None;
        self.shared.status.send_replace(ConnectionStatus::Disconnected);
    }
}

async fn run_supervisor(shared: Arc<Shared>, cancel: CancellationToken) {
    let settings = &shared.settings;
    let mut attempt: u32 = 0;

    loop {
        debug!(url = settings.redacted_url(), attempt, "connecting to websocket");

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = time::timeout(CONNECT_TIMEOUT, connect_async(settings.url.as_str())) => result,
        };

        match connected {
            Ok(Ok((stream, _))) => {
                info!(url = settings.redacted_url(), "websocket connected");
                attempt = 0;
                let reason = run_connection(&shared, stream, &cancel).await;
                *shared.outbound.lock().await = None;
                if cancel.is_cancelled() {
                    break;
                }
                warn!(reason, "websocket connection lost");
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "websocket connection failed");
            }
            Err(_) => {
                warn!(
                    attempt,
                    "websocket connect timed out ({}s)",
                    CONNECT_TIMEOUT.as_secs()
                );
            }
        }

        attempt += 1;
        if let Some(max) = settings.max_reconnect_attempts
            && attempt > max
        {
            warn!(attempts = max, "giving up on websocket reconnect");
            break;
        }

        shared
            .status
            .send_replace(ConnectionStatus::Reconnecting { attempt });
        let delay = reconnect_delay(attempt, settings.reconnect_base, settings.reconnect_max_delay);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
        shared.status.send_replace(ConnectionStatus::Connecting);
    }

    *shared.outbound.lock().await = None;
    shared.status.send_replace(ConnectionStatus::Disconnected);
}

/// Pump one live socket until it closes. Returns a short reason.
async fn run_connection(
    shared: &Shared,
    stream: WsStream,
    cancel: &CancellationToken,
) -> &'static str {
    let (mut write, mut read) = stream.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    *shared.outbound.lock().await = Some(send_tx);
    shared.status.send_replace(ConnectionStatus::Connected);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return "cancelled";
            }
            outbound = send_rx.recv() => {
                let Some(msg) = outbound else {
                    return "outbound channel closed";
                };
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "websocket write failed");
                    return "write failed";
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match codec::decode(text.as_str()) {
                            Ok(message) => {
                                if shared.inbound.send(message).await.is_err() {
                                    return "inbound receiver dropped";
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return "pong failed";
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by server",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        return "read failed";
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> WsSettings {
        WsSettings {
            url: url.to_string(),
            send: SendPolicy {
                wait_timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
                send_timeout: Duration::from_millis(50),
            },
            reconnect_base: 1.01,
            reconnect_max_delay: Duration::from_millis(20),
            max_reconnect_attempts: Some(1),
            inbound_buffer: 8,
        }
    }

    #[test]
    fn test_redacted_url() {
        let s = settings("wss://host:1/stream?token=secret");
        assert_eq!(s.redacted_url(), "wss://host:1/stream");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (transport, _rx) = WsTransport::new(settings("ws://127.0.0.1:9/stream"));
        let err = transport
            .send(&ClientMessage::GetState {
                session_id: None,
                request_id: "r1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Port 9 (discard) is not listening on test hosts.
        let (transport, _rx) = WsTransport::new(settings("ws://127.0.0.1:9/stream"));
        let mut status = transport.status();
        transport.connect().await.unwrap();

        let ended = time::timeout(Duration::from_secs(10), async {
            loop {
                if *status.borrow_and_update() == ConnectionStatus::Disconnected {
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        transport.disconnect().await;
    }
}
