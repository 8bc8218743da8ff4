use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

const TRANSPORT_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("transport closed")]
    Closed,
}

/// Notifications from one open transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(TransportError),
    Closed,
}

/// One live connection. Dropping `outgoing` asks the transport to close.
#[derive(Debug)]
pub struct Transport {
    pub incoming: mpsc::Receiver<TransportEvent>,
    pub outgoing: mpsc::Sender<String>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let (mut sink, mut stream) = ws.split();
            let (event_tx, event_rx) = mpsc::channel(TRANSPORT_QUEUE);
            let (out_tx, mut out_rx) = mpsc::channel::<String>(TRANSPORT_QUEUE);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        inbound = stream.next() => {
                            let event = match inbound {
                                Some(Ok(Message::Text(text))) => TransportEvent::Message(text),
                                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                    Ok(text) => TransportEvent::Message(text),
                                    Err(err) => {
                                        warn!(event = "ws_binary_frame_dropped", error = %err);
                                        continue;
                                    }
                                },
                                Some(Ok(Message::Close(_))) | None => {
                                    let _ = event_tx.send(TransportEvent::Closed).await;
                                    break;
                                }
                                Some(Ok(_)) => continue,
                                Some(Err(err)) => {
                                    let error = TransportError::Socket(err.to_string());
                                    let _ = event_tx.send(TransportEvent::Error(error)).await;
                                    let _ = event_tx.send(TransportEvent::Closed).await;
                                    break;
                                }
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        outbound = out_rx.recv() => {
                            match outbound {
                                Some(text) => {
                                    if let Err(err) = sink.send(Message::Text(text)).await {
                                        warn!(event = "ws_send_error", error = %err);
                                    }
                                }
                                None => {
                                    debug!(event = "ws_close_requested");
                                    let _ = sink.close().await;
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            Ok(Transport {
                incoming: event_rx,
                outgoing: out_tx,
            })
        })
    }
}

/// The far side of a [`ChannelConnector`] transport: inject events, observe sends.
#[derive(Debug)]
pub struct RemoteEnd {
    pub events: mpsc::Sender<TransportEvent>,
    pub sent: mpsc::Receiver<String>,
}

impl RemoteEnd {
    pub async fn deliver(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Message(text.into()))
            .await
            .is_ok()
    }

    pub async fn close(&self) -> bool {
        self.events.send(TransportEvent::Closed).await.is_ok()
    }
}

#[derive(Debug)]
enum Scripted {
    Ready(Transport),
    Fail(TransportError),
    Stall,
}

#[derive(Debug, Default)]
struct ChannelState {
    scripted: VecDeque<Scripted>,
    attempts: Vec<Url>,
}

/// In-memory connector. Each connect attempt consumes the next scripted
/// outcome; an empty script fails the attempt.
#[derive(Debug, Clone, Default)]
pub struct ChannelConnector {
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_transport(&self) -> RemoteEnd {
        let (event_tx, event_rx) = mpsc::channel(TRANSPORT_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(TRANSPORT_QUEUE);
        self.lock().scripted.push_back(Scripted::Ready(Transport {
            incoming: event_rx,
            outgoing: out_tx,
        }));
        RemoteEnd {
            events: event_tx,
            sent: out_rx,
        }
    }

    pub fn push_failure(&self, reason: impl Into<String>) {
        self.lock()
            .scripted
            .push_back(Scripted::Fail(TransportError::Connect(reason.into())));
    }

    /// Scripts an attempt that never completes.
    pub fn push_stall(&self) {
        self.lock().scripted.push_back(Scripted::Stall);
    }

    pub fn attempts(&self) -> usize {
        self.lock().attempts.len()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connector for ChannelConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let outcome = {
            let mut state = self.lock();
            state.attempts.push(url.clone());
            state.scripted.pop_front()
        };
        Box::pin(async move {
            match outcome {
                Some(Scripted::Ready(transport)) => Ok(transport),
                Some(Scripted::Fail(err)) => Err(err),
                Some(Scripted::Stall) => future::pending().await,
                None => Err(TransportError::Connect("no transport available".to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://127.0.0.1:3456/ws").expect("valid url")
    }

    #[tokio::test]
    async fn channel_connector_replays_script_in_order() {
        let connector = ChannelConnector::new();
        connector.push_failure("refused");
        let remote = connector.push_transport();

        let first = connector.connect(&url()).await;
        assert_eq!(
            first.err(),
            Some(TransportError::Connect("refused".to_string()))
        );

        let mut transport = connector.connect(&url()).await.expect("scripted transport");
        assert!(remote.deliver("hello").await);
        assert_eq!(
            transport.incoming.recv().await,
            Some(TransportEvent::Message("hello".to_string()))
        );

        assert!(connector.connect(&url()).await.is_err());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn channel_transport_exposes_outbound_text() {
        let connector = ChannelConnector::new();
        let mut remote = connector.push_transport();
        let transport = connector.connect(&url()).await.expect("scripted transport");

        transport
            .outgoing
            .send("ping".to_string())
            .await
            .expect("send outbound");
        assert_eq!(remote.sent.recv().await.as_deref(), Some("ping"));

        drop(transport);
        assert_eq!(remote.sent.recv().await, None);
    }
}
