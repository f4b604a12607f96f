//! Transmission channel manager
//!
//! Maintains at most one duplex connection attempt per session:
//! `Disconnected -> Connecting -> Connected -> Lost`, where `Lost` is
//! terminal. There is deliberately no automatic reconnect: a lost
//! connection is fatal for the session and the user restarts explicitly.
//! (Open question for production whether this should differ; the behavior
//! is preserved as-is.) When no duplex link was ever established, answers
//! travel over the single-shot fallback call instead (`api` module).

use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::protocol::ChannelMessage;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection state of the duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection closed after being established. Terminal.
    Lost,
}

/// What the transport reader surfaces to the manager.
#[derive(Debug)]
pub enum DuplexEvent {
    Message(ChannelMessage),
    /// The connection's own close/error signal.
    Closed(String),
}

/// An established duplex link: a sender for outbound messages and the
/// ordered stream of inbound events.
pub struct DuplexLink {
    pub outbound: UnboundedSender<ChannelMessage>,
    pub inbound: UnboundedReceiver<DuplexEvent>,
}

/// Capability interface over the duplex transport, so the manager is
/// testable against an in-memory pair.
pub trait DuplexConnector: Send + Sync {
    fn connect(&self, url: &str) -> impl std::future::Future<Output = Result<DuplexLink>> + Send;
}

pub struct ChannelManager<C> {
    connector: C,
    state: ChannelState,
    outbound: Option<UnboundedSender<ChannelMessage>>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl<C: DuplexConnector> ChannelManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            state: ChannelState::Disconnected,
            outbound: None,
            pump: None,
            heartbeat: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Connect the duplex channel. Idempotent: an attempt already in flight
    /// or an open connection short-circuits; a lost connection never
    /// reconnects.
    pub async fn connect(
        &mut self,
        url: &str,
        heartbeat_interval: Duration,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<()> {
        match self.state {
            ChannelState::Connecting | ChannelState::Connected => return Ok(()),
            ChannelState::Lost => return Err(SessionError::ChannelLost),
            ChannelState::Disconnected => {}
        }

        self.state = ChannelState::Connecting;
        info!("connecting duplex channel: {}", url);

        let link = match self.connector.connect(url).await {
            Ok(link) => link,
            Err(e) => {
                // Never-established is not Lost: the session proceeds on the
                // fallback path.
                self.state = ChannelState::Disconnected;
                return Err(e);
            }
        };

        self.pump = Some(tokio::spawn(pump_inbound(link.inbound, events)));

        // Heartbeat runs only while connected; its failures surface through
        // the connection's own close signal, not a separate timeout.
        let hb_tx = link.outbound.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                if hb_tx.send(ChannelMessage::ping()).is_err() {
                    break;
                }
            }
        }));

        self.outbound = Some(link.outbound);
        self.state = ChannelState::Connected;
        info!("duplex channel connected");
        Ok(())
    }

    /// Publish a message on the duplex channel. Rejected with `ChannelLost`
    /// once the connection has gone away; never silently retried.
    pub fn send(&mut self, msg: ChannelMessage) -> Result<()> {
        match self.state {
            ChannelState::Connected => {
                let tx = self.outbound.as_ref().ok_or(SessionError::ChannelLost)?;
                if tx.send(msg).is_err() {
                    self.mark_lost();
                    return Err(SessionError::ChannelLost);
                }
                Ok(())
            }
            ChannelState::Lost => Err(SessionError::ChannelLost),
            _ => Err(SessionError::Other("duplex channel not connected".into())),
        }
    }

    /// Record that the connection's close/error signal was observed.
    /// Idempotent; the state is terminal afterwards.
    pub fn mark_lost(&mut self) {
        if matches!(self.state, ChannelState::Connected | ChannelState::Connecting) {
            warn!("duplex channel lost (no reconnect; session must be restarted)");
            self.state = ChannelState::Lost;
        }
        if let Some(hb) = self.heartbeat.take() {
            hb.abort();
        }
        self.outbound = None;
    }

    /// Session teardown: stop the pump and heartbeat, drop the link.
    /// Idempotent; cancelling an already-closed channel is a no-op.
    pub fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(hb) = self.heartbeat.take() {
            hb.abort();
        }
        self.outbound = None;
        if self.state == ChannelState::Connected {
            self.state = ChannelState::Lost;
        }
    }
}

/// Forward inbound duplex events onto the session queue, strictly in
/// arrival order. Question dedup is the orchestrator's job, not ours.
async fn pump_inbound(
    mut inbound: UnboundedReceiver<DuplexEvent>,
    events: UnboundedSender<SessionEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            DuplexEvent::Message(ChannelMessage::Question { data, .. }) => {
                let text = data.and_then(|d| d.question);
                if events
                    .send(SessionEvent::Question {
                        text,
                        evaluation: None,
                    })
                    .is_err()
                {
                    break;
                }
            }
            DuplexEvent::Message(ChannelMessage::Pong { ts }) => {
                debug!("heartbeat pong (ts={:?})", ts);
            }
            DuplexEvent::Message(ChannelMessage::Error { message, .. }) => {
                // Server-side turn failure: surfaced, session lives.
                warn!("server error on duplex channel: {:?}", message);
            }
            DuplexEvent::Message(ChannelMessage::Warning { message }) => {
                warn!("server warning: {:?}", message);
            }
            DuplexEvent::Message(other) => {
                debug!("ignoring duplex message: {:?}", other);
            }
            DuplexEvent::Closed(reason) => {
                let _ = events.send(SessionEvent::ChannelDown(reason));
                break;
            }
        }
    }
}

/// Production transport: a WebSocket split into a writer task draining the
/// outbound queue and a reader task surfacing ordered inbound events.
pub struct WsConnector;

impl DuplexConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<DuplexLink> {
        let (ws, resp) = connect_async(url).await?;
        debug!("WebSocket handshake response: {:?}", resp.status());

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<DuplexEvent>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("WebSocket send failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ChannelMessage>(&text) {
                            Ok(msg) => {
                                if in_tx.send(DuplexEvent::Message(msg)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                // Malformed message: logged, the turn fails,
                                // the session is not torn down.
                                warn!("malformed duplex message: {} ({})", e, text);
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed".to_string());
                        let _ = in_tx.send(DuplexEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => {} // protocol-level ping/pong/binary
                    Err(e) => {
                        let _ = in_tx.send(DuplexEvent::Closed(e.to_string()));
                        return;
                    }
                }
            }
            let _ = in_tx.send(DuplexEvent::Closed("connection ended".to_string()));
        });

        Ok(DuplexLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type LinkEnds = (UnboundedReceiver<ChannelMessage>, UnboundedSender<DuplexEvent>);

    /// Connector handing out in-memory link ends the test can drive.
    struct FakeConnector {
        attempts: AtomicU32,
        ends: Mutex<Vec<LinkEnds>>,
        fail: bool,
    }

    impl FakeConnector {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                ends: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn take_ends(&self) -> LinkEnds {
            self.ends.lock().unwrap().pop().unwrap()
        }
    }

    impl DuplexConnector for Arc<FakeConnector> {
        async fn connect(&self, _url: &str) -> Result<DuplexLink> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::Other("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.ends.lock().unwrap().push((out_rx, in_tx));
            Ok(DuplexLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let connector = FakeConnector::new(false);
        let mut manager = ChannelManager::new(connector.clone());
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();

        manager
            .connect("ws://test", Duration::from_secs(30), ev_tx.clone())
            .await
            .unwrap();
        manager
            .connect("ws://test", Duration::from_secs(30), ev_tx)
            .await
            .unwrap();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected_not_lost() {
        let connector = FakeConnector::new(true);
        let mut manager = ChannelManager::new(connector);
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();

        assert!(manager
            .connect("ws://test", Duration::from_secs(30), ev_tx)
            .await
            .is_err());
        assert_eq!(manager.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn send_publishes_while_connected() {
        let connector = FakeConnector::new(false);
        let mut manager = ChannelManager::new(connector.clone());
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        manager
            .connect("ws://test", Duration::from_secs(30), ev_tx)
            .await
            .unwrap();

        let (mut out_rx, _in_tx) = connector.take_ends();
        manager.send(ChannelMessage::answer("hello")).unwrap();

        match out_rx.recv().await.unwrap() {
            ChannelMessage::Answer { message, .. } => assert_eq!(message, "hello"),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends_with_channel_lost() {
        let connector = FakeConnector::new(false);
        let mut manager = ChannelManager::new(connector.clone());
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        manager
            .connect("ws://test", Duration::from_secs(30), ev_tx)
            .await
            .unwrap();

        let (_out_rx, in_tx) = connector.take_ends();
        in_tx
            .send(DuplexEvent::Closed("server went away".into()))
            .unwrap();

        // The pump surfaces the close on the session queue...
        match ev_rx.recv().await.unwrap() {
            SessionEvent::ChannelDown(reason) => assert_eq!(reason, "server went away"),
            other => panic!("expected ChannelDown, got {:?}", other),
        }

        // ...and once observed, the channel is terminally lost.
        manager.mark_lost();
        assert_eq!(manager.state(), ChannelState::Lost);
        assert!(matches!(
            manager.send(ChannelMessage::answer("late")),
            Err(SessionError::ChannelLost)
        ));
        assert!(matches!(
            manager
                .connect("ws://test", Duration::from_secs(30), mpsc::unbounded_channel().0)
                .await,
            Err(SessionError::ChannelLost)
        ));
    }

    #[tokio::test]
    async fn inbound_questions_arrive_in_order() {
        let connector = FakeConnector::new(false);
        let mut manager = ChannelManager::new(connector.clone());
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        manager
            .connect("ws://test", Duration::from_secs(30), ev_tx)
            .await
            .unwrap();

        let (_out_rx, in_tx) = connector.take_ends();
        for q in ["one", "two", "three"] {
            in_tx
                .send(DuplexEvent::Message(ChannelMessage::Question {
                    data: Some(crate::protocol::QuestionPayload {
                        question: Some(q.to_string()),
                    }),
                    timestamp: None,
                }))
                .unwrap();
        }

        for expected in ["one", "two", "three"] {
            match ev_rx.recv().await.unwrap() {
                SessionEvent::Question { text, .. } => assert_eq!(text.as_deref(), Some(expected)),
                other => panic!("expected question, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_pings_while_connected() {
        let connector = FakeConnector::new(false);
        let mut manager = ChannelManager::new(connector.clone());
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        manager
            .connect("ws://test", Duration::from_millis(10), ev_tx)
            .await
            .unwrap();

        let (mut out_rx, _in_tx) = connector.take_ends();
        let mut pings = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(80);
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, out_rx.recv()).await {
            if matches!(msg, ChannelMessage::Ping { .. }) {
                pings += 1;
                if pings >= 3 {
                    break;
                }
            }
        }
        assert!(pings >= 3);

        manager.shutdown();
        manager.shutdown(); // idempotent
    }
}
