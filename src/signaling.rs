//! Сигнальный канал: один WebSocket на попытку звонка, по одному JSON
//! объекту на сообщение.
//!
//! Входящие конверты складываются в `mpsc` очередь в порядке прихода, так что
//! потребитель (машина состояний) обрабатывает их строго последовательно.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::peer::types::IceCandidate;
use crate::session::SessionId;

/// Сигнальный конверт
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    /// Инициатор завершает сессию; сервер рассылает `session-completed`
    EndSession,
    SessionCompleted,
    /// Всё, что мы не понимаем (например `recording-status`)
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
            Envelope::EndSession => "end-session",
            Envelope::SessionCompleted => "session-completed",
            Envelope::Unknown => "unknown",
        }
    }
}

/// Что сигнальный канал сообщает потребителю
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Envelope(Envelope),
    /// Транспорт закрылся сам (не через `close()`): терминально для звонка
    Closed(Option<String>),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

pub struct SignalingChannel {
    session: SessionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Открывает WebSocket к `{base_url}/ws/signaling/{session}/`
    pub async fn connect(base_url: &str, session: SessionId) -> Result<(Self, ChannelEvents)> {
        let url = session.signaling_endpoint(base_url);
        info!(%url, "Connecting to signaling server");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn({
            let open = open.clone();
            let in_tx = in_tx.clone();
            async move {
                while let Some(env) = out_rx.recv().await {
                    let text = match serde_json::to_string(&env) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} envelope: {e}", env.label());
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        warn!("Signaling send failed: {e}");
                        if open.swap(false, Ordering::SeqCst) {
                            let _ = in_tx.send(ChannelEvent::Closed(Some(e.to_string())));
                        }
                        return;
                    }
                }
                // очередь закрыта через close()
                let _ = ws_tx.close().await;
            }
        });

        let reader = tokio::spawn({
            let open = open.clone();
            async move {
                let reason = loop {
                    match ws_rx.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text)
                        {
                            Ok(env) => {
                                debug!("Received signaling message: {}", env.label());
                                if in_tx.send(ChannelEvent::Envelope(env)).is_err() {
                                    break None;
                                }
                            }
                            Err(e) => warn!("Invalid signaling message {text:?}: {e}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break Some(frame.map_or_else(
                                || "closed by server".to_string(),
                                |f| f.reason.to_string(),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("connection reset".to_string()),
                    }
                };
                if open.swap(false, Ordering::SeqCst) {
                    info!("Signaling transport closed: {:?}", reason);
                    let _ = in_tx.send(ChannelEvent::Closed(reason));
                }
            }
        });

        let channel = SignalingChannel {
            session,
            outbound: Mutex::new(Some(out_tx)),
            open,
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok((channel, in_rx))
    }

    /// Канал без сети: всё отправленное попадает в `MemoryRemote::outbound`,
    /// а входящие события подаются через `MemoryRemote::deliver`.
    pub fn in_memory(session: SessionId) -> (Self, ChannelEvents, MemoryRemote) {
        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel {
            session,
            outbound: Mutex::new(Some(out_tx)),
            open: open.clone(),
            tasks: Mutex::new(Vec::new()),
        };
        let remote = MemoryRemote {
            outbound: out_rx,
            inbound: in_tx,
            open,
        };
        (channel, in_rx, remote)
    }

    /// Два связанных канала, как их видят ментор и ученик через сервер:
    /// `end-session` превращается в `session-completed` для обоих.
    pub fn loopback_pair(session: SessionId) -> ((Self, ChannelEvents), (Self, ChannelEvents)) {
        let (a, a_rx, a_remote) = Self::in_memory(session.clone());
        let (b, b_rx, b_remote) = Self::in_memory(session);
        let relay_ab = relay(a_remote.outbound, a_remote.inbound.clone(), b_remote.inbound.clone());
        let relay_ba = relay(b_remote.outbound, b_remote.inbound, a_remote.inbound);
        a.tasks.lock().map(|mut t| t.push(relay_ab)).ok();
        b.tasks.lock().map(|mut t| t.push(relay_ba)).ok();
        ((a, a_rx), (b, b_rx))
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Отправка конверта. Если канал не открыт, сообщение отбрасывается с
    /// записью в лог; вызывающий звонок не должен от этого падать.
    pub fn send(&self, env: Envelope) -> bool {
        if !self.is_open() {
            warn!("Signaling channel is not open, dropping {} envelope", env.label());
            return false;
        }
        let guard = match self.outbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => {
                let label = env.label();
                if tx.send(env).is_err() {
                    warn!("Signaling writer is gone, dropping {label} envelope");
                    return false;
                }
                debug!("Sent {label} envelope");
                true
            }
            None => false,
        }
    }

    /// Закрывает транспорт. Повторный вызов ничего не делает.
    pub fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let sender = match self.outbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_none() {
            return;
        }
        drop(sender);
        if let Ok(mut tasks) = self.tasks.lock() {
            // writer сам отправит Close фрейм, когда очередь опустеет
            for task in tasks.drain(..).skip(1) {
                task.abort();
            }
        }
        if was_open {
            info!(session = %self.session, "Signaling channel closed");
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn relay(
    mut from: mpsc::UnboundedReceiver<Envelope>,
    sender_inbound: mpsc::UnboundedSender<ChannelEvent>,
    peer_inbound: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(env) = from.recv().await {
            if env == Envelope::EndSession {
                let _ = sender_inbound.send(ChannelEvent::Envelope(Envelope::SessionCompleted));
                let _ = peer_inbound.send(ChannelEvent::Envelope(Envelope::SessionCompleted));
            } else {
                let _ = peer_inbound.send(ChannelEvent::Envelope(env));
            }
        }
    })
}

/// Удалённая сторона канала `SignalingChannel::in_memory`
pub struct MemoryRemote {
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
    pub inbound: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl MemoryRemote {
    pub fn deliver(&self, env: Envelope) {
        let _ = self.inbound.send(ChannelEvent::Envelope(env));
    }

    /// Имитирует обрыв транспорта
    pub fn drop_transport(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.inbound.send(ChannelEvent::Closed(Some(reason.to_string())));
    }

    /// Всё, что канал успел отправить
    pub fn sent(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(env) = self.outbound.try_recv() {
            out.push(env);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn session() -> SessionId {
        SessionId::new("7").unwrap()
    }

    #[test]
    fn wire_format_matches_browser_messages() {
        let offer = serde_json::to_value(Envelope::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(offer, serde_json::json!({"type": "offer", "sdp": "v=0"}));

        let cand: Envelope = serde_json::from_str(
            r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match cand {
            Envelope::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }

        let end = serde_json::to_string(&Envelope::EndSession).unwrap();
        assert_eq!(end, r#"{"type":"end-session"}"#);
    }

    #[test]
    fn unknown_types_do_not_fail_parsing() {
        let env: Envelope =
            serde_json::from_str(r#"{"type":"recording-status","isRecording":true,"sender":"mentor"}"#)
                .unwrap();
        assert_eq!(env, Envelope::Unknown);
    }

    #[tokio::test]
    async fn send_is_noop_after_close_and_close_is_idempotent() {
        let (channel, _events, mut remote) = SignalingChannel::in_memory(session());
        assert!(channel.send(Envelope::Answer { sdp: "a".into() }));
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        assert!(!channel.send(Envelope::Answer { sdp: "b".into() }));
        assert_eq!(remote.sent(), vec![Envelope::Answer { sdp: "a".into() }]);
    }

    #[tokio::test]
    async fn transport_drop_is_reported_as_closed_event() {
        let (channel, mut events, remote) = SignalingChannel::in_memory(session());
        remote.deliver(Envelope::Offer { sdp: "o".into() });
        remote.drop_transport("gone");
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Envelope(Envelope::Offer { sdp: "o".into() }))
        );
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed(Some("gone".into()))));
        assert!(!channel.is_open());
        assert!(!channel.send(Envelope::EndSession));
    }

    #[tokio::test]
    async fn loopback_pair_relays_in_order_and_completes_sessions() {
        let ((a, mut a_rx), (b, mut b_rx)) = SignalingChannel::loopback_pair(session());
        a.send(Envelope::Offer { sdp: "1".into() });
        a.send(Envelope::IceCandidate { candidate: IceCandidate::new("c1") });
        b.send(Envelope::Answer { sdp: "2".into() });
        a.send(Envelope::EndSession);

        assert_eq!(
            b_rx.recv().await,
            Some(ChannelEvent::Envelope(Envelope::Offer { sdp: "1".into() }))
        );
        assert_eq!(
            b_rx.recv().await,
            Some(ChannelEvent::Envelope(Envelope::IceCandidate {
                candidate: IceCandidate::new("c1")
            }))
        );
        assert_eq!(
            b_rx.recv().await,
            Some(ChannelEvent::Envelope(Envelope::SessionCompleted))
        );
        // ответ и session-completed идут через разные реле, порядок между ними не задан
        let mut got = vec![a_rx.recv().await, a_rx.recv().await];
        got.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(
            got,
            vec![
                Some(ChannelEvent::Envelope(Envelope::Answer { sdp: "2".into() })),
                Some(ChannelEvent::Envelope(Envelope::SessionCompleted)),
            ]
        );
    }

    async fn local_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("ws://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    #[tokio::test]
    async fn websocket_round_trip_and_server_close() {
        let (listener, base) = local_server().await;
        let (got_tx, got_rx) = oneshot::channel::<Envelope>();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"type":"offer","sdp":"v=0"}"#.to_string()))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = got_tx.send(serde_json::from_str(&text).unwrap());
                        break;
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            }
            let _ = ws.close(None).await;
        });

        let (channel, mut events) = SignalingChannel::connect(&base, session()).await.unwrap();
        assert!(channel.is_open());
        assert_eq!(
            timeout(Duration::from_secs(5), events.recv()).await.unwrap(),
            Some(ChannelEvent::Envelope(Envelope::Offer { sdp: "v=0".into() }))
        );

        assert!(channel.send(Envelope::Answer { sdp: "v=1".into() }));
        assert_eq!(
            timeout(Duration::from_secs(5), got_rx).await.unwrap().unwrap(),
            Envelope::Answer { sdp: "v=1".into() }
        );

        let closed = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(matches!(closed, Some(ChannelEvent::Closed(Some(_)))));
        assert!(!channel.is_open());
        assert!(!channel.send(Envelope::EndSession));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn client_close_is_not_reported_as_loss() {
        let (listener, base) = local_server().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let (channel, mut events) = SignalingChannel::connect(&base, session()).await.unwrap();
        channel.close();
        assert!(!channel.is_open());

        // после close() очередь просто закрывается, без события Closed
        let next = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert_eq!(next, None);
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }
}
