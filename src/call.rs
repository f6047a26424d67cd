//! Публичный API звонка: фоновая задача с машиной состояний и
//! клонируемый `CallHandle` для команд из UI.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::EventEmitter;
use crate::media::{LocalStream, MediaDevices, MediaSessionController};
use crate::peer::connection::PeerConnectionFactory;
use crate::peer::negotiation::Negotiator;
use crate::peer::rtc::RtcPeerFactory;
use crate::peer::state::CallState;
use crate::peer::types::{CallEvent, PeerNotice, Role};
use crate::session::SessionId;
use crate::signaling::{ChannelEvents, SignalingChannel};

enum Command {
    Start(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<()>),
    SetAudio(bool, oneshot::Sender<bool>),
    SetVideo(bool, oneshot::Sender<bool>),
    StartScreenShare(Arc<LocalStream>, oneshot::Sender<Result<()>>),
    StopScreenShare(oneshot::Sender<Result<bool>>),
    State(oneshot::Sender<CallState>),
    Shutdown(oneshot::Sender<()>),
}

/// Команды звонку. Все они исполняются по очереди в задаче звонка.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| CallError::ChannelClosed)?;
        rx.await.map_err(|_| CallError::ChannelClosed)
    }

    pub async fn start_call(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    pub async fn end_call(&self) -> Result<()> {
        self.request(Command::End).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetAudio(enabled, tx)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetVideo(enabled, tx)).await
    }

    /// Показывает `screen` вместо камеры
    pub async fn start_screen_share(&self, screen: Arc<LocalStream>) -> Result<()> {
        self.request(|tx| Command::StartScreenShare(screen, tx)).await?
    }

    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(Command::StopScreenShare).await?
    }

    pub async fn state(&self) -> Result<CallState> {
        self.request(Command::State).await
    }

    /// Завершает звонок, закрывает сигнальный канал и останавливает задачу
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// Запущенный звонок
pub struct Call {
    pub handle: CallHandle,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    pub task: JoinHandle<()>,
}

/// Собирает звонок из готовых частей и запускает его задачу
pub fn spawn(
    role: Role,
    signaling: SignalingChannel,
    channel_events: ChannelEvents,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    config: &CallConfig,
) -> Call {
    let (events, events_rx) = EventEmitter::new();
    let (negotiator, notices) = Negotiator::new(
        role,
        Arc::new(signaling),
        MediaSessionController::new(devices),
        factory,
        events,
        config.grace_period(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(negotiator, channel_events, notices, rx));
    Call {
        handle: CallHandle { tx },
        events: events_rx,
        task,
    }
}

/// Подключается к сигнальному серверу сессии и запускает звонок на webrtc
pub async fn join(
    config: &CallConfig,
    session: SessionId,
    role: Role,
    devices: Arc<dyn MediaDevices>,
) -> Result<Call> {
    crate::logger::init();
    config.validate()?;
    let (signaling, channel_events) =
        SignalingChannel::connect(&config.signaling_url, session).await?;
    let factory = Arc::new(RtcPeerFactory::new(config));
    Ok(spawn(role, signaling, channel_events, devices, factory, config))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

async fn run(
    mut negotiator: Negotiator,
    mut channel_events: ChannelEvents,
    mut notices: mpsc::UnboundedReceiver<PeerNotice>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    info!(role = %negotiator.role(), session = %negotiator.signaling().session(), "Call task started");
    loop {
        tokio::select! {
            // команды пользователя важнее входящих сообщений
            biased;

            cmd = commands.recv() => {
                let flow = match cmd {
                    Some(Command::Start(reply)) => {
                        start(&mut negotiator, &mut commands, reply).await
                    }
                    Some(cmd) => handle(&mut negotiator, cmd).await,
                    None => {
                        debug!("All call handles dropped");
                        negotiator.shutdown().await;
                        Flow::Stop
                    }
                };
                if flow == Flow::Stop {
                    break;
                }
            }
            Some(event) = channel_events.recv() => negotiator.handle_channel_event(event).await,
            Some(notice) = notices.recv() => negotiator.handle_notice(notice).await,
        }
    }
    info!("Call task stopped");
}

/// Старт звонка. Пока идёт захват устройств, команды продолжают
/// обрабатываться; `End` или `Shutdown` бросают захват.
async fn start(
    negotiator: &mut Negotiator,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    reply: oneshot::Sender<Result<()>>,
) -> Flow {
    let request = match negotiator.begin_call() {
        Ok(request) => request,
        Err(e) => {
            let _ = reply.send(Err(e));
            return Flow::Continue;
        }
    };
    let acquire = request.acquire();
    tokio::pin!(acquire);

    let acquired = loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => {
                let flow = match cmd {
                    Some(cmd) => handle(negotiator, cmd).await,
                    None => {
                        negotiator.shutdown().await;
                        Flow::Stop
                    }
                };
                if flow == Flow::Stop || negotiator.state() != CallState::ConnectingLocalMedia {
                    info!("Local media acquisition abandoned");
                    let _ = reply.send(Err(CallError::Cancelled));
                    return flow;
                }
            }
            res = &mut acquire => break res,
        }
    };
    let _ = reply.send(negotiator.complete_call(acquired).await);
    Flow::Continue
}

/// Все команды, кроме старта из свободного состояния (его ведёт `start`)
async fn handle(negotiator: &mut Negotiator, cmd: Command) -> Flow {
    match cmd {
        // сюда старт попадает только во время захвата устройств
        Command::Start(reply) => {
            let _ = reply.send(Err(CallError::CallInProgress));
        }
        Command::End(reply) => {
            negotiator.end_call().await;
            let _ = reply.send(());
        }
        Command::SetAudio(enabled, reply) => {
            let _ = reply.send(negotiator.set_audio_enabled(enabled));
        }
        Command::SetVideo(enabled, reply) => {
            let _ = reply.send(negotiator.set_video_enabled(enabled));
        }
        Command::StartScreenShare(screen, reply) => {
            let _ = reply.send(negotiator.start_screen_share(screen).await);
        }
        Command::StopScreenShare(reply) => {
            let _ = reply.send(negotiator.stop_screen_share().await);
        }
        Command::State(reply) => {
            let _ = reply.send(negotiator.state());
        }
        Command::Shutdown(reply) => {
            negotiator.shutdown().await;
            let _ = reply.send(());
            return Flow::Stop;
        }
    }
    Flow::Continue
}
