use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;
use webrtc::{
    api::setting_engine::SettingEngine,
    data_channel::RTCDataChannel,
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        offer_answer_options::RTCAnswerOptions, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::{rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver},
    stats::StatsReport,
    track::track_remote::TrackRemote,
};

use crate::config::{
    build_rtc_config, ConnectOptions, EngineConfig, ReconnectType, RoomOptions, RtcConfig,
};
use crate::data_channel::DataChannelSet;
use crate::error::{DataErrorKind, EngineErrorKind, Error, SignalErrorKind, TrackErrorKind};
use crate::pending_tracks::PendingTrackRegistry;
use crate::protocol::{
    AddTrackRequest, ConnectionQualityInfo, DataPacket, DataPacketKind, DataPacketValue,
    DisconnectReason, JoinResponse, ParticipantInfo, RoomInfo, SessionDescriptionInfo, SpeakerInfo,
    StreamStateInfo, SubscribedQualityUpdate, SubscriptionPermissionUpdate, SyncState, TrackInfo,
    TrackPermission, UpdateSubscription, UserPacket,
};
use crate::reconnect::ReconnectController;
use crate::signaling::{ReconnectOutcome, SignalEvent, SignalLink, SignalTarget};
use crate::transport::{Transport, TransportRole};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything the engine pushes at its consumer, in emission order.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum EngineEvent {
    Connected,
    Reconnecting,
    FullReconnecting,
    Reconnected,
    PostReconnect {
        full: bool,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    FailedToConnect {
        error: String,
    },
    SignalConnected {
        resume: bool,
    },
    JoinResponse(JoinResponse),
    ParticipantUpdate(Vec<ParticipantInfo>),
    ActiveSpeakersUpdate(Vec<SpeakerInfo>),
    SpeakersChanged(Vec<SpeakerInfo>),
    ConnectionQuality(Vec<ConnectionQualityInfo>),
    RemoteMuteChanged {
        track_sid: String,
        muted: bool,
    },
    RoomUpdate(RoomInfo),
    UserPacket {
        kind: DataPacketKind,
        packet: UserPacket,
    },
    StreamStateUpdate(Vec<StreamStateInfo>),
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    LocalTrackUnpublished {
        track_sid: String,
    },
    TrackSubscribed {
        #[derivative(Debug = "ignore")]
        track: Arc<TrackRemote>,
        #[derivative(Debug = "ignore")]
        receiver: Arc<RTCRtpReceiver>,
        #[derivative(Debug = "ignore")]
        transceiver: Arc<RTCRtpTransceiver>,
    },
}

/// Internal tagged union consumed by the engine's single event loop. Signal
/// events, transport observations, and inbound data all funnel through here,
/// which is what keeps handler execution serialized.
pub(crate) enum EngineMessage {
    Signal(SignalEvent),
    IceCandidate {
        role: TransportRole,
        candidate: RTCIceCandidateInit,
    },
    PeerState {
        role: TransportRole,
        state: RTCPeerConnectionState,
    },
    PublisherOffer(RTCSessionDescription),
    InboundDataChannel {
        role: TransportRole,
        channel: Arc<RTCDataChannel>,
    },
    MediaTrack {
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
        transceiver: Arc<RTCRtpTransceiver>,
    },
    IncomingData(DataPacket),
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct Credentials {
    pub(crate) url: String,
    pub(crate) token: String,
    pub(crate) participant_sid: String,
    pub(crate) connect_options: ConnectOptions,
    pub(crate) room_options: RoomOptions,
}

/// The owned aggregate that exists between join and close.
pub(crate) struct Session {
    pub(crate) subscriber_primary: bool,
    pub(crate) publisher: Transport,
    pub(crate) subscriber: Transport,
    pub(crate) channels: Arc<DataChannelSet>,
    pub(crate) published_tracks: Vec<TrackInfo>,
}

impl Session {
    fn primary_role(&self) -> TransportRole {
        if self.subscriber_primary {
            TransportRole::Subscriber
        } else {
            TransportRole::Publisher
        }
    }

    fn primary(&self) -> &Transport {
        match self.primary_role() {
            TransportRole::Publisher => &self.publisher,
            TransportRole::Subscriber => &self.subscriber,
        }
    }
}

/// Coordinates the signal link and both transports: translates server events
/// into transport actions and transport state into [`EngineEvent`]s, and owns
/// the reconnect task.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("id", &self.inner.id).finish()
    }
}

pub(crate) struct EngineInner {
    pub(crate) id: String,
    pub(crate) config: EngineConfig,
    pub(crate) full_reconnect_on_next: AtomicBool,
    link: Arc<dyn SignalLink>,
    state: Mutex<ConnectionState>,
    credentials: Mutex<Option<Credentials>>,
    session: Mutex<Option<Session>>,
    pending_tracks: PendingTrackRegistry,
    engine_tx: mpsc::UnboundedSender<EngineMessage>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    closed: AtomicBool,
    publishing: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Builds an engine around a signal link and the channel its events
    /// arrive on. Returns the engine plus the stream of [`EngineEvent`]s.
    pub fn new(
        link: Arc<dyn SignalLink>,
        mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        config: EngineConfig,
    ) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(EngineInner {
            id: Uuid::new_v4().to_string(),
            config,
            full_reconnect_on_next: AtomicBool::new(false),
            link,
            state: Mutex::new(ConnectionState::Disconnected),
            credentials: Mutex::new(None),
            session: Mutex::new(None),
            pending_tracks: PendingTrackRegistry::new(),
            engine_tx: engine_tx.clone(),
            event_tx,
            closed: AtomicBool::new(false),
            publishing: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
        });

        tokio::spawn(EngineInner::event_loop(inner.clone(), engine_rx));
        tokio::spawn(async move {
            while let Some(event) = signal_events.recv().await {
                if engine_tx.send(EngineMessage::Signal(event)).is_err() {
                    break;
                }
            }
        });

        tracing::debug!("engine {} is created", inner.id);

        (Engine { inner }, event_rx)
    }

    /// Joins the room. Returns once the signaling handshake completed; the
    /// `Connected` event follows when the primary transport reaches the
    /// connected state.
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        options: ConnectOptions,
        room_options: RoomOptions,
    ) -> Result<JoinResponse, Error> {
        self.inner.connect(url, token, options, room_options).await
    }

    /// Idempotent teardown: cancels any reconnect task, disposes transports
    /// and data channels, and closes the link.
    pub async fn close(&self, reason: &str) {
        self.inner
            .close_session(reason, DisconnectReason::ClientInitiated)
            .await;
    }

    /// Registers the publication and suspends until the server acknowledges
    /// the client-assigned id.
    pub async fn add_track(&self, request: AddTrackRequest) -> Result<TrackInfo, Error> {
        self.inner.add_track(request).await
    }

    /// Writes a data packet on the channel matching its kind, negotiating the
    /// publisher first when it was brought up lazily.
    pub async fn send_data(&self, packet: DataPacket) -> Result<(), Error> {
        self.inner.send_data(packet).await
    }

    /// Kicks off (or re-runs) publisher negotiation.
    pub async fn negotiate_publisher(&self) -> Result<(), Error> {
        self.inner.negotiate_publisher().await
    }

    pub async fn send_mute_track(&self, track_sid: &str, muted: bool) -> Result<(), Error> {
        self.inner.link.send_mute_track(track_sid, muted).await
    }

    pub async fn send_update_subscription_permissions(
        &self,
        all_participants: bool,
        permissions: Vec<TrackPermission>,
    ) -> Result<(), Error> {
        self.inner
            .link
            .send_update_subscription_permissions(all_participants, permissions)
            .await
    }

    /// Snapshots the session (subscriber description, published tracks, data
    /// channels) and submits it, typically right after a reconnect.
    pub async fn send_sync_state(&self, subscription: UpdateSubscription) -> Result<(), Error> {
        self.inner.send_sync_state(subscription).await
    }

    /// Removes the publisher sender carrying the given local track id.
    pub async fn remove_track(&self, track_id: &str) -> Result<bool, Error> {
        let publisher = self
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .ok_or_else(|| EngineInner::not_connected())?;
        publisher.remove_track(track_id.to_owned()).await
    }

    pub async fn get_publisher_stats(&self) -> Result<StatsReport, Error> {
        let publisher = self
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .ok_or_else(|| EngineInner::not_connected())?;
        publisher.get_stats().await
    }

    pub async fn get_subscriber_stats(&self) -> Result<StatsReport, Error> {
        let subscriber = self
            .inner
            .transport_for(TransportRole::Subscriber)
            .await
            .ok_or_else(|| EngineInner::not_connected())?;
        subscriber.get_stats().await
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl EngineInner {
    fn not_connected() -> Error {
        Error::new_engine(
            "no active session".to_owned(),
            EngineErrorKind::NotConnected,
        )
    }

    fn closed_error() -> Error {
        Error::new_engine("engine is closed".to_owned(), EngineErrorKind::Closed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Serialized state setter. Equal-value transitions are suppressed, so
    /// the matching events fire at most once per real transition. Returns the
    /// previous state when a transition happened.
    async fn transition(
        &self,
        next: ConnectionState,
        disconnect_reason: Option<DisconnectReason>,
    ) -> Option<ConnectionState> {
        let mut state = self.state.lock().await;
        let prev = *state;
        if prev == next {
            return None;
        }
        // a closed session never comes back on its own
        if next == ConnectionState::Connected && prev == ConnectionState::Disconnected {
            return None;
        }
        *state = next;
        tracing::debug!("engine {} state {:?} -> {:?}", self.id, prev, next);

        match next {
            ConnectionState::Connected => {
                if prev == ConnectionState::Reconnecting {
                    self.emit(EngineEvent::Reconnected);
                } else {
                    self.emit(EngineEvent::Connected);
                }
            }
            ConnectionState::Reconnecting => self.emit(EngineEvent::Reconnecting),
            ConnectionState::Disconnected => {
                if let Some(reason) = disconnect_reason {
                    self.emit(EngineEvent::Disconnected { reason });
                }
            }
            ConnectionState::Connecting => {}
        }
        Some(prev)
    }

    pub(crate) async fn reconnect_type(&self) -> ReconnectType {
        self.credentials
            .lock()
            .await
            .as_ref()
            .map(|creds| creds.connect_options.reconnect_type)
            .unwrap_or_default()
    }

    async fn transport_for(&self, role: TransportRole) -> Option<Transport> {
        self.session.lock().await.as_ref().map(|session| match role {
            TransportRole::Publisher => session.publisher.clone(),
            TransportRole::Subscriber => session.subscriber.clone(),
        })
    }

    async fn connect(
        self: &Arc<Self>,
        url: &str,
        token: &str,
        options: ConnectOptions,
        room_options: RoomOptions,
    ) -> Result<JoinResponse, Error> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        {
            let mut state = self.state.lock().await;
            if *state != ConnectionState::Disconnected {
                return Err(Error::new_engine(
                    "a session is already active".to_owned(),
                    EngineErrorKind::InvalidState,
                ));
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!("engine {} joining {}", self.id, url);
        let join = match self.link.join(url, token, &options, &room_options).await {
            Ok(join) => join,
            Err(err) => {
                self.transition(ConnectionState::Disconnected, None).await;
                self.emit(EngineEvent::FailedToConnect {
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        *self.credentials.lock().await = Some(Credentials {
            url: url.to_owned(),
            token: token.to_owned(),
            participant_sid: join.participant.sid.clone(),
            connect_options: options,
            room_options,
        });

        if let Err(err) = self.start_session(&join).await {
            if let Some(session) = self.session.lock().await.take() {
                session.channels.close().await;
                let _ = session.publisher.close().await;
                let _ = session.subscriber.close().await;
            }
            *self.credentials.lock().await = None;
            self.transition(ConnectionState::Disconnected, None).await;
            self.emit(EngineEvent::FailedToConnect {
                error: err.to_string(),
            });
            return Err(err);
        }

        self.emit(EngineEvent::SignalConnected { resume: false });
        self.emit(EngineEvent::JoinResponse(join.clone()));
        self.link.notify_ready_for_responses().await;

        Ok(join)
    }

    /// Builds transports and data channels for a fresh join response. The
    /// publisher negotiates right away only when it is the primary transport;
    /// otherwise it stays idle until something needs it.
    async fn start_session(&self, join: &JoinResponse) -> Result<(), Error> {
        let connect_options = self
            .credentials
            .lock()
            .await
            .as_ref()
            .map(|creds| creds.connect_options.clone())
            .ok_or_else(Self::not_connected)?;

        let force_relay = join
            .client_configuration
            .as_ref()
            .map(|c| c.force_relay)
            .unwrap_or(false);
        let configuration = build_rtc_config(&connect_options, &join.ice_servers, force_relay);
        let rtc_config = RtcConfig {
            configuration,
            setting_engine: SettingEngine::default(),
        };

        let publisher = Transport::new(
            TransportRole::Publisher,
            rtc_config.clone(),
            self.engine_tx.clone(),
        )
        .await?;
        let subscriber = Transport::new(
            TransportRole::Subscriber,
            rtc_config,
            self.engine_tx.clone(),
        )
        .await?;
        let channels = Arc::new(DataChannelSet::create(&publisher, self.engine_tx.clone()).await?);

        *self.session.lock().await = Some(Session {
            subscriber_primary: join.subscriber_primary,
            publisher: publisher.clone(),
            subscriber,
            channels,
            published_tracks: Vec::new(),
        });

        if !join.subscriber_primary {
            self.publishing.store(true, Ordering::SeqCst);
            publisher.negotiate().await?;
        }

        Ok(())
    }

    /// Soft reconnect: keep the transports, restart ICE, resume the signal
    /// session under the stored participant sid.
    pub(crate) async fn resume_session(&self) -> Result<(), Error> {
        let creds = self
            .credentials
            .lock()
            .await
            .clone()
            .ok_or_else(Self::not_connected)?;
        let (publisher, subscriber) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(Self::not_connected)?;
            (session.publisher.clone(), session.subscriber.clone())
        };

        subscriber.prepare_for_ice_restart();
        let outcome = self
            .link
            .reconnect(&creds.url, &creds.token, &creds.participant_sid)
            .await?;
        match outcome {
            ReconnectOutcome::FullReconnectRequired => {
                return Err(Error::new_signal(
                    "server demanded a full reconnect".to_owned(),
                    SignalErrorKind::RequestError,
                ));
            }
            ReconnectOutcome::Resumed(response) => {
                if !response.ice_servers.is_empty() {
                    let force_relay = response
                        .client_configuration
                        .as_ref()
                        .map(|c| c.force_relay)
                        .unwrap_or(false);
                    let configuration = build_rtc_config(
                        &creds.connect_options,
                        &response.ice_servers,
                        force_relay,
                    );
                    publisher.update_rtc_config(configuration.clone()).await?;
                    subscriber.update_rtc_config(configuration).await?;
                }
            }
        }

        self.emit(EngineEvent::SignalConnected { resume: true });

        if self.publishing.load(Ordering::SeqCst) {
            publisher.prepare_for_ice_restart();
            publisher.negotiate().await?;
        }

        self.wait_for_connected().await
    }

    /// Full reconnect: tear everything down and run a fresh join with the
    /// captured credentials.
    pub(crate) async fn rejoin_session(&self) -> Result<(), Error> {
        let creds = self
            .credentials
            .lock()
            .await
            .clone()
            .ok_or_else(Self::not_connected)?;

        self.emit(EngineEvent::FullReconnecting);

        if let Some(old) = self.session.lock().await.take() {
            old.channels.close().await;
            if let Err(err) = old.publisher.close().await {
                tracing::error!("failed to close publisher transport: {}", err);
            }
            if let Err(err) = old.subscriber.close().await {
                tracing::error!("failed to close subscriber transport: {}", err);
            }
        }
        self.publishing.store(false, Ordering::SeqCst);
        self.pending_tracks.clear().await;

        let join = self
            .link
            .join(
                &creds.url,
                &creds.token,
                &creds.connect_options,
                &creds.room_options,
            )
            .await?;
        if let Some(creds) = self.credentials.lock().await.as_mut() {
            creds.participant_sid = join.participant.sid.clone();
        }

        self.start_session(&join).await?;
        self.emit(EngineEvent::SignalConnected { resume: false });
        self.link.notify_ready_for_responses().await;

        self.wait_for_connected().await
    }

    /// Waits for the publisher (when publishing) and then the primary
    /// transport, and settles the engine state.
    async fn wait_for_connected(&self) -> Result<(), Error> {
        let (publisher, primary) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(Self::not_connected)?;
            (session.publisher.clone(), session.primary().clone())
        };

        if self.publishing.load(Ordering::SeqCst) {
            self.wait_transport_connected(&publisher).await?;
        }
        self.wait_transport_connected(&primary).await?;

        if self.is_closed() {
            return Err(Self::closed_error());
        }
        self.transition(ConnectionState::Connected, None).await;
        Ok(())
    }

    async fn wait_transport_connected(&self, transport: &Transport) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.ice_connect_timeout;
        loop {
            if self.is_closed() {
                return Err(Self::closed_error());
            }
            if transport.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::new_engine(
                    format!(
                        "{} transport did not connect within {:?}",
                        transport.role, self.config.ice_connect_timeout
                    ),
                    EngineErrorKind::ConnectTimeout,
                ));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub(crate) async fn finish_reconnect(&self, full: bool) {
        self.link.notify_pc_connected().await;
        self.emit(EngineEvent::PostReconnect { full });
        tracing::info!("engine {} reconnected (full={})", self.id, full);
    }

    pub(crate) async fn close_from_reconnect(&self) {
        // the controller is the current task; drop the handle without abort
        self.reconnect_task.lock().await.take();
        self.close_session("Failed reconnecting", DisconnectReason::UnknownReason)
            .await;
    }

    pub(crate) async fn close_session(&self, reason: &str, disconnect_reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine {} closing: {}", self.id, reason);

        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
        self.pending_tracks.clear().await;

        let had_session = self.credentials.lock().await.take().is_some();
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.channels.close().await;
            if let Err(err) = session.publisher.close().await {
                tracing::error!("failed to close publisher transport: {}", err);
            }
            if let Err(err) = session.subscriber.close().await {
                tracing::error!("failed to close subscriber transport: {}", err);
            }
        }
        self.link.close(reason).await;

        let reason = had_session.then_some(disconnect_reason);
        self.transition(ConnectionState::Disconnected, reason).await;
        let _ = self.engine_tx.send(EngineMessage::Shutdown);
    }

    async fn trigger_reconnect(self: &Arc<Self>, reason: &str) {
        if self.is_closed() {
            return;
        }
        if self.session.lock().await.is_none() {
            return;
        }
        let mut task = self.reconnect_task.lock().await;
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                tracing::debug!("reconnect already in progress");
                return;
            }
        }

        tracing::info!("engine {} reconnecting: {}", self.id, reason);
        self.transition(ConnectionState::Reconnecting, None).await;
        let controller = ReconnectController::new(self.clone());
        *task = Some(tokio::spawn(controller.run()));
    }

    pub(crate) async fn add_track(&self, request: AddTrackRequest) -> Result<TrackInfo, Error> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        if self.session.lock().await.is_none() {
            return Err(Self::not_connected());
        }

        let receiver = self.pending_tracks.register(&request.cid).await?;
        let cid = request.cid.clone();
        tracing::debug!("publishing track: cid={}, name={}", request.cid, request.name);

        if let Err(err) = self.link.send_add_track(request).await {
            self.pending_tracks.remove(&cid).await;
            return Err(err);
        }

        receiver.await.map_err(|_| {
            Error::new_track(
                format!("publication for {} was cancelled", cid),
                TrackErrorKind::PublicationCancelled,
            )
        })
    }

    pub(crate) async fn send_data(&self, packet: DataPacket) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        self.ensure_publisher_connected().await?;

        let channels = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.channels.clone())
            .ok_or_else(|| {
                Error::new_data(
                    "no data channel for packet".to_owned(),
                    DataErrorKind::ChannelNotAvailable,
                )
            })?;

        channels
            .send(
                &packet,
                self.config.data_channel_open_poll_interval,
                self.config.ice_connect_timeout,
            )
            .await
    }

    /// In subscriber-primary sessions the publisher stays idle until needed;
    /// the first data send kicks its negotiation.
    async fn ensure_publisher_connected(&self) -> Result<(), Error> {
        let (publisher, subscriber_primary) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(Self::not_connected)?;
            (session.publisher.clone(), session.subscriber_primary)
        };
        if !subscriber_primary {
            return Ok(());
        }

        let state = publisher.observed_state();
        if state != RTCPeerConnectionState::Connected && state != RTCPeerConnectionState::Connecting
        {
            tracing::debug!("publisher transport idle, negotiating");
            self.publishing.store(true, Ordering::SeqCst);
            if self.state().await == ConnectionState::Reconnecting {
                publisher.prepare_for_ice_restart();
            }
            publisher.negotiate().await?;
        }
        Ok(())
    }

    pub(crate) async fn negotiate_publisher(&self) -> Result<(), Error> {
        let publisher = self
            .transport_for(TransportRole::Publisher)
            .await
            .ok_or_else(Self::not_connected)?;
        self.publishing.store(true, Ordering::SeqCst);
        if self.state().await == ConnectionState::Reconnecting {
            publisher.prepare_for_ice_restart();
        }
        publisher.negotiate().await
    }

    pub(crate) async fn send_sync_state(&self, subscription: UpdateSubscription) -> Result<(), Error> {
        let (subscriber, channels, publish_tracks) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(Self::not_connected)?;
            (
                session.subscriber.clone(),
                session.channels.clone(),
                session.published_tracks.clone(),
            )
        };

        let answer = subscriber
            .local_description()
            .await?
            .map(|sdp| SessionDescriptionInfo {
                sdp_type: sdp.sdp_type.to_string(),
                sdp: sdp.sdp,
            });

        let state = SyncState {
            answer,
            subscription,
            publish_tracks,
            data_channels: channels.infos(),
        };
        self.link.send_sync_state(state).await
    }

    async fn event_loop(inner: Arc<EngineInner>, mut messages: mpsc::UnboundedReceiver<EngineMessage>) {
        while let Some(message) = messages.recv().await {
            match message {
                EngineMessage::Shutdown => break,
                EngineMessage::Signal(event) => inner.handle_signal_event(event).await,
                EngineMessage::IceCandidate { role, candidate } => {
                    let target = match role {
                        TransportRole::Publisher => SignalTarget::Publisher,
                        TransportRole::Subscriber => SignalTarget::Subscriber,
                    };
                    if let Err(err) = inner.link.send_trickle(target, candidate).await {
                        tracing::warn!("failed to send local ICE candidate: {}", err);
                    }
                }
                EngineMessage::PeerState { role, state } => {
                    inner.handle_peer_state(role, state).await;
                }
                EngineMessage::PublisherOffer(sdp) => {
                    if let Err(err) = inner.link.send_offer(sdp).await {
                        tracing::error!("failed to send publisher offer: {}", err);
                    }
                }
                EngineMessage::InboundDataChannel { role, channel } => {
                    if role != TransportRole::Subscriber {
                        continue;
                    }
                    let channels = inner
                        .session
                        .lock()
                        .await
                        .as_ref()
                        .filter(|session| session.subscriber_primary)
                        .map(|session| session.channels.clone());
                    match channels {
                        Some(channels) => channels.adopt_inbound(channel).await,
                        None => tracing::debug!("ignoring data channel without active session"),
                    }
                }
                EngineMessage::MediaTrack {
                    track,
                    receiver,
                    transceiver,
                } => {
                    inner.emit(EngineEvent::TrackSubscribed {
                        track,
                        receiver,
                        transceiver,
                    });
                }
                EngineMessage::IncomingData(packet) => {
                    let kind = packet.kind;
                    match packet.value {
                        DataPacketValue::Speaker { speakers } => {
                            inner.emit(EngineEvent::ActiveSpeakersUpdate(speakers));
                        }
                        DataPacketValue::User(user) => {
                            inner.emit(EngineEvent::UserPacket { kind, packet: user });
                        }
                    }
                }
            }
        }
        tracing::debug!("engine {} event loop finished", inner.id);
    }

    async fn handle_signal_event(self: &Arc<Self>, event: SignalEvent) {
        match event {
            SignalEvent::Answer(sdp) => {
                let Some(publisher) = self.transport_for(TransportRole::Publisher).await else {
                    return;
                };
                if let Err(err) = publisher.set_remote_description(sdp).await {
                    tracing::error!("failed to apply server answer: {}", err);
                }
            }
            SignalEvent::Offer(sdp) => self.handle_server_offer(sdp).await,
            SignalEvent::Trickle { target, candidate } => {
                let role = match target {
                    SignalTarget::Publisher => TransportRole::Publisher,
                    SignalTarget::Subscriber => TransportRole::Subscriber,
                };
                let Some(transport) = self.transport_for(role).await else {
                    return;
                };
                if let Err(err) = transport.add_ice_candidate(candidate).await {
                    tracing::warn!("failed to add remote ICE candidate: {}", err);
                }
            }
            SignalEvent::LocalTrackPublished { cid, track } => {
                if self.pending_tracks.resolve(&cid, track.clone()).await {
                    if let Some(session) = self.session.lock().await.as_mut() {
                        session.published_tracks.push(track);
                    }
                } else {
                    tracing::debug!("no pending publication for cid {}", cid);
                }
            }
            SignalEvent::LocalTrackUnpublished { track_sid } => {
                if let Some(session) = self.session.lock().await.as_mut() {
                    session.published_tracks.retain(|t| t.sid != track_sid);
                }
                self.emit(EngineEvent::LocalTrackUnpublished { track_sid });
            }
            SignalEvent::ParticipantUpdate(updates) => {
                self.emit(EngineEvent::ParticipantUpdate(updates));
            }
            SignalEvent::SpeakersChanged(speakers) => {
                self.emit(EngineEvent::SpeakersChanged(speakers));
            }
            SignalEvent::ActiveSpeakers(speakers) => {
                self.emit(EngineEvent::ActiveSpeakersUpdate(speakers));
            }
            SignalEvent::ConnectionQuality(updates) => {
                self.emit(EngineEvent::ConnectionQuality(updates));
            }
            SignalEvent::RoomUpdate(room) => self.emit(EngineEvent::RoomUpdate(room)),
            SignalEvent::MuteChanged { track_sid, muted } => {
                self.emit(EngineEvent::RemoteMuteChanged { track_sid, muted });
            }
            SignalEvent::StreamStateUpdate(updates) => {
                self.emit(EngineEvent::StreamStateUpdate(updates));
            }
            SignalEvent::SubscribedQualityUpdate(update) => {
                self.emit(EngineEvent::SubscribedQualityUpdate(update));
            }
            SignalEvent::SubscriptionPermissionUpdate(update) => {
                self.emit(EngineEvent::SubscriptionPermissionUpdate(update));
            }
            SignalEvent::RefreshToken(token) => {
                if let Some(creds) = self.credentials.lock().await.as_mut() {
                    creds.token = token;
                }
            }
            SignalEvent::Leave {
                can_reconnect,
                reason,
            } => {
                tracing::info!(
                    "server asked to leave: can_reconnect={}, reason={:?}",
                    can_reconnect,
                    reason
                );
                if can_reconnect {
                    self.full_reconnect_on_next.store(true, Ordering::SeqCst);
                    self.trigger_reconnect("server requested a rejoin").await;
                } else {
                    self.close_session("server requested leave", reason).await;
                }
            }
            SignalEvent::Close { reason, code } => {
                tracing::warn!("signal link closed: {} (code {})", reason, code);
                if self.state().await != ConnectionState::Disconnected {
                    self.trigger_reconnect("signal link closed").await;
                }
            }
            SignalEvent::Error(err) => tracing::warn!("signal link error: {}", err),
        }
    }

    /// Server-initiated offer on the subscriber: apply, answer, install,
    /// send. Aborts silently as soon as the engine closes mid-sequence.
    async fn handle_server_offer(&self, offer: RTCSessionDescription) {
        let Some(subscriber) = self.transport_for(TransportRole::Subscriber).await else {
            return;
        };
        if self.is_closed() {
            return;
        }
        if let Err(err) = subscriber.set_remote_description(offer).await {
            tracing::warn!("failed to apply server offer: {}", err);
            return;
        }
        if self.is_closed() {
            return;
        }
        let answer = match subscriber.create_answer(RTCAnswerOptions::default()).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!("failed to create answer: {}", err);
                return;
            }
        };
        if self.is_closed() {
            return;
        }
        if let Err(err) = subscriber.set_local_description(answer.clone()).await {
            tracing::warn!("failed to install answer: {}", err);
            return;
        }
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.link.send_answer(answer).await {
            tracing::warn!("failed to send answer: {}", err);
        }
    }

    async fn handle_peer_state(
        self: &Arc<Self>,
        role: TransportRole,
        state: RTCPeerConnectionState,
    ) {
        let (primary_role, subscriber_primary, publisher_connected, primary_connected) = {
            let guard = self.session.lock().await;
            let Some(session) = guard.as_ref() else {
                return;
            };
            let transport = match role {
                TransportRole::Publisher => &session.publisher,
                TransportRole::Subscriber => &session.subscriber,
            };
            transport.note_state(state);
            (
                session.primary_role(),
                session.subscriber_primary,
                session.publisher.is_connected(),
                session.primary().is_connected(),
            )
        };

        match state {
            RTCPeerConnectionState::Connected => {
                if !primary_connected {
                    return;
                }
                let publishing = self.publishing.load(Ordering::SeqCst);
                let ready = match self.state().await {
                    ConnectionState::Connecting => true,
                    ConnectionState::Reconnecting => !publishing || publisher_connected,
                    _ => false,
                };
                if ready {
                    if let Some(prev) = self.transition(ConnectionState::Connected, None).await {
                        if prev == ConnectionState::Connecting {
                            self.link.notify_pc_connected().await;
                        }
                    }
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                if role == primary_role {
                    self.trigger_reconnect("primary transport disconnected").await;
                } else if role == TransportRole::Publisher
                    && subscriber_primary
                    && self.publishing.load(Ordering::SeqCst)
                {
                    self.trigger_reconnect("publisher transport disconnected")
                        .await;
                }
            }
            _ => {}
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        tracing::trace!("engine {} is dropped", self.id);
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::ReconnectResponse;

    #[derive(Default)]
    struct MockSignalLink {
        default_join: JoinResponse,
        join_failures_after: Option<usize>,
        reconnect_results: Mutex<VecDeque<ReconnectOutcome>>,
        join_calls: AtomicUsize,
        reconnect_calls: AtomicUsize,
        offers: AtomicUsize,
        answers: AtomicUsize,
        add_track_requests: Mutex<Vec<AddTrackRequest>>,
        sync_states: Mutex<Vec<SyncState>>,
        close_calls: AtomicUsize,
        pc_connected_calls: AtomicUsize,
    }

    impl MockSignalLink {
        fn new(join: JoinResponse) -> Self {
            Self {
                default_join: join,
                ..Default::default()
            }
        }

        async fn queue_reconnect(&self, outcome: ReconnectOutcome) {
            self.reconnect_results.lock().await.push_back(outcome);
        }
    }

    #[async_trait]
    impl SignalLink for MockSignalLink {
        async fn join(
            &self,
            _url: &str,
            _token: &str,
            _options: &ConnectOptions,
            _room_options: &RoomOptions,
        ) -> Result<JoinResponse, Error> {
            let calls = self.join_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.join_failures_after {
                if calls >= limit {
                    return Err(Error::new_signal(
                        "join refused".to_owned(),
                        SignalErrorKind::RequestError,
                    ));
                }
            }
            Ok(self.default_join.clone())
        }

        async fn reconnect(
            &self,
            _url: &str,
            _token: &str,
            _participant_sid: &str,
        ) -> Result<ReconnectOutcome, Error> {
            self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.reconnect_results
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| {
                    Error::new_signal("resume refused".to_owned(), SignalErrorKind::RequestError)
                })
        }

        async fn send_offer(&self, _sdp: RTCSessionDescription) -> Result<(), Error> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_answer(&self, _sdp: RTCSessionDescription) -> Result<(), Error> {
            self.answers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_trickle(
            &self,
            _target: SignalTarget,
            _candidate: RTCIceCandidateInit,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn send_add_track(&self, request: AddTrackRequest) -> Result<(), Error> {
            self.add_track_requests.lock().await.push(request);
            Ok(())
        }

        async fn send_mute_track(&self, _track_sid: &str, _muted: bool) -> Result<(), Error> {
            Ok(())
        }

        async fn send_update_subscription_permissions(
            &self,
            _all_participants: bool,
            _permissions: Vec<TrackPermission>,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn send_sync_state(&self, state: SyncState) -> Result<(), Error> {
            self.sync_states.lock().await.push(state);
            Ok(())
        }

        async fn notify_ready_for_responses(&self) {}

        async fn notify_pc_connected(&self) {
            self.pc_connected_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self, _reason: &str) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn join_response(subscriber_primary: bool) -> JoinResponse {
        JoinResponse {
            participant: ParticipantInfo {
                sid: "PA_local".to_owned(),
                ..Default::default()
            },
            subscriber_primary,
            ..Default::default()
        }
    }

    fn test_engine(
        mock: Arc<MockSignalLink>,
        config: EngineConfig,
    ) -> (
        Engine,
        mpsc::UnboundedReceiver<EngineEvent>,
        mpsc::UnboundedSender<SignalEvent>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (engine, events) = Engine::new(mock, signal_rx, config);
        (engine, events, signal_tx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event channel closed")
    }

    async fn wait_for_event<F>(
        events: &mut mpsc::UnboundedReceiver<EngineEvent>,
        pred: F,
    ) -> EngineEvent
    where
        F: Fn(&EngineEvent) -> bool,
    {
        loop {
            let event = next_event(events).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(pred: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "condition never became true");
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn inject_peer_state(engine: &Engine, role: TransportRole, state: RTCPeerConnectionState) {
        engine
            .inner
            .engine_tx
            .send(EngineMessage::PeerState { role, state })
            .expect("engine event loop is gone");
    }

    #[tokio::test]
    async fn test_publisher_primary_connects_exactly_once() {
        let mock = Arc::new(MockSignalLink::new(join_response(false)));
        let (engine, mut events, _signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::SignalConnected { resume: false }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::JoinResponse(_)
        ));

        // the publisher is primary, so the initial offer is produced eagerly
        wait_until(|| mock.offers.load(Ordering::SeqCst) >= 1).await;

        inject_peer_state(&engine, TransportRole::Publisher, RTCPeerConnectionState::Connected);
        assert!(matches!(next_event(&mut events).await, EngineEvent::Connected));
        assert_eq!(engine.state().await, ConnectionState::Connected);
        wait_until(|| mock.pc_connected_calls.load(Ordering::SeqCst) == 1).await;

        // a repeated report must not re-fire the transition
        inject_peer_state(&engine, TransportRole::Publisher, RTCPeerConnectionState::Connected);
        sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_add_track_resolves_with_server_ack() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, _events, signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        let publisher = engine.clone();
        let pending = tokio::spawn(async move {
            publisher
                .add_track(AddTrackRequest {
                    cid: "c1".to_owned(),
                    name: "cam".to_owned(),
                    ..Default::default()
                })
                .await
        });

        wait_until(|| mock.add_track_requests.try_lock().map(|r| r.len()).unwrap_or(0) == 1).await;
        signal_tx
            .send(SignalEvent::LocalTrackPublished {
                cid: "c1".to_owned(),
                track: TrackInfo {
                    sid: "TR_1".to_owned(),
                    ..Default::default()
                },
            })
            .unwrap();

        let info = pending.await.unwrap().expect("add_track failed");
        assert_eq!(info.sid, "TR_1");
        assert!(engine.inner.pending_tracks.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_publication_is_rejected() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, _events, signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        let first = engine.clone();
        let pending = tokio::spawn(async move {
            first
                .add_track(AddTrackRequest {
                    cid: "c1".to_owned(),
                    ..Default::default()
                })
                .await
        });
        wait_until(|| mock.add_track_requests.try_lock().map(|r| r.len()).unwrap_or(0) == 1).await;

        let res = engine
            .add_track(AddTrackRequest {
                cid: "c1".to_owned(),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            res,
            Err(Error::TrackError(err)) if matches!(err.kind, TrackErrorKind::DuplicatePublication)
        ));

        // the first publication still resolves
        signal_tx
            .send(SignalEvent::LocalTrackPublished {
                cid: "c1".to_owned(),
                track: TrackInfo {
                    sid: "TR_1".to_owned(),
                    ..Default::default()
                },
            })
            .unwrap();
        let info = pending.await.unwrap().expect("first add_track failed");
        assert_eq!(info.sid, "TR_1");
    }

    #[tokio::test]
    async fn test_soft_reconnect_resumes_existing_transports() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        mock.queue_reconnect(ReconnectOutcome::Resumed(ReconnectResponse {
            ice_servers: vec![crate::protocol::IceServerSpec {
                urls: vec!["stun:fresh.example.com:3478".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        }))
        .await;
        let (engine, mut events, signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");
        inject_peer_state(&engine, TransportRole::Subscriber, RTCPeerConnectionState::Connected);
        wait_for_event(&mut events, |e| matches!(e, EngineEvent::Connected)).await;

        let publisher_before = engine
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .unwrap()
            .id
            .clone();

        signal_tx
            .send(SignalEvent::Close {
                reason: "ws interrupted".to_owned(),
                code: 1006,
            })
            .unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Reconnecting
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::SignalConnected { resume: true }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Reconnected
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::PostReconnect { full: false }
        ));

        // no teardown happened
        assert_eq!(mock.join_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.reconnect_calls.load(Ordering::SeqCst), 1);
        let publisher_after = engine
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .unwrap()
            .id
            .clone();
        assert_eq!(publisher_before, publisher_after);
        assert_eq!(engine.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_leave_forces_full_reconnect() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, mut events, signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");
        inject_peer_state(&engine, TransportRole::Subscriber, RTCPeerConnectionState::Connected);
        wait_for_event(&mut events, |e| matches!(e, EngineEvent::Connected)).await;

        let publisher_before = engine
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .unwrap()
            .id
            .clone();

        signal_tx
            .send(SignalEvent::Leave {
                can_reconnect: true,
                reason: DisconnectReason::ServerShutdown,
            })
            .unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Reconnecting
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::FullReconnecting
        ));

        // transports are rebuilt through a fresh join
        wait_until(|| mock.join_calls.load(Ordering::SeqCst) == 2).await;
        wait_until(|| {
            engine
                .inner
                .session
                .try_lock()
                .map(|s| s.is_some())
                .unwrap_or(false)
        })
        .await;
        inject_peer_state(&engine, TransportRole::Subscriber, RTCPeerConnectionState::Connected);

        assert!(matches!(
            wait_for_event(&mut events, |e| matches!(e, EngineEvent::Reconnected)).await,
            EngineEvent::Reconnected
        ));
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::PostReconnect { full: true }
        ));

        let publisher_after = engine
            .inner
            .transport_for(TransportRole::Publisher)
            .await
            .unwrap()
            .id
            .clone();
        assert_ne!(publisher_before, publisher_after);
        assert_eq!(engine.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_closes_engine() {
        let mock = Arc::new(MockSignalLink {
            default_join: join_response(true),
            // the initial join succeeds, every rejoin is refused
            join_failures_after: Some(1),
            ..Default::default()
        });
        let config = EngineConfig {
            max_reconnect_retries: 2,
            max_reconnect_timeout: Duration::from_secs(10),
            ice_connect_timeout: Duration::from_millis(100),
            data_channel_open_poll_interval: Duration::from_millis(10),
        };
        let (engine, mut events, signal_tx) = test_engine(mock.clone(), config);

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");
        inject_peer_state(&engine, TransportRole::Subscriber, RTCPeerConnectionState::Connected);
        wait_for_event(&mut events, |e| matches!(e, EngineEvent::Connected)).await;

        signal_tx
            .send(SignalEvent::Close {
                reason: "ws interrupted".to_owned(),
                code: 1006,
            })
            .unwrap();

        let disconnected =
            wait_for_event(&mut events, |e| matches!(e, EngineEvent::Disconnected { .. })).await;
        assert!(matches!(
            disconnected,
            EngineEvent::Disconnected {
                reason: DisconnectReason::UnknownReason
            }
        ));
        assert!(engine.is_closed());
        assert_eq!(engine.state().await, ConnectionState::Disconnected);
        assert_eq!(mock.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, mut events, _signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        engine.close("bye").await;
        engine.close("bye").await;

        sleep(Duration::from_millis(50)).await;
        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::Disconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(mock.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_publications() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, _events, _signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        let publisher = engine.clone();
        let pending = tokio::spawn(async move {
            publisher
                .add_track(AddTrackRequest {
                    cid: "c1".to_owned(),
                    ..Default::default()
                })
                .await
        });
        wait_until(|| mock.add_track_requests.try_lock().map(|r| r.len()).unwrap_or(0) == 1).await;

        engine.close("bye").await;

        let res = pending.await.unwrap();
        assert!(matches!(
            res,
            Err(Error::TrackError(err)) if matches!(err.kind, TrackErrorKind::PublicationCancelled)
        ));
    }

    #[tokio::test]
    async fn test_send_data_kicks_publisher_negotiation() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let config = EngineConfig {
            ice_connect_timeout: Duration::from_millis(100),
            data_channel_open_poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (engine, mut events, _signal_tx) = test_engine(mock.clone(), config);

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");
        inject_peer_state(&engine, TransportRole::Subscriber, RTCPeerConnectionState::Connected);
        wait_for_event(&mut events, |e| matches!(e, EngineEvent::Connected)).await;

        // subscriber-primary leaves the publisher idle, so no offer yet
        assert_eq!(mock.offers.load(Ordering::SeqCst), 0);

        let res = engine
            .send_data(DataPacket {
                kind: DataPacketKind::Reliable,
                value: DataPacketValue::User(UserPacket::default()),
            })
            .await;

        // the channel can never open without a remote peer, but negotiation
        // must have been kicked
        assert!(matches!(
            res,
            Err(Error::DataError(err)) if matches!(err.kind, DataErrorKind::ChannelNotOpen)
        ));
        wait_until(|| mock.offers.load(Ordering::SeqCst) >= 1).await;
    }

    #[tokio::test]
    async fn test_sync_state_lists_outbound_channels() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, _events, _signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        engine
            .send_sync_state(UpdateSubscription {
                track_sids: vec!["TR_remote".to_owned()],
                subscribe: true,
            })
            .await
            .expect("failed to send sync state");

        let states = mock.sync_states.lock().await;
        assert_eq!(states.len(), 1);
        let labels: Vec<&str> = states[0]
            .data_channels
            .iter()
            .map(|c| c.label.as_str())
            .collect();
        assert_eq!(labels, vec!["_reliable", "_lossy"]);
    }

    #[tokio::test]
    async fn test_refresh_token_updates_credentials() {
        let mock = Arc::new(MockSignalLink::new(join_response(true)));
        let (engine, _events, signal_tx) = test_engine(mock.clone(), EngineConfig::default());

        engine
            .connect("wss://srv", "T", ConnectOptions::default(), RoomOptions::default())
            .await
            .expect("failed to connect");

        signal_tx
            .send(SignalEvent::RefreshToken("T2".to_owned()))
            .unwrap();
        wait_until(|| {
            engine
                .inner
                .credentials
                .try_lock()
                .map(|c| c.as_ref().map(|c| c.token.clone()) == Some("T2".to_owned()))
                .unwrap_or(false)
        })
        .await;
    }
}
