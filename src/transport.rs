use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use derivative::Derivative;
use enclose::enc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        offer_answer_options::{RTCAnswerOptions, RTCOfferOptions},
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver},
    stats::StatsReport,
    track::track_remote::TrackRemote,
};

use crate::config::RtcConfig;
use crate::engine::EngineMessage;
use crate::error::{Error, TransportErrorKind};

/// An operation executed on the transport's serialized queue with exclusive
/// access to the peer connection.
pub type PeerOp = Box<dyn FnOnce(Arc<RTCPeerConnection>) -> BoxFuture<'static, ()> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportRole {
    Publisher,
    Subscriber,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportRole::Publisher => write!(f, "publisher"),
            TransportRole::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Wraps a single [`RTCPeerConnection`]. Every mutation of the native object
/// goes through a dedicated single-consumer queue, so concurrent callers
/// serialize and none observes a partially-applied change. Native callbacks
/// are forwarded into the engine's event channel.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Transport {
    pub id: String,
    pub role: TransportRole,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    #[derivative(Debug = "ignore")]
    op_sender: mpsc::UnboundedSender<PeerOp>,
    #[derivative(Debug = "ignore")]
    config: Arc<Mutex<RtcConfig>>,
    #[derivative(Debug = "ignore")]
    events: mpsc::UnboundedSender<EngineMessage>,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    restart_ice: Arc<AtomicBool>,
    negotiating: Arc<AtomicBool>,
    renegotiate: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    observed_state: Arc<AtomicU8>,
}

impl Transport {
    pub(crate) async fn new(
        role: TransportRole,
        config: RtcConfig,
        events: mpsc::UnboundedSender<EngineMessage>,
    ) -> Result<Transport, Error> {
        let id = Uuid::new_v4().to_string();
        let peer_connection = Arc::new(
            Self::generate_peer_connection(config.setting_engine.clone(), config.configuration.clone())
                .await?,
        );

        let (op_sender, op_receiver) = mpsc::unbounded_channel();

        let transport = Transport {
            id,
            role,
            peer_connection,
            op_sender,
            config: Arc::new(Mutex::new(config)),
            events,
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            restart_ice: Arc::new(AtomicBool::new(false)),
            negotiating: Arc::new(AtomicBool::new(false)),
            renegotiate: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            observed_state: Arc::new(AtomicU8::new(state_to_u8(
                RTCPeerConnectionState::New,
            ))),
        };

        transport.spawn_op_worker(op_receiver);
        transport.register_hooks();

        tracing::debug!("{} transport {} is created", transport.role, transport.id);

        Ok(transport)
    }

    async fn generate_peer_connection(
        setting_engine: webrtc::api::setting_engine::SettingEngine,
        configuration: RTCConfiguration,
    ) -> Result<RTCPeerConnection, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let peer_connection = api.new_peer_connection(configuration).await?;
        Ok(peer_connection)
    }

    fn spawn_op_worker(&self, mut op_receiver: mpsc::UnboundedReceiver<PeerOp>) {
        let peer = self.peer_connection.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(op) = op_receiver.recv().await {
                op(peer.clone()).await;
            }
            tracing::trace!("transport {} operation queue drained", id);
        });
    }

    /// Runs `f` on the operation queue with exclusive access to the peer
    /// connection and returns its result. Fails once the transport is closed.
    pub async fn with_peer_connection<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(Arc<RTCPeerConnection>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        let (tx, rx) = oneshot::channel();
        let op: PeerOp = Box::new(move |peer| {
            Box::pin(async move {
                let _ = tx.send(f(peer).await);
            })
        });
        self.op_sender.send(op).map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| {
            Error::new_transport(
                format!("{} transport operation was cancelled", self.role),
                TransportErrorKind::OperationCancelled,
            )
        })
    }

    fn closed_error(&self) -> Error {
        Error::new_transport(
            format!("{} transport is closed", self.role),
            TransportErrorKind::Closed,
        )
    }

    /// Applies the remote description, then flushes ICE candidates buffered
    /// before it arrived, in arrival order.
    pub async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        let pending = self.pending_candidates.clone();
        let role = self.role;
        let res: Result<(), webrtc::Error> = self
            .with_peer_connection(move |peer| async move {
                tracing::debug!("{} set remote description", role);
                peer.set_remote_description(sdp).await?;

                let mut pending = pending.lock().await;
                for candidate in pending.drain(..) {
                    tracing::debug!("adding buffered ICE candidate: {:#?}", candidate);
                    if let Err(err) = peer.add_ice_candidate(candidate).await {
                        tracing::error!("failed to add buffered ICE candidate: {}", err);
                    }
                }
                Ok(())
            })
            .await?;

        res.map_err(|err| {
            Error::new_transport(
                format!("{} remote description was rejected: {}", self.role, err),
                TransportErrorKind::SdpApplyError,
            )
        })
    }

    pub async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        let res: Result<(), webrtc::Error> = self
            .with_peer_connection(move |peer| async move { peer.set_local_description(sdp).await })
            .await?;

        res.map_err(|err| {
            Error::new_transport(
                format!("{} local description was rejected: {}", self.role, err),
                TransportErrorKind::SdpApplyError,
            )
        })
    }

    /// Produces an offer. When the transport was marked for ICE restart, the
    /// mark is consumed and the offer carries `ice_restart`.
    pub async fn create_offer(&self, options: RTCOfferOptions) -> Result<RTCSessionDescription, Error> {
        let mut options = options;
        if self.restart_ice.swap(false, Ordering::SeqCst) {
            options.ice_restart = true;
        }
        let res: Result<RTCSessionDescription, webrtc::Error> = self
            .with_peer_connection(move |peer| async move { peer.create_offer(Some(options)).await })
            .await?;
        Ok(res?)
    }

    pub async fn create_answer(
        &self,
        options: RTCAnswerOptions,
    ) -> Result<RTCSessionDescription, Error> {
        let res: Result<RTCSessionDescription, webrtc::Error> = self
            .with_peer_connection(move |peer| async move { peer.create_answer(Some(options)).await })
            .await?;
        Ok(res?)
    }

    pub async fn local_description(&self) -> Result<Option<RTCSessionDescription>, Error> {
        self.with_peer_connection(|peer| async move { peer.local_description().await })
            .await
    }

    /// Buffers the candidate until a remote description exists, otherwise
    /// applies it immediately.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        let pending = self.pending_candidates.clone();
        let res: Result<(), webrtc::Error> = self
            .with_peer_connection(move |peer| async move {
                if peer.remote_description().await.is_some() {
                    tracing::debug!("adding ICE candidate: {:#?}", candidate);
                    peer.add_ice_candidate(candidate).await
                } else {
                    tracing::debug!("buffering ICE candidate: {:#?}", candidate);
                    pending.lock().await.push(candidate);
                    Ok(())
                }
            })
            .await?;
        Ok(res?)
    }

    /// Atomically replaces the transport-wide configuration. Installed through
    /// the operation queue so no queued operation observes a torn config.
    pub async fn update_rtc_config(&self, configuration: RTCConfiguration) -> Result<(), Error> {
        let config = self.config.clone();
        let role = self.role;
        self.with_peer_connection(move |_peer| async move {
            tracing::debug!("{} transport configuration replaced", role);
            config.lock().await.configuration = configuration;
        })
        .await
    }

    pub(crate) async fn rtc_config(&self) -> RtcConfig {
        self.config.lock().await.clone()
    }

    /// Marks the transport so that the next offer restarts ICE.
    pub fn prepare_for_ice_restart(&self) {
        self.restart_ice.store(true, Ordering::SeqCst);
    }

    /// Publisher-only: creates an offer, installs it locally, and forwards it
    /// towards the server. Calls arriving while a negotiation is in flight
    /// collapse into a single trailing negotiation.
    pub async fn negotiate(&self) -> Result<(), Error> {
        if self.role != TransportRole::Publisher {
            tracing::warn!("negotiate called on {} transport", self.role);
            return Ok(());
        }
        if self.negotiating.swap(true, Ordering::SeqCst) {
            self.renegotiate.store(true, Ordering::SeqCst);
            return Ok(());
        }

        loop {
            let res = self.create_and_send_offer().await;
            if let Err(err) = res {
                // drop any queued trailing negotiation with the failure, so
                // a later unrelated call does not replay it
                self.renegotiate.store(false, Ordering::SeqCst);
                self.negotiating.store(false, Ordering::SeqCst);
                return Err(err);
            }
            if !self.renegotiate.swap(false, Ordering::SeqCst) {
                break;
            }
        }
        self.negotiating.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_and_send_offer(&self) -> Result<(), Error> {
        let offer = self
            .create_offer(RTCOfferOptions {
                voice_activity_detection: false,
                ice_restart: false,
            })
            .await?;
        self.set_local_description(offer.clone()).await?;

        // read back the munged description webrtc installed
        let sdp = self.local_description().await?.unwrap_or(offer);
        tracing::debug!("{} transport sending offer", self.role);
        let _ = self.events.send(EngineMessage::PublisherOffer(sdp));
        Ok(())
    }

    pub async fn create_data_channel(
        &self,
        label: &str,
        init: RTCDataChannelInit,
    ) -> Result<Arc<RTCDataChannel>, Error> {
        let label = label.to_owned();
        let res: Result<Arc<RTCDataChannel>, webrtc::Error> = self
            .with_peer_connection(move |peer| async move {
                peer.create_data_channel(&label, Some(init)).await
            })
            .await?;
        Ok(res?)
    }

    /// Removes the sender publishing the track with the given id. Returns
    /// whether a matching sender existed.
    pub async fn remove_track(&self, track_id: String) -> Result<bool, Error> {
        let res: Result<bool, webrtc::Error> = self
            .with_peer_connection(move |peer| async move {
                for sender in peer.get_senders().await {
                    if let Some(track) = sender.track().await {
                        if track.id() == track_id {
                            peer.remove_track(&sender).await?;
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            })
            .await?;
        Ok(res?)
    }

    pub async fn get_stats(&self) -> Result<StatsReport, Error> {
        self.with_peer_connection(|peer| async move { peer.get_stats().await })
            .await
    }

    /// Idempotent; drains the queue, disposes the peer connection, and
    /// rejects further operations.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // bypass the closed check so the disposal still runs behind any
        // queued operations
        let (tx, rx) = oneshot::channel();
        let op: PeerOp = Box::new(move |peer| {
            Box::pin(async move {
                let _ = tx.send(peer.close().await);
            })
        });
        if self.op_sender.send(op).is_ok() {
            if let Ok(Err(err)) = rx.await {
                tracing::error!("failed to close {} peer connection: {}", self.role, err);
            }
        }

        tracing::debug!("{} transport {} is closed", self.role, self.id);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.observed_state() == RTCPeerConnectionState::Connected
    }

    /// Last peer-connection state observed through the engine's event channel.
    pub fn observed_state(&self) -> RTCPeerConnectionState {
        state_from_u8(self.observed_state.load(Ordering::SeqCst))
    }

    pub(crate) fn note_state(&self, state: RTCPeerConnectionState) {
        self.observed_state.store(state_to_u8(state), Ordering::SeqCst);
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub fn ice_connection_state(&self) -> webrtc::ice_transport::ice_connection_state::RTCIceConnectionState {
        self.peer_connection.ice_connection_state()
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    fn register_hooks(&self) {
        let peer = self.peer_connection.clone();
        let role = self.role;
        let events = self.events.clone();

        peer.on_ice_candidate(Box::new(enc!( (events) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!( (events) async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(EngineMessage::IceCandidate { role, candidate: init });
                        }
                        Err(err) => tracing::error!("failed to serialize ICE candidate: {}", err),
                    }
                }
            }))
        })));

        let events = self.events.clone();
        peer.on_peer_connection_state_change(Box::new(enc!( (events) move |state: RTCPeerConnectionState| {
            Box::pin(enc!( (events) async move {
                tracing::debug!("{} peer connection state changed: {}", role, state);
                let _ = events.send(EngineMessage::PeerState { role, state });
            }))
        })));

        let events = self.events.clone();
        peer.on_data_channel(Box::new(enc!( (events) move |channel: Arc<RTCDataChannel>| {
            Box::pin(enc!( (events) async move {
                tracing::debug!("{} received data channel: label={}", role, channel.label());
                let _ = events.send(EngineMessage::InboundDataChannel { role, channel });
            }))
        })));

        let events = self.events.clone();
        peer.on_track(Box::new(enc!( (events)
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!( (events) async move {
                    tracing::info!("track received: id={}, ssrc={}", track.id(), track.ssrc());
                    let _ = events.send(EngineMessage::MediaTrack {
                        track,
                        receiver,
                        transceiver,
                    });
                }))
            }
        )));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::debug!("ICE gathering state changed: {}", state);
            })
        }));

        peer.on_signaling_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::trace!("{} signaling state changed: {}", role, state);
            })
        }));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        tracing::trace!("{} transport {} is dropped", self.role, self.id);
    }
}

fn state_to_u8(state: RTCPeerConnectionState) -> u8 {
    match state {
        RTCPeerConnectionState::Unspecified => 0,
        RTCPeerConnectionState::New => 1,
        RTCPeerConnectionState::Connecting => 2,
        RTCPeerConnectionState::Connected => 3,
        RTCPeerConnectionState::Disconnected => 4,
        RTCPeerConnectionState::Failed => 5,
        RTCPeerConnectionState::Closed => 6,
    }
}

fn state_from_u8(raw: u8) -> RTCPeerConnectionState {
    match raw {
        1 => RTCPeerConnectionState::New,
        2 => RTCPeerConnectionState::Connecting,
        3 => RTCPeerConnectionState::Connected,
        4 => RTCPeerConnectionState::Disconnected,
        5 => RTCPeerConnectionState::Failed,
        6 => RTCPeerConnectionState::Closed,
        _ => RTCPeerConnectionState::Unspecified,
    }
}
