//! The engine side of the signaling link. The wire codec (websocket, protobuf
//! envelopes, request ids) lives behind [`SignalLink`]; the engine only sees
//! typed commands and the [`SignalEvent`] stream.

use async_trait::async_trait;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::config::{ConnectOptions, RoomOptions};
use crate::error::Error;
use crate::protocol::{
    AddTrackRequest, ConnectionQualityInfo, DisconnectReason, JoinResponse, ParticipantInfo,
    ReconnectResponse, RoomInfo, SpeakerInfo, StreamStateInfo, SubscribedQualityUpdate,
    SubscriptionPermissionUpdate, SyncState, TrackInfo, TrackPermission,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

/// Outcome of a resume attempt: the server either accepts the session or
/// tells the client to start over with a fresh join.
#[derive(Debug)]
pub enum ReconnectOutcome {
    Resumed(ReconnectResponse),
    FullReconnectRequired,
}

/// Everything the server can push at the engine, as one tagged union. The
/// link implementation feeds these into the channel handed to the engine at
/// construction time.
#[derive(Clone, Debug)]
pub enum SignalEvent {
    Answer(RTCSessionDescription),
    Offer(RTCSessionDescription),
    Trickle {
        target: SignalTarget,
        candidate: RTCIceCandidateInit,
    },
    LocalTrackPublished {
        cid: String,
        track: TrackInfo,
    },
    LocalTrackUnpublished {
        track_sid: String,
    },
    ParticipantUpdate(Vec<ParticipantInfo>),
    SpeakersChanged(Vec<SpeakerInfo>),
    ActiveSpeakers(Vec<SpeakerInfo>),
    ConnectionQuality(Vec<ConnectionQualityInfo>),
    RoomUpdate(RoomInfo),
    MuteChanged {
        track_sid: String,
        muted: bool,
    },
    StreamStateUpdate(Vec<StreamStateInfo>),
    SubscribedQualityUpdate(SubscribedQualityUpdate),
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    RefreshToken(String),
    Leave {
        can_reconnect: bool,
        reason: DisconnectReason,
    },
    Close {
        reason: String,
        code: u16,
    },
    Error(String),
}

/// Commands the engine issues towards the server. Implementations must be
/// safe for sequential submission from a single caller; the engine guarantees
/// that discipline.
#[async_trait]
pub trait SignalLink: Send + Sync {
    async fn join(
        &self,
        url: &str,
        token: &str,
        options: &ConnectOptions,
        room_options: &RoomOptions,
    ) -> Result<JoinResponse, Error>;

    async fn reconnect(
        &self,
        url: &str,
        token: &str,
        participant_sid: &str,
    ) -> Result<ReconnectOutcome, Error>;

    async fn send_offer(&self, sdp: RTCSessionDescription) -> Result<(), Error>;

    async fn send_answer(&self, sdp: RTCSessionDescription) -> Result<(), Error>;

    async fn send_trickle(
        &self,
        target: SignalTarget,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error>;

    async fn send_add_track(&self, request: AddTrackRequest) -> Result<(), Error>;

    async fn send_mute_track(&self, track_sid: &str, muted: bool) -> Result<(), Error>;

    async fn send_update_subscription_permissions(
        &self,
        all_participants: bool,
        permissions: Vec<TrackPermission>,
    ) -> Result<(), Error>;

    async fn send_sync_state(&self, state: SyncState) -> Result<(), Error>;

    /// Tells the server the client is ready for responses that follow the
    /// join handshake.
    async fn notify_ready_for_responses(&self);

    /// Tells the server the primary peer connection reached connected.
    async fn notify_pc_connected(&self);

    async fn close(&self, reason: &str);
}
