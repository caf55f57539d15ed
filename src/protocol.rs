//! Typed payloads exchanged with the conference server, plus the framing used
//! on the data channels. The schema is owned by the server; this module only
//! mirrors the fields the engine consumes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::MAX_DATA_PACKET_SIZE;
use crate::error::{DataErrorKind, Error};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceServerSpec {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServerSpec {
    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfiguration {
    pub force_relay: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinResponse {
    pub room: RoomInfo,
    pub participant: ParticipantInfo,
    pub other_participants: Vec<ParticipantInfo>,
    pub subscriber_primary: bool,
    pub ice_servers: Vec<IceServerSpec>,
    pub client_configuration: Option<ClientConfiguration>,
    pub server_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectResponse {
    pub ice_servers: Vec<IceServerSpec>,
    pub client_configuration: Option<ClientConfiguration>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomInfo {
    pub sid: String,
    pub name: String,
    pub metadata: String,
    pub num_participants: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub name: String,
    pub metadata: String,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Audio,
    Video,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub sid: String,
    pub name: String,
    pub kind: TrackKind,
    pub muted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddTrackRequest {
    pub cid: String,
    pub name: String,
    pub kind: TrackKind,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPacketKind {
    #[default]
    Reliable,
    Lossy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    pub kind: DataPacketKind,
    pub value: DataPacketValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataPacketValue {
    Speaker { speakers: Vec<SpeakerInfo> },
    User(UserPacket),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakerInfo {
    pub sid: String,
    pub level: f32,
    pub active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPacket {
    pub participant_sid: String,
    pub payload: Vec<u8>,
    pub destination_sids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataChannelInfo {
    pub id: u16,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDescriptionInfo {
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateSubscription {
    pub track_sids: Vec<String>,
    pub subscribe: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    pub answer: Option<SessionDescriptionInfo>,
    pub subscription: UpdateSubscription,
    pub publish_tracks: Vec<TrackInfo>,
    pub data_channels: Vec<DataChannelInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackPermission {
    pub participant_sid: String,
    pub all_tracks: bool,
    pub track_sids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Excellent,
    Good,
    Poor,
    Lost,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionQualityInfo {
    pub participant_sid: String,
    pub quality: ConnectionQuality,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Active,
    Paused,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamStateInfo {
    pub participant_sid: String,
    pub track_sid: String,
    pub state: StreamState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribedQuality {
    pub quality: VideoQuality,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribedQualityUpdate {
    pub track_sid: String,
    pub subscribed_qualities: Vec<SubscribedQuality>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionPermissionUpdate {
    pub participant_sid: String,
    pub track_sid: String,
    pub allowed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    #[default]
    UnknownReason,
    ClientInitiated,
    DuplicateIdentity,
    ServerShutdown,
    ParticipantRemoved,
    RoomDeleted,
    StateMismatch,
    JoinFailure,
}

/// Frames a [`DataPacket`] for the wire: a big-endian length prefix followed
/// by the serialized body. Fails before any bytes are produced when the frame
/// would exceed [`MAX_DATA_PACKET_SIZE`].
pub fn encode_data_packet(packet: &DataPacket) -> Result<Bytes, Error> {
    let body = serde_json::to_vec(packet)?;
    let framed_len = body.len() + 4;
    if framed_len > MAX_DATA_PACKET_SIZE {
        return Err(Error::new_data(
            format!(
                "data packet is {} bytes, limit is {}",
                framed_len, MAX_DATA_PACKET_SIZE
            ),
            DataErrorKind::PacketTooLarge,
        ));
    }

    let mut buf = Vec::with_capacity(framed_len);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(Bytes::from(buf))
}

/// Parses an inbound frame. Empty, truncated, or unparseable frames yield
/// `None`; callers drop those.
pub fn decode_data_packet(data: &[u8]) -> Option<DataPacket> {
    if data.len() < 4 {
        return None;
    }
    let body_len = u32::from_be_bytes(data[0..4].try_into().ok()?) as usize;
    if body_len == 0 || data.len() < 4 + body_len {
        return None;
    }
    serde_json::from_slice(&data[4..4 + body_len]).ok()
}
