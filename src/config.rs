use std::fmt;
use std::time::Duration;

use derivative::Derivative;
use webrtc::{
    api::setting_engine::SettingEngine,
    peer_connection::{
        configuration::RTCConfiguration, policy::ice_transport_policy::RTCIceTransportPolicy,
    },
};

use crate::protocol::IceServerSpec;

pub const MAX_RECONNECT_RETRIES: u32 = 10;
pub const MAX_RECONNECT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const MAX_ICE_CONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const MAX_DATA_PACKET_SIZE: usize = 15_000;
pub const DATA_CHANNEL_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconnectType {
    #[default]
    Default,
    ForceSoftReconnect,
    ForceFullReconnect,
}

/// Options fixed for the lifetime of one session, captured at join time.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct ConnectOptions {
    pub reconnect_type: ReconnectType,
    /// When nonempty, wins over anything the server hands out.
    pub ice_servers: Vec<IceServerSpec>,
    /// Full configuration override. ICE servers are still merged on top.
    #[derivative(Debug = "ignore")]
    pub rtc_config: Option<RTCConfiguration>,
}

#[derive(Clone, Debug)]
pub struct RoomOptions {
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            adaptive_stream: false,
        }
    }
}

/// Timing knobs for the engine. The defaults are the values used against
/// production servers; tests shrink them.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_reconnect_retries: u32,
    pub max_reconnect_timeout: Duration,
    pub ice_connect_timeout: Duration,
    pub data_channel_open_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reconnect_retries: MAX_RECONNECT_RETRIES,
            max_reconnect_timeout: MAX_RECONNECT_TIMEOUT,
            ice_connect_timeout: MAX_ICE_CONNECT_TIMEOUT,
            data_channel_open_poll_interval: DATA_CHANNEL_OPEN_POLL_INTERVAL,
        }
    }
}

/// Per-transport RTC configuration, paired with the engine settings used to
/// build the underlying API object.
#[derive(Clone, Default)]
pub struct RtcConfig {
    pub configuration: RTCConfiguration,
    pub setting_engine: SettingEngine,
}

impl fmt::Debug for RtcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcConfig")
            .field("ice_servers", &self.configuration.ice_servers)
            .field("ice_transport_policy", &self.configuration.ice_transport_policy)
            .finish()
    }
}

/// Builds the configuration applied to both transports at join time.
///
/// Caller-provided ICE servers win over the server's; the default STUN server
/// is used only when both lists are empty. Duplicates are collapsed by
/// structural equality.
pub fn build_rtc_config(
    options: &ConnectOptions,
    server_ice_servers: &[IceServerSpec],
    force_relay: bool,
) -> RTCConfiguration {
    let mut configuration = options.rtc_config.clone().unwrap_or_default();

    let mut servers = dedup_servers(&options.ice_servers);
    if servers.is_empty() {
        servers = dedup_servers(server_ice_servers);
    }
    if servers.is_empty() {
        servers = vec![IceServerSpec {
            urls: vec![DEFAULT_STUN_URL.to_owned()],
            ..Default::default()
        }];
    }

    configuration.ice_servers = servers.iter().map(IceServerSpec::to_rtc).collect();
    if force_relay {
        configuration.ice_transport_policy = RTCIceTransportPolicy::Relay;
    }
    configuration
}

fn dedup_servers(list: &[IceServerSpec]) -> Vec<IceServerSpec> {
    let mut out: Vec<IceServerSpec> = Vec::new();
    for server in list {
        if !out.contains(server) {
            out.push(server.clone());
        }
    }
    out
}
