use std::sync::Arc;

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};
use webrtc::data_channel::{
    data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
    data_channel_state::RTCDataChannelState, RTCDataChannel,
};

use crate::engine::EngineMessage;
use crate::error::{DataErrorKind, Error};
use crate::protocol::{self, DataChannelInfo, DataPacket, DataPacketKind};
use crate::transport::Transport;

pub const RELIABLE_CHANNEL_LABEL: &str = "_reliable";
pub const LOSSY_CHANNEL_LABEL: &str = "_lossy";

/// The two logical channels per direction. Outbound channels are created on
/// the publisher at construction; inbound ones arrive later through the
/// subscriber's `on_data_channel` and are adopted by label.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DataChannelSet {
    #[derivative(Debug = "ignore")]
    reliable: Arc<RTCDataChannel>,
    #[derivative(Debug = "ignore")]
    lossy: Arc<RTCDataChannel>,
    #[derivative(Debug = "ignore")]
    reliable_inbound: Mutex<Option<Arc<RTCDataChannel>>>,
    #[derivative(Debug = "ignore")]
    lossy_inbound: Mutex<Option<Arc<RTCDataChannel>>>,
    #[derivative(Debug = "ignore")]
    events: mpsc::UnboundedSender<EngineMessage>,
}

impl DataChannelSet {
    pub(crate) async fn create(
        publisher: &Transport,
        events: mpsc::UnboundedSender<EngineMessage>,
    ) -> Result<Self, Error> {
        let reliable = publisher
            .create_data_channel(
                RELIABLE_CHANNEL_LABEL,
                RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        let lossy = publisher
            .create_data_channel(
                LOSSY_CHANNEL_LABEL,
                RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        Self::attach_packet_handler(&reliable, &events);
        Self::attach_packet_handler(&lossy, &events);

        Ok(Self {
            reliable,
            lossy,
            reliable_inbound: Mutex::new(None),
            lossy_inbound: Mutex::new(None),
            events,
        })
    }

    pub(crate) fn kind_for_label(label: &str) -> Option<DataPacketKind> {
        match label {
            RELIABLE_CHANNEL_LABEL => Some(DataPacketKind::Reliable),
            LOSSY_CHANNEL_LABEL => Some(DataPacketKind::Lossy),
            _ => None,
        }
    }

    /// Adopts a server-created channel delivered on the subscriber transport.
    /// Channels with unknown labels are discarded.
    pub(crate) async fn adopt_inbound(&self, channel: Arc<RTCDataChannel>) {
        match Self::kind_for_label(channel.label()) {
            Some(DataPacketKind::Reliable) => {
                tracing::debug!("adopting inbound reliable data channel: id={}", channel.id());
                Self::attach_packet_handler(&channel, &self.events);
                *self.reliable_inbound.lock().await = Some(channel);
            }
            Some(DataPacketKind::Lossy) => {
                tracing::debug!("adopting inbound lossy data channel: id={}", channel.id());
                Self::attach_packet_handler(&channel, &self.events);
                *self.lossy_inbound.lock().await = Some(channel);
            }
            None => {
                tracing::debug!("discarding data channel with unknown label: {}", channel.label());
            }
        }
    }

    fn attach_packet_handler(
        channel: &Arc<RTCDataChannel>,
        events: &mpsc::UnboundedSender<EngineMessage>,
    ) {
        let label = channel.label().to_owned();
        channel.on_message(Box::new(enc!( (events, label) move |message: DataChannelMessage| {
            Box::pin(enc!( (events, label) async move {
                match protocol::decode_data_packet(&message.data) {
                    Some(packet) => {
                        let _ = events.send(EngineMessage::IncomingData(packet));
                    }
                    None => tracing::debug!("dropping malformed data packet on {}", label),
                }
            }))
        })));
    }

    fn channel_for_kind(&self, kind: DataPacketKind) -> &Arc<RTCDataChannel> {
        match kind {
            DataPacketKind::Reliable => &self.reliable,
            DataPacketKind::Lossy => &self.lossy,
        }
    }

    /// Writes the packet on the channel matching its kind, polling until the
    /// channel opens or the timeout elapses.
    pub(crate) async fn send(
        &self,
        packet: &DataPacket,
        poll_interval: std::time::Duration,
        open_timeout: std::time::Duration,
    ) -> Result<(), Error> {
        let channel = self.channel_for_kind(packet.kind);

        let deadline = Instant::now() + open_timeout;
        while channel.ready_state() != RTCDataChannelState::Open {
            if Instant::now() >= deadline {
                return Err(Error::new_data(
                    format!(
                        "data channel {} did not open within {:?}",
                        channel.label(),
                        open_timeout
                    ),
                    DataErrorKind::ChannelNotOpen,
                ));
            }
            sleep(poll_interval).await;
        }

        let buf = protocol::encode_data_packet(packet)?;
        channel.send(&buf).await?;
        Ok(())
    }

    /// `DataChannelInfo` for the outbound channels, as reported in sync state.
    pub(crate) fn infos(&self) -> Vec<DataChannelInfo> {
        vec![
            DataChannelInfo {
                id: self.reliable.id(),
                label: self.reliable.label().to_owned(),
            },
            DataChannelInfo {
                id: self.lossy.id(),
                label: self.lossy.label().to_owned(),
            },
        ]
    }

    /// Unregisters observers and disposes all four channel handles.
    pub(crate) async fn close(&self) {
        let mut channels = vec![self.reliable.clone(), self.lossy.clone()];
        if let Some(channel) = self.reliable_inbound.lock().await.take() {
            channels.push(channel);
        }
        if let Some(channel) = self.lossy_inbound.lock().await.take() {
            channels.push(channel);
        }

        for channel in channels {
            channel.on_message(Box::new(|_| Box::pin(async {})));
            if let Err(err) = channel.close().await {
                tracing::error!("failed to close data channel {}: {}", channel.label(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::TransportRole;

    #[test]
    fn test_kind_for_label() {
        assert_eq!(
            DataChannelSet::kind_for_label(RELIABLE_CHANNEL_LABEL),
            Some(DataPacketKind::Reliable)
        );
        assert_eq!(
            DataChannelSet::kind_for_label(LOSSY_CHANNEL_LABEL),
            Some(DataPacketKind::Lossy)
        );
        assert_eq!(DataChannelSet::kind_for_label("_chat"), None);
    }

    #[tokio::test]
    async fn test_outbound_channels_use_normative_labels() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let publisher = Transport::new(TransportRole::Publisher, Default::default(), tx.clone())
            .await
            .expect("failed to create transport");
        let channels = DataChannelSet::create(&publisher, tx)
            .await
            .expect("failed to create data channels");

        let infos = channels.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].label, RELIABLE_CHANNEL_LABEL);
        assert_eq!(infos[1].label, LOSSY_CHANNEL_LABEL);
    }

    #[tokio::test]
    async fn test_send_fails_when_channel_never_opens() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let publisher = Transport::new(TransportRole::Publisher, Default::default(), tx.clone())
            .await
            .expect("failed to create transport");
        let channels = DataChannelSet::create(&publisher, tx)
            .await
            .expect("failed to create data channels");

        let packet = DataPacket {
            kind: DataPacketKind::Reliable,
            value: crate::protocol::DataPacketValue::User(Default::default()),
        };
        let res = channels
            .send(
                &packet,
                std::time::Duration::from_millis(10),
                std::time::Duration::from_millis(50),
            )
            .await;
        assert!(matches!(
            res,
            Err(Error::DataError(err)) if matches!(err.kind, DataErrorKind::ChannelNotOpen)
        ));
    }
}
