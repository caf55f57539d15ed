use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    EngineError(#[from] EngineError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    TrackError(#[from] TrackError),
    #[error(transparent)]
    DataError(#[from] DataError),
    #[error(transparent)]
    SignalError(#[from] SignalError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TrackError {
    pub kind: TrackErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DataError {
    pub kind: DataErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalError {
    pub kind: SignalErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineErrorKind {
    #[error("engine closed")]
    Closed,
    #[error("invalid state")]
    InvalidState,
    #[error("not connected")]
    NotConnected,
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("reconnect exhausted")]
    ReconnectExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("transport closed")]
    Closed,
    #[error("sdp apply error")]
    SdpApplyError,
    #[error("operation cancelled")]
    OperationCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackErrorKind {
    #[error("duplicate publication")]
    DuplicatePublication,
    #[error("publication cancelled")]
    PublicationCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum DataErrorKind {
    #[error("data channel not available")]
    ChannelNotAvailable,
    #[error("data packet too large")]
    PacketTooLarge,
    #[error("data channel not open")]
    ChannelNotOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalErrorKind {
    #[error("signal closed")]
    Closed,
    #[error("signal request error")]
    RequestError,
}

impl Error {
    pub fn new_engine(message: String, kind: EngineErrorKind) -> Error {
        Error::EngineError(EngineError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_track(message: String, kind: TrackErrorKind) -> Error {
        Error::TrackError(TrackError { kind, message })
    }

    pub fn new_data(message: String, kind: DataErrorKind) -> Error {
        Error::DataError(DataError { kind, message })
    }

    pub fn new_signal(message: String, kind: SignalErrorKind) -> Error {
        Error::SignalError(SignalError { kind, message })
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roomlink::EngineError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roomlink::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roomlink::TrackError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roomlink::DataError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("roomlink::SignalError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
