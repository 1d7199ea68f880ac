use super::session::StreamingLogEntry;
use crate::protocol::{FunctionCall, Part};
use strum::{Display, IntoStaticStr};

/// Lifecycle of one connection.
///
/// `Idle -> Connecting -> AwaitingSetupAck -> Active -> Closing -> Closed`, with `Errored`
/// reachable from any open state and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingSetupAck,
    Active,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    /// A transport exists or is being established.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::AwaitingSetupAck | ConnectionState::Active
        )
    }

    pub fn can_open(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closed)
    }
}

/// Everything the client reports to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ClientEvent {
    /// Setup acknowledged; sends are now accepted.
    Open,
    Close(String),
    Error(String),
    /// Raw s16le PCM as received, already handed to playback.
    Audio(Vec<u8>),
    Content(Part),
    Interrupted,
    #[strum(serialize = "turnComplete")]
    TurnComplete,
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    Log(StreamingLogEntry),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
