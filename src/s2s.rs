use thiserror::Error;

pub mod connection;
pub mod context;
pub mod dialback;
pub mod frames;
pub mod incoming;
pub mod outgoing;

#[cfg(test)]
mod testing;

/// Failures of a federation session. Everything here terminates the session
/// it occurred on; nothing escalates past the owning domain context.
#[derive(Debug, Error)]
pub enum S2sError {
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    #[error("sasl authentication failed: {0}")]
    Sasl(String),

    #[error("dialback authentication failed: {0}")]
    Dialback(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The closed set of stream error conditions this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    ImproperAddressing,
    InvalidFrom,
    Conflict,
    UndefinedCondition,
    HostUnknown,
    RemoteConnectionFailed,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCondition::ImproperAddressing => "improper-addressing",
            StreamErrorCondition::InvalidFrom => "invalid-from",
            StreamErrorCondition::Conflict => "conflict",
            StreamErrorCondition::UndefinedCondition => "undefined-condition",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::RemoteConnectionFailed => "remote-connection-failed",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
