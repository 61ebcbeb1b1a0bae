use crate::gateway::GatewayError;

/// Why a user message could not be answered.
///
/// The conversation stays usable after any of these, the next message to
/// the same thread starts a fresh loop.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    /// The model could not be reached or did not answer in time.
    #[error("model unavailable: {0}")]
    GatewayUnavailable(String),
    /// The model answered something that could not be understood.
    #[error("model protocol error: {0}")]
    GatewayProtocol(String),
    /// The model kept requesting tools.
    #[error("no final answer after {limit} model calls")]
    IterationLimitExceeded {
        /// The configured number of model calls.
        limit: usize,
    },
    /// The caller cancelled the turn.
    #[error("turn cancelled")]
    Cancelled,
    /// The message was already handled.
    #[error("duplicate message")]
    DuplicateMessage,
}

impl TurnError {
    /// Returns the single line shown to the user in place of an answer.
    ///
    /// Details are only logged, never shown.
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::GatewayUnavailable(_) | TurnError::GatewayProtocol(_) => {
                "Sorry, I encountered an error processing your message. Please try again."
            }
            TurnError::IterationLimitExceeded { .. } => {
                "Sorry, I couldn't finish working on your message. Please try rephrasing it."
            }
            TurnError::Cancelled => "The request was cancelled.",
            TurnError::DuplicateMessage => "This message has already been handled.",
        }
    }
}

impl From<GatewayError> for TurnError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(reason) => TurnError::GatewayUnavailable(reason),
            GatewayError::Protocol(reason) => TurnError::GatewayProtocol(reason),
        }
    }
}
