use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure codes carried in `{"msg": "failed", "info": <reason>}` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    BadDirection,
    BadParams,
    BadMotors,
    BadAction,
    Blocked,
    TopLimit,
    BottomLimit,
    UnknownCmd,
    ParsingError,
    BadRoi,
    UnknownRover,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::BadDirection => "bad_direction",
            Reason::BadParams => "bad_params",
            Reason::BadMotors => "bad_motors",
            Reason::BadAction => "bad_action",
            Reason::Blocked => "blocked",
            Reason::TopLimit => "top_limit",
            Reason::BottomLimit => "bottom_limit",
            Reason::UnknownCmd => "unknown_cmd",
            Reason::ParsingError => "parsing_error",
            Reason::BadRoi => "bad_roi",
            Reason::UnknownRover => "unknown_rover",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(Reason),

    #[error("unknown rover: {0}")]
    UnknownRover(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("session closed")]
    SessionClosed,
}

impl From<Reason> for ProxyError {
    fn from(r: Reason) -> Self {
        ProxyError::Protocol(r)
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
