use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Lifecycle of a play session. Transitions are monotonic:
/// pending -> active -> (playing) -> ended. There is no way back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Playing,
    Ended,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("unknown session status: {0}")]
pub struct StatusParseError(pub String);

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Playing => "playing",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StatusParseError> {
        match value {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "playing" => Ok(SessionStatus::Playing),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(StatusParseError(other.to_string())),
        }
    }

    /// A session in one of these states owns its provisioned account and may
    /// attach a terminal.
    pub fn is_playable(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Playing)
    }
}

/// One play attempt, from invoice issuance to game end. Rows are never
/// deleted; ended sessions remain as the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub lightning_address: Option<String>,
    pub email: Option<String>,
    /// OS uid bound to this session once the account is provisioned. Also
    /// the correlation key joining xlogfile records back to the session.
    pub linux_uid: Option<u32>,
    pub payment_hash: String,
    pub ante_sats: u64,
    pub status: SessionStatus,
    pub created_at: String,
    pub ended_at: Option<String>,
}

/// Fields required to insert a new pending session.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub payment_hash: String,
    pub ante_sats: u64,
    pub lightning_address: Option<String>,
    pub email: Option<String>,
}
