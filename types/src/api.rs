//! Request/response bodies for the HTTP API and the application-level close
//! codes used by the terminal WebSocket.

use serde::{Deserialize, Serialize};

use crate::{GameOutcome, SessionStatus};

/// WebSocket close codes sent by the terminal bridge. Each failure class has
/// its own code so callers can tell them apart.
pub mod close {
    /// Bad or missing access token.
    pub const BAD_TOKEN: u16 = 4401;
    /// Session exists but has no provisioned credentials yet.
    pub const MISSING_CREDENTIALS: u16 = 4402;
    /// Session is not in a playable state.
    pub const NOT_PLAYABLE: u16 = 4403;
    /// No session with that id.
    pub const NOT_FOUND: u16 = 4404;
    /// Spawning the interactive process failed.
    pub const CONNECT_FAILED: u16 = 4500;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlayRequest {
    /// Lightning address for the payout on ascension.
    pub lightning_address: Option<String>,
    /// Optional email for confirmation and result notifications.
    pub email: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetAddressRequest {
    pub lightning_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvoiceResponse {
    pub session_id: i64,
    /// Bearer token for later credential access.
    pub access_token: String,
    /// BOLT11 invoice to pay.
    pub payment_request: String,
    pub payment_hash: String,
    pub amount_sats: u64,
    pub expires_in_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: i64,
    pub status: SessionStatus,
    /// Only present while the session is active or playing and the caller
    /// holds the access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,
    pub lightning_address: Option<String>,
    pub ante_sats: u64,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PotResponse {
    pub balance_sats: u64,
    pub ante_sats: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameSummary {
    pub id: i64,
    pub username: String,
    pub character_name: String,
    pub death_reason: String,
    pub score: i64,
    pub turns: i64,
    pub ascended: bool,
    pub payout_sats: Option<u64>,
    pub ended_at: String,
}

impl GameSummary {
    pub fn from_outcome(outcome: &GameOutcome, username: String) -> Self {
        GameSummary {
            id: outcome.id,
            username,
            character_name: outcome.character_name.clone(),
            death_reason: outcome.death_reason.clone(),
            score: outcome.score,
            turns: outcome.turns,
            ascended: outcome.ascended,
            payout_sats: outcome.payout_sats,
            ended_at: outcome.ended_at.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub pot_balance: u64,
    pub total_games: u64,
    pub total_ascensions: u64,
    pub high_score: Option<i64>,
    pub avg_score: Option<f64>,
    pub recent_games: Vec<GameSummary>,
    pub leaderboard: Vec<GameSummary>,
    pub ascensions: Vec<GameSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pot_balance: u64,
    pub active_sessions: u64,
    pub mock_mode: bool,
}

/// Payment provider webhook envelope. The provider posts the entity id only;
/// the invoice state is re-checked against the provider before confirming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub data: WebhookData,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WebhookData {
    #[serde(rename = "entityId")]
    pub entity_id: Option<String>,
}
