use serde::{Deserialize, Serialize};

/// A completed game, derived from one xlogfile record and permanently
/// attached to its session. At most one outcome exists per session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameOutcome {
    pub id: i64,
    pub session_id: i64,
    pub character_name: String,
    pub death_reason: String,
    pub score: i64,
    pub turns: i64,
    pub ascended: bool,
    pub payout_sats: Option<u64>,
    pub payout_hash: Option<String>,
    pub role: Option<String>,
    pub race: Option<String>,
    pub gender: Option<String>,
    pub align: Option<String>,
    pub deathlev: Option<i64>,
    pub hp: Option<i64>,
    pub maxhp: Option<i64>,
    pub conduct: Option<String>,
    pub achieve: Option<String>,
    pub ended_at: String,
}

/// Fields required to record a new outcome.
#[derive(Clone, Debug, Default)]
pub struct NewOutcome {
    pub session_id: i64,
    pub character_name: String,
    pub death_reason: String,
    pub score: i64,
    pub turns: i64,
    pub ascended: bool,
    pub payout_sats: Option<u64>,
    pub payout_hash: Option<String>,
    pub role: Option<String>,
    pub race: Option<String>,
    pub gender: Option<String>,
    pub align: Option<String>,
    pub deathlev: Option<i64>,
    pub hp: Option<i64>,
    pub maxhp: Option<i64>,
    pub conduct: Option<String>,
    pub achieve: Option<String>,
}
