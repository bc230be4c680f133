//! Fire-and-forget player notifications.
//!
//! Delivery is a best-effort side effect: nothing in the pipeline waits on
//! it or fails because of it. Message formatting/transport (SMTP) lives
//! outside this service; this implementation records the notification in
//! the log where an external relay picks it up.

use tracing::info;
use valhalla_types::{NewOutcome, Session};

pub struct Notifier;

impl Notifier {
    pub fn new() -> Self {
        Notifier
    }

    pub fn payment_confirmed(&self, email: &str, session: &Session, pot_balance: u64, hostname: &str) {
        info!(
            target: "valhalla::notify",
            email,
            session_id = session.id,
            username = %session.username,
            pot_balance,
            hostname,
            "notify: payment confirmed"
        );
    }

    pub fn game_result(&self, email: &str, outcome: &NewOutcome, pot_balance: Option<u64>) {
        info!(
            target: "valhalla::notify",
            email,
            session_id = outcome.session_id,
            character = %outcome.character_name,
            score = outcome.score,
            turns = outcome.turns,
            ascended = outcome.ascended,
            payout_sats = ?outcome.payout_sats,
            pot_balance = ?pot_balance,
            "notify: game result"
        );
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
