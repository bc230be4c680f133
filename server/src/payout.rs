//! Payout orchestration for winning sessions.
//!
//! The pot drain is the mutual-exclusion point: the conditional
//! read-and-reset happens in one ledger transaction, so two concurrent
//! wins can never both observe a positive balance. The destination is
//! validated before anything is drained, and a failed provider call
//! restores the exact pre-drain balance before returning.

use thiserror::Error as ThisError;
use tracing::{error, info, warn};
use valhalla_ledger::LedgerError;
use valhalla_lightning::is_payable_destination;
use valhalla_types::Session;

use crate::Arena;

#[derive(Clone, Debug)]
pub struct Payout {
    pub amount_sats: u64,
    /// Provider reference for the executed payment.
    pub payment_hash: String,
}

#[derive(Debug, ThisError)]
pub enum PayoutError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Drain the pot and pay it to the session's destination. `Ok(None)` means
/// no payout happened and the pot is unchanged (or restored); the caller
/// records the outcome accordingly.
pub async fn handle_win(arena: &Arena, session: &Session) -> Result<Option<Payout>, PayoutError> {
    let Some(destination) = session.lightning_address.as_deref() else {
        error!(
            session_id = session.id,
            "winning session has no payout destination"
        );
        return Ok(None);
    };
    // Validate before mutating: a doomed payout must not drain anything.
    if !is_payable_destination(destination) {
        error!(
            session_id = session.id,
            destination, "payout destination is not payable"
        );
        return Ok(None);
    }

    let pre_drain = arena.ledger.drain_pot()?;
    if pre_drain == 0 {
        warn!(session_id = session.id, "pot is empty, nothing to pay");
        return Ok(None);
    }

    info!(
        session_id = session.id,
        amount_sats = pre_drain,
        destination,
        "attempting payout"
    );
    let result = arena.lightning.pay_lnurl(destination, pre_drain).await;

    if result.success {
        let payment_hash = result.payment_hash.unwrap_or_default();
        arena.metrics.inc_payouts_sent();
        info!(
            session_id = session.id,
            amount_sats = pre_drain,
            payment_hash = %payment_hash,
            "payout sent"
        );
        Ok(Some(Payout {
            amount_sats: pre_drain,
            payment_hash,
        }))
    } else {
        arena.metrics.inc_payouts_failed();
        error!(
            session_id = session.id,
            error = result.error.as_deref().unwrap_or("unknown"),
            "payout failed, restoring pot"
        );
        // Compensate synchronously; a ledger failure here propagates
        // rather than being swallowed.
        arena.ledger.restore_pot(pre_drain)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_arena, mock_arena_with, playing_session};
    use crate::users::MockProvisioner;
    use crate::ServerConfig;
    use valhalla_lightning::MockClient;

    #[tokio::test]
    async fn successful_payout_drains_to_seed() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);
        let pre_drain = arena.ledger.pot_balance().unwrap();
        assert_eq!(
            pre_drain,
            arena.config.pot_seed_sats + arena.config.ante_sats
        );

        let payout = handle_win(&arena, &session).await.unwrap().unwrap();
        assert_eq!(payout.amount_sats, pre_drain);
        assert!(!payout.payment_hash.is_empty());
        assert_eq!(
            arena.ledger.pot_balance().unwrap(),
            arena.config.pot_seed_sats
        );
    }

    #[tokio::test]
    async fn failed_payout_restores_exact_balance() {
        let arena = mock_arena_with(
            ServerConfig::default(),
            MockClient::failing(),
            MockProvisioner::new(),
        );
        let session = playing_session(&arena, 1, 1001);
        let pre_drain = arena.ledger.pot_balance().unwrap();

        let payout = handle_win(&arena, &session).await.unwrap();
        assert!(payout.is_none());
        assert_eq!(arena.ledger.pot_balance().unwrap(), pre_drain);
    }

    #[tokio::test]
    async fn missing_destination_aborts_before_draining() {
        let arena = mock_arena();
        let mut session = playing_session(&arena, 1, 1001);
        session.lightning_address = None;
        let balance = arena.ledger.pot_balance().unwrap();

        assert!(handle_win(&arena, &session).await.unwrap().is_none());
        assert_eq!(arena.ledger.pot_balance().unwrap(), balance);
    }

    #[tokio::test]
    async fn invalid_destination_aborts_before_draining() {
        let arena = mock_arena();
        let mut session = playing_session(&arena, 1, 1001);
        session.lightning_address = Some("not-an-address".into());
        let balance = arena.ledger.pot_balance().unwrap();

        assert!(handle_win(&arena, &session).await.unwrap().is_none());
        assert_eq!(arena.ledger.pot_balance().unwrap(), balance);
    }

    #[tokio::test]
    async fn empty_pot_pays_nothing() {
        let mut config = ServerConfig::default();
        config.pot_seed_sats = 0;
        let arena = mock_arena_with(config, MockClient::new(), MockProvisioner::new());
        let session = playing_session(&arena, 1, 1001);
        // Drain what the ante credited, leaving a zero pot.
        arena.ledger.drain_pot().unwrap();
        assert_eq!(arena.ledger.pot_balance().unwrap(), 0);

        assert!(handle_win(&arena, &session).await.unwrap().is_none());
        assert_eq!(arena.ledger.pot_balance().unwrap(), 0);
    }
}
