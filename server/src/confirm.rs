//! Payment confirmation gate.
//!
//! Both the provider webhook and the status-poll path land here, possibly
//! concurrently for the same session. The ledger's conditional
//! activate-and-credit is the only mutation point, so any number of racing
//! callers converge on exactly one transition and one pot credit; the
//! losers observe `already_processed`.

use thiserror::Error as ThisError;
use tracing::{error, info};
use valhalla_ledger::LedgerError;
use valhalla_types::Session;

use crate::Arena;

/// How a caller identifies the session to confirm.
#[derive(Clone, Debug)]
pub enum SessionKey {
    Id(i64),
    PaymentHash(String),
}

#[derive(Debug, ThisError)]
pub enum ConfirmError {
    #[error("session not found")]
    NotFound,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug)]
pub struct Confirmation {
    /// True when another caller already activated the session; this call
    /// had no side effects.
    pub already_processed: bool,
    pub session: Session,
    /// Pot balance after the ante credit; only set by the winning caller.
    pub pot_balance: Option<u64>,
}

pub async fn confirm_payment(arena: &Arena, key: SessionKey) -> Result<Confirmation, ConfirmError> {
    let session = match &key {
        SessionKey::Id(id) => arena.ledger.session(*id)?,
        SessionKey::PaymentHash(hash) => arena.ledger.session_by_payment_hash(hash)?,
    }
    .ok_or(ConfirmError::NotFound)?;

    let Some(pot_balance) = arena
        .ledger
        .activate_if_pending(session.id, session.ante_sats)?
    else {
        info!(
            session_id = session.id,
            status = session.status.as_str(),
            "payment already processed"
        );
        let session = arena
            .ledger
            .session(session.id)?
            .ok_or(ConfirmError::NotFound)?;
        return Ok(Confirmation {
            already_processed: true,
            session,
            pot_balance: None,
        });
    };
    arena.metrics.inc_payments_confirmed();
    info!(
        session_id = session.id,
        username = %session.username,
        ante_sats = session.ante_sats,
        pot_balance,
        "payment confirmed, ante credited"
    );

    // The transition above is the source of truth. Provisioning and
    // notification failures below are logged for out-of-band remediation
    // and never reverse the activation or the pot credit.
    match arena
        .provisioner
        .provision(&session.username, &session.password)
        .await
    {
        Ok(uid) => {
            if let Err(err) = arena.ledger.set_linux_uid(session.id, uid) {
                error!(%err, session_id = session.id, uid, "failed to persist linux uid");
            } else {
                info!(username = %session.username, uid, "provisioned player account");
            }
        }
        Err(err) => {
            error!(%err, username = %session.username, "failed to provision player account");
        }
    }

    if let Some(email) = &session.email {
        arena
            .notifier
            .payment_confirmed(email, &session, pot_balance, &arena.config.hostname);
    }

    let session = arena
        .ledger
        .session(session.id)?
        .ok_or(ConfirmError::NotFound)?;
    Ok(Confirmation {
        already_processed: false,
        session,
        pot_balance: Some(pot_balance),
    })
}
