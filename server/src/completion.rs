//! Ties a parsed xlogfile record back to its session and closes it out:
//! payout on a genuine win, outcome row, terminal status transition, then
//! best-effort account cleanup and notification.

use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};
use valhalla_ledger::LedgerError;
use valhalla_types::NewOutcome;

use crate::payout::{self, PayoutError};
use crate::xlog::XlogRecord;
use crate::Arena;

#[derive(Debug, ThisError)]
pub enum CompletionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Payout(#[from] PayoutError),
}

/// Handle one completed game. Records that cannot be correlated to a live
/// session are dropped silently: they belong to untracked players or to
/// sessions that already ended.
pub async fn handle_record(arena: &Arena, record: &XlogRecord) -> Result<(), CompletionError> {
    let Some(uid) = record.uid else {
        warn!(character = %record.name, "xlogfile record has no uid");
        arena.metrics.inc_records_dropped();
        return Ok(());
    };

    let Some(session) = arena.ledger.session_by_uid(uid)? else {
        debug!(uid, "no active session for uid");
        arena.metrics.inc_records_dropped();
        return Ok(());
    };

    let cheat = record.flags.cheat_flagged();
    let won = record.won(&arena.config.win_keyword);
    if cheat {
        warn!(
            uid,
            character = %record.name,
            mode = record.flags.mode_label().unwrap_or(""),
            "cheat mode game detected"
        );
    } else {
        info!(
            uid,
            character = %record.name,
            death = %record.death,
            score = record.score(),
            "game ended"
        );
    }

    // A genuine win pays out synchronously so the recorded outcome carries
    // the actual result, not an assumed one.
    let mut payout = None;
    if won && !cheat {
        info!(uid, character = %record.name, session_id = session.id, "ascension");
        arena.metrics.inc_ascensions();
        payout = payout::handle_win(arena, &session).await?;
        if payout.is_none() {
            error!(
                session_id = session.id,
                "ascension recorded without a payout"
            );
        }
    } else if won && cheat {
        warn!(uid, session_id = session.id, "cheat mode ascension, no payout");
    }

    let death_reason = match record.flags.mode_label() {
        Some(label) => format!("[{label}] {}", record.death),
        None => record.death.clone(),
    };
    let outcome = NewOutcome {
        session_id: session.id,
        character_name: record.name.clone(),
        death_reason,
        score: if cheat { 0 } else { record.score() },
        turns: record.turns,
        ascended: won && !cheat,
        payout_sats: payout.as_ref().map(|payout| payout.amount_sats),
        payout_hash: payout.as_ref().map(|payout| payout.payment_hash.clone()),
        role: record.role.clone(),
        race: record.race.clone(),
        gender: record.gender.clone(),
        align: record.align.clone(),
        deathlev: record.deathlev,
        hp: record.hp,
        maxhp: record.maxhp,
        conduct: record.conduct.clone(),
        achieve: record.achieve.clone(),
    };
    arena.ledger.record_outcome(&outcome)?;
    arena.metrics.inc_outcomes_recorded();

    if !arena.ledger.end_session(session.id)? {
        warn!(session_id = session.id, "session was already ended");
    }

    // The session is durably ended; cleanup failures below are logged and
    // left for manual remediation.
    if let Some(email) = &session.email {
        let pot_balance = arena.ledger.pot_balance().ok();
        arena.notifier.game_result(email, &outcome, pot_balance);
    }
    if let Err(err) = arena.provisioner.deprovision(&session.username).await {
        error!(%err, username = %session.username, "failed to clean up player account");
    } else {
        info!(username = %session.username, "cleaned up player account");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_arena, mock_arena_with, playing_session};
    use crate::users::MockProvisioner;
    use crate::xlog::{parse_line, GameFlags};
    use crate::ServerConfig;
    use valhalla_lightning::MockClient;
    use valhalla_types::SessionStatus;

    fn death_record(uid: u32) -> XlogRecord {
        XlogRecord {
            uid: Some(uid),
            name: "Hero".into(),
            death: "killed by a jackal".into(),
            points: 1234,
            turns: 100,
            ..XlogRecord::default()
        }
    }

    fn win_record(uid: u32) -> XlogRecord {
        XlogRecord {
            death: "ascended to demigoddess-hood".into(),
            points: 999_999,
            ..death_record(uid)
        }
    }

    #[tokio::test]
    async fn unknown_uid_is_dropped_silently() {
        let arena = mock_arena();
        handle_record(&arena, &death_record(4242)).await.unwrap();
        assert_eq!(arena.metrics.snapshot().records_dropped, 1);
        assert_eq!(arena.metrics.snapshot().outcomes_recorded, 0);
    }

    #[tokio::test]
    async fn record_without_uid_is_dropped_silently() {
        let arena = mock_arena();
        let mut record = death_record(1);
        record.uid = None;
        handle_record(&arena, &record).await.unwrap();
        assert_eq!(arena.metrics.snapshot().records_dropped, 1);
    }

    #[tokio::test]
    async fn normal_death_records_outcome_and_ends_session() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);

        handle_record(&arena, &death_record(1001)).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.character_name, "Hero");
        assert_eq!(outcome.score, 1234);
        assert!(!outcome.ascended);
        assert!(outcome.payout_sats.is_none());
        assert_eq!(
            arena.ledger.session(session.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
        // The pot keeps the ante; losses feed the next winner.
        assert_eq!(
            arena.ledger.pot_balance().unwrap(),
            arena.config.pot_seed_sats + arena.config.ante_sats
        );
        // The account was cleaned up.
        let crate::users::Provisioner::Mock(mock) = &arena.provisioner else {
            unreachable!()
        };
        assert_eq!(
            mock.removed.lock().unwrap().as_slice(),
            [session.username.clone()]
        );
    }

    #[tokio::test]
    async fn ascension_pays_the_pot_and_records_the_amount() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);
        let pre_drain = arena.ledger.pot_balance().unwrap();

        handle_record(&arena, &win_record(1001)).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(outcome.ascended);
        assert_eq!(outcome.payout_sats, Some(pre_drain));
        assert!(outcome.payout_hash.is_some());
        assert_eq!(
            arena.ledger.pot_balance().unwrap(),
            arena.config.pot_seed_sats
        );
        assert_eq!(
            arena.ledger.session(session.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn failed_payout_still_records_the_win() {
        let arena = mock_arena_with(
            ServerConfig::default(),
            MockClient::failing(),
            MockProvisioner::new(),
        );
        let session = playing_session(&arena, 1, 1001);
        let pre_drain = arena.ledger.pot_balance().unwrap();

        handle_record(&arena, &win_record(1001)).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(outcome.ascended);
        assert_eq!(outcome.payout_sats, None);
        assert_eq!(outcome.payout_hash, None);
        // Compensation restored the pre-drain balance exactly.
        assert_eq!(arena.ledger.pot_balance().unwrap(), pre_drain);
        assert_eq!(
            arena.ledger.session(session.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn cheat_win_is_suppressed_and_tagged() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);
        let balance = arena.ledger.pot_balance().unwrap();

        let mut record = win_record(1001);
        record.flags = GameFlags {
            wizard: true,
            explore: false,
        };
        handle_record(&arena, &record).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(!outcome.ascended);
        assert_eq!(outcome.score, 0);
        assert!(outcome.death_reason.starts_with("[WIZARD MODE] "));
        assert!(outcome.payout_sats.is_none());
        // Nothing was drained for the cheated win.
        assert_eq!(arena.ledger.pot_balance().unwrap(), balance);
        assert_eq!(
            arena.ledger.session(session.id).unwrap().unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn explore_mode_death_is_tagged_but_recorded() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);

        let mut record = death_record(1001);
        record.flags = GameFlags {
            wizard: false,
            explore: true,
        };
        handle_record(&arena, &record).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(outcome.death_reason.starts_with("[EXPLORE MODE] "));
        assert_eq!(outcome.score, 0);
    }

    #[tokio::test]
    async fn second_record_for_same_uid_is_dropped() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1001);

        handle_record(&arena, &death_record(1001)).await.unwrap();
        // The session ended, so the uid no longer resolves.
        handle_record(&arena, &win_record(1001)).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(!outcome.ascended);
        assert_eq!(arena.metrics.snapshot().outcomes_recorded, 1);
        assert_eq!(arena.metrics.snapshot().records_dropped, 1);
    }

    #[tokio::test]
    async fn parsed_line_flows_through_end_to_end() {
        let arena = mock_arena();
        let session = playing_session(&arena, 1, 1042);
        let pre_drain = arena.ledger.pot_balance().unwrap();

        let record = parse_line(
            "version=3.6.6\tpoints=54321\tuid=1042\trole=Val\trace=Hum\tgender=Fem\talign=Neu\t\
             name=Siegfried\tdeath=ascended\tturns=40000\tflags=0x0",
        )
        .unwrap();
        handle_record(&arena, &record).await.unwrap();

        let outcome = arena
            .ledger
            .outcome_for_session(session.id)
            .unwrap()
            .unwrap();
        assert!(outcome.ascended);
        assert_eq!(outcome.payout_sats, Some(pre_drain));
        assert_eq!(outcome.role.as_deref(), Some("Val"));
    }
}
