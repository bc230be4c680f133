//! Durable store for sessions, game outcomes, and the shared pot.
//!
//! The ledger is the sole writer of persisted state. Status transitions and
//! pot mutations are exposed only as conditional, single-transaction
//! operations so that concurrent callers (webhook vs. status poll, payout
//! vs. ante credit) cannot interleave a read-then-write.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error as ThisError;
use valhalla_types::{GameOutcome, NewOutcome, NewSession, Session, SessionStatus};

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS pot (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    balance_sats INTEGER NOT NULL DEFAULT 0,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    username TEXT UNIQUE NOT NULL,
    password TEXT NOT NULL,
    access_token TEXT NOT NULL,
    lightning_address TEXT,
    email TEXT,
    linux_uid INTEGER,
    payment_hash TEXT UNIQUE NOT NULL,
    ante_sats INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'active', 'playing', 'ended')),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    ended_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS games (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    character_name TEXT NOT NULL DEFAULT '',
    death_reason TEXT NOT NULL DEFAULT '',
    score INTEGER NOT NULL DEFAULT 0,
    turns INTEGER NOT NULL DEFAULT 0,
    ascended BOOLEAN NOT NULL DEFAULT FALSE,
    payout_sats INTEGER,
    payout_hash TEXT,
    role TEXT,
    race TEXT,
    gender TEXT,
    align TEXT,
    deathlev INTEGER,
    hp INTEGER,
    maxhp INTEGER,
    conduct TEXT,
    achieve TEXT,
    ended_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_payment_hash ON sessions(payment_hash);
CREATE INDEX IF NOT EXISTS idx_sessions_linux_uid ON sessions(linux_uid);
CREATE UNIQUE INDEX IF NOT EXISTS idx_games_session ON games(session_id);
CREATE INDEX IF NOT EXISTS idx_games_ascended ON games(ascended);
";

const SESSION_COLUMNS: &str = "id, username, password, access_token, lightning_address, email, \
     linux_uid, payment_hash, ante_sats, status, created_at, ended_at";

const GAME_COLUMNS: &str = "id, session_id, character_name, death_reason, score, turns, ascended, \
     payout_sats, payout_hash, role, race, gender, align, deathlev, hp, maxhp, conduct, achieve, \
     ended_at";

// Same column set, qualified for joins against sessions.
const GAME_COLUMNS_QUALIFIED: &str = "g.id, g.session_id, g.character_name, g.death_reason, \
     g.score, g.turns, g.ascended, g.payout_sats, g.payout_hash, g.role, g.race, g.gender, \
     g.align, g.deathlev, g.hp, g.maxhp, g.conduct, g.achieve, g.ended_at";

#[derive(Debug, ThisError)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Aggregate stats over all recorded games.
#[derive(Clone, Debug, Default)]
pub struct LedgerStats {
    pub total_games: u64,
    pub total_ascensions: u64,
    pub high_score: Option<i64>,
    pub avg_score: Option<f64>,
}

pub struct Ledger {
    conn: Mutex<Connection>,
    pot_seed: u64,
}

impl Ledger {
    /// Open (creating if necessary) the ledger at `path`. The pot is seeded
    /// with `pot_seed` sats on first open; the same value is the floor the
    /// pot is drained to on a successful payout.
    pub fn open(path: &Path, pot_seed: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, pot_seed)
    }

    /// In-memory ledger, used by tests and mock deployments.
    pub fn open_in_memory(pot_seed: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, pot_seed)
    }

    fn init(conn: Connection, pot_seed: u64) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO pot (id, balance_sats) VALUES (1, ?1)",
            params![pot_seed as i64],
        )?;
        Ok(Ledger {
            conn: Mutex::new(conn),
            pot_seed,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Session operations

    pub fn create_session(&self, new: &NewSession) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions \
                 (username, password, access_token, payment_hash, ante_sats, \
                  lightning_address, email, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
            params![
                new.username,
                new.password,
                new.access_token,
                new.payment_hash,
                new.ante_sats as i64,
                new.lightning_address,
                new.email,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn session(&self, id: i64) -> Result<Option<Session>> {
        let conn = self.conn();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], session_from_row)
            .optional()?)
    }

    pub fn session_by_payment_hash(&self, payment_hash: &str) -> Result<Option<Session>> {
        let conn = self.conn();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE payment_hash = ?1");
        Ok(conn
            .query_row(&sql, params![payment_hash], session_from_row)
            .optional()?)
    }

    /// Resolve the session that currently owns `linux_uid`. Only active or
    /// playing sessions qualify; ended sessions that used the same uid in
    /// the past never match.
    pub fn session_by_uid(&self, linux_uid: u32) -> Result<Option<Session>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE linux_uid = ?1 AND status IN ('active', 'playing')"
        );
        Ok(conn
            .query_row(&sql, params![linux_uid], session_from_row)
            .optional()?)
    }

    pub fn active_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ('active', 'playing')"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], session_from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn count_active_sessions(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status IN ('active', 'playing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn set_linux_uid(&self, id: i64, linux_uid: u32) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sessions SET linux_uid = ?1 WHERE id = ?2",
            params![linux_uid, id],
        )?;
        Ok(())
    }

    pub fn set_lightning_address(&self, id: i64, address: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sessions SET lightning_address = ?1 WHERE id = ?2",
            params![address, id],
        )?;
        Ok(())
    }

    /// Atomically promote a pending session to active and credit its ante to
    /// the pot, in one transaction. Returns the new pot balance iff this
    /// call performed the transition; `None` means some other caller already
    /// processed the session and nothing was changed.
    pub fn activate_if_pending(&self, id: i64, ante_sats: u64) -> Result<Option<u64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE sessions SET status = 'active' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute(
            "UPDATE pot SET balance_sats = balance_sats + ?1, updated_at = CURRENT_TIMESTAMP \
             WHERE id = 1",
            params![ante_sats as i64],
        )?;
        let balance: i64 = tx.query_row("SELECT balance_sats FROM pot WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        tx.commit()?;
        Ok(Some(balance as u64))
    }

    /// active -> playing, once. Returns whether the transition happened.
    pub fn mark_playing(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'playing' WHERE id = ?1 AND status = 'active'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Terminal transition. Returns whether this call ended the session;
    /// an already-ended (or still-pending) session is left untouched.
    pub fn end_session(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'ended', ended_at = CURRENT_TIMESTAMP \
             WHERE id = ?1 AND status IN ('active', 'playing')",
            params![id],
        )?;
        Ok(changed == 1)
    }

    // Pot operations

    pub fn pot_balance(&self) -> Result<u64> {
        let conn = self.conn();
        let balance: i64 =
            conn.query_row("SELECT balance_sats FROM pot WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(balance.max(0) as u64)
    }

    pub fn credit_pot(&self, amount_sats: u64) -> Result<u64> {
        let conn = self.conn();
        conn.execute(
            "UPDATE pot SET balance_sats = balance_sats + ?1, updated_at = CURRENT_TIMESTAMP \
             WHERE id = 1",
            params![amount_sats as i64],
        )?;
        let balance: i64 =
            conn.query_row("SELECT balance_sats FROM pot WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(balance as u64)
    }

    /// Atomically capture the balance and reset it to the configured seed.
    /// Returns the pre-drain balance. An empty pot is left untouched and
    /// returns 0, so an aborted payout can never mint the seed.
    pub fn drain_pot(&self) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let pre: i64 = tx.query_row("SELECT balance_sats FROM pot WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        if pre <= 0 {
            return Ok(0);
        }
        tx.execute(
            "UPDATE pot SET balance_sats = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = 1",
            params![self.pot_seed as i64],
        )?;
        tx.commit()?;
        Ok(pre as u64)
    }

    /// Compensating action for a failed payout: put the balance back to
    /// exactly the pre-drain amount.
    pub fn restore_pot(&self, amount_sats: u64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE pot SET balance_sats = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = 1",
            params![amount_sats as i64],
        )?;
        Ok(())
    }

    // Game operations

    pub fn record_outcome(&self, outcome: &NewOutcome) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO games \
                 (session_id, character_name, death_reason, score, turns, ascended, \
                  payout_sats, payout_hash, role, race, gender, align, deathlev, hp, maxhp, \
                  conduct, achieve) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                outcome.session_id,
                outcome.character_name,
                outcome.death_reason,
                outcome.score,
                outcome.turns,
                outcome.ascended,
                outcome.payout_sats.map(|v| v as i64),
                outcome.payout_hash,
                outcome.role,
                outcome.race,
                outcome.gender,
                outcome.align,
                outcome.deathlev,
                outcome.hp,
                outcome.maxhp,
                outcome.conduct,
                outcome.achieve,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn outcome_for_session(&self, session_id: i64) -> Result<Option<GameOutcome>> {
        let conn = self.conn();
        let sql = format!("SELECT {GAME_COLUMNS} FROM games WHERE session_id = ?1");
        Ok(conn
            .query_row(&sql, params![session_id], outcome_from_row)
            .optional()?)
    }

    pub fn recent_games(&self, limit: u32) -> Result<Vec<(GameOutcome, String)>> {
        self.games_with_username(
            "ORDER BY g.ended_at DESC, g.id DESC LIMIT ?1",
            Some(limit),
        )
    }

    pub fn leaderboard(&self, limit: u32) -> Result<Vec<(GameOutcome, String)>> {
        self.games_with_username("ORDER BY g.score DESC, g.id ASC LIMIT ?1", Some(limit))
    }

    pub fn ascensions(&self) -> Result<Vec<(GameOutcome, String)>> {
        self.games_with_username("WHERE g.ascended ORDER BY g.ended_at DESC", None)
    }

    fn games_with_username(
        &self,
        tail: &str,
        limit: Option<u32>,
    ) -> Result<Vec<(GameOutcome, String)>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {GAME_COLUMNS_QUALIFIED}, s.username \
             FROM games g JOIN sessions s ON g.session_id = s.id {tail}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let map = |row: &Row<'_>| -> rusqlite::Result<(GameOutcome, String)> {
            Ok((outcome_from_row(row)?, row.get(19)?))
        };
        let rows = match limit {
            Some(limit) => stmt.query_map(params![limit], map)?,
            None => stmt.query_map([], map)?,
        };
        let mut games = Vec::new();
        for row in rows {
            games.push(row?);
        }
        Ok(games)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let conn = self.conn();
        let stats = conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN ascended THEN 1 ELSE 0 END), 0), \
                    MAX(score), AVG(score) \
             FROM games",
            [],
            |row| {
                Ok(LedgerStats {
                    total_games: row.get::<_, i64>(0)? as u64,
                    total_ascensions: row.get::<_, i64>(1)? as u64,
                    high_score: row.get(2)?,
                    avg_score: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(9)?;
    let status = SessionStatus::parse(&status).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Session {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        access_token: row.get(3)?,
        lightning_address: row.get(4)?,
        email: row.get(5)?,
        linux_uid: row.get(6)?,
        payment_hash: row.get(7)?,
        ante_sats: row.get::<_, i64>(8)? as u64,
        status,
        created_at: row.get(10)?,
        ended_at: row.get(11)?,
    })
}

fn outcome_from_row(row: &Row<'_>) -> rusqlite::Result<GameOutcome> {
    Ok(GameOutcome {
        id: row.get(0)?,
        session_id: row.get(1)?,
        character_name: row.get(2)?,
        death_reason: row.get(3)?,
        score: row.get(4)?,
        turns: row.get(5)?,
        ascended: row.get(6)?,
        payout_sats: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        payout_hash: row.get(8)?,
        role: row.get(9)?,
        race: row.get(10)?,
        gender: row.get(11)?,
        align: row.get(12)?,
        deathlev: row.get(13)?,
        hp: row.get(14)?,
        maxhp: row.get(15)?,
        conduct: row.get(16)?,
        achieve: row.get(17)?,
        ended_at: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(n: u32) -> NewSession {
        NewSession {
            username: format!("nh_player{n}"),
            password: "hunter2".into(),
            access_token: format!("token-{n}"),
            payment_hash: format!("hash-{n}"),
            ante_sats: 1000,
            lightning_address: Some("winner@example.com".into()),
            email: None,
        }
    }

    #[test]
    fn create_and_fetch_round_trip() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let id = ledger.create_session(&test_session(1)).unwrap();
        let session = ledger.session(id).unwrap().unwrap();
        assert_eq!(session.username, "nh_player1");
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.ante_sats, 1000);
        assert!(session.ended_at.is_none());

        let by_hash = ledger.session_by_payment_hash("hash-1").unwrap().unwrap();
        assert_eq!(by_hash.id, id);
        assert!(ledger.session_by_payment_hash("missing").unwrap().is_none());
    }

    #[test]
    fn activate_if_pending_transitions_exactly_once() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let id = ledger.create_session(&test_session(1)).unwrap();

        let first = ledger.activate_if_pending(id, 1000).unwrap();
        assert_eq!(first, Some(1000));
        let second = ledger.activate_if_pending(id, 1000).unwrap();
        assert_eq!(second, None);

        // The pot was credited once, not twice.
        assert_eq!(ledger.pot_balance().unwrap(), 1000);
        assert_eq!(
            ledger.session(id).unwrap().unwrap().status,
            SessionStatus::Active
        );
    }

    #[test]
    fn drain_resets_to_seed_and_restore_is_exact() {
        let ledger = Ledger::open_in_memory(500).unwrap();
        ledger.credit_pot(2500).unwrap();
        assert_eq!(ledger.pot_balance().unwrap(), 3000);

        let pre = ledger.drain_pot().unwrap();
        assert_eq!(pre, 3000);
        assert_eq!(ledger.pot_balance().unwrap(), 500);

        ledger.restore_pot(pre).unwrap();
        assert_eq!(ledger.pot_balance().unwrap(), 3000);
    }

    #[test]
    fn drain_of_empty_pot_is_a_noop() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        assert_eq!(ledger.drain_pot().unwrap(), 0);
        assert_eq!(ledger.pot_balance().unwrap(), 0);
    }

    #[test]
    fn uid_lookup_only_matches_playable_sessions() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let id = ledger.create_session(&test_session(1)).unwrap();
        ledger.set_linux_uid(id, 1042).unwrap();

        // Pending sessions do not own their uid yet.
        assert!(ledger.session_by_uid(1042).unwrap().is_none());

        ledger.activate_if_pending(id, 1000).unwrap();
        assert_eq!(ledger.session_by_uid(1042).unwrap().unwrap().id, id);

        assert!(ledger.mark_playing(id).unwrap());
        assert_eq!(ledger.session_by_uid(1042).unwrap().unwrap().id, id);

        assert!(ledger.end_session(id).unwrap());
        assert!(ledger.session_by_uid(1042).unwrap().is_none());
    }

    #[test]
    fn end_session_is_terminal_and_idempotent() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let id = ledger.create_session(&test_session(1)).unwrap();

        // Cannot end a session that was never activated.
        assert!(!ledger.end_session(id).unwrap());

        ledger.activate_if_pending(id, 1000).unwrap();
        assert!(ledger.end_session(id).unwrap());
        assert!(!ledger.end_session(id).unwrap());

        let session = ledger.session(id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());

        // Ended sessions never re-enter the state machine.
        assert_eq!(ledger.activate_if_pending(id, 1000).unwrap(), None);
        assert!(!ledger.mark_playing(id).unwrap());
    }

    #[test]
    fn at_most_one_outcome_per_session() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let id = ledger.create_session(&test_session(1)).unwrap();
        let outcome = NewOutcome {
            session_id: id,
            character_name: "Hero".into(),
            death_reason: "killed by a jackal".into(),
            score: 321,
            turns: 100,
            ..NewOutcome::default()
        };
        ledger.record_outcome(&outcome).unwrap();
        assert!(ledger.record_outcome(&outcome).is_err());

        let stored = ledger.outcome_for_session(id).unwrap().unwrap();
        assert_eq!(stored.score, 321);
        assert!(!stored.ascended);
        assert!(stored.payout_sats.is_none());
    }

    #[test]
    fn stats_and_leaderboard_queries() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        for n in 1..=3 {
            let id = ledger.create_session(&test_session(n)).unwrap();
            ledger.activate_if_pending(id, 1000).unwrap();
            ledger
                .record_outcome(&NewOutcome {
                    session_id: id,
                    character_name: format!("Hero{n}"),
                    death_reason: if n == 3 {
                        "ascended".into()
                    } else {
                        "killed by a newt".into()
                    },
                    score: (n as i64) * 100,
                    turns: 50,
                    ascended: n == 3,
                    ..NewOutcome::default()
                })
                .unwrap();
        }

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_games, 3);
        assert_eq!(stats.total_ascensions, 1);
        assert_eq!(stats.high_score, Some(300));

        let leaderboard = ledger.leaderboard(10).unwrap();
        assert_eq!(leaderboard[0].0.score, 300);
        assert_eq!(leaderboard[0].1, "nh_player3");

        let ascensions = ledger.ascensions().unwrap();
        assert_eq!(ascensions.len(), 1);
        assert!(ascensions[0].0.ascended);

        assert_eq!(ledger.recent_games(2).unwrap().len(), 2);
    }

    #[test]
    fn stats_on_empty_ledger() {
        let ledger = Ledger::open_in_memory(0).unwrap();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_games, 0);
        assert_eq!(stats.total_ascensions, 0);
        assert_eq!(stats.high_score, None);
        assert_eq!(stats.avg_score, None);
    }
}
