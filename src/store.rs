//! SQLite backed command queue and lock registry.
//!
//! Every process opens its own `Store` on the same database file. All
//! coordination between the scheduler and the workers goes through it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::model::{Command, CommandStatus, NewCommand, Severity};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one acquisition of a bot lock (its `acquired_at_ms`). Renewals
/// and releases only touch the lease they were given.
pub type LeaseToken = i64;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// The command is unknown or has already left `pending`.
    AlreadyFinalized(i64),
    Corrupt(String),
    /// A blocking store task panicked or was cancelled.
    Task(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "database error: {}", e),
            StoreError::AlreadyFinalized(id) => {
                write!(f, "command {} is not pending", id)
            }
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {}", msg),
            StoreError::Task(msg) => write!(f, "store task failed: {}", msg),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

/// Terminal outcome written onto a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(String),
    Failed { message: String, severity: Severity },
}

impl Outcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            Outcome::Success(_) => CommandStatus::Success,
            Outcome::Failed { .. } => CommandStatus::Failed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Success(message) => message,
            Outcome::Failed { message, .. } => message,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failed { severity, .. } => Some(*severity),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn lease_ms(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<RawCommand> {
    Ok(RawCommand {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        pair: row.get(2)?,
        command: row.get(3)?,
        percent: row.get(4)?,
        created_at_ms: row.get(5)?,
        status: row.get(6)?,
        error_msg: row.get(7)?,
        error_severity: row.get(8)?,
    })
}

const COMMAND_COLUMNS: &str = "id, bot_id, pair, command, percent, created_at_ms, status, \
                               error_msg, error_severity";

struct RawCommand {
    id: i64,
    bot_id: String,
    pair: String,
    command: String,
    percent: Option<String>,
    created_at_ms: i64,
    status: String,
    error_msg: Option<String>,
    error_severity: Option<String>,
}

impl TryFrom<RawCommand> for Command {
    type Error = StoreError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let created_at = DateTime::<Utc>::from_timestamp_millis(raw.created_at_ms).ok_or_else(
            || StoreError::Corrupt(format!("command {} created_at {}", raw.id, raw.created_at_ms)),
        )?;
        let status = raw
            .status
            .parse::<CommandStatus>()
            .map_err(|_| StoreError::Corrupt(format!("command {} status {}", raw.id, raw.status)))?;
        let error_severity = match raw.error_severity {
            Some(s) => Some(s.parse::<Severity>().map_err(|_| {
                StoreError::Corrupt(format!("command {} severity {}", raw.id, s))
            })?),
            None => None,
        };
        Ok(Command {
            id: raw.id,
            bot_id: raw.bot_id,
            pair: raw.pair,
            command: raw.command,
            percent: raw.percent,
            created_at,
            status,
            error_msg: raw.error_msg,
            error_severity,
        })
    }
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Appends a pending command and returns its id.
    pub fn enqueue(&self, command: &NewCommand) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO commands (bot_id, pair, command, percent, created_at_ms, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                command.bot_id,
                command.pair,
                command.command,
                command.percent,
                command.created_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Distinct bot ids with at least one pending command, oldest work first.
    pub fn pending_bot_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bot_id FROM commands WHERE status = 'pending'
             GROUP BY bot_id ORDER BY MIN(created_at_ms), bot_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Pending commands of one bot in creation order.
    pub fn pending_for(&self, bot_id: &str) -> Result<Vec<Command>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM commands WHERE bot_id = ?1 AND status = 'pending'
             ORDER BY created_at_ms, id",
            COMMAND_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![bot_id], command_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Command::try_from).collect()
    }

    pub fn get_command(&self, id: i64) -> Result<Option<Command>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM commands WHERE id = ?1", COMMAND_COLUMNS);
        let raw = conn
            .query_row(&sql, params![id], command_from_row)
            .optional()?;
        raw.map(Command::try_from).transpose()
    }

    /// Moves a pending command to its terminal state. A command that is no
    /// longer pending is left untouched and `AlreadyFinalized` is returned.
    pub fn finalize(&self, id: i64, outcome: &Outcome, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE commands
             SET status = ?2, error_msg = ?3, error_severity = ?4, finished_at_ms = ?5
             WHERE id = ?1 AND status = 'pending'",
            params![
                id,
                outcome.status().as_str(),
                outcome.message(),
                outcome.severity().map(|s| s.as_str()),
                now.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::AlreadyFinalized(id));
        }
        Ok(())
    }

    /// Creates the lock of `bot_id`, or takes it over if its lease has
    /// expired, in a single statement. Returns the lease token when the lock
    /// was acquired.
    pub fn try_acquire_lock(
        &self,
        bot_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        let now_ms = now.timestamp_millis();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO locks (bot_id, acquired_at_ms, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(bot_id) DO UPDATE SET
                 acquired_at_ms = excluded.acquired_at_ms,
                 expires_at_ms = excluded.expires_at_ms
             WHERE locks.expires_at_ms <= excluded.acquired_at_ms
               AND locks.acquired_at_ms < excluded.acquired_at_ms",
            params![bot_id, now_ms, now_ms.saturating_add(lease_ms(lease))],
        )?;
        Ok((changed == 1).then_some(now_ms))
    }

    /// Token of the lease currently held on `bot_id`, if any.
    pub fn lock_token(&self, bot_id: &str) -> Result<Option<LeaseToken>, StoreError> {
        let conn = self.conn.lock();
        let token = conn
            .query_row(
                "SELECT acquired_at_ms FROM locks WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(token)
    }

    /// Extends the lease `token` of `bot_id`. Returns false if that lease is
    /// gone or was taken over.
    pub fn renew_lock(
        &self,
        bot_id: &str,
        token: LeaseToken,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?3 WHERE bot_id = ?1 AND acquired_at_ms = ?2",
            params![
                bot_id,
                token,
                now.timestamp_millis().saturating_add(lease_ms(lease))
            ],
        )?;
        Ok(changed == 1)
    }

    /// Deletes the lock of `bot_id` if it still belongs to lease `token`.
    /// Returns whether a lock was deleted.
    pub fn release_lock(&self, bot_id: &str, token: LeaseToken) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM locks WHERE bot_id = ?1 AND acquired_at_ms = ?2",
            params![bot_id, token],
        )?;
        Ok(changed == 1)
    }

    pub fn is_locked(&self, bot_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM locks WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Deletes locks whose lease ran out before `now`.
    pub fn sweep_expired_locks(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM locks WHERE expires_at_ms <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Deletes every lock.
    pub fn clear_locks(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM locks", [])?)
    }

    /// Runs `op` against this store on the blocking thread pool so SQLite
    /// waits (busy timeout included) never stall the async workers.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Holds the lease of one bot and releases it when dropped.
///
/// Only the lease the guard was created for is renewed or released; once it
/// has been taken over the guard leaves the new holder alone.
#[derive(Debug)]
pub struct LockGuard {
    store: Store,
    bot_id: String,
    token: Option<LeaseToken>,
    lease: Duration,
}

impl LockGuard {
    /// Wraps a lease acquired with `Store::try_acquire_lock`.
    pub fn held(store: Store, bot_id: &str, token: LeaseToken, lease: Duration) -> Self {
        Self {
            store,
            bot_id: bot_id.to_string(),
            token: Some(token),
            lease,
        }
    }

    /// Takes over whatever lease currently exists for `bot_id`, as a worker
    /// started by hand does.
    pub fn adopt(store: Store, bot_id: &str, lease: Duration) -> Self {
        let token = match store.lock_token(bot_id) {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                warn!(
                    "No lock found for bot {}. Was the worker run outside the queue service?",
                    bot_id
                );
                None
            }
            Err(e) => {
                warn!("Failed to read lock of bot {}: {}", bot_id, e);
                None
            }
        };
        Self {
            store,
            bot_id: bot_id.to_string(),
            token,
            lease,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn token(&self) -> Option<LeaseToken> {
        self.token
    }

    pub async fn renew(&self, now: DateTime<Utc>) {
        let Some(token) = self.token else {
            return;
        };
        let bot_id = self.bot_id.clone();
        let lease = self.lease;
        let renewed = self
            .store
            .blocking(move |store| store.renew_lock(&bot_id, token, now, lease))
            .await;
        match renewed {
            Ok(true) => {}
            Ok(false) => warn!("Lease of bot {} expired and was taken over", self.bot_id),
            Err(e) => warn!("Failed to renew lock for bot {}: {}", self.bot_id, e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token else {
            return;
        };
        match self.store.release_lock(&self.bot_id, token) {
            Ok(true) => debug!("Lock released for bot {}", self.bot_id),
            Ok(false) => warn!(
                "Lock of bot {} was no longer ours, leaving it in place",
                self.bot_id
            ),
            Err(e) => warn!("Failed to release lock for bot {}: {}", self.bot_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn new_command(bot_id: &str, command: &str, created_at: DateTime<Utc>) -> NewCommand {
        NewCommand {
            bot_id: bot_id.to_string(),
            pair: "BTCUSDT".to_string(),
            command: command.to_string(),
            percent: None,
            created_at,
        }
    }

    #[test]
    fn test_pending_for_orders_by_creation() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store.enqueue(&new_command("1", "c", t0 + ChronoDuration::seconds(2))).unwrap();
        store.enqueue(&new_command("1", "a", t0)).unwrap();
        store.enqueue(&new_command("2", "x", t0)).unwrap();
        store.enqueue(&new_command("1", "b", t0 + ChronoDuration::seconds(1))).unwrap();

        let pending = store.pending_for("1").unwrap();
        let names: Vec<_> = pending.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(pending.iter().all(|c| c.status == CommandStatus::Pending));
    }

    #[test]
    fn test_pending_bot_ids_are_distinct() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.enqueue(&new_command("2", "a", now)).unwrap();
        store.enqueue(&new_command("1", "a", now - ChronoDuration::seconds(5))).unwrap();
        store.enqueue(&new_command("2", "b", now)).unwrap();
        assert_eq!(store.pending_bot_ids().unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_finalize_only_once() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let id = store.enqueue(&new_command("1", "enter-long", now)).unwrap();

        let failed = Outcome::Failed {
            message: "profit is not positive".to_string(),
            severity: Severity::Warn,
        };
        store.finalize(id, &failed, now).unwrap();
        let again = store.finalize(id, &Outcome::Success("ok".to_string()), now);
        assert!(matches!(again, Err(StoreError::AlreadyFinalized(i)) if i == id));

        let command = store.get_command(id).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert_eq!(command.error_msg.as_deref(), Some("profit is not positive"));
        assert_eq!(command.error_severity, Some(Severity::Warn));
        assert!(store.pending_for("1").unwrap().is_empty());
    }

    #[test]
    fn test_lock_acquire_is_exclusive_until_expiry() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let lease = Duration::from_secs(60);

        assert_eq!(
            store.try_acquire_lock("1", now, lease).unwrap(),
            Some(now.timestamp_millis())
        );
        assert!(store.try_acquire_lock("1", now, lease).unwrap().is_none());
        assert!(store.try_acquire_lock("2", now, lease).unwrap().is_some());

        let later = now + ChronoDuration::seconds(61);
        assert_eq!(
            store.try_acquire_lock("1", later, lease).unwrap(),
            Some(later.timestamp_millis())
        );
        assert_eq!(store.lock_token("1").unwrap(), Some(later.timestamp_millis()));
    }

    #[test]
    fn test_renew_and_sweep() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let lease = Duration::from_secs(10);
        let first = store.try_acquire_lock("1", now, lease).unwrap().unwrap();
        store.try_acquire_lock("2", now, lease).unwrap();

        let later = now + ChronoDuration::seconds(8);
        assert!(store.renew_lock("1", first, later, lease).unwrap());
        assert!(!store.renew_lock("1", first - 1, later, lease).unwrap());
        assert!(!store.renew_lock("3", first, later, lease).unwrap());

        let expired = now + ChronoDuration::seconds(12);
        assert_eq!(store.sweep_expired_locks(expired).unwrap(), 1);
        assert!(store.is_locked("1").unwrap());
        assert!(!store.is_locked("2").unwrap());

        assert_eq!(store.clear_locks().unwrap(), 1);
        assert!(!store.is_locked("1").unwrap());
    }

    #[test]
    fn test_release_requires_matching_lease() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        let lease = Duration::from_secs(10);
        let stale = store.try_acquire_lock("1", t0, lease).unwrap().unwrap();
        let current = store
            .try_acquire_lock("1", t0 + ChronoDuration::seconds(11), lease)
            .unwrap()
            .unwrap();

        assert!(!store.release_lock("1", stale).unwrap());
        assert!(store.is_locked("1").unwrap());
        assert!(store.release_lock("1", current).unwrap());
        assert!(!store.is_locked("1").unwrap());
    }

    #[tokio::test]
    async fn test_lock_guard_releases_on_drop() {
        let store = Store::open_in_memory().unwrap();
        let lease = Duration::from_secs(60);
        let token = store.try_acquire_lock("1", Utc::now(), lease).unwrap().unwrap();
        {
            let guard = LockGuard::held(store.clone(), "1", token, lease);
            guard.renew(Utc::now()).await;
            assert!(store.is_locked(guard.bot_id()).unwrap());
        }
        assert!(!store.is_locked("1").unwrap());
    }

    #[test]
    fn test_adopted_guard_keeps_taken_over_lock() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        let lease = Duration::from_secs(10);
        store.try_acquire_lock("1", t0, lease).unwrap();
        let first = LockGuard::adopt(store.clone(), "1", lease);

        let taken_over = t0 + ChronoDuration::seconds(11);
        let second = store.try_acquire_lock("1", taken_over, lease).unwrap();
        assert!(second.is_some());

        drop(first);
        assert!(store.is_locked("1").unwrap());
        let third = t0 + ChronoDuration::seconds(12);
        assert!(store.try_acquire_lock("1", third, lease).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_runs_on_pool() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .blocking(|store| store.enqueue(&new_command("1", "exit-long", Utc::now())))
            .await
            .unwrap();
        assert!(store.get_command(id).unwrap().is_some());
    }
}
