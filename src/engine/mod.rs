mod bookings;
pub mod calendar;
mod conflict;
mod error;
mod queries;
mod stations;
mod store;
mod usage;

pub use bookings::{DayToggle, SweepReport};
pub(crate) use conflict::now_ms;
pub use error::{EngineError, Entity};
pub use queries::{LabStatus, ScheduleCell, ScheduleRow, WeekSchedule};
pub use store::{LedgerStore, SharedPerson, SharedStation};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Broadcaster, Outbox};
use crate::wal::Wal;

use store::{Locked, Txn};

/// Tunables the engine reads on every operation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest any operation waits for one row lock before giving up with `Busy`.
    pub lock_wait: Duration,
    /// A booking may end at most this far in the past.
    pub past_grace_ms: Ms,
    /// When set, booking boundaries must be multiples of this.
    pub granularity_ms: Option<Ms>,
    /// The lab's local time zone, for day-based views and day bookings.
    pub utc_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(500),
            past_grace_ms: 5 * 60_000,
            granularity_ms: None,
            utc_offset: Utc.fix(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

/// A commit the writer has made durable, with its place in the event order.
pub(super) struct Durable {
    commit: Commit,
    outbox: Outbox,
}

pub(super) enum WalCommand {
    Append {
        at: Ms,
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<Durable>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<Durable>>);

/// Owns the WAL and the commit sequence. Seqs are handed out in append order;
/// appends that arrive while a flush is pending share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut next_seq: u64, notify: Broadcaster, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { at, changes, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let first_seq = next_seq;
        let mut batch = vec![(Commit { seq: next_seq, at, changes }, response)];
        next_seq += 1;
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { at, changes, response } => {
                    batch.push((Commit { seq: next_seq, at, changes }, response));
                    next_seq += 1;
                }
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if result.is_err() {
            // nothing in the batch happened, so its seqs are reused
            next_seq = first_seq;
        }
        respond_batch(batch, result, &notify);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

/// Write and sync a batch. On any failure the file is cut back to where the
/// batch began, so a batch is durable as a whole or not at all.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        error!("WAL batch of {} failed: {e}", batch.len());
        if let Err(rollback) = wal.rollback() {
            error!("WAL may hold a partial batch: {rollback}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<PendingAppend>, result: io::Result<()>, notify: &Broadcaster) {
    for (commit, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(Durable {
                outbox: notify.outbox(commit.seq),
                commit,
            }),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        // A caller that gave up drops the outbox here, which still releases its seq.
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Fold the log on disk into a fresh store and rewrite it as that store's image.
/// Runs inside the writer, so no append can slip in between read and rewrite.
fn compact(wal: &mut Wal) -> io::Result<usize> {
    wal.flush_sync()?;
    let commits = Wal::replay(wal.path())?;
    let before = commits.len();
    let scratch = LedgerStore::default();
    let last_seq = scratch.replay(&commits);
    let image = scratch.image(last_seq);
    wal.rewrite(&image)?;
    info!(before, after = image.len(), "WAL compacted");
    Ok(image.len())
}

pub struct Engine {
    pub(super) store: LedgerStore,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Broadcaster,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Broadcaster, config: EngineConfig) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let store = LedgerStore::default();
        let last_seq = store.replay(&commits);
        info!(
            commits = commits.len(),
            stations = store.station_count(),
            people = store.person_count(),
            "ledger replayed"
        );

        notify.resume_at(last_seq + 1);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, last_seq + 1, notify.clone(), wal_rx));

        Ok(Self {
            store,
            wal_tx,
            notify,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn wal_append(&self, at: Ms, changes: Vec<Change>) -> Result<Durable, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { at, changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `txn` durable, then apply it to the locked rows.
    ///
    /// Nothing is applied unless the WAL write succeeds. Returns the commit's
    /// events; they reach observers, in seq order, once the outbox is
    /// published or dropped, which callers do after releasing their locks.
    pub(super) async fn commit(&self, rows: &mut Locked, txn: Txn) -> Result<Outbox, EngineError> {
        if txn.is_empty() {
            return Ok(Outbox::empty());
        }
        let Durable { commit, mut outbox } = self.wal_append(txn.at, txn.changes).await?;
        metrics::counter!(crate::observability::COMMITS_TOTAL).increment(1);

        let seq = commit.seq;
        let mut touched_people: Vec<Ulid> = Vec::new();
        for change in &commit.changes {
            self.store.apply(rows, change);
            if let Some(event) = StationEvent::from_change(seq, commit.at, change) {
                outbox.push(event);
            }
            if let Change::PersonActiveSet { id, .. }
            | Change::QuotaSet { id, .. }
            | Change::QuotaDecremented { id, .. } = change
                && !touched_people.contains(id)
            {
                touched_people.push(*id);
            }
        }
        for pid in touched_people {
            if let Some(ps) = rows.person(pid) {
                outbox.push(StationEvent::PersonUpdated {
                    seq,
                    person_id: pid,
                    active: ps.person.active,
                    remaining: ps.person.remaining,
                    timestamp: commit.at,
                });
            }
        }
        Ok(outbox)
    }

    /// Hand a commit's events to the broadcaster. Callers must not hold row locks here.
    pub(super) fn publish(&self, outbox: Outbox) {
        outbox.release();
    }

    // ── Bounded row locking ──────────────────────────────────

    pub(super) async fn lock_station(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<StationState>, EngineError> {
        let row = self
            .store
            .get_station(&id)
            .ok_or(EngineError::NotFound(Entity::Station, id))?;
        let guard = tokio::time::timeout(self.config.lock_wait, row.write_owned())
            .await
            .map_err(|_| EngineError::Busy(Entity::Station, id))?;
        if guard.deleted {
            return Err(EngineError::NotFound(Entity::Station, id));
        }
        Ok(guard)
    }

    pub(super) async fn lock_person(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<PersonState>, EngineError> {
        let row = self
            .store
            .get_person(&id)
            .ok_or(EngineError::NotFound(Entity::Person, id))?;
        let guard = tokio::time::timeout(self.config.lock_wait, row.write_owned())
            .await
            .map_err(|_| EngineError::Busy(Entity::Person, id))?;
        if guard.removed {
            return Err(EngineError::NotFound(Entity::Person, id));
        }
        Ok(guard)
    }

    pub(super) async fn read_station(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<StationState>, EngineError> {
        let row = self
            .store
            .get_station(&id)
            .ok_or(EngineError::NotFound(Entity::Station, id))?;
        let guard = tokio::time::timeout(self.config.lock_wait, row.read_owned())
            .await
            .map_err(|_| EngineError::Busy(Entity::Station, id))?;
        if guard.deleted {
            return Err(EngineError::NotFound(Entity::Station, id));
        }
        Ok(guard)
    }

    pub(super) async fn read_person(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<PersonState>, EngineError> {
        let row = self
            .store
            .get_person(&id)
            .ok_or(EngineError::NotFound(Entity::Person, id))?;
        let guard = tokio::time::timeout(self.config.lock_wait, row.read_owned())
            .await
            .map_err(|_| EngineError::Busy(Entity::Person, id))?;
        if guard.removed {
            return Err(EngineError::NotFound(Entity::Person, id));
        }
        Ok(guard)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as a minimal image of the current ledger. Returns the
    /// number of commits in the new log.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
