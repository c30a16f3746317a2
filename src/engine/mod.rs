pub mod capacity;
mod error;
mod mutations;
mod queries;
mod store;
mod validate;

pub use error::{EngineError, Entity};
pub use store::Store;
pub use validate::today;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<EngineerLedger>>;
pub type LedgerGuard = OwnedRwLockWriteGuard<EngineerLedger>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// fsyncs once for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Appends queued before a compaction must land before it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; every sender in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Staffing engine for one tenant: engineers, projects and the assignments
/// between them, with capacity enforced on every assignment write.
///
/// Lock order: `write_gate` first, then engineer ledgers in ascending id order.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this. Catalog changes (engineer create/delete,
    /// project writes) and WAL compaction take it exclusively; assignment and
    /// engineer-profile writes take it shared and serialize on ledger locks.
    pub(super) write_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            write_gate: RwLock::new(()),
        };
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            info!(
                "replayed {} events from {}: {} engineers, {} projects",
                events.len(),
                wal_path.display(),
                engine.store.engineer_count(),
                engine.store.project_count()
            );
        }
        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every ledger lock is
    /// uncontended. `try_write` is used because this may run inside an async
    /// context where blocking locks would panic.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        fn contended() -> io::Error {
            io::Error::other("replay: ledger lock contended")
        }

        match event {
            Event::EngineerCreated { .. }
            | Event::EngineerDeleted { .. }
            | Event::ProjectCreated { .. }
            | Event::ProjectUpdated { .. }
            | Event::ProjectDeleted { .. } => self.store.apply_catalog_event(event),
            Event::AssignmentUpdated {
                previous_engineer_id,
                assignment,
            } if *previous_engineer_id != assignment.engineer_id => {
                if let (Some(from), Some(to)) = (
                    self.store.get_ledger(previous_engineer_id),
                    self.store.get_ledger(&assignment.engineer_id),
                ) {
                    let mut from = from.try_write().map_err(|_| contended())?;
                    let mut to = to.try_write().map_err(|_| contended())?;
                    self.store.detach(&mut from, assignment.id);
                    self.store.attach(&mut to, assignment.clone());
                }
            }
            other => {
                for engineer_id in other.engineer_ids() {
                    if let Some(ledger) = self.store.get_ledger(&engineer_id) {
                        let mut guard = ledger.try_write().map_err(|_| contended())?;
                        self.store.apply_event(&mut guard, other);
                    }
                }
            }
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append, then apply to the locked ledger.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut EngineerLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(ledger, event);
        Ok(())
    }

    /// WAL-append and apply a catalog event. Caller holds `write_gate` exclusively.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_catalog_event(event);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Write-lock an engineer's ledger. Fails with `NotFound` if the engineer
    /// is unknown or was deleted while we waited for the lock.
    pub(super) async fn lock_ledger(&self, engineer_id: &Ulid) -> Result<LedgerGuard, EngineError> {
        let ledger = self
            .store
            .get_ledger(engineer_id)
            .ok_or(EngineError::not_found(Entity::Engineer, *engineer_id))?;
        let guard = ledger.clone().write_owned().await;
        match self.store.get_ledger(engineer_id) {
            Some(current) if Arc::ptr_eq(&current, &ledger) => Ok(guard),
            _ => Err(EngineError::not_found(Entity::Engineer, *engineer_id)),
        }
    }

    /// Lock two distinct ledgers in id order. Returned in argument order.
    pub(super) async fn lock_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> Result<(LedgerGuard, LedgerGuard), EngineError> {
        debug_assert_ne!(a, b);
        if a < b {
            let ga = self.lock_ledger(&a).await?;
            let gb = self.lock_ledger(&b).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock_ledger(&b).await?;
            let ga = self.lock_ledger(&a).await?;
            Ok((ga, gb))
        }
    }

    /// Resolve assignment → owning engineer and write-lock that ledger.
    pub(super) async fn resolve_assignment_write(
        &self,
        assignment_id: &Ulid,
    ) -> Result<(Ulid, LedgerGuard), EngineError> {
        let missing = || EngineError::not_found(Entity::Assignment, *assignment_id);
        loop {
            let owner = self.store.owner_of(assignment_id).ok_or_else(missing)?;
            let guard = self.lock_ledger(&owner).await.map_err(|_| missing())?;
            if guard.get_assignment(*assignment_id).is_some() {
                return Ok((owner, guard));
            }
            // Deleted, or moved to another engineer before we got the lock.
            match self.store.owner_of(assignment_id) {
                Some(now) if now != owner => continue,
                _ => return Err(missing()),
            }
        }
    }
}

/// Read-time join of an assignment with its engineer and project display fields.
pub(super) fn join(engineer: &Engineer, project: &Project, assignment: Assignment) -> AssignmentView {
    AssignmentView {
        assignment,
        engineer_name: engineer.name.clone(),
        engineer_email: engineer.email.clone(),
        engineer_skills: engineer.skills.clone(),
        project_name: project.name.clone(),
        project_description: project.description.clone(),
    }
}
