mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use conflict::{find_conflicts, has_conflict};
pub use error::EngineError;
pub use slots::{merge_overlapping, SlotIter, SlotQuery};

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Per-tenant tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Stride between candidate starts when a slot query names none.
    pub slot_step_ms: Ms,
    /// How long cancelled/expired records stay readable before the reaper purges them.
    pub retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_step_ms: DEFAULT_SLOT_STEP_MS,
            retention_ms: 7 * 24 * 60 * MINUTE_MS,
        }
    }
}

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

/// Background task that owns the WAL and batches appends for group commit:
/// wait for one append, drain whatever else is already queued, then write the
/// whole batch with a single fsync and answer every sender.
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
                    // flush what we have before compaction or stats see the log
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes don't leak into the
    // next batch; every caller in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Reservation engine for one tenant: in-memory state per resource, backed by the WAL.
pub struct Engine {
    pub(super) state: DashMap<String, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutation, exclusive for compaction: no append can land
    /// between the compaction snapshot and the file swap. Always taken before
    /// any resource lock.
    pub(super) compaction_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// Reverse lookup: reservation id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, String>,
}

/// Apply an event directly to a ResourceState (no locking; caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, String>) {
    match event {
        Event::ReservationPlaced { reservation } => {
            entity_map.insert(reservation.id, reservation.resource_id.clone());
            rs.insert(reservation.clone());
        }
        Event::ReservationConfirmed {
            id,
            appointment_id,
            at,
            ..
        } => {
            if let Some(r) = rs.get_mut(*id) {
                r.status = ReservationStatus::Confirmed;
                r.appointment_id = Some(appointment_id.clone());
                r.updated_at = *at;
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = rs.get_mut(*id) {
                r.status = ReservationStatus::Cancelled;
                r.updated_at = *at;
            }
        }
        Event::ReservationExpired { id, at, .. } => {
            if let Some(r) = rs.get_mut(*id) {
                r.status = ReservationStatus::Expired;
                r.updated_at = *at;
            }
        }
        Event::ReservationPurged { id, .. } => {
            rs.remove(*id);
            entity_map.remove(id);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            notify,
            config,
            entity_to_resource: DashMap::new(),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds. Never blocking_write here; this may run inside a runtime
        // (lazy tenant creation).
        for event in &events {
            let rs = engine.resource_entry(event.resource_id());
            let mut guard = rs
                .try_write()
                .map_err(|_| io::Error::other("replay: resource state contended"))?;
            apply_to_resource(&mut guard, event, &engine.entity_to_resource);
        }
        tracing::debug!(
            "replayed {} events into {} resources from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );

        Ok(engine)
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
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<String> {
        self.entity_to_resource.get(entity_id).map(|e| e.value().clone())
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.state.iter().map(|e| e.key().clone()).collect()
    }

    /// Get or create the state for a resource. Resources come into existence
    /// with their first reservation; the shard lock is released before return.
    fn resource_entry(&self, id: &str) -> SharedResourceState {
        if let Some(rs) = self.get_resource(id) {
            return rs;
        }
        self.state
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.to_string()))))
            .value()
            .clone()
    }

    pub(super) fn resource_for_write(&self, id: &str) -> Result<SharedResourceState, EngineError> {
        if !self.state.contains_key(id) && self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        Ok(self.resource_entry(id))
    }

    /// WAL-append, apply and notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup reservation → resource, take the resource's write lock, and make
    /// sure the reservation is still there once the lock is held.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = rs.write_owned().await;
        if guard.get(*entity_id).is_none() {
            return Err(EngineError::NotFound(*entity_id));
        }
        Ok(guard)
    }
}
