use tokio::sync::oneshot;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_TOTAL, outcome_label};

use super::conflict::{check_no_conflict, validate_id, validate_span};
use super::{Engine, EngineError, WalCommand};

fn validate_metadata(metadata: &Metadata) -> Result<(), EngineError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(EngineError::LimitExceeded("too many metadata entries"));
    }
    if metadata
        .iter()
        .any(|(k, v)| k.len() > MAX_ID_LEN || v.len() > MAX_METADATA_VALUE_LEN)
    {
        return Err(EngineError::LimitExceeded("metadata entry too long"));
    }
    Ok(())
}

fn validate_ttl(ttl_ms: Ms) -> Result<(), EngineError> {
    if !(MIN_TTL_MS..=MAX_TTL_MS).contains(&ttl_ms) {
        return Err(EngineError::Validation("ttl must be between 1s and 300s"));
    }
    Ok(())
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    metrics::counter!(RESERVATIONS_TOTAL, "op" => op, "outcome" => outcome_label(result))
        .increment(1);
}

impl Engine {
    /// Place a `pending` reservation if nothing active overlaps it.
    ///
    /// The conflict check and the WAL append run under the resource's write
    /// lock, so two racing reservations for overlapping slots cannot both win.
    pub async fn reserve(&self, req: ReserveRequest, now: Ms) -> Result<Reservation, EngineError> {
        let result = self.reserve_inner(req, now).await;
        record_outcome("reserve", &result);
        result
    }

    async fn reserve_inner(&self, req: ReserveRequest, now: Ms) -> Result<Reservation, EngineError> {
        validate_id(&req.resource_id, "resource_id is required")?;
        validate_id(&req.owner_id, "owner is required")?;
        let span = validate_span(req.start, req.end)?;
        if span.duration_ms() < MIN_RESERVATION_MS {
            return Err(EngineError::Validation("reservation must be at least 15 minutes"));
        }
        if span.duration_ms() > MAX_RESERVATION_SPAN_MS {
            return Err(EngineError::LimitExceeded("reservation too long"));
        }
        let ttl_ms = req.ttl_ms.unwrap_or(DEFAULT_TTL_MS);
        validate_ttl(ttl_ms)?;
        validate_metadata(&req.metadata)?;

        let id = req.id.unwrap_or_else(Ulid::new);
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource_for_write(&req.resource_id)?;
        let mut guard = rs.write().await;
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        check_no_conflict(&guard, &span, None, now)?;

        let reservation = Reservation {
            id,
            resource_id: req.resource_id,
            owner_id: req.owner_id,
            span,
            status: ReservationStatus::Pending,
            appointment_id: None,
            ttl_ms,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationPlaced {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    /// Turn a live pending reservation into a confirmed one linked to `appointment_id`.
    ///
    /// A pending reservation found past its TTL is moved to `expired` before
    /// the error is returned, so the lazy check and the stored status agree.
    pub async fn confirm(
        &self,
        id: Ulid,
        owner_id: &str,
        appointment_id: &str,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.confirm_inner(id, owner_id, appointment_id, now).await;
        record_outcome("confirm", &result);
        result
    }

    async fn confirm_inner(
        &self,
        id: Ulid,
        owner_id: &str,
        appointment_id: &str,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_id(appointment_id, "appointment_id is required")?;
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let (resource_id, span, expired) = {
            let r = guard.get(id).ok_or(EngineError::NotFound(id))?;
            if r.owner_id != owner_id {
                return Err(EngineError::NotFound(id));
            }
            match r.status {
                ReservationStatus::Confirmed | ReservationStatus::Cancelled => {
                    return Err(EngineError::NotFound(id));
                }
                ReservationStatus::Expired => return Err(EngineError::Expired(id)),
                ReservationStatus::Pending => {}
            }
            (r.resource_id.clone(), r.span, r.is_expired(now))
        };

        if expired {
            let event = Event::ReservationExpired { id, resource_id, at: now };
            self.persist_and_apply(&mut guard, &event).await?;
            return Err(EngineError::Expired(id));
        }

        // A live pending hold never overlaps an occupying record; checked
        // again before the slot becomes permanent.
        check_no_conflict(&guard, &span, Some(id), now)?;

        let event = Event::ReservationConfirmed {
            id,
            resource_id,
            appointment_id: appointment_id.to_string(),
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).map(|r| r.view(now)).ok_or(EngineError::NotFound(id))
    }

    /// Cancel a live pending reservation. Anything else is `NotFound`.
    pub async fn cancel(&self, id: Ulid, owner_id: &str, now: Ms) -> Result<Reservation, EngineError> {
        let result = self.cancel_inner(id, owner_id, now).await;
        record_outcome("cancel", &result);
        result
    }

    async fn cancel_inner(&self, id: Ulid, owner_id: &str, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let resource_id = {
            let r = guard.get(id).ok_or(EngineError::NotFound(id))?;
            if r.owner_id != owner_id || r.effective_status(now) != ReservationStatus::Pending {
                return Err(EngineError::NotFound(id));
            }
            r.resource_id.clone()
        };

        let event = Event::ReservationCancelled { id, resource_id, at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).map(|r| r.view(now)).ok_or(EngineError::NotFound(id))
    }

    /// Persist `expired` for a pending reservation whose TTL has lapsed.
    /// Used by the reaper; returns the resource id.
    pub async fn expire(&self, id: Ulid, now: Ms) -> Result<String, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let resource_id = {
            let r = guard.get(id).ok_or(EngineError::NotFound(id))?;
            if r.status != ReservationStatus::Pending || !r.is_expired(now) {
                return Err(EngineError::NotFound(id));
            }
            r.resource_id.clone()
        };
        let event = Event::ReservationExpired {
            id,
            resource_id: resource_id.clone(),
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Physically remove a record that no longer occupies its slot.
    pub async fn purge(&self, id: Ulid, now: Ms) -> Result<String, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let resource_id = {
            let r = guard.get(id).ok_or(EngineError::NotFound(id))?;
            if r.is_occupying(now) {
                return Err(EngineError::NotFound(id));
            }
            r.resource_id.clone()
        };
        let event = Event::ReservationPurged {
            id,
            resource_id: resource_id.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Administrative sweep: delete pending/expired records created more than
    /// `older_than_ms` ago. A pending record whose TTL has not lapsed is live
    /// and is never deleted, however old. Per-record failures are logged and
    /// skipped; the return value counts records actually deleted.
    pub async fn cleanup_expired(&self, older_than_ms: Ms, now: Ms) -> Result<usize, EngineError> {
        if older_than_ms < 0 {
            return Err(EngineError::Validation("age threshold must not be negative"));
        }
        let cutoff = now.saturating_sub(older_than_ms);
        let mut deleted = 0usize;
        let _gate = self.compaction_gate.read().await;

        for resource_id in self.resource_ids() {
            let Some(rs) = self.get_resource(&resource_id) else {
                continue;
            };
            let mut guard = rs.write().await;
            let stale: Vec<Ulid> = guard
                .reservations
                .iter()
                .filter(|r| {
                    matches!(r.status, ReservationStatus::Pending | ReservationStatus::Expired)
                        && r.created_at < cutoff
                        && r.is_expired(now)
                })
                .map(|r| r.id)
                .collect();

            for id in stale {
                let event = Event::ReservationPurged {
                    id,
                    resource_id: resource_id.clone(),
                };
                match self.persist_and_apply(&mut guard, &event).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("cleanup: failed to delete reservation {id}: {e}"),
                }
            }
        }

        debug!("cleanup removed {deleted} stale reservations older than {older_than_ms}ms");
        metrics::counter!(crate::observability::RESERVATIONS_PURGED_TOTAL, "source" => "cleanup")
            .increment(deleted as u64);
        Ok(deleted)
    }

    /// Compact the WAL: rewrite it as one `ReservationPlaced` per surviving
    /// record, carrying its current status.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();
        for resource_id in self.resource_ids() {
            let Some(rs) = self.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationPlaced {
                reservation: r.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
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
