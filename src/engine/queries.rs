use ulid::Ulid;

use crate::model::*;

use super::conflict::{find_conflicts, validate_span};
use super::slots::{SlotIter, SlotQuery};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid, now: Ms) -> Option<Reservation> {
        let resource_id = self.get_resource_for_entity(&id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.get(id).map(|r| r.view(now))
    }

    /// Reservations matching `filter`, ordered by start time. Statuses are
    /// reported after lazy expiry.
    pub async fn list_reservations(&self, filter: &ReservationFilter, now: Ms) -> Vec<Reservation> {
        let resource_ids = match &filter.resource_id {
            Some(rid) => vec![rid.clone()],
            None => self.resource_ids(),
        };

        let mut out = Vec::new();
        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.matches(r, now))
                    .map(|r| r.view(now)),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Occupying reservations on `resource_id` overlapping `[start, end)`.
    /// A snapshot: nothing stops a conflicting reservation from landing right after.
    pub async fn find_conflicts(
        &self,
        resource_id: &str,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
        now: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        let span = validate_span(start, end)?;
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(find_conflicts(&guard, &span, exclude, now)
            .map(|r| r.view(now))
            .collect())
    }

    pub async fn has_conflict(
        &self,
        resource_id: &str,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
        now: Ms,
    ) -> Result<bool, EngineError> {
        Ok(!self
            .find_conflicts(resource_id, start, end, exclude, now)
            .await?
            .is_empty())
    }

    /// Free `[t, t + duration)` candidates inside the window. Occupying
    /// reservations are read once under a single read lock, then filtered
    /// step by step. `step` defaults to the engine's configured stride.
    pub async fn enumerate_slots(
        &self,
        resource_id: &str,
        window_start: Ms,
        window_end: Ms,
        duration: Ms,
        step: Option<Ms>,
        now: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        let query = SlotQuery::new(
            window_start,
            window_end,
            duration,
            step.unwrap_or(self.config.slot_step_ms),
        )?;
        Ok(self.slot_iter(resource_id, query, now).await.collect())
    }

    /// The enumeration as an iterator over a fresh snapshot.
    pub async fn slot_iter(&self, resource_id: &str, query: SlotQuery, now: Ms) -> SlotIter {
        let busy = match self.get_resource(resource_id) {
            Some(rs) => {
                let guard = rs.read().await;
                find_conflicts(&guard, &query.window, None, now)
                    .map(|r| r.span)
                    .collect()
            }
            None => Vec::new(),
        };
        SlotIter::new(query, busy)
    }

    /// Pending reservations whose TTL has lapsed but whose stored status
    /// still says pending.
    pub fn collect_expirable(&self, now: Ms) -> Vec<Ulid> {
        self.scan(|r| r.status == ReservationStatus::Pending && r.is_expired(now))
    }

    /// Terminal records whose last change is older than `retention_ms`.
    pub fn collect_purgeable(&self, now: Ms, retention_ms: Ms) -> Vec<Ulid> {
        self.scan(|r| {
            matches!(r.status, ReservationStatus::Cancelled | ReservationStatus::Expired)
                && r.updated_at.saturating_add(retention_ms) < now
        })
    }

    /// Best-effort scan for background tasks; resources locked by a writer are
    /// skipped and picked up on the next pass.
    fn scan(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Ulid> {
        let mut hits = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read() {
                hits.extend(guard.reservations.iter().filter(|r| pred(*r)).map(|r| r.id));
            }
        }
        hits
    }
}
