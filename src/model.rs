use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Open key-value bag carried on a reservation; never interpreted by the engine.
pub type Metadata = BTreeMap<String, String>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A time slot held on one resource by one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: String,
    pub owner_id: String,
    pub span: Span,
    /// Stored status. Use [`Reservation::effective_status`] for anything
    /// time-dependent: a pending record past its TTL is expired even before the
    /// reaper persists the transition.
    pub status: ReservationStatus,
    pub appointment_id: Option<String>,
    pub ttl_ms: Ms,
    pub metadata: Metadata,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn expires_at(&self) -> Ms {
        self.created_at + self.ttl_ms
    }

    /// True once a still-pending reservation has outlived its TTL.
    pub fn is_expired(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::Expired => true,
            ReservationStatus::Pending => is_expired(self.created_at, self.ttl_ms, now),
            ReservationStatus::Confirmed | ReservationStatus::Cancelled => false,
        }
    }

    pub fn effective_status(&self, now: Ms) -> ReservationStatus {
        if self.is_expired(now) {
            ReservationStatus::Expired
        } else {
            self.status
        }
    }

    /// Whether this reservation blocks other reservations on its resource.
    pub fn is_occupying(&self, now: Ms) -> bool {
        matches!(
            self.effective_status(now),
            ReservationStatus::Pending | ReservationStatus::Confirmed
        )
    }

    /// Snapshot with the lazily evaluated status applied, as handed to callers.
    pub fn view(&self, now: Ms) -> Reservation {
        let mut r = self.clone();
        r.status = self.effective_status(now);
        r
    }
}

/// `now > created_at + ttl`: a reservation is still live at the exact expiry instant.
pub fn is_expired(created_at: Ms, ttl_ms: Ms, now: Ms) -> bool {
    now > created_at + ttl_ms
}

/// Per-resource state: every reservation record on the resource, sorted by
/// `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: String,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip records starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: String,
        appointment_id: String,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: String,
        at: Ms,
    },
    ReservationExpired {
        id: Ulid,
        resource_id: String,
        at: Ms,
    },
    /// Record physically removed (reaper retention or admin sweep).
    ReservationPurged {
        id: Ulid,
        resource_id: String,
    },
}

impl Event {
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ReservationPlaced { reservation } => &reservation.resource_id,
            Event::ReservationConfirmed { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. }
            | Event::ReservationExpired { resource_id, .. }
            | Event::ReservationPurged { resource_id, .. } => resource_id,
        }
    }

    pub fn reservation_id(&self) -> Ulid {
        match self {
            Event::ReservationPlaced { reservation } => reservation.id,
            Event::ReservationConfirmed { id, .. }
            | Event::ReservationCancelled { id, .. }
            | Event::ReservationExpired { id, .. }
            | Event::ReservationPurged { id, .. } => *id,
        }
    }
}

// ── Query inputs and results ─────────────────────────────────────

/// Everything the caller supplies to place a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Option<Ulid>,
    pub resource_id: String,
    pub owner_id: String,
    pub start: Ms,
    pub end: Ms,
    pub ttl_ms: Option<Ms>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub owner_id: Option<String>,
    /// Matched against the effective status.
    pub status: Option<ReservationStatus>,
    pub resource_id: Option<String>,
    /// Reservations fully inside `[start, end]`.
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation, now: Ms) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.owner_id.as_deref().is_none_or(|o| r.owner_id == o)
            && self.status.is_none_or(|s| r.effective_status(now) == s)
            && self.resource_id.as_deref().is_none_or(|rid| r.resource_id == rid)
            && self.start.is_none_or(|s| r.span.start >= s)
            && self.end.is_none_or(|e| r.span.end <= e)
    }
}

/// One candidate returned by slot enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
}

impl Slot {
    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = 60_000;

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: "room-1".into(),
            owner_id: "alice".into(),
            span: Span::new(start, end),
            status,
            appointment_id: None,
            ttl_ms: 1_000,
            metadata: Metadata::new(),
            created_at: 10_000,
            updated_at: 10_000,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let r = reservation(0, 15 * M, ReservationStatus::Pending);
        assert!(!r.is_expired(10_999));
        assert!(!r.is_expired(11_000));
        assert!(r.is_expired(11_001));
        assert_eq!(r.expires_at(), 11_000);
    }

    #[test]
    fn confirmed_and_cancelled_never_expire() {
        let c = reservation(0, 15 * M, ReservationStatus::Confirmed);
        assert!(!c.is_expired(i64::MAX));
        assert!(c.is_occupying(i64::MAX));

        let x = reservation(0, 15 * M, ReservationStatus::Cancelled);
        assert!(!x.is_expired(i64::MAX));
        assert!(!x.is_occupying(0));
    }

    #[test]
    fn effective_status_applies_lazy_expiry() {
        let r = reservation(0, 15 * M, ReservationStatus::Pending);
        assert_eq!(r.effective_status(10_500), ReservationStatus::Pending);
        assert_eq!(r.effective_status(20_000), ReservationStatus::Expired);
        assert!(!r.is_occupying(20_000));
        assert_eq!(r.view(20_000).status, ReservationStatus::Expired);
        // stored status untouched
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[test]
    fn status_parse() {
        assert_eq!("Pending".parse::<ReservationStatus>(), Ok(ReservationStatus::Pending));
        assert_eq!("canceled".parse::<ReservationStatus>(), Ok(ReservationStatus::Cancelled));
        assert!("held".parse::<ReservationStatus>().is_err());
        assert_eq!(ReservationStatus::Confirmed.to_string(), "confirmed");
        assert!(ReservationStatus::Expired.is_terminal());
        assert!(!ReservationStatus::Pending.is_terminal());
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut rs = ResourceState::new("room-1".into());
        rs.insert(reservation(300, 400, ReservationStatus::Pending));
        rs.insert(reservation(100, 200, ReservationStatus::Confirmed));
        rs.insert(reservation(200, 300, ReservationStatus::Pending));
        let starts: Vec<Ms> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_and_lookup() {
        let mut rs = ResourceState::new("room-1".into());
        let r = reservation(100, 200, ReservationStatus::Pending);
        let id = r.id;
        rs.insert(r);
        assert!(rs.get(id).is_some());
        assert!(rs.remove(Ulid::new()).is_none());
        assert_eq!(rs.remove(id).map(|r| r.id), Some(id));
        assert!(rs.reservations.is_empty());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new("room-1".into());
        rs.insert(reservation(100, 200, ReservationStatus::Confirmed));
        rs.insert(reservation(450, 600, ReservationStatus::Confirmed));
        rs.insert(reservation(1000, 1100, ReservationStatus::Confirmed));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new("room-1".into());
        rs.insert(reservation(100, 200, ReservationStatus::Confirmed));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn filter_matches_effective_status() {
        let r = reservation(0, 15 * M, ReservationStatus::Pending);
        let pending = ReservationFilter {
            status: Some(ReservationStatus::Pending),
            ..Default::default()
        };
        let expired = ReservationFilter {
            status: Some(ReservationStatus::Expired),
            ..Default::default()
        };
        assert!(pending.matches(&r, 10_000));
        assert!(!pending.matches(&r, 50_000));
        assert!(expired.matches(&r, 50_000));
    }

    #[test]
    fn filter_by_owner_resource_and_window() {
        let r = reservation(10 * M, 25 * M, ReservationStatus::Confirmed);
        let f = ReservationFilter {
            owner_id: Some("alice".into()),
            resource_id: Some("room-1".into()),
            start: Some(10 * M),
            end: Some(30 * M),
            ..Default::default()
        };
        assert!(f.matches(&r, 0));

        let other_owner = ReservationFilter {
            owner_id: Some("bob".into()),
            ..Default::default()
        };
        assert!(!other_owner.matches(&r, 0));

        let narrow = ReservationFilter {
            end: Some(20 * M),
            ..Default::default()
        };
        assert!(!narrow.matches(&r, 0));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut r = reservation(0, 15 * M, ReservationStatus::Pending);
        r.metadata.insert("room".into(), "3".into());
        let event = Event::ReservationPlaced { reservation: r };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.resource_id(), "room-1");
    }
}
