use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a span from caller input, rejecting empty/inverted or absurd ranges.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_id(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(what));
    }
    if value.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

/// Occupying reservations on `rs` that overlap `span`, ordered by start.
/// `exclude` drops one reservation from consideration (re-checking a
/// reservation against its own resource).
pub fn find_conflicts<'a>(
    rs: &'a ResourceState,
    span: &'a Span,
    exclude: Option<Ulid>,
    now: Ms,
) -> impl Iterator<Item = &'a Reservation> + 'a {
    rs.overlapping(span)
        .filter(move |r| exclude != Some(r.id) && r.is_occupying(now))
}

pub fn has_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>, now: Ms) -> bool {
    find_conflicts(rs, span, exclude, now).next().is_some()
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
    now: Ms,
) -> Result<(), EngineError> {
    match find_conflicts(rs, span, exclude, now).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
