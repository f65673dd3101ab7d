use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Validated slot query: window, candidate length, and stride between candidate starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotQuery {
    pub window: Span,
    pub duration: Ms,
    pub step: Ms,
}

impl SlotQuery {
    pub fn new(start: Ms, end: Ms, duration: Ms, step: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("window start must be before window end"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        if !(MIN_SLOT_DURATION_MS..=MAX_SLOT_DURATION_MS).contains(&duration) {
            return Err(EngineError::Validation("slot duration must be 15 to 480 minutes"));
        }
        if step < MIN_SLOT_STEP_MS {
            return Err(EngineError::Validation("slot step must be at least one minute"));
        }
        Ok(Self {
            window: Span::new(start, end),
            duration,
            step,
        })
    }
}

/// Lazily yields free candidate slots for one resource.
///
/// Candidates start at `window.start` and advance by `step`; each candidate is
/// `[t, t + duration)` and generation stops once it would end past the window.
/// `busy` is a snapshot of occupying intervals taken once up front, so the
/// whole enumeration costs one fetch regardless of how many steps it walks.
/// A clone walks the same sequence independently from the current position.
#[derive(Debug, Clone)]
pub struct SlotIter {
    query: SlotQuery,
    busy: Vec<Span>,
    cursor: usize,
    next_start: Ms,
}

impl SlotIter {
    pub fn new(query: SlotQuery, mut busy: Vec<Span>) -> Self {
        busy.sort_by_key(|s| s.start);
        Self {
            query,
            busy: merge_overlapping(&busy),
            cursor: 0,
            next_start: query.window.start,
        }
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        loop {
            let start = self.next_start;
            let end = start.checked_add(self.query.duration)?;
            if end > self.query.window.end {
                return None;
            }
            self.next_start = start.saturating_add(self.query.step);

            // Candidates only move forward, so busy spans ending at or before
            // `start` can never matter again.
            while self.cursor < self.busy.len() && self.busy[self.cursor].end <= start {
                self.cursor += 1;
            }
            let blocked = self
                .busy
                .get(self.cursor)
                .is_some_and(|b| b.start < end);
            if !blocked {
                return Some(Slot { start, end });
            }
        }
    }
}
