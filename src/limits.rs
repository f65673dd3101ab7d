use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;

// ── Reservation rules ────────────────────────────────────────

/// Shortest reservable interval.
pub const MIN_RESERVATION_MS: Ms = 15 * MINUTE_MS;
pub const DEFAULT_TTL_MS: Ms = 30_000;
pub const MIN_TTL_MS: Ms = 1_000;
pub const MAX_TTL_MS: Ms = 300_000;

// ── Slot enumeration ─────────────────────────────────────────

pub const DEFAULT_SLOT_STEP_MS: Ms = 15 * MINUTE_MS;
pub const MIN_SLOT_DURATION_MS: Ms = 15 * MINUTE_MS;
pub const MAX_SLOT_DURATION_MS: Ms = 480 * MINUTE_MS;
/// Smallest step accepted from a caller; keeps a window from exploding into
/// millions of candidates.
pub const MIN_SLOT_STEP_MS: Ms = MINUTE_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 60 * MINUTE_MS;

// ── Sanity bounds ────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
pub const MAX_RESERVATION_SPAN_MS: Ms = 31 * 24 * 60 * MINUTE_MS;

pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_METADATA_ENTRIES: usize = 64;
pub const MAX_METADATA_VALUE_LEN: usize = 1024;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
