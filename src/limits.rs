//! Hard caps that keep a single tenant from exhausting memory or the WAL.

/// Longest window a single schedule expansion may cover.
pub const MAX_EXPANSION_DAYS: i64 = 366;

/// Widest date window a listing query may scan.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MAX_SLOTS_PER_PROVIDER: usize = 10_000;

pub const MAX_BOOKINGS_PER_SLOT: usize = 1_440;

/// One rule per weekday.
pub const MAX_RULES_PER_SCHEDULE: usize = 7;

pub const MAX_CONTACT_LEN: usize = 320;

pub const MAX_TENANTS: usize = 1_024;

pub const MAX_TENANT_NAME_LEN: usize = 128;
