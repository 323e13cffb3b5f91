use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_EXTERNAL_ID_LEN: usize = 64;

pub const MAX_STATIONS: usize = 10_000;
pub const MAX_PEOPLE: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_STATION: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One booking may not run longer than a week.
pub const MAX_BOOKING_DURATION_MS: Ms = 7 * 24 * 3_600_000;

/// Max bytes for a single wire line.
pub const MAX_LINE_LEN: usize = 64 * 1024;
