use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Also bounds how many day-bucket leases a single admission takes.
pub const MAX_BOOKING_DURATION_MS: Ms = 7 * DAY_MS;
pub const MAX_BUFFER_AFTER_MS: Ms = DAY_MS;

pub const MAX_BOOKING_CAPACITY: u32 = 10_000;
pub const MAX_PARTICIPANTS: usize = 256;
pub const MAX_CONTACT_LEN: usize = 128;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Re-read attempts for a status change that lost a version race.
pub const MAX_STATUS_RETRIES: usize = 8;
