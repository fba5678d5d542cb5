use crate::model::Ms;

/// Live resources; soft-deleted ones do not count.
pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_USERS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DEVICE_ID_LEN: usize = 128;
pub const MAX_KIND_LEN: usize = 64;
pub const MAX_USERNAME_LEN: usize = 128;
pub const MAX_DEVICE_STATUS_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 512;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single reservation may not exceed 30 days.
pub const MAX_WINDOW_MS: Ms = 30 * 24 * 3_600_000;

pub const MAX_TIMEOUT_MINUTES: u32 = 30 * 24 * 60;
pub const MAX_PAGE_SIZE: usize = 500;

/// Longest accepted gateway line, in bytes.
pub const MAX_FRAME_LEN: usize = 8 * 1024;
