//! Hard limits. Anything an operator may tune lives in `config.rs` instead.

use crate::model::Ms;

/// Default upper bound on room name length (characters).
pub const DEFAULT_MAX_ROOM_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

pub const MAX_EMAIL_LEN: usize = 320;
pub const MIN_PASSWORD_LEN: usize = 3;
pub const MAX_PASSWORD_LEN: usize = 1024;

pub const MAX_ROOMS: usize = 100_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single reservation may not span more than 31 days.
pub const MAX_RESERVATION_DURATION_MS: Ms = 31 * 24 * 3_600_000;
