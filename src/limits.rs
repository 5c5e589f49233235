//! Hard caps that keep a single site's memory and WAL bounded.

pub const MAX_SITES: usize = 64;
pub const MAX_SITE_NAME_LEN: usize = 128;

pub const MAX_USERS_PER_SITE: usize = 100_000;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_VEHICLES_PER_USER: usize = 16;
pub const MAX_RESERVATIONS_PER_USER: usize = 366;

pub const MAX_FLOORS: usize = 64;
pub const MAX_FLOOR_NAME_LEN: usize = 32;
pub const MAX_SLOTS_PER_FLOOR: u32 = 1_000;

/// Applies to usernames, emails, brands, models and plates.
pub const MAX_TEXT_LEN: usize = 128;

/// Phone numbers are exactly this many ASCII digits.
pub const PHONE_DIGITS: usize = 11;
