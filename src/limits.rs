pub const MAX_FIELDS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SCHEDULE_LEN: usize = 4096;
pub const MAX_BOOKINGS_PER_FIELD: usize = 100_000;
