/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Seed value passed through to the sampler. `0` asks the relay to draw one.
pub type Seed = u64;
