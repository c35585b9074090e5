pub mod clock;
pub mod entry;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entry::{CacheEntry, checksum};
pub use error::{CacheError, Result};
pub use types::{CacheLevel, Region};
