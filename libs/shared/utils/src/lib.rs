pub mod clock;
pub mod test_utils;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
