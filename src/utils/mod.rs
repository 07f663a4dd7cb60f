pub use clock::{Clock, MockClock, SystemClock};

mod clock;
