//! Time source for idle-timeout bookkeeping.
//!
//! Production code uses `std::time::Instant`. Unit tests swap in
//! `mock_instant::thread_local::Instant`, which only moves when the test
//! calls `MockClock::advance`, so expiry can be checked without sleeping.
//!
//! ```ignore
//! use crate::clock::MockClock;
//! use std::time::Duration;
//!
//! MockClock::set_time(Duration::ZERO);
//! let port = nat.to_internet(&mut packet).unwrap();
//! MockClock::advance(Duration::from_secs(66));
//! assert_eq!(nat.sweep_expired(), 1);
//! ```

#[cfg(test)]
pub use mock_instant::thread_local::Instant;

#[cfg(not(test))]
pub use std::time::Instant;

#[cfg(test)]
pub use mock_instant::thread_local::MockClock;
