//! Wiring of the protocol components behind an all-or-nothing step boundary.

pub mod clock;
pub mod system;

pub use clock::{Clock, ManualClock, SystemClock};
pub use system::CreditSystem;
