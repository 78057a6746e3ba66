//! Data Relay Module
//!
//! Moves bytes between accepted client streams and the upstream endpoint.

pub mod pump;
pub mod session;

pub use pump::{PumpDone, PumpOutcome};
pub use session::RelaySession;
