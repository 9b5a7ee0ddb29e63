//! Types library for the market event stream
//!
//! This library provides the core type definitions shared by the distribution
//! and persistence services, so that every component agrees on identifiers,
//! decimal semantics, event shapes and the minute-bar merge rules.
//!
//! # Modules
//! - `ids`: Unique identifiers (SessionId, DeltaId, BatchId, Symbol)
//! - `numeric`: Fixed-point decimal types (Price, Volume)
//! - `event`: Inbound typed signals and the transport-safe `Event` view
//! - `bar`: Minute bar deltas and the commutative merge
//! - `time`: Unix-nanosecond clock helpers
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod numeric;
pub mod event;
pub mod bar;
pub mod time;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::event::*;
    pub use crate::bar::*;
    pub use crate::errors::*;
}
