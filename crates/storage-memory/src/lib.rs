//! In-memory storage for finlink.
//!
//! Implements the store traits defined in `finlink-core` without any external
//! database. Suitable for single-instance deployments and tests; state is lost
//! on restart.
//!
//! ```text
//!        finlink-core (traits)
//!                │
//!                ▼
//!   storage-memory (this crate)
//!     ├── MemoryHealthStore        DashMap, entry lock per key
//!     ├── MemoryAttemptLog         bounded append-only ring
//!     └── StaticInstitutionRouting fixed institution → provider table
//! ```

pub mod attempts;
pub mod health;
pub mod routing;

pub use attempts::MemoryAttemptLog;
pub use health::MemoryHealthStore;
pub use routing::StaticInstitutionRouting;
