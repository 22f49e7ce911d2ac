//! Funnel conversion analytics: session building, step matching, step,
//! cohort and segment aggregation, and the query service on top.

#![warn(clippy::unwrap_used)]

pub mod aggregate;
pub mod assembler;
pub mod cohort;
pub mod definition;
pub mod dropoff;
pub mod engine;
pub mod export;
pub mod matcher;
pub mod reduce;
pub mod segment;
pub mod session;
pub mod store;
pub mod tally;

pub use definition::CompiledFunnel;
pub use engine::FunnelAnalyzer;
pub use matcher::{match_session, SessionProgress};
pub use session::{build_sessions, Session};
pub use store::{EventRepository, FunnelRepository, InMemoryEventStore, InMemoryFunnelStore};
