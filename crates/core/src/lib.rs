//! Core types for the realtime conversation session manager
//!
//! This crate provides the vocabulary shared across all other crates:
//! - Connection lifecycle phases and their legal transitions
//! - Session control flags with a single reset point
//! - Assistant turn bookkeeping and completion causes
//! - Session descriptors, snapshots, and the typed event vocabulary
//!
//! There is no I/O here; everything is plain data.

pub mod events;
pub mod flags;
pub mod phase;
pub mod session;
pub mod turn;

pub use events::{ErrorKind, SessionEvent, SessionEventKind};
pub use flags::SessionControlFlags;
pub use phase::ConnectionPhase;
pub use session::{
    ProficiencyLevel, ScenarioId, SessionDescriptor, SessionSnapshot, UserContext,
};
pub use turn::{Turn, TurnCompletion};
