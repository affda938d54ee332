//! Session lifecycle management
//!
//! The heart of the service: [`SessionManager`] holds at most one live
//! conversation session, serializes starts and stops against each other,
//! detects turn completion from upstream signals, and fans session events
//! out to subscribers. Token minting and the transport are injected
//! behind traits so the whole machine runs against scripted doubles in
//! tests.

pub mod bus;
pub mod completion;
pub mod manager;
pub mod testing;
pub mod token;

pub use bus::{EventBus, Subscription};
pub use completion::{CompletionDetector, CompletionSignal, FinalizeResult};
pub use manager::{SessionManager, SessionManagerConfig, StartRequest};
pub use token::{
    HttpTokenProvider, RealtimeToken, StaticTokenProvider, TokenError, TokenProvider, TokenRequest,
};
