//! Live-session model: the DAW bridge, the mixer mirror, and the parameter
//! change observer.
//!
//! The DAW is authoritative; everything here is a mirror rebuilt on attach
//! and reindex, plus a debounced history of the parameter moves the human
//! makes while a session is open.

pub mod bridge;
pub mod indexer;
pub mod mirror;
pub mod observer;
pub mod types;

pub use bridge::{addresses, BridgeError, LiveBridge, DEFAULT_LIVENESS_TIMEOUT};
pub use indexer::{Indexer, IndexingProgress};
pub use mirror::MixerMirror;
pub use observer::{ObserverConfig, ParameterObserver};
pub use types::{
    Device, MixerSnapshot, ParamKey, Parameter, ParameterChange, SetParameterOutcome, Track,
};
