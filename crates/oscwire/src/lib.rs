//! OSC plumbing for the DAW bridge: wire codec, shared UDP socket pair, and
//! an awaited request/response layer over the remote script's
//! address-mirroring reply convention.

pub mod codec;
pub mod query;
pub mod transport;

pub use codec::{OscError, OscMessage, OscValue};
pub use query::{OscQuery, QueryError, DEFAULT_QUERY_TIMEOUT};
pub use transport::{OscConfig, OscTransport, ERROR_ADDRESS};
