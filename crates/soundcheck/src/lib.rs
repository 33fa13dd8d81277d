//! soundcheck: a chat server that lets an LLM agent observe and drive a
//! live DAW session over OSC.
//!
//! One UDP socket pair talks to the DAW's remote script; each client
//! session gets a websocket carrying agent output, tool events, indexing
//! progress, and the debounced parameter changes the human makes at the
//! desk.

pub mod channel;
pub mod config;
pub mod events;
pub mod prompts;
pub mod sessions;

pub use channel::{router, App};
pub use config::Config;
pub use events::{ClientEvent, InboundFrame, END_MESSAGE_SENTINEL};
pub use sessions::{Session, SessionManager};
