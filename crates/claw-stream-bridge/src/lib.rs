//! Clawbernetes Stream Bridge
//!
//! Runs a line-oriented JSON engine as a supervised child process and exposes
//! it to many HTTP clients at once. Everything the engine writes to stdout is
//! framed into JSON values and fanned out to every connected SSE client;
//! clients send envelopes back with a plain POST, which are written to the
//! engine's stdin one per line.
//!
//! ## Endpoints
//!
//! | Method | Path       | Description                                   |
//! |--------|------------|-----------------------------------------------|
//! | GET    | `/sse`     | Stream of `frame` and `parse_error` events    |
//! | POST   | `/message` | Forward one JSON envelope to the engine (202) |
//! | GET    | `/health`  | Engine state, restart count, subscriber count |
//!
//! ## Wire format
//!
//! Engine stdout, one JSON value per line:
//! ```json
//! {"jsonrpc":"2.0","id":1,"result":{}}
//! ```
//!
//! Delivered to SSE clients as:
//! ```text
//! event: frame
//! data: {"jsonrpc":"2.0","id":1,"result":{}}
//! ```
//!
//! A line that is not valid JSON produces a `parse_error` event carrying the
//! raw text and the parser error, and framing continues with the next line.
//!
//! ## Engine lifecycle
//!
//! The engine is restarted with exponential backoff whenever it exits.
//! Subscribers stay attached across restarts; envelopes posted while no engine
//! is running are rejected with 503 rather than queued.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod framer;
pub mod handlers;
pub mod hub;
pub mod router;
pub mod routes;
pub mod server;
pub mod state;
pub mod supervisor;

pub use backoff::BackoffPolicy;
pub use config::BridgeConfig;
pub use engine::{CurrentEngine, EngineHandle, EngineState, ExitReason};
pub use error::{BridgeError, BridgeResult};
pub use framer::{FrameEvent, LineFramer, ParseFailure};
pub use hub::{BroadcastHub, FrameSink, Subscription};
pub use router::{Envelope, InboundRouter};
pub use routes::create_router;
pub use server::BridgeService;
pub use state::BridgeState;
pub use supervisor::{EngineSupervisor, SupervisorConfig, SupervisorStatus};
