#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! cmdrelay library — the channel broker and both relay client flavours.
//!
//! - `broker` — frame dispatch, command routing, axum WebSocket endpoint
//! - `registry` — live connections and their registered identity
//! - `channels` — named routing groups (one worker, many controllers)
//! - `ledger` — pending commands with timeout guards
//! - `client` — `CommandRelay` trait, embedded and remote implementations
//! - `events` — lifecycle events and workflow-trigger payloads
//! - `protocol` — typed wire frames
//! - `config` — configuration loading
//! - `error` — error types

pub mod broker;
pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod protocol;
pub mod registry;

// Re-export key types at crate root for convenience.
pub use broker::Broker;
pub use client::{ClientPurpose, CommandRelay, EmbeddedRelay, RemoteRelay};
pub use config::Config;
pub use error::RelayError;
pub use events::{BrokerEvent, TriggerFeed};
