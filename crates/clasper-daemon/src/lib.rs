//! # clasper-daemon
//!
//! Service composition for the Clasper governance control plane: the
//! execution decision orchestrator, telemetry ingest pipeline, credential
//! authentication, the decision expiry sweeper, and environment
//! configuration.
//!
//! HTTP route wiring deliberately lives outside this crate; an adapter
//! maps resources onto [`state::Daemon`]'s services and onto the error
//! taxonomy's status codes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod ingest;
pub mod orchestrator;
pub mod state;
pub mod sweeper;

pub use config::Config;
pub use context::{Authenticator, RequestContext};
pub use ingest::{IngestReceipt, TelemetryIngest};
pub use orchestrator::DecisionOrchestrator;
pub use state::Daemon;
