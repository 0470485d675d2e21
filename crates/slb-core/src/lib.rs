//! # slb-core
//!
//! Core library for slb — a two-person rule authorization gate for
//! destructive shell commands issued by AI coding agents.
//!
//! A requesting agent submits the command it wants to run; one or more
//! independent reviewing agents must approve before the command is released
//! for execution. Approvals are bound cryptographically to the exact command
//! text, working directory, and argument vector, so a reviewed approval
//! cannot be silently repurposed for a different command.
//!
//! This crate holds the pure domain logic:
//!
//! - **Command normalization**: wrapper stripping, compound/pipe splitting,
//!   subshell detection ([`normalize`])
//! - **Risk classification**: mapping commands onto the
//!   `safe`/`caution`/`dangerous`/`critical` tiers ([`classify`])
//! - **Request lifecycle**: the status state machine and its timestamp
//!   invariants ([`statemachine`])
//! - **Review signatures**: HMAC-SHA256 binding of reviewer decisions
//!   ([`signature`])
//! - **Event model**: the NDJSON event records and the polling fallback
//!   decision ([`events`])
//!
//! Persistence, the event daemon, and the CLI live in the `slb-daemon` and
//! `slb-cli` crates.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod attachment;
pub mod classify;
pub mod config;
pub mod dryrun;
pub mod events;
pub mod hash;
pub mod normalize;
pub mod ratelimit;
pub mod redact;
pub mod signature;
pub mod statemachine;
pub mod types;

pub use classify::{Classification, classify_command};
pub use config::SlbConfig;
pub use hash::compute_command_hash;
pub use normalize::{NormalizedCommand, normalize_command};
pub use statemachine::{can_transition, is_terminal, transition};
pub use types::{
    Attachment, AttachmentType, CommandSpec, Decision, Justification, Request, RequestStatus,
    Review, RiskTier, Session,
};
