//! dysect-core: probe trees and quorum aggregation for a scalable
//! parallel-application debugger.
//!
//! A user describes what to observe in a running distributed job as a
//! *probe tree*: conditional breakpoints chained by event-driven edges.
//! The tree materializes across a tree-structured overlay — front-end,
//! interior aggregators, per-node back-ends. Back-ends insert
//! breakpoints, evaluate predicates on stopped processes, fold
//! collected data into commutative/associative *aggregates*, and emit
//! one tagged packet per probe round; interior nodes merge packets;
//! the front-end renders the result.
//!
//! # Architecture
//!
//! ```text
//! session script ─► ProbeTree ─► Session (back-end engine)
//!                                   │ event fires, condition holds
//!                                   ▼
//!                      actions collect → Coordinator stages
//!                                   │ quorum or wait timer
//!                                   ▼
//!                            Packet ─► UpstreamFilter (interior merge)
//!                                   ▼
//!                               Frontend (demux, finish, render)
//! ```
//!
//! # Modules
//!
//! - `value`: typed polymorphic scalar with a stable wire form
//! - `data_ref`: symbolic target-variable references
//! - `expr` / `condition`: infix predicates with tri-state evaluation
//! - `aggregate`: the closed aggregate algebra and its merge
//! - `packet`: the tagged big-endian overlay codec
//! - `event`: code-location, async, time, and combinator triggers
//! - `domain`: world/group/inherit participation sets
//! - `probe` / `probe_tree`: the probe model and root forest
//! - `timer`: monotonic wait-timer heap (select-boundary polling)
//! - `coordinator`: back-end staging and quorum
//! - `filter`: interior-tier packet merging
//! - `frontend`: front-end demux and action finish
//! - `session`: the back-end engine owning all process-wide state
//! - `engine`: the debugger-engine trait the core consumes
//! - `default_probes`: canned exit/abort/signal coverage
//!
//! Front-end and back-end flatten the same tree with the same
//! deterministic id allocation, so probe ids and aggregate slot ids
//! agree across tiers without negotiation.
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod action;
pub mod aggregate;
pub mod condition;
pub mod config;
pub mod coordinator;
pub mod data_ref;
pub mod default_probes;
pub mod domain;
pub mod engine;
pub mod error;
pub mod event;
pub mod expr;
pub mod filter;
pub mod frontend;
pub mod logging;
pub mod packet;
pub mod probe;
pub mod probe_tree;
pub mod process_table;
pub mod session;
pub mod test_support;
pub mod timer;
pub mod value;

mod wire;

pub use config::SessionConfig;
pub use error::{DysectError, Result};
pub use session::{EngineEvent, Session};
