#![forbid(unsafe_code)]
//! # tsumiki
//!
//! An incremental build-task execution engine.
//!
//! Tasks declare their inputs and outputs as file trees, plus any plain
//! values that influence them. Before a task runs, the engine fingerprints
//! those files and compares them with the fingerprints recorded after the
//! last successful run. A task whose inputs and outputs are unchanged is
//! `UP-TO-DATE` and skipped. An incremental task whose inputs changed gets
//! the exact list of added, modified and removed files, so it only has to
//! redo the work for those.
//!
//! ```no_run
//! use tsumiki::{Engine, Settings, TaskGraph, TaskNode};
//!
//! let mut graph = TaskGraph::new();
//! graph.add_node(
//!     TaskNode::new("compile")
//!         .input_file("sources", "src")
//!         .output("classes", "build/classes")
//!         .incremental()
//!         .do_last(|ctx| {
//!             for change in ctx.changes().unwrap_or_default() {
//!                 println!("{:?} {}", change.change, change.path);
//!             }
//!             Ok(())
//!         }),
//! )?;
//!
//! let engine = Engine::new(&Settings::default())?;
//! let report = engine.run(&mut graph, ["compile"])?;
//! println!("{report}");
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Task graphs can also be assembled lazily with a [`Blueprint`], either by
//! hand or from JSON descriptors bound to actions of an [`ActionRegistry`].

pub mod action;
mod blueprint;
mod core;
mod deferred;
mod engine;
mod error;
mod fingerprint;
mod graph;
mod store;
mod task;
mod utils;

pub use crate::action::{Action, ActionContext, ActionRegistry, CancelToken};
pub use crate::blueprint::{Blueprint, Handle, InputDescriptor, OutputDescriptor, TaskDescriptor};
pub use crate::core::{Hash32, Settings};
pub use crate::deferred::Deferred;
pub use crate::engine::{
    CancelHandle, ChangeRecord, ChangeType, Decision, Engine, ExecutionReport, Reason, SkipReason,
    TaskRecord, TaskState, Verdict, build_changes, check,
};
pub use crate::error::*;
pub use crate::fingerprint::{
    FileFingerprint, FileType, PathFilter, PropertySnapshot, Sensitivity, Snapshot,
    snapshot_property,
};
pub use crate::graph::{Edge, Plan, Rule, TaskGraph};
pub use crate::store::{FingerprintStore, TaskHistory};
pub use crate::task::{InputProperty, InputSource, OutputProperty, Predicate, TaskNode};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
