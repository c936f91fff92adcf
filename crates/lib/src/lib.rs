//! treeforge-lib: Incremental build engine for customized distribution
//! trees and ISOs.
//!
//! This crate provides the core machinery a distribution-build front end
//! drives:
//! - `task`: task descriptors, the task tree, statuses and protections
//! - `resolver`: hierarchical dependency resolution into a total order
//! - `scheduler`: the sequential execution loop over task lifecycles
//! - `fingerprint`: per-task change detection deciding what re-runs
//! - `cache`: content-addressable file cache with quota eviction
//! - `sync`: the narrow transport interface for materializing inputs
//! - `lock`: the per-build advisory lock serializing whole builds

pub mod cache;
pub mod context;
pub mod fingerprint;
pub mod graph;
pub mod lock;
pub mod resolver;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod util;
