//! # Treelet Worker
//! The worker node of the treelet render cluster. A coordinator assigns
//! each worker a set of treelets (compact subtrees of the scene BVH); the
//! worker traces rays against its treelets, forwards rays that need a
//! treelet held elsewhere over paced reliable UDP, and returns finished
//! contributions upstream.
//!
//! The crate is a library plus the `treelet-worker` binary; the library
//! surface exists so the integration tests can drive workers in-process.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod config;
pub mod error;
pub mod net;
pub mod peers;
pub mod poller;
pub mod rays;
pub mod scene;
pub mod stats;
pub mod storage;
pub mod tracelog;
pub mod worker;

pub use config::{FinishedRayAction, WorkerConfig};
pub use error::WorkerError;
pub use worker::Worker;
