//! # Rust Event Builder Core Library
//!
//! Timestamp-ordering front end for a multi-source data acquisition system.
//! Many digitizer sources deliver timestamped fragments in per-source order;
//! this crate merges them into one globally ordered stream, synchronises
//! barrier (run-control) fragments across sources, and pushes back on
//! producers when too much data is queued.
//!
//! ## Crate Structure
//!
//! - **`fragment`**: `Fragment`, its fixed header, and the flat wire codec.
//! - **`handler`**: `FragmentHandler`, the single owner of every queued fragment.
//!   Ingestion, the flush policy, barrier resolution, flow control and source
//!   lifecycle all live here.
//! - **`observers`**: observer traits for ordered output and for every anomaly the
//!   handler reports, plus the registry that holds them.
//! - **`statistics`**: handler snapshots and reusable statistics-collecting observers.
//! - **`service`**: async single-owner event loop with an idle-flush timer.
//! - **`output`**: output stage that delivers ordered batches on its own task.
//! - **`config`**: layered configuration (TOML file + environment) via `figment`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the crate-wide `EvbError` type.

pub mod config;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod logging;
pub mod observers;
pub mod output;
pub mod service;
pub mod statistics;

pub use error::{EvbError, EvbResult};
pub use fragment::{Fragment, NULL_TIMESTAMP};
pub use handler::{FragmentHandler, HandlerSettings};
