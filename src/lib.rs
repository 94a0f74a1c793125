//! SCST Configurator
//!
//! A declarative configuration orchestrator for the SCST SCSI target
//! subsystem. Given a textual configuration describing the desired state
//! (handlers, devices, target drivers, targets, LUN assignments, initiator
//! groups and ALUA device groups), it computes and executes the minimal
//! ordered set of writes against the SCST control filesystem so the live
//! state converges to the declared state in a single pass.
//!
//! # Architecture
//!
//! ```text
//!   config text ──► parser ───► desired model ─┐
//!                                              ├─► planner ─► change sets
//!   control FS ──► state reader ─► current model┘                 │
//!                                                                 ▼
//!   control FS ◄── sysfs adapter ◄───────────────── convergence engine
//!                                                  (phases 0-9, strict order)
//! ```
//!
//! # Modules
//!
//! - [`config`]: typed configuration model and the file parser
//! - [`reader`]: current live state from the control filesystem
//! - [`plan`]: pure diff of desired vs. current state
//! - [`engine`]: ordered application of the plan with enable/disable rules
//! - [`sysfs`]: control-filesystem adapter (attribute writes, management
//!   commands, result verification)
//! - [`modules`]: kernel-module policy and loading
//! - [`error`]: error types and handling

pub mod config;
pub mod engine;
pub mod error;
pub mod modules;
pub mod plan;
pub mod reader;
pub mod sysfs;

// Re-export commonly used types
pub use config::parser::ConfigParser;
pub use config::ScstConfig;
pub use engine::{ApplyReport, ConvergenceEngine, EngineOptions};
pub use error::{Error, Result};
pub use modules::{ModprobeLoader, ModuleLoader, ModuleManager};
pub use plan::ConvergencePlan;
pub use reader::StateReader;
pub use sysfs::{ControlFs, DiskFs, ScstSysfs, DEFAULT_ROOT, DEFAULT_TIMEOUT_SECS};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
