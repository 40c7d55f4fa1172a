//! rltest: a parallel, tag-driven regression test harness.
//!
//! This crate runs declaratively-defined test cases against an opaque
//! system-under-test binary. Tests are discovered from XML manifests,
//! filtered into named variants by tag, executed on a supervised worker
//! pool under per-test timeouts, and classified by exit code and output
//! comparison against baseline files.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Config**: the immutable [`RunContext`](config::RunContext) threaded
//!   through every stage of a run
//! - **Loader**: materializes [`Test`](loader::Test) records from the folder
//!   registry and per-folder manifests
//! - **Selection**: tag-based eligibility of folders and tests
//! - **Executor**: worker pools, subprocess lifecycle, timeout enforcement,
//!   and outcome classification
//! - **Report**: per-folder counters, live progress, and summaries
//! - **Variant**: the per-variant lifecycle (select → schedule → aggregate
//!   → summarize)

pub mod config;
pub mod executor;
pub mod loader;
pub mod report;
pub mod selection;
pub mod variant;

// Re-export commonly used types
pub use config::{BuildFlavor, RunContext, TargetArch};
pub use executor::{OutcomeMessage, WorkerPools};
pub use loader::{Test, TestFolder, TestLoader};
pub use report::{PassFailCount, TestResult};
pub use variant::TestVariant;
