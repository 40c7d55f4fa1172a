//! Test execution engine.
//!
//! The executor owns two worker pools for the lifetime of a run: a parallel
//! pool sized to the configured concurrency and a single-permit sequential
//! pool for folders whose tests share on-disk state. Each dispatched test
//! runs in its own child process supervised by a tokio task; outcomes flow
//! back to the aggregator over a bounded one-directional channel, exactly
//! one message per test.

pub mod classify;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RunContext;
use crate::loader::Test;

/// Buffered capacity of the outcome channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// The single report a worker emits for one executed test.
#[derive(Debug, Clone)]
pub struct OutcomeMessage {
    /// Resolved path of the test file.
    pub file: PathBuf,
    pub failed: bool,
    /// Wall-clock time the test took.
    pub elapsed: Duration,
    /// Buffered diagnostic text; empty for quiet passes.
    pub output: String,
}

/// The two pools a run schedules onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Parallel,
    Sequential,
}

/// Worker pools shared by every variant of a run.
///
/// The pools are tokio semaphores gating spawned worker tasks; each worker
/// runs its test in an isolated child process, so the permits bound child
/// concurrency, not shared-memory threads. The cancellation token is
/// observed before each dispatch, which is where operator-initiated
/// cancellation would hook in.
pub struct WorkerPools {
    parallel: Arc<Semaphore>,
    sequential: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerPools {
    pub fn new(workers: usize) -> Self {
        WorkerPools {
            parallel: Arc::new(Semaphore::new(workers.max(1))),
            sequential: Arc::new(Semaphore::new(1)),
            cancel: CancellationToken::new(),
        }
    }

    /// Signal that no further tests should be dispatched.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn pool(&self, kind: PoolKind) -> Arc<Semaphore> {
        match kind {
            PoolKind::Parallel => self.parallel.clone(),
            PoolKind::Sequential => self.sequential.clone(),
        }
    }
}

/// Per-variant execution parameters shared by all of its workers.
pub struct ExecPlan {
    pub ctx: Arc<RunContext>,
    /// Variant base flags, possibly containing `${id}` placeholders.
    pub compile_flags: Vec<String>,
    has_expansion: bool,
}

impl ExecPlan {
    pub fn new(ctx: Arc<RunContext>, compile_flags: Vec<String>) -> Self {
        let placeholder = Regex::new(r"\$\{.+\}").unwrap();
        let has_expansion = compile_flags.iter().any(|f| placeholder.is_match(f));
        ExecPlan {
            ctx,
            compile_flags,
            has_expansion,
        }
    }

    /// The variant flags with `${id}` substituted for this test's id.
    fn expanded_flags(&self, id: u32) -> Vec<String> {
        if !self.has_expansion {
            return self.compile_flags.clone();
        }
        let id = id.to_string();
        self.compile_flags
            .iter()
            .map(|f| f.replace("${id}", &id))
            .collect()
    }
}

/// Dispatch a set of tests onto one of the pools.
///
/// Every test gets its own supervising task; the semaphore bounds how many
/// run at once. Each task sends exactly one outcome message unless the run
/// was cancelled before its permit arrived.
pub fn dispatch(
    pools: &WorkerPools,
    plan: Arc<ExecPlan>,
    tests: Vec<Test>,
    kind: PoolKind,
    outcomes: mpsc::Sender<OutcomeMessage>,
) -> Vec<JoinHandle<()>> {
    let semaphore = pools.pool(kind);
    let cancel = pools.cancel.clone();

    tests
        .into_iter()
        .map(|test| {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let plan = plan.clone();
            let outcomes = outcomes.clone();
            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    return;
                }
                let message = worker::run_one(&plan, test).await;
                if outcomes.send(message).await.is_err() {
                    warn!("outcome channel closed before all results were reported");
                }
            })
        })
        .collect()
}

/// Channel sized for the outcome stream of one variant.
pub fn outcome_channel() -> (mpsc::Sender<OutcomeMessage>, mpsc::Receiver<OutcomeMessage>) {
    mpsc::channel(OUTCOME_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildFlavor, TargetArch};
    use crate::selection::TagSet;

    fn make_ctx() -> Arc<RunContext> {
        Arc::new(RunContext {
            binary: PathBuf::from("/bin/true"),
            test_root: PathBuf::from("."),
            flavor: BuildFlavor::Test,
            arch: TargetArch::X64,
            default_timeout: Duration::from_secs(60),
            extra_flags: Vec::new(),
            flags: Vec::new(),
            tags: TagSet::new(),
            not_tags: TagSet::new(),
            not_compile_flags: None,
            workers: 4,
            verbose: false,
            show_passes: false,
            warn_on_timeout: false,
            return_code_only: false,
        })
    }

    #[test]
    fn plan_without_placeholders_skips_expansion() {
        let plan = ExecPlan::new(make_ctx(), vec!["-nonative".to_string()]);
        assert!(!plan.has_expansion);
        assert_eq!(plan.expanded_flags(3), vec!["-nonative"]);
    }

    #[test]
    fn plan_with_placeholder_expands_id() {
        let plan = ExecPlan::new(
            make_ctx(),
            vec!["-cache:p.${id}".to_string(), "-other".to_string()],
        );
        assert!(plan.has_expansion);
        assert_eq!(plan.expanded_flags(42), vec!["-cache:p.42", "-other"]);
    }

    #[tokio::test]
    async fn cancelled_pool_dispatches_nothing() {
        let pools = WorkerPools::new(2);
        pools.cancel();
        let plan = Arc::new(ExecPlan::new(make_ctx(), Vec::new()));
        let (tx, mut rx) = outcome_channel();

        let test = Test {
            id: 1,
            folder: PathBuf::from("."),
            files: "missing.js".to_string(),
            tags: None,
            compile_flags: None,
            timeout: None,
            baseline: None,
            custom_config_file: None,
            started: None,
            elapsed: None,
        };
        let handles = dispatch(&pools, plan, vec![test], PoolKind::Parallel, tx);
        drop(pools);
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(rx.recv().await.is_none());
    }
}
