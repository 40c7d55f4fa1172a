//! Test variants and the per-variant run lifecycle.
//!
//! A variant is a named execution mode applying a fixed flag set and tag
//! filter to the same underlying test corpus. Each variant selects its
//! eligible tests, dispatches them onto the shared worker pools, consumes
//! the outcome stream, and prints its summary; the driver folds per-variant
//! failure into the overall run outcome.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::RunContext;
use crate::executor::{self, ExecPlan, PoolKind, WorkerPools};
use crate::loader::{Test, TestLoader};
use crate::report::{Aggregator, TestResult};
use crate::selection::{self, lower_set, TagSet};

/// Flags every variant prepends before its own.
const BASE_FLAGS: [&str; 2] = ["-ExtendedErrorStackForTestHost", "-BaselineMode"];

/// A named execution mode with its flag set, tag filters, and accumulated
/// counters.
pub struct TestVariant {
    pub name: String,
    /// Base flags applied to every test run under this variant; may contain
    /// `${id}` placeholders expanded per test.
    pub compile_flags: Vec<String>,
    /// Tests must carry all of these tags.
    pub tags: TagSet,
    /// Tests carrying any of these tags are skipped.
    pub not_tags: TagSet,
    /// Counters scoped to this variant, filled by [`run`](Self::run).
    pub result: TestResult,
}

impl TestVariant {
    /// Build a variant on top of the run-wide filters and extra flags.
    ///
    /// Besides the run's negative tags, a variant always excludes tests
    /// tagged `fails_<name>` or `exclude_<name>`.
    pub fn new(
        name: &str,
        ctx: &RunContext,
        variant_flags: &[&str],
        variant_not_tags: &[&str],
    ) -> Self {
        let mut compile_flags: Vec<String> = BASE_FLAGS.iter().map(|f| f.to_string()).collect();
        compile_flags.extend(ctx.extra_flags.iter().cloned());
        compile_flags.extend(variant_flags.iter().map(|f| f.to_string()));

        let mut not_tags = ctx.not_tags.clone();
        not_tags.extend(lower_set(variant_not_tags));
        not_tags.insert(format!("fails_{name}"));
        not_tags.insert(format!("exclude_{name}"));

        debug!(
            "added variant {name}: flags [{}], tags [{}], not-tags [{}]",
            compile_flags.join(", "),
            ctx.tags.iter().cloned().collect::<Vec<_>>().join(", "),
            not_tags.iter().cloned().collect::<Vec<_>>().join(", ")
        );

        TestVariant {
            name: name.to_string(),
            compile_flags,
            tags: ctx.tags.clone(),
            not_tags,
            result: TestResult::default(),
        }
    }

    /// The built-in execution modes, in their default order, restricted to
    /// the requested names.
    pub fn builtin(ctx: &RunContext, requested: &[String]) -> Vec<TestVariant> {
        let definitions: [(&str, &[&str], &[&str]); 3] = [
            (
                "interpreted",
                &[
                    "-maxInterpretCount:1",
                    "-maxSimpleJitRunCount:1",
                    "-bgjit-",
                    "-dynamicprofilecache:profile.dpl.${id}",
                ],
                &["require_disable_jit"],
            ),
            (
                "dynapogo",
                &[
                    "-forceNative",
                    "-off:simpleJit",
                    "-bgJitDelay:0",
                    "-dynamicprofileinput:profile.dpl.${id}",
                ],
                &["require_disable_jit"],
            ),
            (
                "disable_jit",
                &["-nonative"],
                &["exclude_interpreted", "fails_interpreted", "require_backend"],
            ),
        ];

        definitions
            .iter()
            .filter(|(name, _, _)| requested.iter().any(|r| r == name))
            .map(|(name, flags, not_tags)| TestVariant::new(name, ctx, flags, not_tags))
            .collect()
    }

    /// Whether this variant accumulated at least one failure.
    pub fn failed(&self) -> bool {
        self.result.fail_count() > 0
    }

    /// Select, dispatch, aggregate, and summarize this variant's tests.
    ///
    /// Folders are routed whole: an excluded folder contributes nothing,
    /// and a `sequential` folder's tests go to the single-permit pool.
    /// Fresh `Test` instances are materialized here, so per-test flag
    /// expansions never leak into another variant.
    pub async fn run(&mut self, ctx: &Arc<RunContext>, loader: &TestLoader, pools: &WorkerPools) {
        println!("\n############# Starting {} tests #############", self.name);
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            println!("  tags: {}", tags.join(", "));
        }
        for tag in &self.not_tags {
            println!("  exclude: {tag}");
        }

        let start = Instant::now();

        let mut parallel: Vec<Test> = Vec::new();
        let mut sequential: Vec<Test> = Vec::new();
        for folder in loader.folders() {
            if !selection::folder_eligible(folder, &self.not_tags) {
                debug!("folder {} excluded for {}", folder.path.display(), self.name);
                continue;
            }
            let dest = if folder.is_sequential {
                &mut sequential
            } else {
                &mut parallel
            };
            dest.extend(
                folder
                    .tests
                    .iter()
                    .filter(|t| {
                        selection::test_eligible(
                            t,
                            &self.tags,
                            &self.not_tags,
                            ctx.not_compile_flags.as_ref(),
                        )
                    })
                    .cloned(),
            );
        }

        let expected = parallel.len() + sequential.len();
        debug!(
            "{}: {} parallel tests, {} sequential tests",
            self.name,
            parallel.len(),
            sequential.len()
        );

        let plan = Arc::new(ExecPlan::new(ctx.clone(), self.compile_flags.clone()));
        let (outcomes, mut inbox) = executor::outcome_channel();
        let mut handles = executor::dispatch(
            pools,
            plan.clone(),
            parallel,
            PoolKind::Parallel,
            outcomes.clone(),
        );
        handles.extend(executor::dispatch(
            pools,
            plan,
            sequential,
            PoolKind::Sequential,
            outcomes,
        ));

        let mut aggregator = Aggregator::new(expected, ctx.show_passes);
        while !aggregator.is_complete() {
            match inbox.recv().await {
                Some(message) => aggregator.consume(&message),
                // all workers gone; nothing further will arrive
                None => break,
            }
        }
        futures::future::join_all(handles).await;

        aggregator.print_summary(&self.name, start.elapsed());
        self.result = aggregator.into_result();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildFlavor, TargetArch};
    use std::path::PathBuf;
    use std::time::Duration;

    fn make_ctx() -> RunContext {
        RunContext {
            binary: PathBuf::from("/bin/true"),
            test_root: PathBuf::from("."),
            flavor: BuildFlavor::Test,
            arch: TargetArch::X64,
            default_timeout: Duration::from_secs(60),
            extra_flags: vec!["-WERExceptionSupport".to_string()],
            flags: Vec::new(),
            tags: TagSet::new(),
            not_tags: lower_set(["fail"]),
            not_compile_flags: None,
            workers: 2,
            verbose: false,
            show_passes: false,
            warn_on_timeout: false,
            return_code_only: false,
        }
    }

    #[test]
    fn variant_prepends_base_and_extra_flags() {
        let ctx = make_ctx();
        let variant = TestVariant::new("disable_jit", &ctx, &["-nonative"], &[]);
        assert_eq!(
            variant.compile_flags,
            vec![
                "-ExtendedErrorStackForTestHost",
                "-BaselineMode",
                "-WERExceptionSupport",
                "-nonative"
            ]
        );
    }

    #[test]
    fn variant_excludes_its_own_fail_tags() {
        let ctx = make_ctx();
        let variant = TestVariant::new("interpreted", &ctx, &[], &["require_disable_jit"]);
        assert!(variant.not_tags.contains("fails_interpreted"));
        assert!(variant.not_tags.contains("exclude_interpreted"));
        assert!(variant.not_tags.contains("require_disable_jit"));
        // run-wide exclusions carry over
        assert!(variant.not_tags.contains("fail"));
    }

    #[test]
    fn builtin_respects_requested_subset_and_order() {
        let ctx = make_ctx();
        let variants = TestVariant::builtin(
            &ctx,
            &["dynapogo".to_string(), "interpreted".to_string()],
        );
        let names: Vec<&str> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["interpreted", "dynapogo"]);
    }

    #[test]
    fn builtin_ignores_unknown_names() {
        let ctx = make_ctx();
        let variants = TestVariant::builtin(&ctx, &["warp_drive".to_string()]);
        assert!(variants.is_empty());
    }
}
