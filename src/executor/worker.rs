//! Per-test subprocess execution.
//!
//! One worker invocation owns one test: it resolves the on-disk file,
//! assembles the final flag list, launches the system-under-test binary
//! with the test's folder as working directory, races the child against
//! the test's deadline, classifies the outcome, and builds the single
//! outcome message. Errors and panics are contained here; a broken test
//! must never take the scheduler down or leave its outcome unreported.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::classify::{
    classify, normalize_newlines, BaselineExpectation, ClassifyOptions, FailKind, LineDiff,
    Verdict,
};
use super::{ExecPlan, OutcomeMessage};
use crate::loader::Test;

const OUTPUT_DELIM: &str = "----------------------------";

/// How long to keep draining output pipes after a timed-out child was
/// killed. Orphaned grandchildren may hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Run one test to completion and produce its outcome message.
///
/// This is the per-test error boundary: execution errors and panics become
/// failure outcomes carrying the error text, and exactly one message is
/// returned either way.
pub(crate) async fn run_one(plan: &ExecPlan, mut test: Test) -> OutcomeMessage {
    test.start();
    let fallback_path = test.folder.join(&test.files);
    let mut diag = Vec::new();

    let outcome = std::panic::AssertUnwindSafe(execute(plan, &mut test, &mut diag))
        .catch_unwind()
        .await;

    let (file, failed) = match outcome {
        Ok(Ok((file, failed))) => (file, failed),
        Ok(Err(err)) => {
            test.done();
            diag.push(format!("{err:?}"));
            (fallback_path, true)
        }
        Err(panic) => {
            test.done();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            diag.push(format!("internal harness error: {msg}"));
            (fallback_path, true)
        }
    };

    let output = if failed || plan.ctx.show_passes {
        diag.iter().map(|line| format!("{line}\n")).collect()
    } else {
        String::new()
    };

    OutcomeMessage {
        file,
        failed,
        elapsed: test.elapsed.unwrap_or_default(),
        output,
    }
}

/// Steps 1–6 of a single test run. Returns the resolved file path and
/// whether the test failed.
async fn execute(plan: &ExecPlan, test: &mut Test, diag: &mut Vec<String>) -> Result<(PathBuf, bool)> {
    let ctx = &plan.ctx;
    let file = resolve_file(&test.folder, &test.files, diag);
    let working_dir = file.parent().unwrap_or(&test.folder).to_path_buf();

    let flags = final_flags(plan, test);
    let basename = file
        .file_name()
        .ok_or_else(|| anyhow!("test file name is empty: {}", file.display()))?
        .to_owned();

    let mut command = tokio::process::Command::new(&ctx.binary);
    command
        .args(&flags)
        .arg(&basename)
        .current_dir(&working_dir)
        // several suites depend on Pacific time; scoped to the child
        .env("TZ", "US/Pacific")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        "running {} {} {}",
        ctx.binary.display(),
        flags.join(" "),
        basename.to_string_lossy()
    );

    let timeout = ctx.timeout_for(test.timeout);
    test.start();
    let observed = supervise(command, timeout)
        .await
        .with_context(|| format!("failed to run {}", file.display()))?;
    test.done();

    let output = normalize_newlines(&observed.output);

    let baseline_content;
    let expectation = match test.baseline.as_deref() {
        None => BaselineExpectation::PassLines,
        Some("") => BaselineExpectation::ExitCodeOnly,
        Some(name) => {
            let baseline_path = resolve_file(&test.folder, name, diag);
            let raw = std::fs::read(&baseline_path)
                .with_context(|| format!("failed to read baseline {}", baseline_path.display()))?;
            baseline_content = normalize_newlines(&raw).into_owned();
            BaselineExpectation::Content(&baseline_content)
        }
    };

    let opts = ClassifyOptions {
        warn_on_timeout: ctx.warn_on_timeout,
        return_code_only: ctx.return_code_only,
    };
    let verdict = classify(observed.timed_out, observed.exit_code, &output, expectation, opts);

    match &verdict {
        Verdict::Pass => {
            if ctx.verbose {
                diag.push(command_echo(ctx.binary.as_path(), &flags, &file));
            }
            Ok((file, false))
        }
        Verdict::PassWithWarning => {
            diag.push("WARNING: Test timed out!".to_string());
            render_failure(diag, ctx.binary.as_path(), &flags, &file, &observed, &output, None, opts);
            Ok((file, false))
        }
        Verdict::Fail(kind) => {
            if matches!(*kind, FailKind::TimedOut) {
                diag.push("ERROR: Test timed out!".to_string());
            }
            let line_diff = match kind {
                FailKind::BaselineMismatch(diff) => diff.as_ref(),
                _ => None,
            };
            render_failure(diag, ctx.binary.as_path(), &flags, &file, &observed, &output, line_diff, opts);
            Ok((file, true))
        }
    }
}

/// Final flag list for one test: variant flags with `${id}` expanded, then
/// run-wide operator flags, then the test's own flags. A declared
/// configuration-override file replaces everything.
fn final_flags(plan: &ExecPlan, test: &Test) -> Vec<String> {
    if let Some(config_file) = &test.custom_config_file {
        return vec![format!("-CustomConfigFile:{config_file}")];
    }
    let mut flags = plan.expanded_flags(test.id);
    flags.extend(plan.ctx.flags.iter().cloned());
    if let Some(own) = &test.compile_flags {
        flags.extend(own.split_whitespace().map(str::to_string));
    }
    flags
}

/// Resolve a declared file name inside a folder, falling back to a
/// case-insensitive match. A name that still cannot be found is returned
/// as-is and left to fail at launch time.
fn resolve_file(folder: &Path, name: &str, diag: &mut Vec<String>) -> PathBuf {
    let path = folder.join(name);
    if path.is_file() {
        return path;
    }

    let name_lower = name.to_lowercase();
    if let Ok(entries) = std::fs::read_dir(folder) {
        for entry in entries.flatten() {
            let actual = entry.file_name().to_string_lossy().into_owned();
            if actual.to_lowercase() == name_lower {
                diag.push(format!(
                    "\nWARNING: {} should be {}\n",
                    path.display(),
                    actual
                ));
                return folder.join(actual);
            }
        }
    }

    path
}

/// What supervising the child yielded.
struct Observed {
    timed_out: bool,
    exit_code: i32,
    /// Combined stdout followed by stderr.
    output: Vec<u8>,
}

/// Spawn the child and race its exit against the deadline. On deadline win
/// the child is killed and the outcome marked timed out; output read so far
/// is preserved either way.
async fn supervise(mut command: tokio::process::Command, limit: Duration) -> Result<Observed> {
    let mut child = command.spawn().context("failed to launch system-under-test binary")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr not captured"))?;
    let mut stdout_task = tokio::spawn(read_to_end(stdout));
    let mut stderr_task = tokio::spawn(read_to_end(stderr));

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);

    let (timed_out, status) = tokio::select! {
        status = child.wait() => (false, status.context("failed to wait for child")?),
        _ = &mut deadline => {
            child.start_kill().ok();
            let status = child.wait().await.context("failed to reap killed child")?;
            (true, status)
        }
    };

    let mut output = Vec::new();
    if timed_out {
        // a killed child's orphans may keep the pipes open; salvage what
        // arrived within a short grace period instead of waiting on the
        // whole process tree
        let drain = async { ((&mut stdout_task).await, (&mut stderr_task).await) };
        match tokio::time::timeout(READER_GRACE, drain).await {
            Ok((out, err)) => {
                output = out.context("stdout reader failed")??;
                let err = err.context("stderr reader failed")??;
                output.extend_from_slice(&err);
            }
            Err(_) => {
                stdout_task.abort();
                stderr_task.abort();
            }
        }
    } else {
        output = stdout_task.await.context("stdout reader failed")??;
        let err = stderr_task.await.context("stderr reader failed")??;
        output.extend_from_slice(&err);
    }

    Ok(Observed {
        timed_out,
        exit_code: status.code().unwrap_or(-1),
        output,
    })
}

async fn read_to_end(mut reader: impl tokio::io::AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

fn command_echo(binary: &Path, flags: &[String], file: &Path) -> String {
    format!("{} {} {}", binary.display(), flags.join(" "), file.display())
}

/// Buffer the failure details: the command line, the offending output (or
/// the first differing line against the baseline), and the exit code.
#[allow(clippy::too_many_arguments)]
fn render_failure(
    diag: &mut Vec<String>,
    binary: &Path,
    flags: &[String],
    file: &Path,
    observed: &Observed,
    output: &[u8],
    line_diff: Option<&LineDiff>,
    opts: ClassifyOptions,
) {
    diag.push(command_echo(binary, flags, file));

    if !opts.return_code_only {
        match line_diff {
            Some(diff) => {
                diag.push(format!("Output: (at line {})", diff.line));
                diag.push(OUTPUT_DELIM.to_string());
                diag.push(diff.actual.clone());
                diag.push(OUTPUT_DELIM.to_string());
                diag.push("Expected Output:".to_string());
                diag.push(OUTPUT_DELIM.to_string());
                diag.push(diff.expected.clone());
                diag.push(OUTPUT_DELIM.to_string());
            }
            None => {
                diag.push("\nOutput:".to_string());
                diag.push(OUTPUT_DELIM.to_string());
                diag.push(String::from_utf8_lossy(output).into_owned());
                diag.push(OUTPUT_DELIM.to_string());
            }
        }
    }

    diag.push(format!("exit code: {}", observed.exit_code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildFlavor, RunContext, TargetArch};
    use crate::selection::TagSet;
    use std::sync::Arc;

    fn make_ctx() -> Arc<RunContext> {
        Arc::new(RunContext {
            binary: PathBuf::from("/bin/true"),
            test_root: PathBuf::from("."),
            flavor: BuildFlavor::Test,
            arch: TargetArch::X64,
            default_timeout: Duration::from_secs(60),
            extra_flags: Vec::new(),
            flags: vec!["-globalFlag".to_string()],
            tags: TagSet::new(),
            not_tags: TagSet::new(),
            not_compile_flags: None,
            workers: 1,
            verbose: false,
            show_passes: false,
            warn_on_timeout: false,
            return_code_only: false,
        })
    }

    fn make_test(id: u32) -> Test {
        Test {
            id,
            folder: PathBuf::from("Array"),
            files: "basic.js".to_string(),
            tags: None,
            compile_flags: Some("-own:flag".to_string()),
            timeout: None,
            baseline: None,
            custom_config_file: None,
            started: None,
            elapsed: None,
        }
    }

    #[test]
    fn flag_order_is_variant_then_run_then_test() {
        let plan = ExecPlan::new(
            make_ctx(),
            vec!["-variantFlag".to_string()],
        );
        let flags = final_flags(&plan, &make_test(1));
        assert_eq!(flags, vec!["-variantFlag", "-globalFlag", "-own:flag"]);
    }

    #[test]
    fn id_placeholder_expands_per_test() {
        let plan = ExecPlan::new(
            make_ctx(),
            vec!["-dynamicprofilecache:profile.dpl.${id}".to_string()],
        );
        let flags = final_flags(&plan, &make_test(7));
        assert_eq!(flags[0], "-dynamicprofilecache:profile.dpl.7");
        let flags = final_flags(&plan, &make_test(12));
        assert_eq!(flags[0], "-dynamicprofilecache:profile.dpl.12");
    }

    #[test]
    fn custom_config_file_replaces_all_flags() {
        let plan = ExecPlan::new(make_ctx(), vec!["-variantFlag".to_string()]);
        let mut test = make_test(1);
        test.custom_config_file = Some("special.config".to_string());
        let flags = final_flags(&plan, &test);
        assert_eq!(flags, vec!["-CustomConfigFile:special.config"]);
    }

    #[test]
    fn failure_rendering_includes_exit_code() {
        let observed = Observed {
            timed_out: false,
            exit_code: 3,
            output: b"boom\n".to_vec(),
        };
        let mut diag = Vec::new();
        render_failure(
            &mut diag,
            Path::new("/bin/ch"),
            &["-flag".to_string()],
            Path::new("Array/basic.js"),
            &observed,
            b"boom\n",
            None,
            ClassifyOptions::default(),
        );
        assert!(diag[0].contains("/bin/ch -flag"));
        assert!(diag.iter().any(|l| l == "exit code: 3"));
        assert!(diag.iter().any(|l| l.contains("boom")));
    }

    #[test]
    fn return_code_only_omits_output_dump() {
        let observed = Observed {
            timed_out: false,
            exit_code: 1,
            output: b"boom\n".to_vec(),
        };
        let mut diag = Vec::new();
        let opts = ClassifyOptions {
            return_code_only: true,
            ..Default::default()
        };
        render_failure(
            &mut diag,
            Path::new("/bin/ch"),
            &[],
            Path::new("Array/basic.js"),
            &observed,
            b"boom\n",
            None,
            opts,
        );
        assert!(!diag.iter().any(|l| l.contains("boom")));
        assert!(diag.iter().any(|l| l == "exit code: 1"));
    }
}
