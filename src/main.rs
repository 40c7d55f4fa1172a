//! rltest CLI - parallel, tag-driven regression test harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

use rltest::config::{
    derived_not_tags, BuildFlavor, RunContext, TargetArch, DEFAULT_TIMEOUT_SECS, SLOW_TIMEOUT_SECS,
};
use rltest::executor::WorkerPools;
use rltest::loader::TestLoader;
use rltest::selection::lower_set;
use rltest::variant::TestVariant;

#[derive(Parser)]
#[command(name = "rltest")]
#[command(about = "Parallel, tag-driven regression test harness", long_about = None)]
#[command(version)]
struct Cli {
    /// Folder subset, or single test files, to run (default: every folder
    /// under the test root)
    #[arg(value_name = "FOLDER")]
    folders: Vec<PathBuf>,

    /// Full path of the system-under-test binary
    #[arg(short, long)]
    binary: Option<PathBuf>,

    /// Increase verbosity of output (implies --show-passes)
    #[arg(short, long)]
    verbose: bool,

    /// Ignore tests known to be broken under this sanitizer
    #[arg(long, value_name = "SANITIZER")]
    sanitize: Option<String>,

    /// Use the debug build
    #[arg(short, long)]
    debug: bool,

    /// Use the test build
    #[arg(short = 't', long = "test-build")]
    test_build: bool,

    /// Run only the named test variants
    #[arg(long, num_args = 1.., value_name = "VARIANT")]
    variants: Option<Vec<String>>,

    /// Include slow tests (raises the default timeout to 180 seconds)
    #[arg(long)]
    include_slow: bool,

    /// Run only slow tests
    #[arg(long)]
    only_slow: bool,

    /// Select tests carrying all of the given tags
    #[arg(long, value_name = "TAG")]
    tag: Vec<String>,

    /// Exclude tests carrying any of the given tags
    #[arg(long = "not-tag", value_name = "TAG")]
    not_tag: Vec<String>,

    /// Compile-flag tokens that disqualify tests declaring them
    #[arg(long = "not-compile-flag", value_name = "FLAG")]
    not_compile_flag: Vec<String>,

    /// Global flags passed to every test invocation
    #[arg(long, default_value = "")]
    flags: String,

    /// Per-test timeout in seconds (default 60)
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Use the x86 build
    #[arg(long)]
    x86: bool,

    /// Use the x64 build
    #[arg(long)]
    x64: bool,

    /// Use the arm build
    #[arg(long)]
    arm: bool,

    /// Use the arm64 build
    #[arg(long)]
    arm64: bool,

    /// Number of parallel workers (default: logical CPU count)
    #[arg(short = 'j', long = "processcount", value_name = "N")]
    processcount: Option<usize>,

    /// Record timed-out tests as passes with a warning instead of failures
    #[arg(long)]
    warn_on_timeout: bool,

    /// Base directory holding the folder registry and test folders
    /// (default: current directory)
    #[arg(long, value_name = "DIR")]
    override_test_root: Option<PathBuf>,

    /// Extra flags added to every executed test
    #[arg(long, value_name = "FLAGS")]
    extra_flags: Option<String>,

    /// Judge only by exit status, skipping output and baseline checks
    #[arg(long = "only-return-code", visible_alias = "orc")]
    only_return_code: bool,

    /// Display passed tests, not only failures and the summary
    #[arg(long)]
    show_passes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let ctx = Arc::new(build_context(&cli)?);

    // By default run every folder under the test root
    let mut folders = cli.folders.clone();
    if folders.is_empty() {
        folders = std::fs::read_dir(&ctx.test_root)
            .with_context(|| format!("failed to list test root {}", ctx.test_root.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        folders.sort();
    }

    let loader = match TestLoader::load(&ctx, &folders) {
        Ok(loader) => loader,
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    };

    let requested = cli
        .variants
        .clone()
        .unwrap_or_else(|| vec!["interpreted".to_string(), "dynapogo".to_string()]);
    let mut variants = TestVariant::builtin(&ctx, &requested);

    println!("############# Regression Test Suite #############");
    println!("Testing {} build", ctx.flavor.as_str());
    println!("Using {} threads", ctx.workers);

    let pools = WorkerPools::new(ctx.workers);
    let start = Instant::now();
    for variant in &mut variants {
        variant.run(&ctx, &loader, &pools).await;
    }
    let elapsed = start.elapsed();

    let failed = variants.iter().any(TestVariant::failed);
    let verdict = if failed {
        style("Failed!").red()
    } else {
        style("Success!").green()
    };
    println!("[{:.2} seconds] {}", elapsed.as_secs_f64(), verdict);

    clean_profile_caches(&ctx.test_root);

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve the CLI surface and platform into the run configuration.
fn build_context(cli: &Cli) -> Result<RunContext> {
    let flavor = if cli.debug {
        BuildFlavor::Debug
    } else if cli.test_build {
        BuildFlavor::Test
    } else {
        println!("ERROR: Test build target wasn't defined.");
        println!("Try '-t' (test build) or '-d' (debug build).");
        std::process::exit(1);
    };

    let explicit_arch = if cli.x86 {
        Some(TargetArch::X86)
    } else if cli.x64 {
        Some(TargetArch::X64)
    } else if cli.arm {
        Some(TargetArch::Arm)
    } else if cli.arm64 {
        Some(TargetArch::Arm64)
    } else {
        None
    };
    let arch = TargetArch::resolve(explicit_arch);

    let test_root = match &cli.override_test_root {
        Some(root) => root
            .canonicalize()
            .with_context(|| format!("invalid test root {}", root.display()))?,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let repo_root = test_root
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| test_root.clone());

    let binary = cli
        .binary
        .clone()
        .unwrap_or_else(|| RunContext::default_binary_path(&repo_root, arch, flavor));
    if !binary.is_file() {
        println!("{} not found. Aborting.", binary.display());
        std::process::exit(1);
    }

    let mut tags = lower_set(&cli.tag);
    let mut not_tags = derived_not_tags(arch, flavor, cli.sanitize.as_deref());
    not_tags.extend(lower_set(&cli.not_tag));

    let mut timeout_secs = cli.timeout;
    if cli.only_slow {
        tags.insert("slow".to_string());
    } else if !cli.include_slow {
        not_tags.insert("slow".to_string());
    } else if timeout_secs.is_none() {
        timeout_secs = Some(SLOW_TIMEOUT_SECS);
    }

    let extra_flags = match &cli.extra_flags {
        Some(text) => shell_words::split(text).context("invalid --extra-flags")?,
        None => vec!["-WERExceptionSupport".to_string()],
    };
    let flags = shell_words::split(&cli.flags).context("invalid --flags")?;

    let not_compile_flags = if cli.not_compile_flag.is_empty() {
        None
    } else {
        Some(lower_set(&cli.not_compile_flag))
    };

    let workers = cli.processcount.unwrap_or_else(num_cpus::get);

    Ok(RunContext {
        binary,
        test_root,
        flavor,
        arch,
        default_timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        extra_flags,
        flags,
        tags,
        not_tags,
        not_compile_flags,
        workers: workers.max(1),
        verbose: cli.verbose,
        show_passes: cli.show_passes || cli.verbose,
        warn_on_timeout: cli.warn_on_timeout,
        return_code_only: cli.only_return_code,
    })
}

/// Remove `profile.dpl.*` files the `${id}` flag expansions leave behind in
/// test folders.
fn clean_profile_caches(test_root: &Path) {
    for entry in WalkDir::new(test_root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with("profile.dpl.")
        {
            if let Err(err) = std::fs::remove_file(entry.path()) {
                debug!("failed to remove {}: {err}", entry.path().display());
            }
        }
    }
}
