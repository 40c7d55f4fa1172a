//! Run configuration.
//!
//! Everything the harness needs to know about one invocation lives in a
//! single immutable [`RunContext`] that is threaded through the loader, the
//! selection engine, and the executor. Nothing in the run consults ambient
//! global state.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::selection::TagSet;

/// Default per-test timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Timeout used when slow tests are included and no explicit timeout is set.
pub const SLOW_TIMEOUT_SECS: u64 = 180;

/// Build flavor of the system-under-test binary.
///
/// The flavor selects the default binary location and contributes an
/// `exclude_<flavor>` tag to the run's negative filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildFlavor {
    Debug,
    Test,
}

impl BuildFlavor {
    /// Directory name used in build output paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildFlavor::Debug => "Debug",
            BuildFlavor::Test => "Test",
        }
    }

    /// Lower-cased form used in tag comparisons.
    pub fn tag(&self) -> &'static str {
        match self {
            BuildFlavor::Debug => "debug",
            BuildFlavor::Test => "test",
        }
    }
}

/// Target architecture the system-under-test binary was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86,
    X64,
    Arm,
    Arm64,
}

impl TargetArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::X86 => "x86",
            TargetArch::X64 => "x64",
            TargetArch::Arm => "arm",
            TargetArch::Arm64 => "arm64",
        }
    }

    /// Alternate name some manifests use in `<condition><target>` blocks.
    pub fn alias(&self) -> Option<&'static str> {
        match self {
            TargetArch::X64 => Some("amd64"),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86" => Some(TargetArch::X86),
            "x64" => Some(TargetArch::X64),
            "arm" => Some(TargetArch::Arm),
            "arm64" => Some(TargetArch::Arm64),
            _ => None,
        }
    }

    /// Resolve the architecture from an explicit selection, the
    /// `_BuildArch` environment variable, or the platform default.
    ///
    /// Non-Windows builds only ship x64 binaries, so the resolution is
    /// pinned there regardless of the environment.
    pub fn resolve(explicit: Option<TargetArch>) -> TargetArch {
        if !cfg!(windows) {
            return TargetArch::X64;
        }
        explicit
            .or_else(|| env::var("_BuildArch").ok().and_then(|v| Self::from_name(&v)))
            .unwrap_or(TargetArch::X86)
    }
}

/// Immutable configuration for one harness invocation.
///
/// Built once in `main` from the CLI surface and the platform, then shared
/// read-only by every component of the run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Full path of the system-under-test binary.
    pub binary: PathBuf,
    /// Directory containing the folder registry and the test folders.
    pub test_root: PathBuf,
    pub flavor: BuildFlavor,
    pub arch: TargetArch,
    /// Per-test timeout applied when a test declares no override.
    pub default_timeout: Duration,
    /// Flags prepended to every variant's flag set.
    pub extra_flags: Vec<String>,
    /// Operator-supplied flags applied between variant flags and per-test
    /// flags.
    pub flags: Vec<String>,
    /// Positive tag filter: tests must carry all of these.
    pub tags: TagSet,
    /// Negative tag filter: tests carrying any of these are skipped.
    pub not_tags: TagSet,
    /// Compile-flag tokens that disqualify a test when present in its
    /// declared flags.
    pub not_compile_flags: Option<TagSet>,
    /// Size of the parallel worker pool.
    pub workers: usize,
    pub verbose: bool,
    /// Newline-terminate passing progress lines and flush their buffered
    /// diagnostics.
    pub show_passes: bool,
    /// Record timed-out tests as passes with a warning annotation.
    pub warn_on_timeout: bool,
    /// Classify by timeout and exit code only, skipping output checks.
    pub return_code_only: bool,
}

impl RunContext {
    /// Default binary location for a given repository root, architecture,
    /// and flavor.
    pub fn default_binary_path(repo_root: &Path, arch: TargetArch, flavor: BuildFlavor) -> PathBuf {
        if cfg!(windows) {
            repo_root
                .join("Build")
                .join("VcBuild")
                .join("bin")
                .join(format!("{}_{}", arch.as_str(), flavor.as_str()))
                .join("ch.exe")
        } else {
            repo_root.join("out").join(flavor.as_str()).join("ch")
        }
    }

    pub fn timeout_for(&self, declared: Option<u64>) -> Duration {
        declared.map(Duration::from_secs).unwrap_or(self.default_timeout)
    }
}

/// Negative tags implied by the platform, architecture, flavor, and
/// sanitizer selection.
///
/// Always excluded: tests tagged `fail`, plus `exclude_<arch>`,
/// `exclude_<arch-alias>`, and `exclude_<flavor>`. The platform adds its own
/// exclusions, and `--sanitize <name>` excludes tests known to break under
/// that sanitizer.
pub fn derived_not_tags(
    arch: TargetArch,
    flavor: BuildFlavor,
    sanitize: Option<&str>,
) -> TagSet {
    let mut not_tags = TagSet::new();
    not_tags.insert("fail".to_string());
    not_tags.insert(format!("exclude_{}", arch.as_str()));
    not_tags.insert(format!("exclude_{}", flavor.tag()));
    if let Some(alias) = arch.alias() {
        not_tags.insert(format!("exclude_{alias}"));
    }

    if cfg!(windows) {
        not_tags.insert("exclude_windows".to_string());
    } else {
        not_tags.insert("exclude_xplat".to_string());
        not_tags.insert("require_winglob".to_string());
        not_tags.insert("require_simd".to_string());
    }
    if cfg!(target_os = "macos") {
        not_tags.insert("exclude_mac".to_string());
    }
    if matches!(arch, TargetArch::Arm | TargetArch::Arm64) {
        not_tags.insert("require_asmjs".to_string());
    }
    if let Some(name) = sanitize {
        not_tags.insert(format!("exclude_sanitize_{}", name.to_lowercase()));
    }

    // Suites needing ICU are unusable when ICU itself is excluded.
    if not_tags.contains("require_icu") || not_tags.contains("exclude_noicu") {
        not_tags.insert("intl".to_string());
    }

    not_tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_alias_only_for_x64() {
        assert_eq!(TargetArch::X64.alias(), Some("amd64"));
        assert_eq!(TargetArch::X86.alias(), None);
        assert_eq!(TargetArch::Arm64.alias(), None);
    }

    #[test]
    fn derived_tags_cover_arch_and_flavor() {
        let tags = derived_not_tags(TargetArch::X64, BuildFlavor::Test, None);
        assert!(tags.contains("fail"));
        assert!(tags.contains("exclude_x64"));
        assert!(tags.contains("exclude_amd64"));
        assert!(tags.contains("exclude_test"));
    }

    #[test]
    fn sanitize_adds_exclusion() {
        let tags = derived_not_tags(TargetArch::X64, BuildFlavor::Debug, Some("Address"));
        assert!(tags.contains("exclude_sanitize_address"));
    }

    #[test]
    fn arm_excludes_asmjs_suites() {
        let tags = derived_not_tags(TargetArch::Arm64, BuildFlavor::Debug, None);
        assert!(tags.contains("require_asmjs"));
    }
}
