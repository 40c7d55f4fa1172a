//! Test model and definition loading.
//!
//! Tests are described declaratively in two levels of XML documents: a
//! folder registry (`rlexedirs.xml`) at the test root acting as an
//! allow-list of folders with optional folder-wide tags, and a per-folder
//! manifest (`rlexe.xml`) listing individual test entries. The loader
//! materializes these into [`Test`] and [`TestFolder`] records.
//!
//! A missing registry aborts the run; a missing manifest simply means that
//! folder contributes zero tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RunContext;
use crate::selection::{split_tags, TagSet};

/// File name of the folder registry at the test root.
pub const REGISTRY_FILE: &str = "rlexedirs.xml";

/// File name of the per-folder test manifest.
pub const MANIFEST_FILE: &str = "rlexe.xml";

/// Extension a file must carry to be runnable as an ad-hoc test.
const TEST_FILE_EXT: &str = "js";

/// Errors raised while loading test definitions.
///
/// Only registry problems are fatal to the run; see the module docs for the
/// recoverable cases.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read folder registry {}: {source}", .path.display())]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse folder registry {}: {source}", .path.display())]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },

    #[error("failed to parse test manifest {}: {source}", .path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },
}

/// One test case.
///
/// Declared fields are populated verbatim from the manifest entry; only the
/// fields present in the entry apply. The run-state fields are written by
/// the worker that executes the test and read exactly once when its outcome
/// message is built.
#[derive(Debug, Clone)]
pub struct Test {
    /// Monotonically increasing id, unique within a run. Used only to
    /// expand `${id}` placeholders in variant flags.
    pub id: u32,
    /// Folder the test lives in.
    pub folder: PathBuf,
    /// Declared file name, relative to the folder.
    pub files: String,
    /// Raw comma-separated tag list, if any.
    pub tags: Option<String>,
    /// Extra command-line flags for the system under test.
    pub compile_flags: Option<String>,
    /// Per-test timeout override in seconds.
    pub timeout: Option<u64>,
    /// Expected-output file name. `Some("")` means the outcome is judged by
    /// exit code alone (ad-hoc tests).
    pub baseline: Option<String>,
    /// Configuration file that replaces all other flags when present.
    pub custom_config_file: Option<String>,
    /// Wall-clock start of this test's execution.
    pub started: Option<Instant>,
    /// Elapsed duration, set exactly once.
    pub elapsed: Option<Duration>,
}

impl Test {
    /// Mark the start of this test run.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Mark the end of this test run. A second call keeps the duration
    /// computed by the first.
    pub fn done(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.map(|s| s.elapsed()).unwrap_or_default());
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.unwrap_or_default().as_secs_f64()
    }

    /// The test's tags as a lower-cased set.
    pub fn tag_set(&self) -> TagSet {
        self.tags.as_deref().map(split_tags).unwrap_or_default()
    }

    fn new(folder: &Path, files: String) -> Self {
        Test {
            id: 0,
            folder: folder.to_path_buf(),
            files,
            tags: None,
            compile_flags: None,
            timeout: None,
            baseline: None,
            custom_config_file: None,
            started: None,
            elapsed: None,
        }
    }
}

/// A directory-scoped group of tests plus the tags describing the whole
/// folder.
#[derive(Debug, Clone)]
pub struct TestFolder {
    pub path: PathBuf,
    pub tests: Vec<Test>,
    pub tags: TagSet,
    /// Tests in this folder share on-disk state and must not run
    /// concurrently with each other.
    pub is_sequential: bool,
}

impl TestFolder {
    pub fn new(path: PathBuf, tests: Vec<Test>, tags: TagSet) -> Self {
        let is_sequential = tags.contains("sequential");
        TestFolder {
            path,
            tests,
            tags,
            is_sequential,
        }
    }
}

/// Loads all tests for a run.
pub struct TestLoader {
    folders: Vec<TestFolder>,
}

impl TestLoader {
    /// Load test definitions for the given root paths.
    ///
    /// A path may name a folder or a single test file inside one. Folders
    /// absent from the registry are silently excluded; this is an
    /// allow-list, not a filter.
    pub fn load(ctx: &RunContext, paths: &[PathBuf]) -> Result<Self, LoadError> {
        let registry = load_registry(&ctx.test_root.join(REGISTRY_FILE))?;
        let arch_alias = ctx.arch.alias();

        let mut next_id = 0u32;
        let mut folders = Vec::new();
        for path in paths {
            let (folder, file) = if path.is_file() {
                let folder = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                let file = path.file_name().map(|f| f.to_string_lossy().into_owned());
                (folder, file)
            } else {
                (path.clone(), None)
            };

            let Some(key) = folder_key(&folder) else {
                warn!("skipping unresolvable folder path {}", folder.display());
                continue;
            };
            let Some(folder_tags) = registry.get(&key) else {
                debug!("folder {} not registered, skipping", folder.display());
                continue;
            };

            let tests = load_folder_tests(&folder, file.as_deref(), arch_alias, &mut next_id)?;
            debug!("loaded {} tests from {}", tests.len(), folder.display());
            folders.push(TestFolder::new(folder, tests, folder_tags.clone()));
        }

        Ok(TestLoader { folders })
    }

    pub fn folders(&self) -> &[TestFolder] {
        &self.folders
    }
}

fn folder_key(folder: &Path) -> Option<String> {
    folder
        .components()
        .next_back()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
}

fn is_test_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == TEST_FILE_EXT)
}

// --- registry ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegistryDoc {
    #[serde(rename = "dir", default)]
    dirs: Vec<RegistryDir>,
}

#[derive(Debug, Deserialize)]
struct RegistryDir {
    default: RegistryDefault,
}

#[derive(Debug, Deserialize)]
struct RegistryDefault {
    files: String,
    tags: Option<String>,
}

fn load_registry(path: &Path) -> Result<HashMap<String, TagSet>, LoadError> {
    let xml = std::fs::read_to_string(path).map_err(|source| LoadError::RegistryRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_registry(&xml).map_err(|source| LoadError::RegistryParse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_registry(xml: &str) -> Result<HashMap<String, TagSet>, quick_xml::DeError> {
    let doc: RegistryDoc = quick_xml::de::from_str(xml)?;
    Ok(doc
        .dirs
        .into_iter()
        .map(|dir| {
            let tags = dir.default.tags.as_deref().map(split_tags).unwrap_or_default();
            // folder names are matched lower-cased to avoid case mismatch
            (dir.default.files.to_lowercase(), tags)
        })
        .collect())
}

// --- per-folder manifest ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(rename = "test", default)]
    tests: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    default: ManifestFields,
    condition: Option<ManifestCondition>,
}

/// Fields of a `<default>` or `<override>` block; only present fields apply.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ManifestFields {
    files: Option<String>,
    /// Repeated `<tags>` elements merge rather than overwrite.
    #[serde(default)]
    tags: Vec<String>,
    compile_flags: Option<String>,
    timeout: Option<u64>,
    baseline: Option<String>,
    custom_config_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestCondition {
    target: Option<String>,
    #[serde(rename = "override")]
    overrides: ManifestFields,
}

impl ManifestEntry {
    /// Produce a [`Test`] for this entry, applying the conditional override
    /// when its declared target matches the run's architecture alias.
    fn materialize(self, folder: &Path, arch_alias: Option<&str>) -> Option<Test> {
        let mut fields = self.default;
        if let Some(condition) = self.condition {
            let matches = match (condition.target.as_deref(), arch_alias) {
                (Some(target), Some(alias)) => target == alias,
                _ => false,
            };
            if matches {
                fields.apply_override(condition.overrides);
            }
        }

        let files = match fields.files {
            Some(files) => files,
            None => {
                warn!("manifest entry in {} has no <files>, skipping", folder.display());
                return None;
            }
        };

        let mut test = Test::new(folder, files);
        if !fields.tags.is_empty() {
            test.tags = Some(fields.tags.join(","));
        }
        test.compile_flags = fields.compile_flags;
        test.timeout = fields.timeout;
        test.baseline = fields.baseline;
        test.custom_config_file = fields.custom_config_file;
        Some(test)
    }
}

impl ManifestFields {
    fn apply_override(&mut self, other: ManifestFields) {
        if other.files.is_some() {
            self.files = other.files;
        }
        if !other.tags.is_empty() {
            self.tags = other.tags;
        }
        if other.compile_flags.is_some() {
            self.compile_flags = other.compile_flags;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.baseline.is_some() {
            self.baseline = other.baseline;
        }
        if other.custom_config_file.is_some() {
            self.custom_config_file = other.custom_config_file;
        }
    }
}

fn parse_manifest(xml: &str) -> Result<Vec<ManifestEntry>, quick_xml::DeError> {
    let doc: ManifestDoc = quick_xml::de::from_str(xml)?;
    Ok(doc.tests)
}

/// Load the tests declared in one folder's manifest.
///
/// When `file` is given, only the entry matching that file name is kept; if
/// none matches and the file carries the test extension, a single ad-hoc
/// test with an empty baseline is synthesized for it.
fn load_folder_tests(
    folder: &Path,
    file: Option<&str>,
    arch_alias: Option<&str>,
    next_id: &mut u32,
) -> Result<Vec<Test>, LoadError> {
    let manifest_path = folder.join(MANIFEST_FILE);
    let xml = match std::fs::read_to_string(&manifest_path) {
        Ok(xml) => xml,
        Err(err) => {
            debug!("no manifest at {} ({err}), folder contributes no tests", manifest_path.display());
            return Ok(Vec::new());
        }
    };

    let entries = parse_manifest(&xml).map_err(|source| LoadError::ManifestParse {
        path: manifest_path,
        source,
    })?;

    let mut tests: Vec<Test> = entries
        .into_iter()
        .filter_map(|entry| entry.materialize(folder, arch_alias))
        .collect();

    if let Some(file) = file {
        tests.retain(|t| t.files == file);
        if tests.is_empty() && is_test_file(file) {
            let mut test = Test::new(folder, file.to_string());
            test.baseline = Some(String::new());
            tests.push(test);
        }
    }

    for test in &mut tests {
        *next_id += 1;
        test.id = *next_id;
    }

    Ok(tests)
}
