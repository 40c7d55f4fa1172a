//! Result aggregation and progress reporting.
//!
//! The aggregator is the single consumer of the outcome channel: it updates
//! per-folder and global counters and renders the live progress line. It
//! makes no assumption about message order; outcomes from different folders
//! and pools interleave freely.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use console::style;

use crate::executor::OutcomeMessage;

/// Pass/fail counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassFailCount {
    pub pass_count: u32,
    pub fail_count: u32,
}

impl PassFailCount {
    pub fn total_count(&self) -> u32 {
        self.pass_count + self.fail_count
    }

    fn log(&mut self, failed: bool) {
        if failed {
            self.fail_count += 1;
        } else {
            self.pass_count += 1;
        }
    }
}

impl fmt::Display for PassFailCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "passed {}, failed {}", self.pass_count, self.fail_count)
    }
}

/// Accumulated counters for one variant, keyed additionally by folder.
///
/// The per-folder counts always sum to the totals; both are bumped together
/// for every consumed outcome.
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub total: PassFailCount,
    pub folders: BTreeMap<String, PassFailCount>,
}

impl TestResult {
    /// Record one outcome under the file's folder.
    pub fn log(&mut self, file: &Path, failed: bool) {
        let folder = folder_name(file);
        self.folders.entry(folder).or_default().log(failed);
        self.total.log(failed);
    }

    pub fn total_count(&self) -> u32 {
        self.total.total_count()
    }

    pub fn fail_count(&self) -> u32 {
        self.total.fail_count
    }
}

fn folder_name(file: &Path) -> String {
    file.parent()
        .and_then(Path::file_name)
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Display path for a test: its folder name joined with its file name.
fn short_name(file: &Path) -> String {
    let base = file
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let folder = folder_name(file);
    if folder.is_empty() {
        base
    } else {
        format!("{folder}/{base}")
    }
}

/// Consumes outcome messages for one variant, updating counters and
/// rendering progress.
///
/// Failed lines are always newline-terminated; passing lines overwrite the
/// previous line in place unless show-passes mode is active. Diagnostics
/// buffered for a test are flushed right after its progress line.
pub struct Aggregator {
    result: TestResult,
    expected: usize,
    show_passes: bool,
    last_len: usize,
}

impl Aggregator {
    pub fn new(expected: usize, show_passes: bool) -> Self {
        Aggregator {
            result: TestResult::default(),
            expected,
            show_passes,
            last_len: 0,
        }
    }

    /// Whether every dispatched outcome has been consumed.
    pub fn is_complete(&self) -> bool {
        self.result.total_count() as usize >= self.expected
    }

    pub fn consume(&mut self, message: &OutcomeMessage) {
        self.result.log(&message.file, message.failed);
        self.render(message);
    }

    fn render(&mut self, message: &OutcomeMessage) {
        let verdict = if message.failed { "Failed" } else { "Passed" };
        let prefix = format!(
            "[{}/{} {:4.2}] ",
            self.result.total_count(),
            self.expected,
            message.elapsed.as_secs_f64()
        );
        let suffix = format!(" -> {}", short_name(&message.file));
        let visible_len = prefix.len() + verdict.len() + suffix.len();
        let padding = " ".repeat(self.last_len.saturating_sub(visible_len));

        let styled = if message.failed {
            style(verdict).red()
        } else {
            style(verdict).green()
        };

        if message.failed || self.show_passes {
            println!("{prefix}{styled}{suffix}{padding}");
            self.last_len = 0;
        } else {
            print!("{prefix}{styled}{suffix}{padding}\r");
            let _ = std::io::stdout().flush();
            self.last_len = visible_len;
        }

        if !message.output.is_empty() {
            println!("{}", message.output);
            self.last_len = 0;
        }
    }

    /// Print the per-folder and total summary for one variant.
    pub fn print_summary(&self, variant_name: &str, elapsed: Duration) {
        println!("\n############ Results for {variant_name} tests ###########");
        for (folder, counts) in &self.result.folders {
            println!("{folder}: {counts}");
        }
        println!("----------------------------");
        println!("Total: {}", self.result.total);
        println!(
            "Time taken for {} tests: {:.2} seconds\n",
            variant_name,
            elapsed.as_secs_f64()
        );
        let _ = std::io::stdout().flush();
    }

    /// Hand the accumulated counters back to the variant.
    pub fn into_result(self) -> TestResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn message(file: &str, failed: bool) -> OutcomeMessage {
        OutcomeMessage {
            file: PathBuf::from(file),
            failed,
            elapsed: Duration::from_millis(120),
            output: String::new(),
        }
    }

    #[test]
    fn folder_counters_sum_to_totals() {
        let mut result = TestResult::default();
        result.log(Path::new("Array/a.js"), false);
        result.log(Path::new("Array/b.js"), true);
        result.log(Path::new("Basics/hello.js"), false);
        result.log(Path::new("Strings/concat.js"), true);

        let folder_sum: u32 = result.folders.values().map(PassFailCount::total_count).sum();
        assert_eq!(folder_sum, result.total_count());
        assert_eq!(result.total.pass_count, 2);
        assert_eq!(result.total.fail_count, 2);
    }

    #[test]
    fn outcomes_keyed_by_parent_folder() {
        let mut result = TestResult::default();
        result.log(Path::new("test/Array/a.js"), false);
        assert!(result.folders.contains_key("Array"));
        assert_eq!(result.folders["Array"].pass_count, 1);
    }

    #[test]
    fn short_name_is_folder_slash_file() {
        assert_eq!(short_name(Path::new("test/Array/a.js")), "Array/a.js");
        assert_eq!(short_name(Path::new("a.js")), "a.js");
    }

    #[test]
    fn aggregator_completes_after_expected_count() {
        let mut agg = Aggregator::new(2, false);
        assert!(!agg.is_complete());
        agg.consume(&message("Array/a.js", false));
        assert!(!agg.is_complete());
        agg.consume(&message("Array/b.js", true));
        assert!(agg.is_complete());
    }

    #[test]
    fn aggregator_tolerates_interleaved_folders() {
        let mut agg = Aggregator::new(4, false);
        agg.consume(&message("Array/a.js", false));
        agg.consume(&message("Basics/h.js", true));
        agg.consume(&message("Array/b.js", false));
        agg.consume(&message("Basics/i.js", false));
        let result = agg.into_result();
        assert_eq!(result.folders["Array"].pass_count, 2);
        assert_eq!(result.folders["Basics"].fail_count, 1);
        assert_eq!(result.total_count(), 4);
    }

    #[test]
    fn pass_fail_count_display() {
        let counts = PassFailCount {
            pass_count: 3,
            fail_count: 1,
        };
        assert_eq!(counts.to_string(), "passed 3, failed 1");
    }
}
