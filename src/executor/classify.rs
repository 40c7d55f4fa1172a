//! Outcome classification.
//!
//! A pure state machine over what the worker observed: timeout, exit code,
//! and captured output against the test's baseline expectation. Keeping it
//! free of I/O means classifying the same observation twice always yields
//! the same verdict.

use std::borrow::Cow;

use regex::bytes::Regex;

/// What the test's declared baseline demands of its output.
#[derive(Debug, Clone, Copy)]
pub enum BaselineExpectation<'a> {
    /// No declared baseline: every non-empty output line must read `pass`
    /// or `passed`, and at least one must be present.
    PassLines,
    /// Declared-but-empty baseline (ad-hoc tests): exit code alone decides.
    ExitCodeOnly,
    /// Declared baseline content, already newline-normalized; output must
    /// match byte for byte.
    Content(&'a [u8]),
}

/// Classification knobs taken from the run configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyOptions {
    /// Record timeouts as passes with a warning annotation.
    pub warn_on_timeout: bool,
    /// Skip output checks entirely; timeout and exit code decide.
    pub return_code_only: bool,
}

/// The verdict for one executed test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Timed out under warn-on-timeout mode: counted as a pass, annotated.
    PassWithWarning,
    Fail(FailKind),
}

impl Verdict {
    pub fn failed(&self) -> bool {
        matches!(self, Verdict::Fail(_))
    }
}

/// Why a test failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailKind {
    TimedOut,
    BadExit,
    /// Output did not consist of `pass`/`passed` lines.
    UnexpectedOutput,
    /// Output differed from the baseline; carries the first differing line
    /// when one exists within the shorter of the two.
    BaselineMismatch(Option<LineDiff>),
}

/// First point of divergence between actual and expected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiff {
    /// 1-based line number.
    pub line: usize,
    pub actual: String,
    pub expected: String,
}

/// Strip carriage returns before each newline so comparisons are insensitive
/// to platform line endings.
pub fn normalize_newlines(bytes: &[u8]) -> Cow<'_, [u8]> {
    let cr = Regex::new(r"\r+\n").unwrap();
    cr.replace_all(bytes, &b"\n"[..])
}

/// Classify one observed execution. States are evaluated in order; the
/// first match wins.
pub fn classify(
    timed_out: bool,
    exit_code: i32,
    output: &[u8],
    expectation: BaselineExpectation<'_>,
    opts: ClassifyOptions,
) -> Verdict {
    if timed_out {
        return if opts.warn_on_timeout {
            Verdict::PassWithWarning
        } else {
            Verdict::Fail(FailKind::TimedOut)
        };
    }

    if exit_code != 0 {
        return Verdict::Fail(FailKind::BadExit);
    }

    if opts.return_code_only {
        return Verdict::Pass;
    }

    match expectation {
        BaselineExpectation::ExitCodeOnly => Verdict::Pass,
        BaselineExpectation::PassLines => {
            if all_lines_pass(output) {
                Verdict::Pass
            } else {
                Verdict::Fail(FailKind::UnexpectedOutput)
            }
        }
        BaselineExpectation::Content(expected) => {
            if expected == output {
                Verdict::Pass
            } else {
                Verdict::Fail(FailKind::BaselineMismatch(first_line_diff(output, expected)))
            }
        }
    }
}

/// At least one non-empty line, and every non-empty line is `pass` or
/// `passed`, case-insensitively.
fn all_lines_pass(output: &[u8]) -> bool {
    let mut saw_pass = false;
    for line in output.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case(b"pass") || line.eq_ignore_ascii_case(b"passed") {
            saw_pass = true;
        } else {
            return false;
        }
    }
    saw_pass
}

fn first_line_diff(actual: &[u8], expected: &[u8]) -> Option<LineDiff> {
    let actual_lines: Vec<&[u8]> = actual.split(|&b| b == b'\n').collect();
    let expected_lines: Vec<&[u8]> = expected.split(|&b| b == b'\n').collect();

    actual_lines
        .iter()
        .zip(expected_lines.iter())
        .position(|(a, e)| a != e)
        .map(|i| LineDiff {
            line: i + 1,
            actual: String::from_utf8_lossy(actual_lines[i]).into_owned(),
            expected: String::from_utf8_lossy(expected_lines[i]).into_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTS: ClassifyOptions = ClassifyOptions {
        warn_on_timeout: false,
        return_code_only: false,
    };

    #[test]
    fn pass_line_and_zero_exit_passes() {
        let verdict = classify(false, 0, b"pass\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn passed_is_case_insensitive() {
        let verdict = classify(false, 0, b"PASSED\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn other_output_line_fails() {
        let verdict = classify(false, 0, b"42\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::UnexpectedOutput));
    }

    #[test]
    fn silent_output_fails() {
        let verdict = classify(false, 0, b"", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::UnexpectedOutput));
    }

    #[test]
    fn mixed_pass_and_other_fails() {
        let verdict = classify(false, 0, b"pass\n42\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::UnexpectedOutput));
    }

    #[test]
    fn nonzero_exit_fails_before_output_checks() {
        let verdict = classify(false, 3, b"pass\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::BadExit));
    }

    #[test]
    fn timeout_fails_first() {
        let verdict = classify(true, 0, b"pass\n", BaselineExpectation::PassLines, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::TimedOut));
    }

    #[test]
    fn timeout_warns_when_configured() {
        let opts = ClassifyOptions {
            warn_on_timeout: true,
            ..OPTS
        };
        let verdict = classify(true, 0, b"", BaselineExpectation::PassLines, opts);
        assert_eq!(verdict, Verdict::PassWithWarning);
    }

    #[test]
    fn carriage_returns_normalize_away() {
        let output = normalize_newlines(b"result: 7\r\n");
        let baseline = normalize_newlines(b"result: 7\n");
        let verdict = classify(
            false,
            0,
            &output,
            BaselineExpectation::Content(&baseline),
            OPTS,
        );
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn repeated_carriage_returns_collapse() {
        assert_eq!(normalize_newlines(b"a\r\r\nb\n").as_ref(), b"a\nb\n");
    }

    #[test]
    fn baseline_mismatch_pinpoints_first_line() {
        let verdict = classify(
            false,
            0,
            b"one\ntwo\nthree\n",
            BaselineExpectation::Content(b"one\n2\nthree\n"),
            OPTS,
        );
        match verdict {
            Verdict::Fail(FailKind::BaselineMismatch(Some(diff))) => {
                assert_eq!(diff.line, 2);
                assert_eq!(diff.actual, "two");
                assert_eq!(diff.expected, "2");
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn baseline_length_mismatch_without_line_diff() {
        let verdict = classify(
            false,
            0,
            b"one\n",
            BaselineExpectation::Content(b"one\ntwo\n"),
            OPTS,
        );
        assert_eq!(verdict, Verdict::Fail(FailKind::BaselineMismatch(None)));
    }

    #[test]
    fn empty_baseline_name_checks_exit_code_only() {
        let verdict = classify(false, 0, b"anything\n", BaselineExpectation::ExitCodeOnly, OPTS);
        assert_eq!(verdict, Verdict::Pass);
        let verdict = classify(false, 1, b"pass\n", BaselineExpectation::ExitCodeOnly, OPTS);
        assert_eq!(verdict, Verdict::Fail(FailKind::BadExit));
    }

    #[test]
    fn return_code_only_skips_output() {
        let opts = ClassifyOptions {
            return_code_only: true,
            ..OPTS
        };
        let verdict = classify(false, 0, b"garbage\n", BaselineExpectation::PassLines, opts);
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn classification_is_idempotent() {
        let observations = [
            (false, 0, &b"pass\n"[..]),
            (false, 1, &b"pass\n"[..]),
            (true, 0, &b""[..]),
            (false, 0, &b"weird\n"[..]),
        ];
        for (timed_out, code, output) in observations {
            let a = classify(timed_out, code, output, BaselineExpectation::PassLines, OPTS);
            let b = classify(timed_out, code, output, BaselineExpectation::PassLines, OPTS);
            assert_eq!(a, b);
        }
    }
}
