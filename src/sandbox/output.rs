//! Post-processing of captured output: escape stripping and JSON parsing.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde_json::Value;

use super::error::{ExecError, Result};
use super::executor::ExecutionResult;

/// CSI (`ESC [ … final`), OSC (`ESC ] … BEL` or `ESC ] … ESC \`), two-byte
/// escapes, and finally any stray ESC. Every match starts with ESC and the
/// output never contains one, which makes stripping idempotent.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[0-~])?")
        .expect("ANSI escape pattern is valid")
});

/// Captured output after post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessedOutput {
    pub raw_stdout: String,
    pub raw_stderr: String,
    /// Present only when stripping was enabled.
    pub sanitized_stdout: Option<String>,
    pub sanitized_stderr: Option<String>,
    /// Present only when JSON was required and parsed.
    pub parsed_json: Option<Value>,
}

impl PostProcessedOutput {
    /// Text to show the caller: sanitized if available, raw otherwise.
    pub fn stdout(&self) -> &str {
        self.sanitized_stdout.as_deref().unwrap_or(self.raw_stdout.as_str())
    }

    pub fn stderr(&self) -> &str {
        self.sanitized_stderr.as_deref().unwrap_or(self.raw_stderr.as_str())
    }
}

/// Removes terminal escape sequences. Bytes outside escape sequences are
/// returned unchanged, including invalid UTF-8.
pub fn strip_ansi(bytes: &[u8]) -> Cow<'_, [u8]> {
    ANSI_ESCAPE.replace_all(bytes, &b""[..])
}

/// Applies the optional transformations to a finished execution.
///
/// The JSON check only looks at stdout and ignores the exit code; deciding
/// what a non-zero exit means is the profile's job.
pub fn process(
    result: &ExecutionResult,
    strip: bool,
    require_json: bool,
) -> Result<PostProcessedOutput> {
    let raw_stdout = String::from_utf8_lossy(&result.stdout).into_owned();
    let raw_stderr = String::from_utf8_lossy(&result.stderr).into_owned();

    let clean_stdout = strip.then(|| strip_ansi(&result.stdout));
    let clean_stderr = strip.then(|| strip_ansi(&result.stderr));

    let sanitized_stdout = clean_stdout
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let sanitized_stderr = clean_stderr
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned());

    let parsed_json = if require_json {
        let source = clean_stdout.as_deref().unwrap_or(result.stdout.as_slice());
        let diagnostics_stderr = sanitized_stderr.as_deref().unwrap_or(raw_stderr.as_str());
        Some(parse_single_json(source).map_err(|reason| ExecError::InvalidJsonOutput {
            reason,
            exit_code: result.exit_code(),
            timed_out: result.timed_out(),
            stdout: raw_stdout.clone(),
            stderr: diagnostics_stderr.to_string(),
        })?)
    } else {
        None
    };

    Ok(PostProcessedOutput {
        raw_stdout,
        raw_stderr,
        sanitized_stdout,
        sanitized_stderr,
        parsed_json,
    })
}

/// Exactly one JSON document, surrounding whitespace allowed.
fn parse_single_json(bytes: &[u8]) -> std::result::Result<Value, String> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err("stdout is empty".to_string());
    }
    serde_json::from_slice(trimmed).map_err(|e| e.to_string())
}
