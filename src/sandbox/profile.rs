//! Invocation profiles: how a request becomes an argv and how the finished
//! child becomes a response.
//!
//! Two profiles exist. `GenericProfile` runs any executable in the approved
//! directory with caller-supplied arguments. `HciFilterProfile` runs one
//! server-configured tool with a fixed argument prefix and a handful of
//! validated selectors.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;

use super::error::{ExecError, Result};
use super::executor::{ExecutionPlan, ExecutionResult};
use super::output;
use super::resolve::{self, NamePolicy};
use super::Engine;

/// Selector values accepted by the HCI filter: hex with an optional `0x`.
static HEX_SELECTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:0[xX])?[0-9A-Fa-f]{1,8}$").expect("selector pattern is valid"));

/// One way of invoking an external tool.
///
/// `build` does all validation and must not spawn anything; `interpret`
/// turns the finished child into either an output or an `ExecError`.
pub trait InvocationProfile: Send + Sync {
    type Request: Send + Sync;
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn build(&self, request: &Self::Request, engine: &Engine) -> Result<ExecutionPlan>;

    fn interpret(
        &self,
        request: &Self::Request,
        result: ExecutionResult,
        engine: &Engine,
    ) -> Result<Self::Output>;
}

// ── Generic profile ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GenericRunRequest {
    /// A name inside the approved directory, never a path to elsewhere.
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub require_json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenericRunOutput {
    pub executable: String,
    pub command: Vec<String>,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Text output; omitted when stdout was parsed into `output`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs caller-named executables from the approved directory.
///
/// A non-zero exit or a timeout is reported back as data (`exit_code`,
/// `timed_out`); the caller decides what it means.
#[derive(Debug, Clone)]
pub struct GenericProfile {
    policy: NamePolicy,
    working_dir: PathBuf,
}

impl GenericProfile {
    pub fn new(policy: NamePolicy, working_dir: PathBuf) -> Self {
        Self {
            policy,
            working_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let policy = if config.tools.allow_nested_executables {
            NamePolicy::Nested
        } else {
            NamePolicy::BareName
        };
        Self::new(policy, config.tool_working_dir())
    }
}

impl InvocationProfile for GenericProfile {
    type Request = GenericRunRequest;
    type Output = GenericRunOutput;

    fn name(&self) -> &'static str {
        "generic"
    }

    fn build(&self, request: &GenericRunRequest, engine: &Engine) -> Result<ExecutionPlan> {
        let timeout = engine.timeout_for(request.timeout_seconds)?;
        let executable =
            resolve::resolve(engine.approved_root(), &request.executable, self.policy)?;
        check_working_dir(&self.working_dir)?;

        Ok(ExecutionPlan {
            executable,
            args: request.args.clone(),
            working_dir: self.working_dir.clone(),
            env: engine.child_env(),
            timeout,
        })
    }

    fn interpret(
        &self,
        request: &GenericRunRequest,
        result: ExecutionResult,
        engine: &Engine,
    ) -> Result<GenericRunOutput> {
        let processed = output::process(&result, engine.strip_ansi(), request.require_json)?;
        let stdout = match processed.parsed_json {
            Some(_) => None,
            None => Some(processed.stdout().to_string()),
        };

        Ok(GenericRunOutput {
            executable: executable_of(&result),
            command: result.command.clone(),
            exit_code: result.exit_code(),
            timed_out: result.timed_out(),
            stdout,
            stderr: processed.stderr().to_string(),
            output: processed.parsed_json,
            duration_ms: result.duration_ms(),
        })
    }
}

// ── HCI filter profile ──────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HciFilterRequest {
    pub input_path: String,
    #[serde(default)]
    pub ogf: Option<String>,
    #[serde(default)]
    pub ocf: Option<String>,
    #[serde(default)]
    pub opcode: Option<String>,
    #[serde(default)]
    pub eventcode: Option<String>,
    #[serde(default)]
    pub le_subevent: Option<String>,
    #[serde(default)]
    pub vendor_eventcode: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl HciFilterRequest {
    /// Selectors in the order their flags are emitted.
    fn selectors(&self) -> [(&'static str, &'static str, Option<&str>); 6] {
        [
            ("ogf", "--ogf", self.ogf.as_deref()),
            ("ocf", "--ocf", self.ocf.as_deref()),
            ("opcode", "--opcode", self.opcode.as_deref()),
            ("eventcode", "--eventcode", self.eventcode.as_deref()),
            ("le_subevent", "--le-subevent", self.le_subevent.as_deref()),
            (
                "vendor_eventcode",
                "--vendor-eventcode",
                self.vendor_eventcode.as_deref(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HciFilterOutput {
    pub executable: String,
    pub command: Vec<String>,
    pub exit_code: i32,
    pub output: Value,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs the configured HCI trace filter. The tool must exit 0 and print
/// exactly one JSON document.
#[derive(Debug, Clone)]
pub struct HciFilterProfile {
    executable: PathBuf,
    working_dir: PathBuf,
    args: Vec<String>,
}

impl HciFilterProfile {
    pub fn new(executable: PathBuf, working_dir: PathBuf, args: Vec<String>) -> Self {
        Self {
            executable,
            working_dir,
            args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.hci_filter_executable(),
            config.hci_filter_working_dir(),
            config.tools.hci_filter.args.clone(),
        )
    }

    fn arguments(&self, request: &HciFilterRequest) -> Result<Vec<String>> {
        let mut args = self.args.clone();
        for (name, flag, value) in request.selectors() {
            // Empty strings count as "not given"
            let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            if !HEX_SELECTOR.is_match(value) {
                return Err(ExecError::invalid(
                    name,
                    format!("expected a hex value such as 0x3f, got {value:?}"),
                ));
            }
            args.push(flag.to_string());
            args.push(value.to_string());
        }
        check_input_path(&request.input_path)?;
        args.push(request.input_path.clone());
        Ok(args)
    }
}

impl InvocationProfile for HciFilterProfile {
    type Request = HciFilterRequest;
    type Output = HciFilterOutput;

    fn name(&self) -> &'static str {
        "hci_filter"
    }

    fn build(&self, request: &HciFilterRequest, engine: &Engine) -> Result<ExecutionPlan> {
        let timeout = engine.timeout_for(request.timeout_seconds)?;
        let args = self.arguments(request)?;
        let executable = resolve::resolve_configured(engine.approved_root(), &self.executable)?;
        check_working_dir(&self.working_dir)?;

        Ok(ExecutionPlan {
            executable,
            args,
            working_dir: self.working_dir.clone(),
            env: engine.child_env(),
            timeout,
        })
    }

    fn interpret(
        &self,
        _request: &HciFilterRequest,
        result: ExecutionResult,
        engine: &Engine,
    ) -> Result<HciFilterOutput> {
        if !result.success() {
            return Err(tool_failed(&result, engine));
        }

        let processed = output::process(&result, engine.strip_ansi(), true)?;
        Ok(HciFilterOutput {
            executable: executable_of(&result),
            command: result.command.clone(),
            exit_code: result.exit_code(),
            stderr: processed.stderr().to_string(),
            output: processed.parsed_json.unwrap_or(Value::Null),
            duration_ms: result.duration_ms(),
        })
    }
}

// ── shared helpers ──────────────────────────────────────

fn executable_of(result: &ExecutionResult) -> String {
    result.command.first().cloned().unwrap_or_default()
}

fn tool_failed(result: &ExecutionResult, engine: &Engine) -> ExecError {
    let (stdout, stderr) = if engine.strip_ansi() {
        (
            String::from_utf8_lossy(&output::strip_ansi(&result.stdout)).into_owned(),
            String::from_utf8_lossy(&output::strip_ansi(&result.stderr)).into_owned(),
        )
    } else {
        (
            String::from_utf8_lossy(&result.stdout).into_owned(),
            String::from_utf8_lossy(&result.stderr).into_owned(),
        )
    };
    ExecError::ToolFailed {
        exit_code: result.exit_code(),
        timed_out: result.timed_out(),
        stdout,
        stderr,
    }
}

fn check_working_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ExecError::invalid(
            "working_dir",
            format!("{} is not an existing directory", dir.display()),
        ))
    }
}

/// The input path is handed to the tool as its last positional argument,
/// so it must not look like an option or walk up the tree.
fn check_input_path(input: &str) -> Result<()> {
    let reason = if input.trim().is_empty() {
        "must not be empty"
    } else if input.contains('\0') {
        "must not contain NUL bytes"
    } else if input.starts_with('-') {
        "must not start with '-'"
    } else if input.split(['/', '\\']).any(|segment| segment == "..") {
        "must not contain '..' segments"
    } else {
        return Ok(());
    };
    Err(ExecError::invalid("input_path", reason))
}
