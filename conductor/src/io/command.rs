//! Process-backed capability executor.
//!
//! Maps capability names to command lines (for example
//! `run_checks = ["just", "ci"]`) and runs them in a configured working
//! directory. The exit status decides `ok`; captured output is returned for
//! diagnosis.
//!
//! Invocation params reach the child as follows: `args` are appended to the
//! argv, `stdin` (or else `prompt`) is written to standard input, and
//! `target_file` is exported as `CONDUCTOR_TARGET_FILE`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::io::capability::{CapabilityError, CapabilityExecutor, CapabilityOutput, Invocation};
use crate::io::config::CommandsSection;
use crate::io::process::run_command;

/// Upper bound for a single command when the caller sets no tighter deadline.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Environment variable carrying the invocation's `target_file`.
pub const TARGET_FILE_ENV: &str = "CONDUCTOR_TARGET_FILE";

/// Keep at most this many trailing bytes of stderr in the failure summary.
const ERROR_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    workdir: PathBuf,
    output_limit_bytes: usize,
    timeout: Duration,
    commands: BTreeMap<String, Vec<String>>,
}

impl CommandExecutor {
    pub fn new(section: &CommandsSection) -> Self {
        Self {
            workdir: section.workdir.clone(),
            output_limit_bytes: section.output_limit_bytes,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            commands: section.capabilities.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_command(mut self, capability: impl Into<String>, argv: Vec<String>) -> Self {
        self.commands.insert(capability.into(), argv);
        self
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    fn build(&self, argv: &[String], params: &Value) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&self.workdir);
        if let Some(extra) = params.get("args").and_then(Value::as_array) {
            cmd.args(extra.iter().filter_map(Value::as_str));
        }
        if let Some(target) = params.get("target_file").and_then(Value::as_str) {
            cmd.env(TARGET_FILE_ENV, target);
        }
        cmd
    }
}

#[async_trait]
impl CapabilityExecutor for CommandExecutor {
    #[instrument(skip_all, fields(capability = %invocation.name))]
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let argv = self
            .commands
            .get(&invocation.name)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| CapabilityError::Unavailable(invocation.name.clone()))?;
        let cmd = self.build(argv, &invocation.params);
        let params = &invocation.params;
        let stdin = params
            .get("stdin")
            .or_else(|| params.get("prompt"))
            .and_then(Value::as_str)
            .map(|s| s.as_bytes().to_vec());
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;
        let cancel = cancel.clone();

        debug!(argv = ?argv, workdir = %self.workdir.display(), "running capability command");
        let output = tokio::task::spawn_blocking(move || {
            run_command(cmd, stdin.as_deref(), timeout, limit, &cancel)
        })
        .await
        .map_err(|err| CapabilityError::Failed(format!("command thread failed: {err}")))?
        .map_err(|err| CapabilityError::Failed(format!("{err:#}")))?;

        if output.cancelled {
            return Err(CapabilityError::Cancelled);
        }
        if output.timed_out {
            return Err(CapabilityError::TimedOut(timeout));
        }

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        let ok = output.status.success();
        if !ok {
            warn!(exit_code = ?output.status.code(), "capability command failed");
        }
        Ok(CapabilityOutput {
            ok,
            output: json!({
                "exit_code": output.status.code(),
                "stdout": stdout,
                "stderr": stderr,
            }),
            error: (!ok).then(|| failure_summary(output.status.code(), &stdout, &stderr)),
            cost: None,
        })
    }
}

fn failure_summary(exit_code: Option<i32>, stdout: &str, stderr: &str) -> String {
    let body = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let tail = tail_bytes(body.trim(), ERROR_TAIL_BYTES);
    match exit_code {
        Some(code) => format!("exit code {code}: {tail}"),
        None => format!("terminated by signal: {tail}"),
    }
}

fn tail_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::capability::invoke_bounded;

    fn executor() -> CommandExecutor {
        let section = CommandsSection {
            workdir: std::env::temp_dir(),
            output_limit_bytes: 10_000,
            capabilities: BTreeMap::new(),
        };
        CommandExecutor::new(&section)
            .with_command(
                "pass",
                vec!["sh".into(), "-c".into(), "echo all good".into()],
            )
            .with_command(
                "fail",
                vec![
                    "sh".into(),
                    "-c".into(),
                    "echo 'test foo failed' >&2; exit 1".into(),
                ],
            )
            .with_command("echo", vec!["echo".into()])
            .with_command("generate_fix", vec!["cat".into()])
            .with_command(
                "target",
                vec!["sh".into(), "-c".into(), "printf %s \"$CONDUCTOR_TARGET_FILE\"".into()],
            )
    }

    #[tokio::test]
    async fn passing_command_is_ok() {
        let out = executor()
            .invoke(
                &Invocation::new("pass", Value::Null),
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        assert!(out.ok);
        assert_eq!(out.output["exit_code"], 0);
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let out = executor()
            .invoke(
                &Invocation::new("fail", Value::Null),
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        assert!(!out.ok);
        assert_eq!(out.error.as_deref(), Some("exit code 1: test foo failed"));
    }

    #[tokio::test]
    async fn extra_args_are_appended() {
        let out = executor()
            .invoke(
                &Invocation::new("echo", json!({"args": ["a", "b"]})),
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        assert_eq!(out.output["stdout"], "a b\n");
    }

    #[tokio::test]
    async fn prompt_is_written_to_stdin() {
        let params = json!({
            "prompt": "Fix src/lib.rs: assertion off by one",
            "target_file": "src/lib.rs",
            "diagnosis": "assertion off by one",
        });
        let out = executor()
            .invoke(&Invocation::new("generate_fix", params), &CancellationToken::new())
            .await
            .expect("invoke");
        assert!(out.ok);
        assert_eq!(out.output["stdout"], "Fix src/lib.rs: assertion off by one");
    }

    #[tokio::test]
    async fn explicit_stdin_wins_over_prompt() {
        let params = json!({"stdin": "raw input", "prompt": "rendered"});
        let out = executor()
            .invoke(&Invocation::new("generate_fix", params), &CancellationToken::new())
            .await
            .expect("invoke");
        assert_eq!(out.output["stdout"], "raw input");
    }

    #[tokio::test]
    async fn target_file_is_exported_to_the_child() {
        let out = executor()
            .invoke(
                &Invocation::new("target", json!({"target_file": "src/helper.rs"})),
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        assert_eq!(out.output["stdout"], "src/helper.rs");
    }

    #[tokio::test]
    async fn timed_out_call_kills_the_child() {
        let workdir = tempfile::tempdir().expect("tempdir");
        let section = CommandsSection {
            workdir: workdir.path().to_path_buf(),
            output_limit_bytes: 10_000,
            capabilities: BTreeMap::new(),
        };
        let executor = CommandExecutor::new(&section).with_command(
            "slow_fix",
            vec!["sh".into(), "-c".into(), "sleep 1; touch late_side_effect".into()],
        );

        let err = invoke_bounded(
            &executor,
            &Invocation::new("slow_fix", Value::Null),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, CapabilityError::TimedOut(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!workdir.path().join("late_side_effect").exists());
    }

    #[tokio::test]
    async fn unknown_capability_is_unavailable() {
        let err = executor()
            .invoke(
                &Invocation::new("deploy", Value::Null),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Unavailable("deploy".to_string()));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail_bytes("héllo", 4), "llo");
        assert_eq!(tail_bytes("short", 100), "short");
    }
}
