use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use super::{clip_chars, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{
    Tool, ToolContext, ToolOutput, DEFAULT_BASH_TIMEOUT_MS, MAX_BASH_TIMEOUT_MS, MAX_OUTPUT_SIZE,
};

/// Run a shell command in the workspace
pub struct BashTool;

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace directory. Use for git, cargo, npm and other CLI tools. Returns stdout, stderr and the exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds. Default: 120000, maximum: 600000"
                }
            },
            "required": ["command"]
        })
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Run: {}", clip_chars(args["command"].as_str().unwrap_or("?"), 200))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: BashInput = parse_input(self.name(), args)?;
        let timeout_ms = input
            .timeout_ms
            .unwrap_or(DEFAULT_BASH_TIMEOUT_MS)
            .clamp(1, MAX_BASH_TIMEOUT_MS);

        tracing::debug!(command = %input.command, timeout_ms, "Executing shell command");

        let mut shell = std::process::Command::new("bash");
        shell
            .arg("-c")
            .arg(&input.command)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so background jobs and pipelines die with the shell
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            shell.process_group(0);
        }
        let mut child = Command::from(shell)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeError::Tool {
                tool: self.name().to_string(),
                message: format!("failed to spawn shell: {}", e),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            result = async {
                let (out, err) = tokio::join!(read_capped(stdout), read_capped(stderr));
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((out?, err?, status))
            } => Some(result?),
            _ = ctx.cancel.cancelled() => None,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                kill_tree(&mut child).await;
                return Err(CodeError::Timeout(format!(
                    "bash command exceeded {}ms",
                    timeout_ms
                )));
            }
        };

        let Some((stdout, stderr, status)) = finished else {
            kill_tree(&mut child).await;
            tracing::info!(command = %input.command, "Shell command cancelled");
            return Err(CodeError::Cancelled);
        };

        let exit_code = status.code().unwrap_or(-1);
        let mut output = stdout;
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push_str("\n\n--- stderr ---\n");
            }
            output.push_str(&stderr);
        }
        if output.is_empty() {
            output = "(no output)".to_string();
        }
        output.push_str(&format!("\n\nExit code: {}", exit_code));

        let output = if status.success() {
            ToolOutput::success(output)
        } else {
            ToolOutput::error(output)
        };
        Ok(output.with_metadata(json!({ "exit_code": exit_code })))
    }
}

/// Kill the shell and everything it started, then reap it
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!(pid, "killpg failed: {}", e);
            }
        }
    }
    child.kill().await.ok();
}

/// Drain a pipe, keeping at most `MAX_OUTPUT_SIZE` bytes so the child never
/// blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = MAX_OUTPUT_SIZE.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        dropped += n.saturating_sub(room);
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        text.push_str(&format!("\n[output truncated: {} more bytes]", dropped));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::workspace;
    use std::time::Instant;

    #[tokio::test]
    async fn test_bash_success() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();

        let output = BashTool.execute(&json!({"command": "ls"}), &ctx).await.unwrap();
        assert!(!output.is_error);
        assert!(output.content.contains("marker.txt"));
        assert!(output.content.ends_with("Exit code: 0"));
    }

    #[tokio::test]
    async fn test_bash_stderr_and_exit_code() {
        let (_dir, ctx) = workspace();
        let output = BashTool
            .execute(&json!({"command": "echo out; echo err >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert!(output.is_error);
        assert_eq!(output.content, "out\n\n\n--- stderr ---\nerr\n\n\nExit code: 3");
        assert_eq!(output.metadata.unwrap()["exit_code"], 3);
    }

    #[tokio::test]
    async fn test_bash_no_output() {
        let (_dir, ctx) = workspace();
        let output = BashTool.execute(&json!({"command": "true"}), &ctx).await.unwrap();
        assert_eq!(output.content, "(no output)\n\nExit code: 0");
    }

    #[tokio::test]
    async fn test_bash_timeout_kills_process() {
        let (_dir, ctx) = workspace();
        let start = Instant::now();
        let err = BashTool
            .execute(&json!({"command": "sleep 30", "timeout_ms": 200}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_bash_cancellation_kills_process() {
        let (_dir, ctx) = workspace();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let err = BashTool
            .execute(&json!({"command": "sleep 30"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    /// Alive and not a zombie
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(false, |state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_bash_timeout_kills_background_jobs() {
        let (dir, ctx) = workspace();
        let err = BashTool
            .execute(
                &json!({"command": "sleep 30 & echo $! > bg.pid; wait", "timeout_ms": 300}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::Timeout(_)));

        let pid: u32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(pid), "background job {} survived the timeout", pid);
    }

    #[test]
    fn test_summarize() {
        assert_eq!(BashTool.summarize(&json!({"command": "cargo test"})), "Run: cargo test");
    }
}
