//! Shell execution tool.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::{Tool, ToolSpec, ToolParam, ToolOutput};

pub struct RunShellTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for RunShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_shell".to_string(),
            description: "Execute a shell command within the workspace directory. \
                Each invocation runs in a fresh shell — `cd` does not persist \
                between calls. Chain commands with `&&` if you need them to \
                share working directory or state."
                .to_string(),
            params: vec![
                ToolParam {
                    name: "command".to_string(),
                    description: "Shell command to execute".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "timeout_secs".to_string(),
                    description: "Max execution time in seconds (default: 30)".to_string(),
                    required: false,
                },
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let command = args
            .get("command")
            .ok_or_else(|| anyhow::anyhow!("missing required param: command"))?;
        let timeout_secs: u64 = args
            .get("timeout_secs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.workspace_root)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("command timed out after {}s", timeout_secs))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n[stderr] {stderr}")
        };

        // Truncate output to prevent context explosion
        let max_output = 32768;
        let result = if combined.len() > max_output {
            format!(
                "{}…[truncated at {} bytes]",
                &combined[..max_output],
                max_output
            )
        } else {
            combined
        };

        Ok(ToolOutput {
            success: output.status.success(),
            output: result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_command_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool { workspace_root: dir.path().to_path_buf() };
        let mut args = HashMap::new();
        args.insert("command".to_string(), "echo hi".to_string());
        let out = tool.run(&args).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output.trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_unsuccessful() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool { workspace_root: dir.path().to_path_buf() };
        let mut args = HashMap::new();
        args.insert("command".to_string(), "exit 1".to_string());
        let out = tool.run(&args).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn command_exceeding_timeout_errors() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool { workspace_root: dir.path().to_path_buf() };
        let mut args = HashMap::new();
        args.insert("command".to_string(), "sleep 5".to_string());
        args.insert("timeout_secs".to_string(), "1".to_string());
        assert!(tool.run(&args).await.is_err());
    }
}
