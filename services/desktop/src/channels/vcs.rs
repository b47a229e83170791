//! 只读版本控制检查：`git:status` / `git:log` / `git:diff`。

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tokio::process::Command;

/// 单次 git 调用超时。
const GIT_TIMEOUT: Duration = Duration::from_secs(5);
/// 输出上限，超出截断。
const MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// `git log` 条数上限。
const MAX_LOG_COUNT: u64 = 200;

/// 组装 git 参数；只接受白名单动作与受限参数。
fn git_args(action: &str, args: &[Value]) -> anyhow::Result<Vec<String>> {
    match action {
        "status" => Ok(vec![
            "status".to_string(),
            "--porcelain=v1".to_string(),
            "--branch".to_string(),
        ]),
        "log" => {
            let count = args
                .first()
                .and_then(Value::as_u64)
                .unwrap_or(50)
                .clamp(1, MAX_LOG_COUNT);
            Ok(vec![
                "log".to_string(),
                "--oneline".to_string(),
                "--no-color".to_string(),
                "-n".to_string(),
                count.to_string(),
            ])
        }
        "diff" => {
            let mut argv = vec!["diff".to_string(), "--no-color".to_string()];
            if let Some(path) = args.first().and_then(Value::as_str).map(str::trim)
                && !path.is_empty()
            {
                // 路径参数不允许伪装成 git 选项。
                if path.starts_with('-') {
                    return Err(anyhow!("invalid diff path"));
                }
                argv.push("--".to_string());
                argv.push(path.to_string());
            }
            Ok(argv)
        }
        other => Err(anyhow!("unsupported git action: {other}")),
    }
}

/// 执行一次只读 git 检查。
pub(crate) async fn run(workspace: &Path, action: &str, args: &[Value]) -> anyhow::Result<Value> {
    let argv = git_args(action, args)?;
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(&argv)
            .current_dir(workspace)
            .output(),
    )
    .await
    .map_err(|_| anyhow!("git {action} timed out"))?
    .with_context(|| format!("run git {action} failed"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git {action} failed: {}", stderr.trim()));
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let truncated = text.len() > MAX_OUTPUT_BYTES;
    if truncated {
        text.truncate(MAX_OUTPUT_BYTES);
    }
    Ok(json!({ "output": text, "truncated": truncated }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_args_are_fixed() {
        assert_eq!(
            git_args("status", &[]).unwrap(),
            vec!["status", "--porcelain=v1", "--branch"]
        );
    }

    #[test]
    fn log_count_is_bounded() {
        let argv = git_args("log", &[json!(10_000)]).unwrap();
        assert_eq!(argv.last().unwrap(), "200");
        let argv = git_args("log", &[]).unwrap();
        assert_eq!(argv.last().unwrap(), "50");
    }

    #[test]
    fn diff_path_cannot_inject_flags() {
        assert!(git_args("diff", &[json!("--exec=evil")]).is_err());
        let argv = git_args("diff", &[json!("src/main.rs")]).unwrap();
        assert_eq!(argv, vec!["diff", "--no-color", "--", "src/main.rs"]);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(git_args("push", &[]).is_err());
    }
}
