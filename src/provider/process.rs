//! CLIプロセスの起動と行単位ストリーミング
//!
//! Claude Code / Codex の両アダプターが共有する処理です。
//! 標準出力を1行ずつ読み、キャンセルされたら子プロセスを止めます。

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// CLIプロセスの終了情報
#[derive(Debug)]
pub(crate) struct CliExit {
    pub(crate) success: bool,
    pub(crate) code: i32,
    pub(crate) stderr: String,
}

/// コマンドを起動し、空でない標準出力の各行を `on_line` に渡す
///
/// # エラー
///
/// - [`ProviderError::CliNotFound`] - コマンドが存在しない
/// - [`ProviderError::Cancelled`] - `cancel` がキャンセルされた
/// - `on_line` が返したエラー
pub(crate) async fn run_streaming<F>(
    mut command: Command,
    program: &str,
    npm_package: &str,
    cancel: CancellationToken,
    mut on_line: F,
) -> Result<CliExit, ProviderError>
where
    F: FnMut(&str) -> Result<(), ProviderError> + Send,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProviderError::CliNotFound(program.to_string(), npm_package.to_string())
        } else {
            ProviderError::Io(e)
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProviderError::InvalidResponse("標準出力を取得できません".to_string()))?;
    let stderr = child.stderr.take();

    // stderr は別タスクで吸い出す（パイプ詰まり防止）
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(ProviderError::Cancelled);
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            on_line(line)?;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let status = child.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CliExit {
        success: status.success(),
        code: status.code().unwrap_or(-1),
        stderr,
    })
}

/// `<command> --version` が成功するか
pub(crate) async fn version_check(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_command_is_cli_not_found() {
        let result = run_streaming(
            Command::new("nonexistent-command-xyz123"),
            "nonexistent-command-xyz123",
            "@example/pkg",
            CancellationToken::new(),
            |_| Ok(()),
        )
        .await;

        match result {
            Err(ProviderError::CliNotFound(cmd, pkg)) => {
                assert_eq!(cmd, "nonexistent-command-xyz123");
                assert_eq!(pkg, "@example/pkg");
            }
            other => panic!("Expected CliNotFound error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_check_missing_command() {
        assert!(!version_check("nonexistent-command-xyz123").await);
    }

    #[tokio::test]
    async fn test_precancelled_token_stops_before_reading() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 5; echo late");
        let result = run_streaming(command, "sh", "n/a", cancel, |_| Ok(())).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
