//! Child process execution shared by the git and cargo adapters.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` in `dir` with extra environment `envs`.
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    dir: &Path,
    envs: &[(String, String)],
) -> std::io::Result<CommandOutput> {
    trace!(program, ?args, dir = %dir.display(), "spawning");
    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = run("echo", &["hello"], dir.path(), &[]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_passes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let envs = vec![("CBS_PROBE".to_string(), "42".to_string())];
        let out = run("sh", &["-c", "echo $CBS_PROBE"], dir.path(), &envs)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }
}
