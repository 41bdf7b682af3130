//! Running `ip` and `wg`

use tokio::process::Command;
use tracing::trace;

/// Captured result of a finished command
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Failed with one of the given stderr fragments
    pub fn failed_with(&self, fragments: &[&str]) -> bool {
        !self.success && fragments.iter().any(|f| self.stderr.contains(f))
    }
}

pub(crate) async fn run(program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
    trace!(program, ?args, "Running command");
    let output = Command::new(program).args(args).output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
