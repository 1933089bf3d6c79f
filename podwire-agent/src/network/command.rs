use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Run an external tool and return its stdout, failing with its stderr when
/// the exit status is non-zero.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute '{program}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "'{} {}' failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
