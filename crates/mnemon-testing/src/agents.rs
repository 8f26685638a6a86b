use anyhow::Result;
use std::path::{Path, PathBuf};

/// Write an executable shell script that plays the analyzer agent, emitting
/// a progress event then the given node payload.
pub fn fake_agent(dir: &Path, payload_json: &str) -> Result<PathBuf> {
    let body = format!(
        "echo '{{\"event\":\"progress\",\"message\":\"analyzing\"}}'\necho '{}'\n",
        payload_json.replace('\'', r"'\''")
    );
    write_script(dir, "fake-agent.sh", &body)
}

/// Agent that hangs on its first invocation (forcing a timeout) and returns
/// the payload on every later one. The marker file records the first run.
pub fn flaky_agent(dir: &Path, payload_json: &str) -> Result<PathBuf> {
    let marker = dir.join("first-attempt.marker");
    let body = format!(
        "if [ ! -f '{marker}' ]; then\n  touch '{marker}'\n  sleep 60\nfi\necho '{payload}'\n",
        marker = marker.display(),
        payload = payload_json.replace('\'', r"'\''"),
    );
    write_script(dir, "flaky-agent.sh", &body)
}

/// Agent that always exits non-zero with noise on stderr.
pub fn broken_agent(dir: &Path) -> Result<PathBuf> {
    write_script(dir, "broken-agent.sh", "echo 'agent exploded' >&2\nexit 7\n")
}

/// A minimal valid node payload with the given summary.
pub fn payload_json(summary: &str, node_type: &str, outcome: &str) -> String {
    format!(
        r#"{{"summary":"{}","type":"{}","outcome":"{}","hadClearGoal":true,"isNewProject":false,"tags":["test"],"topics":["fixture"],"filesTouched":["src/lib.rs"]}}"#,
        summary, node_type, outcome
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}
