use crate::config::AgentSection;
use crate::{Error, Result};
use mnemon_engine::{AnalysisPayload, parse_agent_output};
use mnemon_types::{SessionEntry, prompt_version_hash};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Instruction text handed to the analyzer. Hashing this constant yields the
/// `prompt_version` stamped on every node, so reanalysis can find nodes
/// produced by older revisions.
pub const ANALYSIS_PROMPT_TEMPLATE: &str = "\
Analyze the following agent session segment and emit one JSON object per \
line; the final object must describe the completed task with fields: \
summary, type, outcome, hadClearGoal, isNewProject, decisions, lessons, \
quirks, toolErrors, tags, topics, filesTouched, tokensUsed, cost, \
durationMinutes, model, relationships.";

pub fn current_prompt_version() -> String {
    prompt_version_hash(ANALYSIS_PROMPT_TEMPLATE)
}

/// Skills available to the analyzer, discovered once at startup from the
/// skills directory (one skill per entry, named by file stem).
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    names: Vec<String>,
}

impl SkillSet {
    /// Enumerate skills and fail fast when a required one is absent; a
    /// missing required skill is a fatal environment error.
    pub fn discover(section: &AgentSection) -> Result<Self> {
        let dir = crate::config::expand_tilde(&section.skills_dir.to_string_lossy());
        let mut names = Vec::new();

        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names.dedup();

        for required in &section.required_skills {
            if !names.contains(required) {
                return Err(Error::MissingSkill(required.clone()));
            }
        }

        Ok(Self { names })
    }

    /// Build from an explicit list, bypassing discovery. Used by offline
    /// commands that never spawn the agent.
    pub fn from_names(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Comma-separated skill list for one invocation. The large-session
    /// skill is appended only when the session file crosses the size
    /// threshold.
    pub fn csv_for(&self, section: &AgentSection, session_size: u64) -> String {
        let mut names: Vec<&str> = self
            .names
            .iter()
            .map(String::as_str)
            .filter(|name| *name != section.large_session_skill)
            .collect();

        if session_size > section.large_session_bytes
            && self.names.iter().any(|n| *n == section.large_session_skill)
        {
            names.push(&section.large_session_skill);
        }

        names.join(",")
    }
}

/// One analyzer invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub skills_csv: String,
    pub workdir: PathBuf,
}

/// Everything a single agent run produced. `payload` is the accepted node
/// payload if any; raw streams are kept for observability.
#[derive(Debug)]
pub struct AgentResult {
    pub payload: Option<AnalysisPayload>,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub events: Vec<Value>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Deterministic prompt for a segment: template plus the serialized entries.
pub fn build_analysis_prompt(session_file: &str, entries: &[SessionEntry]) -> String {
    let mut prompt = String::from(ANALYSIS_PROMPT_TEMPLATE);
    prompt.push_str("\n\nSession file: ");
    prompt.push_str(session_file);
    prompt.push_str("\nSegment entries:\n");
    for entry in entries {
        if let Ok(line) = serde_json::to_string(entry) {
            prompt.push_str(&line);
            prompt.push('\n');
        }
    }
    prompt
}

/// Spawn the analyzer as `<bin> --prompt <text> --skills <csv>` in the
/// project working directory, enforce the deadline, and parse its streamed
/// output. A deadline overrun kills the child and surfaces as a timeout.
pub fn invoke_agent(bin: &str, request: &AgentRequest, timeout: Duration) -> Result<AgentResult> {
    let started = Instant::now();

    let workdir: &Path = if request.workdir.is_dir() {
        &request.workdir
    } else {
        Path::new(".")
    };

    let mut child = Command::new(bin)
        .arg("--prompt")
        .arg(&request.prompt)
        .arg("--skills")
        .arg(&request.skills_csv)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| Error::Agent(format!("failed to spawn {}: {}", bin, err)))?;

    let stdout_handle = child.stdout.take().map(capture_stream);
    let stderr_handle = child.stderr.take().map(capture_stream);

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout(timeout));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = child.kill();
                return Err(Error::Agent(format!("wait failed: {}", err)));
            }
        }
    };

    let raw_stdout = stdout_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let raw_stderr = stderr_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    let parsed = parse_agent_output(&raw_stdout);

    Ok(AgentResult {
        payload: parsed.payload,
        raw_stdout,
        raw_stderr,
        events: parsed.events,
        exit_code: exit_status.code(),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn capture_stream<R: Read + Send + 'static>(mut stream: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = stream.read_to_string(&mut buffer);
        buffer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn request(workdir: &Path) -> AgentRequest {
        AgentRequest {
            prompt: "analyze".into(),
            skills_csv: "session-analysis".into(),
            workdir: workdir.to_path_buf(),
        }
    }

    #[test]
    fn test_agent_success_with_payload() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(
            dir.path(),
            r#"echo '{"event":"progress","message":"reading"}'
echo '{"event":"result","node":{"summary":"did the thing","type":"coding","outcome":"success"}}'"#,
        );

        let result = invoke_agent(
            agent.to_str().unwrap(),
            &request(dir.path()),
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.events.len(), 2);
        let payload = result.payload.unwrap();
        assert_eq!(payload.summary, "did the thing");
    }

    #[test]
    fn test_agent_garbage_lines_preserved() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(
            dir.path(),
            r#"echo 'warming up'
echo '{"summary":"ok","type":"qa","outcome":"partial"}'"#,
        );

        let result = invoke_agent(
            agent.to_str().unwrap(),
            &request(dir.path()),
            Duration::from_secs(10),
        )
        .unwrap();

        assert!(result.raw_stdout.contains("warming up"));
        assert!(result.payload.is_some());
    }

    #[test]
    fn test_agent_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(dir.path(), "sleep 30");

        let started = Instant::now();
        let err = invoke_agent(
            agent.to_str().unwrap(),
            &request(dir.path()),
            Duration::from_millis(300),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        // The classifier must route this to a transient retry.
        let classified = mnemon_types::classify_error(&err.to_string());
        assert_eq!(classified.reason, "timeout");
    }

    #[test]
    fn test_agent_nonzero_exit_reported() {
        let dir = TempDir::new().unwrap();
        let agent = script_agent(dir.path(), "echo 'boom' >&2\nexit 3");

        let result = invoke_agent(
            agent.to_str().unwrap(),
            &request(dir.path()),
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.raw_stderr.contains("boom"));
        assert!(result.payload.is_none());
    }

    #[test]
    fn test_missing_binary_is_agent_error() {
        let dir = TempDir::new().unwrap();
        let err = invoke_agent(
            "/nonexistent/agent-binary",
            &request(dir.path()),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
    }

    #[test]
    fn test_skill_discovery_and_required() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("session-analysis.md"), "skill").unwrap();
        std::fs::write(dir.path().join("chunked-analysis.md"), "skill").unwrap();

        let mut section = AgentSection::default();
        section.skills_dir = dir.path().to_path_buf();

        let skills = SkillSet::discover(&section).unwrap();
        assert_eq!(skills.csv_for(&section, 100), "session-analysis");
        assert_eq!(
            skills.csv_for(&section, section.large_session_bytes + 1),
            "session-analysis,chunked-analysis"
        );
    }

    #[test]
    fn test_missing_required_skill_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut section = AgentSection::default();
        section.skills_dir = dir.path().to_path_buf();

        let err = SkillSet::discover(&section).unwrap_err();
        assert!(matches!(err, Error::MissingSkill(_)));
        let classified = mnemon_types::classify_error(&err.to_string());
        assert_eq!(classified.reason, "missing_skill");
    }

    #[test]
    fn test_prompt_version_stable() {
        assert_eq!(current_prompt_version(), current_prompt_version());
        assert_eq!(current_prompt_version().len(), 16);
    }
}
