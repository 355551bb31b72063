//! Chained-process runner shared by the backup and restore pipelines.
//!
//! Stages are wired stdout-to-stdin through OS pipes. The parent gives each
//! intermediate stdout directly to the next child and keeps no copy of the
//! descriptor, so when a downstream stage dies its upstream neighbour gets a
//! SIGPIPE instead of hanging. Each stage's stderr is drained into its own
//! buffer concurrently with the waits, which keeps the reaping order safe
//! from pipe deadlocks.

use crate::utils::errors::{AgentError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// One stage of a process chain.
pub struct Stage {
    name: &'static str,
    cmd: Command,
}

impl Stage {
    pub fn new(name: &'static str, program: &str) -> Self {
        Self {
            name,
            cmd: Command::new(program),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Exit code and captured diagnostics of one finished stage.
#[derive(Debug)]
pub struct StageResult {
    pub name: &'static str,
    pub code: i32,
    pub stderr: String,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Returns the first failed stage, if any.
pub fn first_failure(results: &[StageResult]) -> Option<&StageResult> {
    results.iter().find(|r| !r.succeeded())
}

/// Runs a chain of stages wired through pipes and waits for all of them.
///
/// Results come back in stage order. A nonzero exit code is not an error at
/// this level; callers inspect the codes. Only a failure to spawn or to wire
/// the pipes is.
pub async fn run(stages: Vec<Stage>) -> Result<Vec<StageResult>> {
    let count = stages.len();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut children = Vec::with_capacity(count);
    let mut names = Vec::with_capacity(count);
    let mut upstream: Option<Stdio> = None;

    for (idx, stage) in stages.into_iter().enumerate() {
        let Stage { name, mut cmd } = stage;
        let last = idx == count - 1;

        match upstream.take() {
            Some(stdin) => cmd.stdin(stdin),
            None => cmd.stdin(Stdio::null()),
        };
        cmd.stdout(if last { Stdio::null() } else { Stdio::piped() });
        cmd.stderr(Stdio::piped());

        debug!("Starting pipeline stage '{}'", name);
        let mut child = cmd.spawn().map_err(|err| {
            AgentError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to spawn stage '{}': {}", name, err),
            ))
        })?;

        if !last {
            let stdout = child.stdout.take().ok_or_else(|| {
                AgentError::Job(format!("stage '{}' has no stdout to wire", name))
            })?;
            // Moving the fd into the next command drops the parent's copy.
            upstream = Some(TryInto::<Stdio>::try_into(stdout)?);
        }

        names.push(name);
        children.push(child);
    }

    // Drain stderr concurrently so a chatty stage can't fill its pipe and
    // stall the chain while we block in wait() below.
    let mut drains = Vec::with_capacity(count);
    for child in children.iter_mut() {
        let mut stderr = child.stderr.take();
        drains.push(tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        }));
    }

    let mut results = Vec::with_capacity(count);
    for (idx, mut child) in children.into_iter().enumerate() {
        let status = child.wait().await?;
        let stderr = match (&mut drains[idx]).await {
            Ok(buf) if buf.is_empty() => "no output".to_string(),
            Ok(buf) => buf,
            Err(_) => "failed to capture output".to_string(),
        };
        results.push(StageResult {
            name: names[idx],
            code: status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_stage() {
        let results = run(vec![Stage::new("true", "true")]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].succeeded());
        assert_eq!(results[0].stderr, "no output");
    }

    #[tokio::test]
    async fn test_three_stage_chain() {
        let results = run(vec![
            Stage::new("echo", "echo").arg("hello"),
            Stage::new("cat1", "cat"),
            Stage::new("cat2", "cat"),
        ])
        .await
        .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(StageResult::succeeded));
        assert!(first_failure(&results).is_none());
    }

    #[tokio::test]
    async fn test_failed_stage_reports_code_and_stderr() {
        let results = run(vec![
            Stage::new("echo", "echo").arg("data"),
            Stage::new("boom", "sh").args(["-c", "echo failure detail >&2; exit 3"]),
        ])
        .await
        .unwrap();
        let failed = first_failure(&results).unwrap();
        assert_eq!(failed.name, "boom");
        assert_eq!(failed.code, 3);
        assert!(failed.stderr.contains("failure detail"));
    }

    #[tokio::test]
    async fn test_spawn_error_is_error() {
        let err = run(vec![Stage::new("missing", "/nonexistent/program")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_empty_chain() {
        assert!(run(Vec::new()).await.unwrap().is_empty());
    }
}
