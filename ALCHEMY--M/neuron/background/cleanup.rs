use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, process::Command, time::timeout};
use tracing::{debug, error};

/// Tracking CLI invoked for cleanup.
pub const WANDB_PROGRAM: &str = "wandb";
/// Cache budget passed to the cache cleanup.
pub const CACHE_BUDGET: &str = "5GB";

/// Failure of one external cleanup command.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// The program could not be started or fed.
    #[error("running {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The program exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    Exit {
        /// Program name.
        program: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// The program ran past its deadline and was killed.
    #[error("{program} timed out")]
    TimedOut {
        /// Program name.
        program: String,
    },
}

/// Runs external cleanup commands.
#[async_trait]
pub trait CleanupRunner: Send + Sync {
    /// Runs `program` with `args`, writing `stdin` to it when given.
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<(), CleanupError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone, Copy)]
pub struct WandbCleanupRunner {
    timeout: Duration,
}

impl Default for WandbCleanupRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl WandbCleanupRunner {
    /// Runner killing commands that outlive `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CleanupRunner for WandbCleanupRunner {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<(), CleanupError> {
        let spawn_error = |source| CleanupError::Spawn {
            program: program.to_string(),
            source,
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(spawn_error)?;
        if let (Some(input), Some(pipe)) = (stdin, child.stdin.as_mut()) {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_error)?;
        }
        // close stdin so prompts see EOF after the answer
        drop(child.stdin.take());

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CleanupError::TimedOut {
                program: program.to_string(),
            })?
            .map_err(spawn_error)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CleanupError::Exit {
                program: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Result of one cleanup sweep.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The artifacts directory does not exist yet.
    MissingDirectory,
    /// No run folders were found.
    NothingToClean,
    /// Synced runs were cleaned and the cache trimmed.
    Cleaned {
        /// Run folders seen.
        runs: usize,
    },
    /// A cleanup command failed.
    Failed(String),
}

/// Prunes synced experiment runs and the artifact cache.
pub struct ArtifactJanitor {
    dir: PathBuf,
    runner: Arc<dyn CleanupRunner>,
}

impl std::fmt::Debug for ArtifactJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactJanitor")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ArtifactJanitor {
    /// Janitor for the artifacts directory `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, runner: Arc<dyn CleanupRunner>) -> Self {
        Self {
            dir: dir.into(),
            runner,
        }
    }

    /// Directory being swept.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Counts run folders (`run-*`, excluding `latest-run`).
    ///
    /// # Errors
    /// Propagates directory read failures, including a missing directory.
    pub async fn count_runs(&self) -> std::io::Result<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut runs = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains("run-") && !name.contains("latest-run") {
                runs += 1;
            }
        }
        Ok(runs)
    }

    /// Cleans synced runs and trims the artifact cache when runs are present.
    pub async fn sweep(&self) -> CleanupOutcome {
        let runs = match self.count_runs().await {
            Ok(runs) => runs,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "artifacts directory does not exist yet");
                return CleanupOutcome::MissingDirectory;
            }
            Err(err) => {
                error!(dir = %self.dir.display(), error = %err, "scanning artifacts failed");
                return CleanupOutcome::Failed(err.to_string());
            }
        };
        if runs == 0 {
            return CleanupOutcome::NothingToClean;
        }

        let sync_args = vec![
            "sync".to_string(),
            "--clean".to_string(),
            self.dir.display().to_string(),
        ];
        if let Err(err) = self.runner.run(WANDB_PROGRAM, &sync_args, Some("y\n")).await {
            error!(error = %err, "cleaning synced runs failed");
            return CleanupOutcome::Failed(err.to_string());
        }
        debug!(runs, "cleaned synced runs");

        let cache_args = ["artifact", "cache", "cleanup", CACHE_BUDGET].map(String::from);
        if let Err(err) = self.runner.run(WANDB_PROGRAM, &cache_args, None).await {
            error!(error = %err, "trimming artifact cache failed");
            return CleanupOutcome::Failed(err.to_string());
        }
        debug!(budget = CACHE_BUDGET, "trimmed artifact cache");
        CleanupOutcome::Cleaned { runs }
    }
}

/// Runner recording invocations instead of spawning processes.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingRunner {
    pub(crate) calls: parking_lot::Mutex<Vec<(String, Vec<String>, Option<String>)>>,
    pub(crate) fail: bool,
}

#[cfg(test)]
#[async_trait]
impl CleanupRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<(), CleanupError> {
        self.calls.lock().push((
            program.to_string(),
            args.to_vec(),
            stdin.map(str::to_string),
        ));
        if self.fail {
            return Err(CleanupError::Exit {
                program: program.to_string(),
                code: Some(1),
                stderr: "boom".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let tmp = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let janitor = ArtifactJanitor::new(tmp.path().join("wandb"), runner.clone());
        assert_eq!(janitor.sweep().await, CleanupOutcome::MissingDirectory);
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn latest_run_alone_needs_no_cleanup() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("latest-run")).unwrap();
        std::fs::create_dir(tmp.path().join("debug")).unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let janitor = ArtifactJanitor::new(tmp.path(), runner.clone());
        assert_eq!(janitor.sweep().await, CleanupOutcome::NothingToClean);
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn runs_are_synced_then_cache_trimmed() {
        let tmp = tempdir().unwrap();
        for name in ["run-20240101_000000-abc", "offline-run-20240102_000000-def", "latest-run"] {
            std::fs::create_dir(tmp.path().join(name)).unwrap();
        }
        let runner = Arc::new(RecordingRunner::default());
        let janitor = ArtifactJanitor::new(tmp.path(), runner.clone());
        assert_eq!(janitor.sweep().await, CleanupOutcome::Cleaned { runs: 2 });

        let calls = runner.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, WANDB_PROGRAM);
        assert_eq!(calls[0].1[..2], ["sync".to_string(), "--clean".to_string()]);
        assert_eq!(calls[0].2.as_deref(), Some("y\n"));
        assert_eq!(calls[1].1, ["artifact", "cache", "cleanup", "5GB"].map(String::from));
        assert!(calls[1].2.is_none());
    }

    #[tokio::test]
    async fn command_failure_is_reported() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("run-1")).unwrap();
        let runner = Arc::new(RecordingRunner {
            fail: true,
            ..RecordingRunner::default()
        });
        let janitor = ArtifactJanitor::new(tmp.path(), runner.clone());
        assert!(matches!(janitor.sweep().await, CleanupOutcome::Failed(msg) if msg.contains("boom")));
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn process_runner_reports_missing_program() {
        let runner = WandbCleanupRunner::new(Duration::from_secs(5));
        let err = runner
            .run("definitely-not-a-real-program-4821", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::Spawn { .. }));
    }
}
