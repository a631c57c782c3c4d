//! Stage that runs an external program.
//!
//! Arguments may contain the placeholders `{input}`, `{output}` and
//! `{job_id}`; the first two expand to filesystem paths of the artifacts, so
//! this stage needs a store with local paths (`FsArtifactStore`).

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wait_timeout::ChildExt;

use codeflow_core::ArtifactKey;

use super::{Stage, StageContext, StageError};

/// Where the program leaves its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The program writes the `{output}` path itself.
    #[default]
    File,
    /// Whatever the program prints on stdout becomes the output artifact.
    Stdout,
}

#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    output_mode: OutputMode,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
            output_mode: OutputMode::File,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    fn expand_args(&self, input: &Path, output: &Path, job_id: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{job_id}", job_id)
            })
            .collect()
    }
}

impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &StageContext<'_>) -> Result<ArtifactKey, StageError> {
        let input_path = ctx.store.local_path(ctx.input).ok_or_else(|| {
            StageError::failed(format!("artifact {} has no filesystem path", ctx.input))
        })?;
        let output_path = ctx.store.local_path(ctx.output).ok_or_else(|| {
            StageError::failed(format!("artifact {} has no filesystem path", ctx.output))
        })?;
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StageError::failed(e.to_string()))?;
        }

        let args = self.expand_args(&input_path, &output_path, &ctx.job_id.to_string());
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(match self.output_mode {
                OutputMode::File => Stdio::null(),
                OutputMode::Stdout => Stdio::piped(),
            });
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(stage = %self.name, program = %self.program, ?args, "spawning stage process");
        let mut child = cmd
            .spawn()
            .map_err(|e| StageError::Spawn(format!("{}: {e}", self.program)))?;

        // Drain pipes on their own threads so a chatty child never blocks on a
        // full pipe while we wait for it.
        let stderr = drain(child.stderr.take());
        let stdout = drain(child.stdout.take());

        let status = wait_with_timeout(&mut child, self.timeout)?;
        let stderr = join_drain(stderr);
        let stdout = join_drain(stdout);

        if !status.success() {
            return Err(StageError::Exit {
                status: status.to_string(),
                stderr,
            });
        }

        match self.output_mode {
            OutputMode::Stdout => ctx.store.put(ctx.output, &stdout)?,
            OutputMode::File => {
                if !output_path.is_file() {
                    return Err(StageError::MissingOutput(ctx.output.clone()));
                }
            }
        }

        Ok(ctx.output.clone())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, StageError> {
    let waited = match timeout {
        Some(timeout) => child.wait_timeout(timeout),
        None => child.wait().map(Some),
    };

    match waited {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(StageError::Timeout(timeout.unwrap_or_default()))
        }
        Err(e) => Err(StageError::failed(e.to_string())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::artifacts::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
    use codeflow_core::JobId;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<FsArtifactStore>,
        job_id: JobId,
        input: ArtifactKey,
        output: ArtifactKey,
    }

    fn fixture(content: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::open(dir.path()).unwrap());
        let job_id = JobId::new();
        let input = ArtifactKey::submission(job_id);
        store.put(&input, content).unwrap();
        let output = ArtifactKey::stage_output(job_id, 1, "cmd");
        Fixture {
            _dir: dir,
            store,
            job_id,
            input,
            output,
        }
    }

    fn run(stage: &CommandStage, fx: &Fixture) -> Result<ArtifactKey, StageError> {
        let ctx = StageContext {
            job_id: fx.job_id,
            position: 1,
            input: &fx.input,
            output: &fx.output,
            store: fx.store.as_ref(),
        };
        stage.run(&ctx)
    }

    #[test]
    fn program_writes_output_file() {
        let fx = fixture("contract C {}");
        let stage = CommandStage::new("copy", "sh").args([
            "-c",
            "tr a-z A-Z < \"$0\" > \"$1\"",
            "{input}",
            "{output}",
        ]);

        let key = run(&stage, &fx).unwrap();

        assert_eq!(key, fx.output);
        assert_eq!(fx.store.get(&fx.output).unwrap(), "CONTRACT C {}");
    }

    #[test]
    fn stdout_mode_captures_output() {
        let fx = fixture("ignored");
        let stage = CommandStage::new("echo", "sh")
            .args(["-c", "printf 42"])
            .output_mode(OutputMode::Stdout);

        run(&stage, &fx).unwrap();

        assert_eq!(fx.store.get(&fx.output).unwrap(), "42");
    }

    #[test]
    fn nonzero_exit_reports_stderr() {
        let fx = fixture("x");
        let stage = CommandStage::new("fails", "sh").args(["-c", "echo 'bad input' >&2; exit 3"]);

        let err = run(&stage, &fx).unwrap_err();

        match &err {
            StageError::Exit { stderr, .. } => assert_eq!(stderr.trim(), "bad input"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().ends_with("bad input"));
    }

    #[test]
    fn success_without_output_is_a_failure() {
        let fx = fixture("x");
        let stage = CommandStage::new("lazy", "sh").args(["-c", "true"]);

        let err = run(&stage, &fx).unwrap_err();

        assert_eq!(err, StageError::MissingOutput(fx.output.clone()));
    }

    #[test]
    fn slow_program_times_out() {
        let fx = fixture("x");
        let stage = CommandStage::new("slow", "sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));

        let started = Instant::now();
        let err = run(&stage, &fx).unwrap_err();

        assert_eq!(err, StageError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let fx = fixture("x");
        let stage = CommandStage::new("ghost", "/definitely/not/a/program");

        assert!(matches!(run(&stage, &fx), Err(StageError::Spawn(_))));
    }

    #[test]
    fn in_memory_store_cannot_back_commands() {
        let store = InMemoryArtifactStore::new();
        let job_id = JobId::new();
        let input = ArtifactKey::submission(job_id);
        let output = ArtifactKey::stage_output(job_id, 1, "cmd");
        let ctx = StageContext {
            job_id,
            position: 1,
            input: &input,
            output: &output,
            store: &store,
        };

        let err = CommandStage::new("cmd", "true").run(&ctx).unwrap_err();

        assert!(err.to_string().contains("no filesystem path"));
    }
}
