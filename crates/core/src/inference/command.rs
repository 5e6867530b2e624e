// crates/core/src/inference/command.rs
//! Subprocess-backed pipeline: drives the SadTalker `inference.py` script.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{InferencePipeline, PipelineJob};
use crate::error::InferenceError;

const INFERENCE_SCRIPT: &str = "inference.py";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest stderr excerpt carried into an error message.
const MAX_MESSAGE_LEN: usize = 500;

/// Runs the external inference script as a child process.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    root: PathBuf,
    python: String,
    gpu: bool,
}

impl CommandPipeline {
    /// Create a pipeline rooted at `root`, probing for a GPU once.
    pub fn new(root: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            python: python.into(),
            gpu: probe_gpu(),
        }
    }

    /// Override the GPU probe result.
    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the command line for one job.
    pub fn command(&self, job: &PipelineJob<'_>) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.current_dir(&self.root)
            .arg(INFERENCE_SCRIPT)
            .arg("--driven_audio")
            .arg(job.audio)
            .arg("--source_image")
            .arg(job.image)
            .arg("--result_dir")
            .arg(job.result_dir)
            .arg("--preprocess")
            .arg(job.options.preprocess.as_str());
        if !self.gpu {
            cmd.arg("--cpu");
        }
        if job.options.still {
            cmd.arg("--still");
        }
        if job.options.use_enhancer {
            cmd.args(["--enhancer", "gfpgan"]);
        }
        cmd
    }
}

impl InferencePipeline for CommandPipeline {
    fn run(
        &self,
        job: &PipelineJob<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, InferenceError> {
        let mut cmd = self.command(job);
        tracing::info!(command = ?cmd, "Running inference pipeline");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InferenceError::Pipeline(format!("failed to launch {}: {e}", self.python)))?;

        // Drain stderr on its own thread so a chatty child never blocks on a
        // full pipe while we poll for exit.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(InferenceError::Pipeline(format!("lost child process: {e}"))),
            }
            if cancel.is_cancelled() {
                tracing::warn!(pid = child.id(), "Killing cancelled inference process");
                let _ = child.kill();
                let _ = child.wait();
                return Err(InferenceError::Pipeline("inference cancelled".into()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            tracing::error!(status = %status, stderr = %tail(&stderr), "Inference pipeline failed");
            return Err(classify_failure(&stderr));
        }

        find_video(job.result_dir)
            .ok_or_else(|| InferenceError::Pipeline("no output video generated".into()))
    }

    fn is_initialized(&self) -> bool {
        self.root.join(INFERENCE_SCRIPT).is_file()
    }

    fn gpu_available(&self) -> bool {
        self.gpu
    }
}

/// Map the pipeline's stderr onto the error taxonomy.
pub fn classify_failure(stderr: &str) -> InferenceError {
    let lower = stderr.to_ascii_lowercase();
    let message = tail(stderr);

    const EXHAUSTED: &[&str] = &[
        "out of memory",
        "cuda error",
        "cudnn_status",
        "no cuda gpus are available",
        "cuda driver",
    ];
    const DECODE: &[&str] = &[
        "cannot identify image file",
        "error opening",
        "could not read",
        "failed to load audio",
        "invalid data found when processing input",
        "no face is detected",
        "can not detect the landmark",
    ];

    if EXHAUSTED.iter().any(|needle| lower.contains(needle)) {
        InferenceError::ResourceExhausted(message)
    } else if DECODE.iter().any(|needle| lower.contains(needle)) {
        InferenceError::InputDecode(message)
    } else {
        InferenceError::Pipeline(message)
    }
}

/// Last non-empty stderr line, capped in length.
fn tail(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("pipeline exited with an error");
    line.chars().take(MAX_MESSAGE_LEN).collect()
}

fn find_video(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mp4")))
}

fn probe_gpu() -> bool {
    match Command::new("nvidia-smi").arg("-L").output() {
        Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).contains("GPU"),
        Err(_) => false,
    }
}
