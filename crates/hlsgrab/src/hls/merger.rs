//! Reassembly of completed segments into the final output file.
//!
//! The external tool gets an ordered `file_list.txt` and is judged only by its
//! exit status and whether the output file exists afterwards.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{FILE_LIST_NAME, MergeTool};
use crate::error::JobError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Joins segment files, in the given order, into `output`.
#[async_trait]
pub trait Concatenator: Send + Sync {
    fn name(&self) -> &str;

    async fn concat(&self, work_dir: &Path, inputs: &[PathBuf], output: &Path)
    -> Result<(), JobError>;
}

/// Locate an executable. Names without a directory part are searched on `PATH`.
pub fn find_program(candidate: &Path) -> Option<PathBuf> {
    let has_dir = candidate
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty());
    if has_dir {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let full = dir.join(candidate);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = full.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

/// Build the concatenator for the configured tool.
pub fn concatenator_for(tool: &MergeTool) -> Result<Box<dyn Concatenator>, JobError> {
    match tool {
        MergeTool::External { candidates } => Ok(Box::new(FfmpegConcat::discover(candidates)?)),
        MergeTool::Binary => Ok(Box::new(BinaryConcat)),
    }
}

fn list_entry(work_dir: &Path, input: &Path) -> String {
    // The concat demuxer resolves relative entries against the list's directory.
    let shown = match (input.strip_prefix(work_dir), input.file_name()) {
        (Ok(_), Some(name)) => PathBuf::from(name),
        _ => input.to_path_buf(),
    };
    let escaped = shown.to_string_lossy().replace('\'', r"'\''");
    format!("file '{escaped}'")
}

/// Write the ordered input list for the concat demuxer.
pub async fn write_file_list(work_dir: &Path, inputs: &[PathBuf]) -> Result<PathBuf, JobError> {
    let list_path = work_dir.join(FILE_LIST_NAME);
    let mut content = String::new();
    for input in inputs {
        content.push_str(&list_entry(work_dir, input));
        content.push('\n');
    }
    tokio::fs::write(&list_path, content).await?;
    Ok(list_path)
}

/// `ffmpeg -f concat` stream copy.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    program: PathBuf,
}

impl FfmpegConcat {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The first candidate that resolves to an executable.
    pub fn discover(candidates: &[PathBuf]) -> Result<Self, JobError> {
        candidates
            .iter()
            .find_map(|c| find_program(c))
            .map(Self::new)
            .ok_or_else(|| {
                let tried = candidates
                    .iter()
                    .map(|c| c.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                JobError::merge(format!("no concat tool found (tried: {tried})"))
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build_args(list_path: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-f", "concat", "-safe", "0", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(list_path.as_os_str().to_owned());
        args.extend(["-c", "copy"].map(OsString::from));
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Concatenator for FfmpegConcat {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn concat(
        &self,
        work_dir: &Path,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(), JobError> {
        let list_path = write_file_list(work_dir, inputs).await?;
        let args = Self::build_args(&list_path, output);
        debug!(program = %self.program.display(), ?args, "Running concat tool");

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }

        let result = command.output().await.map_err(|e| {
            JobError::merge(format!("failed to run {}: {e}", self.program.display()))
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
            return Err(JobError::merge(format!(
                "{} exited with {}: {tail}",
                self.program.display(),
                result.status
            )));
        }
        Ok(())
    }
}

/// Byte-level append. Valid for MPEG-TS segments, which are self-delimiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryConcat;

#[async_trait]
impl Concatenator for BinaryConcat {
    fn name(&self) -> &str {
        "binary"
    }

    async fn concat(
        &self,
        _work_dir: &Path,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(), JobError> {
        let mut out = tokio::fs::File::create(output).await?;
        for input in inputs {
            let mut file = tokio::fs::File::open(input).await.map_err(|e| {
                JobError::merge(format!("cannot open {}: {e}", input.display()))
            })?;
            tokio::io::copy(&mut file, &mut out).await?;
        }
        out.flush().await?;
        Ok(())
    }
}

/// Runs the concatenator and cleans up after it.
pub struct Reassembler {
    concatenator: Box<dyn Concatenator>,
}

impl Reassembler {
    pub fn new(concatenator: Box<dyn Concatenator>) -> Self {
        Self { concatenator }
    }

    pub fn from_tool(tool: &MergeTool) -> Result<Self, JobError> {
        concatenator_for(tool).map(Self::new)
    }

    /// Merge `completed` (already in index order) into `output`.
    pub async fn merge(
        &self,
        work_dir: &Path,
        completed: &[(usize, PathBuf)],
        output: &Path,
    ) -> Result<(), JobError> {
        let inputs: Vec<PathBuf> = completed.iter().map(|(_, p)| p.clone()).collect();
        info!(
            tool = self.concatenator.name(),
            segments = inputs.len(),
            output = %output.display(),
            "Merging segments"
        );

        self.concatenator.concat(work_dir, &inputs, output).await?;

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.is_file() => {
                info!(output = %output.display(), bytes = meta.len(), "Merge complete");
                Ok(())
            }
            _ => Err(JobError::merge(format!(
                "output file {} was not produced",
                output.display()
            ))),
        }
    }

    /// Remove segment files and the file list. Missing files are ignored.
    pub async fn cleanup(&self, work_dir: &Path, completed: &[(usize, PathBuf)]) {
        let list = work_dir.join(FILE_LIST_NAME);
        let paths = completed.iter().map(|(_, p)| p.as_path()).chain([list.as_path()]);
        let mut removed = 0usize;
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove intermediate file"),
            }
        }
        debug!(removed, "Removed intermediate files");
    }
}
