//! Headless export toolchain invocation.
//!
//! The toolchain writes progress to both stdout and stderr. Both are attached
//! to the write end of one OS pipe so the caller sees a single stream in the
//! order the process produced it.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::sync::mpsc;

pub const PROJECT_FILE: &str = "project.godot";
pub const EXPORT_PRESET_NAME: &str = "Web";
pub const OUTPUT_FILE: &str = "index.html";

/// Lines buffered between the pipe reader and the consumer.
const LINE_BUFFER: usize = 256;

/// A fully resolved export invocation.
#[derive(Debug, Clone)]
pub struct ExportCommand {
    executable: PathBuf,
    project_file: PathBuf,
    output_file: PathBuf,
}

impl ExportCommand {
    pub fn new(executable: &Path, project_dir: &Path, output_dir: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            project_file: project_dir.join(PROJECT_FILE),
            output_file: output_dir.join(OUTPUT_FILE),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// `--headless <project> --export-release Web <output>`
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "--headless".into(),
            self.project_file.clone().into_os_string(),
            "--export-release".into(),
            EXPORT_PRESET_NAME.into(),
            self.output_file.clone().into_os_string(),
        ]
    }

    /// Launch the toolchain with stdout and stderr merged.
    pub fn spawn(&self) -> io::Result<ExportProcess> {
        let (reader, writer) = io::pipe()?;
        let writer_err = writer.try_clone()?;

        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));
        let child = cmd.spawn()?;
        // The command still owns our copies of the write end. Dropping it
        // leaves the child as the only writer, so EOF arrives when it exits.
        drop(cmd);

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        tokio::task::spawn_blocking(move || pump_lines(reader, tx));

        Ok(ExportProcess { child, lines })
    }
}

fn pump_lines(reader: io::PipeReader, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed reading export output");
                break;
            }
        }
    }
}

/// A running export. Read lines until `None`, then collect the exit code.
pub struct ExportProcess {
    child: tokio::process::Child,
    lines: mpsc::Receiver<String>,
}

impl ExportProcess {
    /// Next line of merged output, or `None` once the process closed its output.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Drain any unread output and wait for exit.
    ///
    /// A process terminated by a signal reports `-1`.
    pub async fn wait(mut self) -> io::Result<i32> {
        while self.lines.recv().await.is_some() {}
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_follow_export_convention() {
        let cmd = ExportCommand::new(
            Path::new("/opt/godot"),
            Path::new("/tmp/repo-1"),
            Path::new("/srv/builds/build-7"),
        );
        let args: Vec<String> = cmd
            .args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--headless",
                "/tmp/repo-1/project.godot",
                "--export-release",
                "Web",
                "/srv/builds/build-7/index.html",
            ]
        );
        assert_eq!(
            cmd.output_file(),
            Path::new("/srv/builds/build-7/index.html")
        );
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("toolchain.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_merges_stdout_and_stderr_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo one\necho two >&2\necho three");
        let cmd = ExportCommand::new(&exe, dir.path(), dir.path());

        let mut process = cmd.spawn().unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo failing >&2\nexit 3");
        let cmd = ExportCommand::new(&exe, dir.path(), dir.path());

        let mut process = cmd.spawn().unwrap();
        assert_eq!(process.next_line().await.as_deref(), Some("failing"));
        assert_eq!(process.wait().await.unwrap(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_drains_unread_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "i=0\nwhile [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done");
        let cmd = ExportCommand::new(&exe, dir.path(), dir.path());

        let process = cmd.spawn().unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_arguments_reach_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "for a in \"$@\"; do echo \"$a\"; done");
        let cmd = ExportCommand::new(&exe, Path::new("/p"), Path::new("/o"));

        let mut process = cmd.spawn().unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line);
        }
        assert_eq!(
            lines,
            vec!["--headless", "/p/project.godot", "--export-release", "Web", "/o/index.html"]
        );
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let cmd = ExportCommand::new(
            Path::new("/definitely/not/a/toolchain"),
            Path::new("/p"),
            Path::new("/o"),
        );
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async { cmd.spawn().map(|_| ()) });
        assert!(result.is_err());
    }
}
