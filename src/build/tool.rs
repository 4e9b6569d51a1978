//! Blocking invocation of the external tools.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::error::{BuildError, BuildResult, ToolOutput};

/// One command line for an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Short name used for the log file (`<logs>/<name>.log`).
    name: &'static str,
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(name: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            name,
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The command line as it would be typed, for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| {
                let part = part.to_string_lossy();
                if part.contains(' ') {
                    format!("\"{part}\"")
                } else {
                    part.into_owned()
                }
            })
            .join(" ")
    }

    /// Run to completion and capture both output streams.
    ///
    /// A non-zero exit is not an error here; callers map it to their own error kind.
    /// When `logs_dir` is given, the command line and output are appended to the tool's
    /// log file.
    pub fn run(&self, logs_dir: Option<&Path>) -> BuildResult<ToolOutput> {
        debug!("running {}", self.command_line());

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|err| BuildError::Spawn {
            program: self.program.display().to_string(),
            err,
        })?;

        let result = ToolOutput {
            program: self
                .program
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.to_string()),
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", self.name, result.status);

        if let Some(logs_dir) = logs_dir {
            self.append_log(logs_dir, &result);
        }
        Ok(result)
    }

    fn append_log(&self, logs_dir: &Path, output: &ToolOutput) {
        let path = logs_dir.join(format!("{}.log", self.name));
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "$ {}\n{output}", self.command_line()));
        if let Err(e) = written {
            warn!("could not write {}: {e}", path.display());
        }
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    #[test]
    fn captures_streams_and_status() {
        let logs = tempfile::tempdir().unwrap();
        let output = ToolCommand::new("shell", "/bin/sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run(Some(logs.path()))
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let log = std::fs::read_to_string(logs.path().join("shell.log")).unwrap();
        assert!(log.contains("/bin/sh -c"));
        assert!(log.contains("exited with code 3"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ToolCommand::new("missing", "/no/such/tool").run(None).unwrap_err();
        assert!(matches!(err, BuildError::Spawn { .. }));
    }

    #[test]
    fn command_line_quotes_spaces() {
        let cmd = ToolCommand::new("vpk", "/tools/vpk").arg("-v").arg("/tmp/my pack");
        assert_eq!(cmd.command_line(), "/tools/vpk -v \"/tmp/my pack\"");
    }
}
