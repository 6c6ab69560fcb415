//! Expands the command template and runs the bundled application.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::LazyLock,
};

use cfg_if::cfg_if;
use regex::{NoExpand, Regex};
use tracing::{debug, info};
use which::which;

use crate::error::LaunchError;


static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*caxa\s*\}\}").expect("placeholder pattern is valid")
});

/// How the child finished. Either way its status is the wrapper's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ChildOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ChildOutcome::Exited(code) => code,
            ChildOutcome::Signaled(signal) => 128 + signal,
        }
    }
}

/// Replaces every `{{caxa}}` marker with `app_dir`, verbatim.
pub fn substitute(command: &[String], app_dir: &Path) -> Result<Vec<String>, LaunchError> {
    let app_dir = app_dir.to_str()
        .ok_or_else(|| LaunchError::NonUnicodePath(app_dir.to_path_buf()))?;
    Ok(command.iter()
        .map(|part| PLACEHOLDER.replace_all(part, NoExpand(app_dir)).into_owned())
        .collect())
}

pub fn build_argv<I>(command: &[String], app_dir: &Path, forwarded: I) -> Result<Vec<OsString>, LaunchError>
where
    I: IntoIterator<Item = OsString>,
{
    let mut argv: Vec<OsString> = substitute(command, app_dir)?
        .into_iter()
        .map(OsString::from)
        .collect();
    argv.extend(forwarded);
    if argv.is_empty() {
        return Err(LaunchError::EmptyCommand)
    }
    Ok(argv)
}

/// Spawns the expanded command with inherited stdio and waits for it.
pub fn run<I>(command: &[String], app_dir: &Path, forwarded: I) -> Result<ChildOutcome, LaunchError>
where
    I: IntoIterator<Item = OsString>,
{
    let argv = build_argv(command, app_dir, forwarded)?;
    let Some((program, args)) = argv.split_first() else {
        return Err(LaunchError::EmptyCommand)
    };
    let path = resolve_program(program)?;
    debug!(program = %path.display(), args = args.len(), "launching");

    let mut cmd = Command::new(&path);
    cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::process::CommandExt;
            // the child sees the name as written, not the PATH lookup result
            cmd.arg0(program);
        }
    }
    let status = cmd
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|source| LaunchError::Spawn {
            program: path.display().to_string(),
            source,
        })?;
    Ok(outcome(status))
}

/// Bare names are looked up on `PATH` so a missing program gets a clear error.
fn resolve_program(program: &OsString) -> Result<PathBuf, LaunchError> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return Ok(path.to_path_buf())
    }
    which(program).map_err(|_| LaunchError::NotFound {
        program: program.to_string_lossy().into_owned(),
    })
}

fn outcome(status: ExitStatus) -> ChildOutcome {
    if let Some(code) = status.code() {
        return ChildOutcome::Exited(code)
    }
    cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::process::ExitStatusExt;
            use nix::sys::signal::Signal;
            if let Some(signal) = status.signal() {
                let name = Signal::try_from(signal).map(Signal::as_str).unwrap_or("unknown");
                info!(signal = name, "child terminated by signal");
                return ChildOutcome::Signaled(signal)
            }
        }
    }
    ChildOutcome::Exited(1)
}
