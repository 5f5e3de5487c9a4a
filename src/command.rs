use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

use crate::FuzzedChild;
use crate::error::LaunchError;
use crate::options::LaunchOptions;
use crate::os_impl::spawn_impl;

/// Builder for one fuzzed launch.
///
/// Collects the target command line plus the [`LaunchOptions`] handed to
/// the fault-injection library, then [`spawn`](Self::spawn)s the target
/// with its three channels already wired. The target's standard output and
/// standard error belong to the channels, so there are no stdio knobs
/// here.
#[derive(Debug)]
pub struct FuzzCommand {
    pub(crate) program: OsString,
    pub(crate) args: Vec<OsString>,
    pub(crate) envs: HashMap<OsString, OsString>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) options: LaunchOptions,
}

impl FuzzCommand {
    /// Start building a launch of `program`. The target starts from a
    /// snapshot of the controller's environment taken here; later changes
    /// to the controller's environment do not leak in.
    pub fn new<S: AsRef<OsStr>>(program: S) -> FuzzCommand {
        FuzzCommand {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: std::env::vars_os().collect(),
            cwd: None,
            options: LaunchOptions::default(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut FuzzCommand {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut FuzzCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut FuzzCommand
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .insert(key.as_ref().to_os_string(), val.as_ref().to_os_string());
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut FuzzCommand
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs.extend(
            vars.into_iter()
                .map(|(key, val)| (key.as_ref().to_os_string(), val.as_ref().to_os_string())),
        );
        self
    }

    pub fn env_remove<K: AsRef<OsStr>>(&mut self, key: K) -> &mut FuzzCommand {
        self.envs.remove(key.as_ref());
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut FuzzCommand {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Replace the fuzzing parameters for this launch.
    pub fn options(&mut self, options: LaunchOptions) -> &mut FuzzCommand {
        self.options = options;
        self
    }

    /// Launch the target with the fault-injection library forced in and
    /// the debug, stderr and stdout channels connected.
    pub async fn spawn(self) -> Result<FuzzedChild, LaunchError> {
        spawn_impl(self).await
    }

    /// Resolve the program name to a full path using `PATH` and cwd.
    pub fn resolve_program(&mut self) -> io::Result<()> {
        self.program = which::which_in(
            self.program.as_os_str(),
            self.envs.get(OsStr::new("PATH")),
            if let Some(cwd) = &self.cwd {
                cwd.clone()
            } else {
                std::env::current_dir()?
            },
        )
        .map_err(|err| io::Error::new(io::ErrorKind::NotFound, err))?
        .into_os_string();
        Ok(())
    }

    /// The argv the target is executed with, program first.
    pub(crate) fn command_line(&self) -> Vec<OsString> {
        let mut line = Vec::with_capacity(self.args.len() + 1);
        line.push(self.program.clone());
        line.extend(self.args.iter().cloned());
        line
    }

    #[cfg(unix)]
    pub(crate) fn into_tokio_command(self) -> tokio::process::Command {
        let mut tokio_command = tokio::process::Command::new(self.program);
        if let Some(cwd) = &self.cwd {
            tokio_command.current_dir(cwd);
        }
        tokio_command.args(self.args);
        tokio_command.env_clear();
        tokio_command.envs(self.envs);
        tokio_command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherits_a_snapshot_of_the_environment() {
        // PATH is in every sane test environment
        let command = FuzzCommand::new("target");
        assert_eq!(
            command.envs.get(OsStr::new("PATH")),
            std::env::var_os("PATH").as_ref(),
        );
    }

    #[test]
    fn env_edits_apply_to_the_snapshot() {
        let mut command = FuzzCommand::new("target");
        command.env("GARBLE_TEST_MARKER", "1");
        command.env_remove("PATH");
        assert_eq!(
            command.envs.get(OsStr::new("GARBLE_TEST_MARKER")),
            Some(&OsString::from("1")),
        );
        assert_eq!(command.envs.get(OsStr::new("PATH")), None);
        // the controller itself is untouched
        assert!(std::env::var_os("GARBLE_TEST_MARKER").is_none());
        assert!(std::env::var_os("PATH").is_some());
    }

    #[test]
    fn command_line_starts_with_the_program() {
        let mut command = FuzzCommand::new("target");
        command.arg("-x").args(["one", "two"]);
        assert_eq!(command.command_line(), ["target", "-x", "one", "two"]);
    }
}
