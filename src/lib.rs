//! Launches target programs for an I/O fault-injection fuzzer.
//!
//! A [`FuzzCommand`] spawns the target with the fault-injection library
//! forced into it: through the dynamic loader's preload variable on unix,
//! through entry-point injection into the suspended process on windows.
//! The fuzzing parameters travel in the environment (see [`env`]), and the
//! target's debug, stderr and stdout streams come back over three
//! dedicated [`Channels`] the controller reads to EOF.
//!
//! ```no_run
//! use garble::{FuzzCommand, LaunchOptions};
//! use tokio::io::AsyncReadExt as _;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut command = FuzzCommand::new("target-app");
//! command.arg("input.file").options(LaunchOptions {
//!     seed: 1234,
//!     max_ratio: 0.01,
//!     ..LaunchOptions::default()
//! });
//! let mut child = command.spawn().await?;
//!
//! let mut debug = Vec::new();
//! child.channels.debug.read_to_end(&mut debug).await?;
//! let _status = child.wait().await?;
//! # Ok(())
//! # }
//! ```

mod command;
pub mod env;
mod error;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
mod inject;
mod options;
#[cfg(unix)]
mod preload;

#[cfg(unix)]
#[path = "./unix/mod.rs"]
mod os_impl;

#[cfg(target_os = "windows")]
#[path = "./windows/mod.rs"]
mod os_impl;

use std::ffi::OsString;
use std::fmt;
use std::io;

pub use command::FuzzCommand;
pub use error::{InjectError, LaunchError};
pub use options::{InjectionMode, LaunchOptions};
#[cfg(unix)]
pub use os_impl::DEBUG_FD;
pub use os_impl::{ChannelReader, ExitStatus};

/// Read ends of the three streams a fuzzed target writes, in the order the
/// launcher creates them. Each reader reaches EOF once every process
/// holding the matching write end has exited.
pub struct Channels {
    /// Diagnostics the fault-injection library emits, separated from
    /// whatever the target prints itself.
    pub debug: ChannelReader,
    pub stderr: ChannelReader,
    pub stdout: ChannelReader,
}

/// A running fuzzed target.
pub struct FuzzedChild {
    /// OS process identifier, fixed at spawn.
    pub id: u32,
    /// The argv the target was executed with, program first.
    pub command_line: Vec<OsString>,
    pub channels: Channels,
    handle: os_impl::ChildHandle,
}

impl fmt::Debug for FuzzedChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuzzedChild")
            .field("id", &self.id)
            .field("command_line", &self.command_line)
            .finish_non_exhaustive()
    }
}

impl FuzzedChild {
    /// Wait for the target to exit. Does not close the channels; buffered
    /// stream data stays readable afterwards.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.handle.wait().await
    }

    /// Forcibly terminate the target.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.handle.kill().await
    }
}
