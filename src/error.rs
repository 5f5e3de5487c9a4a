use std::io;
use std::time::Duration;

use thiserror::Error;

/// Ways a launch can fail before the caller holds a [`FuzzedChild`].
///
/// [`FuzzedChild`]: crate::FuzzedChild
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A communication channel could not be allocated. No process was
    /// created.
    #[error("cannot create communication channel: {0}")]
    Channel(#[source] io::Error),
    /// Process creation failed. No process is left running.
    #[error("cannot launch target process: {0}")]
    Spawn(#[source] io::Error),
    /// The fault-injection library could not be forced into the target.
    /// The half-initialized target has already been terminated.
    #[error("cannot inject fault-injection library: {0}")]
    Inject(#[from] InjectError),
}

/// Failures of the entry-point injection protocol.
#[derive(Debug, Error)]
pub enum InjectError {
    /// A system call of the protocol failed, identified by name.
    #[error("{step} failed: {source}")]
    Os {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    /// The target's loader image does not parse as a program image.
    #[error("malformed target image: {0}")]
    BadImage(&'static str),
    /// The loader module or its entry we patch a call to is missing.
    #[error("no export `{symbol}` reachable in {module}")]
    SymbolNotFound { module: String, symbol: String },
    /// The target returned fewer bytes than requested. Nothing was patched
    /// based on the partial data.
    #[error("short read from target memory at {addr:#x}: {got}/{want} bytes")]
    ShortRead { addr: u64, want: usize, got: usize },
    /// Fewer bytes than requested reached the target. The written region
    /// must be treated as undefined.
    #[error("short write to target memory at {addr:#x}: {got}/{want} bytes")]
    ShortWrite { addr: u64, want: usize, got: usize },
    /// The suspended target never spun at its entry point. It has likely
    /// crashed inside its own loader.
    #[error("target did not reach its entry point within {0:?}")]
    EntryPointTimeout(Duration),
}
