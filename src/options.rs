use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the fault-injection library reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionMode {
    /// Force the library into the target process, through the dynamic
    /// loader's preload variable or through entry-point injection.
    #[default]
    Preload,
    /// The controller corrupts copies of the inputs itself. No preload
    /// variable is installed for the target.
    Copy,
}

/// Fuzzing parameters for one launch, fixed before the target exists.
///
/// The numeric fields travel to the fault-injection library through the
/// environment contract in [`env`](crate::env).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LaunchOptions {
    pub mode: InjectionMode,
    /// Seed of the pseudo-random corruption stream.
    pub seed: u32,
    /// Lowest fraction of bytes to corrupt, in `[0, 1]`.
    pub min_ratio: f64,
    /// Highest fraction of bytes to corrupt, in `[0, 1]`.
    pub max_ratio: f64,
    /// Address-space ceiling for the target, in mebibytes.
    pub max_memory_mb: Option<u64>,
    /// CPU-time ceiling for the target, in seconds. The hard limit is set
    /// five seconds higher so the target can catch the soft-limit signal.
    pub max_cpu_seconds: Option<u64>,
    /// Path the controller itself was invoked as. A path with a directory
    /// component lets the library resolver probe for a colocated build.
    pub original_argv0: PathBuf,
    /// How long the injector waits for the suspended target to spin at its
    /// entry point before giving up.
    pub entry_wait: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        LaunchOptions {
            mode: InjectionMode::default(),
            seed: 0,
            min_ratio: 0.004,
            max_ratio: 0.004,
            max_memory_mb: None,
            max_cpu_seconds: None,
            original_argv0: env::args_os().next().map(PathBuf::from).unwrap_or_default(),
            entry_wait: Duration::from_secs(10),
        }
    }
}
