//! Locates the fault-injection library on disk and splices it into the
//! dynamic loader's preload variable.
//!
//! A controller started as `./build/garble` probes for a library sitting
//! next to its own binary, so a freshly built pair can be tested without
//! installing anything. A controller started through `PATH` lookup skips
//! the probe and takes the system copy.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use log::debug;
use nix::unistd::{AccessFlags, access};

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        pub(crate) const PRELOAD_VAR: &str = "DYLD_INSERT_LIBRARIES";
        pub(crate) const LIBRARY_FILE: &str = "libgarble.dylib";
    } else {
        pub(crate) const PRELOAD_VAR: &str = "LD_PRELOAD";
        pub(crate) const LIBRARY_FILE: &str = "libgarble.so";
    }
}

/// Fallback directory when no colocated copy is readable.
const SYSTEM_LIBDIR: &str = "/usr/local/lib";

/// Install the preload variables into one child's environment map. Only
/// that map changes; the controller's own environment is never touched.
pub(crate) fn install(envs: &mut HashMap<OsString, OsString>, original_argv0: &Path) {
    let library = resolve_library(original_argv0);
    debug!("preloading fault-injection library {}", library.display());
    let merged = merge_preload(envs.get(OsStr::new(PRELOAD_VAR)).map(OsString::as_os_str), &library);
    envs.insert(PRELOAD_VAR.into(), merged);
    // Without a flat namespace the interposed symbols never shadow the
    // two-level originals.
    #[cfg(target_os = "macos")]
    envs.insert("DYLD_FORCE_FLAT_NAMESPACE".into(), "1".into());
}

/// Compute the library path for a controller invoked as `original_argv0`.
///
/// The colocated probe runs only when the path carries a directory
/// component. A bare program name was found through `PATH`, and a library
/// picked up relative to the current directory would be whatever happens
/// to be lying there.
pub(crate) fn resolve_library(original_argv0: &Path) -> PathBuf {
    let has_directory = original_argv0
        .parent()
        .is_some_and(|dir| !dir.as_os_str().is_empty());
    if has_directory {
        let colocated = original_argv0.with_file_name(LIBRARY_FILE);
        if is_readable(&colocated) {
            return colocated;
        }
    }
    Path::new(SYSTEM_LIBDIR).join(LIBRARY_FILE)
}

/// Append `library` to an existing preload list. Entries already present
/// stay first so they keep interposition priority.
pub(crate) fn merge_preload(existing: Option<&OsStr>, library: &Path) -> OsString {
    match existing {
        Some(prior) if !prior.is_empty() => {
            let mut merged = prior.to_os_string();
            merged.push(":");
            merged.push(library);
            merged
        }
        _ => library.as_os_str().to_os_string(),
    }
}

fn is_readable(path: &Path) -> bool {
    access(path, AccessFlags::R_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn system_library() -> PathBuf {
        Path::new(SYSTEM_LIBDIR).join(LIBRARY_FILE)
    }

    #[test]
    fn bare_program_name_takes_the_system_copy() {
        assert_eq!(resolve_library(Path::new("garble")), system_library());
        assert_eq!(resolve_library(Path::new("")), system_library());
    }

    #[test]
    fn colocated_library_wins_when_readable() {
        let dir = tempfile::tempdir().unwrap();
        let colocated = dir.path().join(LIBRARY_FILE);
        fs::write(&colocated, b"not really a library").unwrap();
        assert_eq!(resolve_library(&dir.path().join("garble")), colocated);
    }

    #[test]
    fn unreadable_colocated_library_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_library(&dir.path().join("garble")),
            system_library(),
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let argv0 = dir.path().join("garble");
        fs::write(dir.path().join(LIBRARY_FILE), b"x").unwrap();
        assert_eq!(resolve_library(&argv0), resolve_library(&argv0));
    }

    #[test]
    fn merge_keeps_existing_entries_first() {
        let merged = merge_preload(Some(OsStr::new("/a/libx.so")), Path::new("/b/liby.so"));
        assert_eq!(merged, OsString::from("/a/libx.so:/b/liby.so"));
    }

    #[test]
    fn merge_with_nothing_prior_is_the_library_alone() {
        let library = Path::new("/b/liby.so");
        assert_eq!(merge_preload(None, library), library.as_os_str());
        assert_eq!(merge_preload(Some(OsStr::new("")), library), library.as_os_str());
    }

    #[test]
    fn install_appends_to_the_child_map_only() {
        let dir = tempfile::tempdir().unwrap();
        let colocated = dir.path().join(LIBRARY_FILE);
        fs::write(&colocated, b"x").unwrap();

        let mut envs: HashMap<OsString, OsString> =
            [(OsString::from(PRELOAD_VAR), OsString::from("/a/libx.so"))]
                .into_iter()
                .collect();
        install(&mut envs, &dir.path().join("garble"));

        let mut expected = OsString::from("/a/libx.so:");
        expected.push(&colocated);
        assert_eq!(envs.get(OsStr::new(PRELOAD_VAR)), Some(&expected));
        // the probe file exists, yet the controller's own environment is
        // untouched
        assert_ne!(std::env::var_os(PRELOAD_VAR), Some(expected));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn install_forces_a_flat_namespace() {
        let mut envs = HashMap::new();
        install(&mut envs, Path::new("garble"));
        assert_eq!(
            envs.get(OsStr::new("DYLD_FORCE_FLAT_NAMESPACE")),
            Some(&OsString::from("1")),
        );
    }
}
