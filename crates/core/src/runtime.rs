use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(target_os = "linux")]
const ORT_LIB_PREFIX: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_PREFIX: &str = "libonnxruntime";
#[cfg(windows)]
const ORT_LIB_PREFIX: &str = "onnxruntime";

/// Search directories for the ONNX Runtime shared library.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

/// `libonnxruntime.so`, `libonnxruntime.so.1.20.1`, `libonnxruntime.dylib`,
/// `libonnxruntime.1.20.1.dylib` or `onnxruntime.dll`; provider libraries
/// (`libonnxruntime_providers_*`) never match.
fn is_ort_dylib_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(ORT_LIB_PREFIX) else {
        return false;
    };
    #[cfg(target_os = "linux")]
    {
        rest.is_empty() || rest.starts_with('.')
    }
    #[cfg(target_os = "macos")]
    {
        rest.starts_with('.') && rest.ends_with(".dylib")
    }
    #[cfg(windows)]
    {
        rest.eq_ignore_ascii_case(".dll")
    }
}

/// First directory holding an ONNX Runtime library wins; within a directory
/// the unversioned name is preferred, then the lexically greatest version.
fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .map(|name| is_ort_dylib_name(&name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        matches.sort_by_key(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (name.len() != ORT_LIB_PREFIX.len(), std::cmp::Reverse(name))
        });
        if let Some(found) = matches.into_iter().next() {
            return Some(found);
        }
    }
    None
}

/// Export `ORT_DYLIB_PATH` when unset and a bundled library is found.
///
/// Call this at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

/// Log which runtime library was resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set, ORT will try default search paths"),
    }
}
