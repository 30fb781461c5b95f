use std::path::{Path, PathBuf};

/// Directory the project layout is rooted at: the crate directory, fixed at build time.
///
/// Paths are resolved against it rather than the caller's working directory, so the
/// converter finds `lib/` and `assets/` wherever it is launched from.
pub fn program_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Joins `path` onto `base_dir` unless it is already absolute.
pub fn absolute(base_dir: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
