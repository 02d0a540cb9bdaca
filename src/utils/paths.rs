use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

fn dir_from_env(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

/// Root directory for launcher-side state: `OTOSHI_ROOT_DIR`, then a
/// portable install next to the executable, then the working directory.
pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = dir_from_env("OTOSHI_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    PathBuf::from(".")
}

pub fn resolve_log_dir() -> Option<PathBuf> {
    if let Some(dir) = dir_from_env("OTOSHI_LOG_DIR") {
        return Some(dir);
    }

    let root = resolve_root_dir();
    if let Some(found) = ensure_dir(&root.join("logs")) {
        return Some(found);
    }

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("logs")))
        .and_then(|candidate| ensure_dir(&candidate))
}
