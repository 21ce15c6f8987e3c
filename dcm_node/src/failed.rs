//! Quarantine for files that could not be parsed, placed or transmitted.
//! A quarantined file is preserved under `failed/` together with an
//! `.error` sibling describing what happened; nothing is silently lost.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{error, info};

/// Moves `path` into the failed directory under a timestamped name and
/// writes the `.error` sibling (message, originating context, original
/// path, timestamp). Best-effort: quarantine failures are logged, never
/// propagated.
pub fn quarantine(failed_dir: &Path, path: &Path, context: &str, message: &str) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(failed_dir) {
        error!("Unable to create failed directory {failed_dir:?}: {e}");
        return;
    }
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed.dcm".to_string());
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let dest = failed_dir.join(format!("{timestamp}_{basename}"));

    if let Err(e) = move_file(path, &dest) {
        error!("Unable to move {path:?} to failed: {e}");
        return;
    }

    let error_file = error_sibling(&dest);
    let body = format!(
        "{message}\nContext: {context}\nOriginal path: {}\nTimestamp: {}\n",
        path.display(),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
    );
    if let Err(e) = std::fs::write(&error_file, body) {
        error!("Unable to write error sibling {error_file:?}: {e}");
    }
    info!("File quarantined: {} -> {}", path.display(), dest.display());
}

fn error_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".error");
    PathBuf::from(name)
}

// Rename first, fall back to copy+remove across filesystems.
fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)?;
    std::fs::remove_file(src)
}
