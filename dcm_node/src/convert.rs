//! External conversion of Enhanced MR objects to standard MR through the
//! dcm4che `emf2sf` tool. Fire-and-forget: the conversion runs on its own
//! thread, output is captured for the log, and a failing conversion sends
//! the source file down the failed path.

use std::path::PathBuf;
use std::process::Command;

use tracing::{error, info, warn};

use crate::failed;

/// Spawns the conversion of one Enhanced MR file in the background.
/// Converted frames land in a `converted/` directory next to the source
/// and are then moved beside it; the enhanced original is removed on
/// success.
pub fn spawn_enhanced_mr_conversion(emf2sf: PathBuf, source: PathBuf, failed_dir: PathBuf) {
    let _ = std::thread::Builder::new()
        .name("emf2sf".into())
        .spawn(move || {
            if let Err(message) = convert(&emf2sf, &source) {
                error!("Enhanced MR conversion failed for {source:?}: {message}");
                failed::quarantine(&failed_dir, &source, "enhanced MR conversion", &message);
            }
        });
}

fn convert(emf2sf: &PathBuf, source: &PathBuf) -> Result<(), String> {
    let parent = source
        .parent()
        .ok_or_else(|| "source file has no parent directory".to_string())?;
    let out_dir = parent.join("converted");
    std::fs::create_dir_all(&out_dir).map_err(|e| e.to_string())?;

    let output = Command::new(emf2sf)
        .arg("--out-dir")
        .arg(&out_dir)
        .arg(source)
        .output()
        .map_err(|e| format!("unable to start emf2sf: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "emf2sf exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    info!(
        "Enhanced MR converted: {source:?} ({})",
        String::from_utf8_lossy(&output.stdout).trim()
    );

    // move the converted frames next to the enhanced source
    for entry in std::fs::read_dir(&out_dir).map_err(|e| e.to_string())? {
        let entry = entry.map_err(|e| e.to_string())?;
        let dest = parent.join(entry.file_name());
        if let Err(e) = std::fs::rename(entry.path(), &dest) {
            warn!("Unable to move converted frame {:?}: {e}", entry.path());
        }
    }
    let _ = std::fs::remove_dir(&out_dir);

    if let Err(e) = std::fs::remove_file(source) {
        warn!("Unable to remove enhanced MR original {source:?}: {e}");
    }
    Ok(())
}
