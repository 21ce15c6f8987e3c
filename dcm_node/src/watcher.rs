//! Watches the outgoing spool for dropped plan folders and hands them to
//! the send engine once they have been inactive long enough. Filesystem
//! events drive the fast path; a periodic rescan catches missed events, a
//! reaper removes aged-out empty folders and a heartbeat documents
//! liveness.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::DicomNode;
use crate::error::Result;
use crate::sender::SendEngine;
use crate::timer::TimerWheel;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub spool_root: PathBuf,
    pub inactivity: Duration,
    pub retry: Duration,
    pub rescan_interval: Duration,
    pub empty_dir_age: Duration,
    pub heartbeat: Duration,
    pub delete_after_send: bool,
}

struct WatcherState {
    config: WatcherConfig,
    target: DicomNode,
    sender: Arc<SendEngine>,
    /// Folders are transmitted one at a time.
    processing: Mutex<()>,
    stop: Arc<AtomicBool>,
}

impl WatcherState {
    fn failed_dir(&self) -> PathBuf {
        self.config.spool_root.join("failed")
    }
}

/// The running spool watcher; dropping or calling [`FolderWatcher::shutdown`]
/// stops every background thread.
pub struct FolderWatcher {
    state: Arc<WatcherState>,
    threads: Vec<JoinHandle<()>>,
    // keeps the notify subscription alive
    _fs_watcher: Option<RecommendedWatcher>,
}

impl FolderWatcher {
    pub fn start(
        config: WatcherConfig,
        target: DicomNode,
        sender: Arc<SendEngine>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.spool_root)?;
        let state = Arc::new(WatcherState {
            config,
            target,
            sender,
            processing: Mutex::new(()),
            stop,
        });

        // Fired folders go through a channel to the single processing
        // thread; requeues re-arm the wheel.
        let (tx, rx): (Sender<PathBuf>, Receiver<PathBuf>) = std::sync::mpsc::channel();
        let timers = {
            let tx = tx.clone();
            Arc::new(TimerWheel::new("folder-watcher", move |folder: PathBuf| {
                let _ = tx.send(folder);
            }))
        };

        let mut threads = Vec::new();
        threads.push(spawn_processing(Arc::clone(&state), Arc::clone(&timers), rx));
        threads.push(spawn_rescan(Arc::clone(&state), Arc::clone(&timers)));
        threads.push(spawn_reaper(Arc::clone(&state)));
        threads.push(spawn_heartbeat(Arc::clone(&state)));

        let fs_watcher = match subscribe_events(Arc::clone(&state), Arc::clone(&timers)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                // the periodic rescan still picks up everything, just slower
                error!("Filesystem watcher unavailable, relying on rescan alone: {e}");
                None
            }
        };

        info!(
            "Folder watcher started on {:?} (target {}, inactivity {:?})",
            state.config.spool_root,
            state.target.address(),
            state.config.inactivity
        );
        Ok(Self {
            state,
            threads,
            _fs_watcher: fs_watcher,
        })
    }

    pub fn shutdown(mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("Folder watcher stopped");
    }
}

fn subscribe_events(
    state: Arc<WatcherState>,
    timers: Arc<TimerWheel<PathBuf>>,
) -> notify::Result<RecommendedWatcher> {
    let root = state.config.spool_root.clone();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("Filesystem event error: {e}");
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in &event.paths {
            if !is_dcm(path) || path.starts_with(state.failed_dir()) {
                continue;
            }
            if let Some(folder) = enclosing_spool_folder(&state.config.spool_root, path) {
                debug!("Activity in {folder:?}, re-arming inactivity timer");
                timers.arm(folder, state.config.inactivity);
            }
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// The first-level directory under the spool root holding the given file.
fn enclosing_spool_folder(root: &Path, file: &Path) -> Option<PathBuf> {
    let relative = file.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    let candidate = root.join(first.as_os_str());
    if candidate.is_dir() {
        Some(candidate)
    } else {
        file.parent().map(|p| p.to_path_buf())
    }
}

fn is_dcm(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("dcm"))
        .unwrap_or(false)
}

fn spawn_processing(
    state: Arc<WatcherState>,
    timers: Arc<TimerWheel<PathBuf>>,
    rx: Receiver<PathBuf>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spool-processing".into())
        .spawn(move || loop {
            if state.stop.load(Ordering::SeqCst) {
                return;
            }
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(folder) => process_folder(&state, &timers, folder),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .expect("unable to spawn spool processing thread")
}

fn process_folder(state: &WatcherState, timers: &TimerWheel<PathBuf>, folder: PathBuf) {
    if state.stop.load(Ordering::SeqCst) || !folder.exists() {
        return;
    }
    let Ok(_guard) = state.processing.try_lock() else {
        debug!("Processing busy, requeueing {folder:?}");
        timers.arm(folder, state.config.retry);
        return;
    };

    let file_count = WalkDir::new(&folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file() && is_dcm(e.path()))
        .count();
    if file_count == 0 {
        debug!("No DICOM files in {folder:?} yet, rechecking after inactivity");
        timers.arm(folder, state.config.retry);
        return;
    }

    info!("Folder {folder:?} went quiet, sending {file_count} file(s)");
    match state
        .sender
        .send_folder(&folder, &state.target, state.config.delete_after_send)
    {
        Ok(summary) => {
            if !summary.failed.is_empty() {
                warn!(
                    "{} file(s) from {folder:?} were quarantined",
                    summary.failed.len()
                );
            }
        }
        Err(e) => error!("Unable to send folder {folder:?}: {e}"),
    }

    // every processing round ends with a reap pass
    reap_empty_dirs(
        &state.config.spool_root,
        state.config.empty_dir_age,
        &state.failed_dir(),
    );
}

fn spawn_rescan(state: Arc<WatcherState>, timers: Arc<TimerWheel<PathBuf>>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spool-rescan".into())
        .spawn(move || {
            // catch folders that already exist at startup
            rescan_once(&state, &timers);
            loop {
                if sleep_interruptible(&state.stop, state.config.rescan_interval) {
                    return;
                }
                rescan_once(&state, &timers);
            }
        })
        .expect("unable to spawn rescan thread")
}

/// Walks the first-level spool folders and arms an inactivity timer for
/// any folder that holds DICOM files without being tracked. Guards
/// against missed filesystem events.
fn rescan_once(state: &WatcherState, timers: &TimerWheel<PathBuf>) {
    let failed = state.failed_dir();
    let Ok(entries) = std::fs::read_dir(&state.config.spool_root) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() || path == failed {
            continue;
        }
        let has_dicom = WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.path().is_file() && is_dcm(e.path()));
        if has_dicom && !timers.is_armed(&path) {
            info!("Rescan requeued folder with undispatched DICOM files: {path:?}");
            timers.arm(path, state.config.inactivity);
        }
    }
}

fn spawn_reaper(state: Arc<WatcherState>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spool-reaper".into())
        .spawn(move || loop {
            if sleep_interruptible(&state.stop, state.config.rescan_interval) {
                return;
            }
            reap_empty_dirs(
                &state.config.spool_root,
                state.config.empty_dir_age,
                &state.failed_dir(),
            );
        })
        .expect("unable to spawn reaper thread")
}

fn spawn_heartbeat(state: Arc<WatcherState>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("spool-heartbeat".into())
        .spawn(move || loop {
            if sleep_interruptible(&state.stop, state.config.heartbeat) {
                return;
            }
            info!(
                "Folder watcher alive, monitoring {:?}",
                state.config.spool_root
            );
        })
        .expect("unable to spawn heartbeat thread")
}

/// Sleeps for `duration` in short steps; returns true when a stop was
/// requested meanwhile.
fn sleep_interruptible(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    stop.load(Ordering::SeqCst)
}

/// Removes directories that are empty and older than `min_age`, walking
/// bottom-up. The failed directory and the root itself are never touched.
pub fn reap_empty_dirs(root: &Path, min_age: Duration, failed_dir: &Path) -> usize {
    let now = SystemTime::now();
    let mut deleted = 0usize;
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_dir() || path == root || path == failed_dir || path.starts_with(failed_dir) {
            continue;
        }
        let is_empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty {
            continue;
        }
        let old_enough = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > min_age)
            .unwrap_or(false);
        if !old_enough {
            continue;
        }
        match std::fs::remove_dir(path) {
            Ok(()) => {
                debug!("Deleted empty folder {path:?}");
                deleted += 1;
            }
            Err(e) => warn!("Unable to delete empty folder {path:?}: {e}"),
        }
    }
    if deleted > 0 {
        info!("Cleaned up {deleted} empty folder(s)");
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn age_dir(path: &Path, seconds_ago: i64) {
        let stamp = FileTime::from_unix_time(
            FileTime::now().unix_seconds() - seconds_ago,
            0,
        );
        filetime::set_file_mtime(path, stamp).unwrap();
    }

    #[test]
    fn reaper_only_removes_old_empty_dirs() {
        let root = tempfile::tempdir().unwrap();
        let failed = root.path().join("failed");
        let old_empty = root.path().join("patient_a").join("plan_1");
        let fresh_empty = root.path().join("patient_b");
        let occupied = root.path().join("patient_c");
        std::fs::create_dir_all(&failed).unwrap();
        std::fs::create_dir_all(&old_empty).unwrap();
        std::fs::create_dir_all(&fresh_empty).unwrap();
        std::fs::create_dir_all(&occupied).unwrap();
        std::fs::write(occupied.join("CT.1.dcm"), b"x").unwrap();
        age_dir(&old_empty, 600);
        age_dir(&failed, 600);

        let deleted = reap_empty_dirs(root.path(), Duration::from_secs(180), &failed);

        assert_eq!(deleted, 1);
        assert!(!old_empty.exists());
        assert!(fresh_empty.exists());
        assert!(occupied.exists());
        assert!(failed.exists());
    }

    #[test]
    fn reaper_converges_on_nested_empty_dirs() {
        let root = tempfile::tempdir().unwrap();
        let failed = root.path().join("failed");
        let parent = root.path().join("patient_a");
        let nested = parent.join("plan_1");
        std::fs::create_dir_all(&nested).unwrap();
        age_dir(&nested, 600);
        age_dir(&parent, 600);

        // removing the plan folder refreshes the parent's mtime, so the
        // parent goes in a later pass once it has aged out again
        let deleted = reap_empty_dirs(root.path(), Duration::from_secs(180), &failed);
        assert_eq!(deleted, 1);
        assert!(!nested.exists());
        assert!(parent.exists());

        age_dir(&parent, 600);
        let deleted = reap_empty_dirs(root.path(), Duration::from_secs(180), &failed);
        assert_eq!(deleted, 1);
        assert!(!parent.exists());
    }

    #[test]
    fn enclosing_folder_is_the_first_level_directory() {
        let root = tempfile::tempdir().unwrap();
        let plan_dir = root.path().join("patient_a").join("plan_1");
        std::fs::create_dir_all(&plan_dir).unwrap();
        let file = plan_dir.join("CT.1.dcm");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(
            enclosing_spool_folder(root.path(), &file),
            Some(root.path().join("patient_a"))
        );
    }

    #[test]
    fn dcm_extension_check_is_case_insensitive() {
        assert!(is_dcm(Path::new("a/b/CT.1.dcm")));
        assert!(is_dcm(Path::new("a/b/CT.1.DCM")));
        assert!(!is_dcm(Path::new("a/b/readme.txt")));
        assert!(!is_dcm(Path::new("a/b/no_extension")));
    }
}
