//! Glue between reception, grouping and forwarding: each freshly placed
//! plan folder is matched against the forwarding rules and dispatched to
//! every resulting peer on a small worker pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, DicomNode};
use crate::error::Result;
use crate::grouper::{EntrySource, PlanGrouper};
use crate::rules::RuleSet;
use crate::sender::SendEngine;

struct ForwardJob {
    folder: PathBuf,
    node: DicomNode,
    plan_label: String,
}

/// Fixed-size pool running the rule-driven forwarding sends, so one slow
/// peer cannot stall fan-out to the others.
struct WorkerPool {
    tx: Sender<ForwardJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize, sender: Arc<SendEngine>, stop: Arc<AtomicBool>) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<ForwardJob>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let sender = Arc::clone(&sender);
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("forward-{index}"))
                .spawn(move || worker_loop(rx, sender, stop))
                .expect("unable to spawn forwarding worker");
            workers.push(handle);
        }
        Self { tx, workers }
    }

    fn submit(&self, job: ForwardJob) {
        if self.tx.send(job).is_err() {
            error!("Forwarding pool is gone, dropping job");
        }
    }

    fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: Arc<Mutex<Receiver<ForwardJob>>>,
    sender: Arc<SendEngine>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv_timeout(Duration::from_millis(500))
        };
        match job {
            Ok(job) => {
                info!(
                    "Forwarding plan {:?} to {}",
                    job.plan_label,
                    job.node.address()
                );
                // forwarding never deletes received plans
                match sender.send_folder(&job.folder, &job.node, false) {
                    Ok(summary) if summary.all_succeeded() => {
                        info!(
                            "Plan {:?} forwarded to {} ({} file(s))",
                            job.plan_label,
                            job.node.name,
                            summary.succeeded()
                        );
                    }
                    Ok(summary) => {
                        error!(
                            "Forwarding plan {:?} to {} incomplete: {} of {} file(s) sent",
                            job.plan_label,
                            job.node.name,
                            summary.succeeded(),
                            summary.attempted()
                        );
                    }
                    Err(e) => {
                        error!(
                            "Forwarding plan {:?} to {} failed: {e}",
                            job.plan_label, job.node.name
                        );
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Wires the receive buffer flushes through the grouper and the rule
/// engine into the send engine.
pub struct Pipeline {
    grouper: PlanGrouper,
    rules: RuleSet,
    nodes: Vec<DicomNode>,
    pool: WorkerPool,
    import_folder: PathBuf,
    clear_import_folder: bool,
}

impl Pipeline {
    pub fn new(config: &Config, sender: Arc<SendEngine>, stop: Arc<AtomicBool>) -> Self {
        let grouper = PlanGrouper::new(
            config.paths.receive_root.clone(),
            config.failed_dir(),
            config.ae_subdirs.clone(),
            config.emf2sf_path(),
        );
        let mut rules = config.rules.clone();
        rules.ensure_import_folder_rule();
        let pool = WorkerPool::new(config.forward.worker_pool_size, sender, stop);
        Self {
            grouper,
            rules,
            nodes: config.nodes.clone(),
            pool,
            import_folder: config.paths.import_folder.clone(),
            clear_import_folder: config.general.clear_import_folder_after_import,
        }
    }

    /// Entry point for receive-buffer flushes: group, place, and forward
    /// per the rules.
    pub fn handle_flush(&self, files: Vec<PathBuf>, entry: EntrySource) {
        let placed = self.grouper.group_and_place(files, entry);
        for plan in placed {
            let targets = self
                .rules
                .check(&plan.source_ae, &plan.plan_label, &self.nodes);
            if targets.is_empty() {
                info!(
                    "No forwarding rule matches plan {:?} from {:?}",
                    plan.plan_label, plan.source_ae
                );
                continue;
            }
            info!(
                "Plan {:?} matches {} forwarding target(s)",
                plan.plan_label,
                targets.len()
            );
            for node in targets {
                self.pool.submit(ForwardJob {
                    folder: plan.folder.clone(),
                    node,
                    plan_label: plan.plan_label.clone(),
                });
            }
        }
    }

    /// Operator-initiated import: run the import folder contents through
    /// the same grouping pipeline with the `IMPORT_FOLDER` source, then
    /// clear the folder when configured to do so.
    pub fn import(&self) -> Result<usize> {
        let files: Vec<PathBuf> = WalkDir::new(&self.import_folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter(|e| {
                let keep = e
                    .path()
                    .extension()
                    .map(|x| x.eq_ignore_ascii_case("dcm"))
                    .unwrap_or(false);
                if !keep {
                    info!("Skipping non-DICOM file {:?}", e.path());
                }
                keep
            })
            .map(|e| e.path().to_path_buf())
            .collect();
        if files.is_empty() {
            warn!("No DICOM files found in import folder {:?}", self.import_folder);
            return Ok(0);
        }
        let count = files.len();
        info!("Importing {count} file(s) from {:?}", self.import_folder);
        self.handle_flush(files, EntrySource::Import);

        if self.clear_import_folder {
            clear_directory(&self.import_folder)?;
            info!("Import folder cleared");
        }
        Ok(count)
    }

    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

/// Empties a directory without removing the directory itself.
fn clear_directory(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_directory_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        std::fs::write(dir.path().join("a.dcm"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/b.dcm"), b"x").unwrap();

        clear_directory(dir.path()).unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
