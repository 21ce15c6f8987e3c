//! DICOM routing and organization node for a radiotherapy workflow:
//! receives objects over the wire, regroups them into patient/plan
//! folders on disk and re-transmits plan folders to downstream peers,
//! either on operator demand or driven by forwarding rules.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod convert;
pub mod error;
pub mod failed;
pub mod grouper;
pub mod pipeline;
pub mod rules;
pub mod sanitize;
pub mod scp;
pub mod sender;
pub mod timer;
pub mod transfer;
pub mod watcher;

pub use cli::Cli;
pub use config::Config;
pub use error::{Error, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::buffer::ReceiveBuffer;
use crate::grouper::EntrySource;
use crate::pipeline::Pipeline;
use crate::scp::ScpConfig;
use crate::sender::SendEngine;
use crate::watcher::{FolderWatcher, WatcherConfig};
use rt_kaffee_common::Validate;

/// The assembled node: Store SCP, receive buffer, grouping/forwarding
/// pipeline and the spool watcher, sharing one stop flag.
pub struct Service {
    stop: Arc<AtomicBool>,
    buffer: Arc<ReceiveBuffer>,
    pipeline: Arc<Pipeline>,
    scp_thread: Option<JoinHandle<()>>,
    watcher: Option<FolderWatcher>,
}

impl Service {
    pub fn start(config: Config) -> Result<Self> {
        config.validate()?;
        config.create_dirs()?;
        if config.emf2sf_path().is_some()
            && rt_kaffee_common::system::which(&config.tools.emf2sf_path).is_err()
        {
            warn!(
                "Configured emf2sf converter {:?} was not found; Enhanced MR \
                 conversion will fail at call time",
                config.tools.emf2sf_path
            );
        }

        let stop = Arc::new(AtomicBool::new(false));
        let forward_sender = Arc::new(SendEngine::new(
            config.general.local_ae_title.clone(),
            config.failed_dir(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            &config,
            Arc::clone(&forward_sender),
            Arc::clone(&stop),
        ));

        let buffer = {
            let pipeline = Arc::clone(&pipeline);
            Arc::new(ReceiveBuffer::new(config.buffer_quiesce(), move |files| {
                pipeline.handle_flush(files, EntrySource::Network);
            })?)
        };

        let scp_thread = if config.general.auto_start_receiver {
            let scp_config = ScpConfig {
                ae_title: config.general.local_ae_title.clone(),
                listen_ip: config.network.listen_ip.clone(),
                port: config.network.receive_port,
                trusted_ae_titles: config.security.trusted_ae_titles.clone(),
                restart_backoff: Duration::from_secs(config.network.restart_backoff_s),
            };
            let buffer = Arc::clone(&buffer);
            let stop = Arc::clone(&stop);
            Some(
                std::thread::Builder::new()
                    .name("store-scp".into())
                    .spawn(move || scp::run_listener(scp_config, buffer, stop))
                    .map_err(Error::IO)?,
            )
        } else {
            info!("Receiver auto-start is disabled");
            None
        };

        let watcher = if config.forward.spool_target.is_empty() {
            info!("No spool target configured, folder watcher stays off");
            None
        } else {
            let target = config.node_by_name(&config.forward.spool_target)?.clone();
            // spool failures quarantine into the spool's own failed dir so
            // they stop being retried
            let spool_sender = Arc::new(SendEngine::new(
                config.general.local_ae_title.clone(),
                config.paths.outgoing_spool.join("failed"),
            ));
            Some(FolderWatcher::start(
                WatcherConfig {
                    spool_root: config.paths.outgoing_spool.clone(),
                    inactivity: Duration::from_secs(config.timing.folder_inactivity_s),
                    retry: Duration::from_secs(config.timing.folder_retry_s),
                    rescan_interval: Duration::from_secs(config.timing.rescan_interval_s),
                    empty_dir_age: Duration::from_secs(config.timing.empty_dir_age_s),
                    heartbeat: Duration::from_secs(config.timing.heartbeat_s),
                    delete_after_send: config.general.delete_after_send,
                },
                target,
                spool_sender,
                Arc::clone(&stop),
            )?)
        };

        info!("Service started");
        Ok(Self {
            stop,
            buffer,
            pipeline,
            scp_thread,
            watcher,
        })
    }

    /// Shared stop flag; flipping it begins an orderly shutdown.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Stops the listener, drains the receive buffer synchronously and
    /// joins every background thread.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.scp_thread {
            let _ = handle.join();
        }
        self.buffer.drain();
        drop(self.buffer);
        if let Some(watcher) = self.watcher {
            watcher.shutdown();
        }
        match Arc::try_unwrap(self.pipeline) {
            Ok(pipeline) => pipeline.shutdown(),
            Err(_) => warn!("Forwarding pool still referenced at shutdown"),
        }
        info!("Service stopped");
    }
}
