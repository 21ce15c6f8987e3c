//! Node configuration: one TOML file covering the receiver, the folder
//! layout, the spool watcher, the peers and the forwarding rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};
use crate::rules::RuleSet;
use rt_kaffee_common::Validate;

/// A remote DICOM peer plans can be sent to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DicomNode {
    /// Unique name for the node
    pub name: String,
    /// Called AE title of the peer
    pub aet: String,
    /// Address of the peer
    pub ip: String,
    /// Port of the peer
    pub port: u16,
    /// Disabled nodes are never selected as forwarding targets
    #[serde(default)]
    pub enabled: bool,
}

impl DicomNode {
    /// The `AET@host:port` form the association layer expects.
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.aet, self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct General {
    /// AE title this node identifies itself with, on both sides of the
    /// wire.
    pub local_ae_title: String,
    /// Start the Store SCP together with the service.
    pub auto_start_receiver: bool,
    /// Remove spool files after a fully successful send.
    pub delete_after_send: bool,
    /// Empty the import folder once an operator import finished.
    pub clear_import_folder_after_import: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            local_ae_title: "DICOM-RT-KAFFEE".to_string(),
            auto_start_receiver: true,
            delete_after_send: false,
            clear_import_folder_after_import: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub listen_ip: String,
    pub receive_port: u16,
    /// Back-off before the listener is rebuilt after a fatal error.
    pub restart_backoff_s: u64,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            receive_port: 1334,
            restart_backoff_s: 10,
        }
    }
}

/// Directories the node works on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Paths {
    /// Root of the patient/plan folder layout written by the grouper.
    pub receive_root: PathBuf,
    /// Spool watched for complete folders to transmit.
    pub outgoing_spool: PathBuf,
    /// Folder scanned on operator-initiated imports.
    pub import_folder: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Security {
    /// Calling AE titles allowed to issue C-ECHO against this node.
    pub trusted_ae_titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tools {
    /// Path to the dcm4che `emf2sf` executable; empty disables Enhanced MR
    /// conversion.
    pub emf2sf_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Seconds of bucket inactivity before a receive flush.
    pub buffer_quiesce_s: u64,
    /// Seconds of folder inactivity before a spool folder is sent.
    pub folder_inactivity_s: u64,
    /// Requeue delay when a folder was busy or still empty.
    pub folder_retry_s: u64,
    /// Interval of the rescan guarding against missed filesystem events.
    pub rescan_interval_s: u64,
    /// Minimum age of an empty directory before the reaper removes it.
    pub empty_dir_age_s: u64,
    /// Interval of the watcher liveness log line.
    pub heartbeat_s: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            buffer_quiesce_s: 2,
            folder_inactivity_s: 13,
            folder_retry_s: 14,
            rescan_interval_s: 300,
            empty_dir_age_s: 180,
            heartbeat_s: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Worker threads used for rule-driven forwarding fan-out.
    pub worker_pool_size: usize,
    /// Node name the spool watcher transmits to.
    #[serde(default)]
    pub spool_target: String,
}

impl Default for Forward {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            spool_target: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub security: Security,
    /// Calling AE title to receive-root subdirectory overrides.
    #[serde(default)]
    pub ae_subdirs: HashMap<String, String>,
    #[serde(default)]
    pub tools: Tools,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub forward: Forward,
    #[serde(default)]
    pub nodes: Vec<DicomNode>,
    #[serde(default)]
    pub rules: RuleSet,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            error!("Unable to read config {:?}: {e}", path.as_ref());
            Error::Config(format!("unable to read {:?}: {e}", path.as_ref()))
        })?;
        toml::from_str(&content).map_err(|e| {
            error!("Unable to parse config {:?}: {e}", path.as_ref());
            Error::Config(format!("unable to parse {:?}: {e}", path.as_ref()))
        })
    }

    /// Directory failed files are quarantined into; lives under the
    /// receive root and is exempt from reaping.
    pub fn failed_dir(&self) -> PathBuf {
        self.paths.receive_root.join("failed")
    }

    /// Makes sure every directory the node works on exists.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.paths.receive_root,
            &self.paths.outgoing_spool,
            &self.paths.import_folder,
            &self.failed_dir(),
        ] {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    pub fn node_by_name(&self, name: &str) -> Result<&DicomNode> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn buffer_quiesce(&self) -> Duration {
        Duration::from_secs(self.timing.buffer_quiesce_s)
    }

    pub fn emf2sf_path(&self) -> Option<PathBuf> {
        if self.tools.emf2sf_path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(self.tools.emf2sf_path.trim()))
        }
    }

    /// A populated example configuration, printed by the `generate`
    /// subcommand.
    pub fn sample() -> Self {
        let temp_dir = std::env::temp_dir();
        Self {
            paths: Paths {
                receive_root: temp_dir.join("rt_kaffee").join("received"),
                outgoing_spool: temp_dir.join("rt_kaffee").join("outgoing"),
                import_folder: temp_dir.join("rt_kaffee").join("import"),
            },
            security: Security {
                trusted_ae_titles: vec!["TR_SEND".to_string(), "MRMULTI".to_string()],
            },
            forward: Forward {
                worker_pool_size: 4,
                spool_target: "ORGANO".to_string(),
            },
            nodes: vec![
                DicomNode {
                    name: "ORGANO".to_string(),
                    aet: "ORGANO".to_string(),
                    ip: "192.168.1.10".to_string(),
                    port: 104,
                    enabled: true,
                },
                DicomNode {
                    name: "ARCHIVE".to_string(),
                    aet: "ARCHIVE".to_string(),
                    ip: "192.168.1.20".to_string(),
                    port: 11112,
                    enabled: false,
                },
            ],
            rules: RuleSet {
                enabled: false,
                rules: vec![crate::rules::ForwardingRule {
                    name: "adaptive plans".to_string(),
                    enabled: false,
                    source_ae: "TR_SEND".to_string(),
                    plan_label_match: "ADP".to_string(),
                    target_nodes: vec!["ORGANO".to_string()],
                }],
            },
            ..Default::default()
        }
    }
}

impl Validate<Result<()>> for Config {
    fn validate(&self) -> Result<()> {
        if self.general.local_ae_title.trim().is_empty() {
            return Err(Error::Config("local_ae_title must not be empty".into()));
        }
        if self.network.receive_port == 0 {
            return Err(Error::Config("receive_port must not be 0".into()));
        }
        if self.paths.receive_root.as_os_str().is_empty() {
            return Err(Error::Config("receive_root must be set".into()));
        }
        if self.paths.outgoing_spool.as_os_str().is_empty() {
            return Err(Error::Config("outgoing_spool must be set".into()));
        }
        if !self.forward.spool_target.is_empty() {
            self.node_by_name(&self.forward.spool_target)?;
        }
        for rule in &self.rules.rules {
            for target in rule.target_nodes.iter().filter(|t| !t.trim().is_empty()) {
                if self.nodes.iter().all(|n| &n.name != target) {
                    return Err(Error::Config(format!(
                        "rule {:?} references unknown node {target:?}",
                        rule.name
                    )));
                }
            }
        }
        Ok(())
    }
}
