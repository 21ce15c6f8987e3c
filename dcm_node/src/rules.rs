//! Declarative forwarding rules: which peers a freshly placed plan is
//! re-transmitted to, based on the source AE title and the plan label.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DicomNode;

/// Source AE literal matched by plans that entered through an operator
/// import rather than a network C-STORE.
pub const IMPORT_FOLDER_AE: &str = "IMPORT_FOLDER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Unique name for the rule
    pub name: String,
    pub enabled: bool,
    /// Exact calling AE title to match; empty matches any source.
    #[serde(default)]
    pub source_ae: String,
    /// Substring of the RT plan label; empty matches any label.
    #[serde(default)]
    pub plan_label_match: String,
    /// Names of configured nodes the plan is forwarded to.
    #[serde(default)]
    pub target_nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Global switch; when off, no rule matches anything.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "rule")]
    pub rules: Vec<ForwardingRule>,
}

impl RuleSet {
    /// Makes sure the built-in import-folder rule exists: enabled, no
    /// targets, matching the [`IMPORT_FOLDER_AE`] source. Called once at
    /// startup.
    pub fn ensure_import_folder_rule(&mut self) {
        if self.rules.iter().any(|r| r.source_ae == IMPORT_FOLDER_AE) {
            return;
        }
        info!("Synthesizing built-in {IMPORT_FOLDER_AE} forwarding rule");
        self.rules.push(ForwardingRule {
            name: "Import folder".to_string(),
            enabled: true,
            source_ae: IMPORT_FOLDER_AE.to_string(),
            plan_label_match: String::new(),
            target_nodes: Vec::new(),
        });
    }

    /// Evaluates the rules for one placed plan and returns the resolvable,
    /// enabled target nodes. Pure: the result depends only on the rule
    /// snapshot and the arguments.
    pub fn check(&self, source_ae: &str, plan_label: &str, nodes: &[DicomNode]) -> Vec<DicomNode> {
        if !self.enabled {
            return Vec::new();
        }
        let mut targets: Vec<DicomNode> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.enabled) {
            if !rule.source_ae.is_empty() && rule.source_ae != source_ae {
                continue;
            }
            if !rule.plan_label_match.is_empty() && !plan_label.contains(&rule.plan_label_match) {
                continue;
            }
            for name in rule.target_nodes.iter().map(|n| n.trim()) {
                if name.is_empty() {
                    continue;
                }
                let Some(node) = nodes.iter().find(|n| n.name == name) else {
                    warn!("Rule {:?} names unknown target node {name:?}", rule.name);
                    continue;
                };
                if !node.enabled {
                    warn!("Rule {:?} target node {name:?} is disabled", rule.name);
                    continue;
                }
                if !targets.iter().any(|t| t.name == node.name) {
                    targets.push(node.clone());
                }
            }
        }
        targets
    }
}
