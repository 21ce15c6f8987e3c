//! Cross-modality plan grouping: joins RT plans with their referenced
//! dose, structure set and CT series and lays the group out as one folder
//! per plan under the receive root.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use dicom_dictionary_std::uids;
use tracing::{debug, error, info, warn};

use crate::codec::{self, HeaderInfo};
use crate::convert;
use crate::failed;
use crate::rules::IMPORT_FOLDER_AE;
use crate::sanitize::sanitize;

/// How a batch of files entered the system; decides the fallback source AE
/// used for rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Network,
    Import,
}

/// One plan folder written to disk, the atomic unit of forwarding.
#[derive(Debug, Clone)]
pub struct PlacedPlan {
    pub folder: PathBuf,
    pub plan_label: String,
    pub patient_id: String,
    pub source_ae: String,
}

enum ParsedFile {
    Header(Box<HeaderInfo>),
    /// Unreadable as DICOM but named like a dose: kept byte-exact and
    /// treated as RTDOSE for placement.
    RawDose(PathBuf),
}

pub struct PlanGrouper {
    receive_root: PathBuf,
    failed_dir: PathBuf,
    ae_subdirs: HashMap<String, String>,
    emf2sf_path: Option<PathBuf>,
}

impl PlanGrouper {
    pub fn new(
        receive_root: PathBuf,
        failed_dir: PathBuf,
        ae_subdirs: HashMap<String, String>,
        emf2sf_path: Option<PathBuf>,
    ) -> Self {
        Self {
            receive_root,
            failed_dir,
            ae_subdirs,
            emf2sf_path,
        }
    }

    /// Runs the grouping pipeline over one flushed file list and returns
    /// the plan folders that were written. Per-file failures are
    /// quarantined; the rest of the group proceeds.
    pub fn group_and_place(&self, files: Vec<PathBuf>, entry: EntrySource) -> Vec<PlacedPlan> {
        let mut plans: Vec<HeaderInfo> = Vec::new();
        let mut cts: Vec<HeaderInfo> = Vec::new();
        let mut structs: Vec<HeaderInfo> = Vec::new();
        let mut others: Vec<HeaderInfo> = Vec::new();
        let mut raw_doses: Vec<PathBuf> = Vec::new();

        for path in &files {
            match self.parse(path) {
                Some(ParsedFile::Header(header)) => match header.modality.as_str() {
                    "RTPLAN" => plans.push(*header),
                    "CT" => cts.push(*header),
                    "RTSTRUCT" => structs.push(*header),
                    _ => others.push(*header),
                },
                Some(ParsedFile::RawDose(path)) => raw_doses.push(path),
                None => {}
            }
        }
        debug!(
            "Grouping {} plan(s), {} CT, {} struct(s), {} other(s), {} raw dose(s)",
            plans.len(),
            cts.len(),
            structs.len(),
            others.len(),
            raw_doses.len()
        );

        // Resolve the plan/dose/image graph into flat lookup maps keyed by
        // SOP instance UID and frame of reference.
        let mut dose_by_plan: HashMap<String, Vec<&HeaderInfo>> = HashMap::new();
        let mut by_frame_of_reference: HashMap<String, Vec<&HeaderInfo>> = HashMap::new();
        for plan in &plans {
            for dose in others.iter().filter(|h| h.referenced_plan_uid.is_some()) {
                let referenced = dose.referenced_plan_uid.as_deref().unwrap_or_default();
                if referenced != plan.sop_instance_uid {
                    continue;
                }
                if dose.patient_id != plan.patient_id {
                    warn!(
                        "Dose {:?} references plan {} but patient IDs differ: {:?} != {:?}; \
                         match rejected",
                        dose.path, plan.sop_instance_uid, dose.patient_id, plan.patient_id
                    );
                    continue;
                }
                dose_by_plan
                    .entry(plan.sop_instance_uid.clone())
                    .or_default()
                    .push(dose);
            }
            if plan.frame_of_reference_uid.is_empty() {
                continue;
            }
            let related = by_frame_of_reference
                .entry(plan.frame_of_reference_uid.clone())
                .or_default();
            for candidate in cts.iter().chain(structs.iter()) {
                if candidate.frame_of_reference_uid != plan.frame_of_reference_uid {
                    continue;
                }
                if candidate.patient_id != plan.patient_id {
                    warn!(
                        "Skipping {} {:?}: frame of reference matches plan {} but patient \
                         IDs differ ({:?} != {:?})",
                        candidate.modality,
                        candidate.path,
                        plan.sop_instance_uid,
                        candidate.patient_id,
                        plan.patient_id
                    );
                    continue;
                }
                if !related.iter().any(|h| std::ptr::eq(*h, candidate)) {
                    related.push(candidate);
                }
            }
        }

        let mut placed_paths: HashSet<PathBuf> = HashSet::new();
        let mut placed_plans: Vec<PlacedPlan> = Vec::new();

        for plan in &plans {
            match self.place_plan_group(plan, &dose_by_plan, &by_frame_of_reference, entry) {
                Ok((placed, used)) => {
                    placed_paths.extend(used);
                    placed_plans.push(placed);
                }
                Err(e) => {
                    error!("Unable to place plan {:?}: {e}", plan.path);
                    failed::quarantine(
                        &self.failed_dir,
                        &plan.path,
                        "plan placement",
                        &e.to_string(),
                    );
                }
            }
        }

        // Everything that joined no plan lands under the patient's orphan
        // folder.
        for header in cts.iter().chain(structs.iter()).chain(others.iter()) {
            if placed_paths.contains(&header.path) {
                continue;
            }
            self.place_orphan(header);
        }
        for path in &raw_doses {
            self.place_raw_orphan(path);
        }

        // network receives are staged copies owned by this pipeline;
        // operator imports stay in place and are cleared by the caller
        // according to the configuration
        if entry == EntrySource::Network {
            self.cleanup_temp(&files);
        }
        placed_plans
    }

    fn parse(&self, path: &Path) -> Option<ParsedFile> {
        match codec::read_header(path) {
            Ok(header) => Some(ParsedFile::Header(Box::new(header))),
            Err(e) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if name.contains("dose") {
                    warn!(
                        "File {path:?} is unreadable as DICOM but named like a dose; \
                         keeping bytes for raw placement: {e}"
                    );
                    Some(ParsedFile::RawDose(path.to_path_buf()))
                } else {
                    error!("Unable to parse DICOM header of {path:?}: {e}");
                    failed::quarantine(&self.failed_dir, path, "header parse", &e.to_string());
                    None
                }
            }
        }
    }

    fn patient_dir(&self, source_ae: &str, patient_name: &str, patient_id: &str) -> PathBuf {
        let mut root = self.receive_root.clone();
        if let Some(subdir) = self.ae_subdirs.get(&source_ae.to_uppercase()) {
            root = root.join(subdir);
        }
        root.join(format!(
            "{} ({})",
            non_empty(&sanitize(patient_name), "UNKNOWN"),
            non_empty(&sanitize(patient_id), "UNKNOWN"),
        ))
    }

    fn source_ae_of(&self, header: &HeaderInfo, entry: EntrySource) -> String {
        header.source_ae.clone().unwrap_or_else(|| {
            match entry {
                EntrySource::Import => IMPORT_FOLDER_AE.to_string(),
                EntrySource::Network => "UNKNOWN".to_string(),
            }
        })
    }

    fn place_plan_group(
        &self,
        plan: &HeaderInfo,
        dose_by_plan: &HashMap<String, Vec<&HeaderInfo>>,
        by_frame_of_reference: &HashMap<String, Vec<&HeaderInfo>>,
        entry: EntrySource,
    ) -> crate::error::Result<(PlacedPlan, Vec<PathBuf>)> {
        let source_ae = self.source_ae_of(plan, entry);
        let label = non_empty(&sanitize(&plan.rt_plan_label), "unknown");
        let suffix = non_empty(&sanitize(plan.study_id_suffix()), "unknown");

        let plan_folder = self
            .patient_dir(&source_ae, &plan.patient_name, &plan.patient_id)
            .join(format!("{label}_{suffix}"));
        std::fs::create_dir_all(&plan_folder).map_err(|e| crate::error::Error::PlacementIo {
            path: plan_folder.clone(),
            source: e,
        })?;

        let mut used = vec![plan.path.clone()];
        self.place_reencoded(&plan.path, &plan_folder.join(format!("RTPLAN_{label}.dcm")))?;
        info!(
            "Plan placed: {} -> {}",
            plan.rt_plan_label,
            plan_folder.display()
        );

        if let Some(doses) = dose_by_plan.get(&plan.sop_instance_uid) {
            for dose in doses {
                let dest = plan_folder.join(format!("RTDOSE_{label}.dcm"));
                match copy_bytes(&dose.path, &dest) {
                    Ok(size) => {
                        info!(
                            "Dose placed verbatim: {:?} -> {:?} ({size} bytes)",
                            dose.path, dest
                        );
                        used.push(dose.path.clone());
                    }
                    Err(e) => {
                        error!("Unable to place dose {:?}: {e}", dose.path);
                        failed::quarantine(
                            &self.failed_dir,
                            &dose.path,
                            "dose placement",
                            &e.to_string(),
                        );
                    }
                }
            }
        }

        if let Some(related) = by_frame_of_reference.get(&plan.frame_of_reference_uid) {
            let mut ct_count = 0usize;
            for header in related {
                // the map is keyed by frame of reference alone; re-check
                // the patient before anything lands in this plan's folder
                if header.patient_id != plan.patient_id {
                    continue;
                }
                let dest = match header.modality.as_str() {
                    "CT" => {
                        ct_count += 1;
                        plan_folder.join(format!(
                            "CT.{}.dcm",
                            non_empty(&sanitize(&header.sop_instance_uid), "unknown")
                        ))
                    }
                    _ => plan_folder.join(format!("RTSTRUCT_{label}.dcm")),
                };
                match self.place_reencoded(&header.path, &dest) {
                    Ok(()) => used.push(header.path.clone()),
                    Err(e) => {
                        error!("Unable to place {} {:?}: {e}", header.modality, header.path);
                        failed::quarantine(
                            &self.failed_dir,
                            &header.path,
                            "related object placement",
                            &e.to_string(),
                        );
                    }
                }
            }
            if ct_count > 0 {
                info!("{ct_count} CT file(s) attached to plan {label}");
            }
        }

        Ok((
            PlacedPlan {
                folder: plan_folder,
                plan_label: plan.rt_plan_label.clone(),
                patient_id: plan.patient_id.clone(),
                source_ae,
            },
            used,
        ))
    }

    fn place_orphan(&self, header: &HeaderInfo) {
        let suffix = non_empty(&sanitize(header.study_id_suffix()), "unknown");
        let orphan_folder = self
            .patient_dir(
                header.source_ae.as_deref().unwrap_or_default(),
                &header.patient_name,
                &header.patient_id,
            )
            .join(format!("Unzugeordnet_{suffix}"));
        if let Err(e) = std::fs::create_dir_all(&orphan_folder) {
            error!("Unable to create orphan folder {orphan_folder:?}: {e}");
            failed::quarantine(
                &self.failed_dir,
                &header.path,
                "orphan placement",
                &e.to_string(),
            );
            return;
        }

        let fallback_label = [&header.series_description, &header.study_description]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(|s| sanitize(s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unzugeordnet".to_string());
        let dest = if header.modality == "CT" {
            orphan_folder.join(format!(
                "CT.{}.dcm",
                non_empty(&sanitize(&header.sop_instance_uid), "unknown")
            ))
        } else {
            orphan_folder.join(format!(
                "{}_{fallback_label}.dcm",
                non_empty(&header.modality, "UNKNOWN")
            ))
        };

        // Doses keep their bytes; everything else is re-encoded with a
        // complete file meta group.
        let outcome = if header.modality == "RTDOSE" {
            copy_bytes(&header.path, &dest)
                .map(|_| ())
                .map_err(crate::error::Error::from)
        } else {
            self.place_reencoded(&header.path, &dest)
        };
        match outcome {
            Ok(()) => {
                info!("Orphan placed: {:?} -> {:?}", header.path, dest);
                self.maybe_convert_enhanced_mr(header, &dest);
            }
            Err(e) => {
                error!("Unable to place orphan {:?}: {e}", header.path);
                failed::quarantine(
                    &self.failed_dir,
                    &header.path,
                    "orphan placement",
                    &e.to_string(),
                );
            }
        }
    }

    // A dose file whose header never parsed carries no patient identity;
    // the bytes are still preserved under an UNKNOWN patient.
    fn place_raw_orphan(&self, path: &Path) {
        let orphan_folder = self
            .patient_dir("", "UNKNOWN", "UNKNOWN")
            .join("Unzugeordnet_unknown");
        if let Err(e) = std::fs::create_dir_all(&orphan_folder) {
            error!("Unable to create orphan folder {orphan_folder:?}: {e}");
            return;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "RTDOSE_Unzugeordnet.dcm".to_string());
        let dest = orphan_folder.join(name);
        match copy_bytes(path, &dest) {
            Ok(size) => info!("Raw dose preserved: {path:?} -> {dest:?} ({size} bytes)"),
            Err(e) => {
                error!("Unable to preserve raw dose {path:?}: {e}");
                failed::quarantine(&self.failed_dir, path, "raw dose placement", &e.to_string());
            }
        }
    }

    fn place_reencoded(&self, src: &Path, dest: &Path) -> crate::error::Result<()> {
        codec::reencode_to(src, dest, None)
    }

    fn maybe_convert_enhanced_mr(&self, header: &HeaderInfo, placed: &Path) {
        let enhanced = header.sop_class_uid == uids::ENHANCED_MR_IMAGE_STORAGE
            || header.sop_class_uid == uids::ENHANCED_MR_COLOR_IMAGE_STORAGE;
        if !enhanced {
            return;
        }
        let Some(emf2sf) = &self.emf2sf_path else {
            debug!("Enhanced MR object placed but no converter is configured");
            return;
        };
        convert::spawn_enhanced_mr_conversion(
            emf2sf.clone(),
            placed.to_path_buf(),
            self.failed_dir.clone(),
        );
    }

    // Staged copies that were not promoted are dropped; removal of the key
    // directory itself is best-effort.
    fn cleanup_temp(&self, files: &[PathBuf]) {
        let mut parents: HashSet<PathBuf> = HashSet::new();
        for path in files {
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Unable to remove staged file {path:?}: {e}");
                }
            }
        }
        for parent in parents {
            let _ = std::fs::remove_dir(parent);
        }
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn copy_bytes(src: &Path, dest: &Path) -> std::io::Result<u64> {
    std::fs::copy(src, dest)
}
