//! Ordered multi-object C-STORE sender: one association per plan folder,
//! CT first, dose last, per-file status tracking and quarantine of
//! failures.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use dicom_core::dicom_value;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{FileDicomObject, FileMetaTable, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom_ul::Pdu;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::codec;
use crate::config::DicomNode;
use crate::error::{Error, Result};
use crate::failed;
use crate::transfer::PRIVATE_RT_PLAN_STORAGE;

/// Transmission order within one association: images first, then the
/// structures they carry, then the plan, then the dose referencing it.
pub fn modality_rank(modality: &str) -> u8 {
    match modality {
        "CT" => 0,
        "RTSTRUCT" => 1,
        "RTPLAN" => 2,
        "RTDOSE" => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModalityCount {
    pub total: usize,
    pub success: usize,
}

/// Outcome of one `send_folder` call.
#[derive(Debug, Default)]
pub struct SendSummary {
    pub per_modality: BTreeMap<String, ModalityCount>,
    pub failed: Vec<PathBuf>,
    pub association_established: bool,
}

impl SendSummary {
    pub fn attempted(&self) -> usize {
        self.per_modality.values().map(|c| c.total).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.per_modality.values().map(|c| c.success).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.attempted() > 0 && self.failed.is_empty()
    }
}

enum Payload {
    /// Re-encoded object, written in the negotiated transfer syntax.
    Object(Box<FileDicomObject<InMemDicomObject>>),
    /// Dose dataset bytes exactly as persisted; never re-encoded.
    Raw(Vec<u8>),
}

struct BatchItem {
    path: PathBuf,
    modality: String,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
    payload: Payload,
}

impl BatchItem {
    fn from_meta(path: &Path, modality: &str, meta: &FileMetaTable, dataset: Vec<u8>) -> Self {
        Self {
            path: path.to_path_buf(),
            modality: modality.to_string(),
            sop_class_uid: clean_uid(&meta.media_storage_sop_class_uid),
            sop_instance_uid: clean_uid(&meta.media_storage_sop_instance_uid),
            transfer_syntax: clean_uid(&meta.transfer_syntax),
            payload: Payload::Raw(dataset),
        }
    }
}

fn clean_uid(uid: &str) -> String {
    uid.trim_end_matches(['\0', ' ']).to_string()
}

enum SendError {
    /// Non-zero C-STORE status for one object.
    Store(u16),
    /// This object could not be prepared or negotiated.
    Object(String),
    /// The association itself is unusable.
    Association(String),
}

pub struct SendEngine {
    local_ae: String,
    failed_dir: PathBuf,
}

impl SendEngine {
    pub fn new(local_ae: String, failed_dir: PathBuf) -> Self {
        Self {
            local_ae,
            failed_dir,
        }
    }

    /// Sends every DICOM file under `folder` to `node` over a single
    /// association, in modality order. Files that fail to transmit are
    /// quarantined; sent files are deleted only when `delete_after` is set
    /// and the whole batch succeeded.
    pub fn send_folder(
        &self,
        folder: &Path,
        node: &DicomNode,
        delete_after: bool,
    ) -> Result<SendSummary> {
        let mut summary = SendSummary::default();
        let batch = self.collect_batch(folder);
        if batch.is_empty() {
            warn!("No transmittable DICOM files under {folder:?}");
            return Ok(summary);
        }
        for item in &batch {
            summary
                .per_modality
                .entry(item.modality.clone())
                .or_default()
                .total += 1;
        }
        info!(
            "Establishing association with {} for {} file(s) from {}",
            node.address(),
            batch.len(),
            folder.display()
        );

        let mut scu = match self.establish(&batch, node) {
            Ok(scu) => scu,
            Err(e) => {
                error!("{e}");
                let message = e.to_string();
                for item in &batch {
                    summary.failed.push(item.path.clone());
                    failed::quarantine(
                        &self.failed_dir,
                        &item.path,
                        "association establishment",
                        &message,
                    );
                }
                return Ok(summary);
            }
        };
        summary.association_established = true;

        let mut message_id: u16 = 1;
        let mut sent_paths: Vec<PathBuf> = Vec::new();
        let mut failed_ct = 0usize;
        let mut broken: Option<String> = None;

        for item in &batch {
            if let Some(reason) = &broken {
                summary.failed.push(item.path.clone());
                failed::quarantine(&self.failed_dir, &item.path, "send aborted", reason);
                continue;
            }
            match send_one(&mut scu, item, message_id) {
                Ok(()) => {
                    if let Some(count) = summary.per_modality.get_mut(&item.modality) {
                        count.success += 1;
                    }
                    sent_paths.push(item.path.clone());
                }
                Err(SendError::Store(status)) => {
                    self.log_send_failure(item, &format!("status 0x{status:04X}"), &mut failed_ct);
                    summary.failed.push(item.path.clone());
                    failed::quarantine(
                        &self.failed_dir,
                        &item.path,
                        "C-STORE",
                        &Error::StoreFailed { status }.to_string(),
                    );
                }
                Err(SendError::Object(message)) => {
                    self.log_send_failure(item, &message, &mut failed_ct);
                    summary.failed.push(item.path.clone());
                    failed::quarantine(&self.failed_dir, &item.path, "C-STORE", &message);
                }
                Err(SendError::Association(message)) => {
                    // the association is gone; everything still unsent fails
                    error!("Association with {} broke: {message}", node.address());
                    summary.failed.push(item.path.clone());
                    failed::quarantine(&self.failed_dir, &item.path, "C-STORE", &message);
                    broken = Some(message);
                }
            }
            message_id = message_id.wrapping_add(1);
        }
        if failed_ct > 1 {
            error!("{failed_ct} CT file(s) could not be sent in total");
        }

        if broken.is_none() {
            let _ = scu.release();
        } else {
            let _ = scu.abort();
        }

        info!(
            "Transfer complete: {} of {} file(s) sent from {}",
            summary.succeeded(),
            summary.attempted(),
            folder.display()
        );
        for (modality, count) in &summary.per_modality {
            info!(
                "  - {modality}: {} of {} successful",
                count.success, count.total
            );
        }

        if delete_after {
            if summary.all_succeeded() {
                for path in &sent_paths {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!("Unable to remove {path:?} after sending: {e}");
                    }
                }
                debug!("Deleted {} sent file(s) from {folder:?}", sent_paths.len());
            } else {
                warn!(
                    "Not deleting anything from {folder:?}: {} of {} file(s) failed",
                    summary.failed.len(),
                    summary.attempted()
                );
            }
        }
        Ok(summary)
    }

    /// One presentation context per SOP class in the batch, offering the
    /// file transfer syntaxes plus the uncompressed defaults. A private RT
    /// plan drags in the standard context so the send-time rewrite has one
    /// to land on.
    fn establish(
        &self,
        batch: &[BatchItem],
        node: &DicomNode,
    ) -> Result<ClientAssociation<TcpStream>> {
        let mut proposed: Vec<String> = Vec::new();
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(&self.local_ae)
            .called_ae_title(&node.aet);
        for item in batch {
            if proposed.contains(&item.sop_class_uid) {
                continue;
            }
            let mut ts: Vec<String> = batch
                .iter()
                .filter(|i| i.sop_class_uid == item.sop_class_uid)
                .map(|i| i.transfer_syntax.clone())
                .chain([
                    uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                ])
                .collect();
            ts.sort();
            ts.dedup();
            options = options.with_presentation_context(item.sop_class_uid.clone(), ts);
            proposed.push(item.sop_class_uid.clone());
        }
        if proposed.iter().any(|c| c == PRIVATE_RT_PLAN_STORAGE)
            && !proposed.iter().any(|c| c == uids::RT_PLAN_STORAGE)
        {
            options = options.with_presentation_context(
                uids::RT_PLAN_STORAGE,
                vec![
                    uids::IMPLICIT_VR_LITTLE_ENDIAN,
                    uids::EXPLICIT_VR_LITTLE_ENDIAN,
                ],
            );
        }

        options
            .establish((node.ip.as_str(), node.port))
            .map_err(|e| {
                debug!("Association establishment error: {e:?}");
                Error::AssociationRefused(node.address())
            })
    }

    fn log_send_failure(&self, item: &BatchItem, message: &str, failed_ct: &mut usize) {
        if item.modality == "CT" {
            *failed_ct += 1;
            if *failed_ct == 1 {
                error!(
                    "Unable to send CT file {:?}: {message} (further CT failures are counted)",
                    item.path
                );
            } else {
                debug!("Unable to send CT file {:?}: {message}", item.path);
            }
        } else {
            error!(
                "Unable to send {} file {:?}: {message}",
                item.modality, item.path
            );
        }
    }

    /// Enumerates the folder and loads every object, ordered by modality.
    /// Unreadable files are quarantined, except dose-named ones which ride
    /// the raw byte path.
    fn collect_batch(&self, folder: &Path) -> Vec<BatchItem> {
        let mut items: Vec<BatchItem> = Vec::new();
        for entry in WalkDir::new(folder).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_dcm = path.is_file()
                && path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("dcm"))
                    .unwrap_or(false);
            if !is_dcm {
                continue;
            }
            match self.load_item(path) {
                Ok(item) => items.push(item),
                Err(e) => {
                    error!("Unable to load {path:?} for sending: {e}");
                    failed::quarantine(&self.failed_dir, path, "send preparation", &e.to_string());
                }
            }
        }
        items.sort_by_key(|item| modality_rank(&item.modality));
        items
    }

    fn load_item(&self, path: &Path) -> Result<BatchItem> {
        match codec::read_header(path) {
            Ok(header) if header.modality == "RTDOSE" => {
                let (meta, dataset) = codec::read_verbatim(path)?;
                if dataset.is_empty() {
                    return Err(Error::DoseIntegrity);
                }
                Ok(BatchItem::from_meta(path, "RTDOSE", &meta, dataset))
            }
            Ok(header) => {
                // header-only staging may lack pixel data; always re-read
                // in full before transmitting
                let obj = codec::read_full(path)?;
                Ok(BatchItem {
                    path: path.to_path_buf(),
                    modality: header.modality,
                    sop_class_uid: header.sop_class_uid,
                    sop_instance_uid: header.sop_instance_uid,
                    transfer_syntax: header.transfer_syntax_uid,
                    payload: Payload::Object(Box::new(obj)),
                })
            }
            Err(e) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if !name.contains("dose") {
                    return Err(e);
                }
                warn!("Sending dose-named file {path:?} through the raw byte path: {e}");
                let (meta, dataset) = codec::read_verbatim(path)?;
                Ok(BatchItem::from_meta(path, "RTDOSE", &meta, dataset))
            }
        }
    }
}

/// Picks the presentation context for the item's (possibly rewritten) SOP
/// class: an exact transfer-syntax match first, any accepted context for
/// the class otherwise.
fn select_context<'a>(
    accepted: &'a [PresentationContextNegotiated],
    sop_class: &str,
    transfer_syntax: &str,
) -> Option<&'a PresentationContextNegotiated> {
    accepted
        .iter()
        .find(|pc| {
            clean_uid(&pc.abstract_syntax) == sop_class
                && clean_uid(&pc.transfer_syntax) == transfer_syntax
        })
        .or_else(|| {
            accepted
                .iter()
                .find(|pc| clean_uid(&pc.abstract_syntax) == sop_class)
        })
}

fn send_one(
    scu: &mut ClientAssociation<TcpStream>,
    item: &BatchItem,
    message_id: u16,
) -> std::result::Result<(), SendError> {
    use dicom_ul::pdu::PresentationContextResultReason::Acceptance;

    let accepted: Vec<PresentationContextNegotiated> = scu
        .presentation_contexts()
        .iter()
        .filter(|pc| pc.reason == Acceptance)
        .cloned()
        .collect();

    // the private RT plan class is swapped for the standard one when only
    // the latter got a context; files on disk stay untouched
    let mut effective_class = item.sop_class_uid.clone();
    let mut rewrite = false;
    let class_accepted =
        |class: &str| accepted.iter().any(|pc| clean_uid(&pc.abstract_syntax) == class);
    if !class_accepted(&effective_class) {
        if effective_class == PRIVATE_RT_PLAN_STORAGE && class_accepted(uids::RT_PLAN_STORAGE) {
            debug!(
                "Peer accepted only the standard RT Plan context; rewriting {} at send time",
                item.sop_instance_uid
            );
            effective_class = uids::RT_PLAN_STORAGE.to_string();
            rewrite = true;
        } else {
            return Err(SendError::Object(format!(
                "no presentation context accepted for SOP class {}",
                item.sop_class_uid
            )));
        }
    }
    let pc = select_context(&accepted, &effective_class, &item.transfer_syntax)
        .ok_or_else(|| SendError::Object("presentation context selection failed".into()))?
        .clone();

    let object_data = match &item.payload {
        Payload::Raw(dataset) => {
            if clean_uid(&pc.transfer_syntax) != item.transfer_syntax {
                return Err(SendError::Object(format!(
                    "dose transfer syntax {} was not accepted; raw bytes cannot be re-encoded",
                    item.transfer_syntax
                )));
            }
            dataset.clone()
        }
        Payload::Object(obj) => {
            let ts = TransferSyntaxRegistry.get(&pc.transfer_syntax).ok_or_else(|| {
                SendError::Object(format!(
                    "negotiated transfer syntax {} is unknown",
                    pc.transfer_syntax
                ))
            })?;
            let mut dataset: InMemDicomObject = (***obj).clone();
            if rewrite {
                codec::rewrite_private_plan_sop(&mut dataset);
            }
            let mut buf = Vec::with_capacity(2048);
            dataset
                .write_dataset_with_ts(&mut buf, ts)
                .map_err(|e| SendError::Object(e.to_string()))?;
            buf
        }
    };

    let cmd = store_req_command(&effective_class, &item.sop_instance_uid, message_id);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(
        &mut cmd_data,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(|e| SendError::Object(e.to_string()))?;

    debug!(
        "Sending {} (~{} kB), uid={}, sop={}, ts={}",
        item.path.display(),
        (cmd_data.len() + object_data.len()) / 1_000,
        item.sop_instance_uid,
        effective_class,
        pc.transfer_syntax,
    );

    let nbytes = cmd_data.len() + object_data.len();
    if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                },
                PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        };
        scu.send(&pdu)
            .map_err(|e| SendError::Association(e.to_string()))?;
    } else {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        };
        scu.send(&pdu)
            .map_err(|e| SendError::Association(e.to_string()))?;
        let mut writer = scu.send_pdata(pc.id);
        writer
            .write_all(&object_data)
            .map_err(|e| SendError::Association(e.to_string()))?;
    }

    let rsp = scu
        .receive()
        .map_err(|e| SendError::Association(e.to_string()))?;
    match rsp {
        Pdu::PData { data } => {
            let data_value = data
                .first()
                .ok_or_else(|| SendError::Association("empty C-STORE response".into()))?;
            let cmd_obj = InMemDicomObject::read_dataset_with_ts(
                &data_value.data[..],
                &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| SendError::Association(e.to_string()))?;
            let status = cmd_obj
                .element(tags::STATUS)
                .map_err(|e| SendError::Association(e.to_string()))?
                .to_int::<u16>()
                .map_err(|e| SendError::Association(e.to_string()))?;
            match status {
                0x0000 => Ok(()),
                0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => {
                    warn!(
                        "Peer reported warning status 0x{status:04X} for {}",
                        item.sop_instance_uid
                    );
                    Ok(())
                }
                status => Err(SendError::Store(status)),
            }
        }
        pdu => Err(SendError::Association(format!(
            "unexpected response PDU: {pdu:?}"
        ))),
    }
}

fn store_req_command(
    storage_sop_class_uid: &str,
    storage_sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_instance_uid),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_ul::pdu::PresentationContextResultReason;

    #[test]
    fn modality_ranks_are_monotonic_over_the_send_order() {
        assert!(modality_rank("CT") < modality_rank("RTSTRUCT"));
        assert!(modality_rank("RTSTRUCT") < modality_rank("RTPLAN"));
        assert!(modality_rank("RTPLAN") < modality_rank("RTDOSE"));
        assert!(modality_rank("RTDOSE") < modality_rank("MR"));
        assert_eq!(modality_rank("PT"), modality_rank("SR"));
    }

    #[test]
    fn batches_sort_into_send_order() {
        let mut modalities = vec!["RTDOSE", "RTPLAN", "MR", "CT", "RTSTRUCT", "CT"];
        modalities.sort_by_key(|m| modality_rank(m));
        assert_eq!(
            modalities,
            vec!["CT", "CT", "RTSTRUCT", "RTPLAN", "RTDOSE", "MR"]
        );
    }

    #[test]
    fn context_selection_prefers_the_file_transfer_syntax() {
        let accepted = vec![
            PresentationContextNegotiated {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
            PresentationContextNegotiated {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
                transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
        ];
        let pc = select_context(
            &accepted,
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        )
        .unwrap();
        assert_eq!(pc.id, 3);
        // falls back to any context for the class
        let pc = select_context(
            &accepted,
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_BIG_ENDIAN,
        )
        .unwrap();
        assert_eq!(pc.id, 1);
        assert!(select_context(&accepted, uids::RT_DOSE_STORAGE, "").is_none());
    }

    #[test]
    fn summary_accounts_per_modality() {
        let mut summary = SendSummary::default();
        summary.per_modality.insert(
            "CT".to_string(),
            ModalityCount {
                total: 50,
                success: 49,
            },
        );
        summary.failed.push(PathBuf::from("CT.x.dcm"));
        assert_eq!(summary.attempted(), 50);
        assert_eq!(summary.succeeded(), 49);
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn empty_summary_never_counts_as_success() {
        assert!(!SendSummary::default().all_succeeded());
    }
}
