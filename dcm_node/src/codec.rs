//! Reading and writing of DICOM files with file-meta preservation.
//!
//! Two write paths exist: regular objects are re-encoded with a complete
//! file meta group (`ensure_uids`), RT dose objects are persisted through
//! the verbatim path where the received dataset bytes are never touched.
//! Pixel-data length loss on re-encoded doses is the failure mode this
//! module defends against.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids;
use dicom_object::{
    DefaultDicomObject, FileDicomObject, FileMetaTable, FileMetaTableBuilder, InMemDicomObject,
    OpenFileOptions,
};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transfer::PRIVATE_RT_PLAN_STORAGE;

/// Header fields the pipeline cares about, harvested from a single
/// header-only read.
#[derive(Debug, Clone, Default)]
pub struct HeaderInfo {
    pub path: PathBuf,
    pub modality: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_id: String,
    pub series_instance_uid: String,
    pub series_number: String,
    pub series_description: String,
    pub study_description: String,
    pub frame_of_reference_uid: String,
    pub rt_plan_label: String,
    /// `ReferencedRTPlanSequence[0].ReferencedSOPInstanceUID`, present on
    /// RT dose objects.
    pub referenced_plan_uid: Option<String>,
    pub transfer_syntax_uid: String,
    pub source_ae: Option<String>,
}

impl HeaderInfo {
    /// The suffix used for plan folder names: the last dot-segment of the
    /// study instance UID.
    pub fn study_id_suffix(&self) -> &str {
        self.study_instance_uid
            .rsplit('.')
            .next()
            .unwrap_or(&self.study_instance_uid)
    }
}

fn trimmed(s: &str) -> String {
    s.trim_end_matches(['\0', ' ']).trim_start().to_string()
}

/// Returns the element value as a trimmed string, or an empty string when
/// the tag is absent or not textual.
pub fn string_value(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| trimmed(&s))
        .unwrap_or_default()
}

fn referenced_plan_uid(obj: &InMemDicomObject) -> Option<String> {
    let element = obj.element_opt(tags::REFERENCED_RT_PLAN_SEQUENCE).ok()??;
    let items = element.value().items()?;
    let first = items.first()?;
    let uid = string_value(first, tags::REFERENCED_SOP_INSTANCE_UID);
    (!uid.is_empty()).then_some(uid)
}

/// Extracts a [`HeaderInfo`] from an already parsed object.
pub fn header_from_object(obj: &DefaultDicomObject, path: &Path) -> HeaderInfo {
    let dataset: &InMemDicomObject = obj;
    HeaderInfo {
        path: path.to_path_buf(),
        modality: string_value(dataset, tags::MODALITY).to_uppercase(),
        sop_class_uid: string_value(dataset, tags::SOP_CLASS_UID),
        sop_instance_uid: string_value(dataset, tags::SOP_INSTANCE_UID),
        patient_id: string_value(dataset, tags::PATIENT_ID),
        patient_name: string_value(dataset, tags::PATIENT_NAME),
        study_instance_uid: string_value(dataset, tags::STUDY_INSTANCE_UID),
        study_id: string_value(dataset, tags::STUDY_ID),
        series_instance_uid: string_value(dataset, tags::SERIES_INSTANCE_UID),
        series_number: string_value(dataset, tags::SERIES_NUMBER),
        series_description: string_value(dataset, tags::SERIES_DESCRIPTION),
        study_description: string_value(dataset, tags::STUDY_DESCRIPTION),
        frame_of_reference_uid: string_value(dataset, tags::FRAME_OF_REFERENCE_UID),
        rt_plan_label: string_value(dataset, tags::RT_PLAN_LABEL),
        referenced_plan_uid: referenced_plan_uid(dataset),
        transfer_syntax_uid: trimmed(&obj.meta().transfer_syntax),
        source_ae: obj
            .meta()
            .source_application_entity_title
            .as_deref()
            .map(trimmed)
            .filter(|s| !s.is_empty()),
    }
}

/// Header-only read: parses the file up to (excluding) the pixel data and
/// harvests the tags the grouping pipeline joins on.
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<HeaderInfo> {
    let path = path.as_ref();
    trace!("Reading DICOM header from {path:#?}");
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)?;
    Ok(header_from_object(&obj, path))
}

/// Full read including pixel data; required before a CT or dose leaves the
/// node again.
pub fn read_full<P: AsRef<Path>>(path: P) -> Result<DefaultDicomObject> {
    let path = path.as_ref();
    trace!("Reading full DICOM object from {path:#?}");
    Ok(OpenFileOptions::new().open_file(path)?)
}

/// Mints a new UID in the UUID-derived `2.25` root.
pub fn mint_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

/// Guarantees SOP instance UID presence and file-meta completeness for a
/// dataset about to be persisted.
///
/// The SOP instance UID is taken from the dataset, falling back to
/// `fallback_sop_uid` (the media storage or affected SOP instance UID) and
/// finally to a freshly minted UID, which is then written back into the
/// dataset. The file meta group is rebuilt so that
/// `MediaStorageSOPInstanceUID == SOPInstanceUID`; an absent transfer
/// syntax defaults to Implicit VR Little Endian. Must not be used for RT
/// dose objects — those go through [`write_verbatim`].
pub fn ensure_uids(
    mut obj: InMemDicomObject,
    transfer_syntax: &str,
    fallback_sop_class: Option<&str>,
    fallback_sop_uid: Option<&str>,
    source_ae: Option<&str>,
) -> Result<FileDicomObject<InMemDicomObject>> {
    let mut sop_uid = string_value(&obj, tags::SOP_INSTANCE_UID);
    if sop_uid.is_empty() {
        sop_uid = fallback_sop_uid
            .map(trimmed)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                let minted = mint_uid();
                debug!("Dataset has no SOP instance UID, minted {minted}");
                minted
            });
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid.clone()),
        ));
    }

    let mut sop_class = string_value(&obj, tags::SOP_CLASS_UID);
    if sop_class.is_empty() {
        sop_class = fallback_sop_class
            .map(trimmed)
            .filter(|s| !s.is_empty())
            .ok_or(Error::UidMissing)?;
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class.clone()),
        ));
    }

    let ts = if transfer_syntax.is_empty() {
        uids::IMPLICIT_VR_LITTLE_ENDIAN
    } else {
        transfer_syntax
    };

    let mut builder = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(&sop_class)
        .media_storage_sop_instance_uid(&sop_uid)
        .transfer_syntax(ts);
    if let Some(ae) = source_ae {
        builder = builder.source_application_entity_title(ae);
    }
    let meta = builder
        .build()
        .map_err(|e| Error::MetaBuild(e.to_string()))?;

    Ok(obj.with_exact_meta(meta))
}

/// Re-encodes a file on disk to a new location, running the dataset through
/// [`ensure_uids`]. Used for files that did not pass through the receive
/// staging (operator imports).
pub fn reencode_to(src: &Path, dest: &Path, source_ae: Option<&str>) -> Result<()> {
    let obj = read_full(src)?;
    let meta = obj.meta().clone();
    let mut dataset: InMemDicomObject = (*obj).clone();
    crate::sanitize::apply_tag_sanitizers(&mut dataset);
    let out = ensure_uids(
        dataset,
        &trimmed(&meta.transfer_syntax),
        Some(&meta.media_storage_sop_class_uid),
        Some(&meta.media_storage_sop_instance_uid),
        source_ae.or(meta.source_application_entity_title.as_deref()),
    )?;
    out.write_to_file(dest)?;
    Ok(())
}

/// Writes a DICOM part-10 file whose dataset bytes are taken over
/// unaltered: 128-byte preamble, the given file meta group, then the raw
/// dataset. The dataset is never re-encoded.
pub fn write_verbatim(path: &Path, meta: &FileMetaTable, dataset: &[u8]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    file.write_all(&[0u8; 128])?;
    meta.write(&mut file)
        .map_err(|e| Error::MetaBuild(e.to_string()))?;
    file.write_all(dataset)?;
    file.flush()?;
    Ok(())
}

/// Reads back a file written by [`write_verbatim`]: the file meta group and
/// the raw dataset bytes, byte-identical to what was written.
pub fn read_verbatim(path: &Path) -> Result<(FileMetaTable, Vec<u8>)> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut preamble = [0u8; 128];
    file.read_exact(&mut preamble)?;
    let meta =
        FileMetaTable::from_reader(&mut file).map_err(|e| Error::MetaBuild(e.to_string()))?;
    let mut dataset = Vec::new();
    file.read_to_end(&mut dataset)?;
    Ok((meta, dataset))
}

/// Builds the file meta group for a dose received on the wire, from the
/// association parameters and the affected SOP UIDs of the C-STORE command.
/// UIDs are never synthesized onto a dose: when the dataset itself carries
/// no SOP instance UID the discrepancy is logged and the bytes are still
/// written verbatim.
pub fn dose_meta(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax: &str,
    source_ae: &str,
    dataset_sop_uid: &str,
) -> Result<FileMetaTable> {
    if dataset_sop_uid.is_empty() {
        warn!(
            "RTDOSE dataset carries no SOP instance UID, \
             keeping bytes verbatim under media storage UID {sop_instance_uid}"
        );
    }
    FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(trimmed(sop_class_uid))
        .media_storage_sop_instance_uid(trimmed(sop_instance_uid))
        .transfer_syntax(transfer_syntax)
        .source_application_entity_title(source_ae)
        .build()
        .map_err(|e| Error::MetaBuild(e.to_string()))
}

/// Send-time substitution of the vendor-private RT Plan SOP class by the
/// standard one. Returns whether the dataset was changed; files on disk are
/// never rewritten.
pub fn rewrite_private_plan_sop(obj: &mut InMemDicomObject) -> bool {
    if string_value(obj, tags::SOP_CLASS_UID) != PRIVATE_RT_PLAN_STORAGE {
        return false;
    }
    debug!(
        "Substituting private RT Plan SOP class by {} for transfer",
        uids::RT_PLAN_STORAGE
    );
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::RT_PLAN_STORAGE),
    ));
    true
}
