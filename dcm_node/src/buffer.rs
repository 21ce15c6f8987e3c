//! In-memory staging of just-received objects, keyed by
//! `(PatientID, StudyInstanceUID)`, with an inactivity-reset flush timer
//! per bucket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::sanitize::sanitize;
use crate::timer::TimerWheel;

/// Tolerance when comparing bucket inactivity against the quiesce window.
const EPSILON: Duration = Duration::from_millis(100);

pub type BucketKey = (String, String);

/// One object handed over by the Store SCP.
pub struct IncomingObject {
    pub dataset: InMemDicomObject,
    /// Transfer syntax negotiated on the presentation context.
    pub transfer_syntax: String,
    pub calling_ae: String,
    /// Affected SOP class/instance UID from the C-STORE command.
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// The dataset exactly as received on the wire; present for RTDOSE.
    pub raw_dataset: Option<Vec<u8>>,
}

struct Bucket {
    files: Vec<PathBuf>,
    last_activity: Instant,
}

struct BufferState {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    quiesce: Duration,
    on_flush: Arc<dyn Fn(Vec<PathBuf>) + Send + Sync>,
}

/// Staging buffer between the Store SCP and the plan grouper. Files live in
/// a process-private temporary directory until their bucket goes quiet for
/// the quiesce window, then the whole bucket is flushed at once.
pub struct ReceiveBuffer {
    state: Arc<BufferState>,
    timers: Mutex<TimerWheel<BucketKey>>,
    temp_root: TempDir,
}

impl ReceiveBuffer {
    pub fn new<F>(quiesce: Duration, on_flush: F) -> Result<Self>
    where
        F: Fn(Vec<PathBuf>) + Send + Sync + 'static,
    {
        let temp_root = tempfile::Builder::new()
            .prefix("rt_kaffee_receive_")
            .tempdir()?;
        let state = Arc::new(BufferState {
            buckets: Mutex::new(HashMap::new()),
            quiesce,
            on_flush: Arc::new(on_flush),
        });
        let timers = {
            let state = Arc::clone(&state);
            TimerWheel::new("receive-buffer", move |key: BucketKey| {
                flush_if_quiet(&state, &key);
            })
        };
        Ok(Self {
            state,
            timers: Mutex::new(timers),
            temp_root,
        })
    }

    /// Stages one received object and (re)arms the bucket's flush timer.
    /// Doses are written verbatim, everything else is re-encoded with a
    /// complete file meta group.
    pub fn ingest(&self, incoming: IncomingObject) -> Result<PathBuf> {
        let patient_id = non_empty_or(
            codec::string_value(&incoming.dataset, tags::PATIENT_ID),
            "unknown",
        );
        let study_uid = non_empty_or(
            codec::string_value(&incoming.dataset, tags::STUDY_INSTANCE_UID),
            "unknown",
        );
        let modality = non_empty_or(
            codec::string_value(&incoming.dataset, tags::MODALITY).to_uppercase(),
            "UNKNOWN",
        );
        let key: BucketKey = (patient_id.clone(), study_uid.clone());

        let mut buckets = self.state.buckets.lock().unwrap();

        let key_dir = self
            .temp_root
            .path()
            .join(format!("{}_{}", sanitize(&patient_id), sanitize(&study_uid)));
        std::fs::create_dir_all(&key_dir)?;
        let path = key_dir.join(format!("{modality}_{}.dcm", uuid::Uuid::new_v4().simple()));

        if modality == "RTDOSE" {
            let raw = incoming.raw_dataset.as_deref().ok_or(Error::DoseIntegrity)?;
            let dataset_sop_uid =
                codec::string_value(&incoming.dataset, tags::SOP_INSTANCE_UID);
            let meta = codec::dose_meta(
                &incoming.sop_class_uid,
                &incoming.sop_instance_uid,
                &incoming.transfer_syntax,
                &incoming.calling_ae,
                &dataset_sop_uid,
            )?;
            codec::write_verbatim(&path, &meta, raw)?;
            info!(
                "RTDOSE received and staged verbatim: {} ({} bytes)",
                path.display(),
                raw.len()
            );
        } else {
            let obj = codec::ensure_uids(
                incoming.dataset,
                &incoming.transfer_syntax,
                Some(&incoming.sop_class_uid),
                Some(&incoming.sop_instance_uid),
                Some(&incoming.calling_ae),
            )?;
            obj.write_to_file(&path)?;
            debug!("Staged {modality} object at {}", path.display());
        }

        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            files: Vec::new(),
            last_activity: Instant::now(),
        });
        bucket.files.push(path.clone());
        bucket.last_activity = Instant::now();
        drop(buckets);

        self.timers
            .lock()
            .unwrap()
            .arm(key, self.state.quiesce);
        Ok(path)
    }

    /// Number of buckets currently holding staged files.
    pub fn pending_buckets(&self) -> usize {
        self.state.buckets.lock().unwrap().len()
    }

    /// Cancels pending timers and pushes every held bucket through the
    /// flush handler synchronously. Called on shutdown.
    pub fn drain(&self) {
        let mut timers = self.timers.lock().unwrap();
        let drained: Vec<(BucketKey, Bucket)> = {
            let mut buckets = self.state.buckets.lock().unwrap();
            buckets.drain().collect()
        };
        for (key, bucket) in drained {
            timers.cancel(&key);
            if bucket.files.is_empty() {
                continue;
            }
            info!(
                "Draining receive bucket ({}, {}) with {} file(s)",
                key.0,
                key.1,
                bucket.files.len()
            );
            (self.state.on_flush)(bucket.files);
        }
        timers.stop();
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn flush_if_quiet(state: &BufferState, key: &BucketKey) {
    let files = {
        let mut buckets = state.buckets.lock().unwrap();
        let Some(bucket) = buckets.get(key) else {
            return;
        };
        // an arrival raced the timer fire; its re-armed deadline will flush
        if bucket.last_activity.elapsed() + EPSILON < state.quiesce {
            warn!("Flush timer fired during active reception, deferring");
            return;
        }
        buckets.remove(key).map(|b| b.files).unwrap_or_default()
    };
    if files.is_empty() {
        return;
    }
    debug!(
        "Flushing receive bucket ({}, {}) with {} file(s)",
        key.0,
        key.1,
        files.len()
    );
    (state.on_flush)(files);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};
    use dicom_dictionary_std::uids;

    fn incoming(patient: &str, study: &str, modality: &str, sop_uid: &str) -> IncomingObject {
        let mut obj = InMemDicomObject::new_empty();
        for (tag, vr, value) in [
            (tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE),
            (tags::SOP_INSTANCE_UID, VR::UI, sop_uid),
            (tags::PATIENT_ID, VR::LO, patient),
            (tags::STUDY_INSTANCE_UID, VR::UI, study),
            (tags::MODALITY, VR::CS, modality),
        ] {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }
        IncomingObject {
            dataset: obj,
            transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            calling_ae: "TR_SEND".to_string(),
            sop_class_uid: uids::CT_IMAGE_STORAGE.to_string(),
            sop_instance_uid: sop_uid.to_string(),
            raw_dataset: None,
        }
    }

    #[test]
    fn rapid_arrivals_produce_exactly_one_flush() {
        let flushes: Arc<Mutex<Vec<(Vec<PathBuf>, Instant)>>> = Arc::default();
        let sink = Arc::clone(&flushes);
        let quiesce = Duration::from_millis(200);
        let buffer = ReceiveBuffer::new(quiesce, move |files| {
            sink.lock().unwrap().push((files, Instant::now()));
        })
        .unwrap();

        for i in 0..3 {
            buffer
                .ingest(incoming("P42", "1.2.3.9", "CT", &format!("1.2.3.{i}")))
                .unwrap();
            std::thread::sleep(Duration::from_millis(60));
        }
        let last_arrival = Instant::now();
        std::thread::sleep(quiesce + Duration::from_millis(400));

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1, "debounce must coalesce to one flush");
        let (files, at) = &flushes[0];
        assert_eq!(files.len(), 3);
        assert!(at.duration_since(last_arrival) + EPSILON >= quiesce);
        assert_eq!(buffer.pending_buckets(), 0);
    }

    #[test]
    fn buckets_are_keyed_by_patient_and_study() {
        let flushes: Arc<Mutex<Vec<Vec<PathBuf>>>> = Arc::default();
        let sink = Arc::clone(&flushes);
        let buffer = ReceiveBuffer::new(Duration::from_millis(120), move |files| {
            sink.lock().unwrap().push(files);
        })
        .unwrap();

        buffer
            .ingest(incoming("P1", "1.2.3.1", "CT", "1.1.1"))
            .unwrap();
        buffer
            .ingest(incoming("P2", "1.2.3.1", "CT", "2.2.2"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(600));

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert!(flushes.iter().all(|f| f.len() == 1));
    }

    #[test]
    fn dose_without_raw_bytes_is_refused() {
        let buffer = ReceiveBuffer::new(Duration::from_secs(2), |_| {}).unwrap();
        let mut dose = incoming("P1", "1.2.3.1", "RTDOSE", "3.3.3");
        dose.raw_dataset = None;
        assert!(matches!(
            buffer.ingest(dose),
            Err(Error::DoseIntegrity)
        ));
    }

    #[test]
    fn dose_raw_bytes_survive_staging_byte_exact() {
        let staged: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let sink = Arc::clone(&staged);
        let buffer = ReceiveBuffer::new(Duration::from_millis(100), move |files| {
            sink.lock().unwrap().extend(files);
        })
        .unwrap();

        let payload: Vec<u8> = (0..1021u32).map(|i| (i % 255) as u8).collect();
        let mut dose = incoming("P1", "1.2.3.1", "RTDOSE", "3.3.3");
        dose.sop_class_uid = uids::RT_DOSE_STORAGE.to_string();
        dose.raw_dataset = Some(payload.clone());
        buffer.ingest(dose).unwrap();
        std::thread::sleep(Duration::from_millis(500));

        let staged = staged.lock().unwrap();
        assert_eq!(staged.len(), 1);
        let (_, bytes) = codec::read_verbatim(&staged[0]).unwrap();
        assert_eq!(bytes, payload);
    }

    #[test]
    fn drain_flushes_synchronously() {
        let flushes: Arc<Mutex<Vec<Vec<PathBuf>>>> = Arc::default();
        let sink = Arc::clone(&flushes);
        let buffer = ReceiveBuffer::new(Duration::from_secs(60), move |files| {
            sink.lock().unwrap().push(files);
        })
        .unwrap();
        buffer
            .ingest(incoming("P1", "1.2.3.1", "CT", "1.1.1"))
            .unwrap();
        buffer.drain();
        assert_eq!(flushes.lock().unwrap().len(), 1);
    }
}
