mod common;

use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids;
use tempfile::TempDir;

use rt_kaffee_dcm_node::codec;
use rt_kaffee_dcm_node::grouper::{EntrySource, PlanGrouper};

use common::{ct, rt_dose, rt_plan, rt_struct};

struct Fixture {
    _root: TempDir,
    receive_root: PathBuf,
    staging: PathBuf,
    grouper: PlanGrouper,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let receive_root = root.path().join("received");
        let staging = root.path().join("staging");
        std::fs::create_dir_all(&receive_root).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        let grouper = PlanGrouper::new(
            receive_root.clone(),
            receive_root.join("failed"),
            Default::default(),
            None,
        );
        Self {
            _root: root,
            receive_root,
            staging,
            grouper,
        }
    }

    fn failed_dir(&self) -> PathBuf {
        self.receive_root.join("failed")
    }

    fn patient_dir(&self, name: &str) -> PathBuf {
        self.receive_root.join(name)
    }
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Writes a dose the way the receive buffer stages it: file meta group
/// plus the wire dataset bytes untouched.
fn stage_dose(path: &Path, dose: common::TestObject, sop_uid: &str) -> Vec<u8> {
    let wire = dose.wire_bytes();
    let meta = codec::dose_meta(
        uids::RT_DOSE_STORAGE,
        sop_uid,
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
        "TR_SEND",
        sop_uid,
    )
    .unwrap();
    codec::write_verbatim(path, &meta, &wire).unwrap();
    wire
}

#[test]
fn plan_dose_and_ct_series_join_into_one_folder() {
    let fx = Fixture::new();
    let study = "1.2.3.STUDY.9.77";

    let plan_path = fx.staging.join("RTPLAN_a.dcm");
    rt_plan("1.2.3.PLAN.A", "P42", study, "FOR.X", "Head_ADP").write(&plan_path);

    let dose_path = fx.staging.join("RTDOSE_b.dcm");
    let dose_wire = stage_dose(
        &dose_path,
        rt_dose("1.2.3.DOSE.B", "P42", study, "1.2.3.PLAN.A"),
        "1.2.3.DOSE.B",
    );

    let struct_path = fx.staging.join("RTSTRUCT_c.dcm");
    rt_struct("1.2.3.STRUCT.C", "P42", study, "FOR.X").write(&struct_path);

    let mut files = vec![plan_path, dose_path, struct_path];
    for i in 0..5 {
        let ct_path = fx.staging.join(format!("CT_{i}.dcm"));
        ct(&format!("1.2.3.CT.{i}"), "P42", study, "FOR.X").write(&ct_path);
        files.push(ct_path);
    }

    let placed = fx.grouper.group_and_place(files, EntrySource::Network);

    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].plan_label, "Head_ADP");
    assert_eq!(placed[0].patient_id, "P42");

    let plan_folder = fx.patient_dir("Doe_Jane (P42)").join("Head_ADP_77");
    assert_eq!(placed[0].folder, plan_folder);
    let names = list_files(&plan_folder);
    assert!(names.contains(&"RTPLAN_Head_ADP.dcm".to_string()));
    assert!(names.contains(&"RTDOSE_Head_ADP.dcm".to_string()));
    assert!(names.contains(&"RTSTRUCT_Head_ADP.dcm".to_string()));
    let ct_count = names.iter().filter(|n| n.starts_with("CT.")).count();
    assert_eq!(ct_count, 5);
    assert_eq!(names.len(), 8);

    // the placed dose is byte-identical to what was received
    let (_, placed_wire) =
        codec::read_verbatim(&plan_folder.join("RTDOSE_Head_ADP.dcm")).unwrap();
    assert_eq!(placed_wire, dose_wire);

    // no orphan folder appeared for this patient
    let patient_entries = list_files(&fx.patient_dir("Doe_Jane (P42)"));
    assert_eq!(patient_entries, vec!["Head_ADP_77".to_string()]);

    // network staging was cleaned up
    assert_eq!(std::fs::read_dir(&fx.staging).unwrap().count(), 0);
}

#[test]
fn placed_files_have_complete_uids() {
    let fx = Fixture::new();
    let study = "1.2.3.STUDY.9.77";
    let plan_path = fx.staging.join("RTPLAN_a.dcm");
    rt_plan("1.2.3.PLAN.A", "P42", study, "FOR.X", "Head_ADP").write(&plan_path);
    let ct_path = fx.staging.join("CT_0.dcm");
    ct("1.2.3.CT.0", "P42", study, "FOR.X").write(&ct_path);

    fx.grouper
        .group_and_place(vec![plan_path, ct_path], EntrySource::Network);

    let plan_folder = fx.patient_dir("Doe_Jane (P42)").join("Head_ADP_77");
    for name in list_files(&plan_folder) {
        let obj = codec::read_full(&plan_folder.join(&name)).unwrap();
        let sop_uid = codec::string_value(&obj, tags::SOP_INSTANCE_UID);
        assert!(!sop_uid.is_empty(), "{name} lost its SOP instance UID");
        assert_eq!(
            obj.meta().media_storage_sop_instance_uid.trim_end_matches('\0'),
            sop_uid,
            "{name} has diverging media storage UID"
        );
        assert!(!obj.meta().transfer_syntax.trim().is_empty());
    }
}

#[test]
fn cross_patient_dose_is_rejected_and_becomes_an_orphan() {
    let fx = Fixture::new();

    let plan_path = fx.staging.join("RTPLAN_a.dcm");
    rt_plan("1.2.3.PLAN.A", "P42", "1.2.3.STUDY.9.77", "FOR.X", "Head_ADP").write(&plan_path);

    // referenced SOP UID matches, patient does not
    let dose_path = fx.staging.join("RTDOSE_b.dcm");
    stage_dose(
        &dose_path,
        rt_dose("1.2.3.DOSE.B", "P43", "1.2.3.STUDY.9.88", "1.2.3.PLAN.A"),
        "1.2.3.DOSE.B",
    );

    fx.grouper
        .group_and_place(vec![plan_path, dose_path], EntrySource::Network);

    let plan_folder = fx.patient_dir("Doe_Jane (P42)").join("Head_ADP_77");
    assert_eq!(list_files(&plan_folder), vec!["RTPLAN_Head_ADP.dcm".to_string()]);

    let orphan_folder = fx.patient_dir("Doe_Jane (P43)").join("Unzugeordnet_88");
    assert_eq!(
        list_files(&orphan_folder),
        vec!["RTDOSE_PlanDose.dcm".to_string()]
    );
}

#[test]
fn cts_shared_between_plans_are_copied_into_both_folders() {
    let fx = Fixture::new();
    let study = "1.2.3.STUDY.9.77";
    let plan_a = fx.staging.join("RTPLAN_a.dcm");
    rt_plan("1.2.3.PLAN.A", "P42", study, "FOR.X", "Head_ADP").write(&plan_a);
    let plan_b = fx.staging.join("RTPLAN_b.dcm");
    rt_plan("1.2.3.PLAN.B", "P42", study, "FOR.X", "Head_Boost").write(&plan_b);
    let ct_path = fx.staging.join("CT_0.dcm");
    ct("1.2.3.CT.0", "P42", study, "FOR.X").write(&ct_path);

    let placed = fx
        .grouper
        .group_and_place(vec![plan_a, plan_b, ct_path], EntrySource::Network);

    assert_eq!(placed.len(), 2);
    let patient = fx.patient_dir("Doe_Jane (P42)");
    for folder in ["Head_ADP_77", "Head_Boost_77"] {
        let names = list_files(&patient.join(folder));
        assert!(
            names.contains(&"CT.1.2.3.CT.0.dcm".to_string()),
            "CT missing from {folder}: {names:?}"
        );
    }
}

#[test]
fn unparseable_files_are_quarantined_with_error_sibling() {
    let fx = Fixture::new();
    let garbage = fx.staging.join("CT_garbage.dcm");
    std::fs::write(&garbage, b"this is not dicom").unwrap();

    let placed = fx
        .grouper
        .group_and_place(vec![garbage.clone()], EntrySource::Network);

    assert!(placed.is_empty());
    assert!(!garbage.exists());
    let failed = list_files(&fx.failed_dir());
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().any(|n| n.ends_with("CT_garbage.dcm")));
    assert!(failed.iter().any(|n| n.ends_with(".error")));
}

#[test]
fn unparseable_dose_named_files_are_kept_byte_exact() {
    let fx = Fixture::new();
    let raw = fx.staging.join("rtdose_export.dcm");
    let payload = b"broken dose bytes".to_vec();
    std::fs::write(&raw, &payload).unwrap();

    fx.grouper
        .group_and_place(vec![raw.clone()], EntrySource::Network);

    // not quarantined: preserved under the unknown patient
    let orphan = fx
        .patient_dir("UNKNOWN (UNKNOWN)")
        .join("Unzugeordnet_unknown")
        .join("rtdose_export.dcm");
    assert!(orphan.exists());
    assert_eq!(std::fs::read(&orphan).unwrap(), payload);
    assert!(
        !fx.failed_dir().exists() || list_files(&fx.failed_dir()).is_empty(),
        "raw dose must not be quarantined"
    );
}

#[test]
fn orphans_without_any_plan_land_in_the_orphan_folder() {
    let fx = Fixture::new();
    let study = "1.2.3.STUDY.9.55";
    let ct_path = fx.staging.join("CT_0.dcm");
    ct("1.2.3.CT.0", "P7", study, "FOR.Y").write(&ct_path);
    let struct_path = fx.staging.join("RTSTRUCT_s.dcm");
    rt_struct("1.2.3.STRUCT.S", "P7", study, "FOR.Y").write(&struct_path);

    let placed = fx
        .grouper
        .group_and_place(vec![ct_path, struct_path], EntrySource::Network);

    assert!(placed.is_empty());
    let orphan_folder = fx.patient_dir("Doe_Jane (P7)").join("Unzugeordnet_55");
    let names = list_files(&orphan_folder);
    assert!(names.contains(&"CT.1.2.3.CT.0.dcm".to_string()));
    assert!(names.iter().any(|n| n.starts_with("RTSTRUCT_")));
}

#[test]
fn import_entry_leaves_source_files_in_place() {
    let fx = Fixture::new();
    let plan_path = fx.staging.join("RTPLAN_a.dcm");
    rt_plan("1.2.3.PLAN.A", "P42", "1.2.3.STUDY.9.77", "FOR.X", "Head_ADP").write(&plan_path);

    let placed = fx
        .grouper
        .group_and_place(vec![plan_path.clone()], EntrySource::Import);

    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].source_ae, "IMPORT_FOLDER");
    assert!(plan_path.exists(), "import sources are cleared by the caller");
}
