//! Mapping of arbitrary DICOM string values to filesystem-safe path
//! components, plus the whitelist of tags whose values are normalized in
//! the in-memory object before placement.

use dicom_core::header::Header;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::debug;

/// Maps a string to a filesystem-safe path component.
///
/// `:` and `/` become `-`, every other character outside
/// `[A-Za-z0-9_.\- ]` becomes `_`, runs of two or more `_`/`-` collapse to
/// a single `_`, and leading/trailing `_` are trimmed. The mapping is
/// idempotent.
pub fn sanitize(name: &str) -> String {
    sanitize_with(name, false)
}

/// Variant used for PatientName values only: the DICOM name component
/// separator `^` survives the mapping.
pub fn sanitize_patient_name(name: &str) -> String {
    sanitize_with(name, true)
}

fn sanitize_with(name: &str, keep_caret: bool) -> String {
    let replaced: Vec<char> = name
        .chars()
        .map(|c| match c {
            ':' | '/' => '-',
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' | '-' | ' ' => c,
            '^' if keep_caret => c,
            _ => '_',
        })
        .collect();

    let mut out = String::with_capacity(replaced.len());
    let mut i = 0;
    while i < replaced.len() {
        let c = replaced[i];
        if c == '_' || c == '-' {
            let start = i;
            while i < replaced.len() && matches!(replaced[i], '_' | '-') {
                i += 1;
            }
            // a lone separator survives, a run always collapses to `_`
            out.push(if i - start == 1 { c } else { '_' });
        } else {
            out.push(c);
            i += 1;
        }
    }

    out.trim_matches('_').to_string()
}

type Sanitizer = fn(&str) -> String;

/// Tags whose values are normalized in the received object itself. The
/// PatientName entry uses the caret-preserving variant.
pub const TAG_SANITIZERS: &[(Tag, Sanitizer)] = &[
    (tags::PATIENT_NAME, sanitize_patient_name),
    (tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION, sanitize),
];

/// Applies [`TAG_SANITIZERS`] to the object. A tag value is replaced only
/// when the normalized form differs from the stored one.
pub fn apply_tag_sanitizers(obj: &mut InMemDicomObject) {
    for (tag, sanitizer) in TAG_SANITIZERS {
        let Ok(Some(element)) = obj.element_opt(*tag) else {
            continue;
        };
        let Ok(value) = element.to_str() else {
            continue;
        };
        let vr = element.vr();
        let current = value.trim_end_matches(['\0', ' ']).to_string();
        let cleaned = sanitizer(&current);
        if cleaned != current {
            debug!("Normalized {tag} value {current:?} to {cleaned:?}");
            obj.put(DataElement::new(*tag, vr, PrimitiveValue::from(cleaned)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_and_slash_become_dash() {
        assert_eq!(sanitize("10:30/b"), "10-30-b");
    }

    #[test]
    fn forbidden_characters_become_underscore() {
        assert_eq!(sanitize("Pelvis (links)"), "Pelvis _links");
        assert_eq!(sanitize("Kopf & Hals"), "Kopf _ Hals");
    }

    #[test]
    fn separator_runs_collapse() {
        assert_eq!(sanitize("a//b"), "a_b");
        assert_eq!(sanitize("a__--__b"), "a_b");
    }

    #[test]
    fn leading_and_trailing_underscores_are_trimmed() {
        assert_eq!(sanitize("_plan_"), "plan");
        assert_eq!(sanitize("??plan??"), "plan");
    }

    #[test]
    fn single_separators_survive() {
        assert_eq!(sanitize("Head-ADP"), "Head-ADP");
        assert_eq!(sanitize("Head_ADP"), "Head_ADP");
    }

    #[test]
    fn patient_name_keeps_caret() {
        assert_eq!(sanitize_patient_name("Doe^John"), "Doe^John");
        assert_eq!(sanitize("Doe^John"), "Doe_John");
    }

    #[test]
    fn sanitization_is_idempotent() {
        for s in [
            "Head_ADP",
            "a//b::c",
            "Müller^Hans",
            " spaced out ",
            "__x__",
            "plan:1/2",
            "Pelvis (links)",
            "",
        ] {
            let once = sanitize(s);
            assert_eq!(sanitize(&once), once, "not idempotent for {s:?}");
            let once = sanitize_patient_name(s);
            assert_eq!(
                sanitize_patient_name(&once),
                once,
                "patient variant not idempotent for {s:?}"
            );
        }
    }
}
