//! Plan persistence as a JSON annotation
//!
//! A plan lives in memory only for the duration of one mutation; between
//! install and uninstall it lives as JSON under [`crate::ACTIONS_ANNOTATION`]
//! on the mutated object itself. The uninstalling engine may be a different
//! build than the installing one, so reads go through a version gate:
//! same-major plans with a fully understood shape proceed, anything else is
//! refused with a `VERSION_SKEW` error rather than guessed at.
//!
//! The persisted plan is the source of truth for undo. The engine never
//! reconstructs a plan by inspecting the mutated object's shape.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result, ACTIONS_ANNOTATION};

/// Read the plan annotation off an object's metadata.
pub fn get(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ACTIONS_ANNOTATION))
        .map(String::as_str)
}

/// Store a serialized plan on an object's metadata.
pub fn set(meta: &mut ObjectMeta, plan_json: String) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(ACTIONS_ANNOTATION.to_string(), plan_json);
}

/// Remove the plan annotation, returning what was stored.
///
/// Drops the annotation map entirely when this was its last entry, so an
/// uninstalled object compares equal to one that never carried annotations.
pub fn clear(meta: &mut ObjectMeta) -> Option<String> {
    let removed = meta.annotations.as_mut()?.remove(ACTIONS_ANNOTATION);
    if meta.annotations.as_ref().is_some_and(|a| a.is_empty()) {
        meta.annotations = None;
    }
    removed
}

/// Serialize a plan into its annotation JSON.
///
/// Panics only when the plan itself cannot be serialized, which cannot
/// happen for plans the engine builds; this mirrors the fatal-vs-recoverable
/// split of the error design.
pub fn plan_json<P: Serialize>(plan: &P) -> String {
    serde_json::to_string(plan).expect("engine-built plans always serialize")
}

/// Parse a persisted plan back from its annotation JSON.
pub fn parse_plan<P: DeserializeOwned>(json: &str) -> Result<P> {
    serde_json::from_str(json)
        .map_err(|e| Error::serialization(format!("unable to parse plan annotation: {e}")))
}

/// The major component of a dotted version string, tolerating a `v` prefix.
fn major_version(version: &str) -> Option<u64> {
    version
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Gate a persisted plan against this engine build.
///
/// A plan is compatible when it was written by the same major version and
/// every field in it was understood by the parser. Unknown fields are
/// treated as material: the reader cannot prove an unknown stanza needs no
/// undo, so it refuses rather than half-restores.
pub fn ensure_compatible(
    plan_version: &str,
    unknown_fields: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    if !unknown_fields.is_empty() {
        let keys: Vec<&str> = unknown_fields.keys().map(String::as_str).collect();
        return Err(Error::version_skew(format!(
            "plan written by version {plan_version} contains unsupported entries ({}); \
             use a matching client to remove this agent",
            keys.join(", "),
        )));
    }
    let (theirs, ours) = (major_version(plan_version), major_version(crate::VERSION));
    if theirs.is_none() || theirs != ours {
        return Err(Error::version_skew(format!(
            "plan written by version {plan_version} is not compatible with engine {}; \
             use a matching client to remove this agent",
            crate::VERSION,
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::service::ServiceActions;
    use crate::actions::workload::WorkloadActions;

    #[test]
    fn annotation_round_trips_through_metadata() {
        let mut meta = ObjectMeta::default();
        assert_eq!(get(&meta), None);

        let plan = WorkloadActions {
            version: crate::VERSION.to_string(),
            referenced_service: "hello".to_string(),
            ..Default::default()
        };
        set(&mut meta, plan_json(&plan));

        let parsed: WorkloadActions = parse_plan(get(&meta).unwrap()).unwrap();
        assert_eq!(parsed, plan);

        clear(&mut meta);
        assert_eq!(meta.annotations, None);
    }

    #[test]
    fn clear_keeps_unrelated_annotations() {
        let mut meta = ObjectMeta::default();
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "payments".to_string());
        set(&mut meta, "{}".to_string());
        clear(&mut meta);
        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations.get("team").map(String::as_str), Some("payments"));
        assert!(!annotations.contains_key(crate::ACTIONS_ANNOTATION));
    }

    #[test]
    fn garbage_annotation_is_a_serialization_error() {
        let err = parse_plan::<ServiceActions>("{not json").unwrap_err();
        assert_eq!(err.code(), "SERIALIZATION");
    }

    mod version_gate {
        use super::*;

        fn no_unknowns() -> serde_json::Map<String, serde_json::Value> {
            serde_json::Map::new()
        }

        #[test]
        fn same_major_other_minor_proceeds() {
            let prior_minor = format!("{}.0.1", major());
            assert!(ensure_compatible(&prior_minor, &no_unknowns()).is_ok());
            // Leading v, as older clients stamped
            assert!(ensure_compatible(&format!("v{prior_minor}"), &no_unknowns()).is_ok());
        }

        #[test]
        fn different_major_is_refused() {
            let err = ensure_compatible("99.0.0", &no_unknowns()).unwrap_err();
            assert_eq!(err.code(), "VERSION_SKEW");
            assert!(err.to_string().contains("99.0.0"));
        }

        #[test]
        fn unparsable_version_is_refused() {
            assert!(ensure_compatible("rolling", &no_unknowns()).is_err());
            assert!(ensure_compatible("", &no_unknowns()).is_err());
        }

        #[test]
        fn unknown_fields_are_material_even_within_a_major() {
            let mut unknowns = serde_json::Map::new();
            unknowns.insert("rewire_dns".to_string(), serde_json::json!({}));
            let same_major = format!("{}.9.9", major());
            let err = ensure_compatible(&same_major, &unknowns).unwrap_err();
            assert_eq!(err.code(), "VERSION_SKEW");
            assert!(err.to_string().contains("rewire_dns"));
        }

        fn major() -> u64 {
            super::major_version(crate::VERSION).unwrap()
        }
    }
}
