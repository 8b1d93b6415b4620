//! Sanitizer (component B): strips server-generated and operational
//! fields from a cluster object, leaving only declarative intent, and
//! marshals the result to byte-stable, canonically ordered YAML.
//!
//! `serde_json::Value` (built without the `preserve_order` feature) backs
//! its objects with a `BTreeMap`, so any two logically-equal JSON
//! documents already iterate their keys in the same sorted order at every
//! depth. The canonical marshaling below only has to impose the
//! non-alphabetical *top-level* ordering (apiVersion, kind, metadata, then
//! the rest) by hand; everywhere else it rides on that guarantee instead
//! of re-sorting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object has no apiVersion/kind")]
    MissingTypeMeta,
    #[error("failed to marshal canonical YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// metadata.{uid, resourceVersion, generation, creationTimestamp,
// deletionTimestamp, deletionGracePeriodSeconds, selfLink, managedFields,
// ownerReferences, finalizers, ...} are dropped implicitly: PartialObjectMeta
// only has room for name/namespace/labels/annotations, so anything else
// never survives the copy in `sanitize_metadata`.

const REMOVED_ANNOTATION_PREFIXES: &[&str] = &[
    "kubectl.kubernetes.io/",
    "control-plane.alpha.kubernetes.io/",
    "deployment.kubernetes.io/",
    "autoscaling.alpha.kubernetes.io/",
];

/// The declarative subset of a Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: PartialObjectMeta,
    /// All top-level keys other than `apiVersion`, `kind`, `metadata`,
    /// `status`. A `BTreeMap` so iteration order is always ascending
    /// lexicographic, matching the canonical marshal rule directly.
    pub payload: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Strips server-generated fields and returns the declarative subset.
pub fn sanitize(obj: &Value) -> Result<SanitizedObject, Error> {
    let api_version = obj
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or(Error::MissingTypeMeta)?
        .to_owned();
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(Error::MissingTypeMeta)?
        .to_owned();

    let metadata = sanitize_metadata(obj.get("metadata"));

    let mut payload: BTreeMap<String, Value> = obj
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(k, _)| !matches!(k.as_str(), "apiVersion" | "kind" | "metadata" | "status"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    apply_kind_specific_removals(&kind, &mut payload);

    Ok(SanitizedObject {
        api_version,
        kind,
        metadata,
        payload,
    })
}

fn sanitize_metadata(metadata: Option<&Value>) -> PartialObjectMeta {
    let Some(metadata) = metadata.and_then(Value::as_object) else {
        return PartialObjectMeta::default();
    };

    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let labels = string_map(metadata.get("labels"));
    let annotations = string_map(metadata.get("annotations")).map(|m| {
        m.into_iter()
            .filter(|(k, _)| {
                !REMOVED_ANNOTATION_PREFIXES
                    .iter()
                    .any(|prefix| k.starts_with(prefix))
            })
            .collect::<BTreeMap<_, _>>()
    });
    // An annotations map that becomes empty after filtering is omitted
    // entirely, not serialized as `{}`.
    let annotations = annotations.filter(|m| !m.is_empty());

    PartialObjectMeta {
        name,
        namespace,
        labels,
        annotations,
    }
}

fn string_map(value: Option<&Value>) -> Option<BTreeMap<String, String>> {
    let obj = value?.as_object()?;
    Some(
        obj.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect(),
    )
}

fn apply_kind_specific_removals(kind: &str, payload: &mut BTreeMap<String, Value>) {
    let Some(spec) = payload.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    match kind {
        "Service" => {
            for field in [
                "clusterIP",
                "clusterIPs",
                "healthCheckNodePort",
                "ipFamilies",
                "ipFamilyPolicy",
                "internalTrafficPolicy",
            ] {
                spec.remove(field);
            }
        }
        "Pod" => {
            spec.remove("nodeName");
        }
        "PersistentVolumeClaim" => {
            spec.remove("volumeName");
            spec.remove("volumeMode");
        }
        _ => {}
    }
}

/// Produces canonical YAML: top-level order `apiVersion`, `kind`,
/// `metadata`, then remaining payload keys ascending; within `metadata`,
/// only non-empty fields in the order `name, namespace, labels,
/// annotations`.
pub fn marshal_ordered_yaml(sanitized: &SanitizedObject) -> Result<Vec<u8>, Error> {
    let mut top = serde_yaml::Mapping::new();
    top.insert(key("apiVersion"), val(&sanitized.api_version)?);
    top.insert(key("kind"), val(&sanitized.kind)?);
    top.insert(key("metadata"), metadata_value(&sanitized.metadata)?);

    for (k, v) in &sanitized.payload {
        top.insert(key(k), serde_yaml::to_value(v)?);
    }

    serde_yaml::to_string(&serde_yaml::Value::Mapping(top)).map(String::into_bytes)
}

fn metadata_value(meta: &PartialObjectMeta) -> Result<serde_yaml::Value, Error> {
    let mut m = serde_yaml::Mapping::new();
    if !meta.name.is_empty() {
        m.insert(key("name"), val(&meta.name)?);
    }
    if let Some(ns) = &meta.namespace {
        if !ns.is_empty() {
            m.insert(key("namespace"), val(ns)?);
        }
    }
    if let Some(labels) = &meta.labels {
        if !labels.is_empty() {
            m.insert(key("labels"), serde_yaml::to_value(labels)?);
        }
    }
    if let Some(annotations) = &meta.annotations {
        if !annotations.is_empty() {
            m.insert(key("annotations"), serde_yaml::to_value(annotations)?);
        }
    }
    Ok(serde_yaml::Value::Mapping(m))
}

fn key(s: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(s.to_owned())
}

fn val(s: &str) -> Result<serde_yaml::Value, Error> {
    Ok(serde_yaml::Value::String(s.to_owned()))
}
