//! Decides whether a pod gets the CA bundle and builds the mutated copy.

use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::CaBundleConfig;
use crate::error::Error;
use crate::provision::Provisioner;

/// Name of the injected volume and of every injected mount.
pub const VOLUME_NAME: &str = "ca-bundle";

/// rw-r--r--
pub const DEFAULT_MODE: i32 = 0o644;

/// A pod, or any object shaped like one, as received in the admission request.
/// Only the parts the webhook touches are typed; everything else is carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodDocument {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodDocumentSpec>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDocumentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<ContainerDocument>>,
    /// Required for a valid pod, but a missing list only means there is nothing to mount into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerDocument>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Only the exact string "true" opts a pod in. Read from the raw object so that
/// non-string values (`true`, `1`) are a plain "no" rather than a parse failure.
pub fn is_triggered(object: &Value, annotation: &str) -> bool {
    object
        .get("metadata")
        .and_then(|metadata| metadata.get("annotations"))
        .and_then(|annotations| annotations.get(annotation))
        .map_or(false, |value| value.as_str() == Some("true"))
}

/// Pick the namespace the ConfigMap has to live in.
/// The object's own namespace wins, then the request's, then the configured fallback.
pub fn resolve_namespace<'a>(
    document: &'a PodDocument,
    request_namespace: Option<&'a str>,
    config: &'a CaBundleConfig,
) -> Option<&'a str> {
    let non_empty = |namespace: &&str| !namespace.is_empty();
    document
        .metadata
        .namespace
        .as_deref()
        .filter(non_empty)
        .or(request_namespace.filter(non_empty))
        .or(config.default_namespace.as_deref())
}

pub fn ca_bundle_volume(config: &CaBundleConfig) -> Volume {
    Volume {
        name: VOLUME_NAME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config.configmap_name.clone(),
            default_mode: Some(DEFAULT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ca_bundle_mount(config: &CaBundleConfig) -> VolumeMount {
    VolumeMount {
        name: VOLUME_NAME.to_string(),
        mount_path: config.mount_path(),
        sub_path: Some(config.filename.clone()),
        ..Default::default()
    }
}

/// Return a copy of `document` with the bundle volume appended to the pod volumes
/// and the bundle mount appended to every init container and container.
pub fn inject_ca_bundle(document: &PodDocument, config: &CaBundleConfig) -> PodDocument {
    let mut modified = document.clone();
    let spec = modified.spec.get_or_insert_with(PodDocumentSpec::default);

    spec.volumes
        .get_or_insert_with(Vec::new)
        .push(ca_bundle_volume(config));

    let mount = ca_bundle_mount(config);
    let containers = spec
        .init_containers
        .iter_mut()
        .chain(spec.containers.iter_mut())
        .flatten();
    for container in containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount.clone());
    }

    modified
}

/// Outcome of planning one admitted object.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    /// Not opted in: the object is admitted exactly as received.
    Unchanged,
    /// Opted in: the typed document as received and its mutated copy.
    Mutated {
        original: PodDocument,
        modified: PodDocument,
    },
}

/// Decide what the object should be admitted as.
///
/// Only opted-in objects are parsed into a [`PodDocument`], and they are only mutated
/// after the ConfigMap is known to exist in the target namespace.
pub async fn plan(
    object: &Value,
    request_namespace: Option<&str>,
    config: &CaBundleConfig,
    provisioner: &Provisioner,
) -> Result<Planned, Error> {
    if !is_triggered(object, &config.annotation) {
        debug!(
            "Skipping object {:?}: annotation {} is not \"true\"",
            object.pointer("/metadata/name"),
            config.annotation
        );
        return Ok(Planned::Unchanged);
    }

    let original: PodDocument = serde_json::from_value(object.clone())?;
    let namespace =
        resolve_namespace(&original, request_namespace, config).ok_or(Error::MissingNamespace)?;
    provisioner.ensure(config, namespace).await?;

    info!(
        "Injecting CA bundle into pod {:?} in namespace={}",
        original.metadata.name.as_ref().or(original.metadata.generate_name.as_ref()),
        namespace
    );
    let modified = inject_ca_bundle(&original, config);
    Ok(Planned::Mutated { original, modified })
}
