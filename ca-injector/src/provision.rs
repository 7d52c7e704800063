//! Makes sure the CA bundle ConfigMap exists in a namespace before pods referencing it are admitted.
//!
//! Existence is read from the cluster on every call. The bundle is only downloaded when the
//! ConfigMap is missing, and a create that loses a race against another replica counts as success.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::config::CaBundleConfig;
use crate::error::ProvisionError;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "ca-injector";

/// The slice of the Kubernetes API the provisioner needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapApi: Send + Sync {
    /// Returns `None` when the ConfigMap does not exist.
    async fn get_opt(&self, namespace: &str, name: &str) -> kube::Result<Option<ConfigMap>>;

    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> kube::Result<ConfigMap>;
}

pub struct KubeConfigMaps {
    client: kube::Client,
}

impl KubeConfigMaps {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapApi for KubeConfigMaps {
    async fn get_opt(&self, namespace: &str, name: &str) -> kube::Result<Option<ConfigMap>> {
        Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> kube::Result<ConfigMap> {
        Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), config_map)
            .await
    }
}

/// Where the raw CA bundle comes from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProvisionError>;
}

/// Downloads the bundle over HTTP(S) with a bounded timeout.
pub struct HttpBundleSource {
    client: reqwest::Client,
}

impl HttpBundleSource {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProvisionError> {
        let fetch_error = |reason: String| ProvisionError::Fetch {
            url: url.to_string(),
            reason,
        };

        debug!(url = %url, "Fetching CA bundle");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(format!("reading body failed: {e}")))?;
        Ok(body.to_vec())
    }
}

/// The bundle must be plain ASCII. Nothing is replaced or dropped.
pub fn decode_bundle(url: &str, bytes: Vec<u8>) -> Result<String, ProvisionError> {
    let decode_error = || ProvisionError::Decode {
        url: url.to_string(),
    };
    if !bytes.is_ascii() {
        return Err(decode_error());
    }
    String::from_utf8(bytes).map_err(|_| decode_error())
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 || response.reason == "AlreadyExists")
}

/// Build the ConfigMap holding `bundle` under the configured filename.
pub fn bundle_config_map(config: &CaBundleConfig, namespace: &str, bundle: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config.configmap_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(config.filename.clone(), bundle)])),
        ..Default::default()
    }
}

pub struct Provisioner {
    config_maps: Box<dyn ConfigMapApi>,
    source: Box<dyn BundleSource>,
}

impl Provisioner {
    pub fn new(
        config_maps: impl ConfigMapApi + 'static,
        source: impl BundleSource + 'static,
    ) -> Self {
        Self {
            config_maps: Box::new(config_maps),
            source: Box::new(source),
        }
    }

    /// Make sure the bundle ConfigMap exists in `namespace` once this returns `Ok`.
    /// Existing ConfigMaps are never modified.
    pub async fn ensure(&self, config: &CaBundleConfig, namespace: &str) -> Result<(), ProvisionError> {
        let name = &config.configmap_name;

        let existing = self
            .config_maps
            .get_opt(namespace, name)
            .await
            .map_err(|source| ProvisionError::Lookup {
                namespace: namespace.to_string(),
                name: name.clone(),
                source,
            })?;
        if existing.is_some() {
            debug!("ConfigMap {}/{} already exists", namespace, name);
            return Ok(());
        }

        let bytes = self.source.fetch(&config.source_url).await?;
        let bundle = decode_bundle(&config.source_url, bytes)?;
        let config_map = bundle_config_map(config, namespace, bundle);

        match self.config_maps.create(namespace, &config_map).await {
            Ok(_) => {
                info!("Created ConfigMap {}/{}", namespace, name);
                Ok(())
            }
            Err(err) if is_already_exists(&err) => {
                warn!(
                    "ConfigMap {}/{} was created concurrently, using the existing one",
                    namespace, name
                );
                Ok(())
            }
            Err(source) => Err(ProvisionError::Create {
                namespace: namespace.to_string(),
                name: name.clone(),
                source,
            }),
        }
    }
}
