//! This module defines the webhook configuration.
//!
//! Values come from CLI flags, their environment variables, or an optional YAML file.
//! Flags and environment variables take precedence over the file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use serde::Deserialize;

/// Directory the CA bundle file is mounted into.
pub const CERTS_DIR: &str = "/etc/ssl/certs";

#[derive(Parser, Debug, Clone)]
#[command(name = "ca-injector")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    pub config_file: Option<PathBuf>,

    /// Name of the ConfigMap holding the CA bundle in every namespace.
    #[arg(long, env = "CA_BUNDLE_CONFIGMAP")]
    pub configmap_name: Option<String>,

    /// File name of the bundle inside the ConfigMap and under /etc/ssl/certs.
    #[arg(long, env = "CA_BUNDLE_FILENAME")]
    pub filename: Option<String>,

    /// URL the CA bundle is downloaded from.
    #[arg(long, env = "CA_BUNDLE_URL")]
    pub source_url: Option<String>,

    /// Annotation that must be set to "true" for a pod to be mutated.
    #[arg(long, env = "CA_BUNDLE_ANNOTATION")]
    pub annotation: Option<String>,

    /// Namespace used when neither the object nor the request names one.
    /// Usually the namespace the webhook itself runs in.
    #[arg(long, env = "POD_NAMESPACE")]
    pub default_namespace: Option<String>,

    /// The path to the TLS certificate.
    #[arg(long, default_value = "/certs/tls.crt")]
    pub tls_cert: PathBuf,

    /// The path to the TLS key.
    #[arg(long, default_value = "/certs/tls.key")]
    pub tls_key: PathBuf,

    /// The port to listen on.
    #[arg(short, long, default_value = "8443")]
    pub port: u16,

    /// Upper bound on the CA bundle download, in seconds.
    #[arg(long, default_value = "10")]
    pub fetch_timeout_secs: u64,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

/// On-disk form of the configuration. Every key is optional so the file can be partial.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    pub configmap_name: Option<String>,
    pub filename: Option<String>,
    pub source_url: Option<String>,
    pub annotation: Option<String>,
    pub default_namespace: Option<String>,
}

impl ConfigFile {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_file(file_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read {}", file_path.display()))?;
        Self::from_str(&config_content)
    }
}

/// Process-wide settings, resolved once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CaBundleConfig {
    pub configmap_name: String,
    pub filename: String,
    pub source_url: String,
    pub annotation: String,
    pub default_namespace: Option<String>,
}

fn non_blank(value: &String) -> bool {
    !value.trim().is_empty()
}

/// A blank flag or environment variable counts as unset, so it never hides the file value.
fn required(flag: Option<&String>, file: Option<String>, key: &str) -> anyhow::Result<String> {
    flag.filter(|value| non_blank(value))
        .cloned()
        .or(file.filter(non_blank))
        .ok_or_else(|| anyhow!("Missing required configuration value `{key}`"))
}

impl CaBundleConfig {
    /// Merge the CLI/env values over the optional configuration file.
    pub fn resolve(args: &Args) -> anyhow::Result<Self> {
        let file = match &args.config_file {
            Some(path) => ConfigFile::from_file(path).context("Failed to load configuration file")?,
            None => ConfigFile::default(),
        };

        let config = Self {
            configmap_name: required(args.configmap_name.as_ref(), file.configmap_name, "configmapName")?,
            filename: required(args.filename.as_ref(), file.filename, "filename")?,
            source_url: required(args.source_url.as_ref(), file.source_url, "sourceUrl")?,
            annotation: required(args.annotation.as_ref(), file.annotation, "annotation")?,
            default_namespace: args
                .default_namespace
                .clone()
                .filter(non_blank)
                .or(file.default_namespace.filter(non_blank)),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        // The filename doubles as a ConfigMap key and a subPath.
        if self.filename.contains('/') {
            bail!("filename {:?} must not contain '/'", self.filename);
        }
        if !self.source_url.starts_with("http://") && !self.source_url.starts_with("https://") {
            bail!("sourceUrl {:?} must be an http(s) URL", self.source_url);
        }
        Ok(())
    }

    /// Where the bundle file appears inside every mutated container.
    pub fn mount_path(&self) -> String {
        format!("{}/{}", CERTS_DIR, self.filename)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> CaBundleConfig {
    CaBundleConfig {
        configmap_name: "ca-bundle".to_string(),
        filename: "ca_bundle.pem".to_string(),
        source_url: "https://curl.se/ca/cacert.pem".to_string(),
        annotation: "example.com/ca-injector".to_string(),
        default_namespace: Some("webhook".to_string()),
    }
}
