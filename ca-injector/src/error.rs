/// Failures while making sure the CA bundle ConfigMap exists.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The bundle source was unreachable or answered with a non-success status.
    #[error("fetch {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    /// The bundle body was not ASCII text.
    #[error("CA bundle from {url} is not valid ASCII text")]
    Decode { url: String },

    /// Reading the ConfigMap failed for a reason other than "not found".
    #[error("failed to look up ConfigMap {namespace}/{name}: {source}")]
    Lookup {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Creating the ConfigMap failed for a reason other than "already exists".
    #[error("failed to create ConfigMap {namespace}/{name}: {source}")]
    Create {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Failures that abort the mutation of a single admission request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("no namespace on the object, the request or the webhook configuration")]
    MissingNamespace,

    #[error("invalid pod document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("failed to encode patch: {0}")]
    Patch(#[source] serde_json::Error),
}
