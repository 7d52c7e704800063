//! Admission review handling and the HTTP routes serving it.
//!
//! Only `request.uid` is required in the incoming review. `request.object` is kept as raw JSON
//! until the annotation gate has passed, so objects that are not opted in are always allowed
//! whatever their shape.
//!
//! A mutation that cannot complete fails closed: the reply is HTTP 500 with a denied review,
//! so the API server's `failurePolicy` decides instead of a pod silently missing its CA bundle.

use std::{convert::Infallible, sync::Arc};

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use warp::{
    http::StatusCode,
    reply::{self, Json, WithStatus},
    Filter, Rejection, Reply,
};

use crate::config::CaBundleConfig;
use crate::error::Error;
use crate::mutate::{plan, Planned};
use crate::patch::{diff, encode, PATCH_TYPE};
use crate::provision::Provisioner;

pub const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";
pub const REVIEW_KIND: &str = "AdmissionReview";

/// Incoming `AdmissionReview`. Fields the webhook does not use are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub request: Option<AdmissionRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionRequest {
    /// Opaque, echoed back untouched.
    pub uid: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub object: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: Value,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    /// Base64 of the JSON Patch document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseStatus {
    pub code: u16,
    pub message: String,
}

impl AdmissionResponse {
    pub fn allow(uid: Value, patch: &Patch) -> Result<Self, Error> {
        Ok(Self {
            uid,
            allowed: true,
            status: None,
            patch: Some(encode(patch).map_err(Error::Patch)?),
            patch_type: Some(PATCH_TYPE.to_string()),
        })
    }

    pub fn deny(uid: Value, code: StatusCode, message: impl ToString) -> Self {
        Self {
            uid,
            allowed: false,
            status: Some(ResponseStatus {
                code: code.as_u16(),
                message: message.to_string(),
            }),
            patch: None,
            patch_type: None,
        }
    }

    pub fn into_review(self, api_version: Option<String>) -> AdmissionReviewResponse {
        AdmissionReviewResponse {
            api_version: api_version.unwrap_or_else(|| REVIEW_API_VERSION.to_string()),
            kind: REVIEW_KIND.to_string(),
            response: self,
        }
    }
}

pub struct Webhook {
    config: CaBundleConfig,
    provisioner: Provisioner,
}

impl Webhook {
    pub fn new(config: CaBundleConfig, provisioner: Provisioner) -> Self {
        Self {
            config,
            provisioner,
        }
    }

    /// Build the response for one request: always allowed, uid echoed, patch attached.
    /// An empty patch is still attached when the object is not opted in.
    pub async fn review(&self, req: &AdmissionRequest) -> Result<AdmissionResponse, Error> {
        let planned = plan(
            &req.object,
            req.namespace.as_deref(),
            &self.config,
            &self.provisioner,
        )
        .await?;

        let patch = match planned {
            Planned::Unchanged => Patch(Vec::new()),
            Planned::Mutated { original, modified } => diff(&original, &modified)?,
        };

        tracing::debug!("Patch for {}: {:?}", req.uid, patch);
        AdmissionResponse::allow(req.uid.clone(), &patch)
    }
}

fn reply_with(review: AdmissionReviewResponse, status: StatusCode) -> WithStatus<Json> {
    reply::with_status(reply::json(&review), status)
}

async fn mutate_handler(
    body: AdmissionReview,
    webhook: Arc<Webhook>,
) -> Result<WithStatus<Json>, Infallible> {
    tracing::trace!("Admission Handler request {:?}", body);

    let AdmissionReview {
        api_version,
        request,
    } = body;
    let Some(req) = request else {
        tracing::error!("Invalid admission review: missing request");
        let res = AdmissionResponse::deny(
            Value::Null,
            StatusCode::BAD_REQUEST,
            "admission review has no request",
        );
        return Ok(reply_with(res.into_review(api_version), StatusCode::BAD_REQUEST));
    };

    match webhook.review(&req).await {
        Ok(response) => {
            tracing::debug!("Admission Handler response {:?}", response);
            Ok(reply_with(response.into_review(api_version), StatusCode::OK))
        }
        Err(err) => {
            tracing::error!("Admission of {} {:?} failed: {}", req.uid, req.name, err);
            let res = AdmissionResponse::deny(
                req.uid.clone(),
                StatusCode::INTERNAL_SERVER_ERROR,
                err,
            );
            Ok(reply_with(
                res.into_review(api_version),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

/// `POST /mutate` and `GET /health`.
pub fn routes(
    webhook: Arc<Webhook>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let mutate = warp::post()
        .and(warp::path("mutate"))
        .and(warp::path::end())
        .and(warp::body::json::<AdmissionReview>())
        .and(warp::any().map(move || webhook.clone()))
        .and_then(mutate_handler);

    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .map(|| reply::json(&json!({ "status": "ok" })));

    mutate.or(health).with(warp::trace::request())
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;
    use crate::config::test_config;
    use crate::error::ProvisionError;
    use crate::provision::tests::{InMemoryConfigMaps, BUNDLE};
    use crate::provision::{MockBundleSource, MockConfigMapApi};

    const UID: &str = "705ab4f5-6393-11e8-b7cc-42010a800002";

    fn pod(annotation: Option<Value>) -> Value {
        let mut pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "test-pod", "namespace": "ns1" },
            "spec": {
                "volumes": [],
                "containers": [{ "name": "app", "image": "nginx", "volumeMounts": [] }]
            }
        });
        if let Some(value) = annotation {
            pod["metadata"]["annotations"] = json!({ "example.com/ca-injector": value });
        }
        pod
    }

    /// A review shaped like the ones the API server sends.
    fn admission_review(object: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": UID,
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "test-pod",
                "namespace": "ns1",
                "operation": "CREATE",
                "userInfo": { "username": "system:admin" },
                "object": object,
                "dryRun": false
            }
        })
    }

    fn webhook_with_store() -> (Arc<InMemoryConfigMaps>, Arc<Webhook>) {
        let store = Arc::new(InMemoryConfigMaps::default());
        let mut source = MockBundleSource::new();
        source
            .expect_fetch()
            .returning(|_| Ok(BUNDLE.as_bytes().to_vec()));
        let webhook = Webhook::new(test_config(), Provisioner::new(store.clone(), source));
        (store, Arc::new(webhook))
    }

    async fn post_mutate(webhook: Arc<Webhook>, body: &Value) -> (StatusCode, Value) {
        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .json(body)
            .reply(&routes(webhook))
            .await;
        (res.status(), serde_json::from_slice(res.body()).unwrap())
    }

    fn decoded_patch(review: &Value) -> Patch {
        let encoded = review["response"]["patch"]
            .as_str()
            .expect("patch must be a base64 string");
        serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap()
    }

    fn assert_allowed_unchanged(status: StatusCode, review: &Value) {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["patchType"], "JSONPatch");
        assert_eq!(review["response"]["patch"], "W10=");
        assert!(decoded_patch(review).0.is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let (_, webhook) = webhook_with_store();
        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(webhook))
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_untriggered_pod_gets_empty_patch() {
        for annotation in [None, Some(json!("false")), Some(json!("TRUE"))] {
            let (store, webhook) = webhook_with_store();
            let (status, review) = post_mutate(webhook, &admission_review(pod(annotation))).await;

            assert_allowed_unchanged(status, &review);
            assert_eq!(review["apiVersion"], "admission.k8s.io/v1");
            assert_eq!(review["kind"], "AdmissionReview");
            assert_eq!(review["response"]["uid"], UID);
            assert!(store.objects.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_non_string_annotation_is_not_a_trigger() {
        for value in [json!(true), json!(1), json!({ "enabled": "true" })] {
            let (store, webhook) = webhook_with_store();
            let (status, review) = post_mutate(webhook, &admission_review(pod(Some(value)))).await;

            assert_allowed_unchanged(status, &review);
            assert!(store.objects.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_malformed_untriggered_object_is_allowed() {
        let (_, webhook) = webhook_with_store();
        let object = json!({
            "metadata": { "name": "test-pod", "labels": { "replicas": 3 } },
            "spec": { "volumes": [{ "name": 5 }], "containers": "none" }
        });
        let (status, review) = post_mutate(webhook, &admission_review(object)).await;

        assert_allowed_unchanged(status, &review);
    }

    #[tokio::test]
    async fn test_minimal_review_body_is_accepted() {
        let (_, webhook) = webhook_with_store();
        let body = json!({ "request": { "uid": "u1", "object": { "metadata": { "annotations": {} } } } });
        let (status, review) = post_mutate(webhook.clone(), &body).await;

        assert_allowed_unchanged(status, &review);
        assert_eq!(review["response"]["uid"], "u1");
        assert_eq!(review["apiVersion"], "admission.k8s.io/v1");

        // Non-string uids are echoed as they came.
        let body = json!({ "request": { "uid": 1, "object": {} } });
        let (status, review) = post_mutate(webhook, &body).await;

        assert_allowed_unchanged(status, &review);
        assert_eq!(review["response"]["uid"], 1);
    }

    #[tokio::test]
    async fn test_triggered_pod_gets_ca_bundle() {
        let (store, webhook) = webhook_with_store();
        let original = pod(Some(json!("true")));
        let (status, review) = post_mutate(webhook, &admission_review(original.clone())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["uid"], UID);
        assert_eq!(review["response"]["patchType"], "JSONPatch");
        assert!(review["response"]["patch"].is_string());

        let mut patched = original;
        json_patch::patch(&mut patched, &decoded_patch(&review).0).unwrap();
        assert_eq!(
            patched["spec"]["volumes"],
            json!([{ "name": "ca-bundle", "configMap": { "name": "ca-bundle", "defaultMode": 420 } }])
        );
        assert_eq!(
            patched["spec"]["containers"][0]["volumeMounts"],
            json!([{ "name": "ca-bundle", "mountPath": "/etc/ssl/certs/ca_bundle.pem", "subPath": "ca_bundle.pem" }])
        );

        let objects = store.objects.lock().unwrap();
        assert!(objects.contains_key(&("ns1".to_string(), "ca-bundle".to_string())));
    }

    #[tokio::test]
    async fn test_pod_without_containers_only_gets_volume() {
        let (_, webhook) = webhook_with_store();
        let original = json!({
            "metadata": {
                "namespace": "ns1",
                "annotations": { "example.com/ca-injector": "true" }
            }
        });
        let (status, review) = post_mutate(webhook, &admission_review(original.clone())).await;

        assert_eq!(status, StatusCode::OK);
        assert!(review["response"]["patch"].is_string());
        let mut patched = original;
        json_patch::patch(&mut patched, &decoded_patch(&review).0).unwrap();
        assert_eq!(
            patched["spec"],
            json!({ "volumes": [{ "name": "ca-bundle", "configMap": { "name": "ca-bundle", "defaultMode": 420 } }] })
        );
    }

    #[tokio::test]
    async fn test_identical_requests_get_identical_patches() {
        let body = admission_review(pod(Some(json!("true"))));
        let (_, first) = post_mutate(webhook_with_store().1, &body).await;
        let (_, second) = post_mutate(webhook_with_store().1, &body).await;

        assert!(first["response"]["patch"].is_string());
        assert_eq!(first["response"]["patch"], second["response"]["patch"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_fails_the_request() {
        let mut config_maps = MockConfigMapApi::new();
        config_maps.expect_get_opt().returning(|_, _| Ok(None));
        config_maps.expect_create().times(0);
        let mut source = MockBundleSource::new();
        source.expect_fetch().times(1).returning(|url| {
            Err(ProvisionError::Fetch {
                url: url.to_string(),
                reason: "HTTP 500 Internal Server Error".to_string(),
            })
        });
        let webhook = Arc::new(Webhook::new(
            test_config(),
            Provisioner::new(config_maps, source),
        ));

        let (status, review) =
            post_mutate(webhook, &admission_review(pod(Some(json!("true"))))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(review["kind"], "AdmissionReview");
        assert_eq!(review["response"]["uid"], UID);
        assert_eq!(review["response"]["allowed"], false);
        assert!(review["response"].get("patch").is_none());
        assert_eq!(review["response"]["status"]["code"], 500);
        assert!(review["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_review_without_request_is_rejected() {
        let (_, webhook) = webhook_with_store();
        let (status, review) = post_mutate(
            webhook,
            &json!({ "apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview" }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(review["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let (_, webhook) = webhook_with_store();
        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .header("content-type", "application/json")
            .body("not json")
            .reply(&routes(webhook))
            .await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mutate_requires_post() {
        let (_, webhook) = webhook_with_store();
        let res = warp::test::request()
            .method("GET")
            .path("/mutate")
            .reply(&routes(webhook))
            .await;

        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
