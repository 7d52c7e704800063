//! JSON Patch between the admitted document and its planned replacement.
//!
//! Both sides go through the same typed serialization, so the patch only carries what the
//! planner appended. On the wire the patch is a base64 string next to `patchType: JSONPatch`.

use base64::{engine::general_purpose::STANDARD, Engine};
use json_patch::Patch;

use crate::mutate::PodDocument;

/// Operations turning `original` into `modified`. Identical documents give an empty patch.
pub fn diff(original: &PodDocument, modified: &PodDocument) -> Result<Patch, serde_json::Error> {
    let original = serde_json::to_value(original)?;
    let modified = serde_json::to_value(modified)?;
    Ok(json_patch::diff(&original, &modified))
}

/// The only patch type this webhook emits.
pub const PATCH_TYPE: &str = "JSONPatch";

/// Serialize `patch` and base64 it for the `patch` field of an admission response.
pub fn encode(patch: &Patch) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(patch)?))
}
