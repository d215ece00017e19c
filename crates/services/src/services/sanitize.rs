use serde_json::Value;
use twox_hash::XxHash64;

/// Metadata fields the API server owns; they never belong in git.
const SERVER_SET_METADATA: [&str; 6] = [
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "selfLink",
];

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Converts a live object into the canonical form committed to git: no
/// status, no server-set metadata, keys in lexicographic order.
///
/// Idempotent: sanitizing an already-sanitized tree is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    pub fn new() -> Self {
        Self
    }

    pub fn sanitize(&self, obj: &Value) -> Value {
        let mut out = obj.clone();
        if let Value::Object(map) = &mut out {
            map.remove("status");
            if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
                for field in SERVER_SET_METADATA {
                    metadata.remove(field);
                }
                if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
                    annotations.remove(LAST_APPLIED_ANNOTATION);
                }
                if metadata
                    .get("annotations")
                    .is_some_and(|a| a.as_object().is_some_and(|m| m.is_empty()))
                {
                    metadata.remove("annotations");
                }
            }
        }
        out
    }

    /// Render the sanitized tree as YAML. `serde_json` maps iterate in key
    /// order, so the output is canonical byte-for-byte.
    pub fn canonical_yaml(&self, sanitized: &Value) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(sanitized)
    }
}

/// XXH64 of the canonical YAML, the identity used by the dedup map and the
/// correlation fingerprint.
pub fn content_hash(canonical_yaml: &str) -> u64 {
    XxHash64::oneshot(0, canonical_yaml.as_bytes())
}
