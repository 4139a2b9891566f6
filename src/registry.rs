//! Adapter registry
//!
//! Maps a family key to a factory. Nothing family-specific is built until
//! [`get_adapter`] is called for that key.

use anyhow::Result;

use crate::adapter::ModelAdapter;
use crate::error::ExtractError;
use crate::qwen3_vl::Qwen3VlAdapter;

type AdapterFactory = fn() -> Box<dyn ModelAdapter>;

fn qwen3_vl() -> Box<dyn ModelAdapter> {
    Box::new(Qwen3VlAdapter)
}

/// Registered families, key -> factory
const ADAPTERS: &[(&str, AdapterFactory)] = &[("qwen3-vl", qwen3_vl)];

/// Auto-detection rules, checked in order against the lowercased model name
const DETECTION_RULES: &[(&str, &str)] = &[("qwen3-vl", "qwen3-vl"), ("qwen3_vl", "qwen3-vl")];

/// Family used when neither `--model` nor `--model-type` is given
pub const FALLBACK_MODEL_TYPE: &str = "qwen3-vl";

/// All registered family keys, sorted
pub fn list_model_types() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = ADAPTERS.iter().map(|(key, _)| *key).collect();
    keys.sort_unstable();
    keys
}

/// Build the adapter registered under `key`
pub fn get_adapter(key: &str) -> Result<Box<dyn ModelAdapter>> {
    match ADAPTERS.iter().find(|(k, _)| *k == key) {
        Some((_, factory)) => Ok(factory()),
        None => Err(ExtractError::UnknownModelType {
            requested: key.to_string(),
            available: list_model_types().join(", "),
        }
        .into()),
    }
}

/// Infer a family key from a model name (case-insensitive substring match)
pub fn detect_model_type(model_name: &str) -> Option<&'static str> {
    let lower = model_name.to_lowercase();
    DETECTION_RULES
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, key)| *key)
}

/// Pick the family for a run.
///
/// An explicit key wins; otherwise the model name is matched against the
/// detection rules; with no model name at all the fallback family is used.
pub fn resolve_model_type(
    explicit: Option<&str>,
    model_name: Option<&str>,
) -> Result<&'static str> {
    if let Some(key) = explicit {
        return ADAPTERS
            .iter()
            .map(|(k, _)| *k)
            .find(|k| *k == key)
            .ok_or_else(|| {
                ExtractError::UnknownModelType {
                    requested: key.to_string(),
                    available: list_model_types().join(", "),
                }
                .into()
            });
    }
    match model_name {
        None => Ok(FALLBACK_MODEL_TYPE),
        Some(name) => detect_model_type(name).ok_or_else(|| {
            ExtractError::FamilyDetectionFailed {
                model: name.to_string(),
                available: list_model_types().join(", "),
            }
            .into()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_model_types() {
        assert_eq!(list_model_types(), vec!["qwen3-vl"]);
    }

    #[test]
    fn test_detect_model_type() {
        assert_eq!(
            detect_model_type("Qwen/Qwen3-VL-2B-Thinking"),
            Some("qwen3-vl")
        );
        assert_eq!(detect_model_type("local/QWEN3_VL_8b"), Some("qwen3-vl"));
        assert_eq!(detect_model_type("llava-hf/llava-1.5-7b-hf"), None);
        assert_eq!(detect_model_type(""), None);
    }

    #[test]
    fn test_get_adapter() {
        let adapter = get_adapter("qwen3-vl").unwrap();
        assert_eq!(adapter.family(), "qwen3-vl");
        assert_eq!(adapter.effective_patch_size(), 32);
    }

    #[test]
    fn test_unknown_adapter_lists_keys() {
        let err = get_adapter("llava").err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("llava"));
        assert!(msg.contains("qwen3-vl"));
    }

    #[test]
    fn test_resolve_model_type() {
        assert_eq!(resolve_model_type(None, None).unwrap(), "qwen3-vl");
        assert_eq!(
            resolve_model_type(Some("qwen3-vl"), Some("anything")).unwrap(),
            "qwen3-vl"
        );
        assert_eq!(
            resolve_model_type(None, Some("Qwen/Qwen3-VL-8B-Instruct")).unwrap(),
            "qwen3-vl"
        );

        let err = resolve_model_type(None, Some("some/other-model")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::FamilyDetectionFailed { .. })
        ));

        let err = resolve_model_type(Some("nope"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::UnknownModelType { .. })
        ));
    }
}
