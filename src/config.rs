use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::review::DuplicateReviewPolicy;
use crate::scores::{LevelScale, DEFAULT_LEVEL_SCALE_MAX};

/// Settings key the engine configuration is persisted under.
pub const SETTINGS_KEY: &str = "engine.config";
pub const LEVEL_SCALE_ENV: &str = "RUBRICD_LEVEL_SCALE_MAX";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPolicy {
    pub require_complete: bool,
    pub allow_over_limit: bool,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            require_complete: true,
            allow_over_limit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub level_scale_max: f64,
    pub duplicate_review_policy: DuplicateReviewPolicy,
    pub submit: SubmitPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            level_scale_max: DEFAULT_LEVEL_SCALE_MAX,
            duplicate_review_policy: DuplicateReviewPolicy::Sum,
            submit: SubmitPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with the process environment applied. A malformed override
    /// is ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var(LEVEL_SCALE_ENV) {
            match raw.trim().parse::<f64>().ok().and_then(LevelScale::new) {
                Some(scale) => cfg.level_scale_max = scale.max(),
                None => tracing::warn!(value = %raw, "ignoring invalid {}", LEVEL_SCALE_ENV),
            }
        }
        cfg
    }

    pub fn level_scale(&self) -> LevelScale {
        LevelScale::new(self.level_scale_max).unwrap_or_default()
    }

    /// Layers a saved settings value over `self`. Malformed historical
    /// values must not block opening a workspace, so errors are dropped.
    pub fn apply_saved(&mut self, saved: &Value) {
        if let Some(obj) = saved.as_object() {
            let mut next = self.clone();
            match next.merge_patch(obj) {
                Ok(()) => *self = next,
                Err(msg) => tracing::warn!(error = %msg, "ignoring saved engine config"),
            }
        }
    }

    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "levelScaleMax" => {
                    let scale = v
                        .as_f64()
                        .and_then(LevelScale::new)
                        .ok_or_else(|| "levelScaleMax must be a positive number".to_string())?;
                    self.level_scale_max = scale.max();
                }
                "duplicateReviewPolicy" => {
                    self.duplicate_review_policy = serde_json::from_value(v.clone())
                        .map_err(|_| "duplicateReviewPolicy must be 'sum' or 'latestWins'")?;
                }
                "submit" => {
                    let Some(obj) = v.as_object() else {
                        return Err("submit must be an object".to_string());
                    };
                    for (sk, sv) in obj {
                        let Some(b) = sv.as_bool() else {
                            return Err(format!("submit.{} must be a boolean", sk));
                        };
                        match sk.as_str() {
                            "requireComplete" => self.submit.require_complete = b,
                            "allowOverLimit" => self.submit.allow_over_limit = b,
                            _ => return Err(format!("unknown submit field: {}", sk)),
                        }
                    }
                }
                _ => return Err(format!("unknown config field: {}", k)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.level_scale_max, 5.0);
        assert_eq!(cfg.duplicate_review_policy, DuplicateReviewPolicy::Sum);
        assert!(cfg.submit.require_complete);
        assert!(!cfg.submit.allow_over_limit);
    }

    #[test]
    fn patch_updates_known_fields() {
        let mut cfg = EngineConfig::default();
        cfg.merge_patch(&obj(json!({
            "levelScaleMax": 10,
            "duplicateReviewPolicy": "latestWins",
            "submit": { "allowOverLimit": true }
        })))
        .expect("patch");
        assert_eq!(cfg.level_scale().max(), 10.0);
        assert_eq!(cfg.duplicate_review_policy, DuplicateReviewPolicy::LatestWins);
        assert!(cfg.submit.allow_over_limit);
        assert!(cfg.submit.require_complete);
    }

    #[test]
    fn patch_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.merge_patch(&obj(json!({ "levelScaleMax": 0 }))).is_err());
        assert!(cfg
            .merge_patch(&obj(json!({ "duplicateReviewPolicy": "average" })))
            .is_err());
        assert!(cfg.merge_patch(&obj(json!({ "colour": "red" }))).is_err());
    }

    #[test]
    fn malformed_saved_config_is_ignored_whole() {
        crate::logging::init_test();
        let mut cfg = EngineConfig::default();
        cfg.apply_saved(&json!({ "duplicateReviewPolicy": "latestWins", "levelScaleMax": -2 }));
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn config_serializes_camel_case() {
        let v = serde_json::to_value(EngineConfig::default()).expect("json");
        assert_eq!(v["duplicateReviewPolicy"], json!("sum"));
        assert_eq!(v["submit"]["requireComplete"], json!(true));
    }
}
