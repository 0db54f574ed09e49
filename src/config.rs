use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{CalcError, CalcResult};

pub const SETTINGS_KEY: &str = "engine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Length of the top/bottom lists in cohort statistics.
    pub cohort_top_n: usize,
    /// Length of the raw-marks ranking in exam statistics.
    pub exam_top_n: usize,
    pub batch_workers: usize,
    /// Outcome rows read from storage per round trip while streaming.
    pub batch_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cohort_top_n: 5,
            exam_top_n: 10,
            batch_workers: 4,
            batch_chunk_size: 256,
        }
    }
}

fn parse_usize_range(v: &Value, key: &str, min: usize, max: usize) -> Result<usize, String> {
    let n = v
        .as_u64()
        .ok_or_else(|| format!("{} must be a non-negative integer", key))?;
    let n = usize::try_from(n).map_err(|_| format!("{} is too large", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn apply_patch(config: &mut EngineConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "cohortTopN" => config.cohort_top_n = parse_usize_range(v, k, 1, 100)?,
            "examTopN" => config.exam_top_n = parse_usize_range(v, k, 1, 100)?,
            "batchWorkers" => config.batch_workers = parse_usize_range(v, k, 1, 64)?,
            "batchChunkSize" => config.batch_chunk_size = parse_usize_range(v, k, 1, 10_000)?,
            _ => return Err(format!("unknown engine setting: {}", k)),
        }
    }
    Ok(())
}

/// Apply a JSON object patch field by field. Unknown keys and out-of-range
/// values reject the whole patch.
pub fn merge_patch(current: &EngineConfig, patch: &Value) -> CalcResult<EngineConfig> {
    let Some(obj) = patch.as_object() else {
        return Err(CalcError::validation("settings patch must be an object"));
    };
    let mut next = current.clone();
    apply_patch(&mut next, obj).map_err(CalcError::validation)?;
    Ok(next)
}

/// Best-effort load of a stored settings value: fields that no longer
/// validate fall back to their defaults.
pub fn from_stored(saved: Option<&Value>) -> EngineConfig {
    let mut config = EngineConfig::default();
    let Some(obj) = saved.and_then(|v| v.as_object()) else {
        return config;
    };
    for (k, v) in obj {
        let mut single = Map::new();
        single.insert(k.clone(), v.clone());
        if let Err(e) = apply_patch(&mut config, &single) {
            warn!(key = %k, error = %e, "ignoring stored engine setting");
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.cohort_top_n, 5);
        assert_eq!(c.exam_top_n, 10);
        assert_eq!(c.batch_workers, 4);
    }

    #[test]
    fn patch_updates_known_fields() {
        let c = merge_patch(&EngineConfig::default(), &json!({ "examTopN": 3, "batchWorkers": 8 }))
            .expect("patch");
        assert_eq!(c.exam_top_n, 3);
        assert_eq!(c.batch_workers, 8);
        assert_eq!(c.cohort_top_n, 5);
    }

    #[test]
    fn patch_rejects_unknown_and_out_of_range() {
        let base = EngineConfig::default();
        let e = merge_patch(&base, &json!({ "histogramBins": 12 })).expect_err("unknown");
        assert!(e.message.contains("histogramBins"));
        assert!(merge_patch(&base, &json!({ "batchWorkers": 0 })).is_err());
        assert!(merge_patch(&base, &json!({ "examTopN": "ten" })).is_err());
        assert!(merge_patch(&base, &json!([1, 2])).is_err());
    }

    #[test]
    fn stored_values_apply_best_effort() {
        let c = from_stored(Some(&json!({
            "cohortTopN": 7,
            "examTopN": -1,
            "batchWorkers": 500,
            "retiredSetting": true
        })));
        assert_eq!(c.cohort_top_n, 7);
        assert_eq!(c.exam_top_n, 10);
        assert_eq!(c.batch_workers, 4);
        assert_eq!(from_stored(None), EngineConfig::default());
    }

    #[test]
    fn camel_case_json_round_trip() {
        let v = serde_json::to_value(EngineConfig::default()).expect("serialize");
        assert_eq!(v["batchChunkSize"], 256);
        let back: EngineConfig = serde_json::from_value(json!({ "examTopN": 4 })).expect("parse");
        assert_eq!(back.exam_top_n, 4);
        assert_eq!(back.batch_workers, 4);
    }
}
