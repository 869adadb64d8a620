//! Clustering parameter sets, the sorter and preprocessing registries, and the
//! parameter sections each stage reads.

use crate::digest;
use crate::error::Error;
use crate::storage::models::{ExportKind, ParameterSet};
use crate::storage::Database;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::{debug, info};

pub const PREPROCESSING_METHOD_KEY: &str = "SI_PREPROCESSING_METHOD";
pub const SORTING_PARAMS_KEY: &str = "SI_SORTING_PARAMS";
pub const POSTPROCESSING_PARAMS_KEY: &str = "SI_POSTPROCESSING_PARAMS";

pub const REQUIRED_KEYS: [&str; 3] = [
    PREPROCESSING_METHOD_KEY,
    SORTING_PARAMS_KEY,
    POSTPROCESSING_PARAMS_KEY,
];

/// Hash over `params` with the clustering method folded in, independent of key order.
pub fn content_hash(clustering_method: &str, params: &Value) -> Result<String, Error> {
    let Value::Object(map) = params else {
        return Err(Error::Validation(
            "clustering params must be a JSON object".to_string(),
        ));
    };
    let mut combined = map.clone();
    combined.insert(
        "clustering_method".to_string(),
        Value::String(clustering_method.to_string()),
    );
    Ok(digest::json_digest(&Value::Object(combined))?)
}

/// Register a parameter set and return its index.
///
/// Re-inserting identical content is a no-op. Identical content under a different
/// index, or different content under an index already in use, is a conflict. Without an
/// explicit index, identical content resolves to the existing index and new content
/// takes the next free one. The method must name a registered sorter.
pub fn insert_parameter_set(
    db: &Database,
    clustering_method: &str,
    description: &str,
    params: &Value,
    paramset_idx: Option<i64>,
) -> Result<i64, Error> {
    clustering_method.parse::<SorterId>()?;
    let content_hash = content_hash(clustering_method, params)?;

    if let Some(existing) = db.parameter_set_by_hash(&content_hash)? {
        return match paramset_idx {
            None => Ok(existing.paramset_idx),
            Some(idx) if idx == existing.paramset_idx => {
                debug!("Parameter set {} already registered", idx);
                Ok(idx)
            }
            Some(idx) => Err(Error::Conflict(format!(
                "identical parameter set already exists with paramset_idx {} (requested {})",
                existing.paramset_idx, idx
            ))),
        };
    }

    let paramset_idx = match paramset_idx {
        Some(idx) => {
            if db.parameter_set(idx)?.is_some() {
                return Err(Error::Conflict(format!(
                    "paramset_idx {} is already in use; pick a different one",
                    idx
                )));
            }
            idx
        }
        None => db.max_paramset_idx()?.unwrap_or(0) + 1,
    };

    db.insert_parameter_set_row(&ParameterSet {
        paramset_idx,
        clustering_method: clustering_method.to_string(),
        description: description.to_string(),
        content_hash,
        params: params.clone(),
    })?;
    info!(
        "Registered parameter set {} for {}",
        paramset_idx, clustering_method
    );
    Ok(paramset_idx)
}

pub fn validate_required_keys(params: &Value) -> Result<(), Error> {
    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .filter(|key| params.get(**key).is_none())
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} must be defined in the parameter set",
            missing.join(", ")
        )))
    }
}

/// Sorters the external engine is known to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SorterId {
    Kilosort2,
    Kilosort2_5,
    Kilosort3,
    Kilosort4,
    SpykingCircus2,
    Tridesclous2,
    Mountainsort5,
}

impl SorterId {
    pub const ALL: [SorterId; 7] = [
        SorterId::Kilosort2,
        SorterId::Kilosort2_5,
        SorterId::Kilosort3,
        SorterId::Kilosort4,
        SorterId::SpykingCircus2,
        SorterId::Tridesclous2,
        SorterId::Mountainsort5,
    ];

    /// Name as written in a parameter set's `clustering_method`.
    pub fn method_name(&self) -> &'static str {
        match self {
            SorterId::Kilosort2 => "kilosort2",
            SorterId::Kilosort2_5 => "kilosort2.5",
            SorterId::Kilosort3 => "kilosort3",
            SorterId::Kilosort4 => "kilosort4",
            SorterId::SpykingCircus2 => "spykingcircus2",
            SorterId::Tridesclous2 => "tridesclous2",
            SorterId::Mountainsort5 => "mountainsort5",
        }
    }

    /// Name the engine knows the sorter by; also the sorter's folder name.
    pub fn sorter_name(&self) -> String {
        self.method_name().replace('.', "_")
    }
}

impl FromStr for SorterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SorterId::ALL
            .into_iter()
            .find(|sorter| sorter.method_name() == s || sorter.sorter_name() == s)
            .ok_or_else(|| Error::Unsupported(format!("sorter '{}'", s)))
    }
}

/// One step of a preprocessing chain, handed to the engine as data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PreprocessStep {
    HighpassFilter { freq_min: f64 },
    PhaseShift,
    CommonReference { reference: String, operator: String },
    DetectBadChannels,
    InterpolateBadChannels,
    RemoveBadChannels,
    HighpassSpatialFilter,
}

impl PreprocessStep {
    fn global_median_reference() -> Self {
        PreprocessStep::CommonReference {
            reference: "global".to_string(),
            operator: "median".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessingMethod {
    CatGt,
    IblDestriping,
    IblDestripingModified,
}

impl PreprocessingMethod {
    pub const ALL: [PreprocessingMethod; 3] = [
        PreprocessingMethod::CatGt,
        PreprocessingMethod::IblDestriping,
        PreprocessingMethod::IblDestripingModified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreprocessingMethod::CatGt => "catGT",
            PreprocessingMethod::IblDestriping => "IBLdestriping",
            PreprocessingMethod::IblDestripingModified => "IBLdestriping_modified",
        }
    }

    pub fn steps(&self) -> Vec<PreprocessStep> {
        match self {
            PreprocessingMethod::CatGt => vec![
                PreprocessStep::PhaseShift,
                PreprocessStep::global_median_reference(),
            ],
            PreprocessingMethod::IblDestriping => vec![
                PreprocessStep::HighpassFilter { freq_min: 400.0 },
                PreprocessStep::DetectBadChannels,
                PreprocessStep::InterpolateBadChannels,
                PreprocessStep::PhaseShift,
                PreprocessStep::HighpassSpatialFilter,
            ],
            PreprocessingMethod::IblDestripingModified => vec![
                PreprocessStep::HighpassFilter { freq_min: 400.0 },
                PreprocessStep::DetectBadChannels,
                PreprocessStep::RemoveBadChannels,
                PreprocessStep::PhaseShift,
                PreprocessStep::global_median_reference(),
            ],
        }
    }
}

impl FromStr for PreprocessingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PreprocessingMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| Error::Unsupported(format!("preprocessing method '{}'", s)))
    }
}

pub fn preprocessing_method(params: &Value) -> Result<PreprocessingMethod, Error> {
    let name = params
        .get(PREPROCESSING_METHOD_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::Validation(format!("{} must be a string", PREPROCESSING_METHOD_KEY))
        })?;
    name.parse()
}

pub fn sorting_params(params: &Value) -> Result<&Value, Error> {
    params
        .get(SORTING_PARAMS_KEY)
        .ok_or_else(|| Error::Validation(format!("{} is missing", SORTING_PARAMS_KEY)))
}

pub fn postprocessing_params(params: &Value) -> Result<&Value, Error> {
    params
        .get(POSTPROCESSING_PARAMS_KEY)
        .ok_or_else(|| Error::Validation(format!("{} is missing", POSTPROCESSING_PARAMS_KEY)))
}

/// What PostProcessing and Export were asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct PostprocessingRequest {
    /// (extension name, extension params) in request order.
    pub extensions: Vec<(String, Value)>,
    pub exports: Vec<ExportKind>,
}

impl PostprocessingRequest {
    pub fn from_params(params: &Value) -> Result<Self, Error> {
        let post = postprocessing_params(params)?;

        let extensions = match post.get("extensions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|name| {
                    name.as_str()
                        .map(|n| (n.to_string(), json!({})))
                        .ok_or_else(|| {
                            Error::Validation(format!("extension name {} is not a string", name))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Object(map)) => map
                .iter()
                .map(|(name, ext_params)| {
                    let ext_params = if ext_params.is_null() {
                        json!({})
                    } else {
                        ext_params.clone()
                    };
                    (name.clone(), ext_params)
                })
                .collect(),
            Some(other) => {
                return Err(Error::Validation(format!(
                    "extensions must be a list or a mapping, got {}",
                    other
                )))
            }
        };

        let flag = |key: &str| post.get(key).and_then(Value::as_bool).unwrap_or(false);
        let mut exports = Vec::new();
        if flag("export_report") {
            exports.push(ExportKind::Report);
        }
        if flag("export_to_phy") {
            exports.push(ExportKind::Phy);
        }

        Ok(Self {
            extensions,
            exports,
        })
    }
}
