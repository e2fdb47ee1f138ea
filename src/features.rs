use candle_core::{Device, Tensor};
use std::collections::HashMap;

/// Static soil properties, in the order the model was trained with
pub const SOIL_FEATURES: [&str; 3] = ["awc", "cec", "som"];

/// Dynamic (time-series) feature families, in training order
pub const DYNAMIC_FEATURES: [&str; 18] = [
    "EVI", "NDVI", "GCI", "NDWI", "LSTday", "LSTnight", "ppt", "tmax", "tmean", "tmin", "tdmean",
    "vpdmax", "vpdmean", "vpdmin", "Evap", "PotEvap", "RootMoist", "GLDASws",
];

/// Day-of-year observation buckets: 58, 74, ..., 298
pub const DOY_BUCKETS: [u32; 16] = [
    58, 74, 90, 106, 122, 138, 154, 170, 186, 202, 218, 234, 250, 266, 282, 298,
];

/// Engineered features: soil properties plus one value per dynamic
/// feature family and day-of-year bucket
pub const NUM_ENGINEERED_FEATURES: usize =
    SOIL_FEATURES.len() + DYNAMIC_FEATURES.len() * DOY_BUCKETS.len();

/// Model input width: engineered features prefixed by the target year
/// and one padding scalar
pub const MODEL_INPUT_DIM: usize = NUM_ENGINEERED_FEATURES + 2;

/// Ordered names of all engineered features: the soil properties, then
/// `{family}_{doy:03}` for each family and bucket in increasing order
pub fn feature_names() -> Vec<String> {
    let mut names: Vec<String> = SOIL_FEATURES.iter().map(|s| s.to_string()).collect();
    for family in DYNAMIC_FEATURES.iter() {
        for doy in DOY_BUCKETS.iter() {
            names.push(format!("{}_{:03}", family, doy));
        }
    }
    names
}

/// Assemble the ordered engineered feature vector from a (possibly
/// partial) name-to-value map; entries that are missing or null default
/// to zero.
pub fn assemble_features(values: &HashMap<String, Option<f32>>) -> Vec<f32> {
    feature_names()
        .iter()
        .map(|name| values.get(name).copied().flatten().unwrap_or(0.0))
        .collect()
}

/// Build the (1 x 293) model input from the engineered features,
/// prepending the target year and a padding scalar. A feature slice of
/// any other length is rejected, never padded or truncated.
pub fn model_input(year: f32, features: &[f32], device: &Device) -> anyhow::Result<Tensor> {
    if features.len() != NUM_ENGINEERED_FEATURES {
        anyhow::bail!(
            "expected {} engineered features, got {}",
            NUM_ENGINEERED_FEATURES,
            features.len()
        );
    }

    let mut row = Vec::with_capacity(MODEL_INPUT_DIM);
    row.push(year);
    row.push(0.0);
    row.extend_from_slice(features);
    Ok(Tensor::from_vec(row, (1, MODEL_INPUT_DIM), device)?)
}
