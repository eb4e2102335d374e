//! Mapping curves and keyboard calibration resources.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::engine::{mapping_info, KeyCalibration, MappingInfo, MappingRange, MAPPINGS};
use crate::input::calibration;
use crate::server::{ApiError, Ctx};

const MAX_RANGES: usize = 20;

/// Parse and validate a `[{src, dst}]` range list: 1..=20 entries with
/// strictly increasing src values inside the mapping's source range.
pub fn parse_ranges(name: &str, value: &Value) -> Result<Vec<MappingRange>, ApiError> {
    let info = mapping_info(name).ok_or(ApiError::NotFound)?;
    let mut errors = serde_json::Map::new();

    let entries: Vec<MappingRange> = match serde_json::from_value(value.clone()) {
        Ok(entries) => entries,
        Err(e) => {
            errors.insert("ranges".to_string(), json!(e.to_string()));
            return Err(ApiError::Validation(errors));
        }
    };

    if entries.is_empty() || entries.len() > MAX_RANGES {
        errors.insert(
            "ranges".to_string(),
            json!(format!("must contain 1 to {} entries", MAX_RANGES)),
        );
    }
    let mut prev_src: Option<i32> = None;
    for (idx, range) in entries.iter().enumerate() {
        if range.src < info.src_min || range.src > info.src_max {
            errors.insert(
                format!("ranges.{}.src", idx),
                json!(format!("must be in [{}, {}]", info.src_min, info.src_max)),
            );
        }
        if range.dst < info.dst_min || range.dst > info.dst_max {
            errors.insert(
                format!("ranges.{}.dst", idx),
                json!(format!("must be in [{}, {}]", info.dst_min, info.dst_max)),
            );
        }
        if let Some(prev) = prev_src {
            if range.src <= prev {
                errors.insert(
                    format!("ranges.{}.src", idx),
                    json!("src values must be strictly increasing"),
                );
            }
        }
        prev_src = Some(range.src);
    }

    if errors.is_empty() {
        Ok(entries)
    } else {
        Err(ApiError::Validation(errors))
    }
}

/// Parse and validate the 24-key calibration payload.
pub fn parse_calibration(value: &Value) -> Result<Vec<KeyCalibration>, ApiError> {
    let mut errors = serde_json::Map::new();
    let entries: Vec<KeyCalibration> = match serde_json::from_value(value.clone()) {
        Ok(entries) => entries,
        Err(e) => {
            errors.insert("calibration".to_string(), json!(e.to_string()));
            return Err(ApiError::Validation(errors));
        }
    };
    if entries.len() != calibration::KEY_COUNT {
        errors.insert(
            "calibration".to_string(),
            json!(format!("must contain {} entries", calibration::KEY_COUNT)),
        );
    }
    for (idx, entry) in entries.iter().enumerate() {
        if !(0..=3000).contains(&entry.pressure) {
            errors.insert(format!("{}.pressure", idx), json!("must be in [0, 3000]"));
        }
        if !(-100..=100).contains(&entry.velocity) {
            errors.insert(format!("{}.velocity", idx), json!("must be in [-100, 100]"));
        }
    }
    if errors.is_empty() {
        Ok(entries)
    } else {
        Err(ApiError::Validation(errors))
    }
}

fn mapping_as_json(ctx: &Ctx, info: &MappingInfo) -> Value {
    // stored ranges win, engine defaults otherwise
    let ranges = ctx
        .store
        .load_config(&format!("mapping:{}", info.id))
        .ok()
        .flatten()
        .unwrap_or_else(|| {
            serde_json::to_value(ctx.engine.get_mapping_ranges(info.id)).unwrap_or_default()
        });
    json!({
        "id": info.id,
        "name": info.name,
        "src": {"name": info.src_name, "min": info.src_min, "max": info.src_max},
        "dst": {"name": info.dst_name, "min": info.dst_min, "max": info.dst_max},
        "ranges": ranges,
    })
}

pub async fn list(State(ctx): State<Ctx>) -> Json<Value> {
    let mut mappings: Vec<&MappingInfo> = MAPPINGS.iter().collect();
    mappings.sort_by_key(|m| m.id);
    Json(Value::Array(
        mappings.iter().map(|m| mapping_as_json(&ctx, m)).collect(),
    ))
}

pub async fn show(
    State(ctx): State<Ctx>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let info = mapping_info(&name).ok_or(ApiError::NotFound)?;
    Ok(Json(mapping_as_json(&ctx, info)))
}

pub async fn update(
    State(ctx): State<Ctx>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let info = mapping_info(&name).ok_or(ApiError::NotFound)?;
    let ranges_value = body
        .get("ranges")
        .ok_or_else(|| ApiError::BadRequest("missing \"ranges\"".to_string()))?;
    let ranges = parse_ranges(&name, ranges_value)?;

    ctx.engine
        .set_mapping_ranges(&name, &ranges)
        .map_err(|_| ApiError::BadRequest("Unable to apply mapping values".to_string()))?;
    ctx.store
        .save_config(&format!("mapping:{}", name), ranges_value)
        .map_err(|_| ApiError::BadRequest("Unable to save mapping values".to_string()))?;
    Ok(Json(mapping_as_json(&ctx, info)))
}

pub async fn reset(
    State(ctx): State<Ctx>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let info = mapping_info(&name).ok_or(ApiError::NotFound)?;
    ctx.store.delete_config(&format!("mapping:{}", name))?;
    ctx.engine
        .reset_mapping_ranges(&name)
        .map_err(|_| ApiError::BadRequest("Unable to reset mapping".to_string()))?;
    Ok(Json(mapping_as_json(&ctx, info)))
}

pub async fn get_calibration(State(ctx): State<Ctx>) -> Json<Value> {
    let keys = calibration::load_keys(&ctx.store);
    Json(serde_json::to_value(keys).unwrap_or_default())
}

pub async fn put_calibration(
    State(ctx): State<Ctx>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let keys = parse_calibration(&body)?;
    calibration::save_keys(&ctx.store, &keys)?;
    calibration::commit_keys(ctx.engine.as_ref(), &keys)?;
    Ok(get_calibration(State(ctx)).await)
}

pub async fn delete_calibration(State(ctx): State<Ctx>) -> Result<Json<Value>, ApiError> {
    calibration::delete_keys(&ctx.store)?;
    calibration::commit_keys(ctx.engine.as_ref(), &calibration::default_keys())?;
    Ok(get_calibration(State(ctx)).await)
}
