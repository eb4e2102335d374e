//! Preset resources.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Map, Value};
use viellestore::PresetRow;

use crate::server::{client_id, ApiError, Ctx};
use crate::signals::EventData;

/// External representation of a stored preset: the blob plus identity.
pub fn preset_to_dict(row: &PresetRow) -> Value {
    let mut data = row.data.clone();
    if !data.is_object() {
        data = json!({});
    }
    data["id"] = json!(row.id);
    data["number"] = json!(row.number);
    data["name"] = json!(row.name);
    // older presets stored trompette voices without a mode
    if let Some(voices) = data
        .get_mut("voices")
        .and_then(|v| v.get_mut("trompette"))
        .and_then(Value::as_array_mut)
    {
        for voice in voices {
            if voice.get("mode").and_then(Value::as_str).is_none() {
                voice["mode"] = json!("midigurdy");
            }
        }
    }
    data
}

fn check_range(
    errors: &mut Map<String, Value>,
    data: &Value,
    pointer: &str,
    min: i64,
    max: i64,
) {
    if let Some(value) = data.pointer(pointer) {
        match value.as_i64() {
            Some(v) if (min..=max).contains(&v) => {}
            _ => {
                errors.insert(
                    pointer.trim_start_matches('/').replace('/', "."),
                    json!(format!("must be an integer in [{}, {}]", min, max)),
                );
            }
        }
    }
}

/// Validate a preset payload; unknown keys pass through untouched.
pub fn validate_preset(data: &Value) -> Map<String, Value> {
    let mut errors = Map::new();
    if !data.is_object() {
        errors.insert("body".to_string(), json!("must be an object"));
        return errors;
    }
    check_range(&mut errors, data, "/main/volume", 0, 127);
    check_range(&mut errors, data, "/main/gain", 0, 127);
    check_range(&mut errors, data, "/main/pitchbend_range", 0, 200);
    check_range(&mut errors, data, "/tuning/coarse", -63, 64);
    check_range(&mut errors, data, "/tuning/fine", -100, 100);
    check_range(&mut errors, data, "/reverb/volume", 0, 127);
    check_range(&mut errors, data, "/reverb/panning", 0, 127);
    check_range(&mut errors, data, "/keynoise/volume", 0, 127);

    for kind in ["melody", "drone", "trompette"] {
        if let Some(voices) = data
            .pointer(&format!("/voices/{}", kind))
            .and_then(Value::as_array)
        {
            if voices.len() > 3 {
                errors.insert(
                    format!("voices.{}", kind),
                    json!("at most 3 voices per type"),
                );
            }
            for (idx, _) in voices.iter().enumerate() {
                let base = format!("/voices/{}/{}", kind, idx);
                check_range(&mut errors, data, &format!("{}/volume", base), 0, 127);
                check_range(&mut errors, data, &format!("{}/panning", base), 0, 127);
                check_range(&mut errors, data, &format!("{}/note", base), -1, 127);
                check_range(&mut errors, data, &format!("{}/capo", base), 0, 23);
                check_range(&mut errors, data, &format!("{}/finetune", base), -100, 100);
                check_range(
                    &mut errors,
                    data,
                    &format!("{}/chien_threshold", base),
                    0,
                    100,
                );
            }
        }
    }
    errors
}

pub async fn list(State(ctx): State<Ctx>) -> Result<Json<Value>, ApiError> {
    let rows = ctx.store.list_presets()?;
    Ok(Json(Value::Array(
        rows.iter().map(preset_to_dict).collect(),
    )))
}

pub async fn create(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let errors = validate_preset(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    let name = data.get("name").and_then(Value::as_str).unwrap_or("Unnamed");
    let row = ctx.store.insert_preset(name, None, &data)?;
    ctx.signals.emit_from(
        "preset:added",
        EventData::with("id", json!(row.id)),
        client_id(&headers),
    );
    Ok((StatusCode::CREATED, Json(preset_to_dict(&row))))
}

pub async fn show(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let row = ctx.store.get_preset(id)?;
    Ok(Json(preset_to_dict(&row)))
}

pub async fn update(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let errors = validate_preset(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    let name = data.get("name").and_then(Value::as_str).unwrap_or("Unnamed");
    let row = ctx.store.update_preset(id, name, &data)?;
    ctx.signals.emit_from(
        "preset:changed",
        EventData::with("id", json!(row.id)),
        client_id(&headers),
    );
    Ok(Json(preset_to_dict(&row)))
}

pub async fn delete(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    ctx.store.delete_preset(id)?;
    ctx.signals.emit_from(
        "preset:deleted",
        EventData::with("id", json!(id)),
        client_id(&headers),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn load(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    ctx.signals.set_client_id(client_id(&headers));
    let result = {
        let _lock = ctx.state.lock(Some("Loading preset..."), true);
        ctx.state.load_preset(&ctx.store, id)
    };
    ctx.signals.set_client_id(None);
    result?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn order(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let order: Vec<i64> = body
        .get("order")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .ok_or_else(|| ApiError::BadRequest("missing \"order\" list".to_string()))?;
    ctx.store
        .reorder_presets(&order)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    ctx.signals.emit_from(
        "preset:reordered",
        EventData::with("order", json!(order)),
        client_id(&headers),
    );
    Ok(Json(json!({ "order": ctx.store.preset_ids()? })))
}
