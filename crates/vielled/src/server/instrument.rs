//! Instrument state, misc settings and the bulk config export/import.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::engine::MAPPINGS;
use crate::input::calibration;
use crate::server::presets::validate_preset;
use crate::server::{client_id, ApiError, Ctx};
use crate::signals::EventData;
use crate::state::instrument_profile;

/// Read and write access to everything a preset stores.
pub async fn get_instrument(State(ctx): State<Ctx>) -> Json<Value> {
    Json(ctx.state.with(|s| s.to_preset_dict()))
}

/// Partial update: only submitted keys change.
pub async fn put_instrument(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let errors = validate_preset(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    ctx.signals.set_client_id(client_id(&headers));
    ctx.state.apply(|s, ch| s.from_preset_dict(&data, true, ch));
    ctx.signals.set_client_id(None);
    Ok(Json(ctx.state.with(|s| s.to_preset_dict())))
}

/// Full replace: missing keys reset to defaults, a single summary event
/// follows the suppressed bulk load.
pub async fn post_instrument(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let errors = validate_preset(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    ctx.signals.set_client_id(client_id(&headers));
    let (_, _suppressed) = ctx.signals.suppressed(|| {
        ctx.state.apply(|s, ch| s.from_preset_dict(&data, false, ch));
    });
    ctx.signals.emit("active:preset:changed", EventData::new());
    ctx.signals.set_client_id(None);
    Ok(Json(ctx.state.with(|s| s.to_preset_dict())))
}

fn validate_misc(data: &Value) -> Map<String, Value> {
    let mut errors = Map::new();
    if !data.is_object() {
        errors.insert("body".to_string(), json!("must be an object"));
        return errors;
    }
    for (pointer, min, max) in [
        ("/ui/timeout", 0i64, 1000i64),
        ("/ui/brightness", 0, 100),
        ("/keyboard/key_on_debounce", 0, 50),
        ("/keyboard/key_off_debounce", 0, 50),
        ("/keyboard/base_note_delay", 0, 50),
        ("/features/string_count", 1, 3),
    ] {
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
    if let Some(mode) = data.get("instrument_mode").and_then(Value::as_str) {
        if instrument_profile(mode).is_none() {
            errors.insert("instrument_mode".to_string(), json!("unknown profile"));
        }
    }
    errors
}

pub async fn get_misc(State(ctx): State<Ctx>) -> Json<Value> {
    Json(ctx.state.with(|s| s.to_misc_dict()))
}

/// Partial update, not persisted.
pub async fn put_misc(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let errors = validate_misc(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    ctx.signals.set_client_id(client_id(&headers));
    ctx.state.apply(|s, ch| s.from_misc_dict(&data, true, ch));
    ctx.signals.set_client_id(None);
    Ok(Json(ctx.state.with(|s| s.to_misc_dict())))
}

/// Full replace, persisted to the config store.
pub async fn post_misc(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let errors = validate_misc(&data);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    ctx.signals.set_client_id(client_id(&headers));
    ctx.state.apply(|s, ch| s.from_misc_dict(&data, false, ch));
    ctx.signals.set_client_id(None);
    let misc = ctx.state.with(|s| s.to_misc_dict());
    ctx.store.save_config("misc", &misc)?;
    Ok(Json(misc))
}

fn switch(query: &HashMap<String, String>, name: &str) -> bool {
    matches!(
        query.get(name).map(String::as_str),
        Some("true") | Some("1")
    )
}

/// Export the full setup (presets, mappings, calibration, settings) as
/// one JSON document, selected by query switches.
pub async fn export(
    State(ctx): State<Ctx>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mut out = Map::new();

    if switch(&query, "presets") {
        let mut entries = Vec::new();
        for row in ctx.store.list_presets()? {
            let mut data = row.data.clone();
            data["name"] = json!(row.name);
            entries.push(data);
        }
        if !entries.is_empty() {
            out.insert("presets".to_string(), Value::Array(entries));
        }
    }

    if switch(&query, "mappings") {
        let mut entries = Vec::new();
        for info in MAPPINGS {
            let key = format!("mapping:{}", info.id);
            if let Some(ranges) = ctx.store.load_config(&key)? {
                entries.push(json!({"name": info.id, "ranges": ranges}));
            }
        }
        if !entries.is_empty() {
            out.insert("mappings".to_string(), Value::Array(entries));
        }
    }

    if switch(&query, "calibration") {
        if let Some(calib) = ctx.store.load_config("key_calibration")? {
            out.insert("calibration".to_string(), calib);
        }
    }

    if switch(&query, "settings") {
        if let Some(misc) = ctx.store.load_config("misc")? {
            out.insert("settings".to_string(), misc);
        }
    }

    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment;filename=vielle-config.json",
            ),
        ],
        Json(Value::Object(out)),
    )
        .into_response())
}

/// Import a previously exported setup, replacing the selected parts.
pub async fn import(
    State(ctx): State<Ctx>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let cid = client_id(&headers);

    if switch(&query, "presets") {
        for id in ctx.store.preset_ids()? {
            ctx.store.delete_preset(id)?;
            ctx.signals.emit_from(
                "preset:deleted",
                EventData::with("id", json!(id)),
                cid.clone(),
            );
        }
        let empty = Vec::new();
        for entry in data.get("presets").and_then(Value::as_array).unwrap_or(&empty) {
            let errors = validate_preset(entry);
            if !errors.is_empty() {
                return Err(ApiError::Validation(errors));
            }
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
            let row = ctx.store.insert_preset(name, None, entry)?;
            ctx.signals.emit_from(
                "preset:added",
                EventData::with("id", json!(row.id)),
                cid.clone(),
            );
        }
    }

    if switch(&query, "mappings") {
        for info in MAPPINGS {
            ctx.store.delete_config(&format!("mapping:{}", info.id))?;
            ctx.engine.reset_mapping_ranges(info.id)?;
        }
        let empty = Vec::new();
        for entry in data.get("mappings").and_then(Value::as_array).unwrap_or(&empty) {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(ranges) = entry.get("ranges") else {
                continue;
            };
            let parsed = crate::server::mappings::parse_ranges(name, ranges)?;
            ctx.engine.set_mapping_ranges(name, &parsed)?;
            ctx.store
                .save_config(&format!("mapping:{}", name), ranges)?;
        }
    }

    if switch(&query, "calibration") {
        match data.get("calibration") {
            Some(calib) => {
                let keys = crate::server::mappings::parse_calibration(calib)?;
                calibration::save_keys(&ctx.store, &keys)?;
                calibration::commit_keys(ctx.engine.as_ref(), &keys)?;
            }
            None => {
                calibration::delete_keys(&ctx.store)?;
                calibration::commit_keys(ctx.engine.as_ref(), &calibration::default_keys())?;
            }
        }
    }

    if switch(&query, "settings") {
        if let Some(misc) = data.get("settings") {
            let errors = validate_misc(misc);
            if !errors.is_empty() {
                return Err(ApiError::Validation(errors));
            }
            ctx.signals.set_client_id(cid.clone());
            ctx.state.apply(|s, ch| s.from_misc_dict(misc, false, ch));
            ctx.signals.set_client_id(None);
            ctx.store.save_config("misc", misc)?;
        }
    }

    Ok(Json(json!({"message": "success"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::test_ctx;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_instrument_roundtrip() {
        let (_dir, ctx) = test_ctx();
        let Json(dict) = get_instrument(State(Arc::clone(&ctx))).await;
        assert_eq!(dict["main"]["gain"], 50);

        let update = json!({"main": {"volume": 101}});
        let Json(updated) = put_instrument(State(Arc::clone(&ctx)), HeaderMap::new(), Json(update))
            .await
            .unwrap();
        assert_eq!(updated["main"]["volume"], 101);
        // partial update leaves the rest untouched
        assert_eq!(updated["main"]["gain"], 50);
    }

    #[tokio::test]
    async fn test_post_instrument_emits_single_summary() {
        let (_dir, ctx) = test_ctx();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            ctx.signals
                .register(crate::signals::ALL_EVENTS, move |name, _| {
                    log.lock().unwrap().push(name.to_string());
                });
        }
        post_instrument(
            State(Arc::clone(&ctx)),
            HeaderMap::new(),
            Json(json!({"main": {"volume": 70}})),
        )
        .await
        .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["active:preset:changed"]);
    }

    #[tokio::test]
    async fn test_misc_post_persists() {
        let (_dir, ctx) = test_ctx();
        let body = json!({"instrument_mode": "nine_cols"});
        post_misc(State(Arc::clone(&ctx)), HeaderMap::new(), Json(body))
            .await
            .unwrap();
        assert_eq!(ctx.state.with(|s| s.string_count), 3);
        let stored = ctx.store.load_config("misc").unwrap().unwrap();
        assert_eq!(stored["instrument_mode"], "nine_cols");
    }

    #[tokio::test]
    async fn test_misc_validation() {
        let (_dir, ctx) = test_ctx();
        let err = put_misc(
            State(ctx),
            HeaderMap::new(),
            Json(json!({"ui": {"brightness": 500}})),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let (_dir, ctx) = test_ctx();
        ctx.store
            .insert_preset("Exported", None, &json!({"main": {"volume": 88}}))
            .unwrap();
        ctx.store
            .save_config("misc", &ctx.state.with(|s| s.to_misc_dict()))
            .unwrap();

        let query: HashMap<String, String> = [
            ("presets".to_string(), "true".to_string()),
            ("settings".to_string(), "true".to_string()),
        ]
        .into();
        let response = export(State(Arc::clone(&ctx)), Query(query.clone()))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let exported: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(exported["presets"][0]["name"], "Exported");

        // wipe and re-import
        let (_dir2, ctx2) = test_ctx();
        import(
            State(Arc::clone(&ctx2)),
            Query(query),
            HeaderMap::new(),
            Json(exported),
        )
        .await
        .unwrap();
        let rows = ctx2.store.list_presets().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Exported");
    }
}
