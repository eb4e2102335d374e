//! Sound library resources: list, inspect, delete and upload of
//! SoundFont files.

use std::io::{Seek, SeekFrom, Write};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::server::{client_id, ApiError, Ctx};
use crate::signals::EventData;
use crate::sounds::{sanitize_filename, Sf2Headers, SoundFont};

pub async fn list(State(ctx): State<Ctx>) -> Json<Value> {
    let fonts = SoundFont::load_all(&ctx.settings.core.sound_dir);
    Json(Value::Array(fonts.iter().map(|f| f.as_json()).collect()))
}

pub async fn show(
    State(ctx): State<Ctx>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let font =
        SoundFont::by_id(&ctx.settings.core.sound_dir, &id).ok_or(ApiError::NotFound)?;
    Ok(Json(font.as_json()))
}

pub async fn delete(
    State(ctx): State<Ctx>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let filename = sanitize_filename(&id).ok_or(ApiError::NotFound)?;
    let filepath = ctx.settings.core.sound_dir.join(&filename);
    if !filepath.is_file() {
        return Err(ApiError::NotFound);
    }
    std::fs::remove_file(&filepath).map_err(|e| ApiError::Internal(e.to_string()))?;

    let cid = client_id(&headers);
    ctx.signals.set_client_id(cid);
    {
        let _lock = ctx.state.lock(Some("Loading..."), false);
        ctx.signals
            .emit("sound:deleted", EventData::with("id", json!(filename)));
    }
    ctx.signals.set_client_id(None);
    Ok(StatusCode::NO_CONTENT)
}

/// Stream the uploaded file into the staging directory, verify the
/// SoundFont headers, then rename it into the sound library.
pub async fn upload(
    State(ctx): State<Ctx>,
    Path(filename): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>, ApiError> {
    let filename = sanitize_filename(&filename)
        .ok_or_else(|| ApiError::BadRequest("invalid filename".to_string()))?;
    if !crate::sounds::has_soundfont_extension(std::path::Path::new(&filename)) {
        return Err(ApiError::BadRequest(
            "Invalid file extension, please use .sf2 or .sf3 files".to_string(),
        ));
    }

    let filepath = ctx.settings.core.sound_dir.join(&filename);
    let overwrite = filepath.is_file();
    let staging = ctx
        .settings
        .core
        .upload_dir
        .join(format!("{}.{}.part", filename, std::process::id()));

    let result = async {
        let mut file = std::fs::File::create(&staging)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ApiError::BadRequest(e.to_string()))?;
            file.write_all(&chunk)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Sf2Headers::parse(&mut file).map_err(|_| {
            ApiError::BadRequest("Invalid file format, is this really a SoundFont?".to_string())
        })?;
        drop(file);

        std::fs::rename(&staging, &filepath).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }

    let cid = client_id(&headers);
    ctx.signals.set_client_id(cid);
    if overwrite {
        let _lock = ctx.state.lock(Some("Loading..."), false);
        ctx.signals
            .emit("sound:changed", EventData::with("id", json!(filename)));
    } else {
        ctx.signals
            .emit("sound:added", EventData::with("id", json!(filename)));
    }
    ctx.signals.set_client_id(None);

    let font = SoundFont::load(&filepath).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(font.as_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::test_ctx;
    use crate::sounds::testdata::build_sf2;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_and_show() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(
            ctx.settings.core.sound_dir.join("a.sf2"),
            build_sf2("Alpha", "x", "", &[(0, 0, "P")]),
        )
        .unwrap();

        let Json(listed) = list(State(Arc::clone(&ctx))).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let Json(font) = show(State(Arc::clone(&ctx)), Path("a.sf2".to_string()))
            .await
            .unwrap();
        assert_eq!(font["name"], "Alpha");

        let err = show(State(ctx), Path("missing.sf2".to_string()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn test_upload_valid_font() {
        let (_dir, ctx) = test_ctx();
        let data = build_sf2("Up", "x", "", &[(0, 0, "P")]);
        let Json(font) = upload(
            State(Arc::clone(&ctx)),
            Path("up.sf2".to_string()),
            HeaderMap::new(),
            Body::from(data),
        )
        .await
        .unwrap();
        assert_eq!(font["name"], "Up");
        assert!(ctx.settings.core.sound_dir.join("up.sf2").is_file());
    }

    #[tokio::test]
    async fn test_upload_rejects_garbage() {
        let (_dir, ctx) = test_ctx();
        let err = upload(
            State(Arc::clone(&ctx)),
            Path("bad.sf2".to_string()),
            HeaderMap::new(),
            Body::from("this is not a soundfont"),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(!ctx.settings.core.sound_dir.join("bad.sf2").exists());
        // staging area is clean
        let staged: Vec<_> = std::fs::read_dir(&ctx.settings.core.upload_dir)
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_extension() {
        let (_dir, ctx) = test_ctx();
        let err = upload(
            State(ctx),
            Path("notes.txt".to_string()),
            HeaderMap::new(),
            Body::from("x"),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_delete_emits_signal() {
        let (_dir, ctx) = test_ctx();
        std::fs::write(
            ctx.settings.core.sound_dir.join("gone.sf2"),
            build_sf2("Gone", "x", "", &[(0, 0, "P")]),
        )
        .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            ctx.signals.register("sound:deleted", move |_, data| {
                seen.lock()
                    .unwrap()
                    .push(data.get_str("id").unwrap().to_string());
            });
        }

        let status = delete(
            State(Arc::clone(&ctx)),
            Path("gone.sf2".to_string()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(*seen.lock().unwrap(), vec!["gone.sf2"]);
        assert!(!ctx.settings.core.sound_dir.join("gone.sf2").exists());
    }
}
