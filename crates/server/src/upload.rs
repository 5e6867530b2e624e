// crates/server/src/upload.rs
//! Multipart parsing and validation for generation requests.

use axum::extract::multipart::Field;
use axum::extract::Multipart;
use bytes::{Bytes, BytesMut};
use iavatar_core::{probe_audio, probe_image, AudioInfo, ImageInfo};
use iavatar_types::GenerationOptions;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

/// Options accepted as query parameters. Multipart text fields with the
/// same names take precedence.
#[derive(Debug, Default, Deserialize)]
pub struct OptionQuery {
    pub preprocess: Option<String>,
    pub still: Option<String>,
    pub use_enhancer: Option<String>,
}

/// A fully validated generation request, ready to stage.
#[derive(Debug)]
pub struct GenerationUpload {
    pub image: Bytes,
    pub image_info: ImageInfo,
    pub audio: Bytes,
    pub audio_info: AudioInfo,
    pub options: GenerationOptions,
}

/// Read and validate the `image`/`audio` upload plus options.
///
/// Nothing is written to disk here; a rejected request leaves no trace.
pub async fn read_generation_upload(
    mut multipart: Multipart,
    query: &OptionQuery,
    max_file_bytes: usize,
) -> ApiResult<GenerationUpload> {
    let mut image = None;
    let mut audio = None;
    let mut form = OptionQuery::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "audio" => {
                let bytes = read_file_field(field, &name, max_file_bytes).await?;
                let slot = if name == "image" { &mut image } else { &mut audio };
                if slot.replace(bytes).is_some() {
                    return Err(ApiError::Validation(format!(
                        "Field '{name}' was sent more than once"
                    )));
                }
            }
            "preprocess" => form.preprocess = Some(field.text().await?),
            "still" => form.still = Some(field.text().await?),
            "use_enhancer" => form.use_enhancer = Some(field.text().await?),
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    let image = image.ok_or_else(|| missing("image"))?;
    let audio = audio.ok_or_else(|| missing("audio"))?;

    let options = GenerationOptions::from_raw(
        form.preprocess.as_deref().or(query.preprocess.as_deref()),
        form.still.as_deref().or(query.still.as_deref()),
        form.use_enhancer.as_deref().or(query.use_enhancer.as_deref()),
    )?;

    // Decoding is CPU-bound; keep it off the async workers.
    let (image_bytes, audio_bytes) = (image.clone(), audio.clone());
    let (image_info, audio_info) = tokio::task::spawn_blocking(move || {
        let image_info = probe_image(&image_bytes)?;
        let audio_info = probe_audio(&audio_bytes)?;
        Ok::<_, ApiError>((image_info, audio_info))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("media probe task failed: {e}")))??;

    tracing::debug!(
        image_format = ?image_info.format,
        width = image_info.width,
        height = image_info.height,
        audio_secs = audio_info.duration_secs,
        sample_rate = audio_info.sample_rate,
        "Upload validated"
    );

    Ok(GenerationUpload {
        image,
        image_info,
        audio,
        audio_info,
        options,
    })
}

async fn read_file_field(mut field: Field<'_>, name: &str, limit: usize) -> ApiResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > limit {
            return Err(ApiError::PayloadTooLarge {
                field: name.to_string(),
                limit,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn missing(field: &str) -> ApiError {
    ApiError::Validation(format!("Missing required file field '{field}'"))
}
