use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{Local, NaiveDateTime};
use image::{DynamicImage, ImageFormat};
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::api::Backend;

/// `{md5 of prompt}_{YYYYMMDDHHmmss}.png`
///
/// Identical prompts within the same second produce the same name, and the later
/// image replaces the earlier one.
pub fn image_file_name(prompt: &str, at: NaiveDateTime) -> String {
    format!(
        "{:x}_{}.png",
        Md5::digest(prompt.as_bytes()),
        at.format("%Y%m%d%H%M%S")
    )
}

/// Generates an image for `prompt` and saves it as a PNG under `dir`.
///
/// Request, decoding and file errors are reported on `out` and yield `Ok(None)`, so
/// the caller can carry on with the next turn. The only error returned is failing to
/// create `dir`, since no later request could be saved either.
pub async fn generate<B, W>(
    backend: &B,
    prompt: &str,
    dir: &Path,
    out: &mut W,
) -> Result<Option<PathBuf>>
where
    B: Backend + ?Sized,
    W: Write,
{
    let payload = match backend.create_image(prompt).await {
        Ok(payload) => payload,
        Err(e) => {
            writeln!(out, "Image creation error: {:#}", e)?;
            return Ok(None);
        }
    };

    let bytes = match BASE64_STANDARD.decode(payload.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            writeln!(out, "Base64 decode error: {}", e)?;
            return Ok(None);
        }
    };
    tracing::debug!(bytes = bytes.len(), "decoded image payload");

    let decoded = match image::load_from_memory_with_format(&bytes, ImageFormat::Png) {
        Ok(decoded) => decoded,
        Err(e) => {
            writeln!(out, "PNG decode error: {}", e)?;
            return Ok(None);
        }
    };

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create image directory {}", dir.display()))?;

    let path = dir.join(image_file_name(prompt, Local::now().naive_local()));
    let file = match File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            writeln!(out, "File creation error: {}", e)?;
            return Ok(None);
        }
    };

    if let Err(e) = write_png(&decoded, file) {
        writeln!(out, "PNG encode error: {:#}", e)?;
        return Ok(None);
    }

    tracing::info!(path = %path.display(), width = decoded.width(), height = decoded.height(), "saved image");
    writeln!(out, "The image was saved as: {}", path.display())?;
    Ok(Some(path))
}

fn write_png(decoded: &DynamicImage, file: File) -> Result<()> {
    let mut writer = BufWriter::new(file);
    decoded.write_to(&mut writer, ImageFormat::Png)?;
    writer.flush()?;
    Ok(())
}
