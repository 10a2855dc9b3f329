//! Image utility functions

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbImage;
use walkdir::WalkDir;

use crate::engine::preprocess::decode_image;
use crate::error::InputError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tif", "tiff"];

/// Whether a path has a raster image extension
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// List the images directly inside `dir` (or `dir` itself when it is a file), sorted
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, InputError> {
    if dir.is_file() {
        return Ok(vec![dir.to_path_buf()]);
    }
    if !dir.is_dir() {
        return Err(InputError::NotADirectory(dir.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

/// Read and decode an image file
pub fn read_image(path: &Path) -> Result<RgbImage, InputError> {
    let data = std::fs::read(path).map_err(|e| InputError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    decode_image(&data)
}

/// Encode and write an image, creating parent directories
pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
