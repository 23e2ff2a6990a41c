//! Upload persistence for guardian photos.
//!
//! Accepted files are written under a generated name (random hex prefix plus
//! a sanitized copy of the submitted name) and then downscaled in place to
//! fit the configured thumbnail bound. Image processing failures are
//! tolerated: the raw upload stays on disk and the request proceeds.
//!
//! Files are never deleted here. Replacing a guardian's photo or dropping a
//! guardian orphans the old file; disk usage grows monotonically.

use crate::config::StorageConfig;
use image::GenericImageView;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Filename extensions accepted for photo uploads
const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Errors that can occur while storing an upload
#[derive(Error, Debug)]
pub enum ImageStoreError {
    #[error("failed to create upload directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write upload {name}: {source}")]
    Write {
        name: String,
        source: std::io::Error,
    },
}

/// Store for uploaded guardian photos
pub struct ImageStore {
    upload_dir: PathBuf,
    max_dimension: u32,
}

impl ImageStore {
    /// Create a store rooted at the configured upload directory, creating
    /// the directory if needed.
    pub fn new(config: &StorageConfig) -> Result<Self, ImageStoreError> {
        fs::create_dir_all(&config.upload_dir).map_err(|source| ImageStoreError::CreateDir {
            dir: config.upload_dir.clone(),
            source,
        })?;

        Ok(Self {
            upload_dir: config.upload_dir.clone(),
            max_dimension: config.max_image_dimension,
        })
    }

    /// Persist one uploaded photo.
    ///
    /// Returns `Ok(None)` when the submitted filename is empty or fails the
    /// extension allow-list; otherwise writes the raw bytes under a
    /// generated name, bounds the image to the configured dimension in
    /// place, and returns the generated filename (not a path).
    ///
    /// A file that cannot be decoded or re-encoded is kept as uploaded; the
    /// failure is logged and the name is still returned.
    pub fn save_upload(
        &self,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<Option<String>, ImageStoreError> {
        if !has_allowed_extension(original_name) {
            debug!(name = %original_name, "Rejected upload by extension");
            return Ok(None);
        }

        let filename = format!(
            "{}_{}",
            Uuid::new_v4().simple(),
            sanitize_filename(original_name)
        );
        let path = self.upload_dir.join(&filename);

        fs::write(&path, bytes).map_err(|source| ImageStoreError::Write {
            name: filename.clone(),
            source,
        })?;

        self.bound_in_place(&path);

        debug!(name = %filename, size_bytes = bytes.len(), "Stored upload");
        Ok(Some(filename))
    }

    /// Validate a client-carried reference to an already-stored file.
    ///
    /// The edit form echoes stored filenames back through a hidden field;
    /// the value is only trusted if it is a plain filename that exists in
    /// the upload directory. Anything else degrades to "no photo".
    pub fn verify_existing(&self, name: &str) -> Option<String> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return None;
        }

        if self.upload_dir.join(name).is_file() {
            Some(name.to_string())
        } else {
            None
        }
    }

    /// Downscale the stored file to fit `max_dimension` on both axes,
    /// preserving aspect ratio. Never upscales. Failures are logged and
    /// swallowed: the unprocessed original stays on disk.
    fn bound_in_place(&self, path: &Path) {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Image processing failed, keeping original");
                return;
            }
        };

        let (width, height) = img.dimensions();
        if width <= self.max_dimension && height <= self.max_dimension {
            return;
        }

        let thumb = img.thumbnail(self.max_dimension, self.max_dimension);
        if let Err(e) = thumb.save(path) {
            warn!(path = %path.display(), error = %e, "Thumbnail save failed, keeping original");
        }
    }
}

/// Extension allow-list check: the segment after the LAST dot, lowercased,
/// must be one of the allowed extensions. Names without a dot fail.
fn has_allowed_extension(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| ext.eq_ignore_ascii_case(allowed)),
        None => false,
    }
}

/// Reduce a submitted filename to a single safe path component: characters
/// outside `[A-Za-z0-9._-]` become `_`, leading dots are stripped.
fn sanitize_filename(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    mapped.trim_start_matches('.').to_string()
}
