//! Decoding and persistence of handover signature images.
//!
//! The pickup form submits the signature pad as a base64 data URI
//! (`data:image/png;base64,<payload>`). Only the payload after the first
//! comma is used; the media-type header is not inspected. Decoded bytes are
//! written verbatim next to the photo uploads as
//! `{random hex}_signature.png`.

use crate::config::StorageConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur while storing a signature
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("failed to create upload directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("signature payload is not a data URI")]
    MissingPayload,

    #[error("signature payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to write signature {name}: {source}")]
    Write {
        name: String,
        source: std::io::Error,
    },
}

/// Store for decoded signature images
pub struct SignatureStore {
    upload_dir: PathBuf,
}

impl SignatureStore {
    /// Create a store writing into the configured upload directory,
    /// creating the directory if needed.
    pub fn new(config: &StorageConfig) -> Result<Self, SignatureError> {
        fs::create_dir_all(&config.upload_dir).map_err(|source| SignatureError::CreateDir {
            dir: config.upload_dir.clone(),
            source,
        })?;

        Ok(Self {
            upload_dir: config.upload_dir.clone(),
        })
    }

    /// Decode a signature data URI and persist it.
    ///
    /// Returns the generated filename. The payload is everything after the
    /// first comma; a URI without a comma or with an undecodable payload is
    /// rejected without touching disk.
    pub fn save_data_uri(&self, data_uri: &str) -> Result<String, SignatureError> {
        let (_, payload) = data_uri
            .split_once(',')
            .ok_or(SignatureError::MissingPayload)?;

        let bytes = STANDARD.decode(payload)?;

        let filename = format!("{}_signature.png", Uuid::new_v4().simple());
        let path = self.upload_dir.join(&filename);
        fs::write(&path, &bytes).map_err(|source| SignatureError::Write {
            name: filename.clone(),
            source,
        })?;

        debug!(name = %filename, size_bytes = bytes.len(), "Stored signature");
        Ok(filename)
    }
}
