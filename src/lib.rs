//! Guardian registry and pickup-handover service for a child-care facility.
//!
//! Guardians register contact details and photos for a child; pickups are
//! logged as handover events with a captured signature and can be exported
//! as a PDF record. All structured state lives in process memory; uploads
//! and signatures are plain files under one upload directory.

pub mod api;
pub mod config;
pub mod font;
pub mod image_store;
pub mod pdf;
pub mod registry;
pub mod signature_store;

pub use api::{create_router, AppState};
pub use config::Config;
