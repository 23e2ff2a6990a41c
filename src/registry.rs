//! In-memory registry of children, their guardians, and their handover logs.
//!
//! State lives for the lifetime of the process only: restart loses every
//! registration and handover while leaving previously uploaded files on disk.
//! Both maps are keyed by an opaque 8-character child identifier minted at
//! registration time.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors surfaced by registry lookups
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown child identifier: {0}")]
    ChildNotFound(String),
}

/// A contact authorized to pick up a child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    /// Guardian display name
    pub name: String,
    /// Contact phone number
    pub phone: String,
    /// Stored photo filename within the upload directory, if any
    pub photo: Option<String>,
}

/// One logged pickup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverEvent {
    /// Name of the guardian who picked the child up
    pub guardian_name: String,
    /// Stored signature filename within the upload directory
    pub signature_file: String,
}

/// Registry of guardians plus the append-only handover log, both in memory.
///
/// The two maps are populated together by [`register`](Registry::register).
/// Edits replace a guardian list wholesale and may create a guardian entry
/// for an identifier that was never registered; the handover log is never
/// created that way, so appends still fail for such identifiers.
pub struct Registry {
    children: RwLock<HashMap<String, Vec<Guardian>>>,
    handovers: RwLock<HashMap<String, Vec<HandoverEvent>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            children: RwLock::new(HashMap::new()),
            handovers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new child with the given guardian list.
    ///
    /// Mints a fresh child identifier, stores the list under it, and
    /// initializes an empty handover log for it. An empty guardian list is
    /// a valid registration.
    pub fn register(&self, guardians: Vec<Guardian>) -> String {
        let child_id = new_child_id();

        self.children.write().insert(child_id.clone(), guardians);
        self.handovers.write().insert(child_id.clone(), Vec::new());

        debug!(child_id = %child_id, "Registered child");
        child_id
    }

    /// Current guardian list for an identifier.
    ///
    /// Returns an empty list for an unknown identifier: callers cannot
    /// distinguish "never registered" from "registered with no guardians".
    pub fn guardians(&self, child_id: &str) -> Vec<Guardian> {
        self.children
            .read()
            .get(child_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Guardian list for an identifier that must exist.
    ///
    /// Used by the handover form, which unlike the view page refuses to
    /// serve unknown identifiers.
    pub fn guardians_strict(&self, child_id: &str) -> Result<Vec<Guardian>, RegistryError> {
        self.children
            .read()
            .get(child_id)
            .cloned()
            .ok_or_else(|| RegistryError::ChildNotFound(child_id.to_string()))
    }

    /// Replace the guardian list for an identifier in a single assignment.
    ///
    /// Creates the guardian entry if the identifier was never registered;
    /// the handover log is left untouched either way.
    pub fn replace_guardians(&self, child_id: &str, guardians: Vec<Guardian>) {
        self.children
            .write()
            .insert(child_id.to_string(), guardians);

        debug!(child_id = %child_id, "Replaced guardian list");
    }

    /// Append a handover event to a registered child's log.
    ///
    /// Fails with [`RegistryError::ChildNotFound`] when the identifier was
    /// never registered (a log exists only for registered identifiers).
    pub fn append_handover(
        &self,
        child_id: &str,
        event: HandoverEvent,
    ) -> Result<(), RegistryError> {
        let mut handovers = self.handovers.write();
        let log = handovers
            .get_mut(child_id)
            .ok_or_else(|| RegistryError::ChildNotFound(child_id.to_string()))?;

        log.push(event);
        debug!(child_id = %child_id, events = log.len(), "Appended handover event");
        Ok(())
    }

    /// Ordered handover log for an identifier, empty when unknown.
    ///
    /// The export path tolerates unknown identifiers (it renders a
    /// header-only document), so no existence check here.
    pub fn handover_log(&self, child_id: &str) -> Vec<HandoverEvent> {
        self.handovers
            .read()
            .get(child_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of registered children
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Total handover events across all children
    pub fn handover_count(&self) -> usize {
        self.handovers.read().values().map(Vec::len).sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint an 8-character child identifier (leading hex of a random UUID)
fn new_child_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
