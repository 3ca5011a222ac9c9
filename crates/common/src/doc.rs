// Replicated document wrapper over yrs (y-crdt Rust bindings).
//
// Two binary codecs are in play and must not be mixed on one load path:
// incremental live updates and state-vector diffs use the v1 encoding, durable
// snapshots use v2 end to end.

use anyhow::{Context, Result};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, MapRef, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// One resource's CRDT-backed content.
pub struct ReplicatedDoc {
    doc: Doc,
}

impl ReplicatedDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Materialize a document from a durable snapshot (v2 encoding only).
    pub fn from_snapshot(data: &[u8]) -> Result<Self> {
        let doc = Doc::new();
        let update = Update::decode_v2(data).context("failed to decode v2 snapshot")?;
        doc.transact_mut().apply_update(update).context("failed to apply v2 snapshot")?;
        Ok(Self { doc })
    }

    /// Encode the full document state as a durable snapshot (v2 encoding).
    pub fn encode_snapshot(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v2(&StateVector::default())
    }

    /// Apply an incremental live update (v1 encoding).
    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply update")?;
        Ok(())
    }

    /// Encode the full document state as one v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical timestamp) for the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute a v1 update containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Whether the document carries any edits (false for a blank doc).
    pub fn has_content(&self) -> bool {
        self.doc.transact().state_vector() != StateVector::default()
    }

    /// Get or create a `Text` shared type by name.
    pub fn get_or_insert_text(&self, name: &str) -> TextRef {
        self.doc.get_or_insert_text(name)
    }

    /// Get or create a `Map` shared type by name.
    pub fn get_or_insert_map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    /// Read the string content of a named text type.
    pub fn get_text_string(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }

    /// Insert text at position in a named text type.
    pub fn insert_text(&self, name: &str, index: u32, content: &str) {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    /// The underlying Doc (for awareness and advanced operations).
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}
