//! Unique identifiers for protocol stacks

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a protocol stack
///
/// Each stack owns its own stages and timers. The id exists so that
/// diagnostics from several stacks in one process stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(Uuid);

impl PipelineId {
    /// Creates a new random pipeline ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a pipeline ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_id_uniqueness() {
        let id1 = PipelineId::new();
        let id2 = PipelineId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_pipeline_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = PipelineId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn test_display_prefix() {
        assert!(PipelineId::new().to_string().starts_with("Pipeline("));
    }

    #[test]
    fn test_pipeline_id_serde() {
        let id = PipelineId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: PipelineId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
