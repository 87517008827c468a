//! Volcano PodGroup serialization types
//!
//! Typed representation of Volcano `scheduling.volcano.sh/v1beta1` PodGroup
//! resources. Uses serde for JSON compatible with the Kubernetes API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// API version of Volcano PodGroups
pub const POD_GROUP_API_VERSION: &str = "scheduling.volcano.sh/v1beta1";

/// Kind of Volcano PodGroups
pub const POD_GROUP_KIND: &str = "PodGroup";

/// Volcano PodGroup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroup {
    pub api_version: String,
    pub kind: String,
    pub metadata: PodGroupMetadata,
    pub spec: PodGroupSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodGroupStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// PodGroup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupSpec {
    /// Units that must be placeable together before any is admitted
    pub min_member: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Scheduling phase reported by Volcano
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodGroupPhase {
    /// Not enough resources for `minMember` units
    #[default]
    Pending,
    /// Resources reserved for the whole group
    Inqueue,
    /// At least `minMember` units are running
    Running,
    /// Some members were lost after admission
    Unknown,
    /// All members finished
    Completed,
}

impl PodGroupPhase {
    /// Whether the whole group has been admitted by the scheduler
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Inqueue | Self::Running)
    }
}

/// PodGroup status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupStatus {
    #[serde(default)]
    pub phase: PodGroupPhase,
    #[serde(default)]
    pub running: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

impl PodGroup {
    /// Whether Volcano reports the group as fully admitted
    pub fn is_admitted(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase.is_admitted())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_from_volcano_json() {
        let json = serde_json::json!({
            "apiVersion": POD_GROUP_API_VERSION,
            "kind": POD_GROUP_KIND,
            "metadata": {"name": "train1", "namespace": "default"},
            "spec": {"minMember": 4},
            "status": {"phase": "Inqueue", "running": 0}
        });
        let pg: PodGroup = serde_json::from_value(json).unwrap();
        assert_eq!(pg.spec.min_member, 4);
        assert!(pg.is_admitted());
    }

    #[test]
    fn group_without_status_is_not_admitted() {
        let pg = PodGroup {
            api_version: POD_GROUP_API_VERSION.to_string(),
            kind: POD_GROUP_KIND.to_string(),
            metadata: PodGroupMetadata::default(),
            spec: PodGroupSpec::default(),
            status: None,
        };
        assert!(!pg.is_admitted());
        assert!(!PodGroupPhase::Pending.is_admitted());
        assert!(!PodGroupPhase::Unknown.is_admitted());
    }
}
