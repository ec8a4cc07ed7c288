//! Spec change events published by the registry.

use crate::types::SpecSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a registered spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecEventKind {
    #[serde(rename = "spec.added")]
    Added,
    #[serde(rename = "spec.updated")]
    Updated,
    #[serde(rename = "spec.removed")]
    Removed,
    #[serde(rename = "spec.error")]
    Error,
}

impl SpecEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "spec.added",
            Self::Updated => "spec.updated",
            Self::Removed => "spec.removed",
            Self::Error => "spec.error",
        }
    }
}

/// One spec change event. Timestamps serialize as RFC3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecEvent {
    #[serde(rename = "type")]
    pub kind: SpecEventKind,
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
    /// Entry snapshot for added/updated events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<SpecSnapshot>,
    /// Failure description for error events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpecEvent {
    #[must_use]
    pub fn new(kind: SpecEventKind, service_name: impl Into<String>) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            timestamp: Utc::now(),
            spec: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SpecSnapshot) -> Self {
        self.spec = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
