//! Progress reports sent over the optional response channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured progress report about one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub time: DateTime<Utc>,
    pub executor_id: String,
    pub unique_id: Uuid,
    pub subscription: String,
    pub payload: ReportPayload,
}

/// Report body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReportPayload {
    Progress { state: String, message: String },
    Logging { level: String, message: String },
}

impl Report {
    /// Creates a report stamped with the current time and a fresh id
    pub fn new(
        executor_id: impl Into<String>,
        subscription: impl Into<String>,
        payload: ReportPayload,
    ) -> Self {
        Self {
            time: Utc::now(),
            executor_id: executor_id.into(),
            unique_id: Uuid::new_v4(),
            subscription: subscription.into(),
            payload,
        }
    }
}
