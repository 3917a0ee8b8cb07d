use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a job execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ExecutionStatus {
    /// Succeeded and failed are final; nothing transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Known state of one execution, keyed by `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub status: ExecutionStatus,
    /// External identifier used to re-fetch this record after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Remaining correlation fields (agent, team, workflow ids, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Partial update pushed by the execution bus. Only `id` is required.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExecutionUpdate {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ExecutionRecord {
    /// Build a record from the first update seen for an id.
    pub fn from_update(update: ExecutionUpdate) -> Self {
        Self {
            id: update.id,
            kind: update.kind.unwrap_or_default(),
            status: update.status.unwrap_or(ExecutionStatus::Pending),
            correlation_key: update.correlation_key,
            started_at: update.started_at,
            finished_at: update.finished_at,
            fields: update.fields,
        }
    }

    /// `self ∪ update`; the update wins on every field it carries.
    pub fn merge(&mut self, update: ExecutionUpdate) {
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.correlation_key.is_some() {
            self.correlation_key = update.correlation_key;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            self.finished_at = update.finished_at;
        }
        self.fields.extend(update.fields);
    }
}

impl From<ExecutionRecord> for ExecutionUpdate {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            id: record.id,
            kind: Some(record.kind),
            status: Some(record.status),
            correlation_key: record.correlation_key,
            started_at: record.started_at,
            finished_at: record.finished_at,
            fields: record.fields,
        }
    }
}

/// Events broadcast on the execution channel, one JSON object per text frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    ExecutionUpdate { execution: ExecutionUpdate },
    #[serde(other)]
    Other,
}
