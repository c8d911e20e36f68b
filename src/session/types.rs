//! Session and iteration entities plus the per-iteration metadata codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An addressable editing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The checked-out iteration. Always belongs to this session when set.
    pub current_iteration_id: Option<String>,
    pub model: String,
}

impl Session {
    /// Build a fresh, unpersisted session.
    pub fn new(name: Option<String>, model: impl Into<String>) -> Self {
        let now = crate::util::timestamp_now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            created_at: now,
            updated_at: now,
            current_iteration_id: None,
            model: model.into(),
        }
    }

    /// Name for display, falling back to the short id.
    pub fn display_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.id.chars().take(8).collect(),
        }
    }
}

/// Which provider call produced an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Generate,
    Edit,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(Self::Generate),
            "edit" => Ok(Self::Edit),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

/// Denormalized display snapshot stored alongside an iteration.
///
/// Independent of the cost ledger; never used for accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub quality: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(skip_serializing_if = "is_false")]
    pub transparent: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub cost: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl IterationMetadata {
    /// Encode to the stored text form. Zero-valued fields are omitted.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Decode a stored blob.
    ///
    /// Empty or malformed input yields the zero value; a bad blob must never
    /// abort the read that is loading the iteration. Unknown fields are ignored.
    pub fn decode(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        match serde_json::from_str(trimmed) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("ignoring malformed iteration metadata: {e}");
                Self::default()
            }
        }
    }
}

/// The recorded result of one generate or edit call.
///
/// Immutable once persisted. `parent_id` links backward only; branches appear
/// when several iterations share a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub operation: Operation,
    pub prompt: String,
    pub revised_prompt: Option<String>,
    pub model: String,
    pub image_path: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: IterationMetadata,
}

/// Caller-supplied content for a new iteration.
///
/// Identity, ownership, parentage and timestamp are assigned by the session
/// manager.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIteration {
    pub operation: Operation,
    pub prompt: String,
    pub revised_prompt: Option<String>,
    /// Empty means "use the session's model".
    pub model: String,
    pub image_path: String,
    pub metadata: IterationMetadata,
}

impl NewIteration {
    pub fn new(operation: Operation, prompt: impl Into<String>) -> Self {
        Self {
            operation,
            prompt: prompt.into(),
            revised_prompt: None,
            model: String::new(),
            image_path: String::new(),
            metadata: IterationMetadata::default(),
        }
    }

    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = path.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_revised_prompt(mut self, revised: impl Into<String>) -> Self {
        self.revised_prompt = Some(revised.into());
        self
    }

    pub fn with_metadata(mut self, metadata: IterationMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
