//! Row types for the graph memory store and the profile delta produced by
//! structured extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ExtractionError, StoreError};

/// Author of a message. Stored as the direction of the SENT edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Value of `sent_edges.direction` for this role.
    pub(crate) fn direction(&self) -> &'static str {
        match self {
            Role::User => "user_to_message",
            Role::Assistant => "message_to_user",
        }
    }

    pub(crate) fn from_direction(direction: &str) -> Result<Self, StoreError> {
        match direction {
            "user_to_message" => Ok(Role::User),
            "message_to_user" => Ok(Role::Assistant),
            other => Err(StoreError::Malformed(format!("unknown SENT direction '{}'", other))),
        }
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(StoreError::InvalidRole(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub text: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub symptoms: Vec<String>,
    pub conditions: Vec<String>,
    pub family_members: Vec<FamilyMemberProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FamilyMemberProfile {
    pub relation: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub symptoms: Vec<String>,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_users: i64,
    pub total_messages: i64,
    pub total_symptoms: i64,
    pub total_conditions: i64,
    pub total_family_members: i64,
    pub database_size_bytes: i64,
}

/// Profile facts extracted from one user message. Every field may be null
/// or missing; absent facts never erase stored ones.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtractedProfile {
    #[serde(default, deserialize_with = "non_blank")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_age")]
    pub age: Option<u32>,
    #[serde(default, deserialize_with = "string_list")]
    pub symptoms: Vec<String>,
    #[serde(default, alias = "conditions", deserialize_with = "string_list")]
    pub health_conditions: Vec<String>,
    #[serde(default, deserialize_with = "family_list")]
    pub family_members: Vec<FamilyMemberDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FamilyMemberDelta {
    #[serde(default, deserialize_with = "non_blank")]
    pub relation: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_age")]
    pub age: Option<u32>,
    #[serde(default, alias = "conditions", alias = "health_conditions", deserialize_with = "string_list")]
    pub condition: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub symptoms: Vec<String>,
}

impl ExtractedProfile {
    /// Parse extractor output. Tolerates markdown code fences and prose
    /// around a single JSON object.
    pub fn from_llm_output(raw: &str) -> Result<Self, ExtractionError> {
        let trimmed = raw.trim();
        let start = trimmed.find('{');
        let end = trimmed.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &trimmed[s..=e],
            _ => return Err(ExtractionError::Format(preview(trimmed))),
        };
        serde_json::from_str(json).map_err(|e| ExtractionError::Format(format!("{} in {}", e, preview(json))))
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.age.is_none()
            && self.symptoms.is_empty()
            && self.health_conditions.is_empty()
            && self.family_members.is_empty()
    }
}

fn preview(s: &str) -> String {
    let mut out: String = s.chars().take(120).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

fn non_blank<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// Ages arrive as integers, floats or numeric strings depending on the model.
fn lenient_age<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `null`, a bare string or a list of strings; non-string items are dropped.
fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Some(serde_json::Value::String(s)) => vec![s],
        _ => Vec::new(),
    })
}

fn family_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<FamilyMemberDelta>, D::Error> {
    Ok(Option::<Vec<FamilyMemberDelta>>::deserialize(d)?.unwrap_or_default())
}
