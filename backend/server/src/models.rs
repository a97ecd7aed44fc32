//! # Records
//!
//! Three logical collections: stores, surveys and votes.
//!
//! - A store carries a [`StoreStats`] block that is only ever written by the
//!   recalculator in [`crate::stats`].
//! - A survey references exactly one store. The reference moves only through
//!   [`crate::commands::SurveyCommands::reassign_store`].
//! - A vote is a (survey, voter) pair. Its existence is the "helpful" state.
use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

macro_rules! record_id {
    ($name:ident, $label:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| AppError::InvalidReference(format!("malformed {} id", $label)))
            }
        }
    };
}

record_id!(StoreId, "store");
record_id!(SurveyId, "survey");

/// Pseudonymous helpful voter. Only ever minted by [`crate::voter`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts only ids that survive the token payload format unescaped.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub review_count: u64,
    pub avg_rating: Option<f64>,
    pub avg_earning: Option<f64>,
    /// Hours.
    pub avg_wait_time: Option<f64>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StoreProfile {
    pub fn identity(&self) -> StoreIdentity {
        StoreIdentity::new(&self.name, self.branch_name.as_deref())
    }
}

/// Trimmed name plus trimmed branch. An empty branch is the same as no branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreIdentity {
    name: String,
    branch: Option<String>,
}

impl StoreIdentity {
    pub fn new(name: &str, branch: Option<&str>) -> Self {
        Self {
            name: name.trim().to_string(),
            branch: branch
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn key(&self) -> String {
        format!("{}\u{1f}{}", self.name, self.branch.as_deref().unwrap_or(""))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub id: StoreId,
    #[serde(flatten)]
    pub profile: StoreProfile,
    pub taxonomy: BTreeSet<String>,
    pub stats: StoreStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub fn new(profile: StoreProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: StoreId::generate(),
            profile,
            taxonomy: BTreeSet::new(),
            stats: StoreStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveyStatus {
    Pending,
    #[default]
    Approved,
    Rejected,
}

impl SurveyStatus {
    /// Only approved surveys feed public stats and listings.
    pub fn is_public(self) -> bool {
        self == SurveyStatus::Approved
    }
}

impl FromStr for SurveyStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SurveyStatus::Pending),
            "approved" => Ok(SurveyStatus::Approved),
            "rejected" => Ok(SurveyStatus::Rejected),
            other => Err(AppError::invalid(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyPhoto {
    pub id: String,
    pub stored_path: String,
    pub public_url: String,
    #[serde(default)]
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyContent {
    pub taxonomy: Vec<String>,
    pub period: String,
    pub age: Option<u32>,
    pub spec_score: Option<u32>,
    pub wait_time_hours: Option<u32>,
    pub average_earning: Option<u32>,
    #[serde(default)]
    pub customer_note: String,
    #[serde(default)]
    pub staff_note: String,
    #[serde(default)]
    pub environment_note: String,
    #[serde(default)]
    pub comment: String,
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub photos: Vec<SurveyPhoto>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Moderation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Logged-in submitter, used for attribution only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitter {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl Submitter {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.username.as_deref())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("anonymous")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Survey {
    pub id: SurveyId,
    pub store_id: StoreId,
    #[serde(flatten)]
    pub content: SurveyContent,
    pub status: SurveyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation: Option<Moderation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<Submitter>,
    #[serde(default)]
    pub helpful_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Survey {
    pub fn new(
        store_id: StoreId,
        content: SurveyContent,
        status: SurveyStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SurveyId::generate(),
            store_id,
            content,
            status,
            moderation: None,
            submitter: None,
            helpful_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Vote {
    pub survey_id: SurveyId,
    pub voter_id: VoterId,
    pub created_at: DateTime<Utc>,
}

/// Undeliverable admin notification kept for manual follow-up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFailure {
    pub survey_id: SurveyId,
    pub store_id: StoreId,
    pub store_name: String,
    pub identifier: String,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_blank_branch_matches_absent() {
        let blank = StoreIdentity::new(" Luna ", Some("  "));
        let absent = StoreIdentity::new("Luna", None);

        assert_eq!(blank, absent);
        assert_eq!(blank.key(), absent.key());
    }

    #[test]
    fn test_identity_distinguishes_branches() {
        let east = StoreIdentity::new("Luna", Some("East"));
        let west = StoreIdentity::new("Luna", Some(" West "));

        assert_ne!(east.key(), west.key());
        assert_eq!(west.branch(), Some("West"));
    }

    #[test]
    fn test_record_ids() {
        let id = StoreId::generate();
        let parsed: StoreId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        assert!(matches!(
            "not-an-id".parse::<SurveyId>(),
            Err(AppError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_voter_id_rejects_payload_separators() {
        assert!(VoterId::parse("abc123-def").is_some());
        assert!(VoterId::parse("").is_none());
        assert!(VoterId::parse("a&ts=1").is_none());
        assert!(VoterId::parse("a=b").is_none());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Approved".parse::<SurveyStatus>().unwrap(), SurveyStatus::Approved);
        assert!("archived".parse::<SurveyStatus>().is_err());
        assert!(!SurveyStatus::Pending.is_public());
    }
}
