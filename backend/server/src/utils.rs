//! Request payloads and field validation.
//!
//! Every body is decoded with unknown fields denied, then checked field by
//! field. Numeric fields below their floor are rejected, above their ceiling
//! they are clamped.
use axum::body::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, de::DeserializeOwned};
use std::sync::LazyLock;

use crate::{
    error::AppError,
    models::{StoreId, StoreProfile, SurveyContent, SurveyPhoto, SurveyStatus},
    taxonomy::{normalize_industries, normalize_tags},
};

pub const MAX_BODY_BYTES: usize = 1 << 20;
pub const MAX_PHOTOS: usize = 10;
pub const MAX_COMMENT_CHARS: usize = 4000;
pub const MAX_TEXT_CHARS: usize = 2000;
pub const MAX_EMAIL_LEN: usize = 254;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+$").expect("email pattern"));

pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|_| AppError::MalformedPayload)
}

/// Floor is rejected, ceiling is clamped.
fn bounded(value: i64, min: i64, max: i64, label: &str) -> Result<u32, AppError> {
    if value < min {
        return Err(AppError::invalid(format!("{label} must be at least {min}")));
    }

    Ok(value.min(max) as u32)
}

pub fn age(value: i64) -> Result<u32, AppError> {
    bounded(value, 18, 60, "age")
}

pub fn spec_score(value: i64) -> Result<u32, AppError> {
    bounded(value, 60, 140, "spec score")
}

pub fn wait_time_hours(value: i64) -> Result<u32, AppError> {
    bounded(value, 1, 24, "wait time")
}

pub fn average_earning(value: i64) -> Result<u32, AppError> {
    bounded(value, 0, 20, "average earning")
}

/// Rounded to the nearest half step.
pub fn rating(value: f64) -> Result<f64, AppError> {
    if !(0.0..=5.0).contains(&value) {
        return Err(AppError::invalid("rating must be between 0 and 5"));
    }

    Ok((value * 2.0).round() / 2.0)
}

/// `YYYY-MM`.
pub fn period(value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::invalid("period is required"));
    }

    NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d")
        .map(|date| date.format("%Y-%m").to_string())
        .map_err(|_| AppError::invalid(format!("malformed period: {value}")))
}

fn text(value: &str, max: usize, label: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.chars().count() > max {
        return Err(AppError::invalid(format!(
            "{label} must be at most {max} characters"
        )));
    }

    Ok(value.to_string())
}

pub fn comment(value: &str) -> Result<String, AppError> {
    text(value, MAX_COMMENT_CHARS, "comment")
}

pub fn contact_email(value: Option<&str>) -> Result<Option<String>, AppError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    if value.len() > MAX_EMAIL_LEN {
        return Err(AppError::invalid("email is too long"));
    }
    if !EMAIL.is_match(value) {
        return Err(AppError::invalid("malformed email"));
    }

    Ok(Some(value.to_string()))
}

fn optional_text(value: Option<String>, label: &str) -> Result<Option<String>, AppError> {
    value
        .map(|v| text(&v, MAX_TEXT_CHARS, label))
        .transpose()
        .map(|v| v.filter(|v| !v.is_empty()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PhotoPayload {
    pub id: String,
    #[serde(default)]
    pub stored_path: String,
    pub public_url: String,
    #[serde(default)]
    pub content_type: String,
}

pub fn photos(payloads: Vec<PhotoPayload>, now: DateTime<Utc>) -> Result<Vec<SurveyPhoto>, AppError> {
    if payloads.len() > MAX_PHOTOS {
        return Err(AppError::invalid(format!("at most {MAX_PHOTOS} photos")));
    }

    payloads
        .into_iter()
        .map(|photo| {
            let id = photo.id.trim().to_string();
            let public_url = photo.public_url.trim().to_string();

            if id.is_empty() {
                return Err(AppError::invalid("photo id is required"));
            }
            if public_url.is_empty() {
                return Err(AppError::invalid(format!("photo {id} needs a public url")));
            }

            Ok(SurveyPhoto {
                id,
                stored_path: photo.stored_path.trim().to_string(),
                public_url,
                content_type: photo.content_type.trim().to_string(),
                uploaded_at: now,
            })
        })
        .collect()
}

/// Survey fields shared by the anonymous and admin create paths.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContentPayload {
    #[serde(default, alias = "industries")]
    pub taxonomy: Vec<String>,
    #[serde(default, alias = "visitedAt")]
    pub period: String,
    pub age: Option<i64>,
    pub spec_score: Option<i64>,
    pub wait_time_hours: Option<i64>,
    pub average_earning: Option<i64>,
    #[serde(default)]
    pub customer_note: String,
    #[serde(default)]
    pub staff_note: String,
    #[serde(default)]
    pub environment_note: String,
    #[serde(default)]
    pub comment: String,
    pub rating: f64,
    pub contact_email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub photos: Vec<PhotoPayload>,
}

impl ContentPayload {
    pub fn validate(self, now: DateTime<Utc>) -> Result<SurveyContent, AppError> {
        Ok(SurveyContent {
            taxonomy: normalize_industries(&self.taxonomy)?,
            period: period(&self.period)?,
            age: self.age.map(age).transpose()?,
            spec_score: self.spec_score.map(spec_score).transpose()?,
            wait_time_hours: self.wait_time_hours.map(wait_time_hours).transpose()?,
            average_earning: self.average_earning.map(average_earning).transpose()?,
            customer_note: text(&self.customer_note, MAX_TEXT_CHARS, "customer note")?,
            staff_note: text(&self.staff_note, MAX_TEXT_CHARS, "staff note")?,
            environment_note: text(&self.environment_note, MAX_TEXT_CHARS, "environment note")?,
            comment: comment(&self.comment)?,
            rating: rating(self.rating)?,
            contact_email: contact_email(self.contact_email.as_deref())?,
            tags: normalize_tags(&self.tags)?,
            photos: photos(self.photos, now)?,
        })
    }
}

/// Anonymous submission: the store is named, not referenced.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmissionPayload {
    pub store_name: String,
    pub branch_name: Option<String>,
    #[serde(alias = "prefecture")]
    pub region: String,
    pub area: Option<String>,
    #[serde(default, alias = "industries")]
    pub taxonomy: Vec<String>,
    #[serde(default, alias = "visitedAt")]
    pub period: String,
    pub age: Option<i64>,
    pub spec_score: Option<i64>,
    pub wait_time_hours: Option<i64>,
    pub average_earning: Option<i64>,
    #[serde(default)]
    pub customer_note: String,
    #[serde(default)]
    pub staff_note: String,
    #[serde(default)]
    pub environment_note: String,
    #[serde(default)]
    pub comment: String,
    pub rating: f64,
    pub contact_email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub photos: Vec<PhotoPayload>,
}

impl SubmissionPayload {
    /// Store draft and validated content.
    pub fn split(self, now: DateTime<Utc>) -> Result<(StoreProfile, SurveyContent), AppError> {
        let name = self.store_name.trim().to_string();
        let region = self.region.trim().to_string();

        if name.is_empty() {
            return Err(AppError::invalid("store name is required"));
        }
        if region.is_empty() {
            return Err(AppError::invalid("region is required"));
        }

        let draft = StoreProfile {
            name,
            branch_name: optional_text(self.branch_name, "branch name")?,
            region,
            area: optional_text(self.area, "area")?,
            tags: Vec::new(),
            description: None,
        };

        let content = ContentPayload {
            taxonomy: self.taxonomy,
            period: self.period,
            age: self.age,
            spec_score: self.spec_score,
            wait_time_hours: self.wait_time_hours,
            average_earning: self.average_earning,
            customer_note: self.customer_note,
            staff_note: self.staff_note,
            environment_note: self.environment_note,
            comment: self.comment,
            rating: self.rating,
            contact_email: self.contact_email,
            tags: self.tags,
            photos: self.photos,
        }
        .validate(now)?;

        Ok((draft, content))
    }
}

/// Content edit. Has no store field, so `storeId` fails decoding.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SurveyPatch {
    #[serde(alias = "industries")]
    pub taxonomy: Option<Vec<String>>,
    #[serde(alias = "visitedAt")]
    pub period: Option<String>,
    pub age: Option<i64>,
    pub spec_score: Option<i64>,
    pub wait_time_hours: Option<i64>,
    pub average_earning: Option<i64>,
    pub customer_note: Option<String>,
    pub staff_note: Option<String>,
    pub environment_note: Option<String>,
    pub comment: Option<String>,
    pub rating: Option<f64>,
    pub contact_email: Option<String>,
    pub tags: Option<Vec<String>>,
    pub photos: Option<Vec<PhotoPayload>>,
}

impl SurveyPatch {
    pub fn is_empty(&self) -> bool {
        self.taxonomy.is_none()
            && self.period.is_none()
            && self.age.is_none()
            && self.spec_score.is_none()
            && self.wait_time_hours.is_none()
            && self.average_earning.is_none()
            && self.customer_note.is_none()
            && self.staff_note.is_none()
            && self.environment_note.is_none()
            && self.comment.is_none()
            && self.rating.is_none()
            && self.contact_email.is_none()
            && self.tags.is_none()
            && self.photos.is_none()
    }

    pub fn apply(self, current: &SurveyContent, now: DateTime<Utc>) -> Result<SurveyContent, AppError> {
        if self.is_empty() {
            return Err(AppError::invalid("no fields to update"));
        }

        let mut next = current.clone();

        if let Some(codes) = self.taxonomy {
            next.taxonomy = normalize_industries(&codes)?;
        }
        if let Some(value) = self.period {
            next.period = period(&value)?;
        }
        if let Some(value) = self.age {
            next.age = Some(age(value)?);
        }
        if let Some(value) = self.spec_score {
            next.spec_score = Some(spec_score(value)?);
        }
        if let Some(value) = self.wait_time_hours {
            next.wait_time_hours = Some(wait_time_hours(value)?);
        }
        if let Some(value) = self.average_earning {
            next.average_earning = Some(average_earning(value)?);
        }
        if let Some(value) = self.customer_note {
            next.customer_note = text(&value, MAX_TEXT_CHARS, "customer note")?;
        }
        if let Some(value) = self.staff_note {
            next.staff_note = text(&value, MAX_TEXT_CHARS, "staff note")?;
        }
        if let Some(value) = self.environment_note {
            next.environment_note = text(&value, MAX_TEXT_CHARS, "environment note")?;
        }
        if let Some(value) = self.comment {
            next.comment = comment(&value)?;
        }
        if let Some(value) = self.rating {
            next.rating = rating(value)?;
        }
        if let Some(value) = self.contact_email {
            next.contact_email = contact_email(Some(&value))?;
        }
        if let Some(tags) = self.tags {
            next.tags = normalize_tags(&tags)?;
        }
        if let Some(payloads) = self.photos {
            next.photos = photos(payloads, now)?;
        }

        Ok(next)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreCreatePayload {
    pub name: String,
    pub branch_name: Option<String>,
    #[serde(alias = "prefecture")]
    pub region: String,
    pub area: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
    #[serde(default, alias = "industries")]
    pub taxonomy: Vec<String>,
}

impl StoreCreatePayload {
    pub fn validate(self) -> Result<(StoreProfile, Vec<String>), AppError> {
        let name = self.name.trim().to_string();
        let region = self.region.trim().to_string();

        if name.is_empty() {
            return Err(AppError::invalid("store name is required"));
        }
        if region.is_empty() {
            return Err(AppError::invalid("region is required"));
        }

        let profile = StoreProfile {
            name,
            branch_name: optional_text(self.branch_name, "branch name")?,
            region,
            area: optional_text(self.area, "area")?,
            tags: normalize_tags(&self.tags)?,
            description: optional_text(self.description, "description")?,
        };

        Ok((profile, normalize_industries(&self.taxonomy)?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusPayload {
    pub status: SurveyStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReassignPayload {
    pub store_id: String,
}

impl ReassignPayload {
    pub fn store_id(&self) -> Result<StoreId, AppError> {
        self.store_id.parse()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelpfulPayload {
    #[serde(default = "default_helpful")]
    pub helpful: bool,
}

fn default_helpful() -> bool {
    true
}

impl HelpfulPayload {
    /// An empty body means "mark helpful".
    pub fn from_body(body: &Bytes) -> Result<Self, AppError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self { helpful: true });
        }

        parse_json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> ContentPayload {
        ContentPayload {
            taxonomy: vec!["deriheru".to_string()],
            period: "2024-05".to_string(),
            rating: 4.2,
            ..ContentPayload::default()
        }
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(age(17).is_err());
        assert_eq!(age(75).unwrap(), 60);
        assert!(spec_score(59).is_err());
        assert_eq!(spec_score(150).unwrap(), 140);
        assert!(wait_time_hours(0).is_err());
        assert_eq!(wait_time_hours(30).unwrap(), 24);
        assert!(average_earning(-1).is_err());
        assert_eq!(average_earning(25).unwrap(), 20);
        assert_eq!(average_earning(0).unwrap(), 0);
    }

    #[test]
    fn test_rating_rounding() {
        assert_eq!(rating(4.2).unwrap(), 4.0);
        assert_eq!(rating(4.3).unwrap(), 4.5);
        assert_eq!(rating(5.0).unwrap(), 5.0);
        assert!(rating(5.1).is_err());
        assert!(rating(-0.1).is_err());
        assert!(rating(f64::NAN).is_err());
    }

    #[test]
    fn test_period() {
        assert_eq!(period(" 2024-05 ").unwrap(), "2024-05");
        assert!(period("2024-13").is_err());
        assert!(period("May 2024").is_err());
        assert!(period("").is_err());
    }

    #[test]
    fn test_contact_email() {
        assert_eq!(contact_email(None).unwrap(), None);
        assert_eq!(contact_email(Some("  ")).unwrap(), None);
        assert_eq!(
            contact_email(Some(" a@example.com ")).unwrap().as_deref(),
            Some("a@example.com")
        );
        assert!(contact_email(Some("not-an-email")).is_err());

        let long = format!("{}@example.com", "a".repeat(250));
        assert!(contact_email(Some(&long)).is_err());
    }

    #[test]
    fn test_content_validation() {
        let validated = content().validate(Utc::now()).unwrap();
        assert_eq!(validated.taxonomy, vec!["デリヘル"]);
        assert_eq!(validated.rating, 4.0);

        let mut too_long = content();
        too_long.comment = "あ".repeat(MAX_COMMENT_CHARS + 1);
        assert!(too_long.validate(Utc::now()).is_err());

        let mut no_taxonomy = content();
        no_taxonomy.taxonomy.clear();
        assert!(no_taxonomy.validate(Utc::now()).is_err());

        let mut bad_tag = content();
        bad_tag.tags = vec!["sauna".to_string()];
        assert!(bad_tag.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_photo_limits() {
        let photo = |id: &str, url: &str| PhotoPayload {
            id: id.to_string(),
            stored_path: String::new(),
            public_url: url.to_string(),
            content_type: "image/jpeg".to_string(),
        };

        assert_eq!(photos(vec![photo("p1", "https://cdn/p1")], Utc::now()).unwrap().len(), 1);
        assert!(photos(vec![photo("p1", " ")], Utc::now()).is_err());
        assert!(photos(vec![photo("", "https://cdn/p1")], Utc::now()).is_err());

        let many = (0..=MAX_PHOTOS).map(|i| photo(&format!("p{i}"), "https://cdn/x")).collect();
        assert!(photos(many, Utc::now()).is_err());
    }

    #[test]
    fn test_patch_rejects_store_reference() {
        let body = Bytes::from_static(br#"{"comment":"ok","storeId":"abc"}"#);

        assert!(matches!(
            parse_json::<SurveyPatch>(&body),
            Err(AppError::MalformedPayload)
        ));
    }

    #[test]
    fn test_patch_apply() {
        let current = content().validate(Utc::now()).unwrap();

        assert!(SurveyPatch::default().apply(&current, Utc::now()).is_err());

        let patch: SurveyPatch =
            parse_json(&Bytes::from_static(br#"{"averageEarning":42,"rating":3.3}"#)).unwrap();
        let next = patch.apply(&current, Utc::now()).unwrap();

        assert_eq!(next.average_earning, Some(20));
        assert_eq!(next.rating, 3.5);
        assert_eq!(next.period, current.period);
    }

    #[test]
    fn test_submission_split() {
        let body = Bytes::from_static(
            r#"{"storeName":" Luna ","branchName":"","prefecture":"東京都","industries":["soap"],"visitedAt":"2024-05","rating":4.5,"age":22}"#
                .as_bytes(),
        );
        let payload: SubmissionPayload = parse_json(&body).unwrap();
        let (draft, content) = payload.split(Utc::now()).unwrap();

        assert_eq!(draft.name, "Luna");
        assert_eq!(draft.branch_name, None);
        assert_eq!(draft.region, "東京都");
        assert_eq!(content.taxonomy, vec!["ソープ"]);
        assert_eq!(content.age, Some(22));
    }

    #[test]
    fn test_helpful_body() {
        assert!(HelpfulPayload::from_body(&Bytes::new()).unwrap().helpful);
        assert!(!HelpfulPayload::from_body(&Bytes::from_static(br#"{"helpful":false}"#)).unwrap().helpful);
        assert!(HelpfulPayload::from_body(&Bytes::from_static(b"{}")).unwrap().helpful);
        assert!(HelpfulPayload::from_body(&Bytes::from_static(b"nope")).is_err());
    }
}
