//! Core domain model for saved marketplace searches and the listings they return.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "listwatch-core";

/// Fixed conversion rate used by the marketplace for BGN denominated prices.
pub const BGN_TO_EUR_RATE: f64 = 1.9558;

/// Timestamp as delivered by the listing source: epoch milliseconds, a textual
/// date, or something unrecognizable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(f64),
    Text(String),
    Unrecognized(JsonValue),
}

impl RawTimestamp {
    /// Comparable instant in epoch milliseconds. Unparsable values map to
    /// negative infinity so they sort last and never pass a finite lower bound.
    pub fn instant_millis(&self) -> f64 {
        match self {
            RawTimestamp::Epoch(value) if value.is_finite() => *value,
            RawTimestamp::Epoch(_) => f64::NEG_INFINITY,
            RawTimestamp::Text(text) => parse_text_instant(text).unwrap_or(f64::NEG_INFINITY),
            RawTimestamp::Unrecognized(_) => f64::NEG_INFINITY,
        }
    }
}

impl From<&str> for RawTimestamp {
    fn from(value: &str) -> Self {
        RawTimestamp::Text(value.to_string())
    }
}

/// Normalize an optional timestamp; missing values behave like malformed ones.
pub fn normalize_instant(value: Option<&RawTimestamp>) -> f64 {
    value
        .map(RawTimestamp::instant_millis)
        .unwrap_or(f64::NEG_INFINITY)
}

fn parse_text_instant(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_millis() as f64);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.timestamp_millis() as f64);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc().timestamp_millis() as f64);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis() as f64)
}

/// Condition tags a saved search restricts to, or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionFilter {
    #[default]
    Any,
    Only(Vec<String>),
}

impl ConditionFilter {
    /// Build from raw tags, keeping first-seen order. Blank tags are dropped and
    /// an empty result means the wildcard.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if !tag.is_empty() && !kept.iter().any(|k| k == tag) {
                kept.push(tag.to_string());
            }
        }
        if kept.is_empty() {
            ConditionFilter::Any
        } else {
            ConditionFilter::Only(kept)
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, ConditionFilter::Any)
    }

    pub fn tags(&self) -> &[String] {
        match self {
            ConditionFilter::Any => &[],
            ConditionFilter::Only(tags) => tags,
        }
    }
}

/// A persisted query the watcher polls on the operator's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub search_id: String,
    pub alias: String,
    pub active: bool,
    pub search_term: String,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub condition: ConditionFilter,
    pub watermark: Option<Watermark>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationSummary {
    pub city: Option<String>,
    pub district: Option<String>,
    pub region: Option<String>,
}

impl LocationSummary {
    pub fn display(&self) -> String {
        [&self.city, &self.district, &self.region]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Last detection anchor of a saved search plus a display snapshot of the
/// listing it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub offer_id: String,
    #[serde(rename = "modified", default)]
    pub modified_at: Option<RawTimestamp>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "price", default)]
    pub price_eur: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub location: LocationSummary,
}

impl Watermark {
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            offer_id: listing.id.clone(),
            modified_at: listing.modified_at.clone(),
            title: Some(listing.title.clone()),
            price_eur: listing.price_eur(),
            description: Some(listing.description.clone()),
            image_url: listing.first_photo_link().map(str::to_string),
            link: Some(listing.url.clone()),
            location: listing.location_summary(),
        }
    }

    pub fn instant_millis(&self) -> f64 {
        normalize_instant(self.modified_at.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub link: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Promotion {
    #[serde(default, deserialize_with = "null_as_default")]
    pub highlighted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub top_ad: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub urgent: bool,
}

impl Promotion {
    /// Paid placement that must never count as organic signal.
    pub fn is_sponsored(&self) -> bool {
        self.highlighted || self.top_ad
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamedPlace {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingLocation {
    #[serde(default)]
    pub city: Option<NamedPlace>,
    #[serde(default)]
    pub district: Option<NamedPlace>,
    #[serde(default)]
    pub region: Option<NamedPlace>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingParam {
    #[serde(default, deserialize_with = "null_as_default")]
    pub key: String,
    #[serde(default)]
    pub value: JsonValue,
}

/// One entry of a fetched result page. Transient: only the newest one is ever
/// kept, as a watermark.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub photos: Vec<Photo>,
    #[serde(rename = "last_refresh_time", default)]
    pub modified_at: Option<RawTimestamp>,
    #[serde(default)]
    pub promotion: Option<Promotion>,
    #[serde(default)]
    pub location: Option<ListingLocation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: Vec<ListingParam>,
}

impl Listing {
    pub fn is_sponsored(&self) -> bool {
        self.promotion.map(|p| p.is_sponsored()).unwrap_or(false)
    }

    pub fn instant_millis(&self) -> f64 {
        normalize_instant(self.modified_at.as_ref())
    }

    pub fn first_photo_link(&self) -> Option<&str> {
        self.photos
            .first()
            .map(|photo| photo.link.as_str())
            .filter(|link| !link.is_empty())
    }

    pub fn location_summary(&self) -> LocationSummary {
        let name = |place: Option<&NamedPlace>| place.and_then(|p| p.name.clone());
        match &self.location {
            Some(location) => LocationSummary {
                city: name(location.city.as_ref()),
                district: name(location.district.as_ref()),
                region: name(location.region.as_ref()),
            },
            None => LocationSummary::default(),
        }
    }

    /// Price in EUR derived from the `price` param, if the listing carries one.
    pub fn price_eur(&self) -> Option<f64> {
        let price = &self.params.iter().find(|param| param.key == "price")?.value;
        let amount = price.get("value").and_then(JsonValue::as_f64)?;
        match price.get("currency").and_then(JsonValue::as_str) {
            Some("BGN") => Some(amount / BGN_TO_EUR_RATE),
            _ => Some(amount),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "listing id must be a string or number, got {other}"
        ))),
    }
}
