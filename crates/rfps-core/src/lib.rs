//! Wire schema for SAM.gov opportunity search results.
//!
//! Only the required set is strict. Optional fields that are missing, null, or
//! of an unexpected type decode to their empty value, and unknown keys on an
//! opportunity are carried through untouched so artifacts keep the full record.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "rfps-core";

/// Hard per-request record cap documented by the search API.
pub const API_MAX_LIMIT: u32 = 1000;

/// Date format the search API expects for `postedFrom` / `postedTo`.
pub const POSTED_DATE_FORMAT: &str = "%m/%d/%Y";

pub fn format_posted_date(date: NaiveDate) -> String {
    date.format(POSTED_DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct City {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Country {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub city: Option<City>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub country: Option<Country>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Awardee {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub location: Option<Location>,
    #[serde(rename = "ueiSAM", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub uei_sam: Option<String>,
    #[serde(rename = "cageCode", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub cage_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Award {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub awardee: Option<Awardee>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointOfContact {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub fax: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub contact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficeAddress {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub zipcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub state: Option<String>,
}

/// One contracting notice. `notice_id` is the identity within a search window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub notice_id: String,
    pub title: String,
    pub solicitation_number: String,
    pub full_parent_path_name: String,
    pub full_parent_path_code: String,
    pub posted_date: String,
    #[serde(rename = "type")]
    pub notice_type: String,
    pub base_type: String,
    pub active: String,
    pub description: String,
    pub organization_type: String,
    pub ui_link: String,
    pub links: Vec<Link>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub archive_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub archive_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub type_of_set_aside_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub type_of_set_aside: Option<String>,
    #[serde(
        rename = "responseDeadLine",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub response_deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub naics_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "lenient")]
    pub naics_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub classification_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub award: Option<Award>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "lenient")]
    pub point_of_contact: Vec<PointOfContact>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub office_address: Option<OfficeAddress>,
    /// Shape varies across notice types; kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_of_performance: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub additional_info_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_links: Option<JsonValue>,

    /// Upstream keys this schema does not name.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Decode an optional field, falling back to its empty value on `null` or a
/// type mismatch instead of failing the whole page.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::default());
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(decoded),
        Err(err) => {
            warn!(error = %err, "dropping mistyped optional field");
            Ok(T::default())
        }
    }
}

/// One response page of `/v2/search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponsePage {
    /// Record count for the whole window, repeated on every page.
    pub total_records: u64,
    pub limit: u64,
    pub offset: u64,
    pub opportunities_data: Vec<Opportunity>,
    #[serde(default, deserialize_with = "lenient")]
    pub links: Vec<Link>,
}

#[derive(Debug, Error)]
#[error("schema validation failed for {context}: {source}")]
pub struct SchemaValidationError {
    context: String,
    #[source]
    source: serde_json::Error,
}

impl SchemaValidationError {
    pub fn new(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Field-level detail, e.g. "missing field `title` at line 1 column 212".
    pub fn detail(&self) -> String {
        self.source.to_string()
    }

    pub fn line(&self) -> usize {
        self.source.line()
    }

    pub fn column(&self) -> usize {
        self.source.column()
    }
}

pub fn parse_search_page(bytes: &[u8]) -> Result<SearchResponsePage, SchemaValidationError> {
    serde_json::from_slice(bytes).map_err(|err| SchemaValidationError::new("search response page", err))
}

/// Parse a JSON array of opportunities, as written by the output writer.
pub fn parse_opportunities(bytes: &[u8]) -> Result<Vec<Opportunity>, SchemaValidationError> {
    serde_json::from_slice(bytes).map_err(|err| SchemaValidationError::new("opportunity list", err))
}

/// Aggregate of every page fetched for one window, in page then in-page order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScrapeResult {
    pub opportunities: Vec<Opportunity>,
    /// `totalRecords` as reported by the first page.
    pub reported_total: u64,
    pub pages_fetched: usize,
    /// Set when a later page reported a different `totalRecords` than the first.
    pub drift: bool,
}

impl ScrapeResult {
    pub fn len(&self) -> usize {
        self.opportunities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.opportunities.len() as u64 == self.reported_total
    }

    pub fn into_opportunities(self) -> Vec<Opportunity> {
        self.opportunities
    }
}
