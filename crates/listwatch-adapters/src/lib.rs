//! Listing source + notification sink contracts and their marketplace/Telegram implementations.

use async_trait::async_trait;
use listwatch_core::{Listing, SavedSearch};
use listwatch_storage::{FetchError, FetchedResponse, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "listwatch-adapters";

pub const LISTING_SEARCH_QUERY: &str = include_str!("listing_search.graphql");

pub const DEFAULT_PAGE_LIMIT: u32 = 40;

const MAX_DESCRIPTION_CHARS: usize = 600;

/// Fetches one page of listings for a saved search.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, search: &SavedSearch) -> Result<Vec<Listing>, FetchError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("notification endpoint returned status {0}")]
    Status(u16),
    #[error("notification request failed: {0}")]
    Request(String),
    #[error("decoding notification reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl From<FetchError> for DeliveryError {
    // The bot token lives in the request URL, so it is stripped before the
    // error can reach a log line.
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport { status, .. } => DeliveryError::Status(status),
            FetchError::Request(err) => DeliveryError::Request(err.without_url().to_string()),
            FetchError::Decode { source, .. } => DeliveryError::Decode(source),
        }
    }
}

/// Delivers messages to the operator's channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, listing: &Listing) -> Result<(), DeliveryError>;

    async fn deliver_text(&self, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchParameter {
    pub key: String,
    pub value: String,
}

impl SearchParameter {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingSearchVariables {
    pub search_parameters: Vec<SearchParameter>,
    pub fetch_job_summary: bool,
    pub fetch_pay_and_ship: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingSearchRequest {
    pub query: &'static str,
    pub variables: ListingSearchVariables,
}

pub fn build_search_parameters(search: &SavedSearch, page_limit: u32) -> Vec<SearchParameter> {
    let mut params = vec![
        SearchParameter::new("offset", "0"),
        SearchParameter::new("limit", page_limit.to_string()),
        SearchParameter::new("query", search.search_term.clone()),
        SearchParameter::new("sort_by", "created_at:desc"),
    ];

    if let Some(min) = search.min_price {
        params.push(SearchParameter::new("filter_float_price:from", min.to_string()));
    }
    if let Some(max) = search.max_price {
        params.push(SearchParameter::new("filter_float_price:to", max.to_string()));
    }
    for (idx, tag) in search.condition.tags().iter().enumerate() {
        params.push(SearchParameter::new(format!("filter_enum_state[{idx}]"), tag.clone()));
    }

    params
}

pub fn build_request_body(search: &SavedSearch, page_limit: u32) -> ListingSearchRequest {
    ListingSearchRequest {
        query: LISTING_SEARCH_QUERY,
        variables: ListingSearchVariables {
            search_parameters: build_search_parameters(search, page_limit),
            fetch_job_summary: false,
            fetch_pay_and_ship: false,
        },
    }
}

#[derive(Debug, Deserialize)]
struct ListingSearchResponse {
    #[serde(default)]
    data: Option<ListingSearchData>,
}

#[derive(Debug, Deserialize)]
struct ListingSearchData {
    #[serde(rename = "clientCompatibleListings", default)]
    client_compatible_listings: Option<ListingsPayload>,
}

#[derive(Debug, Deserialize)]
struct ListingsPayload {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

/// Pull the listing array out of a search response. Anything that is not an
/// array, including an error payload, yields an empty page.
pub fn extract_listings(response: &FetchedResponse) -> Result<Vec<Listing>, FetchError> {
    let decoded: ListingSearchResponse = HttpFetcher::decode(response)?;
    let Some(payload) = decoded.data.and_then(|d| d.client_compatible_listings) else {
        return Ok(Vec::new());
    };

    if let Some(error) = &payload.error {
        warn!(%error, "listing source answered with an error payload");
    }

    match payload.data {
        Some(items @ JsonValue::Array(_)) => {
            serde_json::from_value(items).map_err(|source| FetchError::Decode {
                url: response.final_url.clone(),
                source,
            })
        }
        _ => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone)]
pub struct MarketplaceListingSource {
    http: HttpFetcher,
    endpoint: String,
    origin: String,
    page_limit: u32,
}

impl MarketplaceListingSource {
    pub fn new(
        http: HttpFetcher,
        endpoint: impl Into<String>,
        origin: impl Into<String>,
        page_limit: u32,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            origin: origin.into(),
            page_limit: page_limit.max(1),
        }
    }
}

#[async_trait]
impl ListingSource for MarketplaceListingSource {
    fn source_id(&self) -> &'static str {
        "olx-graphql"
    }

    async fn fetch(&self, search: &SavedSearch) -> Result<Vec<Listing>, FetchError> {
        let body = build_request_body(search, self.page_limit);
        let response = self
            .http
            .post_json(
                self.source_id(),
                &self.endpoint,
                &[("Origin", self.origin.as_str())],
                &body,
            )
            .await?;
        let listings = extract_listings(&response)?;
        debug!(alias = %search.alias, count = listings.len(), "fetched listing page");
        Ok(listings)
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &input[..cut]),
        None => input.to_string(),
    }
}

/// HTML body for a single listing notification.
pub fn format_listing_message(listing: &Listing) -> String {
    let photo = listing.first_photo_link().unwrap_or_default();
    let price = listing
        .price_eur()
        .map(|eur| format!("{eur:.2} EUR"))
        .unwrap_or_else(|| "N/A".to_string());
    let description = truncate_chars(listing.description.trim(), MAX_DESCRIPTION_CHARS);

    format!(
        "<a href='{}'> </a> \n<b>TITLE:</b> {} \n<b>PRICE:</b> {} \n<b>DESC:</b> {} \n<b>LOCATION:</b> {} \n<b>LINK:</b> <a href='{}'>CLICK</a>",
        escape_html(photo),
        escape_html(&listing.title),
        price,
        escape_html(&description),
        escape_html(&listing.location_summary().display()),
        escape_html(&listing.url),
    )
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramSink {
    http: HttpFetcher,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(
        http: HttpFetcher,
        api_base: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            token: token.into(),
            chat_id: chat_id.into(),
        }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }

    async fn send(&self, text: &str, parse_mode: Option<&str>) -> Result<(), DeliveryError> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode,
        };
        let response = self
            .http
            .post_json("telegram", &self.send_message_url(), &[], &body)
            .await?;
        let reply: TelegramReply = serde_json::from_slice(&response.body)?;
        if !reply.ok {
            return Err(DeliveryError::Rejected(
                reply.description.unwrap_or_else(|| "unknown reason".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, listing: &Listing) -> Result<(), DeliveryError> {
        self.send(&format_listing_message(listing), Some("HTML")).await
    }

    async fn deliver_text(&self, text: &str) -> Result<(), DeliveryError> {
        self.send(text, None).await
    }
}
