//! Saved-search persistence + single-attempt HTTP utilities for listwatch.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use listwatch_core::{ConditionFilter, Listing, SavedSearch, Watermark};
pub use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "listwatch-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    Transport { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Status code of a non-success response, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transport { status, .. } => Some(*status),
            FetchError::Request(_) | FetchError::Decode { .. } => None,
        }
    }
}

/// Thin reqwest wrapper. One attempt per call; recovery is left to the next run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn post_json<B>(
        &self,
        label: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("http_post", target = label);
        self.send_post(url, headers, body).instrument(span).await
    }

    async fn send_post<B>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::Transport {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub fn decode<T: DeserializeOwned>(response: &FetchedResponse) -> Result<T, FetchError> {
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding watermark: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("saved search {0} not found")]
    NotFound(String),
}

/// Read side of the saved-search table. Only active searches are ever polled.
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn active_searches(&self) -> Result<Vec<SavedSearch>, PersistenceError>;
}

/// Write side: records the listing a search was last anchored on.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn persist(&self, search_id: &str, listing: &Listing) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SavedSearchRow {
    pub search_id: String,
    pub alias: String,
    pub active: bool,
    pub search_term: String,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub conditions: Vec<String>,
    pub newest_offer: Option<JsonValue>,
}

impl SavedSearchRow {
    /// An undecodable watermark is dropped rather than failing the read; the
    /// search then resyncs like a first run.
    pub fn into_saved_search(self) -> SavedSearch {
        let watermark = self.newest_offer.and_then(|value| {
            serde_json::from_value::<Watermark>(value)
                .map_err(|err| {
                    warn!(search_id = %self.search_id, error = %err, "discarding undecodable watermark");
                })
                .ok()
        });

        SavedSearch {
            search_id: self.search_id,
            alias: self.alias,
            active: self.active,
            search_term: self.search_term,
            min_price: self.min_price,
            max_price: self.max_price,
            condition: ConditionFilter::from_tags(&self.conditions),
            watermark,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSearchStore {
    pool: PgPool,
}

impl PgSearchStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to saved-search database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running saved-search migrations")
    }
}

#[async_trait]
impl SearchSource for PgSearchStore {
    async fn active_searches(&self) -> Result<Vec<SavedSearch>, PersistenceError> {
        let rows = sqlx::query_as::<_, SavedSearchRow>(
            r#"
            SELECT search_id, alias, active, search_term, min_price, max_price,
                   conditions, newest_offer
            FROM saved_searches
            WHERE active = TRUE
            ORDER BY alias, search_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SavedSearchRow::into_saved_search).collect())
    }
}

#[async_trait]
impl WatermarkStore for PgSearchStore {
    async fn persist(&self, search_id: &str, listing: &Listing) -> Result<(), PersistenceError> {
        let snapshot = serde_json::to_value(Watermark::from_listing(listing))?;
        let result = sqlx::query(
            "UPDATE saved_searches SET newest_offer = $2, updated_at = now() WHERE search_id = $1",
        )
        .bind(search_id)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(search_id.to_string()));
        }
        Ok(())
    }
}
