use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::error::ApiError;
use crate::model::{Collection, Raindrop};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where Raindrops come from. The sync driver only ever reads through this.
#[async_trait]
pub trait RaindropSource: Send + Sync {
    async fn get_collection(&self, collection_id: i64) -> Result<Collection, ApiError>;

    /// One page of Raindrops, highlights included. Pages are zero-based.
    async fn list_items(
        &self,
        collection_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Raindrop>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    item: Collection,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<Raindrop>,
}

#[derive(Debug, Clone)]
pub struct RaindropClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl RaindropClient {
    pub fn new(cfg: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            access_token: cfg.access_token.clone(),
        })
    }

    fn collection_url(&self, collection_id: i64) -> String {
        format!("{}/collection/{}", self.base_url, collection_id)
    }

    fn items_url(&self, collection_id: i64, page: u32, page_size: u32) -> String {
        format!(
            "{}/raindrops/{}?page={}&perpage={}",
            self.base_url, collection_id, page, page_size
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, ApiError> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { url, status });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode { url, source })
    }
}

#[async_trait]
impl RaindropSource for RaindropClient {
    async fn get_collection(&self, collection_id: i64) -> Result<Collection, ApiError> {
        let response: CollectionResponse = self.get_json(self.collection_url(collection_id)).await?;
        Ok(response.item)
    }

    async fn list_items(
        &self,
        collection_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Raindrop>, ApiError> {
        let response: ItemsResponse = self
            .get_json(self.items_url(collection_id, page, page_size))
            .await?;
        tracing::debug!(
            collection_id,
            page,
            count = response.items.len(),
            "fetched raindrops page"
        );
        Ok(response.items)
    }
}
