//! Block explorer endpoints for fetching the current chain tip.

use crate::config::{EndpointKind, EndpointSpec};
use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Tip of a chain as reported by one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TipObservation {
    pub height: u64,
    pub hash: String,
    pub observed_at: Option<DateTime<Utc>>,
}

/// One redundant source of the current block for a chain.
#[async_trait]
pub trait ChainEndpoint: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Fetch the current tip. The cache bounds this with its own timeout.
    async fn fetch_tip(&self) -> Result<TipObservation, SourceError>;
}

/// Normalize and validate a reported tip.
///
/// A tip is well formed when its height is positive and its hash is 64 hex
/// digits; a `0x` prefix is stripped and the hash is lower-cased.
pub fn validate_tip(tip: TipObservation) -> Result<TipObservation, SourceError> {
    if tip.height == 0 {
        return Err(SourceError::Parse("block height is zero".to_string()));
    }

    let hash = tip.hash.trim();
    let hash = hash
        .strip_prefix("0x")
        .or_else(|| hash.strip_prefix("0X"))
        .unwrap_or(hash)
        .to_ascii_lowercase();

    if hash.len() != 64 || hex::decode(&hash).is_err() {
        return Err(SourceError::Parse(format!(
            "malformed block hash '{}'",
            tip.hash
        )));
    }

    Ok(TipObservation { hash, ..tip })
}

fn unix_time(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Parse an Esplora `/block/{hash}` body into height and block time.
pub fn parse_esplora_block(body: &Value) -> Result<(u64, Option<DateTime<Utc>>), SourceError> {
    let height = body
        .get("height")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SourceError::Parse("missing height".to_string()))?;
    let observed_at = body
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .and_then(unix_time);
    Ok((height, observed_at))
}

/// Parse a BlockCypher chain summary.
pub fn parse_blockcypher(body: &Value) -> Result<TipObservation, SourceError> {
    let height = body
        .get("height")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SourceError::Parse("missing height".to_string()))?;
    let hash = body
        .get("hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SourceError::Parse("missing hash".to_string()))?
        .to_string();
    let observed_at = body
        .get("time")
        .and_then(|v| v.as_str())
        .and_then(|t| crate::models::parse_timestamp(t).ok());

    Ok(TipObservation {
        height,
        hash,
        observed_at,
    })
}

async fn get_checked(
    client: &reqwest::Client,
    url: &str,
) -> Result<reqwest::Response, SourceError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(SourceError::Status(response.status().as_u16()));
    }
    Ok(response)
}

/// Esplora-style explorer (blockstream.info, mempool.space, litecoinspace.org).
pub struct EsploraEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl EsploraEndpoint {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ChainEndpoint for EsploraEndpoint {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn fetch_tip(&self) -> Result<TipObservation, SourceError> {
        let tip_url = format!("{}/blocks/tip/hash", self.base_url);
        let hash = get_checked(&self.client, &tip_url)
            .await?
            .text()
            .await?
            .trim()
            .to_string();

        let block_url = format!("{}/block/{}", self.base_url, hash);
        let body: Value = get_checked(&self.client, &block_url).await?.json().await?;
        let (height, observed_at) = parse_esplora_block(&body)?;

        Ok(TipObservation {
            height,
            hash,
            observed_at,
        })
    }
}

/// BlockCypher chain summary endpoint.
pub struct BlockCypherEndpoint {
    url: String,
    client: reqwest::Client,
}

impl BlockCypherEndpoint {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl ChainEndpoint for BlockCypherEndpoint {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch_tip(&self) -> Result<TipObservation, SourceError> {
        let body: Value = get_checked(&self.client, &self.url).await?.json().await?;
        parse_blockcypher(&body)
    }
}

/// Instantiate the adapter for a configured endpoint.
pub fn build_endpoint(spec: &EndpointSpec, client: &reqwest::Client) -> Arc<dyn ChainEndpoint> {
    match spec.kind {
        EndpointKind::Esplora => Arc::new(EsploraEndpoint::new(spec.url.clone(), client.clone())),
        EndpointKind::BlockCypher => {
            Arc::new(BlockCypherEndpoint::new(spec.url.clone(), client.clone()))
        }
    }
}
