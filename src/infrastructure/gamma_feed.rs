//! Market discovery through the Gamma markets API
//!
//! Five-minute windows are listed under a slug of the form
//! `<prefix>-<window start unix seconds>`, with window starts aligned to the
//! window length. A pinned market id bypasses the slug lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::entities::market_window::{MarketWindow, OutcomeToken};
use crate::domain::repositories::clock::Clock;
use crate::domain::repositories::market_feed::{FeedError, MarketFeed};

/// Market as listed by Gamma. List-valued fields arrive as JSON-encoded strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    pub id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub outcomes: Option<String>,
    #[serde(default)]
    pub clob_token_ids: Option<String>,
    #[serde(default)]
    pub outcome_prices: Option<String>,
    #[serde(default)]
    pub closed: bool,
}

pub struct GammaMarketFeed {
    host: String,
    http: Client,
    slug_prefix: String,
    window_secs: i64,
    clock: Arc<dyn Clock>,
}

impl GammaMarketFeed {
    pub fn new(host: &str, slug_prefix: &str, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            slug_prefix: slug_prefix.to_string(),
            window_secs: window_secs.max(1) as i64,
            clock,
        }
    }

    /// Slug of the window containing `now`
    pub fn slug_at(&self, now: DateTime<Utc>) -> String {
        let ts = now.timestamp();
        format!("{}-{}", self.slug_prefix, ts - ts.rem_euclid(self.window_secs))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, FeedError> {
        let url = format!("{}{}", self.host, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| FeedError::Network(format!("GET {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| FeedError::Network(format!("reading {}: {}", path, e)))?;
        if !status.is_success() {
            return Err(FeedError::Network(format!("HTTP {} on {}: {}", status, path, text)));
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FeedError::Malformed(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl MarketFeed for GammaMarketFeed {
    async fn current_window(&self, pinned: Option<&str>) -> Result<Option<MarketWindow>, FeedError> {
        let market = match pinned {
            Some(id) => {
                let path = format!("/markets/{}", id);
                self.get_json::<GammaMarket>(&path, &[]).await?
            }
            None => {
                let slug = self.slug_at(self.clock.now());
                debug!("Looking up market {}", slug);
                self.get_json::<Vec<GammaMarket>>("/markets", &[("slug", slug)])
                    .await?
                    .and_then(|markets| markets.into_iter().next())
            }
        };

        match market {
            Some(market) if market.closed => {
                debug!("Market {} is closed", market.id);
                Ok(None)
            }
            Some(market) => window_from_market(market).map(Some),
            None => Ok(None),
        }
    }
}

fn decode_list(raw: Option<&str>, field: &str, market: &str) -> Result<Vec<String>, FeedError> {
    let raw = raw.ok_or_else(|| FeedError::Malformed(format!("market {} has no {}", market, field)))?;
    serde_json::from_str(raw)
        .map_err(|e| FeedError::Malformed(format!("market {} {}: {}", market, field, e)))
}

/// Map a Gamma listing onto a window: Up/Yes is token A, Down/No is token B
pub fn window_from_market(market: GammaMarket) -> Result<MarketWindow, FeedError> {
    let outcomes = decode_list(market.outcomes.as_deref(), "outcomes", &market.id)?;
    let token_ids = decode_list(market.clob_token_ids.as_deref(), "clobTokenIds", &market.id)?;
    if outcomes.len() != token_ids.len() {
        return Err(FeedError::Malformed(format!(
            "market {} lists {} outcomes for {} tokens",
            market.id,
            outcomes.len(),
            token_ids.len()
        )));
    }
    let prices = match market.outcome_prices.as_deref() {
        Some(raw) => decode_list(Some(raw), "outcomePrices", &market.id).unwrap_or_else(|e| {
            warn!("{}", e);
            Vec::new()
        }),
        None => Vec::new(),
    };

    let mut token_a = None;
    let mut token_b = None;
    for (i, (outcome, token_id)) in outcomes.iter().zip(&token_ids).enumerate() {
        let mut token = OutcomeToken::new(token_id.clone(), outcome.clone());
        token.listed_price = prices.get(i).and_then(|p| p.parse::<f64>().ok());
        match outcome.to_lowercase().as_str() {
            "up" | "yes" => token_a = Some(token),
            "down" | "no" => token_b = Some(token),
            other => debug!("Ignoring outcome {:?} on market {}", other, market.id),
        }
    }

    let (token_a, token_b) = match (token_a, token_b) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(FeedError::Malformed(format!(
                "market {} does not list both Up/Down tokens: {:?}",
                market.id, outcomes
            )))
        }
    };

    let end_date = market
        .end_date
        .as_deref()
        .ok_or_else(|| FeedError::Malformed(format!("market {} has no endDate", market.id)))?;
    let close_time = DateTime::parse_from_rfc3339(end_date)
        .map_err(|e| FeedError::Malformed(format!("market {} endDate {:?}: {}", market.id, end_date, e)))?
        .with_timezone(&Utc);

    let window = MarketWindow::new(market.id, market.question, close_time, token_a, token_b)
        .map_err(|e| FeedError::Malformed(e.to_string()))?;
    Ok(match market.slug {
        Some(slug) => window.with_slug(slug),
        None => window,
    })
}
