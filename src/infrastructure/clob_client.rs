//! CLOB HTTP client
//!
//! Public market-data endpoints need no authentication. Trading endpoints carry
//! the L2 headers: an HMAC-SHA256 over `timestamp + method + path + body`,
//! keyed with the url-safe base64 API secret.

use base64::{engine::general_purpose, Engine as _};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::domain::repositories::broker_adapter::{BrokerError, BrokerResult};
use crate::infrastructure::order_signing::{OrderSigner, SignedOrder};

type HmacSha256 = Hmac<Sha256>;

pub type ClobRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(requests_per_second: u32) -> ClobRateLimiter {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
}

/// L2 API credentials
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub api_passphrase: Zeroizing<String>,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

// ---- wire types -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MidpointResponse {
    mid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookResponse {
    #[serde(default)]
    pub bids: Vec<BookEntry>,
    #[serde(default)]
    pub asks: Vec<BookEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostOrderRequest<'a> {
    order: &'a SignedOrder,
    owner: &'a str,
    order_type: &'a str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostOrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "orderID", default)]
    pub order_id: Option<String>,
    #[serde(rename = "errorMsg", default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOrderResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub size_matched: Option<String>,
    #[serde(default)]
    pub original_size: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    #[serde(rename = "orderID")]
    order_id: &'a str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelResponse {
    #[serde(default)]
    pub canceled: Vec<String>,
    #[serde(default)]
    pub not_canceled: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceAllowanceResponse {
    pub balance: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
}

/// Asset queried by `/balance-allowance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetType {
    Collateral,
    Conditional,
}

impl AssetType {
    fn as_str(&self) -> &'static str {
        match self {
            AssetType::Collateral => "COLLATERAL",
            AssetType::Conditional => "CONDITIONAL",
        }
    }
}

pub fn parse_decimal(raw: &str, field: &str) -> BrokerResult<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| BrokerError::Malformed(format!("{} is not a number: {:?}", field, raw)))
}

// ---- client ---------------------------------------------------------------

struct TradingAuth {
    signer: OrderSigner,
    credentials: ApiCredentials,
}

pub struct ClobClient {
    host: String,
    http: Client,
    limiter: ClobRateLimiter,
    auth: Option<TradingAuth>,
}

impl ClobClient {
    /// Client for public market data only
    pub fn public(host: &str, limiter: ClobRateLimiter) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            limiter,
            auth: None,
        }
    }

    /// Client that can also sign and manage orders
    pub fn authenticated(
        host: &str,
        limiter: ClobRateLimiter,
        signer: OrderSigner,
        credentials: ApiCredentials,
    ) -> Self {
        let mut client = Self::public(host, limiter);
        client.auth = Some(TradingAuth {
            signer,
            credentials,
        });
        client
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn auth(&self) -> BrokerResult<&TradingAuth> {
        self.auth.as_ref().ok_or_else(|| {
            BrokerError::Authentication("trading endpoints need API credentials".to_string())
        })
    }

    pub fn signer(&self) -> BrokerResult<&OrderSigner> {
        Ok(&self.auth()?.signer)
    }

    /// L2 headers for one request
    fn l2_headers(&self, method: &Method, path: &str, body: &str) -> BrokerResult<Vec<(&'static str, String)>> {
        let auth = self.auth()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| BrokerError::Authentication(format!("clock error: {}", e)))?
            .as_secs();

        let signature = sign_l2(
            &auth.credentials.api_secret,
            timestamp,
            method.as_str(),
            path,
            body,
        )?;

        Ok(vec![
            ("POLY_ADDRESS", format!("{:?}", auth.signer.address())),
            ("POLY_SIGNATURE", signature),
            ("POLY_TIMESTAMP", timestamp.to_string()),
            ("POLY_API_KEY", auth.credentials.api_key.clone()),
            ("POLY_PASSPHRASE", auth.credentials.api_passphrase.to_string()),
        ])
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
        authenticated: bool,
    ) -> BrokerResult<T> {
        self.limiter.until_ready().await;

        let url = format!("{}{}", self.host, path);
        let mut request = self.http.request(method.clone(), &url).query(query);

        if authenticated {
            let headers = self.l2_headers(&method, path, body.as_deref().unwrap_or(""))?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Network(format!("{} {}: {}", method, path, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Network(format!("reading {} response: {}", path, e)))?;

        if !status.is_success() {
            return Err(classify_http_error(status, path, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            BrokerError::Malformed(format!("{} response: {} - {}", path, e, text))
        })
    }

    // ---- public market data ----

    /// Midpoint price, falling back to the best buy price
    pub async fn price(&self, token_id: &str) -> BrokerResult<f64> {
        let query = [("token_id", token_id.to_string())];
        match self
            .send::<MidpointResponse>(Method::GET, "/midpoint", &query, None, false)
            .await
        {
            Ok(MidpointResponse { mid: Some(mid) }) => return parse_decimal(&mid, "mid"),
            Ok(_) => debug!("No midpoint for {}, trying /price", token_id),
            Err(e) => debug!("Midpoint for {} unavailable: {}", token_id, e),
        }

        let query = [
            ("token_id", token_id.to_string()),
            ("side", "buy".to_string()),
        ];
        let response: PriceResponse = self
            .send(Method::GET, "/price", &query, None, false)
            .await?;
        match response.price {
            Some(price) => parse_decimal(&price, "price"),
            None => Err(BrokerError::Malformed(format!("no price for {}", token_id))),
        }
    }

    pub async fn order_book(&self, token_id: &str) -> BrokerResult<OrderBookResponse> {
        let query = [("token_id", token_id.to_string())];
        self.send(Method::GET, "/book", &query, None, false).await
    }

    // ---- trading ----

    pub async fn post_order(&self, order: &SignedOrder, order_type: &str) -> BrokerResult<PostOrderResponse> {
        let auth = self.auth()?;
        let body = serde_json::to_string(&PostOrderRequest {
            order,
            owner: &auth.credentials.api_key,
            order_type,
        })
        .map_err(|e| BrokerError::InvalidOrder(format!("encoding order: {}", e)))?;

        self.send(Method::POST, "/order", &[], Some(body), true).await
    }

    pub async fn get_order(&self, order_id: &str) -> BrokerResult<OpenOrderResponse> {
        let path = format!("/data/order/{}", order_id);
        let response: Option<OpenOrderResponse> =
            self.send(Method::GET, &path, &[], None, true).await?;
        response.ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
    }

    pub async fn cancel(&self, order_id: &str) -> BrokerResult<CancelResponse> {
        let body = serde_json::to_string(&CancelRequest { order_id })
            .map_err(|e| BrokerError::InvalidOrder(format!("encoding cancel: {}", e)))?;
        self.send(Method::DELETE, "/order", &[], Some(body), true)
            .await
    }

    pub async fn cancel_all(&self) -> BrokerResult<CancelResponse> {
        self.send(Method::DELETE, "/cancel-all", &[], None, true)
            .await
    }

    /// Balance in whole units (USDC or shares)
    pub async fn balance(&self, asset: AssetType, token_id: Option<&str>) -> BrokerResult<f64> {
        let mut query = vec![("asset_type", asset.as_str().to_string())];
        if let Some(token_id) = token_id {
            query.push(("token_id", token_id.to_string()));
        }
        let response: BalanceAllowanceResponse = self
            .send(Method::GET, "/balance-allowance", &query, None, true)
            .await?;
        Ok(parse_decimal(&response.balance, "balance")? / 1_000_000.0)
    }
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("host", &self.host)
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

pub fn sign_l2(secret: &str, timestamp: u64, method: &str, path: &str, body: &str) -> BrokerResult<String> {
    let key = general_purpose::URL_SAFE
        .decode(secret.trim())
        .map_err(|e| BrokerError::Authentication(format!("API secret is not base64: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| BrokerError::Authentication(format!("HMAC error: {}", e)))?;
    mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());

    Ok(general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}

fn classify_http_error(status: StatusCode, path: &str, body: &str) -> BrokerError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.error.or(e.error_msg))
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BrokerError::Authentication(format!("{}: {}", path, message))
        }
        StatusCode::NOT_FOUND => BrokerError::NotFound(format!("{}: {}", path, message)),
        StatusCode::TOO_MANY_REQUESTS => {
            warn!("CLOB rate limit hit on {}", path);
            BrokerError::Network(format!("rate limited: {}", message))
        }
        s if s.is_server_error() => BrokerError::Network(format!("HTTP {}: {}", s, message)),
        _ if message.to_lowercase().contains("not enough balance") => {
            BrokerError::InsufficientBalance {
                required: 0.0,
                available: 0.0,
            }
        }
        s => BrokerError::Rejected(format!("HTTP {}: {}", s, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_signature_is_stable() {
        let secret = general_purpose::URL_SAFE.encode(b"super-secret-key");
        let a = sign_l2(&secret, 1_700_000_000, "POST", "/order", "{}").unwrap();
        let b = sign_l2(&secret, 1_700_000_000, "POST", "/order", "{}").unwrap();
        let c = sign_l2(&secret, 1_700_000_001, "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.contains('+') && !a.contains('/'));
    }

    #[test]
    fn test_l2_rejects_bad_secret() {
        assert!(matches!(
            sign_l2("not base64 !!", 1, "GET", "/", ""),
            Err(BrokerError::Authentication(_))
        ));
    }

    #[test]
    fn test_http_error_classification() {
        assert!(matches!(
            classify_http_error(StatusCode::UNAUTHORIZED, "/order", "{}"),
            BrokerError::Authentication(_)
        ));
        assert!(matches!(
            classify_http_error(StatusCode::NOT_FOUND, "/data/order/x", ""),
            BrokerError::NotFound(_)
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_GATEWAY, "/book", ""),
            BrokerError::Network(_)
        ));
        assert!(matches!(
            classify_http_error(
                StatusCode::BAD_REQUEST,
                "/order",
                r#"{"error":"not enough balance / allowance"}"#
            ),
            BrokerError::InsufficientBalance { .. }
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_REQUEST, "/order", r#"{"error":"invalid tick"}"#),
            BrokerError::Rejected(_)
        ));
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("0.55", "mid").unwrap(), 0.55);
        assert!(parse_decimal("abc", "mid").is_err());
        assert!(parse_decimal("NaN", "mid").is_err());
    }

    #[test]
    fn test_public_client_refuses_trading() {
        let client = ClobClient::public("http://localhost:1/", create_rate_limiter(10));
        assert_eq!(client.host(), "http://localhost:1");
        assert!(matches!(client.signer(), Err(BrokerError::Authentication(_))));
    }
}
