//! Bitunix Futures REST API Client
//!
//! Provides REST API integration for:
//! - Listing open positions and resting orders
//! - Placing plain orders and position TP/SL orders
//! - Batch cancellation and leverage changes
//!
//! # Authentication
//!
//! Every request carries `api-key`, `nonce`, `timestamp` and `sign` headers.
//! The signature is a double SHA-256:
//!
//! ```text
//! digest = sha256(nonce + timestamp + api_key + sorted_query + body)
//! sign   = sha256(digest + api_secret)
//! ```
//!
//! `sorted_query` is every query parameter as `keyvalue`, sorted by key and
//! concatenated without separators.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use rung_domain::{LivePosition, OrderSide, PendingOrder, Price, Symbol};
use rung_exec::{
    CancelOutcome, ExchangePort, ExecError, ExecResult, OrderAck, OrderKind, OrderRequest,
    TpSlRequest,
};

// =============================================================================
// Constants
// =============================================================================

/// Bitunix futures REST base URL
const BITUNIX_API_URL: &str = "https://fapi.bitunix.com";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 15;

const POSITIONS_PATH: &str = "/api/v1/futures/position/get_pending_positions";
const PENDING_ORDERS_PATH: &str = "/api/v1/futures/trade/get_pending_orders";
const PLACE_ORDER_PATH: &str = "/api/v1/futures/trade/place_order";
const TPSL_ORDER_PATH: &str = "/api/v1/futures/tpsl/place_order";
const CANCEL_ORDERS_PATH: &str = "/api/v1/futures/trade/cancel_orders";
const CHANGE_LEVERAGE_PATH: &str = "/api/v1/futures/account/change_leverage";

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the Bitunix REST client.
#[derive(Debug, Clone, Error)]
pub enum BitunixRestError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// API answered with a non-zero code
    #[error("Bitunix API error: {code} - {msg}")]
    ApiError { code: i64, msg: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,
}

impl From<BitunixRestError> for ExecError {
    fn from(err: BitunixRestError) -> Self {
        match err {
            BitunixRestError::ApiError { code, msg } => ExecError::rejected(format!("{msg} (code {code})")),
            BitunixRestError::RequestFailed(msg) => ExecError::Exchange(msg),
            BitunixRestError::ParseError(msg) => ExecError::InvalidResponse(msg),
            BitunixRestError::Timeout => ExecError::Timeout(format!(
                "Bitunix did not answer within {REQUEST_TIMEOUT_SECS}s"
            )),
        }
    }
}

// =============================================================================
// Signing
// =============================================================================

/// Compute the request signature.
fn sign(nonce: &str, timestamp: &str, api_key: &str, query: &str, body: &str, secret: &str) -> String {
    let digest = hex::encode(Sha256::digest(
        format!("{nonce}{timestamp}{api_key}{query}{body}").as_bytes(),
    ));
    hex::encode(Sha256::digest(format!("{digest}{secret}").as_bytes()))
}

/// Query parameters in signing form: sorted by key, `keyvalue` concatenated.
fn signing_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted.iter().map(|(k, v)| format!("{k}{v}")).collect()
}

/// 16 random bytes, hex encoded.
fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Decimal in the plain string form the API expects.
fn decimal_str(value: Decimal) -> String {
    value.normalize().to_string()
}

// =============================================================================
// Bitunix REST Client
// =============================================================================

/// Bitunix futures REST client.
pub struct BitunixRestClient {
    client: Client,
    api_key: String,
    api_secret: Zeroizing<String>,
    base_url: String,
}

impl BitunixRestClient {
    /// Create a client against the production endpoint.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, api_secret, BITUNIX_API_URL)
    }

    /// Create a client against another endpoint (proxies, mocks).
    pub fn with_base_url(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_secret: Zeroizing::new(api_secret.into()),
            base_url: base_url.into(),
        }
    }

    fn headers(&self, query: &str, body: &str) -> Vec<(&'static str, String)> {
        let nonce = new_nonce();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign(&nonce, &timestamp, &self.api_key, query, body, &self.api_secret);
        vec![
            ("api-key", self.api_key.clone()),
            ("nonce", nonce),
            ("timestamp", timestamp),
            ("sign", signature),
            ("language", "en-US".to_string()),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    /// Send a signed GET and return the envelope's `data`.
    async fn get_signed(&self, endpoint: &str, params: Vec<(&str, String)>) -> Result<Value, BitunixRestError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.get(&url).query(&params);
        for (name, value) in self.headers(&signing_query(&params), "") {
            request = request.header(name, value);
        }
        self.execute(request).await
    }

    /// Send a signed POST with a JSON body and return the envelope's `data`.
    async fn post_signed(&self, endpoint: &str, body: &Value) -> Result<Value, BitunixRestError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let body = body.to_string();
        let mut request = self.client.post(&url);
        for (name, value) in self.headers("", &body) {
            request = request.header(name, value);
        }
        self.execute(request.body(body)).await
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value, BitunixRestError> {
        let response = timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send())
            .await
            .map_err(|_| BitunixRestError::Timeout)?
            .map_err(|e| BitunixRestError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| BitunixRestError::ParseError(e.to_string()))?;

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(BitunixRestError::RequestFailed(format!("HTTP {}: {}", status, body)));
            },
            Err(e) => return Err(BitunixRestError::ParseError(e.to_string())),
        };
        envelope.into_data()
    }

    // =========================================================================
    // Account state
    // =========================================================================

    /// Get all open positions.
    ///
    /// # Endpoint
    ///
    /// `GET /api/v1/futures/position/get_pending_positions`
    pub async fn get_pending_positions(&self) -> Result<Vec<LivePosition>, BitunixRestError> {
        let data = self.get_signed(POSITIONS_PATH, vec![]).await?;
        Ok(parse_list(data, "positionList"))
    }

    /// Get resting orders, optionally for one symbol.
    ///
    /// # Endpoint
    ///
    /// `GET /api/v1/futures/trade/get_pending_orders`
    pub async fn get_pending_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<PendingOrder>, BitunixRestError> {
        let params = symbol.map(|s| vec![("symbol", s.as_pair())]).unwrap_or_default();
        let data = self.get_signed(PENDING_ORDERS_PATH, params).await?;
        Ok(parse_list(data, "orderList"))
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Place a plain order.
    ///
    /// # Endpoint
    ///
    /// `POST /api/v1/futures/trade/place_order`
    pub async fn place_order_raw(&self, request: &OrderRequest) -> Result<OrderAck, BitunixRestError> {
        let body = order_body(request);
        debug!(symbol = %request.symbol, side = %request.side, "Placing order");
        let data = self.post_signed(PLACE_ORDER_PATH, &body).await?;
        parse_ack(&data)
    }

    /// Attach a TP and/or SL order to an exchange position.
    ///
    /// # Endpoint
    ///
    /// `POST /api/v1/futures/tpsl/place_order`
    pub async fn place_tpsl_raw(&self, request: &TpSlRequest) -> Result<OrderAck, BitunixRestError> {
        let body = tpsl_body(request);
        debug!(symbol = %request.symbol, position_id = %request.position_id, "Placing TP/SL order");
        let data = self.post_signed(TPSL_ORDER_PATH, &body).await?;
        parse_ack(&data)
    }

    /// Cancel a batch of orders on one symbol.
    ///
    /// # Endpoint
    ///
    /// `POST /api/v1/futures/trade/cancel_orders`
    pub async fn cancel_orders_raw(&self, symbol: &Symbol, order_ids: &[String]) -> Result<CancelOutcome, BitunixRestError> {
        if order_ids.is_empty() {
            return Ok(CancelOutcome::default());
        }
        let body = json!({
            "symbol": symbol.as_pair(),
            "orderList": order_ids.iter().map(|id| json!({ "orderId": id })).collect::<Vec<_>>(),
        });
        let data = self.post_signed(CANCEL_ORDERS_PATH, &body).await?;
        let result: CancelResult =
            serde_json::from_value(data).map_err(|e| BitunixRestError::ParseError(e.to_string()))?;

        if !result.failure_list.is_empty() {
            warn!(%symbol, failed = result.failure_list.len(), "Some cancels were refused");
        }
        Ok(CancelOutcome {
            succeeded: result.success_list.into_iter().filter_map(CancelEntry::into_id).collect(),
            failed: result.failure_list.into_iter().filter_map(CancelEntry::into_id).collect(),
        })
    }

    /// Change leverage for a symbol.
    ///
    /// # Endpoint
    ///
    /// `POST /api/v1/futures/account/change_leverage`
    pub async fn change_leverage_raw(&self, symbol: &Symbol, leverage: u32) -> Result<(), BitunixRestError> {
        let body = json!({
            "symbol": symbol.as_pair(),
            "leverage": leverage,
            "marginCoin": margin_coin(symbol),
        });
        self.post_signed(CHANGE_LEVERAGE_PATH, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl ExchangePort for BitunixRestClient {
    async fn list_open_positions(&self) -> ExecResult<Vec<LivePosition>> {
        Ok(self.get_pending_positions().await?)
    }

    async fn list_pending_orders(&self) -> ExecResult<Vec<PendingOrder>> {
        Ok(self.get_pending_orders(None).await?)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExecResult<OrderAck> {
        Ok(self.place_order_raw(request).await?)
    }

    async fn place_tpsl_order(&self, request: &TpSlRequest) -> ExecResult<OrderAck> {
        Ok(self.place_tpsl_raw(request).await?)
    }

    async fn cancel_orders(&self, symbol: &Symbol, order_ids: &[String]) -> ExecResult<CancelOutcome> {
        Ok(self.cancel_orders_raw(symbol, order_ids).await?)
    }

    async fn change_leverage(&self, symbol: &Symbol, leverage: u32) -> ExecResult<()> {
        Ok(self.change_leverage_raw(symbol, leverage).await?)
    }
}

// =============================================================================
// Request bodies
// =============================================================================

fn order_body(request: &OrderRequest) -> Value {
    let side = match request.side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    };
    let mut body = json!({
        "symbol": request.symbol.as_pair(),
        "side": side,
        "qty": decimal_str(request.quantity.as_decimal()),
        "reduceOnly": request.reduce_only,
        "tradeSide": if request.reduce_only { "CLOSE" } else { "OPEN" },
        "clientId": request.client_order_id,
    });
    match &request.kind {
        OrderKind::Market => {
            body["orderType"] = json!("MARKET");
        },
        OrderKind::Limit { price, post_only } => {
            body["orderType"] = json!("LIMIT");
            body["price"] = json!(decimal_str(price.as_decimal()));
            body["effect"] = json!(if *post_only { "POST_ONLY" } else { "GTC" });
        },
    }
    body
}

fn tpsl_body(request: &TpSlRequest) -> Value {
    let mut body = json!({
        "symbol": request.symbol.as_pair(),
        "positionId": request.position_id,
    });
    if let Some(tp) = &request.take_profit {
        body["tpPrice"] = json!(decimal_str(tp.trigger_price.as_decimal()));
        body["tpStopType"] = json!("MARK_PRICE");
        body["tpOrderType"] = json!("LIMIT");
        body["tpOrderPrice"] = json!(decimal_str(tp.limit_price.as_decimal()));
        body["tpQty"] = json!(decimal_str(tp.quantity.as_decimal()));
    }
    if let Some(sl) = &request.stop_loss {
        body["slPrice"] = json!(decimal_str(sl.trigger_price.as_decimal()));
        body["slStopType"] = json!("MARK_PRICE");
        body["slOrderType"] = json!("MARKET");
        body["slQty"] = json!(decimal_str(sl.quantity.as_decimal()));
    }
    body
}

/// Coin-margined pairs (`*USD`) post margin in the base coin.
fn margin_coin(symbol: &Symbol) -> String {
    if symbol.quote() == "USD" {
        symbol.base().to_string()
    } else {
        symbol.quote().to_string()
    }
}

// =============================================================================
// Bitunix Types (from API responses)
// =============================================================================

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn into_data(self) -> Result<Value, BitunixRestError> {
        if self.code != 0 {
            return Err(BitunixRestError::ApiError {
                code: self.code,
                msg: self.msg,
            });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelResult {
    #[serde(default)]
    success_list: Vec<CancelEntry>,
    #[serde(default)]
    failure_list: Vec<CancelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelEntry {
    #[serde(default)]
    order_id: Value,
}

impl CancelEntry {
    fn into_id(self) -> Option<String> {
        match self.order_id {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// `data` is either a bare array or an object holding the array under `key`.
fn parse_list<T: serde::de::DeserializeOwned>(data: Value, key: &str) -> Vec<T> {
    let items = match data {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, key, "Skipping unreadable entry");
                None
            },
        })
        .collect()
}

fn parse_ack(data: &Value) -> Result<OrderAck, BitunixRestError> {
    let order_id = match data.get("orderId") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(BitunixRestError::ParseError("missing orderId".to_string())),
    };
    let price = data
        .get("price")
        .and_then(|v| match v {
            Value::String(s) => s.parse::<Decimal>().ok(),
            Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
            _ => None,
        })
        .and_then(|p| Price::new(p).ok());
    Ok(OrderAck { order_id, price })
}

// =============================================================================
// Tests
// =============================================================================
