//! Bitunix public ticker WebSocket feed
//!
//! One shared connection carries every ticker subscription. A background task
//! owns the socket, reconnects after a fixed delay when it drops, and replays
//! the current subscription set on every new connection. Last prices (`la`)
//! are fanned out to one bounded channel per symbol.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use rung_domain::{Price, Symbol};
use rung_exec::{ExecError, ExecResult, MarketDataPort, PriceUpdate};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Subscribers = Arc<Mutex<HashMap<Symbol, mpsc::Sender<PriceUpdate>>>>;

/// Bitunix public WebSocket URL.
const BITUNIX_WS_URL: &str = "wss://fapi.bitunix.com/public/";

/// Reconnect delay (in seconds).
const RECONNECT_DELAY_SECS: u64 = 5;

/// Silence longer than this is treated as a dead connection.
const READ_TIMEOUT_SECS: u64 = 60;

/// Keepalive ping period (in seconds).
const PING_INTERVAL_SECS: u64 = 20;

/// Per-symbol buffer; a slow consumer loses ticks rather than stalling the socket.
const CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur on the ticker connection.
#[derive(Debug, Error)]
pub enum BitunixWsError {
    /// Failed to connect to WebSocket.
    #[error("Failed to connect to WebSocket: {0}")]
    ConnectionFailed(String),

    /// Failed to send message.
    #[error("Failed to send message: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("Failed to receive message: {0}")]
    ReceiveError(String),

    /// Server closed the connection.
    #[error("Connection closed by server")]
    ChannelClosed,

    /// Timed out waiting for message.
    #[error("Timed out waiting for message")]
    Timeout,
}

enum Command {
    Subscribe(Symbol),
    Unsubscribe(Symbol),
}

/// Ticker feed implementing [`MarketDataPort`].
pub struct BitunixTickerFeed {
    subscribers: Subscribers,
    commands: mpsc::UnboundedSender<Command>,
}

impl BitunixTickerFeed {
    /// Start the connection task against the production endpoint.
    ///
    /// Must be called from within a tokio runtime. The task stops once the
    /// feed is dropped.
    pub fn spawn() -> Self {
        Self::spawn_with_url(BITUNIX_WS_URL)
    }

    pub fn spawn_with_url(url: impl Into<String>) -> Self {
        let subscribers: Subscribers = Arc::default();
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(url.into(), subscribers.clone(), rx));
        Self { subscribers, commands }
    }
}

#[async_trait]
impl MarketDataPort for BitunixTickerFeed {
    async fn subscribe(&self, symbol: &Symbol) -> ExecResult<mpsc::Receiver<PriceUpdate>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.lock().await.insert(symbol.clone(), tx);
        self.commands
            .send(Command::Subscribe(symbol.clone()))
            .map_err(|_| ExecError::MarketData("ticker connection task has stopped".to_string()))?;
        Ok(rx)
    }

    async fn unsubscribe(&self, symbol: &Symbol) -> ExecResult<()> {
        self.subscribers.lock().await.remove(symbol);
        // A stopped task has nothing left to unsubscribe from
        let _ = self.commands.send(Command::Unsubscribe(symbol.clone()));
        Ok(())
    }
}

/// Connection supervisor: connect, serve, wait, repeat.
async fn run_connection(url: String, subscribers: Subscribers, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        info!(%url, "Connecting to Bitunix ticker stream");
        let outcome = match connect_async(&url).await {
            Ok((ws, _)) => serve(ws, &subscribers, &mut commands).await,
            Err(e) => Err(BitunixWsError::ConnectionFailed(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                debug!("Ticker feed dropped, connection task exiting");
                return;
            },
            Err(e) => warn!(error = %e, "Ticker stream lost, reconnecting in {}s", RECONNECT_DELAY_SECS),
        }

        // Subscription changes made meanwhile are already in `subscribers`
        // and get replayed on reconnect.
        tokio::select! {
            _ = sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {},
            cmd = commands.recv() => if cmd.is_none() { return; },
        }
    }
}

/// Serve one connection. `Ok` means the feed was dropped.
async fn serve(
    ws: WsStream,
    subscribers: &Subscribers,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), BitunixWsError> {
    let (mut sink, mut stream) = ws.split();

    let symbols: Vec<Symbol> = subscribers.lock().await.keys().cloned().collect();
    if !symbols.is_empty() {
        send(&mut sink, subscription_message("subscribe", &symbols)).await?;
        info!(symbols = symbols.len(), "Subscribed to tickers");
    }

    let mut keepalive = interval(Duration::from_secs(PING_INTERVAL_SECS));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                },
                Some(Command::Subscribe(symbol)) => {
                    send(&mut sink, subscription_message("subscribe", std::slice::from_ref(&symbol))).await?;
                    debug!(%symbol, "Ticker subscribed");
                },
                Some(Command::Unsubscribe(symbol)) => {
                    send(&mut sink, subscription_message("unsubscribe", std::slice::from_ref(&symbol))).await?;
                    debug!(%symbol, "Ticker unsubscribed");
                },
            },
            _ = keepalive.tick() => {
                send(&mut sink, json!({ "op": "ping", "ping": Utc::now().timestamp() }).to_string()).await?;
            },
            msg = timeout(Duration::from_secs(READ_TIMEOUT_SECS), stream.next()) => match msg {
                Err(_) => return Err(BitunixWsError::Timeout),
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return Err(BitunixWsError::ChannelClosed),
                Ok(Some(Err(e))) => return Err(BitunixWsError::ReceiveError(e.to_string())),
                Ok(Some(Ok(Message::Text(text)))) => dispatch(&text, subscribers).await,
                Ok(Some(Ok(_))) => {},
            },
        }
    }
}

async fn send<S>(sink: &mut S, text: String) -> Result<(), BitunixWsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(text))
        .await
        .map_err(|e| BitunixWsError::SendFailed(e.to_string()))
}

fn subscription_message(op: &str, symbols: &[Symbol]) -> String {
    let args: Vec<Value> = symbols
        .iter()
        .map(|s| json!({ "symbol": s.as_pair(), "ch": "ticker" }))
        .collect();
    json!({ "op": op, "args": args }).to_string()
}

/// Forward a ticker frame to its subscriber, if any.
async fn dispatch(text: &str, subscribers: &Subscribers) {
    let Some(update) = parse_ticker(text) else {
        return;
    };

    let mut subs = subscribers.lock().await;
    let Some(tx) = subs.get(&update.symbol) else {
        return;
    };
    match tx.try_send(update) {
        Ok(()) => {},
        Err(mpsc::error::TrySendError::Full(update)) => {
            debug!(symbol = %update.symbol, "Subscriber lagging, tick dropped");
        },
        Err(mpsc::error::TrySendError::Closed(update)) => {
            subs.remove(&update.symbol);
        },
    }
}

/// Parse `{"ch":"ticker","symbol":"BTCUSDT","ts":..,"data":{"la":"..."}}`.
fn parse_ticker(text: &str) -> Option<PriceUpdate> {
    let msg: Value = serde_json::from_str(text).ok()?;
    if msg.get("ch").and_then(Value::as_str) != Some("ticker") {
        return None;
    }
    let symbol = Symbol::from_pair(msg.get("symbol")?.as_str()?).ok()?;
    let last = match msg.get("data")?.get("la")? {
        Value::String(s) => Decimal::from_str(s.trim()).ok()?,
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok()?,
        _ => return None,
    };
    let price = Price::new(last).ok()?;
    let timestamp = msg
        .get("ts")
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Some(PriceUpdate { symbol, price, timestamp })
}

// =============================================================================
// Tests
// =============================================================================
