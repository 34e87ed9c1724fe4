use crate::api::tastytrade::{value_as_f64, TastyTradeClient};
use crate::models::{
    Candle, CandleEvent, GreeksEvent, MarketEvent, QuoteEvent, SummaryEvent, TradeEvent,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const PROTOCOL_VERSION: &str = "0.1-DXF-JS/0.3.0";
const KEEPALIVE_TIMEOUT_SECS: u64 = 60;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_CHANNEL: u64 = 1;
const HISTORY_IDLE: Duration = Duration::from_secs(5);
const HISTORY_MAX_WAIT: Duration = Duration::from_secs(120);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============== Event Schema ==============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Trade,
    Quote,
    Greeks,
    Summary,
    Candle,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Trade,
        EventKind::Quote,
        EventKind::Greeks,
        EventKind::Summary,
        EventKind::Candle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Trade => "Trade",
            EventKind::Quote => "Quote",
            EventKind::Greeks => "Greeks",
            EventKind::Summary => "Summary",
            EventKind::Candle => "Candle",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Field order requested in FEED_SETUP; COMPACT payloads follow it
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::Trade => &["eventType", "eventSymbol", "price", "dayVolume", "size", "time"],
            EventKind::Quote => &[
                "eventType",
                "eventSymbol",
                "bidPrice",
                "askPrice",
                "bidSize",
                "askSize",
                "time",
            ],
            EventKind::Greeks => &[
                "eventType",
                "eventSymbol",
                "volatility",
                "delta",
                "gamma",
                "theta",
                "rho",
                "vega",
            ],
            EventKind::Summary => &[
                "eventType",
                "eventSymbol",
                "openInterest",
                "dayOpenPrice",
                "dayHighPrice",
                "dayLowPrice",
                "prevDayClosePrice",
            ],
            EventKind::Candle => &[
                "eventType",
                "eventSymbol",
                "time",
                "open",
                "high",
                "low",
                "close",
                "volume",
                "vwap",
            ],
        }
    }
}

/// Requests the stream task accepts while running
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Subscribe {
        symbols: Vec<String>,
        kinds: Vec<EventKind>,
    },
    Unsubscribe {
        symbols: Vec<String>,
        kinds: Vec<EventKind>,
    },
}

// ============== Protocol Messages ==============

pub fn setup_message() -> Value {
    json!({
        "type": "SETUP",
        "channel": 0,
        "version": PROTOCOL_VERSION,
        "keepaliveTimeout": KEEPALIVE_TIMEOUT_SECS,
        "acceptKeepaliveTimeout": KEEPALIVE_TIMEOUT_SECS
    })
}

pub fn keepalive_message() -> Value {
    json!({"type": "KEEPALIVE", "channel": 0})
}

pub fn feed_setup_message(channel: u64) -> Value {
    let fields: serde_json::Map<String, Value> = EventKind::ALL
        .iter()
        .map(|k| (k.as_str().to_string(), json!(k.fields())))
        .collect();

    json!({
        "type": "FEED_SETUP",
        "channel": channel,
        "acceptAggregationPeriod": 0.1,
        "acceptDataFormat": "COMPACT",
        "acceptEventFields": fields
    })
}

fn subscription_entries(symbols: &[String], kinds: &[EventKind]) -> Vec<Value> {
    symbols
        .iter()
        .flat_map(|symbol| {
            kinds
                .iter()
                .map(move |kind| json!({"type": kind.as_str(), "symbol": symbol}))
        })
        .collect()
}

pub fn subscription_message(
    channel: u64,
    symbols: &[String],
    kinds: &[EventKind],
    reset: bool,
) -> Value {
    json!({
        "type": "FEED_SUBSCRIPTION",
        "channel": channel,
        "reset": reset,
        "add": subscription_entries(symbols, kinds)
    })
}

pub fn unsubscription_message(channel: u64, symbols: &[String], kinds: &[EventKind]) -> Value {
    json!({
        "type": "FEED_SUBSCRIPTION",
        "channel": channel,
        "remove": subscription_entries(symbols, kinds)
    })
}

pub fn candle_subscription_message(channel: u64, candle_symbol: &str, from_time_ms: i64) -> Value {
    json!({
        "type": "FEED_SUBSCRIPTION",
        "channel": channel,
        "add": [{"type": "Candle", "symbol": candle_symbol, "fromTime": from_time_ms}]
    })
}

/// Map a timeframe like "5m" or "1h" to its DXLink candle period and length in minutes
pub fn timeframe_period(timeframe: &str) -> Option<(&'static str, u32)> {
    match timeframe {
        "1m" | "1Min" => Some(("1m", 1)),
        "2m" | "2Min" => Some(("2m", 2)),
        "3m" | "3Min" => Some(("3m", 3)),
        "5m" | "5Min" => Some(("5m", 5)),
        "15m" | "15Min" => Some(("15m", 15)),
        "30m" | "30Min" => Some(("30m", 30)),
        "1h" | "1Hour" => Some(("1h", 60)),
        "1d" | "1Day" => Some(("1d", 1440)),
        _ => None,
    }
}

/// "SPY" + "5m" -> "SPY{=5m}"
pub fn candle_symbol(symbol: &str, period: &str) -> String {
    format!("{}{{={}}}", symbol, period)
}

/// "SPY{=5m}" -> ("SPY", 5)
pub fn parse_candle_symbol(candle_symbol: &str) -> Option<(String, u32)> {
    let (base, rest) = candle_symbol.split_once("{=")?;
    let period = rest.trim_end_matches('}');
    let period = period.split(',').next()?;
    let minutes = match period.chars().last()? {
        'm' => period.trim_end_matches('m').parse::<u32>().ok()?,
        'h' => period.trim_end_matches('h').parse::<u32>().ok()? * 60,
        'd' => period.trim_end_matches('d').parse::<u32>().ok()? * 1440,
        _ => return None,
    };
    Some((base.to_string(), minutes))
}

// ============== Feed Parsing ==============

fn field_f64(value: Option<&Value>) -> f64 {
    value
        .and_then(value_as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn field_time(value: Option<&Value>) -> DateTime<Utc> {
    let millis = field_f64(value) as i64;
    if millis <= 0 {
        return Utc::now();
    }
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

fn build_event(kind: EventKind, values: &[Value]) -> Option<MarketEvent> {
    let symbol = values.get(1)?.as_str()?.to_string();
    let f = |i: usize| field_f64(values.get(i));

    let event = match kind {
        EventKind::Trade => MarketEvent::Trade(TradeEvent {
            symbol,
            price: f(2),
            day_volume: f(3),
            size: f(4),
            time: field_time(values.get(5)),
        }),
        EventKind::Quote => MarketEvent::Quote(QuoteEvent {
            symbol,
            bid: f(2),
            ask: f(3),
            bid_size: f(4),
            ask_size: f(5),
            time: field_time(values.get(6)),
        }),
        EventKind::Greeks => MarketEvent::Greeks(GreeksEvent {
            symbol,
            volatility: f(2),
            delta: f(3),
            gamma: f(4),
            theta: f(5),
            rho: f(6),
            vega: f(7),
        }),
        EventKind::Summary => MarketEvent::Summary(SummaryEvent {
            symbol,
            open_interest: f(2),
            day_open: f(3),
            day_high: f(4),
            day_low: f(5),
            prev_close: f(6),
        }),
        EventKind::Candle => MarketEvent::Candle(CandleEvent {
            symbol,
            time: field_time(values.get(2)),
            open: f(3),
            high: f(4),
            low: f(5),
            close: f(6),
            volume: f(7),
            vwap: f(8),
        }),
    };
    Some(event)
}

/// Split one COMPACT block into events by the kind's field count
fn parse_compact_block(kind: EventKind, values: &[Value], events: &mut Vec<MarketEvent>) {
    let width = kind.fields().len();
    for chunk in values.chunks(width) {
        if chunk.len() < width {
            tracing::debug!("Dropping truncated {} event ({} values)", kind.as_str(), chunk.len());
            continue;
        }
        if let Some(event) = build_event(kind, chunk) {
            events.push(event);
        }
    }
}

/// Decode the `data` array of a FEED_DATA message
///
/// Accepts `["Quote", [flat...], "Trade", [flat...]]` as well as a list of
/// per-event arrays each starting with the event type.
pub fn parse_feed_data(data: &Value) -> Vec<MarketEvent> {
    let mut events = Vec::new();
    let Some(items) = data.as_array() else {
        return events;
    };

    let mut i = 0;
    while i < items.len() {
        match (&items[i], items.get(i + 1)) {
            (Value::String(name), Some(Value::Array(values))) => {
                if let Some(kind) = EventKind::parse(name) {
                    parse_compact_block(kind, values, &mut events);
                } else {
                    tracing::trace!("Ignoring unsubscribed event type {}", name);
                }
                i += 2;
            }
            (Value::Array(values), _) => {
                if let Some(kind) = values
                    .first()
                    .and_then(|v| v.as_str())
                    .and_then(EventKind::parse)
                {
                    parse_compact_block(kind, values, &mut events);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    events
}

/// Convert a streamed candle into the bar model
pub fn candle_from_event(event: &CandleEvent) -> Option<Candle> {
    let (symbol, minutes) = parse_candle_symbol(&event.symbol)?;
    if event.open == 0.0 && event.high == 0.0 && event.low == 0.0 && event.close == 0.0 {
        return None;
    }
    Some(Candle {
        symbol,
        period_minutes: minutes,
        start_time: event.time,
        end_time: event.time + ChronoDuration::minutes(minutes as i64),
        open: event.open,
        high: event.high,
        low: event.low,
        close: event.close,
        volume: event.volume,
        tick_count: 0,
        last_update: event.time,
    })
}

/// Sort by start time and keep the last update per bar
pub fn dedupe_candles(candles: Vec<Candle>) -> Vec<Candle> {
    let mut by_start: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    for candle in candles {
        by_start.insert(candle.start_time, candle);
    }
    by_start.into_values().collect()
}

// ============== Handshake ==============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    SetupSent,
    AuthSent,
    ChannelRequested,
    Ready,
}

/// SETUP -> AUTH -> CHANNEL_REQUEST -> FEED_SETUP driven by server replies
#[derive(Debug, Clone)]
pub struct Handshake {
    token: String,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            state: HandshakeState::SetupSent,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Feed one server message; returns the reply to send, if any
    pub fn advance(&mut self, msg: &Value) -> Result<Option<Value>> {
        let msg_type = msg["type"].as_str().unwrap_or("");

        match (msg_type, msg["state"].as_str()) {
            ("AUTH_STATE", Some("UNAUTHORIZED")) => {
                if self.state == HandshakeState::AuthSent {
                    bail!("DXLink rejected the quote token");
                }
                self.state = HandshakeState::AuthSent;
                Ok(Some(json!({"type": "AUTH", "channel": 0, "token": self.token})))
            }
            ("AUTH_STATE", Some("AUTHORIZED")) => {
                self.state = HandshakeState::ChannelRequested;
                Ok(Some(json!({
                    "type": "CHANNEL_REQUEST",
                    "channel": FEED_CHANNEL,
                    "service": "FEED",
                    "parameters": {"contract": "AUTO"}
                })))
            }
            ("CHANNEL_OPENED", _) if msg["channel"].as_u64() == Some(FEED_CHANNEL) => {
                self.state = HandshakeState::Ready;
                Ok(Some(feed_setup_message(FEED_CHANNEL)))
            }
            ("ERROR", _) => bail!(
                "DXLink error during handshake: {} {}",
                msg["error"].as_str().unwrap_or(""),
                msg["message"].as_str().unwrap_or("")
            ),
            _ => Ok(None),
        }
    }
}

// ============== Client ==============

/// DXLink WebSocket client for the TastyTrade market data feed
pub struct DxLinkClient {
    url: String,
    token: String,
    stream: Option<WsStream>,
    last_keepalive: Instant,
    subscriptions: Vec<(String, EventKind)>,
    token_source: Option<TastyTradeClient>,
    reconnect_delay: Duration,
}

impl DxLinkClient {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            stream: None,
            last_keepalive: Instant::now(),
            subscriptions: Vec::new(),
            token_source: None,
            reconnect_delay: RECONNECT_BASE_DELAY,
        }
    }

    /// Fetch a fresh quote token from `client` when DXLink stops accepting the current one
    pub fn with_token_refresh(mut self, client: TastyTradeClient) -> Self {
        self.token_source = Some(client);
        self
    }

    /// First reconnect delay; doubles per failed attempt up to a minute
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, msg: &Value) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            bail!("WebSocket not connected")
        };
        let sent = stream.send(Message::Text(msg.to_string())).await;
        if let Err(e) = sent {
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_json(&mut self) -> Result<Option<Value>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("WebSocket not connected"))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!("Skipping malformed DXLink frame ({}): {:.120}", e, text);
                    Ok(None)
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                self.stream = None;
                bail!("DXLink connection closed")
            }
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    /// Open the socket and complete the auth/channel handshake
    pub async fn connect(&mut self) -> Result<()> {
        tracing::debug!("Connecting to DXLink at {}", self.url);

        let (ws_stream, response) = connect_async(&self.url).await.map_err(|e| {
            tracing::error!("DXLink connection error: {}", e);
            anyhow::anyhow!("Failed to connect to DXLink at {}: {}", self.url, e)
        })?;
        self.stream = Some(ws_stream);
        tracing::info!(
            "DXLink connected to {} (HTTP status: {})",
            self.url,
            response.status()
        );

        self.send(&setup_message()).await?;
        let mut handshake = Handshake::new(&self.token);

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while !handshake.is_ready() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = tokio::time::timeout(remaining, self.read_json())
                .await
                .context("DXLink handshake timed out")??;
            if let Some(msg) = msg {
                if let Some(reply) = handshake.advance(&msg)? {
                    self.send(&reply).await?;
                }
            }
        }

        self.last_keepalive = Instant::now();
        tracing::info!("DXLink feed channel {} ready", FEED_CHANNEL);

        if !self.subscriptions.is_empty() {
            let add: Vec<Value> = self
                .subscriptions
                .iter()
                .map(|(symbol, kind)| json!({"type": kind.as_str(), "symbol": symbol}))
                .collect();
            self.send(&json!({"type": "FEED_SUBSCRIPTION", "channel": FEED_CHANNEL, "add": add}))
                .await?;
            tracing::info!("Restored {} DXLink subscriptions", self.subscriptions.len());
        }

        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    /// Swap in a fresh quote token and streamer URL
    async fn refresh_token(&mut self) {
        let Some(client) = &self.token_source else {
            return;
        };
        match client.get_quote_token().await {
            Ok(token) => {
                self.token = token.token;
                self.url = token.dxlink_url;
                tracing::info!("🔑 Refreshed DXLink quote token");
            }
            Err(e) => tracing::warn!("Failed to refresh DXLink quote token: {}", e),
        }
    }

    /// Reconnect until the feed is back, backing off between attempts
    async fn reconnect(&mut self) {
        self.disconnect().await;
        let mut delay = self.reconnect_delay;
        let mut attempt = 1u32;

        loop {
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(()) => {
                    tracing::info!("✅ DXLink reconnected after {} attempt(s)", attempt);
                    return;
                }
                Err(e) => {
                    self.stream = None;
                    tracing::warn!(
                        "DXLink reconnect attempt {} failed: {}, retrying in {:?}",
                        attempt,
                        e,
                        (delay * 2).min(RECONNECT_MAX_DELAY)
                    );
                    // A rejected token never recovers on its own
                    self.refresh_token().await;
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    /// Recorded before sending so a lost socket restores it on reconnect
    pub async fn subscribe(&mut self, symbols: &[String], kinds: &[EventKind]) -> Result<()> {
        for symbol in symbols {
            for kind in kinds {
                let key = (symbol.clone(), *kind);
                if !self.subscriptions.contains(&key) {
                    self.subscriptions.push(key);
                }
            }
        }
        self.send(&subscription_message(FEED_CHANNEL, symbols, kinds, false))
            .await?;
        tracing::info!("Subscribed to {} symbols on DXLink", symbols.len());
        Ok(())
    }

    pub async fn unsubscribe(&mut self, symbols: &[String], kinds: &[EventKind]) -> Result<()> {
        self.subscriptions
            .retain(|(s, k)| !(symbols.contains(s) && kinds.contains(k)));
        self.send(&unsubscription_message(FEED_CHANNEL, symbols, kinds))
            .await
    }

    /// Subscribe to historical and live candles starting at `from`
    pub async fn subscribe_candles(
        &mut self,
        symbol: &str,
        timeframe: &str,
        from: DateTime<Utc>,
    ) -> Result<String> {
        let (period, _) = timeframe_period(timeframe)
            .with_context(|| format!("Unsupported candle timeframe {}", timeframe))?;
        let candle_sym = candle_symbol(symbol, period);
        self.send(&candle_subscription_message(
            FEED_CHANNEL,
            &candle_sym,
            from.timestamp_millis(),
        ))
        .await?;
        tracing::info!("Subscribed to candles {} from {}", candle_sym, from);
        Ok(candle_sym)
    }

    async fn send_keepalive_if_due(&mut self) -> Result<()> {
        if self.last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            self.send(&keepalive_message()).await?;
            self.last_keepalive = Instant::now();
            tracing::trace!("Sent DXLink keepalive");
        }
        Ok(())
    }

    /// Wait for the next batch of market events
    ///
    /// Returns an empty batch on keepalive ticks, control messages and
    /// malformed frames. A lost socket, failed keepalive or revoked
    /// authorization is reconnected and subscriptions restored.
    pub async fn next_events(&mut self) -> Vec<MarketEvent> {
        if let Err(e) = self.send_keepalive_if_due().await {
            tracing::warn!("DXLink keepalive failed ({}), reconnecting...", e);
            self.reconnect().await;
            return Vec::new();
        }

        let wait = KEEPALIVE_INTERVAL.saturating_sub(self.last_keepalive.elapsed());
        let msg = match tokio::time::timeout(wait, self.read_json()).await {
            Err(_) => return Vec::new(),
            Ok(Err(e)) => {
                tracing::warn!("DXLink stream lost ({}), reconnecting...", e);
                self.reconnect().await;
                return Vec::new();
            }
            Ok(Ok(None)) => return Vec::new(),
            Ok(Ok(Some(msg))) => msg,
        };

        match msg["type"].as_str().unwrap_or("") {
            "FEED_DATA" => parse_feed_data(&msg["data"]),
            "KEEPALIVE" => Vec::new(),
            "ERROR" => {
                tracing::warn!(
                    "DXLink error: {} {}",
                    msg["error"].as_str().unwrap_or(""),
                    msg["message"].as_str().unwrap_or("")
                );
                Vec::new()
            }
            "AUTH_STATE" if msg["state"] == "UNAUTHORIZED" => {
                tracing::warn!("🔑 DXLink session no longer authorized, refreshing quote token");
                self.refresh_token().await;
                self.reconnect().await;
                Vec::new()
            }
            other => {
                tracing::debug!("DXLink control message {}", other);
                Vec::new()
            }
        }
    }

    /// Pump events into `events` until the receiver is dropped
    ///
    /// Connection trouble is handled inside; the only way out is the consumer going away.
    pub async fn run(
        mut self,
        events: mpsc::UnboundedSender<MarketEvent>,
        mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                batch = self.next_events() => {
                    for event in batch {
                        if events.send(event).is_err() {
                            tracing::info!("Market event receiver dropped, stopping DXLink stream");
                            self.disconnect().await;
                            return Ok(());
                        }
                    }
                }
                Some(command) = commands.recv() => {
                    let result = match &command {
                        StreamCommand::Subscribe { symbols, kinds } => self.subscribe(symbols, kinds).await,
                        StreamCommand::Unsubscribe { symbols, kinds } => self.unsubscribe(symbols, kinds).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!("DXLink command {:?} failed: {}", command, e);
                    }
                }
            }
        }
    }

    /// Fetch historical candles over a dedicated connection
    ///
    /// Collects until the feed goes quiet, then returns sorted, de-duplicated bars.
    pub async fn fetch_candles(
        client: &TastyTradeClient,
        symbol: &str,
        timeframe: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let token = client.get_quote_token().await?;
        let mut stream = DxLinkClient::new(&token.dxlink_url, &token.token);
        stream.connect().await?;
        let candle_sym = stream.subscribe_candles(symbol, timeframe, from).await?;

        let started = Instant::now();
        let mut collected = Vec::new();

        while started.elapsed() < HISTORY_MAX_WAIT {
            let batch = match tokio::time::timeout(HISTORY_IDLE, stream.read_json()).await {
                Err(_) => break,
                Ok(msg) => msg?,
            };
            let Some(msg) = batch else { continue };
            if msg["type"] != "FEED_DATA" {
                continue;
            }
            for event in parse_feed_data(&msg["data"]) {
                if let MarketEvent::Candle(c) = event {
                    if c.symbol == candle_sym {
                        if let Some(candle) = candle_from_event(&c) {
                            collected.push(candle);
                        }
                    }
                }
            }
        }

        stream.disconnect().await;

        let candles: Vec<Candle> = dedupe_candles(collected)
            .into_iter()
            .filter(|c| c.start_time >= from)
            .collect();
        tracing::info!("Fetched {} {} candles for {}", candles.len(), timeframe, symbol);
        Ok(candles)
    }
}
