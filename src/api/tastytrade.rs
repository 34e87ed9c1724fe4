use crate::api::error::BrokerError;
use anyhow::{Context, Result};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const TASTYTRADE_CERT_URL: &str = "https://api.cert.tastyworks.com";
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);
const SESSION_LIFETIME: Duration = Duration::from_secs(8 * 60 * 60);
const MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = "jigsawbot/0.1";

// Type alias for the rate limiter to simplify signatures
type BrokerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone)]
struct Session {
    token: String,
    created: Instant,
}

impl Session {
    fn is_expired(&self) -> bool {
        self.created.elapsed() > SESSION_LIFETIME
    }
}

/// TastyTrade REST client with session management, rate limiting and retries
///
/// This struct is cloneable to allow sharing across async tasks.
/// All clones share the same session and rate limiter.
#[derive(Clone)]
pub struct TastyTradeClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    session: Arc<RwLock<Option<Session>>>,
    rate_limiter: Arc<BrokerRateLimiter>,
    backoff_base: Duration,
}

// ============== Response Types ==============

/// Accept numbers that the API sends either as JSON numbers or strings
pub(crate) fn flexible_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_f64).unwrap_or(0.0))
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SessionData {
    #[serde(rename = "session-token")]
    session_token: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AccountBalance {
    #[serde(default, deserialize_with = "flexible_f64")]
    pub cash_balance: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub available_trading_funds: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub net_liquidating_value: f64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Streaming credentials from `/api-quote-tokens`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QuoteToken {
    pub token: String,
    #[serde(rename = "dxlink-url")]
    pub dxlink_url: String,
    #[serde(default)]
    pub level: Option<String>,
}

/// Position as reported by the broker
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BrokerPosition {
    pub symbol: String,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub underlying_symbol: Option<String>,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub quantity: f64,
    #[serde(default)]
    pub quantity_direction: Option<String>,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub average_open_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub close_price: f64,
}

impl BrokerPosition {
    pub fn is_short(&self) -> bool {
        self.quantity_direction.as_deref() == Some("Short")
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AccountItem {
    account: AccountInfo,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(rename = "account-number")]
    account_number: String,
}

impl TastyTradeClient {
    /// Create a client; no request is made until the first call
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        // One request per 200ms
        let quota = Quota::with_period(MIN_REQUEST_INTERVAL)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            session: Arc::new(RwLock::new(None)),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the retry backoff unit (2^attempt multiples of it)
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.pow(attempt)
    }

    // ============== Session ==============

    /// Authenticate and store a fresh session token
    pub async fn login(&self) -> std::result::Result<(), BrokerError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(BrokerError::MissingCredentials);
        }

        let url = format!("{}/sessions", self.base_url);
        let payload = json!({
            "login": self.username,
            "password": self.password,
            "remember-me": true,
        });

        let mut last_error = BrokerError::Auth("no login attempt made".to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.post(&url).json(&payload).send().await {
                Ok(response) if response.status() == StatusCode::CREATED => {
                    let body: Envelope<SessionData> = response.json().await?;
                    *self.session.write().await = Some(Session {
                        token: body.data.session_token,
                        created: Instant::now(),
                    });
                    tracing::info!("Logged in to TastyTrade as {}", self.username);
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        "Login attempt {}/{} failed with {}",
                        attempt,
                        MAX_RETRIES,
                        status
                    );
                    last_error = if status == StatusCode::UNAUTHORIZED {
                        BrokerError::Auth("invalid credentials".to_string())
                    } else {
                        BrokerError::Http {
                            status: status.as_u16(),
                            body,
                        }
                    };
                }
                Err(e) => {
                    tracing::warn!("Login attempt {}/{} network error: {}", attempt, MAX_RETRIES, e);
                    last_error = BrokerError::Transport(e);
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(last_error)
    }

    /// Terminate the current session
    pub async fn logout(&self) -> Result<()> {
        let response = self.request(Method::DELETE, "/sessions", None).await?;
        if response.status() != StatusCode::NO_CONTENT {
            anyhow::bail!("Logout returned unexpected status {}", response.status());
        }
        *self.session.write().await = None;
        tracing::info!("Logged out of TastyTrade");
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(&*self.session.read().await, Some(s) if !s.is_expired())
    }

    /// Current session token, logging in if missing or older than 8 hours
    async fn session_token(&self) -> std::result::Result<String, BrokerError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if !session.is_expired() {
                return Ok(session.token.clone());
            }
            tracing::info!("TastyTrade session expired, refreshing");
        }

        self.login().await?;
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| BrokerError::Auth("session missing after login".to_string()))
    }

    // ============== Requests ==============

    /// Make an authenticated, rate-limited request with retry logic
    ///
    /// 401 re-authenticates, 429 honours Retry-After, 5xx and network errors back off.
    /// Other non-success codes are returned as `BrokerError::Http`.
    pub(crate) async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, BrokerError> {
        let url = format!("{}{}", self.base_url, endpoint);

        for attempt in 1..=MAX_RETRIES {
            let token = self.session_token().await?;
            self.rate_limiter.until_ready().await;

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", token);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        tracing::warn!(
                            "Session rejected on {} (attempt {}/{}), re-authenticating",
                            endpoint,
                            attempt,
                            MAX_RETRIES
                        );
                        *self.session.write().await = None;
                        if attempt == MAX_RETRIES {
                            return Err(BrokerError::Auth(format!(
                                "session rejected for {}",
                                endpoint
                            )));
                        }
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let wait = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(|secs| self.backoff_base * secs as u32)
                            .unwrap_or_else(|| self.backoff(attempt));
                        tracing::warn!(
                            "Rate limited by TastyTrade (429), backing off for {:?} (attempt {}/{})",
                            wait,
                            attempt,
                            MAX_RETRIES
                        );
                        if attempt == MAX_RETRIES {
                            return Err(BrokerError::RateLimited(MAX_RETRIES));
                        }
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    if status.is_server_error() && attempt < MAX_RETRIES {
                        let backoff = self.backoff(attempt);
                        tracing::warn!(
                            "Server error {} from TastyTrade, retrying in {:?} (attempt {}/{})",
                            status,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(BrokerError::Http {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(BrokerError::Transport(e)),
            }
        }

        Err(BrokerError::Api(format!(
            "request to {} failed after {} retries",
            endpoint, MAX_RETRIES
        )))
    }

    /// GET and return the parsed JSON body
    pub(crate) async fn get_json(&self, endpoint: &str) -> Result<Value> {
        let response = self.request(Method::GET, endpoint, None).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", endpoint))
    }

    /// Send a JSON body and return (status, parsed body); 204 yields Null
    pub(crate) async fn send_json(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        let response = self.request(method, endpoint, body).await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse response from {}", endpoint))?
        };
        Ok((status, value))
    }

    // ============== Accounts ==============

    /// First account number on the login, unless one is configured
    pub async fn resolve_account_number(&self, configured: Option<&str>) -> Result<String> {
        if let Some(account) = configured.filter(|a| !a.is_empty()) {
            return Ok(account.to_string());
        }

        let body: Envelope<Items<AccountItem>> =
            serde_json::from_value(self.get_json("/customers/me/accounts").await?)
                .context("Failed to parse accounts")?;

        body.data
            .items
            .into_iter()
            .next()
            .map(|item| item.account.account_number)
            .context("No accounts found for this login")
    }

    pub async fn get_balances(&self, account_number: &str) -> Result<AccountBalance> {
        let endpoint = format!("/accounts/{}/balances", account_number);
        let body: Envelope<AccountBalance> = serde_json::from_value(self.get_json(&endpoint).await?)
            .context("Failed to parse balances")?;
        Ok(body.data)
    }

    pub async fn get_positions(&self, account_number: &str) -> Result<Vec<BrokerPosition>> {
        let endpoint = format!("/accounts/{}/positions", account_number);
        let body: Envelope<Items<BrokerPosition>> =
            serde_json::from_value(self.get_json(&endpoint).await?)
                .context("Failed to parse positions")?;
        Ok(body.data.items)
    }

    /// Token and URL for the DXLink streamer
    pub async fn get_quote_token(&self) -> Result<QuoteToken> {
        let body: Envelope<QuoteToken> =
            serde_json::from_value(self.get_json("/api-quote-tokens").await?)
                .context("Failed to parse quote token")?;
        Ok(body.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flexible_numbers() {
        let balance: AccountBalance = serde_json::from_value(json!({
            "cash-balance": "1500.25",
            "available-trading-funds": 900.5,
            "net-liquidating-value": null
        }))
        .unwrap();

        assert_eq!(balance.cash_balance, 1500.25);
        assert_eq!(balance.available_trading_funds, 900.5);
        assert_eq!(balance.net_liquidating_value, 0.0);
    }

    #[test]
    fn test_broker_position_direction() {
        let position: BrokerPosition = serde_json::from_value(json!({
            "symbol": "SPY   241129C00420000",
            "instrument-type": "Equity Option",
            "quantity": "2",
            "quantity-direction": "Short",
            "average-open-price": "3.10"
        }))
        .unwrap();

        assert!(position.is_short());
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.average_open_price, 3.1);
    }

    #[tokio::test]
    async fn test_login_requires_credentials() {
        let client = TastyTradeClient::new(TASTYTRADE_CERT_URL, "", "").unwrap();
        let result = client.login().await;
        assert!(matches!(result, Err(BrokerError::MissingCredentials)));
        assert!(!client.is_authenticated().await);
    }
}
