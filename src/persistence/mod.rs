use crate::models::Candle;
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

/// Sorted-set key holding completed candles for one symbol and period
pub fn candle_key(symbol: &str, period_minutes: u32) -> String {
    format!("candles:{}:{}m", symbol, period_minutes)
}

/// Redis persistence for completed candles
///
/// Uses sorted sets scored by candle start time for efficient time-range queries
pub struct RedisPersistence {
    conn: ConnectionManager,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Store one completed candle; a candle with the same start replaces the old one
    pub async fn save_candle(&mut self, candle: &Candle) -> Result<()> {
        let key = candle_key(&candle.symbol, candle.period_minutes);
        let score = candle.start_time.timestamp() as f64;
        let value = serde_json::to_string(candle)?;

        self.conn
            .zrembyscore::<_, _, _, ()>(&key, score, score)
            .await?;
        self.conn.zadd::<_, _, _, ()>(&key, value, score).await?;

        tracing::debug!(
            "Saved {} {}m candle at {} to Redis",
            candle.symbol,
            candle.period_minutes,
            candle.start_time
        );
        Ok(())
    }

    pub async fn save_candles(&mut self, candles: &[Candle]) -> Result<()> {
        for candle in candles {
            self.save_candle(candle).await?;
        }
        Ok(())
    }

    /// Candles with start time in `[start, end]`, oldest first
    ///
    /// With a `limit`, only the most recent `limit` candles of the range are returned.
    pub async fn load_candles(
        &mut self,
        symbol: &str,
        period_minutes: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        let key = candle_key(symbol, period_minutes);
        let results: Vec<String> = self
            .conn
            .zrangebyscore(&key, start.timestamp() as f64, end.timestamp() as f64)
            .await?;

        let mut candles = results
            .iter()
            .map(|json| serde_json::from_str::<Candle>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.start_time);

        if let Some(limit) = limit {
            let skip = candles.len().saturating_sub(limit);
            candles.drain(..skip);
        }

        tracing::debug!(
            "Loaded {} {}m candles for {} from Redis",
            candles.len(),
            period_minutes,
            symbol
        );
        Ok(candles)
    }

    /// Remove candles that started more than `keep` ago
    pub async fn cleanup_old(
        &mut self,
        symbol: &str,
        period_minutes: u32,
        keep: ChronoDuration,
    ) -> Result<usize> {
        let key = candle_key(symbol, period_minutes);
        let cutoff = (Utc::now() - keep).timestamp() as f64;

        let removed: usize = self.conn.zrembyscore(&key, "-inf", cutoff).await?;
        if removed > 0 {
            tracing::debug!("Cleaned up {} old candles from {}", removed, key);
        }
        Ok(removed)
    }

    pub async fn count_candles(&mut self, symbol: &str, period_minutes: u32) -> Result<usize> {
        let count: usize = self.conn.zcard(candle_key(symbol, period_minutes)).await?;
        Ok(count)
    }
}
