use crate::config::TradingConfig;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use chrono_tz::US::Eastern;

/// Why new entries are (not) allowed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Weekend,
    Closed,
    OpeningWindow,
    Open,
    PastCutoff,
    ClosingWindow,
}

impl SessionState {
    pub fn allows_entries(&self) -> bool {
        *self == SessionState::Open
    }
}

/// US equity regular-session rules evaluated in US/Eastern
#[derive(Debug, Clone)]
pub struct TradingSession {
    open: NaiveTime,
    close: NaiveTime,
    cutoff: NaiveTime,
    no_trade_window: Duration,
    auto_close_window: Duration,
}

impl TradingSession {
    pub fn from_config(config: &TradingConfig) -> Result<Self> {
        Ok(Self::new(
            config.cutoff()?,
            config.no_trade_window_minutes,
            config.auto_close_minutes,
        ))
    }

    pub fn new(cutoff: NaiveTime, no_trade_window_minutes: u32, auto_close_minutes: u32) -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            cutoff,
            no_trade_window: Duration::minutes(no_trade_window_minutes as i64),
            auto_close_window: Duration::minutes(auto_close_minutes as i64),
        }
    }

    fn local(now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&Eastern)
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        let et = Self::local(now);
        if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
            return SessionState::Weekend;
        }

        let t = et.time();
        if t < self.open || t > self.close {
            return SessionState::Closed;
        }
        if t < self.open + self.no_trade_window {
            return SessionState::OpeningWindow;
        }
        if t > self.cutoff {
            return SessionState::PastCutoff;
        }
        if t > self.close - self.auto_close_window {
            return SessionState::ClosingWindow;
        }
        SessionState::Open
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.state(now), SessionState::Weekend | SessionState::Closed)
    }

    /// New entries only: weekday, inside the session, past the opening window, before cutoff
    pub fn is_trading_allowed(&self, now: DateTime<Utc>) -> bool {
        let state = self.state(now);
        if !state.allows_entries() {
            tracing::debug!("Trading not allowed: {:?}", state);
        }
        state.allows_entries()
    }

    /// True inside the last `auto_close_minutes` of the session
    pub fn should_auto_close(&self, now: DateTime<Utc>) -> bool {
        if !self.is_market_open(now) {
            return false;
        }
        Self::local(now).time() >= self.close - self.auto_close_window
    }

    pub fn minutes_to_close(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_market_open(now) {
            return None;
        }
        Some((self.close - Self::local(now).time()).num_minutes())
    }

    /// Today's open as a UTC instant, used to pick intraday bars
    pub fn session_open_utc(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = Self::local(now).date_naive();
        Eastern
            .from_local_datetime(&date.and_time(self.open))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TradingSession {
        TradingSession::from_config(&TradingConfig::default()).unwrap()
    }

    /// Build a UTC instant from an Eastern wall-clock time
    fn et(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Eastern
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_weekend_closed() {
        // 2024-11-30 is a Saturday
        let s = session();
        assert_eq!(s.state(et(2024, 11, 30, 11, 0)), SessionState::Weekend);
        assert!(!s.is_trading_allowed(et(2024, 11, 30, 11, 0)));
    }

    #[test]
    fn test_opening_window_and_open() {
        let s = session();
        assert_eq!(s.state(et(2024, 11, 26, 9, 0)), SessionState::Closed);
        assert_eq!(s.state(et(2024, 11, 26, 9, 31)), SessionState::OpeningWindow);
        assert!(s.is_trading_allowed(et(2024, 11, 26, 9, 34)));
        assert!(s.is_trading_allowed(et(2024, 11, 26, 13, 0)));
    }

    #[test]
    fn test_cutoff_and_auto_close() {
        let s = session();
        assert_eq!(s.state(et(2024, 11, 26, 15, 20)), SessionState::PastCutoff);
        assert!(!s.should_auto_close(et(2024, 11, 26, 15, 20)));
        assert!(s.should_auto_close(et(2024, 11, 26, 15, 45)));
        assert!(s.should_auto_close(et(2024, 11, 26, 16, 0)));
        assert!(!s.should_auto_close(et(2024, 11, 26, 16, 30)));
        assert_eq!(s.minutes_to_close(et(2024, 11, 26, 15, 45)), Some(15));
    }

    #[test]
    fn test_handles_daylight_saving() {
        // July is EDT (UTC-4), January is EST (UTC-5)
        let s = session();
        let summer = "2024-07-16T13:45:00Z".parse::<DateTime<Utc>>().unwrap();
        let winter = "2024-01-16T14:45:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(s.is_trading_allowed(summer));
        assert!(s.is_trading_allowed(winter));
        assert_eq!(s.session_open_utc(summer).unwrap().to_rfc3339(), "2024-07-16T13:30:00+00:00");
    }
}
