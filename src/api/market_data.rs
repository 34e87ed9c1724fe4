use crate::api::tastytrade::{flexible_f64, TastyTradeClient};
use crate::models::{mid_or_side, OptionContract, OptionType};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

/// Call strikes are taken from [price, price * 1.03]
const CALL_STRIKE_BAND: f64 = 1.03;
/// Put strikes are taken from [price * 0.97, price]
const PUT_STRIKE_BAND: f64 = 0.97;

// ============== Response Types ==============

/// Row of `/market-data/by-type`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MarketQuote {
    pub symbol: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub bid: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub ask: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub last: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub volume: f64,
    #[serde(default, rename = "open-interest", deserialize_with = "flexible_f64")]
    pub open_interest: f64,
}

impl MarketQuote {
    /// Last trade, else mid, else whichever side is quoted
    pub fn price(&self) -> Option<f64> {
        if self.last > 0.0 {
            Some(self.last)
        } else {
            mid_or_side(self.bid, self.ask)
        }
    }

    /// Absolute spread; None for a one-sided market
    pub fn spread(&self) -> Option<f64> {
        (self.bid > 0.0 && self.ask > 0.0).then(|| self.ask - self.bid)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ChainStrike {
    #[serde(deserialize_with = "flexible_f64")]
    pub strike_price: f64,
    #[serde(default)]
    pub call: Option<String>,
    #[serde(default)]
    pub put: Option<String>,
    #[serde(default)]
    pub call_streamer_symbol: Option<String>,
    #[serde(default)]
    pub put_streamer_symbol: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ChainExpiration {
    pub expiration_date: NaiveDate,
    #[serde(default)]
    pub days_to_expiration: Option<i64>,
    #[serde(default)]
    pub strikes: Vec<ChainStrike>,
}

/// Instrument details carrying the DXLink symbol
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct InstrumentDetails {
    pub symbol: String,
    #[serde(default)]
    pub streamer_symbol: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ExpirationList {
    #[serde(default)]
    expirations: Vec<ChainExpiration>,
}

/// Liquidity thresholds applied before trading an option
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidityCriteria {
    pub min_volume: f64,
    pub min_open_interest: f64,
    pub max_spread: f64,
}

/// Pick the contract for a direction from a nested chain
///
/// Uses the nearest expiration, orders strikes by distance from `price`, and takes
/// the first strike inside the call/put band, else the nearest strike.
pub fn select_contract(
    expirations: &[ChainExpiration],
    option_type: OptionType,
    price: f64,
) -> Option<OptionContract> {
    let nearest = expirations.iter().min_by_key(|e| e.expiration_date)?;

    let mut strikes: Vec<&ChainStrike> = nearest.strikes.iter().collect();
    strikes.sort_by(|a, b| {
        (a.strike_price - price)
            .abs()
            .total_cmp(&(b.strike_price - price).abs())
    });

    let in_band = |s: &&ChainStrike| match option_type {
        OptionType::Call => s.strike_price >= price && s.strike_price <= price * CALL_STRIKE_BAND,
        OptionType::Put => s.strike_price <= price && s.strike_price >= price * PUT_STRIKE_BAND,
    };

    let chosen = strikes
        .iter()
        .copied()
        .find(in_band)
        .or_else(|| strikes.first().copied())?;

    let symbol = match option_type {
        OptionType::Call => chosen.call.clone(),
        OptionType::Put => chosen.put.clone(),
    }
    .filter(|s| !s.is_empty())?;

    let underlying = OptionContract::from_occ(&symbol)
        .map(|c| c.underlying)
        .unwrap_or_default();

    Some(OptionContract {
        symbol,
        underlying,
        option_type,
        strike: chosen.strike_price,
        expiration: nearest.expiration_date,
    })
}

/// Extract expirations from either `data.expirations` or `data.items[*].expirations`
fn parse_expirations(data: &Value) -> Result<Vec<ChainExpiration>> {
    if data.get("expirations").is_some() {
        let list: ExpirationList =
            serde_json::from_value(data.clone()).context("Failed to parse option chain")?;
        return Ok(list.expirations);
    }

    let mut expirations = Vec::new();
    if let Some(items) = data.get("items").and_then(|v| v.as_array()) {
        for item in items {
            let list: ExpirationList =
                serde_json::from_value(item.clone()).context("Failed to parse option chain")?;
            expirations.extend(list.expirations);
        }
    }
    Ok(expirations)
}

impl TastyTradeClient {
    /// Quotes for several symbols of one instrument type (`equity`, `equity-option`, ...)
    pub async fn get_market_quotes(
        &self,
        symbols: &[&str],
        instrument_type: &str,
    ) -> Result<Vec<MarketQuote>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let endpoint = format!(
            "/market-data/by-type?{}={}",
            instrument_type,
            symbols.join(",")
        );
        let body = self.get_json(&endpoint).await?;
        let items = body
            .pointer("/data/items")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));

        serde_json::from_value(items).context("Failed to parse market quotes")
    }

    /// Current price of an equity (last, else mid, else bid/ask)
    pub async fn get_current_price(&self, symbol: &str) -> Result<Option<f64>> {
        let quotes = self.get_market_quotes(&[symbol], "equity").await?;
        Ok(quotes.first().and_then(MarketQuote::price))
    }

    /// Current price of an option contract
    pub async fn get_option_price(&self, option_symbol: &str) -> Result<Option<f64>> {
        let quotes = self
            .get_market_quotes(&[option_symbol], "equity-option")
            .await?;
        Ok(quotes.first().and_then(MarketQuote::price))
    }

    pub async fn get_equity_details(&self, symbol: &str) -> Result<InstrumentDetails> {
        let body = self
            .get_json(&format!("/instruments/equities/{}", symbol))
            .await?;
        serde_json::from_value(body["data"].clone()).context("Failed to parse equity details")
    }

    pub async fn get_option_details(&self, option_symbol: &str) -> Result<InstrumentDetails> {
        let body = self
            .get_json(&format!("/instruments/equity-options/{}", option_symbol))
            .await?;
        serde_json::from_value(body["data"].clone()).context("Failed to parse option details")
    }

    /// DXLink symbol for an equity or option, falling back to the plain symbol
    pub async fn get_streamer_symbol(&self, symbol: &str, is_option: bool) -> String {
        let details = if is_option {
            self.get_option_details(symbol).await
        } else {
            self.get_equity_details(symbol).await
        };

        match details {
            Ok(InstrumentDetails {
                streamer_symbol: Some(streamer),
                ..
            }) if !streamer.is_empty() => streamer,
            Ok(_) => symbol.to_string(),
            Err(e) => {
                tracing::debug!("No streamer symbol for {}: {}", symbol, e);
                symbol.to_string()
            }
        }
    }

    /// Expirations and strikes for an underlying
    pub async fn get_option_chain(&self, symbol: &str) -> Result<Vec<ChainExpiration>> {
        let body = self
            .get_json(&format!("/option-chains/{}/nested", symbol))
            .await?;
        parse_expirations(&body["data"])
    }

    /// Option contract to trade for a direction at the current underlying price
    pub async fn find_option_contract(
        &self,
        symbol: &str,
        option_type: OptionType,
        price: f64,
    ) -> Result<Option<OptionContract>> {
        let expirations = self.get_option_chain(symbol).await?;
        if expirations.is_empty() {
            tracing::warn!("No option expirations for {}", symbol);
            return Ok(None);
        }
        Ok(select_contract(&expirations, option_type, price))
    }

    /// Apply volume / open-interest / spread thresholds
    pub async fn check_liquidity(
        &self,
        symbol: &str,
        option_symbol: Option<&str>,
        criteria: &LiquidityCriteria,
    ) -> Result<bool> {
        let underlying = self.get_market_quotes(&[symbol], "equity").await?;
        if let Some(quote) = underlying.first() {
            if quote.volume < criteria.min_volume {
                tracing::info!(
                    "{} fails liquidity: volume {:.0} < {:.0}",
                    symbol,
                    quote.volume,
                    criteria.min_volume
                );
                return Ok(false);
            }
        }

        if let Some(option_symbol) = option_symbol {
            let quotes = self
                .get_market_quotes(&[option_symbol], "equity-option")
                .await?;
            if let Some(option) = quotes.first() {
                if option.open_interest < criteria.min_open_interest {
                    tracing::info!(
                        "{} fails liquidity: open interest {:.0} < {:.0}",
                        option_symbol,
                        option.open_interest,
                        criteria.min_open_interest
                    );
                    return Ok(false);
                }
                let spread = option.spread().unwrap_or(f64::INFINITY);
                if spread > criteria.max_spread {
                    tracing::info!(
                        "{} fails liquidity: spread {:.2} > {:.2}",
                        option_symbol,
                        spread,
                        criteria.max_spread
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> Vec<ChainExpiration> {
        serde_json::from_value(json!([
            {
                "expiration-date": "2024-12-06",
                "strikes": [
                    {"strike-price": "100.0", "call": "SPY   241206C00100000", "put": "SPY   241206P00100000"}
                ]
            },
            {
                "expiration-date": "2024-11-29",
                "strikes": [
                    {"strike-price": "98.0", "call": "SPY   241129C00098000", "put": "SPY   241129P00098000"},
                    {"strike-price": "100.0", "call": "SPY   241129C00100000", "put": "SPY   241129P00100000"},
                    {"strike-price": "101.0", "call": "SPY   241129C00101000", "put": "SPY   241129P00101000"},
                    {"strike-price": "105.0", "call": "SPY   241129C00105000", "put": "SPY   241129P00105000"}
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_select_call_above_price() {
        let contract = select_contract(&chain(), OptionType::Call, 100.4).unwrap();
        assert_eq!(contract.strike, 101.0);
        assert_eq!(contract.symbol, "SPY   241129C00101000");
        assert_eq!(contract.underlying, "SPY");
        assert_eq!(contract.expiration, NaiveDate::from_ymd_opt(2024, 11, 29).unwrap());
    }

    #[test]
    fn test_select_put_below_price() {
        let contract = select_contract(&chain(), OptionType::Put, 100.4).unwrap();
        assert_eq!(contract.strike, 100.0);
        assert_eq!(contract.option_type, OptionType::Put);
    }

    #[test]
    fn test_select_falls_back_to_nearest() {
        // Nothing within 3% above 90, nearest strike is 98
        let contract = select_contract(&chain(), OptionType::Call, 90.0).unwrap();
        assert_eq!(contract.strike, 98.0);
    }

    #[test]
    fn test_select_empty_chain() {
        assert!(select_contract(&[], OptionType::Call, 100.0).is_none());
    }

    #[test]
    fn test_parse_items_shape() {
        let data = json!({
            "items": [{
                "underlying-symbol": "SPY",
                "expirations": [{"expiration-date": "2024-11-29", "strikes": []}]
            }]
        });
        let expirations = parse_expirations(&data).unwrap();
        assert_eq!(expirations.len(), 1);
    }

    #[test]
    fn test_market_quote_price_priority() {
        let quote: MarketQuote = serde_json::from_value(json!({
            "symbol": "SPY", "bid": "99.0", "ask": "101.0", "last": null
        }))
        .unwrap();
        assert_eq!(quote.price(), Some(100.0));
        assert_eq!(quote.spread(), Some(2.0));

        let quote: MarketQuote = serde_json::from_value(json!({
            "symbol": "SPY", "bid": "99.0", "ask": "101.0", "last": "100.5"
        }))
        .unwrap();
        assert_eq!(quote.price(), Some(100.5));
    }
}
