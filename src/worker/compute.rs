use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw per-instrument fields handed to the background worker. Wire payloads
/// may omit `symbol` (stats maps key by symbol) and `price`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StockData {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub price: f64,
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedStock {
    pub symbol: String,
    pub price: f64,
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
    pub change: f64,
    pub change_percent: f64,
    pub spread: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStats {
    pub avg_price: f64,
    pub max_price: f64,
    pub min_price: f64,
    pub total_value: f64,
}

fn round_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Derives change/spread fields for one instrument. Absent `last_price`,
/// `bid` and `ask` default to the current price.
pub fn process_stock(data: StockData) -> ProcessedStock {
    let price = data.price;
    let last_price = data.last_price.unwrap_or(price);
    let bid = data.bid.unwrap_or(price);
    let ask = data.ask.unwrap_or(price);

    let change = price - last_price;
    let change_percent = if last_price != 0.0 {
        change / last_price * 100.0
    } else {
        0.0
    };
    let spread = ask - bid;

    ProcessedStock {
        symbol: data.symbol,
        price: data.price,
        last_price: data.last_price,
        bid: data.bid,
        ask: data.ask,
        timestamp: data.timestamp,
        change: round_2(change),
        change_percent: round_2(change_percent),
        spread: round_4(spread),
    }
}

/// Aggregates statistics over a symbol map, ignoring non-positive prices.
/// Yields the all-zero result when no positive price remains.
pub fn calculate_stats(quotes: &HashMap<String, StockData>) -> MarketStats {
    let prices: Vec<f64> = quotes
        .values()
        .map(|data| data.price)
        .filter(|price| *price > 0.0)
        .collect();

    if prices.is_empty() {
        return MarketStats::default();
    }

    let total: f64 = prices.iter().sum();
    let avg = total / prices.len() as f64;
    let max = prices.iter().copied().fold(f64::MIN, f64::max);
    let min = prices.iter().copied().fold(f64::MAX, f64::min);

    MarketStats {
        avg_price: round_2(avg),
        max_price: round_2(max),
        min_price: round_2(min),
        total_value: round_2(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(symbol: &str, price: f64) -> StockData {
        StockData {
            symbol: symbol.to_string(),
            price,
            last_price: None,
            bid: None,
            ask: None,
            timestamp: None,
        }
    }

    #[test]
    fn computes_change_and_spread() {
        let processed = process_stock(StockData {
            symbol: "AAPL".to_string(),
            price: 100.0,
            last_price: Some(90.0),
            bid: Some(99.0),
            ask: Some(101.0),
            timestamp: None,
        });

        assert_eq!(processed.change, 10.0);
        assert_eq!(processed.change_percent, 11.11);
        assert_eq!(processed.spread, 2.0);
    }

    #[test]
    fn defaults_missing_fields_to_current_price() {
        let processed = process_stock(stock("AAPL", 50.0));

        assert_eq!(processed.change, 0.0);
        assert_eq!(processed.change_percent, 0.0);
        assert_eq!(processed.spread, 0.0);
    }

    #[test]
    fn zero_last_price_yields_zero_change_percent() {
        let processed = process_stock(StockData {
            last_price: Some(0.0),
            ..stock("AAPL", 50.0)
        });

        assert_eq!(processed.change, 50.0);
        assert_eq!(processed.change_percent, 0.0);
    }

    #[test]
    fn rounds_spread_to_four_decimals() {
        let processed = process_stock(StockData {
            bid: Some(1.00001),
            ask: Some(1.00004),
            ..stock("EUR/USD", 1.0)
        });

        assert_eq!(processed.spread, 0.0);

        let wide = process_stock(StockData {
            bid: Some(1.0),
            ask: Some(1.000250001),
            ..stock("EUR/USD", 1.0)
        });
        assert_eq!(wide.spread, 0.0003);
    }

    #[test]
    fn stats_ignore_non_positive_prices() {
        let mut quotes = HashMap::new();
        quotes.insert("A".to_string(), stock("A", 10.0));
        quotes.insert("B".to_string(), stock("B", 0.0));
        quotes.insert("C".to_string(), stock("C", 20.0));

        let stats = calculate_stats(&quotes);

        assert_eq!(stats.avg_price, 15.0);
        assert_eq!(stats.max_price, 20.0);
        assert_eq!(stats.min_price, 10.0);
        assert_eq!(stats.total_value, 30.0);
    }

    #[test]
    fn stats_are_all_zero_without_positive_prices() {
        let mut quotes = HashMap::new();
        quotes.insert("A".to_string(), stock("A", 0.0));
        quotes.insert("B".to_string(), stock("B", -5.0));

        assert_eq!(calculate_stats(&quotes), MarketStats::default());
        assert_eq!(calculate_stats(&HashMap::new()), MarketStats::default());
    }
}
