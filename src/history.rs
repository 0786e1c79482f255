use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_HISTORY_INTERVAL_MS: i64 = 1_000;
pub const DEFAULT_MAX_HISTORY_POINTS: usize = 60;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub price: f64,
    pub symbol: String,
}

/// Rolling price history with per-symbol time throttling.
///
/// The buffer is one flat sequence filtered to the accepted symbol at write
/// time, with a global capacity cap. Accepting a point for one symbol evicts
/// points held for other symbols.
#[derive(Debug)]
pub struct PriceHistory {
    points: Vec<HistoryPoint>,
    last_prices: HashMap<String, f64>,
    last_accepted_ms: HashMap<String, i64>,
    interval_ms: i64,
    max_points: usize,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_INTERVAL_MS, DEFAULT_MAX_HISTORY_POINTS)
    }
}

impl PriceHistory {
    pub fn new(interval_ms: i64, max_points: usize) -> Self {
        Self {
            points: Vec::with_capacity(max_points),
            last_prices: HashMap::new(),
            last_accepted_ms: HashMap::new(),
            interval_ms,
            max_points,
        }
    }

    /// Records a price observation at `now_ms`. Observations inside the
    /// throttle window only refresh the last-known-price side value; the
    /// first observation in each window becomes a history point. Returns
    /// whether a point was accepted.
    pub fn add_point(&mut self, symbol: &str, price: f64, now_ms: i64) -> bool {
        if let Some(last_accepted) = self.last_accepted_ms.get(symbol) {
            if now_ms - last_accepted < self.interval_ms {
                self.last_prices.insert(symbol.to_string(), price);
                return false;
            }
        }

        self.last_prices.insert(symbol.to_string(), price);
        self.last_accepted_ms.insert(symbol.to_string(), now_ms);

        self.points.retain(|point| point.symbol == symbol);
        self.points.push(HistoryPoint {
            timestamp: now_ms,
            price,
            symbol: symbol.to_string(),
        });

        if self.points.len() > self.max_points {
            let overflow = self.points.len() - self.max_points;
            self.points.drain(0..overflow);
        }

        true
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    /// Accepted points, insertion order = acceptance order.
    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.last_prices.clear();
        self.last_accepted_ms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_one_point_per_spaced_tick() {
        let mut history = PriceHistory::new(1_000, 60);

        for step in 0..10 {
            let accepted = history.add_point("BTC/USD", 100.0 + step as f64, step * 1_000);
            assert!(accepted);
        }

        assert_eq!(history.points().len(), 10);
        assert_eq!(history.points()[0].price, 100.0);
        assert_eq!(history.points()[9].price, 109.0);
    }

    #[test]
    fn throttles_ticks_inside_window() {
        let mut history = PriceHistory::new(1_000, 60);

        assert!(history.add_point("BTC/USD", 100.0, 0));
        assert!(!history.add_point("BTC/USD", 101.0, 400));
        assert!(!history.add_point("BTC/USD", 102.0, 999));
        assert!(history.add_point("BTC/USD", 103.0, 1_000));

        assert_eq!(history.points().len(), 2);
        assert_eq!(history.points()[0].price, 100.0);
        assert_eq!(history.points()[1].price, 103.0);
    }

    #[test]
    fn throttled_ticks_update_last_known_price() {
        let mut history = PriceHistory::new(1_000, 60);

        history.add_point("BTC/USD", 100.0, 0);
        history.add_point("BTC/USD", 101.5, 250);

        assert_eq!(history.last_price("BTC/USD"), Some(101.5));
        assert_eq!(history.points().len(), 1);
    }

    #[test]
    fn drops_oldest_points_past_capacity() {
        let mut history = PriceHistory::new(1_000, 5);

        for step in 0..8 {
            history.add_point("BTC/USD", step as f64, step * 1_000);
        }

        assert_eq!(history.points().len(), 5);
        assert_eq!(history.points()[0].price, 3.0);
        assert_eq!(history.points()[4].price, 7.0);
    }

    #[test]
    fn write_filters_buffer_to_accepted_symbol() {
        let mut history = PriceHistory::new(1_000, 60);

        history.add_point("BTC/USD", 100.0, 0);
        history.add_point("ETH/BTC", 0.05, 0);

        assert_eq!(history.points().len(), 1);
        assert_eq!(history.points()[0].symbol, "ETH/BTC");
        assert_eq!(history.last_price("BTC/USD"), Some(100.0));
    }

    #[test]
    fn clear_resets_points_and_throttle_state() {
        let mut history = PriceHistory::new(1_000, 60);

        history.add_point("BTC/USD", 100.0, 0);
        history.clear();

        assert!(history.points().is_empty());
        assert_eq!(history.last_price("BTC/USD"), None);
        // a fresh point right after clear is accepted again at t=0
        assert!(history.add_point("BTC/USD", 101.0, 0));
    }
}
