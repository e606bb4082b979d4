//! Broker connectivity capability.
//!
//! Connectivity internals live elsewhere; restore reconciliation and the
//! DR drill only need this narrow surface.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: String,
    pub equity: f64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
}

pub trait Broker {
    fn initialize(&mut self) -> bool;
    fn account_info(&self) -> Option<Account>;
    fn positions(&self) -> Vec<Position>;
    fn market_data_available(&self) -> bool;
    fn shutdown(&mut self);
}

/// No broker configured. Everything degrades to "unavailable".
#[derive(Default)]
pub struct NullBroker;

impl Broker for NullBroker {
    fn initialize(&mut self) -> bool {
        false
    }

    fn account_info(&self) -> Option<Account> {
        None
    }

    fn positions(&self) -> Vec<Position> {
        Vec::new()
    }

    fn market_data_available(&self) -> bool {
        false
    }

    fn shutdown(&mut self) {}
}

/// Scripted broker for drills and tests.
pub struct StubBroker {
    pub connected: bool,
    pub equity: f64,
    pub held: BTreeMap<String, Position>,
}

impl StubBroker {
    pub fn with_positions(positions: &[(&str, f64, f64)]) -> Self {
        let held = positions
            .iter()
            .map(|(symbol, quantity, avg_price)| {
                (
                    symbol.to_string(),
                    Position {
                        symbol: symbol.to_string(),
                        quantity: *quantity,
                        avg_price: *avg_price,
                    },
                )
            })
            .collect();
        Self {
            connected: false,
            equity: 10_000.0,
            held,
        }
    }
}

impl Broker for StubBroker {
    fn initialize(&mut self) -> bool {
        self.connected = true;
        true
    }

    fn account_info(&self) -> Option<Account> {
        self.connected.then(|| Account {
            account_id: "drill-stub".to_string(),
            equity: self.equity,
            currency: "USDT".to_string(),
        })
    }

    fn positions(&self) -> Vec<Position> {
        self.held.values().cloned().collect()
    }

    fn market_data_available(&self) -> bool {
        self.connected
    }

    fn shutdown(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_broker_degrades() {
        let mut broker = NullBroker;
        assert!(!broker.initialize());
        assert!(broker.account_info().is_none());
        assert!(broker.positions().is_empty());
        assert!(!broker.market_data_available());
    }

    #[test]
    fn test_stub_broker_lifecycle() {
        let mut broker = StubBroker::with_positions(&[("BTCUSDT", 0.6, 30_000.0)]);
        assert!(broker.account_info().is_none());
        assert!(broker.initialize());
        assert!(broker.market_data_available());
        assert_eq!(broker.positions().len(), 1);
        broker.shutdown();
        assert!(broker.account_info().is_none());
    }
}
