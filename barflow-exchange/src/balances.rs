//! Account balances — per-symbol available, hold, and borrowed amounts.
//!
//! Every mutation validates before it writes, so a failed operation leaves
//! no trace. Available and hold never go negative; equity per symbol is
//! `available + hold - borrowed`.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::ExchangeError;

/// One symbol's balance lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Balance {
    pub available: Decimal,
    pub hold: Decimal,
    pub borrowed: Decimal,
}

impl Balance {
    pub fn equity(&self) -> Decimal {
        self.available + self.hold - self.borrowed
    }
}

/// Multi-currency account ledger.
#[derive(Debug, Clone, Default)]
pub struct AccountBalances {
    symbols: BTreeMap<String, Balance>,
}

impl AccountBalances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed initial deposits.
    pub fn with_deposits(deposits: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        let mut balances = Self::new();
        for (symbol, amount) in deposits {
            balances.deposit(&symbol, amount);
        }
        balances
    }

    pub fn balance(&self, symbol: &str) -> Balance {
        self.symbols.get(symbol).copied().unwrap_or_default()
    }

    pub fn available(&self, symbol: &str) -> Decimal {
        self.balance(symbol).available
    }

    pub fn held(&self, symbol: &str) -> Decimal {
        self.balance(symbol).hold
    }

    pub fn borrowed(&self, symbol: &str) -> Decimal {
        self.balance(symbol).borrowed
    }

    /// Symbols with any non-zero line.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, &Balance)> {
        self.symbols.iter().map(|(symbol, balance)| (symbol.as_str(), balance))
    }

    pub fn deposit(&mut self, symbol: &str, amount: Decimal) {
        debug_assert!(!amount.is_sign_negative());
        self.entry(symbol).available += amount;
    }

    pub fn withdraw(&mut self, symbol: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let balance = self.balance(symbol);
        if balance.available < amount {
            return Err(self.overdraft(symbol, amount));
        }
        self.entry(symbol).available -= amount;
        Ok(())
    }

    /// Reserve `amount` of `symbol` against a live order.
    pub fn hold(&mut self, symbol: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let balance = self.balance(symbol);
        if balance.available < amount {
            return Err(self.overdraft(symbol, amount));
        }
        let entry = self.entry(symbol);
        entry.available -= amount;
        entry.hold += amount;
        Ok(())
    }

    /// Return a reservation to the available line.
    pub fn release(&mut self, symbol: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let balance = self.balance(symbol);
        if balance.hold < amount {
            return Err(self.overdraft(symbol, amount));
        }
        let entry = self.entry(symbol);
        entry.hold -= amount;
        entry.available += amount;
        Ok(())
    }

    /// Spend a reservation on a fill.
    pub fn consume_hold(&mut self, symbol: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let balance = self.balance(symbol);
        if balance.hold < amount {
            return Err(self.overdraft(symbol, amount));
        }
        self.entry(symbol).hold -= amount;
        Ok(())
    }

    /// Atomic two-leg transfer: debit `from`, credit `to`. Either both legs
    /// commit or neither does.
    pub fn transfer(
        &mut self,
        from_symbol: &str,
        from_amount: Decimal,
        to_symbol: &str,
        to_amount: Decimal,
    ) -> Result<(), ExchangeError> {
        if self.available(from_symbol) < from_amount {
            return Err(self.overdraft(from_symbol, from_amount));
        }
        self.entry(from_symbol).available -= from_amount;
        self.entry(to_symbol).available += to_amount;
        Ok(())
    }

    /// Credit borrowed funds: raises both `available` and `borrowed`.
    pub fn credit_borrowed(&mut self, symbol: &str, amount: Decimal) {
        let entry = self.entry(symbol);
        entry.available += amount;
        entry.borrowed += amount;
    }

    /// Settle repaid principal: lowers both `available` and `borrowed`.
    pub fn settle_borrowed(&mut self, symbol: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let balance = self.balance(symbol);
        if balance.available < amount || balance.borrowed < amount {
            return Err(self.overdraft(symbol, amount));
        }
        let entry = self.entry(symbol);
        entry.available -= amount;
        entry.borrowed -= amount;
        Ok(())
    }

    fn entry(&mut self, symbol: &str) -> &mut Balance {
        self.symbols.entry(symbol.to_string()).or_default()
    }

    fn overdraft(&self, symbol: &str, requested: Decimal) -> ExchangeError {
        ExchangeError::InsufficientBalance {
            symbol: symbol.to_string(),
            required: requested,
            available: self.available(symbol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded() -> AccountBalances {
        AccountBalances::with_deposits([("USDT".to_string(), dec!(1000))])
    }

    #[test]
    fn hold_then_release_restores_exactly() {
        let mut balances = funded();
        balances.hold("USDT", dec!(250)).unwrap();
        assert_eq!(balances.available("USDT"), dec!(750));
        assert_eq!(balances.held("USDT"), dec!(250));

        balances.release("USDT", dec!(250)).unwrap();
        assert_eq!(balances.balance("USDT"), Balance {
            available: dec!(1000),
            hold: dec!(0),
            borrowed: dec!(0),
        });
    }

    #[test]
    fn overdraft_is_rejected_without_state_change() {
        let mut balances = funded();
        let err = balances.hold("USDT", dec!(1000.01));
        assert!(matches!(err, Err(ExchangeError::InsufficientBalance { .. })));
        assert_eq!(balances.available("USDT"), dec!(1000));
        assert_eq!(balances.held("USDT"), dec!(0));
    }

    #[test]
    fn consume_hold_spends_the_reservation() {
        let mut balances = funded();
        balances.hold("USDT", dec!(100)).unwrap();
        balances.consume_hold("USDT", dec!(60)).unwrap();
        assert_eq!(balances.held("USDT"), dec!(40));
        assert_eq!(balances.available("USDT"), dec!(900));
    }

    #[test]
    fn transfer_debits_and_credits_atomically() {
        let mut balances = funded();
        balances.transfer("USDT", dec!(400), "BTC", dec!(0.01)).unwrap();
        assert_eq!(balances.available("USDT"), dec!(600));
        assert_eq!(balances.available("BTC"), dec!(0.01));

        let err = balances.transfer("USDT", dec!(601), "BTC", dec!(1));
        assert!(err.is_err());
        assert_eq!(balances.available("USDT"), dec!(600));
        assert_eq!(balances.available("BTC"), dec!(0.01));
    }

    #[test]
    fn borrowed_funds_raise_equity_neutral_lines() {
        let mut balances = funded();
        balances.credit_borrowed("USDT", dec!(500));
        let balance = balances.balance("USDT");
        assert_eq!(balance.available, dec!(1500));
        assert_eq!(balance.borrowed, dec!(500));
        // Borrowing is equity-neutral.
        assert_eq!(balance.equity(), dec!(1000));

        balances.settle_borrowed("USDT", dec!(500)).unwrap();
        assert_eq!(balances.balance("USDT").borrowed, dec!(0));
        assert_eq!(balances.balance("USDT").equity(), dec!(1000));
    }

    #[test]
    fn unknown_symbols_read_as_zero() {
        let balances = AccountBalances::new();
        assert_eq!(balances.available("ETH"), dec!(0));
        assert_eq!(balances.balance("ETH"), Balance::default());
    }
}
