//! Lending pool — borrowed balances accruing interest over simulated time.
//!
//! Installed only for margin exchange variants. Interest accrues pro-rata
//! per hour at a per-symbol rate; repayments settle accrued interest first,
//! then principal. A shutdown guard surfaces loans still open when the
//! dispatcher stops.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ExchangeError;

const SECONDS_PER_HOUR: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoanId(pub u64);

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loan#{}", self.0)
    }
}

/// A borrowed balance. Principal and accrued interest stay separate so a
/// repayment can be split deterministically.
#[derive(Debug, Clone)]
pub struct Loan {
    pub id: LoanId,
    pub symbol: String,
    pub principal: Decimal,
    pub accrued_interest: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    last_accrual: DateTime<Utc>,
}

impl Loan {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Principal plus accrued interest.
    pub fn outstanding(&self) -> Decimal {
        self.principal + self.accrued_interest
    }
}

/// How a repayment amount was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Repayment {
    pub interest_paid: Decimal,
    pub principal_paid: Decimal,
}

/// Margin lending pool with per-symbol hourly rates and optional per-symbol
/// borrow limits (the isolated-margin variant caps each symbol; the
/// cross-margin variant leaves limits empty).
pub struct LendingPool {
    default_hourly_rate: Decimal,
    hourly_rates: BTreeMap<String, Decimal>,
    borrow_limits: BTreeMap<String, Decimal>,
    loans: BTreeMap<LoanId, Loan>,
    next_id: u64,
}

impl LendingPool {
    pub fn new(default_hourly_rate: Decimal) -> Self {
        Self {
            default_hourly_rate,
            hourly_rates: BTreeMap::new(),
            loans: BTreeMap::new(),
            borrow_limits: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn with_rate(mut self, symbol: impl Into<String>, hourly_rate: Decimal) -> Self {
        self.hourly_rates.insert(symbol.into(), hourly_rate);
        self
    }

    pub fn with_borrow_limit(mut self, symbol: impl Into<String>, limit: Decimal) -> Self {
        self.borrow_limits.insert(symbol.into(), limit);
        self
    }

    fn rate(&self, symbol: &str) -> Decimal {
        self.hourly_rates.get(symbol).copied().unwrap_or(self.default_hourly_rate)
    }

    /// Open a loan, crediting nothing: the caller owns the balance side.
    pub fn borrow(
        &mut self,
        symbol: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LoanId, ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder("loan amount must be positive".into()));
        }
        if let Some(limit) = self.borrow_limits.get(symbol) {
            let outstanding = self.outstanding(symbol);
            if outstanding + amount > *limit {
                return Err(ExchangeError::InsufficientBalance {
                    symbol: symbol.to_string(),
                    required: outstanding + amount,
                    available: *limit,
                });
            }
        }

        let id = LoanId(self.next_id);
        self.next_id += 1;
        self.loans.insert(id, Loan {
            id,
            symbol: symbol.to_string(),
            principal: amount,
            accrued_interest: Decimal::ZERO,
            opened_at: now,
            closed_at: None,
            last_accrual: now,
        });
        Ok(id)
    }

    /// Accrue interest on every open loan up to `until`.
    pub fn accrue(&mut self, until: DateTime<Utc>) {
        let hourly_rates = &self.hourly_rates;
        let default_hourly_rate = self.default_hourly_rate;
        for loan in self.loans.values_mut() {
            if !loan.is_open() || until <= loan.last_accrual {
                continue;
            }
            let seconds = (until - loan.last_accrual).num_seconds();
            let hours = Decimal::from(seconds) / Decimal::from(SECONDS_PER_HOUR);
            let rate = hourly_rates.get(&loan.symbol).copied().unwrap_or(default_hourly_rate);
            loan.accrued_interest += loan.principal * rate * hours;
            loan.last_accrual = until;
        }
    }

    /// Apply a repayment: interest first, then principal. Paying the full
    /// outstanding amount closes the loan.
    pub fn repay(
        &mut self,
        id: LoanId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Repayment, ExchangeError> {
        self.accrue(now);

        let loan = self.loans.get_mut(&id).ok_or(ExchangeError::LoanNotFound(id))?;
        if !loan.is_open() {
            return Err(ExchangeError::InvalidOrder(format!("{id} is already closed")));
        }
        let outstanding = loan.outstanding();
        if amount <= Decimal::ZERO || amount > outstanding {
            return Err(ExchangeError::InvalidOrder(format!(
                "repayment {amount} outside (0, {outstanding}]"
            )));
        }

        let interest_paid = amount.min(loan.accrued_interest);
        let principal_paid = amount - interest_paid;
        loan.accrued_interest -= interest_paid;
        loan.principal -= principal_paid;
        if loan.outstanding().is_zero() {
            loan.closed_at = Some(now);
        }
        Ok(Repayment { interest_paid, principal_paid })
    }

    pub fn loan(&self, id: LoanId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    /// Total outstanding principal for a symbol.
    pub fn outstanding(&self, symbol: &str) -> Decimal {
        self.loans
            .values()
            .filter(|loan| loan.is_open() && loan.symbol == symbol)
            .map(|loan| loan.principal)
            .sum()
    }

    pub fn open_loans(&self) -> impl Iterator<Item = &Loan> {
        self.loans.values().filter(|loan| loan.is_open())
    }

    pub fn has_open_loans(&self) -> bool {
        self.open_loans().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn pool() -> LendingPool {
        // 0.01% per hour.
        LendingPool::new(dec!(0.0001))
    }

    #[test]
    fn interest_accrues_per_hour() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(1000), at(0)).unwrap();

        pool.accrue(at(3));
        let loan = pool.loan(id).unwrap();
        // 1000 * 0.0001 * 3h = 0.3
        assert_eq!(loan.accrued_interest, dec!(0.3));
        assert_eq!(loan.outstanding(), dec!(1000.3));
    }

    #[test]
    fn accrual_is_idempotent_at_the_same_instant() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(1000), at(0)).unwrap();
        pool.accrue(at(2));
        pool.accrue(at(2));
        assert_eq!(pool.loan(id).unwrap().accrued_interest, dec!(0.2));
    }

    #[test]
    fn repay_settles_interest_before_principal() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(1000), at(0)).unwrap();

        let split = pool.repay(id, dec!(500), at(1)).unwrap();
        assert_eq!(split.interest_paid, dec!(0.1));
        assert_eq!(split.principal_paid, dec!(499.9));

        let loan = pool.loan(id).unwrap();
        assert!(loan.is_open());
        assert_eq!(loan.principal, dec!(500.1));
        assert_eq!(loan.accrued_interest, dec!(0));
    }

    #[test]
    fn full_repayment_closes_the_loan() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(1000), at(0)).unwrap();
        pool.accrue(at(2));

        let outstanding = pool.loan(id).unwrap().outstanding();
        pool.repay(id, outstanding, at(2)).unwrap();

        let loan = pool.loan(id).unwrap();
        assert!(!loan.is_open());
        assert_eq!(loan.outstanding(), dec!(0));
        assert_eq!(pool.outstanding("USDT"), dec!(0));
        assert!(!pool.has_open_loans());
    }

    #[test]
    fn overpayment_is_rejected() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(100), at(0)).unwrap();
        assert!(pool.repay(id, dec!(200), at(0)).is_err());
        assert_eq!(pool.loan(id).unwrap().principal, dec!(100));
    }

    #[test]
    fn borrow_limits_cap_the_symbol() {
        let mut pool = LendingPool::new(dec!(0.0001)).with_borrow_limit("USDT", dec!(500));
        pool.borrow("USDT", dec!(400), at(0)).unwrap();
        let err = pool.borrow("USDT", dec!(200), at(0));
        assert!(matches!(err, Err(ExchangeError::InsufficientBalance { .. })));
        // Other symbols are unconstrained.
        assert!(pool.borrow("BTC", dec!(5), at(0)).is_ok());
    }

    #[test]
    fn closed_loans_reject_repayment() {
        let mut pool = pool();
        let id = pool.borrow("USDT", dec!(100), at(0)).unwrap();
        pool.repay(id, dec!(100), at(0)).unwrap();
        assert!(pool.repay(id, dec!(1), at(0)).is_err());
    }
}
