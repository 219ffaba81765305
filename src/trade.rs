// src/trade.rs
//! Cash and share balance rules for simulated trades.
//!
//! Everything here is pure arithmetic; `db` applies the results inside a SQL
//! transaction so the stored balances only ever move through these checks.
use crate::models::{Holding, PortfolioLine, Quote};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TradeError {
    #[error("shares must be a positive whole number")]
    InvalidShares,
    #[error("insufficient funds for buying {shares} shares of {symbol}")]
    InsufficientFunds { symbol: String, shares: i64 },
    #[error("insufficient shares for selling {shares} shares of {symbol}")]
    InsufficientShares { symbol: String, shares: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleOutcome {
    pub cash: Decimal,
    pub remaining: i64,
}

fn cost(shares: i64, price: Decimal) -> Decimal {
    Decimal::from(shares) * price
}

/// Returns the cash left after buying `shares` at `price`.
pub fn buy(
    symbol: &str,
    cash: Decimal,
    shares: i64,
    price: Decimal,
) -> Result<Decimal, TradeError> {
    if shares <= 0 {
        return Err(TradeError::InvalidShares);
    }
    let total = cost(shares, price);
    if cash >= total {
        Ok(cash - total)
    } else {
        Err(TradeError::InsufficientFunds {
            symbol: symbol.to_string(),
            shares,
        })
    }
}

pub fn sell(
    symbol: &str,
    cash: Decimal,
    owned: i64,
    shares: i64,
    price: Decimal,
) -> Result<SaleOutcome, TradeError> {
    if shares <= 0 {
        return Err(TradeError::InvalidShares);
    }
    if shares > owned {
        return Err(TradeError::InsufficientShares {
            symbol: symbol.to_string(),
            shares,
        });
    }
    Ok(SaleOutcome {
        cash: cash + cost(shares, price),
        remaining: owned - shares,
    })
}

/// Values each holding at its quoted price. Holdings without a quote are
/// valued at zero; the grand total adds the remaining cash.
pub fn value_portfolio(
    holdings: &[Holding],
    quotes: &HashMap<String, Quote>,
    cash: Decimal,
) -> (Vec<PortfolioLine>, Decimal) {
    let mut total = cash;
    let lines = holdings
        .iter()
        .map(|holding| {
            let (name, price) = match quotes.get(&holding.symbol) {
                Some(quote) => (quote.name.clone(), quote.price),
                None => (holding.symbol.clone(), Decimal::ZERO),
            };
            let line_total = cost(holding.shares, price);
            total += line_total;
            PortfolioLine {
                symbol: holding.symbol.clone(),
                name,
                shares: holding.shares,
                price,
                total: line_total,
            }
        })
        .collect();
    (lines, total)
}
