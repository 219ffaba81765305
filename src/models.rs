// src/models.rs
use crate::money::usd;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hash: String,
    pub cash: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub symbol: String,
    pub shares: i64,
}

/// One row of the trade history. `shares` is negative for sales.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: i64,
    pub symbol: String,
    pub shares: i64,
    pub price: Decimal,
    pub transacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioLine {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Decimal,
    pub total: Decimal,
}

// Form bodies. Fields are optional so a missing field surfaces as a
// readable error instead of a body decode rejection.

#[derive(Debug, Default, Deserialize)]
pub struct RegisterForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub confirmation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteForm {
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TradeForm {
    pub symbol: Option<String>,
    pub shares: Option<String>,
}

// Response views, with money already formatted for display.

#[derive(Debug, Serialize)]
pub struct PortfolioRow {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: String,
    pub total: String,
}

impl From<&PortfolioLine> for PortfolioRow {
    fn from(line: &PortfolioLine) -> Self {
        PortfolioRow {
            symbol: line.symbol.clone(),
            name: line.name.clone(),
            shares: line.shares,
            price: usd(line.price),
            total: usd(line.total),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PortfolioView {
    pub stocks: Vec<PortfolioRow>,
    pub cash: String,
    pub total: String,
}

#[derive(Debug, Serialize)]
pub struct QuoteView {
    pub symbol: String,
    pub name: String,
    pub price: String,
    pub message: String,
}

impl From<Quote> for QuoteView {
    fn from(quote: Quote) -> Self {
        let price = usd(quote.price);
        QuoteView {
            message: format!("Current share price of {}: {}", quote.name, price),
            symbol: quote.symbol,
            name: quote.name,
            price,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TradeView {
    pub status: &'static str,
    pub message: String,
    pub cash: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryRow {
    pub id: i64,
    pub symbol: String,
    pub shares: i64,
    pub price: String,
    pub transacted_at: DateTime<Utc>,
}

impl From<Transaction> for HistoryRow {
    fn from(t: Transaction) -> Self {
        HistoryRow {
            id: t.id,
            symbol: t.symbol.to_uppercase(),
            shares: t.shares,
            price: usd(t.price),
            transacted_at: t.transacted_at,
        }
    }
}
