// src/quotes.rs
use crate::models::Quote;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("unreadable provider response: {0}")]
    Parse(String),
    #[error("provider refused the request: {0}")]
    Provider(String),
}

/// Source of current share prices.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// `Ok(None)` means the provider does not know `symbol`.
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError>;
}

/// Trims and uppercases a ticker, rejecting anything that cannot be one.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(symbol)
}

/// Looks up each symbol once. Symbols the provider no longer knows are left
/// out of the map.
pub async fn lookup_all(
    source: &dyn QuoteSource,
    symbols: &[String],
) -> Result<HashMap<String, Quote>, QuoteError> {
    let mut quotes = HashMap::new();
    for symbol in symbols {
        if quotes.contains_key(symbol) {
            continue;
        }
        if let Some(quote) = source.lookup(symbol).await? {
            quotes.insert(symbol.clone(), quote);
        }
    }
    Ok(quotes)
}

#[derive(Deserialize, Default)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: Option<String>,
    #[serde(rename = "05. price")]
    price: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    global_quote: Option<GlobalQuote>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

/// Alpha Vantage `GLOBAL_QUOTE` client.
pub struct AlphaVantage {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantage {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl QuoteSource for AlphaVantage {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let url = format!("{}/query", self.base_url);
        debug!("Looking up {} at {}", symbol, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(QuoteError::Status(response.status()));
        }
        let body = response.text().await?;
        let quote = parse_global_quote(symbol, &body)?;
        info!("Quote for {}: {:?}", symbol, quote.as_ref().map(|q| q.price));
        Ok(quote)
    }
}

fn parse_global_quote(symbol: &str, body: &str) -> Result<Option<Quote>, QuoteError> {
    let parsed: GlobalQuoteResponse =
        serde_json::from_str(body).map_err(|e| QuoteError::Parse(e.to_string()))?;

    if let Some(message) = parsed.note.or(parsed.information) {
        return Err(QuoteError::Provider(message));
    }
    if parsed.error_message.is_some() {
        return Ok(None);
    }

    let quote = parsed.global_quote.unwrap_or_default();
    let (Some(quoted_symbol), Some(price)) = (quote.symbol, quote.price) else {
        return Ok(None);
    };
    let price = Decimal::from_str(price.trim())
        .map_err(|e| QuoteError::Parse(format!("price {:?}: {}", price, e)))?;
    if price <= Decimal::ZERO {
        return Err(QuoteError::Parse(format!("non-positive price for {}", symbol)));
    }

    let quoted_symbol = quoted_symbol.to_uppercase();
    Ok(Some(Quote {
        name: quoted_symbol.clone(),
        symbol: quoted_symbol,
        price,
    }))
}
