// src/db.rs
use crate::config::DatabaseConfig;
use crate::models::{Holding, Transaction, User};
use crate::trade::{self, TradeError};
use chrono::Utc;
use log::{debug, info};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("this username already exists")]
    UsernameTaken,
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("corrupt value in {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },
}

/// What a committed trade left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeReceipt {
    pub transaction_id: i64,
    pub cash: Decimal,
    pub shares_held: i64,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL,
        cash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        symbol TEXT NOT NULL,
        shares INTEGER NOT NULL CHECK(shares <> 0),
        price TEXT NOT NULL,
        transacted_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portfolios (
        user_id INTEGER NOT NULL REFERENCES users(id),
        symbol TEXT NOT NULL,
        shares INTEGER NOT NULL CHECK(shares > 0),
        last_trans_id INTEGER NOT NULL REFERENCES transactions(id),
        PRIMARY KEY (user_id, symbol)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id)",
];

pub async fn init(config: &DatabaseConfig) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(log::LevelFilter::Debug);

    let pool_options = if config.url.contains(":memory:") {
        // Every connection would get its own empty database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };
    let pool = pool_options.connect_with(options).await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    info!("Database ready at {}", config.url);
    Ok(pool)
}

fn decimal(row: &SqliteRow, column: &'static str) -> Result<Decimal, DbError> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|_| DbError::Corrupt { column, value: raw })
}

fn user_from_row(row: &SqliteRow) -> Result<User, DbError> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        hash: row.try_get("hash")?,
        cash: decimal(row, "cash")?,
    })
}

pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    hash: &str,
    cash: Decimal,
) -> Result<i64, DbError> {
    let result = sqlx::query("INSERT INTO users (username, hash, cash) VALUES (?, ?, ?)")
        .bind(username)
        .bind(hash)
        .bind(cash.to_string())
        .execute(pool)
        .await;

    match result {
        Ok(done) => {
            let id = done.last_insert_rowid();
            info!("Registered user {} as id {}", username, id);
            Ok(id)
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::UsernameTaken),
        Err(e) => Err(e.into()),
    }
}

pub async fn find_user_by_name(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, DbError> {
    sqlx::query("SELECT id, username, hash, cash FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()
}

pub async fn find_user(pool: &SqlitePool, id: i64) -> Result<Option<User>, DbError> {
    sqlx::query("SELECT id, username, hash, cash FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()
}

pub async fn list_holdings(pool: &SqlitePool, user_id: i64) -> Result<Vec<Holding>, DbError> {
    let rows =
        sqlx::query("SELECT symbol, shares FROM portfolios WHERE user_id = ? ORDER BY symbol")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
    rows.iter()
        .map(|row| -> Result<Holding, DbError> {
            Ok(Holding {
                symbol: row.try_get("symbol")?,
                shares: row.try_get("shares")?,
            })
        })
        .collect()
}

pub async fn list_transactions(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<Transaction>, DbError> {
    let rows = sqlx::query(
        "SELECT id, symbol, shares, price, transacted_at FROM transactions \
         WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<Transaction, DbError> {
            Ok(Transaction {
                id: row.try_get("id")?,
                symbol: row.try_get("symbol")?,
                shares: row.try_get("shares")?,
                price: decimal(row, "price")?,
                transacted_at: row.try_get("transacted_at")?,
            })
        })
        .collect()
}

async fn current_cash(conn: &mut SqliteConnection, user_id: i64) -> Result<Decimal, DbError> {
    let row = sqlx::query("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::UserNotFound(user_id))?;
    decimal(&row, "cash")
}

async fn shares_held(
    conn: &mut SqliteConnection,
    user_id: i64,
    symbol: &str,
) -> Result<i64, DbError> {
    let shares: Option<i64> =
        sqlx::query_scalar("SELECT shares FROM portfolios WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(symbol)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(shares.unwrap_or(0))
}

async fn record_transaction(
    conn: &mut SqliteConnection,
    user_id: i64,
    symbol: &str,
    shares: i64,
    price: Decimal,
) -> Result<i64, DbError> {
    let done = sqlx::query(
        "INSERT INTO transactions (user_id, symbol, shares, price, transacted_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(symbol)
    .bind(shares)
    .bind(price.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(done.last_insert_rowid())
}

async fn set_cash(conn: &mut SqliteConnection, user_id: i64, cash: Decimal) -> Result<(), DbError> {
    sqlx::query("UPDATE users SET cash = ? WHERE id = ?")
        .bind(cash.to_string())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// Trades read then write, so they take the write lock up front. A deferred
// transaction would fail with SQLITE_BUSY on the upgrade instead of waiting
// out the busy timeout.

/// Buys `shares` of `symbol` at `price`. The cash check, history row,
/// holding and cash update commit together or not at all.
pub async fn execute_buy(
    pool: &SqlitePool,
    user_id: i64,
    symbol: &str,
    shares: i64,
    price: Decimal,
) -> Result<TradeReceipt, DbError> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    let cash = current_cash(&mut tx, user_id).await?;
    let cash = trade::buy(symbol, cash, shares, price)?;

    let transaction_id = record_transaction(&mut tx, user_id, symbol, shares, price).await?;
    sqlx::query(
        r#"
        INSERT INTO portfolios (user_id, symbol, shares, last_trans_id)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (user_id, symbol)
        DO UPDATE SET shares = shares + excluded.shares, last_trans_id = excluded.last_trans_id
        "#,
    )
    .bind(user_id)
    .bind(symbol)
    .bind(shares)
    .bind(transaction_id)
    .execute(&mut *tx)
    .await?;
    set_cash(&mut tx, user_id, cash).await?;
    let shares_held = shares_held(&mut tx, user_id, symbol).await?;

    tx.commit().await?;
    debug!(
        "User {} bought {} {} at {} (transaction {})",
        user_id, shares, symbol, price, transaction_id
    );
    Ok(TradeReceipt {
        transaction_id,
        cash,
        shares_held,
    })
}

/// Sells `shares` of `symbol` at `price`, dropping the holding once it
/// reaches zero.
pub async fn execute_sell(
    pool: &SqlitePool,
    user_id: i64,
    symbol: &str,
    shares: i64,
    price: Decimal,
) -> Result<TradeReceipt, DbError> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    let cash = current_cash(&mut tx, user_id).await?;
    let owned = shares_held(&mut tx, user_id, symbol).await?;
    let outcome = trade::sell(symbol, cash, owned, shares, price)?;

    let transaction_id = record_transaction(&mut tx, user_id, symbol, -shares, price).await?;
    if outcome.remaining == 0 {
        sqlx::query("DELETE FROM portfolios WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(symbol)
            .execute(&mut *tx)
            .await?;
    } else {
        sqlx::query(
            "UPDATE portfolios SET shares = ?, last_trans_id = ? WHERE user_id = ? AND symbol = ?",
        )
        .bind(outcome.remaining)
        .bind(transaction_id)
        .bind(user_id)
        .bind(symbol)
        .execute(&mut *tx)
        .await?;
    }
    set_cash(&mut tx, user_id, outcome.cash).await?;

    tx.commit().await?;
    debug!(
        "User {} sold {} {} at {} (transaction {})",
        user_id, shares, symbol, price, transaction_id
    );
    Ok(TradeReceipt {
        transaction_id,
        cash: outcome.cash,
        shares_held: outcome.remaining,
    })
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    init(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap()
}
