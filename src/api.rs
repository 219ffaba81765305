// src/api.rs
use crate::auth::{hash_password, verify_password, with_user, Sessions};
use crate::db;
use crate::error::{handle_rejection, AppError};
use crate::models::{
    HistoryRow, LoginForm, PortfolioRow, PortfolioView, QuoteForm, QuoteView, RegisterForm,
    TradeForm, TradeView,
};
use crate::money::usd;
use crate::quotes::{lookup_all, normalize_symbol, QuoteSource};
use crate::trade::{self, TradeError};
use log::{error, info};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES, PRAGMA, SET_COOKIE};
use warp::http::Uri;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_FORM_BYTES: u64 = 16 * 1024;

pub struct AppState {
    pub pool: SqlitePool,
    pub quotes: Arc<dyn QuoteSource>,
    pub sessions: Arc<Sessions>,
    pub starting_cash: Decimal,
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let user = with_user(state.sessions.clone());

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form::<RegisterForm>())
        .and_then(register_handler);

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form::<LoginForm>())
        .and_then(login_handler);

    let logout = warp::path!("logout")
        .and(warp::get())
        .and_then(logout_handler);

    let index = warp::path::end()
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(index_handler);

    let quote = warp::path!("quote")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(form::<QuoteForm>())
        .and_then(quote_handler);

    let buy = warp::path!("buy")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(form::<TradeForm>())
        .and_then(buy_handler);

    let sellable = warp::path!("sell")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(sellable_handler);

    let sell = warp::path!("sell")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(form::<TradeForm>())
        .and_then(sell_handler);

    let history = warp::path!("history")
        .and(warp::get())
        .and(user)
        .and(with_state(state))
        .and_then(history_handler);

    register
        .or(login)
        .or(logout)
        .or(index)
        .or(quote)
        .or(buy)
        .or(sellable)
        .or(sell)
        .or(history)
        .recover(handle_rejection)
        .with(warp::reply::with::headers(no_cache_headers()))
        .with(warp::log("finance::api"))
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn form<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_FORM_BYTES).and(warp::body::form())
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn see_other(location: &'static str) -> Response {
    warp::redirect::see_other(Uri::from_static(location)).into_response()
}

fn with_cookie(mut response: Response, cookie: &str) -> Result<Response, Rejection> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|e| AppError::Internal(format!("bad cookie header: {}", e)))?;
    response.headers_mut().append(SET_COOKIE, value);
    Ok(response)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_trade(form: TradeForm) -> Result<(String, i64), AppError> {
    let symbol = form
        .symbol
        .as_deref()
        .and_then(normalize_symbol)
        .ok_or_else(|| AppError::BadRequest("must provide a valid symbol".into()))?;
    let shares = form
        .shares
        .as_deref()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .ok_or(TradeError::InvalidShares)?;
    Ok((symbol, shares))
}

async fn register_handler(
    state: Arc<AppState>,
    form: RegisterForm,
) -> Result<Response, Rejection> {
    let username = non_blank(form.username)
        .ok_or_else(|| AppError::BadRequest("must provide username".into()))?;
    let password = non_blank(form.password)
        .ok_or_else(|| AppError::BadRequest("must provide password".into()))?;
    if form.confirmation.as_deref() != Some(password.as_str()) {
        let mismatch = AppError::BadRequest("the password and confirmation don't match".into());
        return Err(mismatch.into());
    }

    let hash = hash_password(&password);
    match db::create_user(&state.pool, username.trim(), &hash, state.starting_cash).await {
        Ok(_) => Ok(see_other("/")),
        Err(e) => {
            error!("Failed to register {}: {}", username.trim(), e);
            Err(e.into())
        }
    }
}

async fn login_handler(state: Arc<AppState>, form: LoginForm) -> Result<Response, Rejection> {
    let username = non_blank(form.username)
        .ok_or_else(|| AppError::Forbidden("must provide username".into()))?;
    let password = non_blank(form.password)
        .ok_or_else(|| AppError::Forbidden("must provide password".into()))?;

    let user = match db::find_user_by_name(&state.pool, username.trim()).await? {
        Some(user) if verify_password(&user.hash, &password) => user,
        _ => {
            info!("Failed login for {}", username.trim());
            return Err(AppError::Forbidden("invalid username and/or password".into()).into());
        }
    };

    let token = state.sessions.issue(user.id)?;
    info!("User {} ({}) logged in", user.username, user.id);
    with_cookie(see_other("/"), &state.sessions.cookie(&token))
}

async fn logout_handler() -> Result<Response, Rejection> {
    with_cookie(see_other("/"), &Sessions::clear_cookie())
}

async fn index_handler(user_id: i64, state: Arc<AppState>) -> Result<Response, Rejection> {
    let user = db::find_user(&state.pool, user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let holdings = db::list_holdings(&state.pool, user_id).await?;
    let symbols: Vec<String> = holdings.iter().map(|h| h.symbol.clone()).collect();
    let quotes = lookup_all(state.quotes.as_ref(), &symbols).await?;

    let (lines, total) = trade::value_portfolio(&holdings, &quotes, user.cash);
    let view = PortfolioView {
        stocks: lines.iter().map(PortfolioRow::from).collect(),
        cash: usd(user.cash),
        total: usd(total),
    };
    Ok(warp::reply::json(&view).into_response())
}

async fn quote_handler(
    _user_id: i64,
    state: Arc<AppState>,
    form: QuoteForm,
) -> Result<Response, Rejection> {
    let symbol = form
        .symbol
        .as_deref()
        .and_then(normalize_symbol)
        .ok_or_else(|| AppError::BadRequest("must provide a valid symbol".into()))?;

    match state.quotes.lookup(&symbol).await? {
        Some(quote) => Ok(warp::reply::json(&QuoteView::from(quote)).into_response()),
        None => Err(AppError::NotFound("symbol not found".into()).into()),
    }
}

async fn buy_handler(
    user_id: i64,
    state: Arc<AppState>,
    form: TradeForm,
) -> Result<Response, Rejection> {
    let (symbol, shares) = parse_trade(form)?;
    let quote = state
        .quotes
        .lookup(&symbol)
        .await?
        .ok_or_else(|| AppError::NotFound("symbol not found".into()))?;

    match db::execute_buy(&state.pool, user_id, &symbol, shares, quote.price).await {
        Ok(receipt) => {
            info!(
                "User {} bought {} {} (transaction {})",
                user_id, shares, symbol, receipt.transaction_id
            );
            let view = TradeView {
                status: "success",
                message: format!(
                    "Transaction succeeded, you bought {} shares of {}",
                    shares, quote.name
                ),
                cash: usd(receipt.cash),
            };
            Ok(warp::reply::json(&view).into_response())
        }
        Err(e) => {
            error!("Buy of {} {} for user {} failed: {}", shares, symbol, user_id, e);
            Err(e.into())
        }
    }
}

async fn sellable_handler(user_id: i64, state: Arc<AppState>) -> Result<Response, Rejection> {
    let symbols: Vec<String> = db::list_holdings(&state.pool, user_id)
        .await?
        .into_iter()
        .map(|h| h.symbol)
        .collect();
    Ok(warp::reply::json(&json!({ "symbols": symbols })).into_response())
}

async fn sell_handler(
    user_id: i64,
    state: Arc<AppState>,
    form: TradeForm,
) -> Result<Response, Rejection> {
    let (symbol, shares) = parse_trade(form)?;
    let quote = state
        .quotes
        .lookup(&symbol)
        .await?
        .ok_or_else(|| AppError::NotFound("symbol not found".into()))?;

    match db::execute_sell(&state.pool, user_id, &symbol, shares, quote.price).await {
        Ok(receipt) => {
            info!(
                "User {} sold {} {} (transaction {})",
                user_id, shares, symbol, receipt.transaction_id
            );
            let view = TradeView {
                status: "success",
                message: format!(
                    "Transaction succeeded, you sold {} shares of {}",
                    shares, quote.name
                ),
                cash: usd(receipt.cash),
            };
            Ok(warp::reply::json(&view).into_response())
        }
        Err(e) => {
            error!("Sale of {} {} for user {} failed: {}", shares, symbol, user_id, e);
            Err(e.into())
        }
    }
}

async fn history_handler(user_id: i64, state: Arc<AppState>) -> Result<Response, Rejection> {
    let rows: Vec<HistoryRow> = db::list_transactions(&state.pool, user_id)
        .await?
        .into_iter()
        .map(HistoryRow::from)
        .collect();
    Ok(warp::reply::json(&rows).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::testing::StaticQuotes;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use warp::http::header::LOCATION;
    use warp::http::StatusCode;
    use warp::hyper::body::Bytes;

    const FORM: &str = "application/x-www-form-urlencoded";

    async fn app() -> (
        impl Filter<Extract = impl Reply, Error = Infallible> + Clone,
        Arc<StaticQuotes>,
    ) {
        let quotes = Arc::new(StaticQuotes::with(&[
            ("AAPL", "Apple Inc", dec!(150)),
            ("MSFT", "Microsoft Corp", dec!(300.5)),
        ]));
        let state = Arc::new(AppState {
            pool: db::memory_pool().await,
            quotes: quotes.clone(),
            sessions: Arc::new(Sessions::new("test-secret", 3600)),
            starting_cash: dec!(1000),
        });
        (routes(state), quotes)
    }

    async fn post<F>(
        api: &F,
        path: &str,
        body: &str,
        cookie: Option<&str>,
    ) -> warp::http::Response<Bytes>
    where
        F: Filter + Clone + 'static,
        F::Extract: Reply + Send,
    {
        let mut request = warp::test::request()
            .method("POST")
            .path(path)
            .header("content-type", FORM)
            .body(body.to_string());
        if let Some(cookie) = cookie {
            request = request.header("cookie", cookie);
        }
        request.reply(api).await
    }

    async fn get<F>(
        api: &F,
        path: &str,
        cookie: Option<&str>,
    ) -> warp::http::Response<Bytes>
    where
        F: Filter + Clone + 'static,
        F::Extract: Reply + Send,
    {
        let mut request = warp::test::request().method("GET").path(path);
        if let Some(cookie) = cookie {
            request = request.header("cookie", cookie);
        }
        request.reply(api).await
    }

    fn body(response: &warp::http::Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    /// Registers and logs in `name`, returning the cookie to send back.
    async fn sign_up<F>(api: &F, name: &str) -> String
    where
        F: Filter + Clone + 'static,
        F::Extract: Reply + Send,
    {
        let form = format!("username={0}&password=pw&confirmation=pw", name);
        let registered = post(api, "/register", &form, None).await;
        assert_eq!(registered.status(), StatusCode::SEE_OTHER);

        let login = post(api, "/login", &format!("username={}&password=pw", name), None).await;
        assert_eq!(login.status(), StatusCode::SEE_OTHER);
        assert_eq!(login.headers()[LOCATION], "/");
        let set_cookie = login.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn register_validates_the_form() {
        let (api, _) = app().await;

        let mismatch =
            post(&api, "/register", "username=bob&password=a&confirmation=b", None).await;
        assert_eq!(mismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&mismatch)["error"], "the password and confirmation don't match");

        let blank = post(&api, "/register", "username=&password=a&confirmation=a", None).await;
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

        let first = post(&api, "/register", "username=bob&password=a&confirmation=a", None).await;
        assert_eq!(first.status(), StatusCode::SEE_OTHER);
        let again = post(&api, "/register", "username=bob&password=a&confirmation=a", None).await;
        assert_eq!(again.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&again)["error"], "this username already exists");
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let (api, _) = app().await;
        sign_up(&api, "carol").await;

        let missing = post(&api, "/login", "password=pw", None).await;
        assert_eq!(missing.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&missing)["error"], "must provide username");

        let wrong = post(&api, "/login", "username=carol&password=nope", None).await;
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&wrong)["error"], "invalid username and/or password");

        let unknown = post(&api, "/login", "username=dave&password=pw", None).await;
        assert_eq!(unknown.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn protected_routes_redirect_to_login() {
        let (api, _) = app().await;
        for path in ["/", "/history", "/sell"] {
            let response = get(&api, path, None).await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", path);
            assert_eq!(response.headers()[LOCATION], "/login");
        }
        let forged = get(&api, "/", Some("session=not-a-token")).await;
        assert_eq!(forged.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn responses_are_never_cached() {
        let (api, _) = app().await;
        let response = get(&api, "/nowhere", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers()[EXPIRES], "0");
        assert_eq!(response.headers()[PRAGMA], "no-cache");
    }

    #[tokio::test]
    async fn quote_reports_price_or_unknown_symbol() {
        let (api, _) = app().await;
        let cookie = sign_up(&api, "erin").await;

        let found = post(&api, "/quote", "symbol=aapl", Some(&cookie)).await;
        assert_eq!(found.status(), StatusCode::OK);
        let view = body(&found);
        assert_eq!(view["symbol"], "AAPL");
        assert_eq!(view["price"], "$150.00");
        assert_eq!(view["message"], "Current share price of Apple Inc: $150.00");

        let missing = post(&api, "/quote", "symbol=ZZZZ", Some(&cookie)).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&missing)["error"], "symbol not found");

        let blank = post(&api, "/quote", "symbol=", Some(&cookie)).await;
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn buy_sell_and_review_the_portfolio() {
        let (api, quotes) = app().await;
        let cookie = sign_up(&api, "frank").await;

        let bought = post(&api, "/buy", "symbol=AAPL&shares=4", Some(&cookie)).await;
        assert_eq!(bought.status(), StatusCode::OK);
        let view = body(&bought);
        assert_eq!(view["status"], "success");
        assert_eq!(
            view["message"],
            "Transaction succeeded, you bought 4 shares of Apple Inc"
        );
        assert_eq!(view["cash"], "$400.00");

        quotes.set("AAPL", "Apple Inc", dec!(160));
        let sold = post(&api, "/sell", "symbol=aapl&shares=1", Some(&cookie)).await;
        assert_eq!(sold.status(), StatusCode::OK);
        assert_eq!(body(&sold)["cash"], "$560.00");

        let sellable = get(&api, "/sell", Some(&cookie)).await;
        assert_eq!(body(&sellable)["symbols"], serde_json::json!(["AAPL"]));

        let portfolio = get(&api, "/", Some(&cookie)).await;
        assert_eq!(portfolio.status(), StatusCode::OK);
        let view = body(&portfolio);
        assert_eq!(view["cash"], "$560.00");
        assert_eq!(view["stocks"][0]["shares"], 3);
        assert_eq!(view["stocks"][0]["price"], "$160.00");
        assert_eq!(view["stocks"][0]["total"], "$480.00");
        assert_eq!(view["total"], "$1,040.00");

        let history = get(&api, "/history", Some(&cookie)).await;
        let rows = body(&history);
        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["shares"], 4);
        assert_eq!(rows[0]["price"], "$150.00");
        assert_eq!(rows[1]["shares"], -1);
        assert_eq!(rows[1]["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn rejected_trades_explain_why() {
        let (api, _) = app().await;
        let cookie = sign_up(&api, "gina").await;

        let too_much = post(&api, "/buy", "symbol=MSFT&shares=4", Some(&cookie)).await;
        assert_eq!(too_much.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(&too_much)["error"],
            "insufficient funds for buying 4 shares of MSFT"
        );

        let not_owned = post(&api, "/sell", "symbol=MSFT&shares=1", Some(&cookie)).await;
        assert_eq!(not_owned.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(&not_owned)["error"],
            "insufficient shares for selling 1 shares of MSFT"
        );

        for shares in ["0", "-2", "1.5", "lots", ""] {
            let form = format!("symbol=AAPL&shares={}", shares);
            let bad = post(&api, "/buy", &form, Some(&cookie)).await;
            assert_eq!(bad.status(), StatusCode::BAD_REQUEST, "shares={}", shares);
        }

        let unknown = post(&api, "/buy", "symbol=ZZZZ&shares=1", Some(&cookie)).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let portfolio = body(&get(&api, "/", Some(&cookie)).await);
        assert_eq!(portfolio["cash"], "$1,000.00");
        assert_eq!(portfolio["stocks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn portfolio_handler_runs_on_a_spawned_task() {
        let quotes = Arc::new(StaticQuotes::with(&[("AAPL", "Apple Inc", dec!(150))]));
        let state = Arc::new(AppState {
            pool: db::memory_pool().await,
            quotes,
            sessions: Arc::new(Sessions::new("test-secret", 3600)),
            starting_cash: dec!(1000),
        });
        let id = db::create_user(&state.pool, "hank", "sha256$salt$00", dec!(1000))
            .await
            .unwrap();
        db::execute_buy(&state.pool, id, "AAPL", 2, dec!(150)).await.unwrap();

        let response = tokio::spawn(index_handler(id, state.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        let view: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(view["stocks"][0]["total"], "$300.00");
        assert_eq!(view["total"], "$1,000.00");
    }

    #[tokio::test]
    async fn logout_clears_the_session_cookie() {
        let (api, _) = app().await;
        let response = get(&api, "/logout", None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("session=;"));
        assert!(set_cookie.contains("Max-Age=0"));
    }
}
