// src/error.rs
use crate::auth::AuthError;
use crate::db::DbError;
use crate::quotes::QuoteError;
use crate::trade::TradeError;
use log::error;
use serde::Serialize;
use std::convert::Infallible;
use warp::http::{header, StatusCode};
use warp::reject::Reject;
use warp::reply::Response;
use warp::{Rejection, Reply};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("login required")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("quote lookup failed: {0}")]
    Quote(#[from] QuoteError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("session error: {0}")]
    Session(#[from] AuthError),
    #[error("{0}")]
    Internal(String),
}

impl Reject for AppError {}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Trade(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Quote(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Session(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to the client. Server-side failures are logged and
    /// replaced with a generic text.
    fn public_message(&self) -> String {
        if self.status().is_server_error() {
            error!("{}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlx(e) => AppError::Database(e),
            DbError::UsernameTaken => AppError::Forbidden("this username already exists".into()),
            // the session outlived its account
            DbError::UserNotFound(_) => AppError::Unauthorized,
            DbError::Trade(e) => AppError::Trade(e),
            DbError::Corrupt { column, value } => {
                AppError::Internal(format!("corrupt value in {}: {:?}", column, value))
            }
        }
    }
}

impl From<DbError> for Rejection {
    fn from(e: DbError) -> Self {
        AppError::from(e).into()
    }
}

impl From<QuoteError> for Rejection {
    fn from(e: QuoteError) -> Self {
        AppError::from(e).into()
    }
}

impl From<AuthError> for Rejection {
    fn from(e: AuthError) -> Self {
        AppError::from(e).into()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
}

pub fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
        code: status.as_u16(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

/// Turns every rejection into a JSON error body. A missing login redirects to
/// the login route instead.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if let Some(app) = err.find::<AppError>() {
        if matches!(app, AppError::Unauthorized) {
            return Ok(redirect_to_login());
        }
        return Ok(error_reply(app.status(), app.public_message()));
    }

    let reply = if err.is_not_found() {
        error_reply(StatusCode::NOT_FOUND, "not found")
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        error_reply(StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        error_reply(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        error_reply(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        error!("Unhandled rejection: {:?}", err);
        error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    };
    Ok(reply)
}

fn redirect_to_login() -> Response {
    warp::reply::with_header(StatusCode::SEE_OTHER, header::LOCATION, "/login").into_response()
}
