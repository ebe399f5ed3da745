//! One-page HTTP control surface.
//!
//! | Path              | Action                      | Response      |
//! |-------------------|-----------------------------|---------------|
//! | `/?run=<seconds>` | run for exactly `<seconds>` | 303 to `/`    |
//! | `/`               | status page                 | 200           |
//! | `/off`            | cancel                      | 303 to `/`    |
//! | `/incr`           | add one increment           | 303 to `/`    |
//!
//! Handlers only request transitions on the shared timer; the relay itself
//! is switched by the scheduler on its next tick.

use std::any::Any;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{RawQuery, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::context::{PageSettings, SharedContext, Status};

/// Per-request limit; a stalled client gets 408.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("404 Not Found")]
    NotFound,
    #[error("405 Method not allowed")]
    MethodNotAllowed,
    #[error("invalid run duration {0:?}")]
    InvalidSeconds(String),
    #[error("internal fault: {0}")]
    Internal(String),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
            Self::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, self.to_string()).into_response()
            }
            Self::InvalidSeconds(_) | Self::Internal(_) => {
                error!("request failed: {self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "500 Internal Server Error",
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: SharedContext) -> Router {
    with_middleware(
        Router::new()
            .route("/", get(index))
            .route("/off", get(turn_off))
            .route("/incr", get(add_increment)),
    )
    .with_state(ctx)
}

/// Fallback, GET-only guard, panic isolation, timeout and request tracing.
fn with_middleware(routes: Router<SharedContext>) -> Router<SharedContext> {
    routes
        .fallback(fallback)
        .layer(middleware::from_fn(require_get))
        .layer(CatchPanicLayer::custom(handler_panicked))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Only GET is served.  HEAD and every other method get 405 before a
/// handler runs.
async fn require_get(req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return ControlError::MethodNotAllowed.into_response();
    }
    next.run(req).await
}

async fn index(
    State(ctx): State<SharedContext>,
    RawQuery(query): RawQuery,
) -> Result<Response, ControlError> {
    match query.as_deref() {
        None | Some("") => Ok(Html(render_status(&ctx.page, &ctx.status())).into_response()),
        Some(q) => {
            let seconds = parse_run(q)?;
            let deadline = ctx.timer.set_absolute(ctx.now_ms(), seconds);
            info!(seconds, ?deadline, "web: run requested");
            Ok(Redirect::to("/").into_response())
        }
    }
}

async fn turn_off(State(ctx): State<SharedContext>) -> Redirect {
    ctx.timer.cancel();
    info!("web: turn off requested");
    Redirect::to("/")
}

async fn add_increment(State(ctx): State<SharedContext>) -> Redirect {
    let deadline = ctx.timer.increment(ctx.now_ms());
    info!(?deadline, "web: increment requested");
    Redirect::to("/")
}

async fn fallback() -> ControlError {
    ControlError::NotFound
}

fn handler_panicked(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    ControlError::Internal(format!("handler panicked: {detail}")).into_response()
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// Parse the `run=<seconds>` query of the set-timer form.  Any other query
/// names a page that does not exist.
fn parse_run(query: &str) -> Result<i64, ControlError> {
    let raw = query.strip_prefix("run=").ok_or(ControlError::NotFound)?;
    raw.trim()
        .parse()
        .map_err(|_| ControlError::InvalidSeconds(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_status(page: &PageSettings, status: &Status) -> String {
    let title = escape_html(&page.title);
    let refresh = if page.refresh_secs > 0 {
        format!(
            "<meta http-equiv=\"refresh\" content=\"{}\">\n",
            page.refresh_secs
        )
    } else {
        String::new()
    };
    let state = if status.on { "ON" } else { "OFF" };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
{refresh}<title>{title}</title>
</head>
<body>
<h1>{title}</h1>
<div>
    <ul>
        <li>Status: {state}</li>
        <li>Remaining: {remaining} sec</li>
        <li><a href="/off">Turn off</a></li>
        <li><a href="/incr">Add {increment} sec</a></li>
    </ul>
</div>
<div>
    <form action="/" method="get">
        Turn on for: <input autofocus required inputmode="numeric" name="run" id="run"><input type="submit" value="Run">
    </form>
</div>
</body>
</html>"#,
        remaining = status.remaining_secs,
        increment = status.increment_secs,
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve on an already bound listener.  The handle resolves only if the
/// server stops.
pub fn spawn(listener: TcpListener, ctx: SharedContext) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move { axum::serve(listener, router(ctx)).await })
}

// ===========================================================================
// Tests
// ===========================================================================
