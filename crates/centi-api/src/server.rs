//! HTTP shell around the command dispatcher.
//!
//! Every POST, whatever its path, carries one command envelope. Other
//! methods are refused with 403 and an empty body. Bodies that do not
//! decode get 200 with an empty body.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use centi_relay::Dispatcher;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Build the router. All paths route to the same handler.
pub fn build_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .fallback(handle_command)
        .with_state(dispatcher)
        .layer(TraceLayer::new_for_http())
}

async fn handle_command(
    State(dispatcher): State<Dispatcher>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        debug!(%method, "Rejected non-POST request");
        return StatusCode::FORBIDDEN.into_response();
    }

    let reply = dispatcher.handle_body(&body).await;
    if reply.is_empty() {
        return StatusCode::OK.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        reply,
    )
        .into_response()
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await
}
