//! The keeper's HTTP status API: `GET /info` describes this keeper, `GET
//! /pgstate` returns the last probed PostgreSQL state.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::keeper::PostgresKeeper;

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(_) => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

async fn routes(req: Request<Body>, keeper: &Arc<PostgresKeeper>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/info") => json_response(&keeper.keeper_info()),

        (&Method::GET, "/pgstate") => match keeper.last_pg_state() {
            Some(pg_state) => json_response(&pg_state),
            // Nothing probed yet.
            None => {
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            }
        },

        _ => {
            let mut not_found = Response::new(Body::from("404 Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    }
}

/// Bind and spawn the HTTP server. Binding errors are reported synchronously
/// (a keeper that cannot serve its status API must not start); later server
/// failures surface through the returned handle.
pub fn launch_http_server(
    addr: SocketAddr,
    keeper: &Arc<PostgresKeeper>,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let keeper = Arc::clone(keeper);
    let make_service = make_service_fn(move |_conn| {
        let keeper = keeper.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let keeper = keeper.clone();
                async move { Ok::<_, Infallible>(routes(req, &keeper).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind the http listener on {addr}"))?
        .serve(make_service)
        .with_graceful_shutdown(async move { cancel.cancelled().await });

    info!("starting HTTP server on {addr}");
    Ok(tokio::spawn(async move {
        server.await.context("http server error")
    }))
}
