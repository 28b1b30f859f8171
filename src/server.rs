//! HTTP routes: the pre-serialized manifest views with conditional GET and
//! content-encoding negotiation, the manifest request code endpoint, and
//! the sign-in WebSocket upgrade.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use crate::catalog::negotiate;
use crate::cm::CmError;
use crate::error::ServiceError;
use crate::mrc::{FetchMrc, MrcFailure};
use crate::signin::SigninSession;
use crate::{AppState, Status};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/manifest")
            .route(web::get().to(get_manifest))
            .route(web::route().to(method_not_allowed)),
    )
    .service(
        web::resource("/manifest-bin")
            .route(web::get().to(get_manifest_bin))
            .route(web::route().to(method_not_allowed)),
    )
    .service(
        web::resource("/mrc")
            .route(web::get().to(get_mrc))
            .route(web::route().to(method_not_allowed)),
    )
    .service(web::resource("/signin").route(web::get().to(signin)))
    .default_service(web::route().to(not_found));
}

/// RFC 1123 timestamp for `Last-Modified`.
fn http_date(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => "Thu, 01 Jan 1970 00:00:00 GMT".to_owned(),
    }
}

fn header_str<'a>(req: &'a HttpRequest, name: header::HeaderName) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

async fn get_manifest(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    serve_manifest(&req, &state, false)
}

async fn get_manifest_bin(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    serve_manifest(&req, &state, true)
}

fn serve_manifest(
    req: &HttpRequest,
    state: &AppState,
    binary: bool,
) -> Result<HttpResponse, ServiceError> {
    if state.status.load() != Status::Running {
        return Err(ServiceError::Unavailable);
    }
    let view = state.catalog.read().unwrap().manifest_view();

    let if_modified_since = header_str(req, header::IF_MODIFIED_SINCE);
    if !if_modified_since.is_empty() {
        if let Ok(since) = chrono::DateTime::parse_from_rfc2822(if_modified_since) {
            if view.last_modified <= since.timestamp() {
                return Ok(HttpResponse::NotModified().finish());
            }
        }
    }

    let buf = if binary { &view.bin } else { &view.json };
    let mut response = HttpResponse::Ok();
    response.content_type(if binary {
        "application/octet-stream"
    } else {
        "application/json; charset=utf-8"
    });
    response.insert_header((header::CACHE_CONTROL, "no-cache"));
    response.insert_header((header::LAST_MODIFIED, http_date(view.last_modified)));
    match negotiate(header_str(req, header::ACCEPT_ENCODING), buf) {
        Some((encoding, bytes)) => {
            response.insert_header((header::CONTENT_ENCODING, encoding.token()));
            Ok(response.body(bytes.clone()))
        }
        None => Ok(response.body(buf.plain.clone())),
    }
}

#[derive(Debug, Deserialize)]
struct MrcQuery {
    app_id: u32,
    depot_id: u32,
    manifest_id: u64,
}

async fn get_mrc(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    if state.status.load() != Status::Running {
        return Err(ServiceError::Unavailable);
    }
    let query = web::Query::<MrcQuery>::from_query(req.query_string())
        .map_err(|err| ServiceError::BadRequest(err.to_string()))?;
    let grant = state
        .dispatcher
        .send(FetchMrc {
            app_id: query.app_id,
            depot_id: query.depot_id,
            manifest_id: query.manifest_id,
        })
        .await?
        .map_err(|failure| match failure {
            MrcFailure::UnknownDepot => ServiceError::Unauthorized,
            MrcFailure::Cm(CmError::Timeout) => ServiceError::GatewayTimeout,
            MrcFailure::NoSession => {
                ServiceError::Internal(anyhow::anyhow!("selected account has no connection"))
            }
            MrcFailure::Cm(err) => ServiceError::Internal(err.into()),
        })?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header((header::CACHE_CONTROL, format!("max-age={}", grant.max_age)))
        .body(grant.mrc.to_string()))
}

async fn signin(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(SigninSession::new(state.get_ref().clone()), &req, stream)
}

async fn method_not_allowed(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    if state.status.load() != Status::Running {
        return Err(ServiceError::Unavailable);
    }
    Err(ServiceError::MethodNotAllowed)
}

async fn not_found(state: web::Data<AppState>) -> Result<HttpResponse, ServiceError> {
    if state.status.load() != Status::Running {
        return Err(ServiceError::Unavailable);
    }
    Err(ServiceError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_dates_are_rfc1123() {
        assert_eq!(http_date(784111777), "Sun, 06 Nov 1994 08:49:37 GMT");
        let parsed = chrono::DateTime::parse_from_rfc2822(&http_date(784111777)).unwrap();
        assert_eq!(parsed.timestamp(), 784111777);
    }
}
