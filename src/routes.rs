//! HTTP surface of the shortener.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing,
};
use rearch::Container;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    api::{Error, ShortenUrlsPayload, ShortenedUrls},
    config,
    url_repo::ShortCode,
    url_service::{GetUrlError, ResolveError, ShortenError, UrlService, url_service_capsule},
};

/// Where non-API paths that are not short codes end up.
pub const HOME: &str = "/api/stats";

#[derive(Clone)]
pub struct AppState {
    pub url_service: Arc<dyn UrlService>,
    /// Pause before a short URL is resolved.
    pub redirect_delay: Duration,
}

impl AppState {
    #[must_use]
    pub fn from_container(container: &Container) -> Self {
        let (url_service, redirect_delay) =
            container.read((url_service_capsule, config::redirect_delay_capsule));
        Self {
            url_service,
            redirect_delay,
        }
    }
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/urls", routing::post(post_urls))
        .route("/api/stats", routing::get(get_stats))
        .route("/api/stats/{short_code}", routing::get(get_click_details))
        .route("/{short_code}", routing::get(get_short_url))
        .fallback(|| async { Redirect::temporary(HOME) })
        .with_state(state)
}

fn internal_error(err_uuid: Uuid) -> (StatusCode, Json<Error>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Error::new(
            "Internal server error".to_owned(),
            err_uuid.to_string(),
        )),
    )
}

#[instrument(skip(state))]
async fn post_urls(
    State(state): State<AppState>,
    Json(ShortenUrlsPayload { urls }): Json<ShortenUrlsPayload>,
) -> impl IntoResponse {
    state
        .url_service
        .shorten_batch(urls)
        .await
        .map(|urls| (StatusCode::CREATED, Json(ShortenedUrls { urls })))
        .map_err(|error: ShortenError| {
            let err_uuid = Uuid::new_v4();
            match error {
                ShortenError::Validation(field_errors) => {
                    info!(?err_uuid, ?field_errors, "User submitted invalid URLs");
                    (
                        StatusCode::BAD_REQUEST,
                        Json(Error {
                            error: "Some URLs failed validation".to_owned(),
                            error_id: err_uuid.to_string(),
                            field_errors,
                        }),
                    )
                }
                ShortenError::TooManyCandidates { .. } => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    (
                        StatusCode::BAD_REQUEST,
                        Json(Error::new(error.to_string(), err_uuid.to_string())),
                    )
                }
                ShortenError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
}

#[instrument(skip(state))]
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    state.url_service.stats().await.map(Json).map_err(|error| {
        let err_uuid = Uuid::new_v4();
        error!(?err_uuid, ?error, "Encountered an error during a request");
        internal_error(err_uuid)
    })
}

#[instrument(skip(state))]
async fn get_click_details(
    State(state): State<AppState>,
    Path(short_code): Path<String>,
) -> impl IntoResponse {
    state
        .url_service
        .click_details(&short_code)
        .await
        .map(Json)
        .map_err(|error: GetUrlError| {
            let err_uuid = Uuid::new_v4();
            match error {
                GetUrlError::NotFound => (
                    StatusCode::NOT_FOUND,
                    Json(Error::new("Not found".to_owned(), err_uuid.to_string())),
                ),
                GetUrlError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
}

#[instrument(skip(state, headers))]
async fn get_short_url(
    State(state): State<AppState>,
    Path(short_code): Path<String>,
    headers: HeaderMap,
) -> Response {
    if ShortCode::new(short_code.clone()).is_err() {
        return Redirect::temporary(HOME).into_response();
    }

    tokio::time::sleep(state.redirect_delay).await;

    let referrer = headers
        .get(header::REFERER)
        .and_then(|referrer| referrer.to_str().ok());
    state
        .url_service
        .resolve(&short_code, referrer)
        .await
        .map(|redirect| Redirect::temporary(&redirect.url))
        .map_err(|error: ResolveError| {
            let err_uuid = Uuid::new_v4();
            match error {
                ResolveError::NotFound => (
                    StatusCode::NOT_FOUND,
                    Json(Error::new(error.to_string(), err_uuid.to_string())),
                ),
                ResolveError::Expired => (
                    StatusCode::GONE,
                    Json(Error::new(error.to_string(), err_uuid.to_string())),
                ),
                ResolveError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
        .into_response()
}
