use std::{
    collections::HashSet,
    sync::{Arc, LazyLock},
};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rand::Rng;
use rearch::CapsuleHandle;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{error, instrument, warn};
use url::Url;

use crate::{
    config::public_origin_capsule,
    log_client::{EvaluationLogger, evaluation_logger_capsule},
    stats::{self, ClickDetails, StatsReport},
    url_repo::{
        ClickEvent, SaveUrlError, ShortCode, ShortLinkRecord, UrlRepository,
        url_repository_capsule,
    },
};

pub const MAX_CANDIDATES: usize = 5;
pub const DEFAULT_VALIDITY_MINUTES: f64 = 30.0;

const INVALID_URL_MESSAGE: &str = "Please enter a valid URL";
const INVALID_VALIDITY_MESSAGE: &str = "Validity must be a positive number";
const INVALID_SHORTCODE_MESSAGE: &str = "Shortcode must be 4-8 alphanumeric characters";
const TAKEN_SHORTCODE_MESSAGE: &str = "Shortcode is already in use";

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?([0-9a-z.-]+)\.([a-z.]{2,6})([/0-9A-Za-z_ .-]*)*/?$")
        .expect("URL pattern should compile")
});

/// One row of a shortening request. An empty `long_url` marks an unused row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCandidate {
    #[serde(default)]
    pub long_url: String,
    /// Minutes the short URL stays valid; defaults to 30.
    pub validity: Option<f64>,
    pub shortcode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateField {
    Url,
    Validity,
    Shortcode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Position of the candidate in the request.
    pub index: usize,
    pub field: CandidateField,
    pub message: String,
}

impl FieldError {
    fn new(index: usize, field: CandidateField, message: &str) -> Self {
        Self {
            index,
            field,
            message: message.to_owned(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
}

pub fn url_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UrlService> {
    let url_repo = Arc::clone(get.as_ref(url_repository_capsule));
    let logger = Arc::clone(get.as_ref(evaluation_logger_capsule));
    let public_origin = get.as_ref(public_origin_capsule).clone();
    url_service(url_repo, logger, public_origin)
}

/// Builds the service outside of a container, with short URLs rooted at `public_origin`.
#[must_use]
pub fn url_service(
    url_repo: Arc<dyn UrlRepository>,
    logger: Arc<EvaluationLogger>,
    public_origin: Url,
) -> Arc<dyn UrlService> {
    Arc::new(UrlServiceImpl {
        url_repo,
        logger,
        public_origin,
    })
}

#[async_trait]
pub trait UrlService: Send + Sync {
    /// Validates and stores up to [`MAX_CANDIDATES`] URLs in one store rewrite.
    async fn shorten_batch(
        &self,
        candidates: Vec<UrlCandidate>,
    ) -> Result<Vec<ShortLinkRecord>, ShortenError>;

    /// Records a click on `short_code` and returns where to send the visitor.
    async fn resolve(
        &self,
        short_code: &str,
        referrer: Option<&str>,
    ) -> Result<Redirect, ResolveError>;

    async fn stats(&self) -> anyhow::Result<StatsReport>;

    async fn click_details(&self, short_code: &str) -> Result<ClickDetails, GetUrlError>;
}

#[derive(Debug, Error)]
pub enum ShortenError {
    #[error("at most {MAX_CANDIDATES} URLs can be shortened at once, got {count}")]
    TooManyCandidates { count: usize },
    #[error("{} field(s) failed validation", .0.len())]
    Validation(Vec<FieldError>),
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("The shortened URL you are trying to access does not exist.")]
    NotFound,
    #[error("This shortened URL has expired.")]
    Expired,
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum GetUrlError {
    #[error("short URL not found")]
    NotFound,
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error),
}

struct ValidCandidate {
    long_url: String,
    expires_at: OffsetDateTime,
    shortcode: Option<ShortCode>,
}

#[derive(Default)]
struct Validated {
    /// Candidates without any format error.
    valid: Vec<ValidCandidate>,
    /// Every well-formed supplied code, including those of otherwise invalid candidates.
    supplied: Vec<(usize, ShortCode)>,
    errors: Vec<FieldError>,
}

/// Checks the format of every non-empty candidate and collects all field errors.
fn validate_candidates(candidates: Vec<UrlCandidate>, created_at: OffsetDateTime) -> Validated {
    let mut validated = Validated::default();

    for (index, candidate) in candidates.into_iter().enumerate() {
        if candidate.long_url.trim().is_empty() {
            continue;
        }

        let url_ok = URL_PATTERN.is_match(&candidate.long_url);
        if !url_ok {
            validated
                .errors
                .push(FieldError::new(index, CandidateField::Url, INVALID_URL_MESSAGE));
        }

        let expires_at = expiry(created_at, candidate.validity);
        if expires_at.is_none() {
            validated.errors.push(FieldError::new(
                index,
                CandidateField::Validity,
                INVALID_VALIDITY_MESSAGE,
            ));
        }

        let shortcode = match candidate.shortcode.filter(|code| !code.is_empty()) {
            Some(code) => match ShortCode::new(code) {
                Ok(code) => {
                    validated.supplied.push((index, code.clone()));
                    Some(Some(code))
                }
                Err(_) => {
                    validated.errors.push(FieldError::new(
                        index,
                        CandidateField::Shortcode,
                        INVALID_SHORTCODE_MESSAGE,
                    ));
                    None
                }
            },
            None => Some(None),
        };

        if let (true, Some(expires_at), Some(shortcode)) = (url_ok, expires_at, shortcode) {
            validated.valid.push(ValidCandidate {
                long_url: candidate.long_url,
                expires_at,
                shortcode,
            });
        }
    }

    validated
}

/// `None` when `validity` is not a positive number of minutes that fits in time.
fn expiry(created_at: OffsetDateTime, validity: Option<f64>) -> Option<OffsetDateTime> {
    let minutes = validity.unwrap_or(DEFAULT_VALIDITY_MINUTES);
    if !minutes.is_finite() || minutes <= 0.0 {
        return None;
    }
    Duration::checked_seconds_f64(minutes * 60.0).and_then(|window| created_at.checked_add(window))
}

/// Six random alphanumeric characters.
fn generate_short_code() -> Result<ShortCode, anyhow::Error> {
    const CODE_LEN: usize = 6;

    let mut bytes = [0; 16];
    rand::rng().fill_bytes(&mut bytes);
    // NOTE: the low-order base62 digits of a random u128 are uniform
    let encoded = format!(
        "{:0>width$}",
        base62::encode(u128::from_le_bytes(bytes)),
        width = CODE_LEN
    );
    ShortCode::new(encoded[encoded.len() - CODE_LEN..].to_owned())
        .context("Generated an invalid short code")
}

/// URL the visitor is sent to; bare hosts are assumed to be plain HTTP.
fn navigation_target(original_url: &str) -> String {
    if original_url.starts_with("http://") || original_url.starts_with("https://") {
        original_url.to_owned()
    } else {
        format!("http://{original_url}")
    }
}

struct UrlServiceImpl {
    url_repo: Arc<dyn UrlRepository>,
    logger: Arc<EvaluationLogger>,
    public_origin: Url,
}

impl UrlServiceImpl {
    /// Assigns codes and builds the records for one save attempt.
    fn build_records(
        &self,
        candidates: &[ValidCandidate],
        existing: &[ShortLinkRecord],
        created_at: OffsetDateTime,
    ) -> Result<Vec<ShortLinkRecord>, ShortenError> {
        const GENERATE_ATTEMPTS: usize = 3;

        let mut used: HashSet<String> = existing
            .iter()
            .map(|url| url.shortcode.clone())
            .chain(
                candidates
                    .iter()
                    .filter_map(|c| Some(c.shortcode.as_ref()?.to_string())),
            )
            .collect();

        candidates
            .iter()
            .map(|candidate| {
                let shortcode = match &candidate.shortcode {
                    Some(code) => code.clone(),
                    None => (0..GENERATE_ATTEMPTS)
                        .find_map(|_| match generate_short_code() {
                            Ok(code) if used.insert(code.to_string()) => Some(code),
                            Ok(code) => {
                                warn!(%code, "Generated short code that was already taken");
                                None
                            }
                            Err(err) => {
                                warn!(?err, "Generated invalid short code");
                                None
                            }
                        })
                        .ok_or_else(|| {
                            ShortenError::Internal(anyhow!("Failed to generate a free short code"))
                        })?,
                };

                let short_url = self
                    .public_origin
                    .join(shortcode.as_str())
                    .context("Failed to build short URL")
                    .map_err(ShortenError::Internal)?;

                Ok(ShortLinkRecord {
                    original_url: candidate.long_url.clone(),
                    shortcode: shortcode.into_inner(),
                    short_url: short_url.into(),
                    created_at,
                    expires_at: candidate.expires_at,
                    clicks: 0,
                    click_details: Vec::new(),
                })
            })
            .collect()
    }

    /// Orders `errors` by candidate and field and reports the rejection.
    fn rejected(&self, mut errors: Vec<FieldError>) -> ShortenError {
        errors.sort_by_key(|error| (error.index, error.field));
        warn!(?errors, "Rejected shortening request");
        self.logger.spawn_log(
            "backend",
            "warn",
            "service",
            "URL shortening validation failed".to_owned(),
        );
        ShortenError::Validation(errors)
    }
}

/// Supplied codes that already exist in the store or repeat within the batch.
fn taken_short_codes(supplied: &[(usize, ShortCode)], existing: &[ShortLinkRecord]) -> Vec<FieldError> {
    let mut seen = HashSet::new();
    supplied
        .iter()
        .filter_map(|(index, code)| {
            let repeated = !seen.insert(code);
            (repeated || existing.iter().any(|url| url.shortcode == code.as_str())).then(|| {
                FieldError::new(*index, CandidateField::Shortcode, TAKEN_SHORTCODE_MESSAGE)
            })
        })
        .collect()
}

#[async_trait]
impl UrlService for UrlServiceImpl {
    #[instrument(skip(self))]
    async fn shorten_batch(
        &self,
        candidates: Vec<UrlCandidate>,
    ) -> Result<Vec<ShortLinkRecord>, ShortenError> {
        const SAVE_ATTEMPTS: usize = 3;

        if candidates.len() > MAX_CANDIDATES {
            return Err(ShortenError::TooManyCandidates {
                count: candidates.len(),
            });
        }

        let created_at = OffsetDateTime::now_utc();
        let Validated {
            valid,
            supplied,
            errors,
        } = validate_candidates(candidates, created_at);
        if valid.is_empty() && supplied.is_empty() {
            return if errors.is_empty() {
                Ok(Vec::new())
            } else {
                Err(self.rejected(errors))
            };
        }

        for _ in 0..SAVE_ATTEMPTS {
            let existing = self
                .url_repo
                .retrieve_urls()
                .await
                .context("Failed to load existing short URLs")
                .map_err(ShortenError::Internal)?;

            let mut field_errors = errors.clone();
            field_errors.extend(taken_short_codes(&supplied, &existing));
            if !field_errors.is_empty() {
                return Err(self.rejected(field_errors));
            }

            let records = self.build_records(&valid, &existing, created_at)?;
            match self.url_repo.append_urls(records.clone()).await {
                Ok(()) => {
                    for url in &records {
                        self.logger.spawn_log(
                            "backend",
                            "info",
                            "service",
                            format!("URL shortened: {} to {}", url.original_url, url.shortcode),
                        );
                    }
                    self.logger.spawn_log(
                        "backend",
                        "info",
                        "service",
                        format!("Created {} shortened URLs", records.len()),
                    );
                    return Ok(records);
                }
                // NOTE: a concurrent writer claimed one of the codes since we loaded the store;
                // supplied codes are reported on the next pass, generated ones are redrawn
                Err(SaveUrlError::ShortCodeTaken(code)) => {
                    warn!(%code, "Short code was taken while saving");
                }
                Err(SaveUrlError::Internal(err)) => {
                    error!(?err, "Failed to save short URLs");
                    return Err(ShortenError::Internal(
                        err.context("Failed to save short URLs"),
                    ));
                }
            }
        }

        Err(ShortenError::Internal(anyhow!("Exhausted retry attempts")))
    }

    #[instrument(skip(self))]
    async fn resolve(
        &self,
        short_code: &str,
        referrer: Option<&str>,
    ) -> Result<Redirect, ResolveError> {
        let Ok(code) = ShortCode::new(short_code.to_owned()) else {
            return Err(ResolveError::NotFound);
        };

        let now = OffsetDateTime::now_utc();
        let click = ClickEvent::new(now, referrer);
        let url = self
            .url_repo
            .update_url(
                &code,
                Box::new(move |url| {
                    if url.is_lapsed_at(now) {
                        return false;
                    }
                    url.record_click(click);
                    true
                }),
            )
            .await
            .map_err(ResolveError::Internal)?;

        match url {
            None => {
                self.logger.spawn_log(
                    "backend",
                    "error",
                    "route",
                    format!("Shortcode not found: {code}"),
                );
                Err(ResolveError::NotFound)
            }
            Some(url) if url.is_lapsed_at(now) => {
                self.logger.spawn_log(
                    "backend",
                    "warn",
                    "route",
                    format!("Expired shortcode accessed: {code}"),
                );
                Err(ResolveError::Expired)
            }
            Some(url) => {
                self.logger.spawn_log(
                    "backend",
                    "info",
                    "route",
                    format!("Redirecting to: {}", url.original_url),
                );
                Ok(Redirect {
                    url: navigation_target(&url.original_url),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> anyhow::Result<StatsReport> {
        self.logger.spawn_log(
            "backend",
            "info",
            "service",
            "Statistics page viewed".to_owned(),
        );
        let urls = self
            .url_repo
            .retrieve_urls()
            .await
            .inspect_err(|err| {
                self.logger.spawn_log(
                    "backend",
                    "error",
                    "service",
                    format!("Error loading URLs: {err}"),
                );
            })
            .context("Failed to load short URLs for stats")?;

        let message = if urls.is_empty() {
            "No shortened URLs found in storage".to_owned()
        } else {
            format!("Loaded {} shortened URLs from storage", urls.len())
        };
        self.logger.spawn_log("backend", "info", "service", message);
        Ok(stats::summarize(&urls, OffsetDateTime::now_utc()))
    }

    #[instrument(skip(self))]
    async fn click_details(&self, short_code: &str) -> Result<ClickDetails, GetUrlError> {
        let urls = self
            .url_repo
            .retrieve_urls()
            .await
            .map_err(GetUrlError::Internal)?;
        let Some(url) = urls.into_iter().find(|url| url.shortcode == short_code) else {
            self.logger.spawn_log(
                "backend",
                "warn",
                "service",
                format!("Click details requested for unknown shortcode: {short_code}"),
            );
            return Err(GetUrlError::NotFound);
        };

        self.logger.spawn_log(
            "backend",
            "info",
            "service",
            format!("Click details viewed: {short_code} ({} clicks)", url.clicks),
        );
        Ok(ClickDetails::from(url))
    }
}
