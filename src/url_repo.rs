use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use rearch::{CData, CapsuleHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Placeholder written into every [`ClickEvent::location`].
pub const CLICK_LOCATION: &str = "Local";
/// [`ClickEvent::source`] used when the request carried no referrer.
pub const DIRECT_SOURCE: &str = "Direct";

fn url_repository_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (
    Option<Arc<dyn UrlRepository>>,
    impl use<> + CData + Fn(Option<Arc<dyn UrlRepository>>),
) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn url_repository_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(Arc<dyn UrlRepository>) {
    let set_url_repo = get.as_ref(url_repository_manager).1.clone();
    move |repo| set_url_repo(Some(repo))
}

/// # Panics
/// Panics when the repository was not set via [`url_repository_init_action`].
pub fn url_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRepository> {
    let url_repo = get.as_ref(url_repository_manager).0.clone();
    url_repo.expect("UrlRepository should've been set via url_repository_init_action!")
}

/// Mutation applied to a single record by [`UrlRepository::update_url`].
/// Returns whether the record changed and the store must be rewritten.
pub type UrlUpdate = Box<dyn FnOnce(&mut ShortLinkRecord) -> bool + Send>;

#[async_trait]
pub trait UrlRepository: Send + Sync {
    /// Every record in insertion order.
    async fn retrieve_urls(&self) -> anyhow::Result<Vec<ShortLinkRecord>>;

    /// Appends `urls` in one rewrite of the store.
    /// Fails without writing anything if any short code is already present.
    async fn append_urls(&self, urls: Vec<ShortLinkRecord>) -> Result<(), SaveUrlError>;

    /// Runs `update` on the first record with `short_code`, rewriting the store
    /// only if `update` reports a change. Returns the record as left by `update`.
    async fn update_url(
        &self,
        short_code: &ShortCode,
        update: UrlUpdate,
    ) -> anyhow::Result<Option<ShortLinkRecord>>;
}

#[derive(Debug, Error)]
pub enum SaveUrlError {
    #[error("short code {0} is already in use")]
    ShortCodeTaken(String),
    #[error("internal/storage error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Alphanumeric identifier of 4 to 8 characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortCode(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortCodeValidationError {
    #[error("short code is too short: {len} < {}", ShortCode::MIN_LEN)]
    TooShort { len: usize },
    #[error("short code is too long: {len} > {}", ShortCode::MAX_LEN)]
    TooLong { len: usize },
    #[error("short code has invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

impl ShortCode {
    pub const MIN_LEN: usize = 4;
    pub const MAX_LEN: usize = 8;

    /// # Errors
    /// Returns [`Err`] when `code` is not 4 to 8 ASCII alphanumeric characters.
    pub fn new(code: String) -> Result<Self, ShortCodeValidationError> {
        let invalid_chars: String = code.chars().filter(|c| !c.is_ascii_alphanumeric()).collect();
        if !invalid_chars.is_empty() {
            return Err(ShortCodeValidationError::InvalidCharacters { invalid_chars });
        }

        // all chars are ASCII at this point, so bytes == chars
        match code.len() {
            len if len < Self::MIN_LEN => Err(ShortCodeValidationError::TooShort { len }),
            len if len > Self::MAX_LEN => Err(ShortCodeValidationError::TooLong { len }),
            _ => Ok(Self(code)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for ShortCode {
    type Error = ShortCodeValidationError;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        Self::new(code)
    }
}

impl From<ShortCode> for String {
    fn from(code: ShortCode) -> Self {
        code.0
    }
}

impl std::fmt::Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: String,
    pub location: String,
}

impl ClickEvent {
    #[must_use]
    pub fn new(timestamp: OffsetDateTime, referrer: Option<&str>) -> Self {
        Self {
            timestamp,
            source: referrer
                .filter(|referrer| !referrer.is_empty())
                .unwrap_or(DIRECT_SOURCE)
                .to_owned(),
            location: CLICK_LOCATION.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortLinkRecord {
    pub original_url: String,
    /// Kept as stored; only codes of new links go through [`ShortCode`].
    pub shortcode: String,
    pub short_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub clicks: u64,
    #[serde(default)]
    pub click_details: Vec<ClickEvent>,
}

impl ShortLinkRecord {
    /// Whether the record no longer redirects at `now`.
    #[must_use]
    pub fn is_lapsed_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn record_click(&mut self, click: ClickEvent) {
        self.clicks += 1;
        self.click_details.push(click);
    }
}

fn ensure_unique(
    existing: &[ShortLinkRecord],
    new_urls: &[ShortLinkRecord],
) -> Result<(), SaveUrlError> {
    for (i, url) in new_urls.iter().enumerate() {
        let taken = existing.iter().any(|e| e.shortcode == url.shortcode)
            || new_urls[..i].iter().any(|n| n.shortcode == url.shortcode);
        if taken {
            return Err(SaveUrlError::ShortCodeTaken(url.shortcode.clone()));
        }
    }
    Ok(())
}

/// Store persisted as a single JSON array file, rewritten on every mutation.
pub struct JsonFileUrlRepository {
    path: PathBuf,
    // serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl JsonFileUrlRepository {
    /// # Errors
    /// Will return [`Err`] if an existing store file cannot be read or parsed.
    #[instrument]
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let repo = Self {
            path,
            write_lock: Mutex::new(()),
        };
        let urls = repo.read_all().await?;
        info!(path = %repo.path.display(), count = urls.len(), "Opened URL store");
        Ok(repo)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> anyhow::Result<Vec<ShortLinkRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse URL store {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read URL store {}", self.path.display())),
        }
    }

    async fn write_all(&self, urls: &[ShortLinkRecord]) -> anyhow::Result<()> {
        let json = serde_json::to_vec(urls).context("Failed to serialize URL store")?;
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write URL store {}", self.path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace URL store {}", self.path.display()))?;
        debug!(count = urls.len(), "Rewrote URL store");
        Ok(())
    }
}

#[async_trait]
impl UrlRepository for JsonFileUrlRepository {
    #[instrument(skip(self))]
    async fn retrieve_urls(&self) -> anyhow::Result<Vec<ShortLinkRecord>> {
        self.read_all().await
    }

    #[instrument(skip(self, urls), fields(count = urls.len()))]
    async fn append_urls(&self, urls: Vec<ShortLinkRecord>) -> Result<(), SaveUrlError> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        ensure_unique(&all, &urls)?;
        all.extend(urls);
        self.write_all(&all).await?;
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update_url(
        &self,
        short_code: &ShortCode,
        update: UrlUpdate,
    ) -> anyhow::Result<Option<ShortLinkRecord>> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        let Some(url) = all
            .iter_mut()
            .find(|url| url.shortcode == short_code.as_str())
        else {
            return Ok(None);
        };
        let changed = update(url);
        let url = url.clone();
        if changed {
            self.write_all(&all).await?;
        }
        Ok(Some(url))
    }
}

/// Store kept only in process memory; same rewrite semantics as the file store.
#[derive(Default)]
pub struct InMemoryUrlRepository {
    urls: Mutex<Vec<ShortLinkRecord>>,
}

impl InMemoryUrlRepository {
    #[must_use]
    pub fn new(urls: Vec<ShortLinkRecord>) -> Self {
        Self {
            urls: Mutex::new(urls),
        }
    }
}

#[async_trait]
impl UrlRepository for InMemoryUrlRepository {
    async fn retrieve_urls(&self) -> anyhow::Result<Vec<ShortLinkRecord>> {
        Ok(self.urls.lock().await.clone())
    }

    async fn append_urls(&self, urls: Vec<ShortLinkRecord>) -> Result<(), SaveUrlError> {
        let mut all = self.urls.lock().await;
        ensure_unique(&all, &urls)?;
        all.extend(urls);
        Ok(())
    }

    async fn update_url(
        &self,
        short_code: &ShortCode,
        update: UrlUpdate,
    ) -> anyhow::Result<Option<ShortLinkRecord>> {
        let mut all = self.urls.lock().await;
        Ok(all
            .iter_mut()
            .find(|url| url.shortcode == short_code.as_str())
            .map(|url| {
                update(url);
                url.clone()
            }))
    }
}
