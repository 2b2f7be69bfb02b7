use std::{
    env::{self, VarError},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use rearch::{CapsuleHandle, Container};
use tracing::{info, instrument, warn};
use url::Url;

use crate::{
    log_client::DEFAULT_LOG_ENDPOINT,
    url_repo::{InMemoryUrlRepository, JsonFileUrlRepository, UrlRepository, url_repository_init_action},
};

/// `STORE_PATH` value that keeps the store in process memory.
pub const IN_MEMORY_STORE: &str = ":memory:";

/// # Errors
/// Will return [`Err`] if the URL store cannot be opened.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (store_path, set_url_repo) =
        container.read((store_path_capsule, url_repository_init_action));

    let url_repo: Arc<dyn UrlRepository> = if store_path.as_os_str() == IN_MEMORY_STORE {
        warn!("Using in-memory URL store; short URLs are lost on exit");
        Arc::new(InMemoryUrlRepository::default())
    } else {
        info!(store_path = %store_path.display(), "Opening URL store");
        Arc::new(JsonFileUrlRepository::open(store_path).await?)
    };
    set_url_repo(url_repo);

    info!("Container initialized");
    Ok(container)
}

/// Reads `name`, falling back to `default` when unset.
///
/// # Panics
/// Panics when the environment variable is not valid unicode.
fn env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) => {
            info!(value, "{name} environment variable set");
            value
        }
        Err(VarError::NotPresent) => {
            warn!("{name} environment variable not set; defaulting to {default}");
            default.to_owned()
        }
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    env_or("ADDR", "127.0.0.1:8080")
}

/// Origin that short URLs are built on.
///
/// # Panics
/// Panics when environment variable is invalid.
pub fn public_origin_capsule(_: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "PUBLIC_ORIGIN";
    let origin = env_or(ENV_VAR_NAME, "http://localhost:8080");
    Url::parse(&origin).unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is not a valid URL: {err}"))
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn store_path_capsule(_: CapsuleHandle) -> PathBuf {
    env_or("STORE_PATH", "shortened-urls.json").into()
}

/// Cosmetic pause before a short URL is resolved.
///
/// # Panics
/// Panics when environment variable is invalid.
pub fn redirect_delay_capsule(_: CapsuleHandle) -> Duration {
    const ENV_VAR_NAME: &str = "REDIRECT_DELAY_MS";
    let millis = env_or(ENV_VAR_NAME, "1000");
    Duration::from_millis(
        millis
            .parse()
            .unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is not a number of milliseconds: {err}")),
    )
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn log_endpoint_capsule(_: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "LOG_ENDPOINT";
    let endpoint = env_or(ENV_VAR_NAME, DEFAULT_LOG_ENDPOINT);
    Url::parse(&endpoint).unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is not a valid URL: {err}"))
}

/// Bearer token for the log service. There is deliberately no default.
///
/// # Panics
/// Panics when environment variable is not valid unicode.
pub fn log_bearer_token_capsule(_: CapsuleHandle) -> Option<String> {
    const ENV_VAR_NAME: &str = "LOG_BEARER_TOKEN";
    match env::var(ENV_VAR_NAME) {
        Ok(token) if token.is_empty() => None,
        Ok(token) => {
            info!("{ENV_VAR_NAME} environment variable set");
            Some(token)
        }
        Err(VarError::NotPresent) => {
            warn!("{ENV_VAR_NAME} environment variable not set; log requests are unauthenticated");
            None
        }
        Err(VarError::NotUnicode(_)) => {
            panic!("{ENV_VAR_NAME} environment variable is invalid unicode");
        }
    }
}
