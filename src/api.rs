use serde::{Deserialize, Serialize};

use crate::{
    url_repo::ShortLinkRecord,
    url_service::{FieldError, UrlCandidate},
};

#[derive(Deserialize)]
pub struct ShortenUrlsPayload {
    pub urls: Vec<UrlCandidate>,
}

#[derive(Serialize)]
pub struct ShortenedUrls {
    pub urls: Vec<ShortLinkRecord>,
}

#[derive(Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl Error {
    #[must_use]
    pub fn new(error: String, error_id: String) -> Self {
        Self {
            error,
            error_id,
            field_errors: Vec::new(),
        }
    }
}
