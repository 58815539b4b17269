use thiserror::Error;

/// Failures talking to the aiBotanik backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no credential available")]
    NotAuthenticated,
    #[error("credential rejected by the server (HTTP {0})")]
    Unauthorized(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

impl ApiError {
    /// True when the server says the credential is no longer valid.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Reads a response body, mapping 401/403 to [`ApiError::Unauthorized`] and
/// every other non-success status to [`ApiError::Status`].
pub(crate) async fn read_body(response: reqwest::Response) -> ApiResult<String> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized(status.as_u16()));
    }
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

pub(crate) async fn read_json<T>(response: reqwest::Response) -> ApiResult<T>
where
    T: serde::de::DeserializeOwned,
{
    let body = read_body(response).await?;
    Ok(serde_json::from_str(&body)?)
}

/// Pulls FastAPI's `detail` field out of an error body, if there is one.
pub(crate) fn detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
