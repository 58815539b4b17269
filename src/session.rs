//! Authentication state and the store that owns it.

use crate::error::{self, ApiError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

const INVALID_CREDENTIALS: &str = "Email ou mot de passe incorrect";
const LOGIN_UNREACHABLE: &str = "Erreur de connexion au serveur";
const SIGNUP_REJECTED: &str = "Échec de l'inscription. Cet email est peut-être déjà utilisé.";

/// Bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Authentication transitions, broadcast to every subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    /// Logout has started; the credential is still valid until `LoggedOut`.
    LoggingOut,
    LoggedOut,
    /// The server rejected the credential.
    Expired,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("Les mots de passe ne correspondent pas")]
    PasswordMismatch,
    #[error("missing field: {0}")]
    EmptyField(&'static str),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Network(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
}

impl SignupRequest {
    fn validate(&self) -> Result<(), AuthError> {
        if self.name.trim().is_empty() {
            return Err(AuthError::EmptyField("name"));
        }
        if self.email.trim().is_empty() {
            return Err(AuthError::EmptyField("email"));
        }
        if self.password.is_empty() {
            return Err(AuthError::EmptyField("password"));
        }
        if self.password != self.confirm_password {
            return Err(AuthError::PasswordMismatch);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<String>,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Source of truth for whether the user is signed in.
///
/// Logout happens in two steps so a caller can still use the credential
/// between [`SessionStore::begin_logout`] and [`SessionStore::complete_logout`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn token(&self) -> Option<Credential>;

    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    async fn login(&self, email: &str, password: &str) -> Result<(), AuthError>;

    async fn signup(&self, request: &SignupRequest) -> Result<(), AuthError>;

    /// Announces the logout and returns the credential, which stays valid.
    fn begin_logout(&self) -> Option<Credential>;

    /// Drops the credential.
    fn complete_logout(&self);

    /// Drops a credential the server no longer accepts.
    fn expire(&self);

    async fn validate_token(&self) -> bool;

    async fn change_password(&self, email: &str, new_password: &str) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    fn logout(&self) {
        self.begin_logout();
        self.complete_logout();
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ChangePasswordRequest<'a> {
    email: &'a str,
    new_password: &'a str,
}

/// Session store backed by the aiBotanik auth endpoints.
///
/// The credential survives restarts when a token file is configured.
pub struct HttpSessionStore {
    client: reqwest::Client,
    base_url: String,
    credential: RwLock<Option<Credential>>,
    user: RwLock<Option<UserProfile>>,
    token_file: Option<PathBuf>,
    events: broadcast::Sender<SessionEvent>,
}

impl HttpSessionStore {
    pub fn new(base_url: impl Into<String>, token_file: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(16);
        let credential = token_file.as_deref().and_then(read_token_file);
        if credential.is_some() {
            tracing::info!("restored credential from token file");
        }
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: RwLock::new(credential),
            user: RwLock::new(None),
            token_file,
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn set_credential(&self, credential: Option<Credential>) {
        if let Some(path) = &self.token_file {
            match &credential {
                Some(token) => write_token_file(path, token),
                None => remove_token_file(path),
            }
        }
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = credential;
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "login request failed");
                AuthError::Network(LOGIN_UNREACHABLE.to_string())
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let message = error::detail(&body).unwrap_or_else(|| INVALID_CREDENTIALS.to_string());
            return Err(AuthError::InvalidCredentials(message));
        }
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "login rejected");
            return Err(AuthError::Rejected(
                error::detail(&body).unwrap_or_else(|| LOGIN_UNREACHABLE.to_string()),
            ));
        }
        let token: TokenResponse = serde_json::from_str(&body).map_err(|err| {
            tracing::warn!(error = %err, "login response has no token");
            AuthError::Rejected(LOGIN_UNREACHABLE.to_string())
        })?;
        tracing::debug!(token_type = token.token_type.as_deref().unwrap_or("bearer"), "received token");
        Ok(Credential::new(token.access_token))
    }

    /// Profile of the signed-in user, cached after the first call.
    pub async fn current_user(&self) -> Result<UserProfile, ApiError> {
        if let Some(user) = self.user.read().unwrap_or_else(PoisonError::into_inner).clone() {
            return Ok(user);
        }
        let credential = self.token().ok_or(ApiError::NotAuthenticated)?;
        let response = self
            .client
            .get(self.url("/users/me"))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        let user: UserProfile = match error::read_json(response).await {
            Err(err) if err.is_auth_failure() => {
                self.expire();
                return Err(err);
            }
            other => other?,
        };
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = Some(user.clone());
        Ok(user)
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    fn token(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        if email.trim().is_empty() {
            return Err(AuthError::EmptyField("email"));
        }
        if password.is_empty() {
            return Err(AuthError::EmptyField("password"));
        }
        let credential = self.authenticate(email.trim(), password).await?;
        self.set_credential(Some(credential));
        tracing::info!("logged in");
        self.emit(SessionEvent::LoggedIn);
        Ok(())
    }

    async fn signup(&self, request: &SignupRequest) -> Result<(), AuthError> {
        request.validate()?;
        let response = self
            .client
            .post(self.url("/auth/signup"))
            .json(request)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "signup request failed");
                AuthError::Network(LOGIN_UNREACHABLE.to_string())
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "signup rejected");
            return Err(AuthError::Rejected(
                error::detail(&body).unwrap_or_else(|| SIGNUP_REJECTED.to_string()),
            ));
        }
        // The signup endpoint does not hand out a token; sign in right away.
        self.login(&request.email, &request.password).await
    }

    fn begin_logout(&self) -> Option<Credential> {
        let credential = self.token();
        if credential.is_some() {
            tracing::info!("logging out");
            self.emit(SessionEvent::LoggingOut);
        }
        credential
    }

    fn complete_logout(&self) {
        if self.token().is_none() {
            return;
        }
        self.set_credential(None);
        tracing::info!("logged out");
        self.emit(SessionEvent::LoggedOut);
    }

    fn expire(&self) {
        if self.token().is_none() {
            return;
        }
        self.set_credential(None);
        tracing::warn!("credential rejected by server, session expired");
        self.emit(SessionEvent::Expired);
    }

    async fn validate_token(&self) -> bool {
        let Some(credential) = self.token() else {
            return false;
        };
        let response = self
            .client
            .get(self.url("/auth/validate"))
            .bearer_auth(credential.expose())
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(status = response.status().as_u16(), "token no longer valid");
                self.expire();
                false
            }
            Err(err) => {
                // Unreachable server says nothing about the token.
                tracing::warn!(error = %err, "could not validate token");
                false
            }
        }
    }

    async fn change_password(&self, email: &str, new_password: &str) -> bool {
        let mut request = self
            .client
            .post(self.url("/auth/change-password"))
            .json(&ChangePasswordRequest {
                email,
                new_password,
            });
        if let Some(credential) = self.token() {
            request = request.bearer_auth(credential.expose());
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = response.status().as_u16(), "password change rejected");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "password change failed");
                false
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

// ============================================
// Token file
// ============================================

fn read_token_file(path: &Path) -> Option<Credential> {
    let token = std::fs::read_to_string(path).ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| Credential::new(token))
}

fn write_token_file(path: &Path, credential: &Credential) {
    if let Some(parent) = path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(error = %err, "failed to create token directory");
        return;
    }
    if let Err(err) = write_private(path, credential.expose().as_bytes()) {
        tracing::warn!(error = %err, "failed to store token");
    }
}

/// Writes `bytes` readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies to newly created files.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

fn remove_token_file(path: &Path) {
    if path.exists()
        && let Err(err) = std::fs::remove_file(path)
    {
        tracing::warn!(error = %err, "failed to remove token file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("eyJhbGciOiJIUzI1NiJ9.secret");
        let printed = format!("{credential:?}");
        assert_eq!(printed, "Credential(***)");
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_signup_validation() {
        let mut request = SignupRequest {
            name: "Awa".into(),
            email: "awa@example.com".into(),
            password: "secret".into(),
            confirm_password: "other".into(),
        };
        assert_eq!(request.validate(), Err(AuthError::PasswordMismatch));
        request.confirm_password = "secret".into();
        assert_eq!(request.validate(), Ok(()));
        request.name = " ".into();
        assert_eq!(request.validate(), Err(AuthError::EmptyField("name")));
    }

    #[test]
    fn test_signup_body_uses_camel_case_confirmation() {
        let request = SignupRequest {
            name: "Awa".into(),
            email: "awa@example.com".into(),
            password: "secret".into(),
            confirm_password: "secret".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["confirmPassword"], "secret");
    }

    #[tokio::test]
    async fn test_token_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botanik").join("auth_token");

        let store = HttpSessionStore::new("http://127.0.0.1:9", Some(path.clone()));
        assert!(!store.is_authenticated());
        store.set_credential(Some(Credential::new("tok-1")));

        let restored = HttpSessionStore::new("http://127.0.0.1:9", Some(path.clone()));
        assert_eq!(restored.token(), Some(Credential::new("tok-1")));

        let mut events = restored.subscribe();
        let held = restored.begin_logout();
        assert_eq!(held, Some(Credential::new("tok-1")));
        assert!(restored.is_authenticated());
        restored.complete_logout();
        assert!(!restored.is_authenticated());
        assert!(!path.exists());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggingOut);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_token");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_token_file(&path, &Credential::new("tok-2"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tok-2");

        let fresh = dir.path().join("nested").join("auth_token");
        write_token_file(&fresh, &Credential::new("tok-3"));
        let mode = std::fs::metadata(&fresh).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_login_rejects_empty_fields_without_network() {
        let store = HttpSessionStore::new("http://127.0.0.1:9", None);
        assert_eq!(
            store.login("", "pw").await,
            Err(AuthError::EmptyField("email"))
        );
        assert!(!store.validate_token().await);
    }
}
