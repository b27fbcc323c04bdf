//! Credential handling for the GitHub API.
//!
//! Three kinds of identity are supported: a classic personal access token,
//! a GitHub App (which signs a short-lived RS256 assertion), and a generic
//! bearer token. All of them hand the request pipeline an [`AuthToken`]
//! whose `Authorization` value is the literal `"<scheme> <token>"`.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};

use crate::github::error::{GithubError, Result};

/// How far in the past the app assertion's `iat` claim is backdated, to
/// absorb clock skew between us and the server.
const ASSERTION_BACKDATE_SECS: i64 = 60;
/// Lifetime of the signed assertion itself.
const ASSERTION_TTL_SECS: i64 = 600;
/// How long a produced app credential is kept before re-signing.
const APP_TOKEN_TTL_SECS: i64 = 3600;

/// A credential plus the scheme to present it under.
#[derive(Debug, Clone)]
pub struct AuthToken {
    secret: SecretString,
    scheme: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(
        secret: impl Into<String>,
        scheme: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        AuthToken {
            secret: SecretString::from(secret.into()),
            scheme: scheme.into(),
            expires_at,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// A token with no expiry never expires.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// The value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.secret.expose_secret())
    }
}

/// An identity the client can authenticate as.
#[derive(Debug)]
pub enum Authenticator {
    /// A personal access token, presented with the `token` scheme.
    PersonalToken(AuthToken),
    /// A GitHub App identity. See [`AppAuth`].
    App(AppAuth),
    /// A pre-issued token with a caller-chosen scheme (`Bearer` by default).
    Bearer(AuthToken),
}

impl Authenticator {
    /// Personal access token identity. Fails when the token is empty.
    pub fn personal_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(GithubError::authentication(
                "personal access token is required",
            ));
        }
        Ok(Authenticator::PersonalToken(AuthToken::new(
            token, "token", None,
        )))
    }

    /// GitHub App identity from an app id and an RSA private key in PEM form.
    pub fn app(app_id: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Authenticator::App(AppAuth::new(app_id, private_key_pem))
    }

    /// Generic bearer identity; `scheme` defaults to `Bearer`.
    pub fn bearer(token: impl Into<String>, scheme: Option<&str>) -> Self {
        Authenticator::Bearer(AuthToken::new(
            token,
            scheme.unwrap_or("Bearer"),
            None,
        ))
    }

    /// The current credential, refreshing first if the stored one expired.
    /// Safe to call from many concurrent requests.
    pub async fn token(&self) -> Result<AuthToken> {
        match self {
            Authenticator::PersonalToken(token) | Authenticator::Bearer(token) => Ok(token.clone()),
            Authenticator::App(app) => app.token().await,
        }
    }

    /// Force a refresh. A no-op for static identities.
    pub async fn refresh(&self) -> Result<AuthToken> {
        match self {
            Authenticator::PersonalToken(token) | Authenticator::Bearer(token) => Ok(token.clone()),
            Authenticator::App(app) => app.refresh().await,
        }
    }

    /// Whether the currently held credential is usable without a refresh.
    pub async fn is_valid(&self) -> bool {
        match self {
            Authenticator::PersonalToken(_) | Authenticator::Bearer(_) => true,
            Authenticator::App(app) => app.is_valid().await,
        }
    }
}

#[derive(serde::Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// GitHub App identity.
///
/// Produces a Bearer credential by signing an RS256 assertion with the
/// app's private key. The signed assertion is used directly as the
/// credential and is never exchanged for an installation token; callers
/// that need installation-scoped access must do that exchange themselves.
#[derive(Debug)]
pub struct AppAuth {
    app_id: String,
    private_key: SecretString,
    current: tokio::sync::Mutex<Option<AuthToken>>,
}

impl AppAuth {
    pub fn new(app_id: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        AppAuth {
            app_id: app_id.into(),
            private_key: SecretString::from(private_key_pem.into()),
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// The cached credential, re-signed once its expiry has passed. The
    /// internal lock serializes refresh so concurrent callers trigger at
    /// most one signature per expiry window.
    pub async fn token(&self) -> Result<AuthToken> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref()
            && !token.is_expired()
        {
            return Ok(token.clone());
        }
        let token = self.issue()?;
        *current = Some(token.clone());
        Ok(token)
    }

    pub async fn refresh(&self) -> Result<AuthToken> {
        let mut current = self.current.lock().await;
        let token = self.issue()?;
        *current = Some(token.clone());
        Ok(token)
    }

    pub async fn is_valid(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|token| !token.is_expired())
    }

    fn issue(&self) -> Result<AuthToken> {
        let assertion = self.sign_assertion()?;
        let expires_at = Utc::now() + chrono::Duration::seconds(APP_TOKEN_TTL_SECS);
        Ok(AuthToken::new(assertion, "Bearer", Some(expires_at)))
    }

    fn sign_assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - ASSERTION_BACKDATE_SECS,
            exp: now + ASSERTION_TTL_SECS,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| GithubError::authentication(format!("failed to sign app assertion: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| GithubError::authentication(format!("failed to sign app assertion: {e}")))
    }
}
