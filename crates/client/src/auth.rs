use std::sync::Arc;

use arc_swap::ArcSwapOption;
use mnemo_protocol::{
    GoogleAuthRequest, LoginRequest, RefreshRequest, RegisterRequest, TokenResponse,
    TransportError, User, UserDto,
};
use reqwest::Method;
use snafu::Snafu;

use crate::config::ClientConfig;
use crate::http::Backend;

pub type AuthResult<T> = Result<T, AuthError>;

/// User-facing authentication failures. This is the one place raw transport
/// errors are mapped to actionable messages; everything else keeps the
/// transport taxonomy.
#[derive(Debug, Snafu)]
pub enum AuthError {
    #[snafu(display("invalid email or password"))]
    InvalidCredentials { stage: &'static str },
    #[snafu(display("no account exists for that email"))]
    UserNotFound { stage: &'static str },
    #[snafu(display("could not reach the server: {message}"))]
    Network { stage: &'static str, message: String },
    #[snafu(display("authentication failed: {message}"))]
    Other { stage: &'static str, message: String },
}

impl AuthError {
    fn from_transport(stage: &'static str, error: TransportError) -> Self {
        if error.is_auth_failure() {
            Self::InvalidCredentials { stage }
        } else if error.is_not_found() {
            Self::UserNotFound { stage }
        } else if error.is_network() {
            Self::Network {
                stage,
                message: error.to_string(),
            }
        } else {
            Self::Other {
                stage,
                message: error.to_string(),
            }
        }
    }
}

/// Sign-in flows against the backend's auth endpoints. On success the access
/// token is installed on the shared [`Backend`], so the chat transport's
/// authenticated calls start working immediately.
pub struct AuthClient {
    backend: Arc<Backend>,
    refresh_token: ArcSwapOption<String>,
}

impl AuthClient {
    pub fn new(config: ClientConfig) -> AuthResult<Self> {
        let backend = Backend::new(config)
            .map_err(|error| AuthError::from_transport("auth-new", error))?;
        Ok(Self::with_backend(Arc::new(backend)))
    }

    pub fn with_backend(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            refresh_token: ArcSwapOption::empty(),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub async fn login(&self, email: &str, password: &str) -> AuthResult<User> {
        let request = self
            .backend
            .request(Method::POST, "/auth/login")
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            });
        self.establish_session(request, "login").await
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> AuthResult<User> {
        let request = self
            .backend
            .request(Method::POST, "/auth/register")
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            });
        self.establish_session(request, "register").await
    }

    /// Exchanges a Google ID token for a session.
    pub async fn login_with_google(&self, id_token: &str) -> AuthResult<User> {
        let request = self
            .backend
            .request(Method::POST, "/auth/google")
            .json(&GoogleAuthRequest {
                id_token: id_token.to_string(),
            });
        self.establish_session(request, "google-login").await
    }

    /// Re-mints the access token from the stored refresh token.
    pub async fn refresh(&self) -> AuthResult<()> {
        let refresh_token = self
            .refresh_token
            .load_full()
            .ok_or(AuthError::InvalidCredentials { stage: "refresh" })?;

        let request = self
            .backend
            .request(Method::POST, "/auth/refresh")
            .json(&RefreshRequest {
                refresh_token: refresh_token.as_ref().clone(),
            });
        let tokens: TokenResponse = self
            .backend
            .send_json(request, "refresh")
            .await
            .map_err(|error| AuthError::from_transport("refresh", error))?;

        self.install_tokens(tokens);
        Ok(())
    }

    pub async fn current_user(&self) -> AuthResult<User> {
        let request = self
            .backend
            .authed(Method::GET, "/auth/me", "current-user")
            .map_err(|error| AuthError::from_transport("current-user", error))?;
        let user: UserDto = self
            .backend
            .send_json(request, "current-user")
            .await
            .map_err(|error| AuthError::from_transport("current-user", error))?;

        Ok(user.into_user())
    }

    /// Deletes the signed-in account and drops the local session.
    pub async fn delete_account(&self) -> AuthResult<()> {
        let request = self
            .backend
            .authed(Method::DELETE, "/user/delete", "delete-account")
            .map_err(|error| AuthError::from_transport("delete-account", error))?;
        self.backend
            .send_no_content(request, "delete-account")
            .await
            .map_err(|error| AuthError::from_transport("delete-account", error))?;

        self.logout();
        Ok(())
    }

    pub fn logout(&self) {
        self.backend.set_access_token(None);
        self.refresh_token.store(None);
    }

    async fn establish_session(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> AuthResult<User> {
        let tokens: TokenResponse = self
            .backend
            .send_json(request, stage)
            .await
            .map_err(|error| AuthError::from_transport(stage, error))?;
        self.install_tokens(tokens);

        tracing::info!(stage, "authenticated");
        self.current_user().await
    }

    fn install_tokens(&self, tokens: TokenResponse) {
        self.backend.set_access_token(Some(tokens.access_token));
        if let Some(refresh_token) = tokens.refresh_token {
            self.refresh_token.store(Some(Arc::new(refresh_token)));
        }
    }
}
