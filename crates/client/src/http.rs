use std::sync::Arc;

use arc_swap::ArcSwapOption;
use mnemo_protocol::{TransportError, TransportResult};
use mnemo_protocol::error::DecodeSnafu;
use reqwest::{Method, header};
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use crate::config::ClientConfig;

/// Shared HTTP side of the transport: the connection pool, the base URL and
/// the bearer token. `ApiClient` and `AuthClient` both run through it.
pub struct Backend {
    http: reqwest::Client,
    config: ClientConfig,
    access_token: ArcSwapOption<String>,
}

impl Backend {
    pub fn new(config: ClientConfig) -> TransportResult<Self> {
        // No client-level timeout: it would cover the whole response body
        // and kill long event streams. JSON calls set one per request.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| TransportError::ClientBuild {
                stage: "backend-new",
                message: error.to_string(),
            })?;

        Ok(Self {
            http,
            config,
            access_token: ArcSwapOption::empty(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Installs (or clears) the bearer token used by authenticated calls.
    pub fn set_access_token(&self, token: Option<String>) {
        self.access_token.store(token.map(Arc::new));
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.load().is_some()
    }

    /// Request builder for an endpoint that does not require a token.
    pub(crate) fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http.request(method, self.config.endpoint(path))
    }

    /// Request builder carrying the bearer token; fails synchronously with
    /// `Unauthenticated` when none is set.
    pub(crate) fn authed(
        &self,
        method: Method,
        path: &str,
        stage: &'static str,
    ) -> TransportResult<reqwest::RequestBuilder> {
        let token = self
            .access_token
            .load_full()
            .ok_or(TransportError::Unauthenticated { stage })?;

        Ok(self
            .request(method, path)
            .header(header::AUTHORIZATION, format!("Bearer {token}")))
    }

    /// Sends a request and decodes the JSON body, mapping non-success status
    /// codes to `Status` with the raw body preserved for diagnostics.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> TransportResult<T> {
        let body = self.send_expecting_success(request, stage).await?;
        serde_json::from_str(&body).context(DecodeSnafu { stage })
    }

    /// Sends a request where the response body is irrelevant (e.g. a 204).
    pub(crate) async fn send_no_content(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> TransportResult<()> {
        self.send_expecting_success(request, stage).await?;
        Ok(())
    }

    async fn send_expecting_success(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> TransportResult<String> {
        let response = request
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|error| TransportError::Network {
                stage,
                message: error.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| TransportError::Network {
                stage,
                message: error.to_string(),
            })?;

        if !status.is_success() {
            tracing::debug!(%status, stage, "request rejected by server");
            return Err(TransportError::Status {
                stage,
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}
