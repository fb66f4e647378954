//! Backend transport for the chat engine: REST + SSE API client, auth
//! flows, transport configuration and the persisted preference store.

pub mod api;
pub mod auth;
pub mod config;
pub mod http;
pub mod prefs;

pub use api::ApiClient;
pub use auth::{AuthClient, AuthError, AuthResult};
pub use config::ClientConfig;
pub use http::Backend;
pub use prefs::{PreferenceError, PreferenceStore, Preferences, ThemeMode};
