use crate::domain::models::{CalendarIntegration, OAuthToken};
use crate::infrastructure::credential_store::IntegrationStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{
    OAuthCodeExchangeRequest, OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use url::Url;

const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8080/oauth2/callback";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/calendar.events";
const TOKEN_LEEWAY_SECONDS: i64 = 60;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
}

impl OAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureTokenResult {
    Existing(OAuthToken),
    Refreshed(OAuthToken),
    /// The user never connected or disconnected on purpose.
    NotConnected,
    /// Consent was revoked; the integration is now marked disconnected.
    Disconnected,
}

pub struct OAuthManager<S, C>
where
    S: IntegrationStore,
    C: OAuthHttpClient,
{
    config: OAuthConfig,
    store: Arc<S>,
    oauth_client: Arc<C>,
    now_provider: NowProvider,
}

impl<S, C> OAuthManager<S, C>
where
    S: IntegrationStore,
    C: OAuthHttpClient,
{
    pub fn new(config: OAuthConfig, store: Arc<S>, oauth_client: Arc<C>) -> Self {
        Self {
            config,
            store,
            oauth_client,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn is_token_valid(&self, token: &OAuthToken) -> bool {
        token.is_valid_at((self.now_provider)(), TOKEN_LEEWAY_SECONDS)
    }

    pub fn build_authorization_url(&self, state: &str) -> Result<String, InfraError> {
        if state.trim().is_empty() {
            return Err(InfraError::OAuth("state must not be empty".to_string()));
        }
        if self.config.scopes.is_empty() {
            return Err(InfraError::OAuth("at least one scope is required".to_string()));
        }

        let mut url = Url::parse(&self.config.authorization_endpoint)
            .map_err(|error| InfraError::OAuth(format!("invalid authorization endpoint: {error}")))?;
        let scope = self.config.scopes.join(" ");

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        Ok(url.to_string())
    }

    /// OAuth callback: exchanges the code and records a connected integration.
    pub async fn authenticate_with_code(
        &self,
        user_id: &str,
        authorization_code: &str,
    ) -> Result<CalendarIntegration, InfraError> {
        if user_id.trim().is_empty() {
            return Err(InfraError::OAuth("user id must not be empty".to_string()));
        }
        if authorization_code.trim().is_empty() {
            return Err(InfraError::OAuth("authorization code must not be empty".to_string()));
        }

        let response = self
            .oauth_client
            .exchange_authorization_code(OAuthCodeExchangeRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                redirect_uri: self.config.redirect_uri.clone(),
                authorization_code: authorization_code.trim().to_string(),
            })
            .await?;

        // Google omits the refresh token on re-consent; keep the previous one.
        let previous_refresh_token = self
            .store
            .load(user_id)?
            .and_then(|integration| integration.token.refresh_token);
        let integration = CalendarIntegration {
            user_id: user_id.to_string(),
            token: self.token_from_response(response, previous_refresh_token),
            connected: true,
            connected_at: (self.now_provider)(),
        };
        self.store.save(&integration)?;
        tracing::info!(user_id, "calendar integration connected");
        Ok(integration)
    }

    pub async fn ensure_access_token(&self, user_id: &str) -> Result<EnsureTokenResult, InfraError> {
        let Some(mut integration) = self.store.load(user_id)? else {
            return Ok(EnsureTokenResult::NotConnected);
        };
        if !integration.connected {
            return Ok(EnsureTokenResult::NotConnected);
        }

        if self.is_token_valid(&integration.token) {
            return Ok(EnsureTokenResult::Existing(integration.token));
        }

        let Some(refresh_token) = integration.token.refresh_token.clone() else {
            tracing::warn!(user_id, "access token expired and no refresh token is stored");
            self.mark_disconnected(&mut integration)?;
            return Ok(EnsureTokenResult::Disconnected);
        };

        let refreshed = self
            .oauth_client
            .refresh_access_token(OAuthRefreshRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                refresh_token,
            })
            .await;

        match refreshed {
            Ok(response) => {
                integration.token =
                    self.token_from_response(response, integration.token.refresh_token.clone());
                self.store.save(&integration)?;
                tracing::debug!(user_id, "access token refreshed");
                Ok(EnsureTokenResult::Refreshed(integration.token))
            }
            Err(InfraError::InvalidGrant(detail)) => {
                tracing::warn!(user_id, detail = %detail, "refresh token rejected; disconnecting");
                self.mark_disconnected(&mut integration)?;
                Ok(EnsureTokenResult::Disconnected)
            }
            Err(error) => Err(error),
        }
    }

    pub fn disconnect(&self, user_id: &str) -> Result<(), InfraError> {
        self.store.delete(user_id)?;
        tracing::info!(user_id, "calendar integration removed");
        Ok(())
    }

    fn mark_disconnected(&self, integration: &mut CalendarIntegration) -> Result<(), InfraError> {
        integration.connected = false;
        self.store.save(integration)
    }

    fn token_from_response(
        &self,
        response: OAuthTokenResponse,
        fallback_refresh_token: Option<String>,
    ) -> OAuthToken {
        let expires_at = (self.now_provider)() + Duration::seconds(response.expires_in.max(0));
        OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(fallback_refresh_token),
            expires_at,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
        }
    }
}

pub fn load_oauth_config_from_env() -> Result<OAuthConfig, InfraError> {
    load_oauth_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_oauth_config_from_lookup<F>(lookup: F) -> Result<OAuthConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = required_lookup_value(
        &lookup,
        &["TASKCAL_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"],
        "google client id",
    )?;
    let client_secret = required_lookup_value(
        &lookup,
        &["TASKCAL_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"],
        "google client secret",
    )?;
    let redirect_uri = optional_lookup_value(
        &lookup,
        &["TASKCAL_GOOGLE_REDIRECT_URI", "GOOGLE_REDIRECT_URI"],
    )
    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());
    let scopes = optional_lookup_value(&lookup, &["TASKCAL_GOOGLE_SCOPES", "GOOGLE_SCOPES"])
        .map(|raw| parse_scope_list(&raw))
        .filter(|scopes| !scopes.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);

    Ok(OAuthConfig::new(
        client_id,
        client_secret,
        redirect_uri,
        scopes,
    ))
}

fn required_lookup_value<F>(
    lookup: &F,
    keys: &[&str],
    field_name: &str,
) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_scope_list(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\n', '\t'])
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum FakeResponse {
        Success(OAuthTokenResponse),
        OAuthError(String),
        InvalidGrant,
    }

    impl Default for FakeResponse {
        fn default() -> Self {
            Self::Success(OAuthTokenResponse {
                access_token: "fake_access".to_string(),
                refresh_token: Some("fake_refresh".to_string()),
                expires_in: 3600,
                token_type: Some("Bearer".to_string()),
                scope: Some("scope-a scope-b".to_string()),
            })
        }
    }

    impl FakeResponse {
        fn into_result(self) -> Result<OAuthTokenResponse, InfraError> {
            match self {
                Self::Success(value) => Ok(value),
                Self::OAuthError(message) => Err(InfraError::OAuth(message)),
                Self::InvalidGrant => Err(InfraError::InvalidGrant("revoked".to_string())),
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeOAuthHttpClient {
        exchange_response: Mutex<FakeResponse>,
        refresh_response: Mutex<FakeResponse>,
        pub exchange_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
    }

    impl FakeOAuthHttpClient {
        pub fn set_exchange_response(&self, response: FakeResponse) {
            let mut guard = self.exchange_response.lock().expect("exchange mutex poisoned");
            *guard = response;
        }

        pub fn set_refresh_response(&self, response: FakeResponse) {
            let mut guard = self.refresh_response.lock().expect("refresh mutex poisoned");
            *guard = response;
        }
    }

    #[async_trait::async_trait]
    impl OAuthHttpClient for FakeOAuthHttpClient {
        async fn exchange_authorization_code(
            &self,
            _request: OAuthCodeExchangeRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.exchange_response
                .lock()
                .expect("exchange mutex poisoned")
                .clone()
                .into_result()
        }

        async fn refresh_access_token(
            &self,
            _request: OAuthRefreshRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_response
                .lock()
                .expect("refresh mutex poisoned")
                .clone()
                .into_result()
        }
    }

    pub fn test_config() -> OAuthConfig {
        OAuthConfig::new(
            "client-id",
            "client-secret",
            "http://localhost/oauth2/callback",
            vec!["https://www.googleapis.com/auth/calendar.events".to_string()],
        )
    }

    pub fn connected_integration(user_id: &str, expires_at: DateTime<Utc>) -> CalendarIntegration {
        CalendarIntegration {
            user_id: user_id.to_string(),
            token: OAuthToken {
                access_token: format!("access-{user_id}"),
                refresh_token: Some("refresh-token".to_string()),
                expires_at,
                token_type: "Bearer".to_string(),
                scope: None,
            },
            connected: true,
            connected_at: expires_at - Duration::hours(1),
        }
    }
}
