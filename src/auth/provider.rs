// OAuth 2.0 device authorization grant (RFC 8628) over HTTP

use super::{AuthDomain, Credentials, DeviceCodeProvider, DeviceGrant, PollOutcome, ProviderError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;

const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL: u64 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub device_authorization_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default, alias = "verification_url_complete")]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct HttpDeviceCodeProvider {
    client: reqwest::Client,
    domain: AuthDomain,
    endpoints: Option<OAuthEndpoints>,
    remediation: Vec<String>,
}

impl HttpDeviceCodeProvider {
    /// `remediation` lists what an operator must do when `endpoints` is missing.
    pub fn new(
        domain: AuthDomain,
        endpoints: Option<OAuthEndpoints>,
        remediation: Vec<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            domain,
            endpoints,
            remediation,
        })
    }

    fn endpoints(&self) -> Result<&OAuthEndpoints, ProviderError> {
        self.endpoints
            .as_ref()
            .ok_or_else(|| ProviderError::ConfigurationRequired {
                message: format!("{} authentication is not configured", self.domain),
                remediation: self.remediation.clone(),
            })
    }
}

#[async_trait]
impl DeviceCodeProvider for HttpDeviceCodeProvider {
    async fn request_grant(&self) -> Result<DeviceGrant, ProviderError> {
        let endpoints = self.endpoints()?;
        let mut form = vec![("client_id", endpoints.client_id.as_str())];
        if let Some(scope) = endpoints.scope.as_deref() {
            form.push(("scope", scope));
        }

        let response = self
            .client
            .post(&endpoints.device_authorization_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("device authorization returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(describe_error_body(&body, status.as_u16())));
        }

        let body: DeviceAuthorizationResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed device authorization response: {}", e)))?;
        tracing::info!("Received {} device code, expires in {}s", self.domain, body.expires_in);

        Ok(DeviceGrant {
            device_code: body.device_code,
            user_code: body.user_code,
            verification_url: body.verification_uri,
            verification_url_direct: body.verification_uri_complete,
            expires_in: body.expires_in,
            poll_interval_seconds: body.interval.unwrap_or(DEFAULT_POLL_INTERVAL).max(1),
        })
    }

    async fn poll(&self, grant: &DeviceGrant) -> Result<PollOutcome, ProviderError> {
        let endpoints = self.endpoints()?;
        let form = [
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("device_code", grant.device_code.as_str()),
            ("client_id", endpoints.client_id.as_str()),
        ];

        let response = self
            .client
            .post(&endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("token endpoint returned {}", status)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if status.is_success() {
            let token: TokenResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::Rejected(format!("malformed token response: {}", e)))?;
            let now = Utc::now();
            return Ok(PollOutcome::Authorized(Credentials {
                domain: self.domain,
                access_token: Some(token.access_token),
                refresh_token: token.refresh_token,
                expires_at: token.expires_in.map(|secs| now + ChronoDuration::seconds(secs)),
                obtained_at: now,
            }));
        }

        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => map_token_error(&err.error, err.error_description),
            Err(_) => Err(ProviderError::Rejected(describe_error_body(&body, status.as_u16()))),
        }
    }
}

/// Map an RFC 8628 section 3.5 error code to a poll outcome.
fn map_token_error(code: &str, description: Option<String>) -> Result<PollOutcome, ProviderError> {
    match code {
        "authorization_pending" => Ok(PollOutcome::Pending),
        "slow_down" => Ok(PollOutcome::SlowDown),
        "expired_token" => Ok(PollOutcome::Expired),
        "access_denied" => Ok(PollOutcome::Denied(
            description.unwrap_or_else(|| "authorization was denied".to_string()),
        )),
        other => Err(ProviderError::Rejected(match description {
            Some(d) => format!("{}: {}", other, d),
            None => other.to_string(),
        })),
    }
}

fn describe_error_body(body: &str, status: u16) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => match err.error_description {
            Some(d) => format!("{}: {}", err.error, d),
            None => err.error,
        },
        Err(_) => format!("HTTP {}", status),
    }
}
