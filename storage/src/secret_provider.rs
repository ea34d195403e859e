//! Secret Provider abstraction for token specs that point at an external
//! secret manager.
//!
//! Google Cloud Secret Manager is reached over its REST API. The access token
//! comes from the instance metadata server unless one is supplied explicitly.
//! Both base URLs are overridable so tests can point them at a mock server.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use errors::CredentialError;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com";
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal";

#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Retrieve the latest version of a secret by resource name.
    async fn get_secret(&self, resource: &str) -> Result<String, CredentialError>;
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String
}

pub struct GoogleCloudSecretProvider {
    client: reqwest::Client,
    api_url: String,
    metadata_url: String,
    access_token: Option<String>
}

impl GoogleCloudSecretProvider {
    pub fn new(timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::CloudSecret {
                resource: String::new(),
                reason: e.to_string()
            })?;
        Ok(Self {
            client,
            api_url: DEFAULT_SECRET_MANAGER_URL.to_string(),
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            access_token: std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
        })
    }

    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// `projects/p/secrets/s` gets `/versions/latest` appended.
    pub fn version_resource(resource: &str) -> String {
        let trimmed = resource.trim_matches('/');
        if trimmed.contains("/versions/") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/versions/latest")
        }
    }

    async fn access_token(&self, resource: &str) -> Result<String, CredentialError> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }

        let fail = |reason: String| CredentialError::CloudSecret {
            resource: resource.to_string(),
            reason
        };
        let url = format!(
            "{}/computeMetadata/v1/instance/service-account/default/token",
            self.metadata_url
        );
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| fail(format!("metadata server unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(fail(format!("metadata server returned {}", response.status())));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| fail(e.to_string()))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl SecretProvider for GoogleCloudSecretProvider {
    async fn get_secret(&self, resource: &str) -> Result<String, CredentialError> {
        let version = Self::version_resource(resource);
        let fail = |reason: String| CredentialError::CloudSecret {
            resource: version.clone(),
            reason
        };

        let token = self.access_token(&version).await?;
        let url = format!("{}/v1/{}:access", self.api_url, version);
        debug!(resource = %version, "Accessing cloud secret");

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fail(format!("secret manager returned {}", response.status())));
        }

        let body: AccessSecretVersionResponse =
            response.json().await.map_err(|e| fail(e.to_string()))?;
        let bytes = general_purpose::STANDARD
            .decode(body.payload.data)
            .map_err(|e| fail(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| fail(e.to_string()))
    }
}
