use chrono::Utc;
use errors::CodeHostError;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const DEFAULT_RETRY_AFTER_SECONDS: u64 = 60;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a host expects its token.
#[derive(Clone)]
pub enum HostAuth {
    Anonymous,
    /// `Authorization: Bearer <token>` (GitHub)
    Bearer(String),
    /// `PRIVATE-TOKEN: <token>` (GitLab)
    PrivateToken(String),
    /// `Authorization: token <token>` (Gitea)
    Token(String)
}

/// Thin JSON client for one code host REST API.
#[derive(Clone)]
pub struct HostClient {
    client: Client,
    host: String,
    api_url: String,
    auth: HostAuth
}

impl HostClient {
    pub fn new(api_url: &str, auth: HostAuth) -> Result<Self, CodeHostError> {
        let host = url::Url::parse(api_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .ok_or_else(|| CodeHostError::InvalidConfig {
                reason: format!("invalid API url {api_url}")
            })?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("sync-engine")
            .build()
            .map_err(|e| CodeHostError::Http {
                host: host.clone(),
                reason: e.to_string()
            })?;

        Ok(Self {
            client,
            host,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth
        })
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.auth, HostAuth::Anonymous)
    }

    fn url_for(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.api_url, path_or_url)
        }
    }

    /// GET returning the decoded body and the `rel="next"` link, or `None`
    /// on 404.
    async fn get<T: DeserializeOwned>(&self, path_or_url: &str) -> Result<Option<(T, Option<String>)>, CodeHostError> {
        let url = self.url_for(path_or_url);
        debug!(url = %url, "Making code host API request");

        let mut request = self.client.get(&url).header("Accept", "application/json");
        request = match &self.auth {
            HostAuth::Anonymous => request,
            HostAuth::Bearer(token) => request.header("Authorization", format!("Bearer {token}")),
            HostAuth::PrivateToken(token) => request.header("PRIVATE-TOKEN", token),
            HostAuth::Token(token) => request.header("Authorization", format!("token {token}"))
        };

        let response = request.send().await.map_err(|e| CodeHostError::Http {
            host: self.host.clone(),
            reason: e.to_string()
        })?;
        let next_link = extract_next_link(response.headers());

        match response.status() {
            status if status.is_success() => {
                let body = response.json::<T>().await.map_err(|e| CodeHostError::Http {
                    host: self.host.clone(),
                    reason: e.to_string()
                })?;
                Ok(Some((body, next_link)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status if is_rate_limited(status, response.headers()) => Err(CodeHostError::RateLimited {
                host: self.host.clone(),
                retry_after_seconds: retry_after_seconds(response.headers())
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CodeHostError::Api {
                    host: self.host.clone(),
                    status: status.as_u16(),
                    message: body
                })
            }
        }
    }

    pub async fn get_one<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, CodeHostError> {
        Ok(self.get::<T>(path).await?.map(|(body, _)| body))
    }

    /// Follows `Link` pagination until the last page. A 404 on the first
    /// page yields `None`.
    pub async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> Result<Option<Vec<T>>, CodeHostError> {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());
        let mut first = true;

        while let Some(page) = next.take() {
            match self.get::<Vec<T>>(&page).await? {
                Some((batch, link)) => {
                    items.extend(batch);
                    next = link;
                }
                None if first => return Ok(None),
                None => break
            }
            first = false;
        }
        Ok(Some(items))
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    match status {
        StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::FORBIDDEN => {
            headers.contains_key("retry-after")
                || header_str(headers, "x-ratelimit-remaining") == Some("0")
        }
        _ => false
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `retry-after` in seconds, else seconds until `x-ratelimit-reset`.
pub(crate) fn retry_after_seconds(headers: &HeaderMap) -> u64 {
    if let Some(seconds) = header_str(headers, "retry-after").and_then(|s| s.trim().parse::<u64>().ok()) {
        return seconds;
    }
    header_str(headers, "x-ratelimit-reset")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|reset| u64::try_from(reset - Utc::now().timestamp()).unwrap_or(0).max(1))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS)
}

fn extract_next_link(headers: &HeaderMap) -> Option<String> {
    let link = header_str(headers, "link")?;
    link.split(',').find_map(|part| {
        if !part.contains("rel=\"next\"") {
            return None;
        }
        let url = part.split(';').next()?;
        Some(url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_next_link_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://api.github.com/orgs/a/repos?page=2>; rel=\"next\", <https://api.github.com/orgs/a/repos?page=5>; rel=\"last\""
            )
        );
        assert_eq!(
            extract_next_link(&headers).as_deref(),
            Some("https://api.github.com/orgs/a/repos?page=2")
        );
        assert_eq!(extract_next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn test_retry_after_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("17"));
        assert_eq!(retry_after_seconds(&headers), 17);

        let mut headers = HeaderMap::new();
        let reset = (Utc::now().timestamp() + 30).to_string();
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&reset).unwrap());
        let secs = retry_after_seconds(&headers);
        assert!((28..=30).contains(&secs));

        assert_eq!(retry_after_seconds(&HeaderMap::new()), DEFAULT_RETRY_AFTER_SECONDS);
    }

    #[tokio::test]
    async fn test_pagination_follows_link_header() {
        let server = MockServer::start().await;
        let next = format!("<{}/items?page=2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([3])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([1, 2]))
                    .insert_header("link", next.as_str())
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = HostClient::new(&server.uri(), HostAuth::Bearer("tok".to_string())).unwrap();
        let items: Vec<u32> = client.get_paginated("/items").await.unwrap().unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rate_limit_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no access"))
            .mount(&server)
            .await;

        let client = HostClient::new(&server.uri(), HostAuth::Anonymous).unwrap();
        let limited = client.get_one::<serde_json::Value>("/limited").await.unwrap_err();
        assert!(matches!(
            limited,
            CodeHostError::RateLimited {
                retry_after_seconds: 5,
                ..
            }
        ));

        let forbidden = client.get_one::<serde_json::Value>("/forbidden").await.unwrap_err();
        assert!(matches!(forbidden, CodeHostError::Api { status: 403, .. }));

        let missing = client.get_paginated::<serde_json::Value>("/missing").await.unwrap();
        assert!(missing.is_none());
    }
}
