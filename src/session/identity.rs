//! Client side of the remote identity service

use super::rejection::Rejection;
use crate::config::IdentityConfig;
use async_trait::async_trait;
use hyper::header::{HeaderName, AUTHORIZATION, COOKIE};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Link relation carrying the logout URL in a ping response
pub const LOGOUT_LINK: &str = "logout";

/// Workspace kind identifying the authenticated user
const USER_WORKSPACE_KIND: &str = "user";

/// Connection-scoped credentials forwarded to the identity service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: Option<String>,
    pub authorization: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            cookie: header_string(headers, COOKIE),
            authorization: header_string(headers, AUTHORIZATION),
        }
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// Response to the lightweight handshake
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pong {
    #[serde(default)]
    pub links: Vec<Link>,
    /// `Set-Cookie` values the service sent with the handshake
    #[serde(skip)]
    pub set_cookies: Vec<String>,
}

impl Pong {
    pub fn get_link(&self, name: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == name)
            .map(|link| link.href.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Workspace {
    pub title: String,
    #[serde(default)]
    pub kind: String,
}

/// The authenticated user's workspaces and capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDocument {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    /// Onboarding or consent steps the user still has to complete
    #[serde(default)]
    pub login_actions: Vec<String>,
    #[serde(default, rename = "LogoutURL")]
    logout_url: Option<String>,
}

impl ServiceDocument {
    pub fn user_workspace(&self) -> Option<&Workspace> {
        self.workspaces
            .iter()
            .find(|w| w.kind == USER_WORKSPACE_KIND)
    }

    pub fn logout_url(&self) -> Option<&str> {
        self.logout_url.as_deref()
    }

    pub fn set_logout_url(&mut self, url: Option<String>) {
        self.logout_url = url;
    }
}

/// The operations the session manager needs from the identity service
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn ping(&self, credentials: &Credentials) -> Result<Pong, Rejection>;

    async fn service_document(&self, credentials: &Credentials) -> Result<ServiceDocument, Rejection>;
}

/// Identity service reached over HTTP
pub struct HttpIdentityService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityService {
    pub fn new(config: &IdentityConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, credentials: &Credentials) -> Result<reqwest::Response, Rejection> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(ref cookie) = credentials.cookie {
            request = request.header("cookie", cookie);
        }
        if let Some(ref authorization) = credentials.authorization {
            request = request.header("authorization", authorization);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Identity service request to {} failed: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%url, status = status.as_u16(), "Identity service rejected request");
            return Err(Rejection::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn ping(&self, credentials: &Credentials) -> Result<Pong, Rejection> {
        let response = self.get("/ping", credentials).await?;
        let set_cookies: Vec<String> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(String::from)
            .collect();

        let mut pong: Pong = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid ping response: {}", e))?;
        pong.set_cookies = set_cookies;
        Ok(pong)
    }

    async fn service_document(&self, credentials: &Credentials) -> Result<ServiceDocument, Rejection> {
        let response = self.get("/servicedocument", credentials).await?;
        let document = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Invalid service document: {}", e))?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "sid=abc".parse().unwrap());
        headers.insert(AUTHORIZATION, "Bearer t0ken".parse().unwrap());

        let credentials = Credentials::from_headers(&headers);
        assert_eq!(credentials.cookie.as_deref(), Some("sid=abc"));
        assert_eq!(credentials.authorization.as_deref(), Some("Bearer t0ken"));

        assert_eq!(Credentials::from_headers(&HeaderMap::new()), Credentials::default());
    }

    #[test]
    fn test_pong_links() {
        let pong: Pong = serde_json::from_str(
            r#"{"Links":[{"Rel":"self","Href":"/ping"},{"Rel":"logout","Href":"https://id.example.com/logout"}]}"#,
        )
        .unwrap();
        assert_eq!(pong.get_link(LOGOUT_LINK), Some("https://id.example.com/logout"));
        assert_eq!(pong.get_link("missing"), None);
        assert_eq!(Pong::default().get_link(LOGOUT_LINK), None);
    }

    #[test]
    fn test_service_document_user_workspace() {
        let mut document: ServiceDocument = serde_json::from_str(
            r#"{
                "Workspaces": [
                    {"Title": "Shared", "Kind": "team"},
                    {"Title": "alice", "Kind": "user"}
                ],
                "LoginActions": ["tos"]
            }"#,
        )
        .unwrap();

        assert_eq!(document.user_workspace().unwrap().title, "alice");
        assert_eq!(document.login_actions, vec!["tos"]);
        assert_eq!(document.logout_url(), None);

        document.set_logout_url(Some("/logout".to_string()));
        assert_eq!(document.logout_url(), Some("/logout"));

        let empty = ServiceDocument::default();
        assert!(empty.user_workspace().is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let service = HttpIdentityService::new(&IdentityConfig {
            url: "http://127.0.0.1:9000/api/".to_string(),
        })
        .unwrap();
        assert_eq!(service.base_url, "http://127.0.0.1:9000/api");
    }
}
