use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// A JSON REST client with bearer authentication and a per-request timeout.
pub(crate) struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

/// One page of a paginated listing.
pub(crate) struct Page<T> {
    pub(crate) body: T,
    pub(crate) next_page: Option<u32>,
}

impl ApiClient {
    pub(crate) fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("linemark/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    /// Sends `req`, failing on a non-2xx status, and reads the body within the timeout.
    async fn execute(
        &self,
        method: &Method,
        path: &str,
        req: RequestBuilder,
    ) -> Result<(HeaderMap, String)> {
        log::info!("sending {method} {path}");
        let call = async {
            let resp: Response = req.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.text().await?;
            log::debug!("{method} {path} returned {status}: {body}");
            if !status.is_success() {
                return Err(Error::Status {
                    method: method.to_string(),
                    path: path.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Ok((headers, body))
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                operation: format!("{method} {path}"),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Page<T>> {
        let req = self.request(Method::GET, path).query(query);
        let (headers, body) = self.execute(&Method::GET, path, req).await?;
        Ok(Page {
            body: serde_json::from_str(&body)?,
            next_page: next_page(&headers),
        })
    }

    pub(crate) async fn get_text(&self, path: &str) -> Result<String> {
        let req = self.request(Method::GET, path);
        let (_, body) = self.execute(&Method::GET, path, req).await?;
        Ok(body)
    }

    pub(crate) async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<String> {
        let mut req = self.request(method.clone(), path).query(query);
        if let Some(body) = body {
            log::debug!("request payload: {}", serde_json::to_string(body)?);
            req = req.json(body);
        }
        let (_, body) = self.execute(&method, path, req).await?;
        Ok(body)
    }
}

/// GitLab's `x-next-page` header; empty on the last page.
fn next_page(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
