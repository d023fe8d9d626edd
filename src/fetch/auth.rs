use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;

use super::HttpClient;

/// An [`HttpClient`] wrapper that injects `Authorization: Bearer <token>`
/// on every request. The REST source authenticates this way; the binary
/// feed endpoints are public and use the inner client directly.
pub struct Bearer<C> {
    inner: C,
    header_value: String,
}

impl<C> Bearer<C> {
    pub fn new(inner: C, token: &str) -> Self {
        Self {
            inner,
            header_value: format!("Bearer {token}"),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for Bearer<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if let Ok(value) = self.header_value.parse() {
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        self.inner.execute(req).await
    }
}
