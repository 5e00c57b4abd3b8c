//! Per-request context handed to handlers: the request plus the path
//! parameters captured by the matched route.

use std::collections::HashMap;

use thiserror::Error;

use crate::Request;

/// Errors from reading a request body inside a handler.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request has no body")]
    Missing,

    #[error("failed to read body: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|value| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-request context.
pub struct Context {
    request: Request,
    params: PathParams,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self { request, params }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    /// Deserializes the body as JSON. Spooled bodies are read from disk.
    pub async fn json<T>(&self) -> Result<T, BodyError>
    where
        T: serde::de::DeserializeOwned,
    {
        let content = self.request.content().ok_or(BodyError::Missing)?;
        let body = content.read_bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::Deserialize;

    use super::*;
    use crate::codec::{Content, DecodedBody};
    use crate::http::request::RequestHead;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Greeting {
        name: String,
    }

    fn request_with_body(body: &'static [u8]) -> Request {
        let head = RequestHead::parse(b"POST /greet HTTP/1.1\r\n\r\n", 8).unwrap();
        Request::new(0, head).with_body(DecodedBody {
            content: Content::bytes("application/json", Bytes::from_static(body)),
            form: None,
        })
    }

    #[tokio::test]
    async fn json_body_deserializes() {
        let ctx = Context::new(request_with_body(br#"{"name":"ferris"}"#));
        let greeting: Greeting = ctx.json().await.unwrap();
        assert_eq!(greeting, Greeting { name: "ferris".into() });
    }

    #[tokio::test]
    async fn json_without_body_is_missing() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n", 8).unwrap();
        let ctx = Context::new(Request::new(0, head));
        assert!(matches!(ctx.json::<Greeting>().await, Err(BodyError::Missing)));
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let ctx = Context::new(request_with_body(b"{nope"));
        assert!(matches!(ctx.json::<Greeting>().await, Err(BodyError::Json(_))));
    }

    #[test]
    fn params_lookup() {
        let mut params = PathParams::new();
        params.insert("id".into(), "42".into());
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.len(), 1);
    }
}
