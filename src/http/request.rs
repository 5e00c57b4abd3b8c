//! HTTP/1.1 request head parsing using the [`httparse`] crate.
//!
//! The connection reader assembles a complete header block line by line and
//! hands it to [`RequestHead::parse`]; the body is decoded separately and
//! attached when the [`Request`] is built.

use crate::codec::{Content, DecodedBody, Form, form::parse_urlencoded};
use crate::error::ConnectionError;

use super::{Headers, Method, Version};

/// The request line and header fields of one request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    /// Parses a complete header block, terminating blank line included.
    ///
    /// Header values are split on `,` into separate values (see
    /// [`Headers::insert_raw`]).
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::TooManyHeaders`]: more than `max_headers` fields.
    /// - [`ConnectionError::MalformedRequestLine`]: anything else httparse rejects.
    ///
    /// # Examples
    ///
    /// ```
    /// use pipehttp::http::request::RequestHead;
    ///
    /// let head = RequestHead::parse(b"GET /a?b=c HTTP/1.1\r\nAccept: x, y\r\n\r\n", 16).unwrap();
    /// assert_eq!(head.target, "/a?b=c");
    /// assert_eq!(head.headers.get_all("accept").collect::<Vec<_>>(), vec!["x", "y"]);
    /// ```
    pub fn parse(block: &[u8], max_headers: usize) -> Result<Self, ConnectionError> {
        let mut headers = vec![httparse::EMPTY_HEADER; max_headers];
        let mut raw_req = httparse::Request::new(&mut headers);

        match raw_req.parse(block) {
            Ok(httparse::Status::Complete(consumed)) if consumed == block.len() => {}
            Ok(httparse::Status::Complete(_)) => {
                return Err(ConnectionError::MalformedRequestLine(
                    "bytes after end of header block".into(),
                ));
            }
            Ok(httparse::Status::Partial) => {
                return Err(ConnectionError::MalformedRequestLine(
                    "incomplete header block".into(),
                ));
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ConnectionError::TooManyHeaders { limit: max_headers });
            }
            Err(e) => return Err(ConnectionError::MalformedRequestLine(e.to_string())),
        }

        let method: Method = match raw_req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(ConnectionError::MalformedRequestLine("missing method".into())),
        };
        let target = raw_req
            .path
            .ok_or_else(|| ConnectionError::MalformedRequestLine("missing target".into()))?
            .to_owned();
        let version = raw_req
            .version
            .and_then(Version::from_minor)
            .ok_or_else(|| ConnectionError::MalformedRequestLine("unsupported version".into()))?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            header_map.insert_raw(header.name, &value);
        }

        Ok(Self {
            method,
            target,
            version,
            headers: header_map,
        })
    }

    /// Returns `true` if the connection may stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

/// A fully read HTTP/1.1 request.
///
/// Built by the connection reader once the head and any body have been
/// decoded. Immutable from then on.
#[derive(Debug)]
pub struct Request {
    id: u64,
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    cookies: Vec<(String, String)>,
    params: Vec<(String, String)>,
    content: Option<Content>,
    form: Option<Form>,
    close_after: bool,
}

impl Request {
    /// Builds a request without a body.
    pub fn new(id: u64, head: RequestHead) -> Self {
        let close_after = !head.is_keep_alive();
        let (path, query) = match head.target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (head.target, None),
        };
        let params = query.as_deref().map(parse_urlencoded).unwrap_or_default();
        let cookies = parse_cookies(&head.headers);

        Self {
            id,
            method: head.method,
            path,
            query,
            version: head.version,
            headers: head.headers,
            cookies,
            params,
            content: None,
            form: None,
            close_after,
        }
    }

    /// Attaches a decoded body.
    #[must_use]
    pub fn with_body(mut self, body: DecodedBody) -> Self {
        self.content = Some(body.content);
        self.form = body.form;
        self
    }

    /// Marks the request as the last one on its connection.
    #[must_use]
    pub fn close_after(mut self) -> Self {
        self.close_after = true;
        self
    }

    /// Per-connection sequence number, starting at 0.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        lookup(&self.params, key)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        lookup(&self.cookies, name)
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// Returns the decoded body, if the request carried one.
    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    /// Takes ownership of the body, e.g. to read a spooled file.
    pub fn take_content(&mut self) -> Option<Content> {
        self.content.take()
    }

    /// Returns the parsed form for url-encoded and multipart bodies.
    pub fn form(&self) -> Option<&Form> {
        self.form.as_ref()
    }

    /// Returns `true` if the connection closes once this request is answered.
    pub fn closes_connection(&self) -> bool {
        self.close_after
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

// `Cookie: a=1; b=2` -> [("a", "1"), ("b", "2")]
fn parse_cookies(headers: &Headers) -> Vec<(String, String)> {
    headers
        .get_all("cookie")
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}
