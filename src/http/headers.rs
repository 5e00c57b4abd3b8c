//! HTTP header map with case-insensitive name lookup.
//!
//! Each header name maps to an ordered list of values. On the wire the values of
//! one name share a single line, joined with `", "`.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves the order in which names first appear and the order of values within
/// a name.
///
/// # Examples
///
/// ```
/// use pipehttp::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("X-Custom", "first");
/// headers.insert("x-custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let all: Vec<_> = headers.get_all("X-CUSTOM").collect();
/// assert_eq!(all, vec!["first", "second"]);
/// assert_eq!(headers.to_string(), "Content-Type: text/html; charset=utf-8\r\nX-Custom: first, second\r\n");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, Vec<String>)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` names.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a value. A name seen before keeps its original spelling and
    /// position; the value joins the end of its list.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.inner[idx].1.push(value),
            None => self.inner.push((name, vec![value])),
        }
    }

    /// Appends the values of a raw header line.
    ///
    /// The raw value is split on `,` and a single leading space is trimmed from
    /// each piece, so `"a, b"` yields `["a", "b"]`.
    pub fn insert_raw(&mut self, name: &str, raw: &str) {
        for piece in raw.split(',') {
            let piece = piece.strip_prefix(' ').unwrap_or(piece);
            self.insert(name, piece);
        }
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.inner[idx].1 = vec![value.into()],
            None => self.inner.push((name, vec![value.into()])),
        }
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|idx| self.inner[idx].1.first())
            .map(String::as_str)
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
    }

    /// Returns `true` if any value of `name` equals `token`, ignoring ASCII case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }

    /// Removes the header name and all of its values.
    ///
    /// Returns `true` if the name was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the number of distinct header names.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over `(name, values)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.inner.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, values) in &self.inner {
            write!(f, "{name}: {}\r\n", values.join(", "))?;
        }
        Ok(())
    }
}
