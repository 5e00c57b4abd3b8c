//! Form payload decoding: `application/x-www-form-urlencoded` and
//! `multipart/form-data`.

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::error::ConnectionError;

/// A decoded form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Form {
    /// Ordered `(key, value)` pairs.
    UrlEncoded(Vec<(String, String)>),
    /// Parts in wire order.
    Multipart(Vec<FormPart>),
}

impl Form {
    /// Returns the first text value named `name`.
    ///
    /// For multipart forms only parts without a filename count as fields, and
    /// their data must be valid UTF-8.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Self::UrlEncoded(pairs) => pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            Self::Multipart(parts) => parts
                .iter()
                .find(|p| p.name == name && p.filename.is_none())
                .and_then(|p| std::str::from_utf8(&p.data).ok()),
        }
    }

    /// Returns the first multipart part named `name`.
    pub fn part(&self, name: &str) -> Option<&FormPart> {
        self.parts().iter().find(|p| p.name == name)
    }

    /// Returns all multipart parts; empty for url-encoded forms.
    pub fn parts(&self) -> &[FormPart] {
        match self {
            Self::Multipart(parts) => parts,
            Self::UrlEncoded(_) => &[],
        }
    }
}

/// One `multipart/form-data` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Decodes `key=value&key2=value2`.
///
/// Pairs split on `&`, then on the first `=`; `+` becomes a space and both
/// sides are percent-decoded. Empty pairs are skipped.
///
/// # Examples
///
/// ```
/// use pipehttp::codec::form::parse_urlencoded;
///
/// let pairs = parse_urlencoded("a=1&b=two%20words");
/// assert_eq!(pairs, vec![
///     ("a".to_string(), "1".to_string()),
///     ("b".to_string(), "two words".to_string()),
/// ]);
/// ```
pub fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Extracts the `boundary` parameter of a multipart content type.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = unquote(value.trim());
        (!value.is_empty()).then(|| value.to_owned())
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn invalid(reason: impl Into<String>) -> ConnectionError {
    ConnectionError::MultipartFormat(reason.into())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Splits a multipart body into parts.
///
/// Each part must open with a `Content-Disposition: form-data; name="..."`
/// header (an optional `filename` parameter and `Content-Type` header may
/// follow), then a blank line, then data up to the next delimiter. Any other
/// layout fails with [`ConnectionError::MultipartFormat`].
pub fn parse_multipart(body: &Bytes, boundary: &str) -> Result<Vec<FormPart>, ConnectionError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut separator = b"\r\n".to_vec();
    separator.extend_from_slice(&delimiter);

    let start = find(body, &delimiter, 0).ok_or_else(|| invalid("boundary not found"))?;
    let mut cursor = start + delimiter.len();
    let mut parts = Vec::new();

    loop {
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(invalid("boundary line not terminated by CRLF"));
        }
        cursor += 2;

        let mut disposition: Option<(String, Option<String>)> = None;
        let mut content_type = None;
        loop {
            let end = find(body, b"\r\n", cursor).ok_or_else(|| invalid("unterminated part header"))?;
            let line = std::str::from_utf8(&body[cursor..end])
                .map_err(|_| invalid("part header is not UTF-8"))?;
            cursor = end + 2;
            if line.is_empty() {
                break;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| invalid(format!("malformed part header {line:?}")))?;
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                disposition = Some(parse_disposition(value)?);
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_owned());
            }
        }

        let (name, filename) = disposition.ok_or_else(|| invalid("part without Content-Disposition"))?;
        let end = find(body, &separator, cursor).ok_or_else(|| invalid("part not closed by boundary"))?;
        parts.push(FormPart {
            name,
            filename,
            content_type,
            data: body.slice(cursor..end),
        });
        cursor = end + separator.len();
    }

    Ok(parts)
}

// `form-data; name="field"; filename="f.txt"` -> (name, filename)
fn parse_disposition(value: &str) -> Result<(String, Option<String>), ConnectionError> {
    let mut params = value.split(';');
    let kind = params.next().unwrap_or_default().trim();
    if !kind.eq_ignore_ascii_case("form-data") {
        return Err(invalid(format!("disposition {kind:?} is not form-data")));
    }

    let mut name = None;
    let mut filename = None;
    for param in params {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (key, raw) = param
            .split_once('=')
            .ok_or_else(|| invalid(format!("unparsable parameter {param:?}")))?;
        let value = unquote(raw.trim()).to_owned();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(value),
            "filename" => filename = Some(value),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| invalid("disposition without name"))?;
    Ok((name, filename))
}
