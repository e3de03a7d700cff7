//! `multipart/form-data` bodies: plain fields and uploaded files.

use crate::http::query::{Charset, Params};
use memchr::memmem;
use std::collections::BTreeMap;

/// Uploaded files by form field name, in arrival order.
pub type Files = BTreeMap<String, Vec<FilePart>>;

/// One uploaded file, held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// The form field the file was sent under.
    pub name: String,
    /// The client's name for the file. Browsers send `""` when no file was
    /// picked.
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// A decoded `multipart/form-data` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    pub fields: Params,
    pub files: Files,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("the body never mentions its boundary")]
    MissingBoundary,
    #[error("a part is not terminated by a boundary")]
    Unterminated,
    #[error("invalid part header: {0:?}")]
    InvalidHeader(String),
    #[error("a part has no form-data name")]
    MissingName,
    #[error("more than {0} parts")]
    OverLimit(usize),
    #[error("a field is not valid in the declared charset")]
    Encoding,
}

/// The `boundary` parameter of a `multipart/form-data` content type.
///
/// ```
/// use paddock::multipart::boundary;
///
/// assert_eq!(boundary(r#"multipart/form-data; boundary="XyZ""#), Some("XyZ"));
/// assert_eq!(boundary("application/x-www-form-urlencoded"), None);
/// ```
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    if !params.next()?.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    params
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"'))
        })
        .filter(|boundary| !boundary.is_empty())
}

/// Splits `body` on `boundary` into fields and files.
///
/// Anything before the first boundary (the preamble) is skipped. Field
/// values are decoded with `charset`; file contents are kept as they are.
/// `limit` caps the number of parts.
pub fn parse(body: &[u8], boundary: &str, charset: Charset, limit: usize) -> Result<Multipart, Error> {
    let delimiter = format!("--{boundary}");
    let next_part = format!("\r\n--{boundary}");
    let finder = memmem::Finder::new(next_part.as_bytes());

    let first = memmem::find(body, delimiter.as_bytes()).ok_or(Error::MissingBoundary)?;
    let mut pos = first + delimiter.len();
    let mut result = Multipart::default();
    let mut count = 0;

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            return Ok(result);
        }

        // Whatever follows a boundary up to the line end is padding
        let line_end = memmem::find(rest, b"\r\n").ok_or(Error::Unterminated)?;
        pos += line_end + 2;

        if count >= limit {
            return Err(Error::OverLimit(limit));
        }
        count += 1;

        let rest = &body[pos..];
        let (head, content_start) = match rest.starts_with(b"\r\n") {
            true => (&rest[..0], pos + 2),
            false => {
                let end = memmem::find(rest, b"\r\n\r\n").ok_or(Error::Unterminated)?;
                (&rest[..end], pos + end + 4)
            }
        };

        let content_len = finder
            .find(&body[content_start..])
            .ok_or(Error::Unterminated)?;
        let content = &body[content_start..content_start + content_len];

        result.add_part(head, content, charset)?;
        pos = content_start + content_len + next_part.len();
    }
}

impl Multipart {
    fn add_part(&mut self, head: &[u8], content: &[u8], charset: Charset) -> Result<(), Error> {
        let head = simdutf8::basic::from_utf8(head)
            .map_err(|_| Error::InvalidHeader(String::from_utf8_lossy(head).into_owned()))?;

        let mut disposition = None;
        let mut content_type = None;

        for line in head.split("\r\n").filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidHeader(line.to_owned()))?;

            if name.trim().eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim());
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_owned());
            }
        }

        let params = header_params(disposition.ok_or(Error::MissingName)?);
        let param = |key: &str| {
            params
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        };
        let name = param("name").ok_or(Error::MissingName)?;

        match param("filename") {
            Some(filename) => self.files.entry(name.clone()).or_default().push(FilePart {
                name,
                filename,
                content_type,
                data: content.to_vec(),
            }),
            None => {
                let value = charset.decode(content).map_err(|_| Error::Encoding)?;
                self.fields.entry(name).or_default().push(value);
            }
        }

        Ok(())
    }
}

// `key=value` parameters after the first `;`, keys lowercased. Quoted values
// may contain `;`.
fn header_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let Some((_, mut rest)) = value.split_once(';') else {
        return params;
    };

    while let Some((key, after)) = rest.split_once('=') {
        let key = key.rsplit(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, tail) = match after.strip_prefix('"') {
            Some(quoted) => unquote(quoted),
            None => match after.split_once(';') {
                Some((value, tail)) => (value.trim().to_owned(), tail),
                None => (after.trim().to_owned(), ""),
            },
        };

        params.push((key, value));
        rest = tail;
    }

    params
}

// `src` starts right after an opening quote. Returns the value and whatever
// follows the next `;`.
fn unquote(src: &str) -> (String, &str) {
    let mut value = String::new();
    let mut escaped = false;

    for (index, c) in src.char_indices() {
        match (escaped, c) {
            (true, '"' | '\\') => {
                value.push(c);
                escaped = false;
            }
            (true, _) => {
                value.push('\\');
                value.push(c);
                escaped = false;
            }
            (false, '\\') => escaped = true,
            (false, '"') => {
                let tail = src[index + 1..].split_once(';').map_or("", |(_, tail)| tail);
                return (value, tail);
            }
            (false, _) => value.push(c),
        }
    }

    (value, "")
}
