//! Query string and form body decoding (`application/x-www-form-urlencoded`).

use memchr::memchr;
use percent_encoding::percent_decode;
use std::{borrow::Cow, collections::BTreeMap, error, fmt};

/// Decoded parameters: every key keeps all of its values, in arrival order.
pub type Params = BTreeMap<String, Vec<String>>;

/// Character sets understood by the decoder.
///
/// Anything else named in a `charset` parameter makes decoding fail, which the
/// [`Request`](crate::Request) treats as "no parameters".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    /// Looks up a charset label, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"');

        if label.eq_ignore_ascii_case("utf-8") || label.eq_ignore_ascii_case("utf8") {
            Some(Charset::Utf8)
        } else if ["iso-8859-1", "iso8859-1", "latin1", "latin-1", "us-ascii"]
            .iter()
            .any(|name| label.eq_ignore_ascii_case(name))
        {
            Some(Charset::Latin1)
        } else {
            None
        }
    }

    /// Decodes raw bytes into a string.
    pub fn decode(self, bytes: &[u8]) -> Result<String, Error> {
        match self {
            Charset::Utf8 => simdutf8::basic::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| Error::Encoding),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// Form-urlencoded parser.
///
/// # Examples
/// ```rust
/// use paddock::query::{Charset, Params, Query};
///
/// let params: Params = Query::parse(b"tag=a&tag=b&name=J%C3%BCrgen+M", Charset::Utf8, 16).unwrap();
/// assert_eq!(params["tag"], ["a", "b"]);
/// assert_eq!(params["name"], ["Jürgen M"]);
/// ```
/// Blank values are kept, empty segments are skipped:
/// ```rust
/// use paddock::query::{Charset, Query};
///
/// let pairs: Vec<(String, String)> = Query::parse(b"?debug&name=&&=x", Charset::Utf8, 16).unwrap();
/// assert_eq!(pairs, [
///     ("debug".to_owned(), "".to_owned()),
///     ("name".to_owned(), "".to_owned()),
///     ("".to_owned(), "x".to_owned()),
/// ]);
/// ```
pub struct Query;

impl Query {
    /// Parses a query string or form body into a new collection.
    ///
    /// # Arguments
    /// - `query`: raw bytes (a leading `?` is ignored)
    /// - `charset`: applied after percent-decoding
    /// - `limit`: maximum number of parameters
    #[inline]
    pub fn parse<C: QueryCollector>(query: &[u8], charset: Charset, limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, charset, limit)?;
        Ok(result)
    }

    /// Parses into an existing collection; parameters are appended.
    #[inline]
    pub fn parse_into<C: QueryCollector>(
        result: &mut C,
        query: &[u8],
        charset: Charset,
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first() {
            Some(b'?') => &query[1..],
            _ => query,
        };

        let mut count = 0;
        let mut start = 0;
        while start < data.len() {
            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            if start == end {
                start = end + 1;
                continue;
            }

            if count >= limit {
                return Err(Error::OverLimit(limit));
            }

            // Find '=' within current parameter segment
            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = &data[start..split_index];
            let value = match split_index < end {
                true => &data[split_index + 1..end],
                false => b"",
            };

            result.add_param(decode(key, charset)?, decode(value, charset)?);
            count += 1;
            start = end + 1;
        }

        Ok(())
    }
}

// '+' means space, then %XX escapes, then the charset
#[inline]
fn decode(raw: &[u8], charset: Charset) -> Result<String, Error> {
    let spaced: Cow<'_, [u8]> = match memchr(b'+', raw) {
        Some(_) => Cow::Owned(
            raw.iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect(),
        ),
        None => Cow::Borrowed(raw),
    };

    let bytes: Cow<'_, [u8]> = percent_decode(&spaced).into();
    charset.decode(&bytes)
}

/// A trait for types that can collect parsed parameters.
pub trait QueryCollector
where
    Self: Sized,
{
    /// Adds a decoded parameter to the collection.
    fn add_param(&mut self, key: String, value: String);

    /// Creates a new collection with the specified capacity.
    fn with_capacity(capacity: usize) -> Self;
}

// Preserves parameter order
impl QueryCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

// Multi-valued, keys sorted
impl QueryCollector for Params {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.entry(key).or_default().push(value);
    }

    #[inline(always)]
    fn with_capacity(_: usize) -> Self {
        BTreeMap::new()
    }
}

/// Errors that can occur while decoding parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The number of parameters exceeded the limit.
    OverLimit(usize),

    /// A decoded component is not valid in the requested charset.
    Encoding,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Encoding => {
                write!(f, "Query string is not valid in the declared charset")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(line: &[u8]) -> Vec<(String, String)> {
        Query::parse(line, Charset::Utf8, 32).unwrap()
    }

    #[test]
    fn basic() {
        let cases = ["a=1&b=2", "?a=1&b=2", "a=1&&b=2&"];

        for line in cases {
            let params = pairs(line.as_bytes());

            assert_eq!(params.len(), 2, "{line}");
            assert_eq!(params[0], ("a".to_owned(), "1".to_owned()));
            assert_eq!(params[1], ("b".to_owned(), "2".to_owned()));
        }
    }

    #[test]
    fn decoding() {
        #[rustfmt::skip]
        let cases: [(&[u8], &str, &str); 6] = [
            (b"q=hello+world",           "q",    "hello world"),
            (b"email=user%40example.com", "email", "user@example.com"),
            (b"flavor=Jalape%C3%B1o",     "flavor", "Jalapeño"),
            (b"a%2Bb=1%2B1",              "a+b",  "1+1"),
            (b"amp=a%26b",                "amp",  "a&b"),
            (b"novalue=",                 "novalue", ""),
        ];

        for (line, key, value) in cases {
            let params: Params = Query::parse(line, Charset::Utf8, 8).unwrap();
            assert_eq!(params[key], [value.to_owned()]);
        }
    }

    #[test]
    fn multi_valued() {
        let params: Params = Query::parse(b"tag=x&id=1&tag=y&tag=", Charset::Utf8, 8).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params["tag"], ["x", "y", ""]);
        assert_eq!(params["id"], ["1"]);
    }

    #[test]
    fn charsets() {
        let latin: Params = Query::parse(b"flavor=Jalape%F1o", Charset::Latin1, 8).unwrap();
        assert_eq!(latin["flavor"], ["Jalapeño"]);

        assert_eq!(
            Query::parse::<Params>(b"flavor=Jalape%F1o", Charset::Utf8, 8),
            Err(Error::Encoding)
        );

        #[rustfmt::skip]
        let labels = [
            ("UTF-8",      Some(Charset::Utf8)),
            ("utf8",       Some(Charset::Utf8)),
            ("\"utf-8\"",  Some(Charset::Utf8)),
            ("ISO-8859-1", Some(Charset::Latin1)),
            ("koi8-r",     None),
        ];
        for (label, charset) in labels {
            assert_eq!(Charset::from_label(label), charset, "{label}");
        }
    }

    #[test]
    fn limit_error() {
        assert_eq!(
            Query::parse::<Params>(b"a&b", Charset::Utf8, 1),
            Err(Error::OverLimit(1))
        );
    }

    #[test]
    fn empty_input() {
        assert!(pairs(b"").is_empty());
        assert!(pairs(b"?").is_empty());
    }
}
