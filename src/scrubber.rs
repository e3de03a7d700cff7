//! Field extraction and validation for form data.
//!
//! A [`Scrubber`] pulls named fields out of [`Params`] (the parsed query or
//! body of a [`Request`](crate::Request)) and collects three maps on the way:
//! the raw strings, the converted values and per-field error messages.
//!
//! ```
//! use paddock::{query::{Charset, Params, Query}, scrubber::{self, Scrubber}};
//!
//! let params: Params = Query::parse(b"email=matt%40example.com&age=x", Charset::Utf8, 16).unwrap();
//!
//! let mut scrubber = Scrubber::new();
//! scrubber
//!     .extract_with("email", &params, true, scrubber::validate_email_address)
//!     .extract_with("age", &params, false, |raw| raw.parse::<u8>())
//!     .extract("password", &params, true);
//!
//! assert_eq!(scrubber.values["email"], "matt@example.com");
//! assert_eq!(scrubber.errors["age"], "This doesn't look right");
//! assert_eq!(scrubber.errors["password"], "This is a required field!");
//! assert_eq!(scrubber.errors["general"], "Sorry, you have some bad data");
//! ```

use crate::http::query::Params;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::OnceLock};
use tracing::warn;

const REQUIRED: &str = "This is a required field!";
const MALFORMED: &str = "This doesn't look right";
const GENERAL: &str = "Sorry, you have some bad data";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scrubber {
    pub raw_data: BTreeMap<String, String>,
    pub values: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
}

impl Scrubber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the first value of `what` as it is.
    pub fn extract(&mut self, what: &str, from: &Params, required: bool) -> &mut Self {
        self.extract_with(what, from, required, |raw| {
            Ok::<_, std::convert::Infallible>(raw.to_owned())
        })
    }

    /// Takes the first value of `what` and stores `converter(value)`.
    ///
    /// A failed conversion records `"This doesn't look right"` for the field.
    /// A missing required field records `"This is a required field!"` and the
    /// `general` error. A missing optional field records nothing.
    pub fn extract_with<'a, T, E, C>(&mut self, what: &str, from: &'a Params, required: bool, converter: C) -> &mut Self
    where
        T: Serialize,
        E: fmt::Display,
        C: FnOnce(&'a str) -> Result<T, E>,
    {
        let Some(raw) = from.get(what).and_then(|values| values.first()) else {
            if required {
                self.errors.insert(what.to_owned(), REQUIRED.to_owned());
                self.errors.insert("general".to_owned(), GENERAL.to_owned());
            }
            return self;
        };

        self.raw_data.insert(what.to_owned(), raw.clone());

        let converted = converter(raw)
            .map_err(|err| err.to_string())
            .and_then(|value| serde_json::to_value(value).map_err(|err| err.to_string()));

        match converted {
            Ok(value) => {
                self.values.insert(what.to_owned(), value);
            }
            Err(err) => {
                warn!(field = what, %err, "cannot convert field");
                self.errors.insert(what.to_owned(), MALFORMED.to_owned());
            }
        }

        self
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// `None` for an empty string, the string otherwise. Whitespace counts as
/// content.
#[inline]
pub fn convert_empty_strings_to_none(raw: &str) -> Option<&str> {
    (!raw.is_empty()).then_some(raw)
}

/// String doesn't look much like an email address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0:?} is not an email address")]
pub struct InvalidEmailAddress(pub String);

/// Something, an `@`, something, a dot, something. The domain isn't checked.
pub fn validate_email_address(raw: &str) -> Result<String, InvalidEmailAddress> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();

    let pattern = EMAIL.get_or_init(|| match Regex::new(r"^.+@.+\..+") {
        Ok(pattern) => pattern,
        Err(err) => unreachable!("email pattern is valid: {err}"),
    });

    match pattern.is_match(raw) {
        true => Ok(raw.to_owned()),
        false => Err(InvalidEmailAddress(raw.to_owned())),
    }
}
