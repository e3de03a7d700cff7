//! JSON encoding for replies.
//!
//! Everything goes through `serde`: `chrono` timestamps serialize as
//! ISO-8601 strings and `uuid` values as their hyphenated string form. The
//! items here cover what `serde` has no opinion on:
//!
//! - [`JsonData`] / [`Projected`]: types that describe their own JSON shape.
//! - [`Bounds`]: ranges serialized as `{"lower": .., "upper": ..}`.
//! - [`as_float`]: exact decimals written as JSON numbers.
//! - [`Envelope`]: the `{success, message, reply_timestamp}` reply used by
//!   refusals and error pages.

use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// A value with a self-describing JSON projection.
///
/// ```
/// use paddock::json::{encode, JsonData, Projected};
/// use serde_json::{json, Value};
///
/// struct Folder { id: u32, title: String, secret: String }
///
/// impl JsonData for Folder {
///     fn json_projection(&self) -> Value {
///         json!({ "folder_id": self.id, "title": self.title })
///     }
/// }
///
/// let folder = Folder { id: 7, title: "Taxes".into(), secret: "x".into() };
/// let bytes = encode(&Projected(&folder)).unwrap();
/// assert_eq!(bytes, br#"{"folder_id":7,"title":"Taxes"}"#);
/// ```
pub trait JsonData {
    fn json_projection(&self) -> Value;
}

/// Serializes a [`JsonData`] value through its projection.
#[derive(Debug, Clone, Copy)]
pub struct Projected<'a, T: ?Sized>(pub &'a T);

impl<T: JsonData + ?Sized> Serialize for Projected<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.json_projection().serialize(serializer)
    }
}

impl<T: JsonData> JsonData for Vec<T> {
    fn json_projection(&self) -> Value {
        Value::Array(self.iter().map(JsonData::json_projection).collect())
    }
}

/// A range with optional ends. A missing end serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bounds<T> {
    pub lower: Option<T>,
    pub upper: Option<T>,
}

impl<T> Bounds<T> {
    #[inline]
    pub fn new(lower: Option<T>, upper: Option<T>) -> Self {
        Self { lower, upper }
    }
}

impl<T> From<std::ops::Range<T>> for Bounds<T> {
    fn from(range: std::ops::Range<T>) -> Self {
        Self::new(Some(range.start), Some(range.end))
    }
}

/// `#[serde(with = "paddock::json::as_float")]` for decimal types.
///
/// The field is written as a JSON number by parsing its `Display` form, so
/// any exact decimal type (or a decimal kept as a string) works.
///
/// ```
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Price {
///     #[serde(with = "paddock::json::as_float")]
///     amount: String,
/// }
///
/// let json = serde_json::to_string(&Price { amount: "19.99".into() }).unwrap();
/// assert_eq!(json, r#"{"amount":19.99}"#);
/// ```
pub mod as_float {
    use serde::{ser::Error, Serializer};
    use std::fmt::Display;

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.to_string();
        let float: f64 = text
            .trim()
            .parse()
            .map_err(|_| S::Error::custom(format!("{text:?} is not a decimal number")))?;

        serializer.serialize_f64(float)
    }
}

/// The standard reply shape for refusals and failures.
///
/// ```
/// let envelope = paddock::json::Envelope::failure("Sorry, superusers only!");
/// let value = serde_json::to_value(&envelope).unwrap();
///
/// assert_eq!(value["success"], false);
/// assert_eq!(value["message"], "Sorry, superusers only!");
/// assert!(value.get("needs_to_log_in").is_none());
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    pub reply_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_to_log_in: Option<bool>,
}

impl Envelope {
    pub fn failure<M: Into<String>>(message: M) -> Self {
        Self {
            success: false,
            message: message.into(),
            reply_timestamp: Utc::now(),
            needs_to_log_in: None,
        }
    }

    pub fn success<M: Into<String>>(message: M) -> Self {
        Self {
            success: true,
            ..Self::failure(message)
        }
    }

    #[inline]
    pub fn needs_to_log_in(mut self) -> Self {
        self.needs_to_log_in = Some(true);
        self
    }
}

/// Serializes `data` into a reply body.
#[inline]
pub fn encode<T: Serialize + ?Sized>(data: &T) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(data)?)
}
