//! Templating collaborator.
//!
//! The framework renders exactly two templates of its own,
//! [`NOT_FOUND_TEMPLATE`] and [`ERROR_TEMPLATE`]. Applications bring their
//! own engine by implementing [`Templates`], or register pages on the
//! bundled [`StaticTemplates`].

use crate::errors::Error;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

pub const NOT_FOUND_TEMPLATE: &str = "framework_templates/404.html";
pub const ERROR_TEMPLATE: &str = "framework_templates/error.html";

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
<h1>404 Not Found</h1>
<p>Sorry, we couldn't find that page.</p>
</body>
</html>
";

const ERROR_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>500 Internal Server Error</title></head>
<body>
<h1>Sorry, something went wrong</h1>
<p>The error has been logged. Please try again later.</p>
</body>
</html>
";

pub trait Templates: Send + Sync {
    /// Renders `name` with `context` (usually a JSON object).
    fn render(&self, name: &str, context: &Value) -> Result<String, Error>;
}

/// Pages held in memory with `{{ key }}` placeholders.
///
/// Placeholders are replaced with the matching top-level key of the context
/// object, HTML-escaped. Strings are inserted as text, other values as JSON,
/// unknown keys as nothing.
///
/// ```
/// use paddock::templates::{StaticTemplates, Templates};
/// use serde_json::json;
///
/// let templates = StaticTemplates::new().with_template("hello.html", "Hi {{ name }}, you have {{count}} files");
/// let page = templates.render("hello.html", &json!({"name": "<Matt>", "count": 3})).unwrap();
/// assert_eq!(page, "Hi &lt;Matt&gt;, you have 3 files");
/// ```
#[derive(Debug, Clone)]
pub struct StaticTemplates {
    pages: HashMap<String, String>,
}

impl StaticTemplates {
    /// The built-in framework pages and nothing else.
    pub fn new() -> Self {
        let mut pages = HashMap::new();
        pages.insert(NOT_FOUND_TEMPLATE.to_owned(), NOT_FOUND_PAGE.to_owned());
        pages.insert(ERROR_TEMPLATE.to_owned(), ERROR_PAGE.to_owned());

        Self { pages }
    }

    /// Adds a page, or replaces one (including the framework pages).
    pub fn with_template<N: Into<String>, S: Into<String>>(mut self, name: N, source: S) -> Self {
        self.pages.insert(name.into(), source.into());
        self
    }
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl Templates for StaticTemplates {
    fn render(&self, name: &str, context: &Value) -> Result<String, Error> {
        let source = self
            .pages
            .get(name)
            .ok_or_else(|| Error::Template(format!("no template named {name:?}")))?;

        debug!(template = name, "rendering template");
        substitute(source, context)
    }
}

fn substitute(source: &str, context: &Value) -> Result<String, Error> {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Template("unclosed '{{' placeholder".to_owned()))?;

        match context.get(after[..end].trim()) {
            Some(Value::String(text)) => escape_into(&mut output, text),
            Some(Value::Null) | None => {}
            Some(other) => escape_into(&mut output, &other.to_string()),
        }

        rest = &after[end + 2..];
    }

    output.push_str(rest);
    Ok(output)
}

fn escape_into(output: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#x27;"),
            _ => output.push(c),
        }
    }
}
