//! Application configuration.
//!
//! Loaded once at process start (usually from a TOML file) and passed by
//! reference to the [`Dispatcher`](crate::Dispatcher), every
//! [`Request`](crate::Request) and, through the request, every handler.
//!
//! ```toml
//! [app]
//! scheme = "https"
//! host = "docs.example.com"
//! secret = "change me"
//! mode = "production"
//! access_control = true
//!
//! [logging]
//! filter = "info,paddock=debug"
//!
//! [server]
//! address = "127.0.0.1:8080"
//! maximum_buffer_size = 10000000
//! ```

use crate::errors::Error;
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Default in-memory ceiling for request bodies, about ten megabytes.
pub const DEFAULT_MAXIMUM_BUFFER_SIZE: usize = 10 * 1000 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `http` or `https`, used to build absolute redirect locations.
    pub scheme: String,
    /// Public host name (and port, if any) of the application.
    pub host: String,
    /// HMAC key for session and news-message cookies.
    pub secret: String,
    pub mode: Mode,
    /// Propagate handler errors out of the dispatcher instead of replying
    /// with the fallback error page. Development only.
    pub launch_debugger_on_error: bool,
    /// Append `Access-Control-Allow-*` headers to every response.
    pub access_control: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_owned(),
            host: String::new(),
            secret: String::new(),
            mode: Mode::Production,
            launch_debugger_on_error: false,
            access_control: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    #[default]
    Production,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// [`EnvFilter`] directives, e.g. `"info,paddock=debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    /// Largest request body loaded into memory, in bytes.
    pub maximum_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_owned(),
            maximum_buffer_size: DEFAULT_MAXIMUM_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// A config with the three values every deployment must provide.
    pub fn new<S, H, K>(scheme: S, host: H, secret: K) -> Self
    where
        S: Into<String>,
        H: Into<String>,
        K: Into<String>,
    {
        let mut config = Config::default();
        config.app.scheme = scheme.into();
        config.app.host = host.into();
        config.app.secret = secret.into();
        config
    }

    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        Ok(toml::from_str(src)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading config file");
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks that the required values are present.
    ///
    /// It doesn't verify the values are correct, only that they exist.
    /// Fails on the first missing one.
    pub fn verify(&self) -> Result<&Self, Error> {
        let required = [
            ("app.scheme", &self.app.scheme),
            ("app.host", &self.app.host),
            ("app.secret", &self.app.secret),
            ("server.address", &self.server.address),
        ];

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::MissingConfig(name));
            }
        }

        info!(web_host = %self.web_host(), mode = ?self.app.mode, "config file contains all required data");
        Ok(self)
    }

    /// Installs the global `tracing` subscriber described by `[logging]`.
    ///
    /// Calling it when a subscriber is already installed is a no-op.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_new(&self.logging.filter)
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}

// Public API
impl Config {
    #[inline]
    pub fn scheme(&self) -> &str {
        &self.app.scheme
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.app.host
    }

    #[inline]
    pub fn app_secret(&self) -> &str {
        &self.app.secret
    }

    #[inline]
    pub fn launch_debugger_on_error(&self) -> bool {
        self.app.launch_debugger_on_error
    }

    #[inline]
    pub fn access_control(&self) -> bool {
        self.app.access_control
    }

    #[inline]
    pub fn maximum_buffer_size(&self) -> usize {
        self.server.maximum_buffer_size
    }

    #[inline]
    pub fn dev_mode(&self) -> bool {
        self.app.mode == Mode::Dev
    }

    #[inline]
    pub fn production_mode(&self) -> bool {
        !self.dev_mode()
    }

    /// `scheme://host`
    pub fn web_host(&self) -> String {
        format!("{}://{}", self.app.scheme, self.app.host)
    }

    /// Turns an in-app path into an absolute location.
    ///
    /// ```
    /// let config = paddock::Config::new("http", "example.com", "secret");
    /// assert_eq!(config.make_location_from_path("/login"), "http://example.com/login");
    /// ```
    pub fn make_location_from_path(&self, path: &str) -> String {
        format!("{}://{}{}", self.app.scheme, self.app.host, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file() {
        let config = Config::from_toml_str(
            r#"
            [app]
            scheme = "https"
            host = "docs.example.com"
            secret = "s3cret"
            mode = "dev"
            launch_debugger_on_error = true
            access_control = true

            [logging]
            filter = "debug"

            [server]
            address = "0.0.0.0:9000"
            maximum_buffer_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.scheme(), "https");
        assert_eq!(config.host(), "docs.example.com");
        assert_eq!(config.app_secret(), "s3cret");
        assert!(config.dev_mode());
        assert!(!config.production_mode());
        assert!(config.launch_debugger_on_error());
        assert!(config.access_control());
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.server.address, "0.0.0.0:9000");
        assert_eq!(config.maximum_buffer_size(), 1024);
        assert_eq!(config.web_host(), "https://docs.example.com");
        assert!(config.verify().is_ok());
    }

    #[test]
    fn defaults() {
        let config = Config::from_toml_str("[app]\nhost = \"example.com\"\nsecret = \"x\"").unwrap();

        assert_eq!(config.scheme(), "http");
        assert!(config.production_mode());
        assert!(!config.launch_debugger_on_error());
        assert!(!config.access_control());
        assert_eq!(config.maximum_buffer_size(), 10_000_000);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn verify_reports_first_missing_value() {
        #[rustfmt::skip]
        let cases = [
            (Config::new("", "example.com", "k"), "app.scheme"),
            (Config::new("http", "", "k"),        "app.host"),
            (Config::new("http", "example.com", " "), "app.secret"),
        ];

        for (config, missing) in cases {
            match config.verify() {
                Err(Error::MissingConfig(name)) => assert_eq!(name, missing),
                other => panic!("expected MissingConfig({missing}), got {other:?}"),
            }
        }

        let mut config = Config::new("http", "example.com", "k");
        config.server.address.clear();
        assert!(matches!(config.verify(), Err(Error::MissingConfig("server.address"))));
    }

    #[test]
    fn bad_format() {
        assert!(matches!(
            Config::from_toml_str("[app"),
            Err(Error::ConfigFormat(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[app]\nmode = \"staging\""),
            Err(Error::ConfigFormat(_))
        ));
    }
}
