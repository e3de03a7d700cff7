//! Transport limits and timeouts for the built-in [`Server`](crate::Server)
//!
//! Every limit has a default sized for a small application behind a reverse
//! proxy. Oversized heads get a `4xx` reply, slow clients get their
//! connection closed.
//!
//! The in-memory ceiling for request bodies is not a transport limit: it is
//! [`maximum_buffer_size`](crate::config::ServerConfig::maximum_buffer_size)
//! in the application config, because the [`Request`](crate::Request) enforces
//! it no matter which front end produced the request.
//!
//! # Examples
//!
//! ```no_run
//! # fn dispatcher() -> paddock::Dispatcher { unimplemented!() }
//! use paddock::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .dispatcher(dispatcher())
//!         .server_limits(ServerLimits {
//!             max_connections: 64,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 48,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency and queueing.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== |  Queue space?  | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /--------------------------\   No   [------]
/// [ Worker ] <====== |  Is there a free worker? | =====> [ Wait ]
/// [--------]         \--------------------------/        [------]
/// ```
///
/// # Worker
/// A worker is an asynchronous task created once at startup. It pops
/// connections from the shared queue and serves them one request at a time.
/// Each request is handed to the [`Dispatcher`](crate::Dispatcher) on the
/// blocking thread pool, so `max_connections` is also the upper bound on
/// requests (and therefore store transactions) in flight.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, i.e. connections served at once (default: `32`).
    pub max_connections: usize,

    /// Maximum number of accepted connections waiting for a worker (default: `128`).
    ///
    /// If the queue is full, new connections receive an immediate HTTP `503`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue (default: `Sleep(100μs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks answering overflow connections with `503` (default: `1`).
    ///
    /// Set to 0 to silently close overflow connections.
    pub count_503_handlers: usize,

    /// Format for transport-level error responses (default: `true`)
    ///
    /// If `true`, a malformed request gets:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, the same status line with an empty body.
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 32,
            max_pending_connections: 128,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(100)),
            count_503_handlers: 1,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Waits with [`tokio::task::yield_now()`]. Burns CPU; only for benchmarks.
    Yield,

    /// Waits with [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum wait for the next chunk of a request (default: `5 seconds`)
    ///
    /// Also bounds how long an idle keep-alive connection is held.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single write (default: `10 seconds`)
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is closed (default: `100`)
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection (default: `2 minutes`)
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(10),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// Request head limits
///
/// Browsers send large cookie headers, so these defaults are far looser than
/// an API-only server would pick.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus all headers (default: `16 KB`)
    pub head_size: usize,

    /// Maximum number of headers per request (default: `64`)
    pub header_count: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            head_size: 16 * 1024,
            header_count: 64,

            _priv: (),
        }
    }
}

/// Streaming response limits
///
/// Buffered bodies are written in one go. Streaming bodies (see
/// [`Response::csv_stream`](crate::Response::csv_stream)) are read on the
/// blocking pool in chunks of `chunk_size` and handed to the socket writer
/// through a queue holding at most `chunks_in_flight` chunks, so a slow client
/// never causes the whole payload to be buffered.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Bytes read from a streaming body per chunk (default: `8 KB`)
    pub chunk_size: usize,
    /// Chunks buffered between reader and socket (default: `4`)
    pub chunks_in_flight: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024,
            chunks_in_flight: 4,

            _priv: (),
        }
    }
}
