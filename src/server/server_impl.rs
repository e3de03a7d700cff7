use crate::{
    dispatcher::Dispatcher,
    errors::ErrorKind,
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::connection::{writer, AllLimits, HttpConnection},
    Version,
};
use crossbeam::queue::SegQueue;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tracing::{debug, info, warn};

/// The built-in HTTP/1.x front end for a [`Dispatcher`].
///
/// Accepted connections go into a queue served by a fixed pool of worker
/// tasks. When the queue is full, new connections get an immediate `503`.
/// Each request runs through [`Dispatcher::call`] on tokio's blocking pool.
///
/// # Examples
///
/// ```no_run
/// # fn dispatcher() -> paddock::Dispatcher { unimplemented!() }
/// use paddock::Server;
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .dispatcher(dispatcher())
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            dispatcher: None,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
        }
    }

    /// Accepts connections forever.
    pub async fn launch(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, workers = self.server_limits.max_connections, "listening");
        }

        loop {
            let Ok(value) = self.listener.accept().await else {
                continue;
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => {
                    warn!(peer = %value.1, "connection queue is full");
                    self.error_queue.push(value)
                }
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for [`Server`]. `listener` and `dispatcher` are required.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    dispatcher: Option<Arc<Dispatcher>>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
}

impl ServerBuilder {
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    #[inline(always)]
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Spawns the worker tasks and returns the server, ready to
    /// [`launch`](Server::launch). Must be called inside a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when `listener` or `dispatcher` was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, dispatcher, server_limits, limits) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..server_limits.max_connections {
            Self::spawn_worker(&stream_queue, &server_limits, &limits, &dispatcher);
        }
        if server_limits.count_503_handlers != 0 {
            for _ in 0..server_limits.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &server_limits, &limits.0);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &server_limits);
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits,
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, server_limits: &ServerLimits, limits: &AllLimits, dispatcher: &Arc<Dispatcher>) {
        let queue = queue.clone();
        let wait = server_limits.wait_strategy.clone();
        let mut conn = HttpConnection::new(dispatcher.clone(), limits.clone());

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = Server::get_stream(&queue, &wait).await;
                let local = stream.local_addr().ok();

                if let Err(err) = conn.run(&mut stream, peer, local).await {
                    debug!(%peer, %err, "connection ended with an error");
                }
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, server_limits: &ServerLimits, conn_limits: &ConnLimits) {
        let queue = queue.clone();
        let (server_limits, conn_limits) = (server_limits.clone(), conn_limits.clone());

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = Server::get_stream(&queue, &server_limits.wait_strategy).await;

                let _ = writer::write_bytes(
                    &mut stream,
                    ErrorKind::ServiceUnavailable.as_http(Version::Http11, server_limits.json_errors),
                    &conn_limits,
                )
                .await;
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, server_limits: &ServerLimits) {
        let queue = queue.clone();
        let wait = server_limits.wait_strategy.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &wait).await;

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<Dispatcher>, ServerLimits, AllLimits) {
        let server_limits = self.server_limits.unwrap_or_default();
        let json_errors = server_limits.json_errors;

        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.dispatcher
                .expect("The `dispatcher` method must be called to create"),
            server_limits,
            (
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default(),
                self.response_limits.unwrap_or_default(),
                json_errors,
            ),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{handle_fn, Routes},
        store::MemoryStore,
        tools::test_config,
        Error, HandleFn, Handler, Request, Response,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Ping;

    impl Handler for Ping {
        fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
            let routes = Routes::new().string("GET /ping");
            Ok(routes
                .check_route_strings(req)?
                .then(|| handle_fn(|_: &mut Request<'_>| Ok(Response::plain("pong")))))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dispatcher = Dispatcher::builder()
            .config(test_config())
            .store(MemoryStore::new())
            .handler(Ping)
            .build()
            .unwrap();

        let server = Server::builder()
            .listener(listener)
            .dispatcher(dispatcher)
            .server_limits(ServerLimits {
                max_connections: 2,
                ..ServerLimits::default()
            })
            .build();
        tokio::spawn(server.launch());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /ping HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.ends_with("\r\n\r\npong"), "{reply}");
    }
}
