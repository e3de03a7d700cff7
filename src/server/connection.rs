use crate::{
    dispatcher::Dispatcher,
    errors::ErrorKind,
    http::{
        request::Environ,
        response::{Body, Response},
        types::{Method, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::parser::{self, Head},
};
use memchr::memmem;
use std::{
    io::{self, Cursor, Read},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    time::timeout,
};
use tracing::{debug, error, warn};

pub(crate) struct HttpConnection {
    dispatcher: Arc<Dispatcher>,
    buffer: Vec<u8>,
    version: Version,
    connection: Connection,

    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    json_errors: bool,
}

impl HttpConnection {
    #[inline]
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, limits: AllLimits) -> Self {
        let (conn_limits, req_limits, resp_limits, json_errors) = limits;

        Self {
            dispatcher,
            buffer: Vec::with_capacity(req_limits.head_size),
            version: Version::Http11,
            connection: Connection::new(),

            conn_limits,
            req_limits,
            resp_limits,
            json_errors,
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.buffer.clear();
        self.version = Version::Http11;
        self.connection.reset();
    }
}

impl HttpConnection {
    /// Serves requests from `stream` until the client or a limit ends the
    /// connection. Protocol errors are answered before returning.
    pub(crate) async fn run<S>(
        &mut self,
        stream: &mut S,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.reset();

        match self.impl_run(stream, peer, local).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(err)) => Err(err.0),
            Err(err) => {
                debug!(%peer, ?err, "rejecting request");
                writer::write_bytes(
                    stream,
                    err.as_http(self.version, self.json_errors),
                    &self.conn_limits,
                )
                .await
            }
        }
    }

    async fn impl_run<S>(
        &mut self,
        stream: &mut S,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while !self.is_expired() {
            let Some(head_end) = self.read_head(stream).await? else {
                break;
            };

            let head = parser::parse_head(&self.buffer[..head_end], &self.req_limits)?;
            self.version = head.version;

            let (environ, mut keep_alive, head_only) = self.prepare(stream, head, head_end, peer, local).await?;

            let resp = self.dispatch(environ).await?;
            keep_alive &= writer::write_response(
                stream,
                resp,
                self.version,
                keep_alive,
                head_only,
                &self.conn_limits,
                &self.resp_limits,
            )
            .await?;

            if !keep_alive {
                break;
            }
            self.connection.request_count += 1;
        }

        Ok(())
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }
}

// Reading
impl HttpConnection {
    // Returns the end of the head, or `None` when the client went away
    // between requests.
    async fn read_head<S>(&mut self, stream: &mut S) -> Result<Option<usize>, ErrorKind>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = memmem::find(&self.buffer, b"\r\n\r\n") {
                return Ok(Some(pos + 4));
            }
            if self.buffer.len() >= self.req_limits.head_size {
                return Err(ErrorKind::HeadTooLarge);
            }

            let read = timeout(
                self.conn_limits.socket_read_timeout,
                stream.read_buf(&mut self.buffer),
            )
            .await;

            match read {
                Ok(Ok(0)) | Err(_) if self.buffer.is_empty() => return Ok(None),
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            }
        }
    }

    async fn read_body<S>(&mut self, stream: &mut S, start: usize, len: usize) -> Result<Vec<u8>, ErrorKind>
    where
        S: AsyncRead + Unpin,
    {
        let end = start + len;

        while self.buffer.len() < end {
            let read = timeout(
                self.conn_limits.socket_read_timeout,
                stream.read_buf(&mut self.buffer),
            )
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

            if read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        let body = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Ok(body)
    }

    // Loads the body when it fits in memory. A body that doesn't is left
    // unread: the request gets no input and the connection closes after
    // the reply.
    async fn prepare<S>(
        &mut self,
        stream: &mut S,
        head: Head,
        head_end: usize,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(Environ, bool, bool), ErrorKind>
    where
        S: AsyncRead + Unpin,
    {
        let maximum = self.dispatcher.config().maximum_buffer_size();
        let head_only = head.method == Method::Head;
        let mut keep_alive = head.keep_alive;

        let input: Box<dyn Read + Send> = match head.content_length {
            Some(len) if len > maximum => {
                warn!(%peer, len, maximum, "request body left unread");
                self.buffer.clear();
                keep_alive = false;
                Box::new(io::empty())
            }
            Some(len) => Box::new(Cursor::new(self.read_body(stream, head_end, len).await?)),
            None => {
                self.buffer.drain(..head_end);
                Box::new(io::empty())
            }
        };

        Ok((head.into_environ(input, peer, local), keep_alive, head_only))
    }
}

// Handling
impl HttpConnection {
    async fn dispatch(&self, environ: Environ) -> Result<Response, ErrorKind> {
        let dispatcher = Arc::clone(&self.dispatcher);

        match tokio::task::spawn_blocking(move || dispatcher.call(environ)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => {
                error!(%err, "dispatcher gave up on a request");
                Err(ErrorKind::InternalError)
            }
            Err(err) => {
                error!(%err, "dispatcher task failed");
                Err(ErrorKind::InternalError)
            }
        }
    }
}

pub(crate) mod writer {
    use super::*;
    use tokio::{io::AsyncWriteExt, sync::mpsc};

    const FRAMED: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

    #[inline]
    pub(crate) async fn write_bytes<W>(stream: &mut W, bytes: &[u8], limits: &ConnLimits) -> Result<(), io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        timeout(limits.socket_write_timeout, stream.write_all(bytes))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }

    /// Writes `resp` and returns whether the connection may be reused.
    pub(crate) async fn write_response<W>(
        stream: &mut W,
        resp: Response,
        version: Version,
        keep_alive: bool,
        head_only: bool,
        conn_limits: &ConnLimits,
        resp_limits: &RespLimits,
    ) -> Result<bool, io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        let (status, headers, body) = resp.into_parts();

        // HTTP/1.0 has no chunked encoding: a stream ends when the connection does.
        let keep_alive = keep_alive && !(version == Version::Http10 && matches!(body, Body::Stream(_)));

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(status.into_first_line(version));
        for (name, value) in headers
            .iter()
            .filter(|(name, _)| !FRAMED.iter().any(|framed| name.eq_ignore_ascii_case(framed)))
        {
            push_header(&mut head, name, value);
        }
        push_header(&mut head, "connection", if keep_alive { "keep-alive" } else { "close" });

        match body {
            Body::Bytes(bytes) => {
                push_header(&mut head, "content-length", &bytes.len().to_string());
                head.extend_from_slice(b"\r\n");
                if !head_only {
                    head.extend_from_slice(&bytes);
                }
                write_bytes(stream, &head, conn_limits).await?;
            }
            Body::Stream(source) => {
                let chunked = version == Version::Http11;
                if chunked {
                    push_header(&mut head, "transfer-encoding", "chunked");
                }
                head.extend_from_slice(b"\r\n");
                write_bytes(stream, &head, conn_limits).await?;

                if !head_only {
                    write_stream(stream, source, chunked, conn_limits, resp_limits).await?;
                }
            }
        }

        stream.flush().await?;
        Ok(keep_alive)
    }

    async fn write_stream<W>(
        stream: &mut W,
        source: Box<dyn Read + Send>,
        chunked: bool,
        conn_limits: &ConnLimits,
        resp_limits: &RespLimits,
    ) -> Result<(), io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = pump(source, resp_limits);

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;

            if chunked {
                let mut framed = Vec::with_capacity(chunk.len() + 12);
                framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                framed.extend_from_slice(&chunk);
                framed.extend_from_slice(b"\r\n");
                write_bytes(stream, &framed, conn_limits).await?;
            } else {
                write_bytes(stream, &chunk, conn_limits).await?;
            }
        }

        if chunked {
            write_bytes(stream, b"0\r\n\r\n", conn_limits).await?;
        }
        Ok(())
    }

    // Reads `source` on the blocking pool. The reader stops as soon as the
    // receiver is dropped.
    fn pump(mut source: Box<dyn Read + Send>, limits: &RespLimits) -> mpsc::Receiver<io::Result<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(limits.chunks_in_flight.max(1));
        let chunk_size = limits.chunk_size.max(1);

        tokio::task::spawn_blocking(move || loop {
            let mut chunk = vec![0; chunk_size];

            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    chunk.truncate(read);
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    break;
                }
            }
        });

        rx
    }

    #[inline]
    fn push_header(head: &mut Vec<u8>, name: &str, value: &str) {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

pub(crate) type AllLimits = (ConnLimits, ReqLimits, RespLimits, bool);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{handle_fn, Routes},
        store::MemoryStore,
        tools::test_config,
        Error, HandleFn, Handler, Request,
    };
    use tokio::io::{duplex, AsyncWriteExt};

    struct Echo {
        routes: Routes,
    }

    impl Handler for Echo {
        fn route<'h>(&'h self, req: &mut Request<'_>) -> Result<Option<HandleFn<'h>>, Error> {
            if !self.routes.check_route_strings(req)? {
                return Ok(None);
            }

            Ok(Some(match req.line_one().as_str() {
                "GET /csv" => handle_fn(|_: &mut Request<'_>| {
                    Ok(Response::csv_stream(Cursor::new(b"a,b\n1,2\n".to_vec())))
                }),
                _ => handle_fn(|req: &mut Request<'_>| {
                    let body = req.body()?.map(<[u8]>::to_vec).unwrap_or_default();
                    Ok(Response::plain(body))
                }),
            }))
        }
    }

    fn connection(max_requests: usize) -> HttpConnection {
        let mut config = test_config();
        config.server.maximum_buffer_size = 16;

        let dispatcher = Dispatcher::builder()
            .config(config)
            .store(MemoryStore::new())
            .handler(Echo {
                routes: Routes::new().string("POST /echo").string("GET /csv"),
            })
            .build()
            .unwrap();

        let conn_limits = ConnLimits {
            max_requests_per_connection: max_requests,
            ..ConnLimits::default()
        };
        let resp_limits = RespLimits {
            chunk_size: 4,
            ..RespLimits::default()
        };

        HttpConnection::new(
            Arc::new(dispatcher),
            (conn_limits, ReqLimits::default(), resp_limits, true),
        )
    }

    async fn exchange(conn: &mut HttpConnection, request: &[u8]) -> String {
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        conn.run(&mut server, "10.0.0.1:5000".parse().unwrap(), None)
            .await
            .unwrap();
        drop(server);

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn keep_alive_and_pipelining() {
        let mut conn = connection(10);
        let reply = exchange(
            &mut conn,
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloPOST /echo HTTP/1.1\r\nContent-Length: 3\r\nConnection: close\r\n\r\nbye",
        )
        .await;

        let (first, second) = reply.split_once("hello").unwrap();
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(first.contains("connection: keep-alive\r\ncontent-length: 5\r\n\r\n"), "{reply}");
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(second.contains("connection: close\r\n"), "{reply}");
        assert!(second.ends_with("\r\n\r\nbye"), "{reply}");
    }

    #[tokio::test]
    async fn request_limit_closes_connection() {
        let mut conn = connection(1);
        let reply = exchange(
            &mut conn,
            b"POST /echo HTTP/1.1\r\nContent-Length: 1\r\n\r\naPOST /echo HTTP/1.1\r\nContent-Length: 1\r\n\r\nb",
        )
        .await;

        assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 1, "{reply}");
    }

    #[tokio::test]
    async fn oversized_body_is_not_read() {
        let mut conn = connection(10);
        let reply = exchange(
            &mut conn,
            b"POST /echo HTTP/1.1\r\nContent-Length: 17\r\n\r\n12345678901234567",
        )
        .await;

        assert!(reply.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{reply}");
        assert!(reply.contains("connection: close\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn protocol_errors() {
        let mut conn = connection(10);
        let reply = exchange(&mut conn, b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{reply}");

        let reply = exchange(&mut conn, b"GET / HTTP/1.0\r\nBroken\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
        assert!(reply.ends_with(r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#), "{reply}");
    }

    #[tokio::test]
    async fn streaming_bodies() {
        let mut conn = connection(10);
        let reply = exchange(&mut conn, b"GET /csv HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(reply.contains("transfer-encoding: chunked\r\n\r\n4\r\na,b\n\r\n4\r\n1,2\n\r\n0\r\n\r\n"), "{reply}");

        let reply = exchange(&mut conn, b"GET /csv HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await;
        assert!(reply.contains("connection: close\r\n"), "{reply}");
        assert!(reply.ends_with("\r\n\r\na,b\n1,2\n"), "{reply}");

        let reply = exchange(&mut conn, b"HEAD /csv HTTP/1.1\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{reply}");
        assert!(reply.ends_with("\r\n\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn empty_connection() {
        let mut conn = connection(10);
        assert_eq!(exchange(&mut conn, b"").await, "");
    }
}
