use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth;
use crate::auth::pam::CredentialVerifier;
use crate::http::request::{header_value, split_target, Request};
use crate::http::response::{complete_response_fields, into_hyper_response, Response};
use crate::http::server::DateCache;
use crate::http::timer_queue::{SharedTimerQueue, LOGGED_IN_ATTEMPTS, LOGGED_OUT_ATTEMPTS};
use crate::router::Router;
use crate::session::{SessionStore, UserSession};
use crate::tls::mutual::verify_mtls_user;
use crate::tls::TlsContext;

/// Read-buffer bound for HTTP/1.1, which also bounds the header block.
pub const HTTP_HEADER_LIMIT: usize = 8192;

/// Content-Length cap applied to unauthenticated requests before the
/// body is read.
pub const LOGGED_OUT_POST_BODY_LIMIT: u64 = 4096;

/// Streams advertised per HTTP/2 connection.
pub const HTTP2_MAX_CONCURRENT_STREAMS: u32 = 10;

/// Shared collaborators handed to every connection at construction.
pub struct ConnectionContext {
    pub store: Arc<SessionStore>,
    pub router: Arc<dyn Router>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub date: Arc<DateCache>,
    pub timers: SharedTimerQueue,
    pub hostname: String,
    /// Hard request-body cap in bytes.
    pub body_limit: usize,
}

/// Forces the connection closed without a response; hyper tears the
/// transport down when the service errors.
#[derive(Debug)]
pub struct ConnectionAbort(&'static str);

impl std::fmt::Display for ConnectionAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection aborted: {}", self.0)
    }
}

impl std::error::Error for ConnectionAbort {}

/// Per-connection eviction deadline.
///
/// One live timer-queue entry exists at a time; each firing either
/// re-arms for the next coarse iteration or trips the expiry flag and
/// wakes the I/O wrapper, whose next poll fails with `TimedOut`.  The
/// callback only holds a weak reference, so a connection that is
/// already gone turns the firing into a no-op.
pub(crate) struct Deadline {
    queue: SharedTimerQueue,
    expired: AtomicBool,
    logged_in: AtomicBool,
    closed: AtomicBool,
    timer_key: Mutex<Option<u64>>,
    wakers: Mutex<Vec<Waker>>,
}

impl Deadline {
    pub(crate) fn new(queue: SharedTimerQueue) -> Arc<Self> {
        Arc::new(Self {
            queue,
            expired: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            timer_key: Mutex::new(None),
            wakers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }

    pub(crate) fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Relaxed);
    }

    /// Start (or restart) the deadline with the iteration count for
    /// the current auth state.
    pub(crate) fn rearm(self: &Arc<Self>) {
        let iterations = if self.logged_in.load(Ordering::Relaxed) {
            LOGGED_IN_ATTEMPTS
        } else {
            LOGGED_OUT_ATTEMPTS
        };
        self.cancel();
        self.schedule(iterations.saturating_sub(1));
    }

    fn schedule(self: &Arc<Self>, remaining: usize) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let weak = Arc::downgrade(self);
        let key = self.queue.add(Box::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            // the entry has fired; the stored key no longer cancels it
            state.clear_key();
            if state.closed.load(Ordering::Relaxed) {
                return;
            }
            if remaining > 0 {
                state.schedule(remaining - 1);
            } else {
                state.expire();
            }
        }));
        match key {
            Some(key) => self.set_key(key),
            // No timer slot means no eviction guarantee; the only safe
            // move is to drop the connection.
            None => self.expire(),
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(key) = self.take_key() {
            self.queue.cancel(key);
        }
    }

    /// Permanently stop arming; used when the connection terminates or
    /// relinquishes its socket to an upgrade handler.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.cancel();
    }

    fn expire(&self) {
        self.expired.store(true, Ordering::Relaxed);
        let wakers = std::mem::take(&mut *self.lock_wakers());
        for waker in wakers {
            waker.wake();
        }
    }

    fn register_waker(&self, waker: &Waker) {
        let mut wakers = self.lock_wakers();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn set_key(&self, key: u64) {
        *self.lock_key() = Some(key);
    }

    fn clear_key(&self) {
        *self.lock_key() = None;
    }

    fn take_key(&self) -> Option<u64> {
        self.lock_key().take()
    }

    fn lock_key(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        match self.timer_key.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_wakers(&self) -> std::sync::MutexGuard<'_, Vec<Waker>> {
        match self.wakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Transport wrapper that re-arms the connection deadline on every
/// successful read or write and fails all I/O once the deadline has
/// expired.
pub(crate) struct DeadlineStream<S> {
    inner: S,
    deadline: Arc<Deadline>,
}

impl<S> DeadlineStream<S> {
    pub(crate) fn new(inner: S, deadline: Arc<Deadline>) -> Self {
        Self { inner, deadline }
    }
}

fn timed_out() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "connection deadline expired")
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.deadline.is_expired() {
            return Poll::Ready(Err(timed_out()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    self.deadline.rearm();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                self.deadline.register_waker(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.deadline.is_expired() {
            return Poll::Ready(Err(timed_out()));
        }
        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    self.deadline.rearm();
                }
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                self.deadline.register_waker(cx.waker());
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Run one accepted socket to completion: optional TLS handshake, ALPN
/// protocol selection, then the HTTP/1.1 keep-alive loop or the HTTP/2
/// session.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<Arc<TlsContext>>,
    ctx: Arc<ConnectionContext>,
) {
    let deadline = Deadline::new(ctx.timers.clone());
    deadline.rearm();
    let stream = DeadlineStream::new(stream, Arc::clone(&deadline));

    // Set when a WebSocket upgrade hands the socket away: the serve
    // future then resolves after the 101, long before the detached
    // transport closes, so nothing here may tear down transport state.
    let relinquished = Arc::new(AtomicBool::new(false));

    match tls {
        Some(tls_ctx) => {
            let tls_stream = match tls_ctx.acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer, "tls accept error: {e}");
                    deadline.close();
                    return;
                }
            };

            let (use_http2, transport_session) = {
                let (_, conn) = tls_stream.get_ref();
                let use_http2 = conn.alpn_protocol() == Some(b"h2".as_slice());
                let transport_session = conn.peer_certificates().and_then(|chain| {
                    verify_mtls_user(
                        chain,
                        &peer.ip(),
                        &ctx.store,
                        tls_ctx.webpki.as_ref(),
                        &ctx.hostname,
                    )
                });
                (use_http2, transport_session)
            };

            serve_protocol(
                tls_stream,
                use_http2,
                peer,
                transport_session.clone(),
                Arc::clone(&deadline),
                Arc::clone(&ctx),
                Arc::clone(&relinquished),
                true,
            )
            .await;

            // The identity came from the transport; it dies with it.
            // After an upgrade the handler task owns the socket and
            // performs this removal itself once the socket closes.
            if !relinquished.load(Ordering::Relaxed) {
                if let Some(session) = &transport_session {
                    debug!(session = %session.unique_id, "removing TLS session");
                    ctx.store.remove(session);
                }
            }
        }
        None => {
            serve_protocol(
                stream,
                false,
                peer,
                None,
                Arc::clone(&deadline),
                Arc::clone(&ctx),
                Arc::clone(&relinquished),
                false,
            )
            .await;
        }
    }

    deadline.close();
}

#[allow(clippy::too_many_arguments)]
async fn serve_protocol<S>(
    io: S,
    use_http2: bool,
    peer: SocketAddr,
    transport_session: Option<UserSession>,
    deadline: Arc<Deadline>,
    ctx: Arc<ConnectionContext>,
    relinquished: Arc<AtomicBool>,
    is_secure: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        let deadline = Arc::clone(&deadline);
        let transport_session = transport_session.clone();
        let relinquished = Arc::clone(&relinquished);
        async move {
            handle_request(req, peer, transport_session, deadline, ctx, relinquished, is_secure)
                .await
        }
    });

    if use_http2 {
        let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
        builder.max_concurrent_streams(HTTP2_MAX_CONCURRENT_STREAMS);
        if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
            debug!(%peer, "http2 connection ended: {e}");
        }
    } else {
        let mut builder = hyper::server::conn::http1::Builder::new();
        builder.max_buf_size(HTTP_HEADER_LIMIT);
        let conn = builder
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(%peer, "http1 connection ended: {e}");
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_value(headers, "content-length").parse().ok()
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    mut hyper_req: hyper::Request<Incoming>,
    peer: SocketAddr,
    transport_session: Option<UserSession>,
    deadline: Arc<Deadline>,
    ctx: Arc<ConnectionContext>,
    relinquished: Arc<AtomicBool>,
    is_secure: bool,
) -> std::result::Result<hyper::Response<Full<Bytes>>, ConnectionAbort> {
    let method = hyper_req.method().clone();
    let version = hyper_req.version();
    let target = hyper_req.uri().to_string();
    let (path, query) = split_target(&target);
    let headers = hyper_req.headers().clone();
    let accepts = header_value(&headers, "accept").to_owned();

    info!(%peer, ?version, %method, %target, "request");

    // HTTP/1.1 requires a Host header
    if version == Version::HTTP_11 && header_value(&headers, "host").is_empty() {
        let mut res = Response::with_status(StatusCode::BAD_REQUEST);
        res.add_header("Connection", "close");
        return Ok(finish(res, &accepts, &ctx));
    }

    let mut res = Response::new();
    let session = auth::authenticate(
        &peer.ip(),
        &mut res,
        &method,
        &headers,
        transport_session.as_ref(),
        &ctx.store,
        &*ctx.verifier,
    )
    .await;

    deadline.set_logged_in(session.is_some());
    deadline.rearm();

    if session.is_none() {
        if let Some(length) = content_length(&headers) {
            if length > LOGGED_OUT_POST_BODY_LIMIT {
                debug!(length, "content length over anonymous limit");
                return Err(ConnectionAbort("anonymous body over limit"));
            }
        }
    }

    if session.is_none()
        && !auth::is_on_allowlist(&path, &method, |p| ctx.router.webroutes().contains(p))
    {
        warn!(%peer, %target, "authentication failed");
        auth::send_unauthorized(
            &target,
            header_value(&headers, "user-agent"),
            &accepts,
            ctx.router.has_webui(),
            &mut res,
        );
        return Ok(finish(res, &accepts, &ctx));
    }

    // WebSocket handoff: the socket and any established session move to
    // the upgrade handler and this connection stops processing.
    // Upgrades are an HTTP/1.1 mechanism; h2 streams never take it.
    if version != Version::HTTP_2 && is_websocket_upgrade(&headers) {
        if let Some(handler) = ctx.router.upgrade_handler(&path) {
            let on_upgrade = hyper::upgrade::on(&mut hyper_req);
            let request = Request {
                method,
                version,
                target,
                path,
                query,
                headers,
                body: Bytes::new(),
                client_ip: peer.ip(),
                session,
                is_secure,
            };
            deadline.close();
            relinquished.store(true, Ordering::Relaxed);
            let store = Arc::clone(&ctx.store);
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => handler.run(request, TokioIo::new(upgraded)).await,
                    Err(e) => debug!("upgrade failed: {e}"),
                }
                // the transport identity lives exactly as long as the
                // handed-off socket
                if let Some(session) = &transport_session {
                    debug!(session = %session.unique_id, "removing TLS session");
                    store.remove(session);
                }
            });
            let mut upgrade_res = hyper::Response::new(Full::new(Bytes::new()));
            *upgrade_res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
            upgrade_res
                .headers_mut()
                .insert(http::header::CONNECTION, http::HeaderValue::from_static("upgrade"));
            upgrade_res
                .headers_mut()
                .insert(http::header::UPGRADE, http::HeaderValue::from_static("websocket"));
            return Ok(upgrade_res);
        }
    }

    let body = match Limited::new(hyper_req.into_body(), ctx.body_limit)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("failed to read request body: {e}");
            return Err(ConnectionAbort("body read failed or over limit"));
        }
    };

    let request = Request {
        method,
        version,
        target: target.clone(),
        path,
        query,
        headers,
        body,
        client_ip: peer.ip(),
        session: session.clone(),
        is_secure,
    };

    let mut handler_res = ctx.router.handle(request).await;
    info!(%peer, %target, status = handler_res.status().as_u16(), "response");

    // carry over anything the auth pipeline added (mTLS promotion cookies)
    for (name, value) in res.headers.iter() {
        handler_res.headers.append(name.clone(), value.clone());
    }

    auth::cleanup_temp_session(session.as_ref(), &ctx.store);

    Ok(finish(handler_res, &accepts, &ctx))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_value(headers, "upgrade").eq_ignore_ascii_case("websocket")
}

fn finish(mut res: Response, accepts: &str, ctx: &ConnectionContext) -> hyper::Response<Full<Bytes>> {
    complete_response_fields(accepts, &ctx.date.get(), &mut res);
    into_hyper_response(res)
}
