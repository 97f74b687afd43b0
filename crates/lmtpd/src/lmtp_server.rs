use crate::backends::{
    ConcurrencyRegistry, ConnectionInfo, LocalDelivery, StorageService, StorageUser, UserDirectory,
};
use crate::payload::PayloadSink;
use crate::proxy::ProxySession;
use crate::router::tabescape;
use crate::settings::Settings;
use crate::trace_headers::{compose_added_headers, TraceHeaderInput};
use anyhow::Context;
use chrono::{DateTime, Utc};
use memchr::memchr;
use rfc2033::{
    parse_lhlo_domain, parse_path, AsyncReadAndWrite, BoxedAsyncReadAndWrite, MailParams,
    ParamError, PathFlags, RcptParams, SmtpAddress, XclientParams,
};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const MAX_LINE_LEN: usize = 4096;

/// Process-wide collaborator handles threaded into every session.
#[derive(Clone)]
pub struct Backends {
    pub directory: Arc<dyn UserDirectory>,
    pub storage: Arc<dyn StorageService>,
    pub registry: Arc<dyn ConcurrencyRegistry>,
    pub delivery: Arc<dyn LocalDelivery>,
}

/// Addresses of the two ends of the connection. Unix socket peers
/// have no IPs and are treated as local.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMeta {
    pub local_ip: Option<IpAddr>,
    pub remote_ip: Option<IpAddr>,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Local,
    Proxy,
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: SmtpAddress,
    pub detail: String,
    pub params: RcptParams,
    /// Unique per delivery: the base session-id for the first
    /// recipient, `{base}:{n}` (1-based) for the rest
    pub session_id: String,
    pub routing: Routing,
    pub user: Option<Arc<StorageUser>>,
}

/// Envelope state between MAIL and the end of delivery fan-out.
pub struct Envelope {
    pub sender: SmtpAddress,
    pub params: MailParams,
    pub rcpts: Vec<Recipient>,
    pub mail_from_timestamp: DateTime<Utc>,
    pub added_headers: String,
}

pub(crate) enum Flow {
    Continue,
    Quit,
}

enum Line {
    Line(String),
    TooLong,
    Eof,
    TimedOut,
}

enum BodyEnd {
    Done,
    Disconnected,
    SinkError(std::io::Error),
}

pub struct LmtpServer {
    socket: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) backends: Backends,
    tls_acceptor: Option<TlsAcceptor>,
    tls_cipher: Option<String>,
    pub(crate) local_ip: Option<IpAddr>,
    pub(crate) remote_ip: Option<IpAddr>,
    pub(crate) local_port: u16,
    pub(crate) remote_port: u16,
    trusted: bool,
    pub(crate) proxy_ttl: u32,
    pub(crate) proxy_timeout_secs: u32,
    greeting_name: String,
    pub(crate) session_id: String,
    pub(crate) state: Option<Envelope>,
    pub(crate) proxy: Option<ProxySession>,
    pub(crate) data_end_timestamp: Option<DateTime<Utc>>,
}

impl LmtpServer {
    pub async fn run<S: AsyncReadAndWrite + 'static>(
        socket: S,
        settings: Arc<Settings>,
        backends: Backends,
        tls_acceptor: Option<TlsAcceptor>,
        meta: SessionMeta,
    ) -> anyhow::Result<()> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let trusted = settings.is_trusted(meta.remote_ip);
        let proxy_ttl = settings.proxy_ttl;
        let greeting = format!("220 {} {}", settings.hostname, settings.login_greeting);
        let mut server = Self {
            socket: Some(Box::new(socket)),
            read_buffer: Vec::with_capacity(1024),
            settings,
            backends,
            tls_acceptor,
            tls_cipher: None,
            local_ip: meta.local_ip,
            remote_ip: meta.remote_ip,
            local_port: meta.local_port,
            remote_port: meta.remote_port,
            trusted,
            proxy_ttl,
            proxy_timeout_secs: 0,
            greeting_name: "missing".to_string(),
            session_id,
            state: None,
            proxy: None,
            data_end_timestamp: None,
        };
        tracing::info!(
            "Connection from {}, session {}",
            server.remote_id(),
            server.session_id
        );
        server.write_line(&greeting).await?;
        let result = server.process().await;
        if let Some(mut proxy) = server.proxy.take() {
            proxy.deinit().await;
        }
        result
    }

    pub(crate) fn remote_id(&self) -> String {
        match self.remote_ip {
            Some(ip) => format!("{ip}:{}", self.remote_port),
            None => "local".to_string(),
        }
    }

    pub(crate) fn connection_info(&self, session_id: &str) -> ConnectionInfo {
        ConnectionInfo {
            service: self.settings.service_name.clone(),
            local_ip: self.local_ip,
            remote_ip: self.remote_ip,
            local_port: self.local_port,
            remote_port: self.remote_port,
            session_id: session_id.to_string(),
        }
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        loop {
            match self.read_line().await? {
                Line::Eof => {
                    tracing::info!(
                        "Disconnect from {}: Connection closed",
                        self.remote_id()
                    );
                    return Ok(());
                }
                Line::TimedOut => {
                    let reply = format!(
                        "421 4.4.2 {} Disconnected for inactivity",
                        self.settings.hostname
                    );
                    self.write_line(&reply).await.ok();
                    return Ok(());
                }
                Line::TooLong => {
                    self.write_line("500 5.5.2 Line too long").await?;
                }
                Line::Line(line) => {
                    let (verb, args) = match line.split_once(' ') {
                        Some((verb, args)) => (verb, args),
                        None => (line.as_str(), ""),
                    };
                    let flow = self.dispatch(verb, args).await?;
                    if let Flow::Quit = flow {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, verb: &str, args: &str) -> anyhow::Result<Flow> {
        if verb.eq_ignore_ascii_case("LHLO") {
            self.cmd_lhlo(args).await
        } else if verb.eq_ignore_ascii_case("STARTTLS") {
            self.cmd_starttls().await
        } else if verb.eq_ignore_ascii_case("MAIL") {
            self.cmd_mail(args).await
        } else if verb.eq_ignore_ascii_case("RCPT") {
            self.cmd_rcpt(args).await
        } else if verb.eq_ignore_ascii_case("DATA") {
            self.cmd_data().await
        } else if verb.eq_ignore_ascii_case("RSET") {
            self.cmd_rset().await
        } else if verb.eq_ignore_ascii_case("NOOP") {
            self.cmd_noop().await
        } else if verb.eq_ignore_ascii_case("VRFY") {
            self.cmd_vrfy().await
        } else if verb.eq_ignore_ascii_case("QUIT") {
            self.cmd_quit().await
        } else if verb.eq_ignore_ascii_case("XCLIENT") {
            self.cmd_xclient(args).await
        } else {
            self.write_line("502 5.5.2 Unknown command").await?;
            Ok(Flow::Continue)
        }
    }

    /// Reads the next command line. Pipelined commands already sitting
    /// in the buffer are served without touching the socket, which is
    /// what keeps replies in command arrival order.
    async fn read_line(&mut self) -> anyhow::Result<Line> {
        let mut discarding = false;
        loop {
            if let Some(idx) = memchr(b'\n', &self.read_buffer) {
                let mut line: Vec<u8> = self.read_buffer.drain(..=idx).collect();
                if discarding {
                    return Ok(Line::TooLong);
                }
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Line::Line(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.read_buffer.len() > MAX_LINE_LEN && !discarding {
                self.read_buffer.clear();
                discarding = true;
            }
            match self.fill_read_buffer().await {
                Fill::Eof => return Ok(Line::Eof),
                Fill::TimedOut => return Ok(Line::TimedOut),
                Fill::Data => {}
            }
        }
    }

    async fn fill_read_buffer(&mut self) -> Fill {
        let idle = Duration::from_secs(self.settings.client_idle_timeout_secs);
        let Some(socket) = self.socket.as_mut() else {
            return Fill::Eof;
        };
        let mut chunk = [0u8; 4096];
        match timeout(idle, socket.read(&mut chunk)).await {
            Ok(Ok(0)) => Fill::Eof,
            Ok(Ok(size)) => {
                self.read_buffer.extend_from_slice(&chunk[..size]);
                Fill::Data
            }
            Ok(Err(err)) => {
                tracing::debug!("read error from {}: {err:#}", self.remote_id());
                Fill::Eof
            }
            Err(_) => Fill::TimedOut,
        }
    }

    pub(crate) async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.write_raw(&format!("{line}\r\n")).await
    }

    async fn write_raw(&mut self, data: &str) -> anyhow::Result<()> {
        let socket = self.socket.as_mut().context("socket closed")?;
        socket
            .write_all(data.as_bytes())
            .await
            .context("writing reply")?;
        socket.flush().await.context("flushing reply")?;
        Ok(())
    }

    pub(crate) async fn state_reset(&mut self, reason: &str) {
        tracing::debug!("session {}: state reset ({reason})", self.session_id);
        self.state = None;
        if let Some(mut proxy) = self.proxy.take() {
            proxy.deinit().await;
        }
        self.data_end_timestamp = None;
    }

    async fn cmd_lhlo(&mut self, args: &str) -> anyhow::Result<Flow> {
        if args.is_empty() {
            self.write_line("501 Missing hostname").await?;
            return Ok(Flow::Continue);
        }
        let domain = parse_lhlo_domain(args);
        self.state_reset("LHLO").await;
        let mut reply = format!("250-{}\r\n", self.settings.hostname);
        if self.tls_acceptor.is_some() && self.tls_cipher.is_none() {
            reply.push_str("250-STARTTLS\r\n");
        }
        if self.trusted {
            reply.push_str("250-XCLIENT ADDR PORT TTL TIMEOUT\r\n");
        }
        reply.push_str("250-8BITMIME\r\n250-ENHANCEDSTATUSCODES\r\n250 PIPELINING\r\n");
        self.write_raw(&reply).await?;
        self.greeting_name = domain;
        Ok(Flow::Continue)
    }

    async fn cmd_starttls(&mut self) -> anyhow::Result<Flow> {
        if self.tls_cipher.is_some() {
            self.write_line("443 5.5.1 TLS is already active.").await?;
            return Ok(Flow::Continue);
        }
        let Some(acceptor) = self.tls_acceptor.clone() else {
            tracing::error!("TLS initialization failed: no TLS configuration");
            self.write_line("454 4.7.0 Internal error, TLS not available.")
                .await?;
            return Ok(Flow::Continue);
        };
        self.write_line("220 2.0.0 Begin TLS negotiation now.").await?;
        let socket = self.socket.take().context("socket closed")?;
        // bytes the client pipelined behind STARTTLS belong to the
        // handshake, not to the command stream
        let prefix = std::mem::take(&mut self.read_buffer);
        let plain: BoxedAsyncReadAndWrite = Box::new(PrefixedStream::new(prefix, socket));
        match acceptor.accept(plain).await {
            Ok(tls) => {
                let (_, conn) = tls.get_ref();
                let version = conn
                    .protocol_version()
                    .map(|version| format!("{version:?}"))
                    .unwrap_or_else(|| "TLS".to_string());
                let suite = conn
                    .negotiated_cipher_suite()
                    .map(|suite| format!("{:?}", suite.suite()))
                    .unwrap_or_else(|| "unknown".to_string());
                self.tls_cipher = Some(format!("{version} with cipher {suite}"));
                self.socket = Some(Box::new(tls));
                Ok(Flow::Continue)
            }
            Err(err) => {
                tracing::error!("TLS handshake with {} failed: {err:#}", self.remote_id());
                Ok(Flow::Quit)
            }
        }
    }

    async fn cmd_mail(&mut self, args: &str) -> anyhow::Result<Flow> {
        if self.state.is_some() {
            self.write_line("503 5.5.1 MAIL already given").await?;
            return Ok(Flow::Continue);
        }
        let Some(path_text) = strip_prefix_ignore_case(args, "FROM:") else {
            self.write_line("501 5.5.4 Invalid parameters").await?;
            return Ok(Flow::Continue);
        };
        let flags = PathFlags {
            allow_empty: true,
            allow_localpart_only: false,
        };
        let (sender, remainder) = match parse_path(path_text, flags) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_line(&format!("501 5.5.4 Invalid FROM: {err}"))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let params_text = match remainder.strip_prefix(' ') {
            Some(params_text) => params_text,
            None if remainder.is_empty() => "",
            None => {
                self.write_line("501 5.5.4 Invalid FROM: Invalid character in path")
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let params = match MailParams::parse(params_text) {
            Ok(params) => params,
            Err(ParamError::BadSyntax(msg)) => {
                self.write_line(&format!("501 5.5.4 {msg}")).await?;
                return Ok(Flow::Continue);
            }
            Err(ParamError::NotSupported(msg)) => {
                self.write_line(&format!("555 5.5.4 {msg}")).await?;
                return Ok(Flow::Continue);
            }
        };
        self.state = Some(Envelope {
            sender,
            params,
            rcpts: Vec::with_capacity(4),
            mail_from_timestamp: Utc::now(),
            added_headers: String::new(),
        });
        self.write_line("250 2.1.0 OK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_rcpt(&mut self, args: &str) -> anyhow::Result<Flow> {
        if self.state.is_none() {
            self.write_line("503 5.5.1 MAIL needed first").await?;
            return Ok(Flow::Continue);
        }
        let Some(path_text) = strip_prefix_ignore_case(args, "TO:") else {
            self.write_line("501 5.5.4 Invalid parameters").await?;
            return Ok(Flow::Continue);
        };
        let flags = PathFlags {
            allow_empty: false,
            allow_localpart_only: true,
        };
        let (address, remainder) = match parse_path(path_text, flags) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_line(&format!("501 5.5.4 Invalid TO: {err}"))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let params_text = match remainder.strip_prefix(' ') {
            Some(params_text) => params_text,
            None if remainder.is_empty() => "",
            None => {
                self.write_line("501 5.5.4 Invalid TO: Invalid character in path")
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let params = match RcptParams::parse(params_text) {
            Ok(params) => params,
            Err(ParamError::BadSyntax(msg)) => {
                self.write_line(&format!("501 5.5.4 {msg}")).await?;
                return Ok(Flow::Continue);
            }
            Err(ParamError::NotSupported(msg)) => {
                self.write_line(&format!("555 5.5.4 {msg}")).await?;
                return Ok(Flow::Continue);
            }
        };

        let (username, delim, detail) = address.split_detail(&self.settings.recipient_delimiter);

        if self.settings.proxy
            && self
                .proxy_rcpt(&address, &username, delim, &detail, &params)
                .await?
        {
            return Ok(Flow::Continue);
        }

        let session_id = self.next_rcpt_session_id();
        let info = self.connection_info(&session_id);
        match self.backends.storage.lookup_user(&username, &info).await {
            Err(err) => {
                tracing::error!("Failed to lookup user {username}: {err:#}");
                self.write_line(&format!(
                    "451 4.3.0 <{}> Temporary internal error",
                    address.encode()
                ))
                .await?;
            }
            Ok(None) => {
                self.write_line(&format!(
                    "550 5.1.1 <{}> User doesn't exist: {username}",
                    address.encode()
                ))
                .await?;
            }
            Ok(Some(user)) => {
                if self.proxy.is_some() {
                    // a local recipient cannot join a proxied envelope;
                    // the payload they receive would differ
                    self.write_line(&format!(
                        "451 4.3.0 <{}> Can't handle mixed proxy/non-proxy destinations",
                        address.encode()
                    ))
                    .await?;
                    return Ok(Flow::Continue);
                }
                if self.settings.user_concurrency_limit > 0 {
                    // input stays detached until the registry answers
                    let query = format!(
                        "LOOKUP\t{}/{}",
                        self.settings.service_name,
                        tabescape(&user.username)
                    );
                    match self.backends.registry.query(&query).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.write_line(&format!(
                                "451 4.3.0 <{}> Too many concurrent connections",
                                address.encode()
                            ))
                            .await?;
                            return Ok(Flow::Continue);
                        }
                        Err(err) => {
                            tracing::error!(
                                "concurrency lookup for {} failed: {err:#}",
                                user.username
                            );
                            self.write_line(&format!(
                                "451 4.3.0 <{}> Temporary internal error",
                                address.encode()
                            ))
                            .await?;
                            return Ok(Flow::Continue);
                        }
                    }
                }
                let rcpt = Recipient {
                    address: address.clone(),
                    detail,
                    params,
                    session_id,
                    routing: Routing::Local,
                    user: Some(user),
                };
                self.state
                    .as_mut()
                    .context("envelope checked above")?
                    .rcpts
                    .push(rcpt);
                self.write_line("250 2.1.5 OK").await?;
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn next_rcpt_session_id(&self) -> String {
        let index = self.state.as_ref().map(|s| s.rcpts.len()).unwrap_or(0);
        if index == 0 {
            self.session_id.clone()
        } else {
            format!("{}:{}", self.session_id, index + 1)
        }
    }

    async fn cmd_data(&mut self) -> anyhow::Result<Flow> {
        match &self.state {
            None => {
                self.write_line("503 5.5.1 MAIL needed first").await?;
                return Ok(Flow::Continue);
            }
            Some(state) if state.rcpts.is_empty() => {
                self.write_line("554 5.5.1 No valid recipients").await?;
                return Ok(Flow::Continue);
            }
            Some(_) => {}
        }

        let added_headers = {
            let state = self.state.as_ref().context("envelope checked above")?;
            let local_rcpts: Vec<&Recipient> = state
                .rcpts
                .iter()
                .filter(|rcpt| rcpt.routing == Routing::Local)
                .collect();
            compose_added_headers(&TraceHeaderInput {
                local_rcpts: &local_rcpts,
                sender: &state.sender,
                greeting_name: &self.greeting_name,
                remote_ip: self.remote_ip,
                tls_cipher: self.tls_cipher.as_deref(),
                my_hostname: &self.settings.hostname,
                session_id: &self.session_id,
                now: Utc::now(),
            })
        };
        if let Some(state) = self.state.as_mut() {
            state.added_headers = added_headers;
        }

        let mut sink = PayloadSink::new(self.backends.storage.temp_dir());
        // the 354 must be on the wire before any body byte is consumed
        self.write_line("354 OK").await?;

        match self.read_data_body(&mut sink).await {
            BodyEnd::Done => self.finish_data(sink.finish()).await,
            BodyEnd::Disconnected => {
                tracing::info!(
                    "Disconnect from {} during DATA",
                    self.remote_id()
                );
                Ok(Flow::Quit)
            }
            BodyEnd::SinkError(err) => {
                tracing::error!("payload write failed: {err:#}");
                self.write_line("451 4.3.0 Temporary internal failure")
                    .await
                    .ok();
                Ok(Flow::Quit)
            }
        }
    }

    /// Drives the dot-stuffed body stream into the sink, per RFC 5321
    /// section 4.5.2: a lone dot terminates, an interior leading dot
    /// is stripped.
    async fn read_data_body(&mut self, sink: &mut PayloadSink) -> BodyEnd {
        let mut at_line_start = true;
        loop {
            loop {
                let Some(idx) = memchr(b'\n', &self.read_buffer) else {
                    break;
                };
                let line: Vec<u8> = self.read_buffer.drain(..=idx).collect();
                if at_line_start {
                    if matches!(line.as_slice(), b".\r\n" | b".\n") {
                        return BodyEnd::Done;
                    }
                }
                let data = if at_line_start && line.first() == Some(&b'.') {
                    &line[1..]
                } else {
                    &line[..]
                };
                if let Err(err) = sink.append(data).await {
                    return BodyEnd::SinkError(err);
                }
                at_line_start = true;
            }
            // bound memory on pathological line lengths; the sink can
            // take a partial line since only line starts matter
            if self.read_buffer.len() > 8192 {
                let buffer = std::mem::take(&mut self.read_buffer);
                let data = if at_line_start && buffer.first() == Some(&b'.') {
                    &buffer[1..]
                } else {
                    &buffer[..]
                };
                if let Err(err) = sink.append(data).await {
                    return BodyEnd::SinkError(err);
                }
                at_line_start = false;
            }
            match self.fill_read_buffer().await {
                Fill::Data => {}
                Fill::Eof | Fill::TimedOut => return BodyEnd::Disconnected,
            }
        }
    }

    async fn cmd_rset(&mut self) -> anyhow::Result<Flow> {
        self.state_reset("RSET").await;
        self.write_line("250 2.0.0 OK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_noop(&mut self) -> anyhow::Result<Flow> {
        self.write_line("250 2.0.0 OK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_vrfy(&mut self) -> anyhow::Result<Flow> {
        self.write_line("252 2.3.3 Try RCPT instead").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_quit(&mut self) -> anyhow::Result<Flow> {
        self.write_line("221 2.0.0 OK").await?;
        tracing::info!("Disconnect from {}: Successful quit", self.remote_id());
        Ok(Flow::Quit)
    }

    async fn cmd_xclient(&mut self, args: &str) -> anyhow::Result<Flow> {
        if !self.trusted {
            self.write_line("550 You are not from trusted IP").await?;
            return Ok(Flow::Continue);
        }
        let params = match XclientParams::parse(args) {
            Ok(params) => params,
            Err(_) => {
                self.write_line("501 Invalid parameters").await?;
                return Ok(Flow::Continue);
            }
        };
        self.state_reset("XCLIENT").await;
        if let Some(addr) = params.addr {
            self.remote_ip = Some(addr);
        }
        if let Some(port) = params.port {
            self.remote_port = port;
        }
        if let Some(ttl) = params.ttl {
            self.proxy_ttl = ttl;
        }
        self.proxy_timeout_secs = params.timeout.unwrap_or(0);
        let reply = format!(
            "220 {} {}",
            self.settings.hostname, self.settings.login_greeting
        );
        self.write_line(&reply).await?;
        Ok(Flow::Continue)
    }
}

enum Fill {
    Data,
    Eof,
    TimedOut,
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Replays bytes buffered before a transport upgrade, then reads from
/// the underlying socket.
#[derive(Debug)]
struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedAsyncReadAndWrite,
}

impl PrefixedStream {
    fn new(prefix: Vec<u8>, inner: BoxedAsyncReadAndWrite) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let take = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + take]);
            self.pos += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl AsyncReadAndWrite for PrefixedStream {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backends::{
        extract_headers, HdrDeliveryAddress, PassdbResult, RawMailHandle,
    };
    use crate::payload::ComposedMail;
    use async_trait::async_trait;
    use k9::assert_equal;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tokio::io::BufReader;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    struct StubDirectory {
        records: HashMap<String, PassdbResult>,
    }

    #[async_trait]
    impl UserDirectory for StubDirectory {
        async fn pass_lookup(&self, username: &str, _info: &ConnectionInfo) -> PassdbResult {
            self.records
                .get(username)
                .cloned()
                .unwrap_or(PassdbResult::NotFound)
        }
    }

    struct StubStorage {
        temp: tempfile::TempDir,
        users: Option<Vec<String>>,
        policy: HdrDeliveryAddress,
    }

    #[async_trait]
    impl StorageService for StubStorage {
        async fn lookup_user(
            &self,
            username: &str,
            _info: &ConnectionInfo,
        ) -> anyhow::Result<Option<Arc<StorageUser>>> {
            if let Some(users) = &self.users {
                if !users.iter().any(|user| user == username) {
                    return Ok(None);
                }
            }
            Ok(Some(Arc::new(StorageUser {
                username: username.to_string(),
                uid: None,
                hdr_delivery_address: self.policy,
            })))
        }

        fn temp_dir(&self) -> &Path {
            self.temp.path()
        }
    }

    struct StubRegistry {
        allow: bool,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConcurrencyRegistry for StubRegistry {
        async fn query(&self, query: &str) -> anyhow::Result<bool> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.allow)
        }
    }

    #[derive(Debug)]
    struct DeliveredMail {
        rcpt: String,
        session_id: String,
        data: Vec<u8>,
    }

    struct StubDelivery {
        deliveries: Mutex<Vec<DeliveredMail>>,
        fail: bool,
    }

    #[async_trait]
    impl LocalDelivery for StubDelivery {
        async fn open_raw(
            &self,
            mail: &ComposedMail,
            _sender: &SmtpAddress,
        ) -> anyhow::Result<RawMailHandle> {
            let data = mail.read_to_vec().await?;
            let headers = extract_headers(&data);
            Ok(RawMailHandle { data, headers })
        }

        async fn deliver(
            &self,
            rcpt: &Recipient,
            mail: &RawMailHandle,
            _first_saved: &mut Option<PathBuf>,
        ) -> rfc2033::Response {
            if self.fail {
                return rfc2033::Response {
                    code: 451,
                    enhanced_code: None,
                    content: format!("<{}> Temporary internal error", rcpt.address.encode()),
                    command: None,
                };
            }
            self.deliveries.lock().unwrap().push(DeliveredMail {
                rcpt: rcpt.address.encode(),
                session_id: rcpt.session_id.clone(),
                data: mail.data.clone(),
            });
            rfc2033::Response {
                code: 250,
                enhanced_code: Some(rfc2033::EnhancedStatusCode {
                    class: 2,
                    subject: 0,
                    detail: 0,
                }),
                content: format!("<{}> {} Saved", rcpt.address.encode(), rcpt.session_id),
                command: None,
            }
        }
    }

    struct Harness {
        settings: Settings,
        records: HashMap<String, PassdbResult>,
        users: Option<Vec<String>>,
        policy: HdrDeliveryAddress,
        registry_allow: bool,
        delivery_fail: bool,
        meta: SessionMeta,
    }

    impl Default for Harness {
        fn default() -> Self {
            let mut settings = Settings::default();
            settings.hostname = "mx.test".to_string();
            settings.login_greeting = "LMTPD ready.".to_string();
            Self {
                settings,
                records: HashMap::new(),
                users: None,
                policy: HdrDeliveryAddress::Final,
                registry_allow: true,
                delivery_fail: false,
                meta: SessionMeta {
                    local_ip: Some("127.0.0.1".parse().unwrap()),
                    remote_ip: Some("10.0.0.5".parse().unwrap()),
                    local_port: 2424,
                    remote_port: 55555,
                },
            }
        }
    }

    struct SessionResult {
        output: String,
        deliveries: Vec<DeliveredMail>,
        queries: Vec<String>,
        temp_dir_entries: usize,
    }

    impl SessionResult {
        fn lines(&self) -> Vec<&str> {
            self.output.lines().collect()
        }
    }

    impl Harness {
        fn passdb(mut self, user: &str, fields: &str) -> Self {
            let fields = fields
                .split(' ')
                .filter(|field| !field.is_empty())
                .map(|field| match field.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (field.to_string(), String::new()),
                })
                .collect();
            self.records
                .insert(user.to_string(), PassdbResult::Found(fields));
            self.settings.proxy = true;
            self
        }

        async fn run(self, input: &str) -> SessionResult {
            let directory = Arc::new(StubDirectory {
                records: self.records,
            });
            let storage = Arc::new(StubStorage {
                temp: tempfile::tempdir().unwrap(),
                users: self.users,
                policy: self.policy,
            });
            let registry = Arc::new(StubRegistry {
                allow: self.registry_allow,
                queries: Mutex::new(vec![]),
            });
            let delivery = Arc::new(StubDelivery {
                deliveries: Mutex::new(vec![]),
                fail: self.delivery_fail,
            });
            let backends = Backends {
                directory,
                storage: storage.clone(),
                registry: registry.clone(),
                delivery: delivery.clone(),
            };

            let (mut client, server) = tokio::io::duplex(1 << 20);
            let task = tokio::spawn(LmtpServer::run(
                server,
                Arc::new(self.settings),
                backends,
                None,
                self.meta,
            ));
            client.write_all(input.as_bytes()).await.unwrap();
            client.shutdown().await.unwrap();
            let mut output = String::new();
            client.read_to_string(&mut output).await.unwrap();
            task.await.unwrap().unwrap();

            let temp_dir_entries = std::fs::read_dir(storage.temp.path()).unwrap().count();
            let result = SessionResult {
                output,
                deliveries: std::mem::take(&mut delivery.deliveries.lock().unwrap()),
                queries: std::mem::take(&mut registry.queries.lock().unwrap()),
                temp_dir_entries,
            };
            result
        }
    }

    /// Scripted LMTP backend for proxy tests. Returns the bound port
    /// and a task resolving to what the upstream observed.
    #[derive(Debug, Default)]
    struct UpstreamLog {
        mail: Vec<String>,
        rcpts: Vec<String>,
        xclient: Option<String>,
        body: Vec<u8>,
    }

    async fn fake_upstream() -> (u16, tokio::task::JoinHandle<UpstreamLog>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut log = UpstreamLog::default();
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            stream
                .get_mut()
                .write_all(b"220 fake.test ready\r\n")
                .await
                .unwrap();
            loop {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                let upper = line.to_ascii_uppercase();
                let reply: &[u8] = if upper.starts_with("LHLO") {
                    b"250-fake.test\r\n250-XCLIENT ADDR PORT TTL TIMEOUT\r\n250-8BITMIME\r\n250 PIPELINING\r\n"
                } else if upper.starts_with("XCLIENT") {
                    log.xclient = Some(line.clone());
                    b"220 fake.test ready\r\n"
                } else if upper.starts_with("MAIL") {
                    log.mail.push(line.clone());
                    b"250 2.1.0 OK\r\n"
                } else if upper.starts_with("RCPT") {
                    log.rcpts.push(line.clone());
                    b"250 2.1.5 OK\r\n"
                } else if upper == "DATA" {
                    stream.get_mut().write_all(b"354 OK\r\n").await.unwrap();
                    loop {
                        let mut body_line = String::new();
                        if stream.read_line(&mut body_line).await.unwrap() == 0 {
                            break;
                        }
                        if body_line == ".\r\n" {
                            break;
                        }
                        let body_line = body_line.strip_prefix('.').unwrap_or(&body_line);
                        log.body.extend_from_slice(body_line.as_bytes());
                    }
                    for idx in 0..log.rcpts.len() {
                        let status = format!("250 2.0.0 relayed-ok {}\r\n", idx + 1);
                        stream.get_mut().write_all(status.as_bytes()).await.unwrap();
                    }
                    continue;
                } else if upper == "QUIT" {
                    stream.get_mut().write_all(b"221 2.0.0 OK\r\n").await.unwrap();
                    break;
                } else {
                    b"502 5.5.2 Unknown command\r\n"
                };
                stream.get_mut().write_all(reply).await.unwrap();
            }
            log
        });
        (port, task)
    }

    #[tokio::test]
    async fn minimal_local_delivery() {
        let result = Harness::default()
            .run(
                "LHLO a\r\n\
                 MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 Subject: hi\r\n\
                 \r\n\
                 hello\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[0], "220 mx.test LMTPD ready.");
        assert_equal!(lines[1], "250-mx.test");
        assert_equal!(lines[2], "250-8BITMIME");
        assert_equal!(lines[3], "250-ENHANCEDSTATUSCODES");
        assert_equal!(lines[4], "250 PIPELINING");
        assert_equal!(lines[5], "250 2.1.0 OK");
        assert_equal!(lines[6], "250 2.1.5 OK");
        assert_equal!(lines[7], "354 OK");
        assert!(lines[8].starts_with("250 2.0.0 <u@local> "));
        assert!(lines[8].ends_with(" Saved"));
        assert_equal!(lines[9], "221 2.0.0 OK");
        assert_equal!(lines.len(), 10);

        assert_equal!(result.deliveries.len(), 1);
        let mail = &result.deliveries[0];
        assert_equal!(mail.rcpt.as_str(), "u@local");
        let text = String::from_utf8(mail.data.clone()).unwrap();
        assert!(text.starts_with("Return-Path: <s@x>\r\nDelivered-To: u@local\r\n"));
        assert!(text.contains("Received: from a ([10.0.0.5])\r\n"));
        assert!(text.contains("\tby mx.test with LMTP id "));
        assert!(text.contains("\tfor <u@local>; "));
        assert!(text.ends_with("Subject: hi\r\n\r\nhello\r\n"));
        // the trace block appears exactly once, before any body byte
        assert_equal!(text.matches("Received: from").count(), 1);
    }

    #[tokio::test]
    async fn ordering_rules() {
        let result = Harness::default()
            .run(
                "MAIL FROM:<a@b>\r\n\
                 MAIL FROM:<c@d>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(result.lines()[2], "503 5.5.1 MAIL already given");

        let result = Harness::default().run("RCPT TO:<u@local>\r\nQUIT\r\n").await;
        assert_equal!(result.lines()[1], "503 5.5.1 MAIL needed first");

        let result = Harness::default()
            .run("MAIL FROM:<a@b>\r\nDATA\r\nQUIT\r\n")
            .await;
        assert_equal!(result.lines()[2], "554 5.5.1 No valid recipients");

        let result = Harness::default().run("DATA\r\nQUIT\r\n").await;
        assert_equal!(result.lines()[1], "503 5.5.1 MAIL needed first");
    }

    #[tokio::test]
    async fn rset_and_lhlo_reset_the_envelope() {
        let result = Harness::default()
            .run(
                "MAIL FROM:<a@b>\r\n\
                 RCPT TO:<u@local>\r\n\
                 RSET\r\n\
                 DATA\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[3], "250 2.0.0 OK");
        assert_equal!(lines[4], "503 5.5.1 MAIL needed first");

        let result = Harness::default()
            .run(
                "MAIL FROM:<a@b>\r\n\
                 LHLO again\r\n\
                 RCPT TO:<u@local>\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        // the 250 multiline for LHLO, then RCPT refused
        assert_equal!(lines[lines.len() - 2], "503 5.5.1 MAIL needed first");
    }

    #[tokio::test]
    async fn syntax_and_unknown_commands() {
        let result = Harness::default()
            .run(
                "NOOP\r\n\
                 VRFY someone\r\n\
                 FROB\r\n\
                 MAIL BANANA\r\n\
                 MAIL FROM:<not an address\r\n\
                 MAIL FROM:<a@b> FUTURE=1\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[1], "250 2.0.0 OK");
        assert_equal!(lines[2], "252 2.3.3 Try RCPT instead");
        assert_equal!(lines[3], "502 5.5.2 Unknown command");
        assert_equal!(lines[4], "501 5.5.4 Invalid parameters");
        assert!(lines[5].starts_with("501 5.5.4 Invalid FROM:"));
        assert_equal!(lines[6], "555 5.5.4 Unsupported mail parameter: FUTURE");
    }

    #[tokio::test]
    async fn unknown_local_user() {
        let mut harness = Harness::default();
        harness.users = Some(vec!["known".to_string()]);
        let result = harness
            .run(
                "MAIL FROM:<a@b>\r\n\
                 RCPT TO:<stranger@local>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(
            result.lines()[2],
            "550 5.1.1 <stranger@local> User doesn't exist: stranger"
        );
    }

    #[tokio::test]
    async fn per_recipient_session_ids_are_unique() {
        let result = Harness::default()
            .run(
                "MAIL FROM:<a@b>\r\n\
                 RCPT TO:<u1@local>\r\n\
                 RCPT TO:<u2@local>\r\n\
                 RCPT TO:<u3@local>\r\n\
                 DATA\r\n\
                 body\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(result.deliveries.len(), 3);
        let base = result.deliveries[0].session_id.clone();
        assert_equal!(result.deliveries[1].session_id, format!("{base}:2"));
        assert_equal!(result.deliveries[2].session_id, format!("{base}:3"));
        // three per-recipient replies after DATA
        let replies = result
            .lines()
            .iter()
            .filter(|line| line.starts_with("250 2.0.0 <"))
            .count();
        assert_equal!(replies, 3);
    }

    #[tokio::test]
    async fn concurrency_gate() {
        let mut harness = Harness::default();
        harness.settings.user_concurrency_limit = 3;
        harness.registry_allow = false;
        let result = harness
            .run(
                "MAIL FROM:<a@b>\r\n\
                 RCPT TO:<u@local>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(
            result.lines()[2],
            "451 4.3.0 <u@local> Too many concurrent connections"
        );
        assert_equal!(result.queries, vec!["LOOKUP\tlmtp/u".to_string()]);

        let mut harness = Harness::default();
        harness.settings.user_concurrency_limit = 3;
        harness.registry_allow = true;
        let result = harness
            .run("MAIL FROM:<a@b>\r\nRCPT TO:<u@local>\r\nQUIT\r\n")
            .await;
        assert_equal!(result.lines()[2], "250 2.1.5 OK");
    }

    #[tokio::test]
    async fn spilled_payload_is_delivered_and_leaves_no_file() {
        let mut body = String::new();
        let line = "x".repeat(1000);
        for _ in 0..100 {
            body.push_str(&line);
            body.push_str("\r\n");
        }
        let input = format!(
            "MAIL FROM:<s@x>\r\n\
             RCPT TO:<u@local>\r\n\
             DATA\r\n\
             {body}.\r\n\
             QUIT\r\n"
        );
        let result = Harness::default().run(&input).await;
        assert_equal!(result.temp_dir_entries, 0);
        assert_equal!(result.deliveries.len(), 1);
        let text = String::from_utf8(result.deliveries[0].data.clone()).unwrap();
        assert!(text.starts_with("Return-Path: <s@x>\r\n"));
        assert!(text.ends_with(&body));
        assert!(text.len() > crate::payload::MAIL_DATA_MAX_INMEMORY_SIZE);
    }

    #[tokio::test]
    async fn dot_unstuffing_and_empty_body() {
        let result = Harness::default()
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 ..leading\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let text = String::from_utf8(result.deliveries[0].data.clone()).unwrap();
        assert!(text.ends_with("\r\n.leading\r\n"));
        assert!(!text.contains("..leading"));
    }

    #[tokio::test]
    async fn xclient_refused_when_untrusted() {
        let result = Harness::default()
            .run("XCLIENT ADDR=1.2.3.4\r\nMAIL FROM:<a@b>\r\nQUIT\r\n")
            .await;
        let lines = result.lines();
        assert_equal!(lines[1], "550 You are not from trusted IP");
        // session state is unchanged: MAIL still works
        assert_equal!(lines[2], "250 2.1.0 OK");
    }

    #[tokio::test]
    async fn xclient_overrides_identity_when_trusted() {
        let mut harness = Harness::default();
        harness.settings.trusted_networks = vec!["10.0.0.0/8".parse().unwrap()];
        let result = harness
            .run(
                "LHLO a\r\n\
                 XCLIENT ADDR=1.2.3.4 PORT=99 TTL=7\r\n\
                 MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert!(lines.contains(&"250-XCLIENT ADDR PORT TTL TIMEOUT"));
        assert!(lines.contains(&"220 mx.test LMTPD ready."));
        let text = String::from_utf8(result.deliveries[0].data.clone()).unwrap();
        // the apparent client identity changed
        assert!(text.contains("Received: from a ([1.2.3.4])\r\n"));
    }

    #[tokio::test]
    async fn xclient_bad_attribute_is_rejected_whole() {
        let mut harness = Harness::default();
        harness.settings.trusted_networks = vec!["10.0.0.0/8".parse().unwrap()];
        let result = harness
            .run("XCLIENT ADDR=banana PORT=99\r\nQUIT\r\n")
            .await;
        assert_equal!(result.lines()[1], "501 Invalid parameters");
    }

    #[tokio::test]
    async fn lhlo_argument_round_trip() {
        let result = Harness::default()
            .run(
                "LHLO [10.1.2.3]\r\n\
                 MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let text = String::from_utf8(result.deliveries[0].data.clone()).unwrap();
        assert!(text.contains("Received: from [10.1.2.3] ([10.0.0.5])\r\n"));

        let result = Harness::default()
            .run(
                "LHLO not a domain\r\n\
                 MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let text = String::from_utf8(result.deliveries[0].data.clone()).unwrap();
        assert!(text.contains("Received: from invalid ([10.0.0.5])\r\n"));

        let result = Harness::default().run("LHLO\r\nQUIT\r\n").await;
        assert_equal!(result.lines()[1], "501 Missing hostname");
    }

    #[tokio::test]
    async fn proxy_loop_to_self_is_refused() {
        let result = Harness::default()
            .passdb("lo", "proxy host=127.0.0.1 port=2424")
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<lo@remote>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(
            result.lines()[2],
            "554 5.4.6 <lo@remote> Proxying loops to itself"
        );
    }

    #[tokio::test]
    async fn proxy_ttl_exhaustion_is_refused() {
        let mut harness = Harness::default().passdb("pu", "proxy host=10.255.255.1 port=9999");
        harness.settings.proxy_ttl = 1;
        let result = harness
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<pu@remote>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_equal!(
            result.lines()[2],
            "554 5.4.6 <pu@remote> Proxying appears to be looping (TTL=0)"
        );
    }

    #[tokio::test]
    async fn proxy_without_host_is_a_config_error() {
        let result = Harness::default()
            .passdb("pu", "proxy")
            .run("MAIL FROM:<s@x>\r\nRCPT TO:<pu@remote>\r\nQUIT\r\n")
            .await;
        assert_equal!(
            result.lines()[2],
            "501 5.3.0 <pu@remote> Invalid proxy configuration"
        );
    }

    #[tokio::test]
    async fn mixed_destinations_are_refused_both_ways() {
        let (port, upstream) = fake_upstream().await;
        let result = Harness::default()
            .passdb("pu", &format!("proxy host=127.0.0.1 port={port}"))
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<pu@remote>\r\n\
                 RCPT TO:<u@local>\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[2], "250 2.1.5 OK");
        assert_equal!(
            lines[3],
            "451 4.3.0 <u@local> Can't handle mixed proxy/non-proxy destinations"
        );
        upstream.await.unwrap();

        // and the other way around: local first, then a proxy rcpt
        let result = Harness::default()
            .passdb("pu", "proxy host=10.255.255.1")
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 RCPT TO:<pu@remote>\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[2], "250 2.1.5 OK");
        assert_equal!(
            lines[3],
            "451 4.3.0 <pu@remote> Can't handle mixed proxy/non-proxy destinations"
        );
    }

    #[tokio::test]
    async fn proxy_delivery_relays_envelope_and_payload() {
        let (port, upstream) = fake_upstream().await;
        let result = Harness::default()
            .passdb("pu", &format!("proxy host=127.0.0.1 port={port}"))
            .run(
                "LHLO front\r\n\
                 MAIL FROM:<s@x> BODY=8BITMIME\r\n\
                 RCPT TO:<pu@remote>\r\n\
                 DATA\r\n\
                 Subject: via proxy\r\n\
                 \r\n\
                 ..stuffed\r\n\
                 payload\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert!(lines.contains(&"250 2.1.5 OK"));
        // the upstream's per-recipient verdict is relayed verbatim
        assert!(lines.contains(&"250 2.0.0 relayed-ok 1"));

        let log = upstream.await.unwrap();
        assert_equal!(log.mail, vec!["MAIL FROM:<s@x> BODY=8BITMIME".to_string()]);
        assert_equal!(log.rcpts, vec!["RCPT TO:<pu@remote>".to_string()]);
        // TTL was decremented before being forwarded
        let xclient = log.xclient.expect("XCLIENT was forwarded");
        assert!(xclient.contains("ADDR=10.0.0.5"));
        assert!(xclient.contains("TTL=4"));

        let body = String::from_utf8(log.body).unwrap();
        // proxied payloads carry the trace block but no Return-Path
        assert!(body.starts_with("Received: from front ([10.0.0.5])\r\n"));
        assert!(!body.contains("Return-Path:"));
        assert!(body.contains("\r\n.stuffed\r\npayload\r\n"));
        assert_equal!(result.deliveries.len(), 0);
    }

    #[tokio::test]
    async fn passdb_failure_reports_reason() {
        let mut harness = Harness::default();
        harness.settings.proxy = true;
        harness.records.insert(
            "broken".to_string(),
            PassdbResult::Failed(Some("Directory on fire".to_string())),
        );
        harness
            .records
            .insert("silent".to_string(), PassdbResult::Failed(None));
        let result = harness
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<broken@remote>\r\n\
                 RCPT TO:<silent@remote>\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[2], "451 4.3.0 <broken@remote> Directory on fire");
        assert_equal!(
            lines[3],
            "451 4.3.0 <silent@remote> Temporary user lookup failure"
        );
    }

    #[tokio::test]
    async fn passdb_username_rewrite_reaches_upstream() {
        let (port, upstream) = fake_upstream().await;
        let result = Harness::default()
            .passdb(
                "alias",
                &format!("proxy host=127.0.0.1 port={port} user=real@backend.test"),
            )
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<alias+folder@remote>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        assert!(result.lines().contains(&"250 2.1.5 OK"));
        let log = upstream.await.unwrap();
        // rewritten username with the original detail re-attached
        assert_equal!(
            log.rcpts,
            vec!["RCPT TO:<real+folder@backend.test>".to_string()]
        );
    }

    #[tokio::test]
    async fn proxy_connect_failure_is_transient() {
        // nothing listens on this port
        let result = Harness::default()
            .passdb("pu", "proxy host=127.0.0.1 port=1 proxy_timeout=1")
            .run("MAIL FROM:<s@x>\r\nRCPT TO:<pu@remote>\r\nQUIT\r\n")
            .await;
        assert_equal!(result.lines()[2], "451 4.4.0 Remote server not answering");
    }

    #[tokio::test]
    async fn delivery_failure_maps_to_transient_reply() {
        let mut harness = Harness::default();
        harness.delivery_fail = true;
        let result = harness
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert_equal!(lines[3], "451 <u@local> Temporary internal error");
    }

    #[tokio::test]
    async fn envelope_is_gone_after_successful_data() {
        let result = Harness::default()
            .run(
                "MAIL FROM:<s@x>\r\n\
                 RCPT TO:<u@local>\r\n\
                 DATA\r\n\
                 hi\r\n\
                 .\r\n\
                 DATA\r\n\
                 QUIT\r\n",
            )
            .await;
        let lines = result.lines();
        assert!(lines[3].starts_with("250 2.0.0 <u@local>"));
        assert_equal!(lines[4], "503 5.5.1 MAIL needed first");
    }
}
