//! Per-client state machine driven by socket and CGI pipe readiness.

use std::collections::HashMap;
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use nix::sys::socket;

use crate::accounts::Accounts;
use crate::body::{BodyError, BodyReader, BodySink, CgiInput};
use crate::cgi::{frame_output, CgiProcess};
use crate::http::{find_header_end, RequestHead, MAX_HEADER_LENGTH};
use crate::mime::MimeMap;
use crate::poll::{Interest, Poller};
use crate::request::{
    body_sink, process_delete, process_form, process_get, spawn_cgi, Request, Route,
};
use crate::response::{redirect, serve_file, status_page, Reply, SendProgress};
use crate::server::{ServerOptions, ServerStats};
use crate::util::{ClfDate, LogEncoded};
use crate::vhost::{resolve_host, VirtualHost};

const RECV_SIZE: usize = 1 << 15;
/// Reads attempted while draining a closing socket.
const LINGER_READS: usize = 4;

/// Server state a connection needs while handling one event.
pub struct Context<'a> {
    pub hosts: &'a [VirtualHost],
    pub mime_map: &'a MimeMap,
    pub options: &'a ServerOptions,
    pub poller: &'a Poller,
    /// CGI pipe descriptor to owning connection socket.
    pub pipes: &'a mut HashMap<RawFd, RawFd>,
    pub accounts: &'a mut Accounts,
    pub stats: &'a mut ServerStats,
    pub now: SystemTime,
}

impl Context<'_> {
    fn watch_pipe(&mut self, pipe: RawFd, owner: RawFd, interest: Interest) -> nix::Result<()> {
        self.poller.add(pipe, interest)?;
        self.pipes.insert(pipe, owner);
        Ok(())
    }

    fn unwatch_pipe(&mut self, pipe: RawFd) {
        if self.pipes.remove(&pipe).is_some() {
            self.poller.delete(pipe).ok();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    ReadingHeaders,
    ReadingBody,
    Cgi,
    SendReply,
    Done,
}

/// Request details kept for the access log.
#[derive(Debug)]
struct LogFields {
    method: String,
    target: String,
    referer: Option<String>,
    user_agent: Option<String>,
}

pub struct Connection {
    socket: TcpStream,
    client: IpAddr,
    /// Virtual hosts served on the accepting listener.
    candidates: Rc<[usize]>,
    vhost: usize,
    last_active: SystemTime,
    state: ConnectionState,
    partial_data: Vec<u8>,
    log_fields: Option<LogFields>,
    request: Option<Request>,
    body: Option<BodyReader>,
    cgi: Option<CgiProcess>,
    reply: Option<Reply>,
    http_code: u16,
    total_sent: u64,
}

impl Connection {
    pub fn new(now: SystemTime, socket: TcpStream, client: IpAddr, candidates: Rc<[usize]>) -> Self {
        Self {
            socket,
            client,
            vhost: candidates.first().copied().unwrap_or(0),
            candidates,
            last_active: now,
            state: ConnectionState::ReadingHeaders,
            partial_data: Vec::new(),
            log_fields: None,
            request: None,
            body: None,
            cgi: None,
            reply: None,
            http_code: 0,
            total_sent: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle readiness of the client socket.
    pub fn handle_socket(&mut self, flags: EpollFlags, ctx: &mut Context<'_>) {
        match self.state {
            ConnectionState::ReadingHeaders => self.poll_recv_headers(ctx),
            ConnectionState::ReadingBody => self.poll_recv_body(ctx),
            ConnectionState::SendReply => self.poll_send_reply(ctx),
            ConnectionState::Cgi => {
                if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    tracing::debug!("client {} went away during CGI", self.client);
                    self.state = ConnectionState::Done;
                }
            }
            ConnectionState::Done => {}
        }
    }

    /// Handle readiness of one of this connection's CGI pipes.
    pub fn handle_pipe(&mut self, pipe: RawFd, ctx: &mut Context<'_>) {
        let process = match self.cgi.as_mut() {
            Some(process) => process,
            None => return,
        };
        self.last_active = ctx.now;

        if process.stdin_fd() == Some(pipe) {
            match process.poll_write() {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => tracing::warn!("writing CGI input failed: {}", e),
            }
            ctx.unwatch_pipe(pipe);
            process.close_stdin();
            return;
        }

        if process.stdout_fd() == Some(pipe) {
            let eof = process.poll_read().unwrap_or_else(|e| {
                tracing::warn!("reading CGI output failed: {}", e);
                true
            });
            if eof {
                if let Some(process) = self.stop_cgi(ctx) {
                    let output = process.finish();
                    self.respond(Reply::raw(200, frame_output(&output)), ctx);
                }
            }
        }
    }

    /// Enforce the CGI deadline and the idle timeout.
    pub fn check_timeouts(&mut self, ctx: &mut Context<'_>) {
        let cgi_timeout = ctx.options.cgi_timeout;
        let expired = self
            .cgi
            .as_ref()
            .map_or(false, |process| process.timed_out(ctx.now, cgi_timeout));
        if expired {
            if let Some(process) = self.stop_cgi(ctx) {
                process.kill();
            }
            tracing::warn!("CGI for {} exceeded {:?}", self.client, cgi_timeout);
            let reason = format!(
                "CGI script exceeded {} second timeout.",
                cgi_timeout.as_secs()
            );
            let reply = status_page(&ctx.hosts[self.vhost].config, ctx.now, 504, &reason);
            self.respond(reply, ctx);
            return;
        }

        let elapsed = ctx
            .now
            .duration_since(self.last_active)
            .unwrap_or_else(|_| Duration::from_secs(0));
        if elapsed >= ctx.options.idle_timeout {
            tracing::debug!("closing idle connection from {}", self.client);
            self.state = ConnectionState::Done;
        }
    }

    /// Tear down a finished connection: release CGI resources, unregister, half-close and
    /// drain whatever the client already sent.
    pub fn close(mut self, ctx: &mut Context<'_>) {
        if let Some(process) = self.stop_cgi(ctx) {
            process.kill();
        }
        ctx.poller.delete(self.fd()).ok();
        if self.socket.shutdown(Shutdown::Write).is_ok() {
            let mut buf = [0; 4096];
            for _ in 0..LINGER_READS {
                match socket::recv(self.fd(), &mut buf, socket::MsgFlags::empty()) {
                    Ok(n) if n > 0 => {}
                    _ => break,
                }
            }
        }
    }

    /// Access log line in Common Log Format, if a request line was received.
    pub fn log_line(&self, now: SystemTime) -> Option<String> {
        if self.http_code == 0 {
            return None;
        }
        let fields = self.log_fields.as_ref()?;
        Some(format!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
            self.client,
            ClfDate(now),
            LogEncoded(&fields.method),
            LogEncoded(&fields.target),
            self.http_code,
            self.total_sent,
            LogEncoded(fields.referer.as_deref().unwrap_or("")),
            LogEncoded(fields.user_agent.as_deref().unwrap_or("")),
        ))
    }

    /// Read from the socket. None means nothing arrived; a closed or failed socket also ends
    /// the connection.
    fn recv(&mut self, buf: &mut [u8], ctx: &mut Context<'_>) -> Option<usize> {
        match socket::recv(self.fd(), buf, socket::MsgFlags::empty()) {
            Ok(recvd) if recvd > 0 => {
                self.last_active = ctx.now;
                ctx.stats.total_in += recvd as u64;
                Some(recvd)
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) => None,
            _ => {
                self.state = ConnectionState::Done;
                None
            }
        }
    }

    fn poll_recv_headers(&mut self, ctx: &mut Context<'_>) {
        let mut buf = [0; RECV_SIZE];
        let recvd = match self.recv(&mut buf, ctx) {
            Some(recvd) => recvd,
            None => return,
        };
        self.partial_data.extend_from_slice(&buf[..recvd]);

        match find_header_end(&self.partial_data) {
            Some((head_len, body_start)) if head_len <= MAX_HEADER_LENGTH => {
                let rest = self.partial_data.split_off(body_start);
                let mut head = std::mem::take(&mut self.partial_data);
                head.truncate(head_len);
                ctx.stats.num_requests += 1;
                self.process_head(&head, rest, ctx);
            }
            Some(_) => self.reject_oversized_head(ctx),
            None if self.partial_data.len() > MAX_HEADER_LENGTH => {
                self.reject_oversized_head(ctx)
            }
            None => {}
        }
    }

    fn reject_oversized_head(&mut self, ctx: &mut Context<'_>) {
        self.partial_data = Vec::new();
        let reason = "Your request was dropped because its header was too long.";
        let reply = status_page(&ctx.hosts[self.vhost].config, ctx.now, 413, reason);
        self.respond(reply, ctx);
    }

    fn process_head(&mut self, head: &[u8], rest: Vec<u8>, ctx: &mut Context<'_>) {
        let hosts = ctx.hosts;
        let head = match RequestHead::parse(head) {
            Some(head) => head,
            None => {
                let reason = "You sent a request that the server couldn't understand.";
                let reply = status_page(&hosts[self.vhost].config, ctx.now, 400, reason);
                return self.respond(reply, ctx);
            }
        };
        self.log_fields = Some(LogFields {
            method: head.method.clone(),
            target: head.target.clone(),
            referer: head.header("referer").map(str::to_string),
            user_agent: head.header("user-agent").map(str::to_string),
        });
        self.vhost = resolve_host(hosts, &self.candidates, head.header("host"));
        let host = &hosts[self.vhost];

        let request = match Request::new(head, host) {
            Ok(request) => request,
            Err(reason) => {
                let reply = status_page(&host.config, ctx.now, 400, reason);
                return self.respond(reply, ctx);
            }
        };
        tracing::debug!(
            "{} {} {} -> {}",
            self.client,
            request.method(),
            request.uri,
            request.path
        );

        let route = request.route(host);
        let reply = match route {
            Route::Redirect(target) => redirect(ctx.now, &target),
            Route::NotAllowed => status_page(
                &host.config,
                ctx.now,
                405,
                "The method is not allowed for this URL.",
            ),
            Route::Get => process_get(host, ctx.mime_map, ctx.now, &request),
            Route::Delete => process_delete(host, ctx.now, &request),
            Route::Cgi if request.method() == "GET" => {
                self.request = Some(request);
                return self.start_cgi(None, ctx);
            }
            Route::Cgi | Route::Post => return self.begin_body(request, rest, ctx),
        };
        self.request = Some(request);
        self.respond(reply, ctx);
    }

    fn begin_body(&mut self, request: Request, rest: Vec<u8>, ctx: &mut Context<'_>) {
        let hosts = ctx.hosts;
        let host = &hosts[self.vhost];
        let max_size = host.config.client_max_body_size;

        let length = if request.head.is_chunked() {
            None
        } else {
            match request.head.content_length() {
                Some(Ok(length)) => Some(length),
                _ => {
                    let reason = "POST requests need a valid Content-Length.";
                    let reply = status_page(&host.config, ctx.now, 400, reason);
                    self.request = Some(request);
                    return self.respond(reply, ctx);
                }
            }
        };
        if max_size == 0 || length.map_or(false, |length| length >= max_size) {
            let reason = "The request body is larger than this server accepts.";
            let reply = status_page(&host.config, ctx.now, 413, reason);
            self.request = Some(request);
            return self.respond(reply, ctx);
        }

        let sink = match body_sink(host, &request) {
            Ok(sink) => sink,
            Err((code, reason)) => {
                let reply = status_page(&host.config, ctx.now, code, &reason);
                self.request = Some(request);
                return self.respond(reply, ctx);
            }
        };
        self.body = Some(match length {
            Some(length) => BodyReader::with_length(length, max_size, sink),
            None => BodyReader::chunked(max_size, sink),
        });
        self.request = Some(request);
        self.state = ConnectionState::ReadingBody;
        self.feed_body(&rest, ctx);
    }

    fn poll_recv_body(&mut self, ctx: &mut Context<'_>) {
        let mut buf = [0; RECV_SIZE];
        if let Some(recvd) = self.recv(&mut buf, ctx) {
            self.feed_body(&buf[..recvd], ctx);
        }
    }

    fn feed_body(&mut self, data: &[u8], ctx: &mut Context<'_>) {
        let reader = match self.body.as_mut() {
            Some(reader) => reader,
            None => return,
        };
        let hosts = ctx.hosts;
        let config = &hosts[self.vhost].config;
        let reply = match reader.feed(data) {
            Ok(false) => return,
            Ok(true) => {
                let sink = self.body.take().and_then(BodyReader::into_sink);
                return self.finish_body(sink, ctx);
            }
            Err(BodyError::TooLarge) => {
                tracing::info!("body from {} exceeded the size limit", self.client);
                let reason = "The request body is larger than this server accepts.";
                status_page(config, ctx.now, 413, reason)
            }
            Err(BodyError::Malformed(reason)) => status_page(config, ctx.now, 400, &reason),
            Err(BodyError::Io(e)) => {
                tracing::warn!("storing body from {} failed: {}", self.client, e);
                let reason = format!("The upload could not be stored: {}.", e);
                status_page(config, ctx.now, 500, &reason)
            }
        };
        self.respond(reply, ctx);
    }

    fn finish_body(&mut self, sink: Option<BodySink>, ctx: &mut Context<'_>) {
        let hosts = ctx.hosts;
        let host = &hosts[self.vhost];
        let request = match self.request.as_ref() {
            Some(request) => request,
            None => return,
        };
        let reply = match sink {
            Some(BodySink::Multipart(upload)) => {
                if let Some(path) = upload.saved() {
                    tracing::info!("stored upload {}", path.display());
                }
                status_page(&host.config, ctx.now, 200, "The file was uploaded.")
            }
            Some(BodySink::Form(body)) => {
                process_form(host, ctx.mime_map, ctx.now, request, ctx.accounts, &body)
            }
            Some(BodySink::PlainText(file)) => {
                let path = file.commit();
                tracing::info!("stored text upload {}", path.display());
                serve_file(
                    &host.config,
                    ctx.mime_map,
                    ctx.now,
                    &path.to_string_lossy(),
                    None,
                )
            }
            Some(BodySink::Cgi(spool)) => return self.start_cgi(Some(spool.into_input()), ctx),
            None => return,
        };
        self.respond(reply, ctx);
    }

    fn start_cgi(&mut self, input: Option<CgiInput>, ctx: &mut Context<'_>) {
        let hosts = ctx.hosts;
        let spawned = match self.request.as_ref() {
            Some(request) => spawn_cgi(&hosts[self.vhost], request, input, ctx.now),
            None => return,
        };
        let process = match spawned {
            Ok(process) => process,
            Err(reply) => return self.respond(reply, ctx),
        };

        let owner = self.fd();
        let stdout = process.stdout_fd();
        let stdin = process.stdin_fd();
        self.cgi = Some(process);
        let registered = stdout
            .map_or(Ok(()), |fd| ctx.watch_pipe(fd, owner, Interest::Readable))
            .and_then(|_| stdin.map_or(Ok(()), |fd| ctx.watch_pipe(fd, owner, Interest::Writable)))
            .and_then(|_| ctx.poller.modify(owner, Interest::Idle));
        if let Err(e) = registered {
            tracing::warn!("failed to watch CGI pipes: {}", e);
            if let Some(process) = self.stop_cgi(ctx) {
                process.kill();
            }
            let reason = "The CGI script could not be started.";
            let reply = status_page(&hosts[self.vhost].config, ctx.now, 500, reason);
            return self.respond(reply, ctx);
        }
        self.state = ConnectionState::Cgi;
    }

    /// Take the CGI process and unregister its pipes.
    fn stop_cgi(&mut self, ctx: &mut Context<'_>) -> Option<CgiProcess> {
        let process = self.cgi.take()?;
        for pipe in process.stdout_fd().into_iter().chain(process.stdin_fd()) {
            ctx.unwatch_pipe(pipe);
        }
        Some(process)
    }

    /// Switch to sending `reply` and try to send it straight away.
    fn respond(&mut self, reply: Reply, ctx: &mut Context<'_>) {
        self.http_code = reply.http_code;
        self.reply = Some(reply);
        self.body = None;
        self.state = ConnectionState::SendReply;
        if let Err(e) = ctx.poller.modify(self.fd(), Interest::Writable) {
            tracing::warn!("failed to watch socket for {}: {}", self.client, e);
            self.state = ConnectionState::Done;
            return;
        }
        self.poll_send_reply(ctx);
    }

    fn poll_send_reply(&mut self, ctx: &mut Context<'_>) {
        let reply = match self.reply.as_mut() {
            Some(reply) => reply,
            None => return,
        };
        let (progress, sent) = reply.poll_send(self.socket.as_raw_fd());
        if sent > 0 {
            self.last_active = ctx.now;
        }
        self.total_sent += sent;
        ctx.stats.total_out += sent;
        match progress {
            SendProgress::Pending => {}
            SendProgress::Complete | SendProgress::Closed => self.state = ConnectionState::Done,
        }
    }
}
