//! Listening sockets and the epoll event loop.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context as _, Result};
use nix::errno::Errno;
use nix::sys::epoll::EpollEvent;

use crate::accounts::Accounts;
use crate::config::{listen_map, VirtualHostConfig};
use crate::connection::{Connection, ConnectionState, Context};
use crate::mime::MimeMap;
use crate::poll::{Interest, Poller};
use crate::vhost::VirtualHost;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CGI_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on one epoll wait, so timeouts are checked even when nothing happens.
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_EVENTS: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub idle_timeout: Duration,
    pub cgi_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cgi_timeout: DEFAULT_CGI_TIMEOUT,
        }
    }
}

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    File(BufWriter<File>),
}

impl LogSink {
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    pub fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        tracing::info!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        tracing::info!("Requests: {}", self.num_requests);
        tracing::info!("Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

/// A bound socket and the virtual hosts answering on it.
#[derive(Debug)]
struct Listener {
    socket: TcpListener,
    hosts: Rc<[usize]>,
}

pub struct Server {
    hosts: Vec<VirtualHost>,
    mime_map: MimeMap,
    options: ServerOptions,
    log_sink: LogSink,
    poller: Poller,
    listeners: HashMap<RawFd, Listener>,
    connections: HashMap<RawFd, Connection>,
    /// CGI pipe descriptor to owning connection socket.
    pipes: HashMap<RawFd, RawFd>,
    accounts: Accounts,
    stats: ServerStats,
    files_exhausted: bool,
    events: Vec<EpollEvent>,
}

impl Server {
    /// Bind one listener per distinct address. Addresses that fail to bind are skipped with a
    /// warning; it is an error if none bind.
    pub fn new(
        configs: Vec<VirtualHostConfig>,
        mime_map: MimeMap,
        options: ServerOptions,
        log_sink: LogSink,
    ) -> Result<Self> {
        let poller = Poller::new().context("failed to create epoll instance")?;
        let mut listeners = HashMap::new();
        for group in listen_map(&configs) {
            let socket = match TcpListener::bind(group.addr()) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("failed to listen on {}: {}", group.addr(), e);
                    continue;
                }
            };
            socket
                .set_nonblocking(true)
                .with_context(|| format!("failed to set {} non-blocking", group.addr()))?;
            let fd = socket.as_raw_fd();
            poller
                .add(fd, Interest::Readable)
                .with_context(|| format!("failed to watch {}", group.addr()))?;
            let addr = socket.local_addr().context("failed to get local address")?;
            let names: Vec<&str> = group
                .hosts
                .iter()
                .map(|&index| configs[index].server_name.as_str())
                .collect();
            tracing::info!("listening on: http://{}/ for [{}]", addr, names.join(", "));
            listeners.insert(
                fd,
                Listener {
                    socket,
                    hosts: group.hosts.into(),
                },
            );
        }
        if listeners.is_empty() {
            bail!("no listening sockets could be created");
        }

        Ok(Self {
            hosts: configs.into_iter().map(VirtualHost::new).collect(),
            mime_map,
            options,
            log_sink,
            poller,
            listeners,
            connections: HashMap::new(),
            pipes: HashMap::new(),
            accounts: Accounts::default(),
            stats: ServerStats::default(),
            files_exhausted: false,
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.socket.local_addr().ok())
            .collect()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// One iteration of the event loop: wait, dispatch ready descriptors, then sweep timeouts
    /// and finished connections.
    pub fn poll(&mut self) -> Result<()> {
        let ready = match self.poller.wait(&mut self.events, WAIT_TIMEOUT) {
            Ok(ready) => ready,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e).context("epoll_wait() failed"),
        };
        let now = SystemTime::now();

        let Self {
            hosts,
            mime_map,
            options,
            log_sink,
            poller,
            listeners,
            connections,
            pipes,
            accounts,
            stats,
            files_exhausted,
            ..
        } = self;
        let mut ctx = Context {
            hosts: hosts.as_slice(),
            mime_map,
            options,
            poller,
            pipes,
            accounts,
            stats,
            now,
        };

        for (fd, flags) in ready {
            if let Some(listener) = listeners.get(&fd) {
                accept_connections(listener, listeners, connections, files_exhausted, &mut ctx);
            } else if let Some(conn) = connections.get_mut(&fd) {
                conn.handle_socket(flags, &mut ctx);
            } else if let Some(&owner) = ctx.pipes.get(&fd) {
                if let Some(conn) = connections.get_mut(&owner) {
                    conn.handle_pipe(fd, &mut ctx);
                }
            }
        }

        let mut finished = Vec::new();
        for (&fd, conn) in connections.iter_mut() {
            if conn.state() != ConnectionState::Done {
                conn.check_timeouts(&mut ctx);
            }
            if conn.state() == ConnectionState::Done {
                finished.push(fd);
            }
        }
        let closed_any = !finished.is_empty();
        for fd in finished {
            if let Some(conn) = connections.remove(&fd) {
                log_connection(log_sink, &conn, now);
                conn.close(&mut ctx);
            }
        }
        if *files_exhausted && closed_any {
            // Try to resume accepting now that descriptors were freed.
            set_listeners(listeners, ctx.poller, Interest::Readable);
            *files_exhausted = false;
        }
        Ok(())
    }

    /// Close every remaining connection and report statistics.
    pub fn shutdown(mut self) -> Result<()> {
        let now = SystemTime::now();
        let mut ctx = Context {
            hosts: &self.hosts,
            mime_map: &self.mime_map,
            options: &self.options,
            poller: &self.poller,
            pipes: &mut self.pipes,
            accounts: &mut self.accounts,
            stats: &mut self.stats,
            now,
        };
        for (_, conn) in self.connections.drain() {
            log_connection(&mut self.log_sink, &conn, now);
            conn.close(&mut ctx);
        }
        self.stats.print()
    }
}

/// Accept until the listener would block.
fn accept_connections(
    listener: &Listener,
    listeners: &HashMap<RawFd, Listener>,
    connections: &mut HashMap<RawFd, Connection>,
    files_exhausted: &mut bool,
    ctx: &mut Context<'_>,
) {
    loop {
        let (stream, addr) = match listener.socket.accept() {
            Ok((stream, addr)) => (stream, addr),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    *files_exhausted = true;
                    set_listeners(listeners, ctx.poller, Interest::Idle);
                }
                tracing::warn!("accept() failed: {}", e);
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!("failed to set connection from {} non-blocking: {}", addr, e);
            continue;
        }
        let fd = stream.as_raw_fd();
        if let Err(e) = ctx.poller.add(fd, Interest::Readable) {
            tracing::warn!("failed to watch connection from {}: {}", addr, e);
            continue;
        }
        tracing::debug!("accepted connection from {}", addr);
        connections.insert(
            fd,
            Connection::new(ctx.now, stream, addr.ip(), listener.hosts.clone()),
        );
    }
}

fn set_listeners(listeners: &HashMap<RawFd, Listener>, poller: &Poller, interest: Interest) {
    for &fd in listeners.keys() {
        if let Err(e) = poller.modify(fd, interest) {
            tracing::warn!("failed to update listener {}: {}", fd, e);
        }
    }
}

/// Add a connection's details to the access log.
fn log_connection(log_sink: &mut LogSink, conn: &Connection, now: SystemTime) {
    if let Some(message) = conn.log_line(now) {
        if let Err(e) = log_sink.log(&message) {
            tracing::warn!("failed to write access log: {}", e);
        }
    }
}
