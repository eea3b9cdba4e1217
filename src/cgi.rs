//! CGI/1.1 subprocesses driven by pipe readiness.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, SystemTime};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;

use crate::body::{CgiInput, UploadFile};
use crate::util::find;

/// File extensions run through the location's interpreter.
pub const CGI_EXTENSIONS: &[&str] = &["cgi", "py", "php"];

const READ_SIZE: usize = 1 << 14;

pub fn is_cgi_script(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|extension| extension.to_str())
        .map_or(false, |extension| {
            CGI_EXTENSIONS
                .iter()
                .any(|cgi| cgi.eq_ignore_ascii_case(extension))
        })
}

/// Request metadata exported to the script's environment.
#[derive(Debug)]
pub struct CgiRequest<'a> {
    pub interpreter: &'a str,
    pub script: &'a Path,
    pub method: &'a str,
    pub target: &'a str,
    pub uri: &'a str,
    pub query: &'a str,
    pub server_name: &'a str,
    pub server_port: u16,
    pub content_type: Option<&'a str>,
}

impl<'a> CgiRequest<'a> {
    fn environment(&self, content_length: Option<u64>) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
            ("SERVER_PROTOCOL", "HTTP/1.1".to_string()),
            (
                "SERVER_SOFTWARE",
                concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            ),
            ("REQUEST_METHOD", self.method.to_string()),
            ("REQUEST_URI", self.target.to_string()),
            ("PATH_INFO", self.uri.to_string()),
            ("SCRIPT_NAME", self.uri.to_string()),
            ("SCRIPT_FILENAME", self.script.to_string_lossy().into_owned()),
            ("QUERY_STRING", self.query.to_string()),
            ("SERVER_NAME", self.server_name.to_string()),
            ("SERVER_PORT", self.server_port.to_string()),
        ];
        if let Some(length) = content_length {
            env.push(("CONTENT_LENGTH", length.to_string()));
            env.push((
                "CONTENT_TYPE",
                self.content_type
                    .unwrap_or("application/x-www-form-urlencoded")
                    .to_string(),
            ));
        }
        env
    }
}

/// Request body on its way to the script's stdin.
#[derive(Debug)]
enum Input {
    Memory {
        data: Vec<u8>,
        sent: usize,
    },
    /// A spooled body, deleted once the input is dropped.
    Spooled {
        file: File,
        _spool: UploadFile,
        buf: Vec<u8>,
        sent: usize,
    },
}

impl Input {
    fn new(input: CgiInput) -> std::io::Result<Self> {
        Ok(match input {
            CgiInput::Memory(data) => Self::Memory { data, sent: 0 },
            CgiInput::Spooled(spool) => Self::Spooled {
                file: File::open(spool.path())?,
                _spool: spool,
                buf: Vec::new(),
                sent: 0,
            },
        })
    }

    /// Bytes not yet written, or None at the end of the body.
    fn pending(&mut self) -> std::io::Result<Option<&[u8]>> {
        match self {
            Self::Memory { data, sent } => Ok(Some(&data[*sent..]).filter(|rest| !rest.is_empty())),
            Self::Spooled {
                file, buf, sent, ..
            } => {
                if *sent == buf.len() {
                    buf.resize(READ_SIZE, 0);
                    let n = file.read(buf)?;
                    buf.truncate(n);
                    *sent = 0;
                }
                Ok(Some(&buf[*sent..]).filter(|rest| !rest.is_empty()))
            }
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            Self::Memory { sent, .. } | Self::Spooled { sent, .. } => *sent += n,
        }
    }
}

/// A running CGI script. The child is always reaped: by `finish`, `kill`, or on drop.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    reaped: bool,
    /// Read end of the pipe carrying the script's stdout and stderr.
    stdout: Option<File>,
    stdin: Option<ChildStdin>,
    input: Option<Input>,
    output: Vec<u8>,
    started: SystemTime,
}

impl CgiProcess {
    /// Start `request.script` under its interpreter with the script's directory as working
    /// directory. `input` is None for requests without a body.
    pub fn spawn(
        request: &CgiRequest<'_>,
        input: Option<CgiInput>,
        now: SystemTime,
    ) -> std::io::Result<Self> {
        let dir = request
            .script
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = request
            .script
            .file_name()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "script has no name"))?;

        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(nix_to_io)?;
        // Both descriptors are fresh and owned here.
        let reader = unsafe { File::from_raw_fd(read_fd) };
        let writer = unsafe { File::from_raw_fd(write_fd) };
        let writer_stderr = writer.try_clone()?;
        set_nonblocking(reader.as_raw_fd())?;

        let env = request.environment(input.as_ref().map(CgiInput::content_length));
        let mut command = Command::new(request.interpreter);
        command
            .arg(name)
            .current_dir(dir)
            .env_clear()
            .envs(env)
            .envs(std::env::var_os("PATH").map(|path| ("PATH", path)))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_stderr));
        let mut child = command.spawn()?;
        // Close our copies of the write end so EOF arrives when the script exits.
        drop(command);

        let stdin = child.stdin.take();
        let mut process = Self {
            child,
            reaped: false,
            stdout: Some(reader),
            stdin,
            input: None,
            output: Vec::new(),
            started: now,
        };
        if let Some(stdin) = process.stdin.as_ref() {
            set_nonblocking(stdin.as_raw_fd())?;
        }
        process.input = input.map(Input::new).transpose()?;
        tracing::debug!(
            "started CGI {} {} as pid {}",
            request.interpreter,
            request.script.display(),
            process.child.id()
        );
        Ok(process)
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Write pending body bytes to the script. Returns true once everything is written or the
    /// script stopped reading; stdin should then be closed with `close_stdin`.
    pub fn poll_write(&mut self) -> std::io::Result<bool> {
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Ok(true),
        };
        loop {
            let input = match self.input.as_mut() {
                Some(input) => input,
                None => return Ok(true),
            };
            let pending = match input.pending()? {
                Some(pending) => pending,
                None => {
                    self.input = None;
                    return Ok(true);
                }
            };
            match stdin.write(pending) {
                Ok(n) => input.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!("CGI pid {} closed stdin early", self.child.id());
                    self.input = None;
                    return Ok(true);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Signal end of body to the script.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
        self.input = None;
    }

    /// Collect available output. Returns true at EOF.
    pub fn poll_read(&mut self) -> std::io::Result<bool> {
        let stdout = match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => return Ok(true),
        };
        let mut buf = [0; READ_SIZE];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    pub fn timed_out(&self, now: SystemTime, timeout: Duration) -> bool {
        now.duration_since(self.started)
            .map_or(false, |elapsed| elapsed >= timeout)
    }

    /// Reap the script after its output ended and return that output. A script still running
    /// after closing its output is killed rather than waited for.
    pub fn finish(mut self) -> Vec<u8> {
        self.stdout = None;
        self.close_stdin();
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                tracing::debug!("CGI pid {} exited with {}", self.child.id(), status);
            }
            Ok(None) => self.kill_and_reap(),
            Err(e) => tracing::warn!("failed to check CGI pid {}: {}", self.child.id(), e),
        }
        std::mem::take(&mut self.output)
    }

    /// Forcibly stop the script.
    pub fn kill(mut self) {
        self.kill_and_reap();
    }

    fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::warn!("failed to kill CGI pid {}: {}", self.child.id(), e);
        }
        match self.child.wait() {
            Ok(status) => tracing::debug!("CGI pid {} reaped: {}", self.child.id(), status),
            Err(e) => tracing::warn!("failed to reap CGI pid {}: {}", self.child.id(), e),
        }
        self.reaped = true;
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        self.stdout = None;
        self.stdin = None;
        self.kill_and_reap();
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(nix_to_io)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(nix_to_io)?;
    Ok(())
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    match e.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(ErrorKind::Other, e),
    }
}

/// Turn raw script output into an HTTP response.
///
/// Output with a header block containing Content-Type gets a status line in front of it.
/// Anything else is treated as an HTML body.
pub fn frame_output(output: &[u8]) -> Vec<u8> {
    let separator = find(b"\r\n\r\n", output)
        .map(|pos| (pos, 4))
        .or_else(|| find(b"\n\n", output).map(|pos| (pos, 2)));

    if let Some((pos, len)) = separator {
        let headers: Vec<&str> = std::str::from_utf8(&output[..pos])
            .map(|text| text.split('\n').map(|line| line.trim_end_matches('\r')).collect())
            .unwrap_or_default();
        let has_header = |wanted: &str| {
            headers.iter().any(|line| {
                line.split_once(':')
                    .map_or(false, |(name, _)| name.trim().eq_ignore_ascii_case(wanted))
            })
        };
        if has_header("content-type") {
            let mut response = b"HTTP/1.1 200 OK\r\n".to_vec();
            response.extend_from_slice(headers.join("\r\n").as_bytes());
            if !has_header("connection") {
                response.extend_from_slice(b"\r\nConnection: close");
            }
            response.extend_from_slice(b"\r\n\r\n");
            response.extend_from_slice(&output[pos + len..]);
            return response;
        }
    }

    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
        Content-Type: text/html\r\n\
        Content-Length: {}\r\n\
        Connection: close\r\n\
        \r\n",
        output.len()
    )
    .into_bytes();
    response.extend_from_slice(output);
    response
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use test_case::test_case;

    #[test_case("/cgi-bin/test.py", true)]
    #[test_case("/cgi-bin/run.CGI", true)]
    #[test_case("/index.php", true)]
    #[test_case("/script.py.txt", false)]
    #[test_case("/python", false)]
    fn is_cgi_script_works(path: &str, expected: bool) {
        assert_eq!(is_cgi_script(path), expected);
    }

    #[test]
    fn frame_with_content_type() {
        let framed = frame_output(b"Content-Type: text/plain\nX-A: 1\n\nhello\n");
        assert_eq!(
            framed,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-A: 1\r\nConnection: close\r\n\r\nhello\n"
        );
    }

    #[test]
    fn frame_crlf_headers_untouched() {
        let framed = frame_output(b"content-type: text/plain\r\n\r\nbody");
        assert_eq!(
            framed,
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\nConnection: close\r\n\r\nbody"
        );
    }

    #[test]
    fn frame_keeps_script_connection_header() {
        let framed = frame_output(b"Content-Type: text/plain\nConnection: close\n\nbody");
        assert_eq!(
            framed,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nbody"
        );
    }

    #[test_case(b"<p>no headers</p>" ; "no separator")]
    #[test_case(b"X-Only: 1\n\n<p>body</p>" ; "headers without content type")]
    fn frame_as_html(output: &[u8]) {
        let framed = frame_output(output);
        let expected_header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n",
            output.len()
        );
        assert!(framed.starts_with(expected_header.as_bytes()));
        assert!(framed.ends_with(output));
    }

    fn script(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request<'a>(script: &'a Path, method: &'a str) -> CgiRequest<'a> {
        CgiRequest {
            interpreter: "/bin/sh",
            script,
            method,
            target: "/run.cgi?x=1",
            uri: "/run.cgi",
            query: "x=1",
            server_name: "localhost",
            server_port: 8080,
            content_type: Some("text/plain"),
        }
    }

    /// Pump the process with short sleeps in place of the event loop.
    fn run(mut process: CgiProcess) -> Vec<u8> {
        for _ in 0..500 {
            if process.poll_write().unwrap() {
                process.close_stdin();
            }
            if process.poll_read().unwrap() {
                return process.finish();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("CGI did not finish");
    }

    #[test]
    fn runs_script_with_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "run.cgi",
            "echo \"$REQUEST_METHOD $QUERY_STRING $SERVER_PORT ${PWD##*/}\"\necho oops >&2\n",
        );
        let process = CgiProcess::spawn(&request(&path, "GET"), None, SystemTime::now()).unwrap();
        let output = String::from_utf8(run(process)).unwrap();
        let expected_dir = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(output.contains(&format!("GET x=1 8080 {}", expected_dir)));
        assert!(output.contains("oops"));
    }

    #[test]
    fn feeds_body_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "echo.cgi",
            "echo \"len=$CONTENT_LENGTH type=$CONTENT_TYPE\"\ncat\n",
        );
        let body = CgiInput::Memory(b"posted data".to_vec());
        let process =
            CgiProcess::spawn(&request(&path, "POST"), Some(body), SystemTime::now()).unwrap();
        let output = String::from_utf8(run(process)).unwrap();
        assert_eq!(output, "len=11 type=text/plain\nposted data");
    }

    #[test]
    fn feeds_spooled_body_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo.cgi", "cat\n");
        let spool_path = dir.path().join(".spool");
        let mut spool = UploadFile::create(spool_path.clone()).unwrap();
        let body: Vec<u8> = (0..100_000u32).map(|i| b'a' + (i % 26) as u8).collect();
        spool.write_all(&body).unwrap();

        let process = CgiProcess::spawn(
            &request(&path, "POST"),
            Some(CgiInput::Spooled(spool)),
            SystemTime::now(),
        )
        .unwrap();
        assert_eq!(run(process), body);
        assert!(!spool_path.exists());
    }

    #[test]
    fn timeout_and_kill() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleep.cgi", "exec sleep 30\n");
        let start = SystemTime::now();
        let mut process = CgiProcess::spawn(&request(&path, "GET"), None, start).unwrap();
        assert!(!process.poll_read().unwrap());
        assert!(!process.timed_out(start, Duration::from_secs(10)));
        assert!(process.timed_out(start + Duration::from_secs(10), Duration::from_secs(10)));
        let pid = process.child.id();
        process.kill();
        // reaped, so the pid no longer exists as our child
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[test]
    fn missing_interpreter_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "x.cgi", "");
        let mut request = request(&path, "GET");
        request.interpreter = "/nonexistent/interpreter";
        assert!(CgiProcess::spawn(&request, None, SystemTime::now()).is_err());
    }
}
