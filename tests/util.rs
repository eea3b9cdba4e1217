#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(IntoIterator::into_iter([$(($k, $v),)*]))
    };
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A running server serving a fresh temporary directory.
///
/// `{root}` and `{port}` in the configuration text are replaced with the temporary directory and
/// an unused port.
pub struct Server {
    child: ScopedChild,
    port: u16,
    root: TempDir,
}

pub const DEFAULT_CONFIG: &str = "
server {
    listen 127.0.0.1:{port};
    server_name default.test;
    root {root}/www;
    client_max_body_size 64;
    location / {
        method GET POST;
        upload_path {root}/www/uploads;
    }
    location /uploads {
        method GET DELETE;
        autoindex on;
        upload_path {root}/www/uploads;
    }
    location /cgi-bin {
        method GET POST;
        cgi_path /bin/sh;
        upload_path {root}/www/uploads;
    }
    location /old {
        redirection /new/;
    }
}
";

impl Server {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_CONFIG, &[])
    }

    pub fn with_config(config: &str, args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        // Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");
        let root_str = root.path().to_str().expect("path is not valid UTF-8");

        create_dir_all(root.path().join("www/uploads")).expect("failed to create www");
        let config_path = root.path().join("test.conf");
        let config = config
            .replace("{root}", root_str)
            .replace("{port}", &port.to_string());
        std::fs::write(&config_path, config).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config_path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Create server early so it will be dropped if it fails to start.
        let server = Self { child, port, root };
        assert!(wait_for_port(port), "failed to connect to webserv");
        server
    }

    pub fn pid(&self) -> u32 {
        self.child.0.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn www(&self) -> PathBuf {
        self.root.path().join("www")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.www().join(name)
    }

    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.path(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str) -> File {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).expect("failed to create parent directory");
        }
        File::create(path).expect("failed to create file")
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) {
        self.create_file(name)
            .write_all(contents)
            .expect("failed to write file");
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(20)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes and read the response.
    pub fn send(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<&str, &str>,
        body: &[u8],
    ) -> Response {
        let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        let mut request = request.into_bytes();
        request.extend_from_slice(body);
        self.send(&request)
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        self.request("GET", path, headers, b"")
    }
}

/// HTTP response from webserv.
#[derive(Debug)]
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = if headers.get("Transfer-Encoding").map(String::as_str) == Some("chunked") {
            Self::read_chunked(reader)?
        } else if let Some(length) = headers.get("Content-Length") {
            let length = length.parse::<usize>().expect("invalid content length");
            Self::read_body(reader, length)?
        } else {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        };
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    fn read_chunked<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size = Self::read_header(reader)?;
            let size = usize::from_str_radix(size.trim(), 16).expect("invalid chunk size");
            if size == 0 {
                Self::read_header(reader)?;
                return Ok(body);
            }
            body.extend(Self::read_body(reader, size)?);
            Self::read_header(reader)?;
        }
    }

    pub fn code(&self) -> u16 {
        self.status()
            .split(' ')
            .next()
            .and_then(|code| code.parse().ok())
            .expect("invalid status code")
    }

    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}

/// Processes whose parent is `parent`, read from /proc.
pub fn children_of(parent: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return children,
    };
    for entry in entries.flatten() {
        let pid = match entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let stat = match std::fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("stat")) {
            Ok(stat) => stat,
            Err(_) => continue,
        };
        // The command name may contain spaces; fields after it are space separated.
        let ppid = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().nth(1))
            .and_then(|ppid| ppid.parse::<u32>().ok());
        if ppid == Some(parent) {
            children.push(pid);
        }
    }
    children
}
