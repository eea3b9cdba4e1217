//! Replies: header construction, body sources and non-blocking sending.

use std::cmp::min;
use std::convert::TryFrom;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::SystemTime;

use nix::errno::Errno;
use nix::sys::socket;

use crate::config::VirtualHostConfig;
use crate::http::{parse_range, reason_phrase};
use crate::mime::{is_video, MimeMap};
use crate::util::{GeneratedOn, HtmlEscaped, HttpDate, UrlEncoded};

const SERVER_HEADER: &str = concat!(
    "Server: ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n"
);
const SENDFILE_SIZE_LIMIT: usize = 1 << 20;
const CHUNK_SIZE: usize = 1 << 14;

/// Where the bytes after the header come from.
#[derive(Debug)]
pub enum Body {
    Generated {
        data: Vec<u8>,
        sent: usize,
    },
    /// Sent with sendfile.
    FromFile {
        file: File,
        offset: i64,
        remaining: i64,
    },
    /// Sent with chunked transfer-encoding.
    Chunked {
        file: File,
        chunk: Vec<u8>,
        chunk_sent: usize,
        finished: bool,
    },
}

impl Body {
    fn generated(data: Vec<u8>) -> Self {
        Self::Generated { data, sent: 0 }
    }

    fn is_finished(&self) -> bool {
        match self {
            Self::Generated { data, sent } => *sent == data.len(),
            Self::FromFile { remaining, .. } => *remaining == 0,
            Self::Chunked {
                chunk,
                chunk_sent,
                finished,
                ..
            } => *finished && *chunk_sent == chunk.len(),
        }
    }

    /// Send some of the body. Must not be called once finished.
    fn send(&mut self, fd: RawFd) -> nix::Result<usize> {
        match self {
            Self::Generated { data, sent } => {
                let n = send(fd, &data[*sent..])?;
                *sent += n;
                Ok(n)
            }
            Self::FromFile {
                file,
                offset,
                remaining,
            } => {
                // `i64` may be wider than `usize`, so saturate when casting.
                let size = min(
                    usize::try_from(*remaining).unwrap_or(usize::MAX),
                    SENDFILE_SIZE_LIMIT,
                );
                let n = sendfile64(fd, file.as_raw_fd(), Some(offset), size)?;
                *remaining -= n as i64;
                Ok(n)
            }
            Self::Chunked {
                file,
                chunk,
                chunk_sent,
                finished,
            } => {
                if *chunk_sent == chunk.len() {
                    refill_chunk(file, chunk, finished)?;
                    *chunk_sent = 0;
                }
                let n = send(fd, &chunk[*chunk_sent..])?;
                *chunk_sent += n;
                Ok(n)
            }
        }
    }
}

/// Read the next piece of the file and frame it as one chunk, or the terminator at EOF.
fn refill_chunk(file: &mut File, chunk: &mut Vec<u8>, finished: &mut bool) -> nix::Result<()> {
    let mut buf = vec![0; CHUNK_SIZE];
    let n = file.read(&mut buf).map_err(|e| {
        tracing::warn!("failed to read file for chunked reply: {}", e);
        nix::Error::Sys(Errno::EIO)
    })?;
    chunk.clear();
    if n == 0 {
        chunk.extend_from_slice(b"0\r\n\r\n");
        *finished = true;
    } else {
        chunk.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
        chunk.extend_from_slice(&buf[..n]);
        chunk.extend_from_slice(b"\r\n");
    }
    Ok(())
}

fn send(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    socket::send(fd, buf, socket::MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL))
}

/// Safe wrapper for `libc::sendfile64`.
fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off64_t>,
    count: usize,
) -> nix::Result<usize> {
    let offset = offset
        .map(|offset| offset as *mut _)
        .unwrap_or(std::ptr::null_mut());
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset, count) };
    Errno::result(ret).map(|r| r as usize)
}

#[derive(Debug, PartialEq)]
pub enum SendProgress {
    /// The socket would block.
    Pending,
    Complete,
    /// The peer went away or the body could not be produced.
    Closed,
}

/// A complete response waiting to be written to a socket.
#[derive(Debug)]
pub struct Reply {
    pub http_code: u16,
    header: Vec<u8>,
    header_sent: usize,
    body: Option<Body>,
}

impl Reply {
    fn new(http_code: u16, header: String, body: Option<Body>) -> Self {
        Self {
            http_code,
            header: header.into_bytes(),
            header_sent: 0,
            body,
        }
    }

    /// A response produced elsewhere (CGI) and forwarded verbatim.
    pub fn raw(http_code: u16, response: Vec<u8>) -> Self {
        Self {
            http_code,
            header: Vec::new(),
            header_sent: 0,
            body: Some(Body::generated(response)),
        }
    }

    /// Write as much as the socket accepts. Returns the progress and bytes written.
    pub fn poll_send(&mut self, fd: RawFd) -> (SendProgress, u64) {
        let mut total = 0;
        loop {
            let result = if self.header_sent < self.header.len() {
                send(fd, &self.header[self.header_sent..]).map(|sent| {
                    self.header_sent += sent;
                    sent
                })
            } else {
                match self.body.as_mut() {
                    Some(body) if !body.is_finished() => body.send(fd),
                    _ => return (SendProgress::Complete, total),
                }
            };
            match result {
                Ok(sent) if sent > 0 => total += sent as u64,
                Err(nix::Error::Sys(Errno::EAGAIN)) => return (SendProgress::Pending, total),
                // closure or other error
                _ => return (SendProgress::Closed, total),
            }
        }
    }
}

fn html_reply(now: SystemTime, code: u16, body: Vec<u8>) -> Reply {
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
        Date: {}\r\n\
        {}\
        Content-Length: {}\r\n\
        Content-Type: text/html; charset=UTF-8\r\n\
        Connection: close\r\n\
        \r\n",
        code,
        reason_phrase(code),
        HttpDate(now),
        SERVER_HEADER,
        body.len(),
    );
    Reply::new(code, header, Some(Body::generated(body)))
}

/// The built-in page used when no error page is configured.
fn default_page(now: SystemTime, code: u16, reason: &str) -> String {
    let errname = reason_phrase(code);
    format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n\
        {}\
        </body></html>\n",
        code,
        errname,
        errname,
        HtmlEscaped(reason),
        GeneratedOn(now),
    )
}

/// A status reply using the virtual host's `error_page` for `code`, or the built-in page.
pub fn status_page(host: &VirtualHostConfig, now: SystemTime, code: u16, reason: &str) -> Reply {
    let configured = host
        .error_pages
        .get(&code)
        .and_then(|path| match std::fs::read(path) {
            Ok(page) => Some(page),
            Err(e) => {
                tracing::warn!("failed to read error page {} for {}: {}", path, code, e);
                None
            }
        });
    let body = configured.unwrap_or_else(|| default_page(now, code, reason).into_bytes());
    html_reply(now, code, body)
}

/// A redirect reply.
pub fn redirect(now: SystemTime, location: &str) -> Reply {
    let body = format!(
        "<html><head><title>302 Found</title></head><body>\n\
        <h1>Found</h1>\n\
        Moved to: <a href=\"{}\">{}</a>\n\
        <hr>\n\
        {}\
        </body></html>\n",
        HtmlEscaped(location),
        HtmlEscaped(location),
        GeneratedOn(now),
    );
    let header = format!(
        "HTTP/1.1 302 Found\r\n\
        Date: {}\r\n\
        {}\
        Location: {}\r\n\
        Content-Length: {}\r\n\
        Content-Type: text/html; charset=UTF-8\r\n\
        Connection: close\r\n\
        \r\n",
        HttpDate(now),
        SERVER_HEADER,
        location,
        body.len(),
    );
    Reply::new(302, header, Some(Body::generated(body.into_bytes())))
}

/// Directory listing.
struct Listing<'a> {
    base: &'a str,
    entries: Vec<std::fs::DirEntry>,
}

impl<'a> std::fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max_len = self
            .entries
            .iter()
            .map(|dir_entry| dir_entry.file_name().len())
            .max()
            .unwrap_or(2);

        writeln!(f, "<a href=\"{}..\">..</a>/", self.base)?;

        for dir_entry in &self.entries {
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            write!(
                f,
                "<a href=\"{}{}\">{}</a>",
                self.base,
                UrlEncoded(&name),
                HtmlEscaped(&name)
            )?;
            if metadata.is_dir() {
                writeln!(f, "/")?;
            } else {
                for _ in name.len()..max_len {
                    write!(f, " ")?;
                }
                writeln!(f, " {:10}", metadata.len())?;
            }
        }
        Ok(())
    }
}

/// A directory listing reply. `uri` is the decoded request path of the directory.
pub fn listing(host: &VirtualHostConfig, now: SystemTime, dir: &Path, uri: &str) -> Reply {
    let mut entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            let reason = format!("Couldn't list directory: {}", e);
            return status_page(host, now, 500, &reason);
        }
    }
    .filter_map(|entry| entry.ok())
    .collect();
    entries.sort_by_key(|dir_entry| dir_entry.file_name());

    let base = if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{}/", uri)
    };
    let body = format!(
        "<html>\n<head>\n<title>{}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
        {}\
        </pre></tt>\n\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(uri),
        HtmlEscaped(uri),
        Listing {
            base: &base,
            entries
        },
        GeneratedOn(now),
    );
    html_reply(now, 200, body.into_bytes())
}

/// Reply with a regular file. Video files and ranges are sent with a length, everything else
/// with chunked encoding.
pub fn serve_file(
    host: &VirtualHostConfig,
    mime_map: &MimeMap,
    now: SystemTime,
    path: &str,
    range: Option<&str>,
) -> Reply {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => return open_error(host, now, &e),
    };

    let metadata = match file.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            let reason = format!("fstat() failed: {}.", e);
            return status_page(host, now, 500, &reason);
        }
    };
    if !metadata.is_file() {
        return status_page(host, now, 403, "Not a regular file.");
    }

    let mimetype = mime_map.content_type(path);
    let file_len = metadata.len();
    let last_modified = metadata
        .modified()
        .map(|lastmod| format!("Last-Modified: {}\r\n", HttpDate(lastmod)))
        .unwrap_or_default();

    if let Some((from, to)) = range.and_then(|range| parse_range(range, file_len)) {
        let length = to - from + 1;
        let header = format!(
            "HTTP/1.1 206 Partial Content\r\n\
            Date: {}\r\n\
            {}\
            Accept-Ranges: bytes\r\n\
            Content-Length: {}\r\n\
            Content-Range: bytes {}-{}/{}\r\n\
            Content-Type: {}\r\n\
            {}\
            Connection: close\r\n\
            \r\n",
            HttpDate(now),
            SERVER_HEADER,
            length,
            from,
            to,
            file_len,
            mimetype,
            last_modified,
        );
        let body = Body::FromFile {
            file,
            offset: from as i64,
            remaining: length as i64,
        };
        return Reply::new(206, header, Some(body));
    }

    if is_video(mimetype) {
        let header = format!(
            "HTTP/1.1 200 OK\r\n\
            Date: {}\r\n\
            {}\
            Accept-Ranges: bytes\r\n\
            Content-Length: {}\r\n\
            Content-Type: {}\r\n\
            {}\
            Connection: close\r\n\
            \r\n",
            HttpDate(now),
            SERVER_HEADER,
            file_len,
            mimetype,
            last_modified,
        );
        let body = Body::FromFile {
            file,
            offset: 0,
            remaining: file_len as i64,
        };
        return Reply::new(200, header, Some(body));
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\n\
        Date: {}\r\n\
        {}\
        Transfer-Encoding: chunked\r\n\
        Content-Type: {}\r\n\
        {}\
        Connection: close\r\n\
        \r\n",
        HttpDate(now),
        SERVER_HEADER,
        mimetype,
        last_modified,
    );
    let body = Body::Chunked {
        file,
        chunk: Vec::new(),
        chunk_sent: 0,
        finished: false,
    };
    Reply::new(200, header, Some(body))
}

/// Map a failure to open a path onto a status reply.
pub fn open_error(host: &VirtualHostConfig, now: SystemTime, e: &std::io::Error) -> Reply {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => status_page(
            host,
            now,
            403,
            "You don't have permission to access this URL.",
        ),
        std::io::ErrorKind::NotFound => {
            status_page(host, now, 404, "The URL you requested was not found.")
        }
        _ => {
            let reason = format!("The URL you requested cannot be returned: {}.", e);
            status_page(host, now, 500, &reason)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::os::unix::net::UnixStream;

    /// Drive a reply to completion over a socket pair and return what the peer received.
    fn render(mut reply: Reply) -> Vec<u8> {
        let (a, mut b) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let mut out = Vec::new();
            b.read_to_end(&mut out).unwrap();
            out
        });
        loop {
            match reply.poll_send(a.as_raw_fd()) {
                (SendProgress::Complete, _) => break,
                (SendProgress::Pending, _) => std::thread::yield_now(),
                (SendProgress::Closed, _) => panic!("peer closed"),
            }
        }
        drop(a);
        handle.join().unwrap()
    }

    fn split(response: &[u8]) -> (String, Vec<u8>) {
        let pos = crate::util::find(b"\r\n\r\n", response).unwrap();
        (
            String::from_utf8(response[..pos].to_vec()).unwrap(),
            response[pos + 4..].to_vec(),
        )
    }

    fn host() -> VirtualHostConfig {
        VirtualHostConfig {
            root: "/srv".to_string(),
            ..VirtualHostConfig::default()
        }
    }

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1622040683)
    }

    #[test]
    fn status_page_default_body() {
        let reply = status_page(&host(), now(), 404, "Nothing <here>.");
        assert_eq!(reply.http_code, 404);
        let (header, body) = split(&render(reply));
        assert!(header.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(header.contains("Connection: close"));
        assert!(header.contains(&format!("Content-Length: {}", body.len())));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("Nothing &lt;here&gt;."));
    }

    #[test]
    fn status_page_uses_configured_page() {
        let mut page = tempfile::NamedTempFile::new().unwrap();
        page.write_all(b"<p>custom 413</p>").unwrap();
        let mut host = host();
        host.error_pages
            .insert(413, page.path().to_str().unwrap().to_string());
        let (header, body) = split(&render(status_page(&host, now(), 413, "too big")));
        assert!(header.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"));
        assert_eq!(body, b"<p>custom 413</p>");
    }

    #[test]
    fn status_page_falls_back_when_page_missing() {
        let mut host = host();
        host.error_pages.insert(500, "/nonexistent/500.html".to_string());
        let (_, body) = split(&render(status_page(&host, now(), 500, "boom")));
        assert!(String::from_utf8(body).unwrap().contains("boom"));
    }

    #[test]
    fn redirect_sets_location() {
        let (header, _) = split(&render(redirect(now(), "https://example.com/new")));
        assert!(header.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(header.contains("Location: https://example.com/new\r\n"));
    }

    #[test]
    fn send_to_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert_eq!(send(a.as_raw_fd(), b"hello"), Err(nix::Error::Sys(Errno::EPIPE)));

        let mut reply = redirect(now(), "/elsewhere");
        let (progress, sent) = reply.poll_send(a.as_raw_fd());
        assert!(matches!(progress, SendProgress::Closed));
        assert_eq!(sent, 0);
    }

    #[test]
    fn serve_file_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        let contents: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &contents).unwrap();

        let reply = serve_file(&host(), &MimeMap::default(), now(), path.to_str().unwrap(), None);
        let (header, body) = split(&render(reply));
        assert!(header.contains("Transfer-Encoding: chunked"));
        assert!(header.contains("Content-Type: text/html"));

        // undo the chunking
        let mut decoder = crate::body::ChunkedDecoder::default();
        let mut decoded = Vec::new();
        assert!(decoder.decode(&body, &mut decoded).unwrap());
        assert_eq!(decoded, contents);
    }

    #[test]
    fn serve_file_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        let reply = serve_file(
            &host(),
            &MimeMap::default(),
            now(),
            path.to_str().unwrap(),
            Some("bytes=2-5"),
        );
        assert_eq!(reply.http_code, 206);
        let (header, body) = split(&render(reply));
        assert!(header.contains("Content-Range: bytes 2-5/10"));
        assert!(header.contains("Content-Length: 4"));
        assert_eq!(body, b"2345");
    }

    #[test]
    fn serve_file_video_has_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really a video").unwrap();

        let reply = serve_file(&host(), &MimeMap::default(), now(), path.to_str().unwrap(), None);
        let (header, body) = split(&render(reply));
        assert!(header.contains("Accept-Ranges: bytes"));
        assert!(header.contains("Content-Length: 18"));
        assert_eq!(body, b"not really a video");
    }

    #[test]
    fn serve_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.html");
        let reply = serve_file(&host(), &MimeMap::default(), now(), path.to_str().unwrap(), None);
        assert_eq!(reply.http_code, 404);
    }

    #[test]
    fn listing_links_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a b.txt"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let (_, body) = split(&render(listing(&host(), now(), dir.path(), "/files")));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("<h1>/files</h1>"));
        assert!(body.contains("<a href=\"/files/a%20b.txt\">a b.txt</a>"));
        assert!(body.contains("<a href=\"/files/sub\">sub</a>/"));
    }
}
