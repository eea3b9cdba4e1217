//! Request body decoding: transfer framing, size limits and the sinks bodies are streamed into.

use std::fs::{remove_file, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::multipart::MultipartUpload;

/// Largest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// A file being written from a request body. Removed from disk on drop unless committed.
#[derive(Debug)]
pub struct UploadFile {
    file: Option<File>,
    path: PathBuf,
    committed: bool,
}

impl UploadFile {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: Some(file),
            path,
            committed: false,
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "upload file already closed",
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the file and keep it on disk.
    pub fn commit(mut self) -> PathBuf {
        self.file = None;
        self.committed = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for UploadFile {
    fn drop(&mut self) {
        self.file = None;
        if !self.committed {
            if let Err(e) = remove_file(&self.path) {
                tracing::warn!("failed to remove partial upload {}: {}", self.path.display(), e);
            } else {
                tracing::debug!("removed partial upload {}", self.path.display());
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ChunkError {
    InvalidSize,
    LineTooLong,
    MissingCrlf,
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "invalid chunk size"),
            Self::LineTooLong => write!(f, "chunk line too long"),
            Self::MissingCrlf => write!(f, "chunk data not followed by CRLF"),
        }
    }
}

impl std::error::Error for ChunkError {}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Resumable `Transfer-Encoding: chunked` decoder. Input may be split at any byte.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    /// Partial size or trailer line carried between reads.
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }
}

impl ChunkedDecoder {
    /// Decode `input`, appending payload bytes to `out`. Returns true once the terminating
    /// zero-size chunk and trailers have been consumed; bytes after that are ignored.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<bool, ChunkError> {
        let mut i = 0;
        while i < input.len() {
            match self.state {
                ChunkState::Size => {
                    let byte = input[i];
                    i += 1;
                    if byte != b'\n' {
                        self.push_line_byte(byte)?;
                        continue;
                    }
                    let size = parse_chunk_size(&self.line)?;
                    self.line.clear();
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let available = (input.len() - i) as u64;
                    let take = remaining.min(available) as usize;
                    out.extend_from_slice(&input[i..i + take]);
                    i += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining)
                    };
                }
                ChunkState::DataEnd => {
                    match input[i] {
                        b'\r' => {}
                        b'\n' => self.state = ChunkState::Size,
                        _ => return Err(ChunkError::MissingCrlf),
                    }
                    i += 1;
                }
                ChunkState::Trailer => {
                    let byte = input[i];
                    i += 1;
                    if byte != b'\n' {
                        self.push_line_byte(byte)?;
                        continue;
                    }
                    let blank = self.line.iter().all(|&b| b == b'\r');
                    self.line.clear();
                    if blank {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }
        Ok(self.state == ChunkState::Done)
    }

    fn push_line_byte(&mut self, byte: u8) -> Result<(), ChunkError> {
        if self.line.len() >= MAX_CHUNK_LINE {
            return Err(ChunkError::LineTooLong);
        }
        self.line.push(byte);
        Ok(())
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkError> {
    let line = std::str::from_utf8(line).map_err(|_| ChunkError::InvalidSize)?;
    // drop extensions
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(ChunkError::InvalidSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| ChunkError::InvalidSize)
}

/// Why a request body could not be received.
#[derive(Debug)]
pub enum BodyError {
    TooLarge,
    Malformed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge => write!(f, "request body exceeds client_max_body_size"),
            Self::Malformed(reason) => write!(f, "malformed request body: {}", reason),
            Self::Io(e) => write!(f, "failed to store request body: {}", e),
        }
    }
}

impl std::error::Error for BodyError {}

impl From<std::io::Error> for BodyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ChunkError> for BodyError {
    fn from(e: ChunkError) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Plain-text bodies are stored under this name in the upload directory.
pub const PLAIN_TEXT_FILENAME: &str = "plain_text.txt";

/// CGI bodies larger than this are spooled to disk.
pub const CGI_MEMORY_LIMIT: usize = 1 << 20;

/// Request body collected for a CGI script.
#[derive(Debug)]
pub enum CgiInput {
    Memory(Vec<u8>),
    Spooled(UploadFile),
}

impl CgiInput {
    /// Body size advertised to the script as CONTENT_LENGTH.
    pub fn content_length(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::Spooled(file) => std::fs::metadata(file.path()).map_or(0, |m| m.len()),
        }
    }
}

/// Buffers a CGI request body, moving to a file in `dir` once it outgrows memory.
#[derive(Debug)]
pub struct CgiSpool {
    memory: Vec<u8>,
    file: Option<UploadFile>,
    dir: PathBuf,
    limit: usize,
}

impl CgiSpool {
    pub fn new(dir: PathBuf, limit: usize) -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            dir,
            limit,
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            return file.write_all(data);
        }
        if self.memory.len() + data.len() <= self.limit {
            self.memory.extend_from_slice(data);
            return Ok(());
        }
        let name = format!(
            ".cgi-body-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos())
        );
        let mut file = UploadFile::create(self.dir.join(name))?;
        file.write_all(&self.memory)?;
        file.write_all(data)?;
        self.memory = Vec::new();
        self.file = Some(file);
        Ok(())
    }

    pub fn into_input(self) -> CgiInput {
        match self.file {
            Some(file) => CgiInput::Spooled(file),
            None => CgiInput::Memory(self.memory),
        }
    }
}

/// Where decoded body bytes go.
#[derive(Debug)]
pub enum BodySink {
    Multipart(MultipartUpload),
    Form(Vec<u8>),
    PlainText(UploadFile),
    Cgi(CgiSpool),
}

impl BodySink {
    /// Consume decoded bytes. Returns true if the sink needs no more data.
    fn write(&mut self, data: &[u8]) -> Result<bool, BodyError> {
        match self {
            Self::Multipart(upload) => upload.feed(data),
            Self::Form(buf) => {
                buf.extend_from_slice(data);
                Ok(false)
            }
            Self::PlainText(file) => {
                file.write_all(data)?;
                Ok(false)
            }
            Self::Cgi(spool) => {
                spool.write(data)?;
                Ok(false)
            }
        }
    }

    /// The body ended without the sink finishing on its own.
    fn finish(&mut self) -> Result<(), BodyError> {
        match self {
            Self::Multipart(upload) => upload.finish(),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked(ChunkedDecoder),
}

/// Streams one request body from raw socket bytes into a sink.
#[derive(Debug)]
pub struct BodyReader {
    framing: Framing,
    /// Raw body bytes received so far, framing included.
    bytes_read: u64,
    max_size: u64,
    sink: Option<BodySink>,
    decoded: Vec<u8>,
}

impl BodyReader {
    pub fn with_length(length: u64, max_size: u64, sink: BodySink) -> Self {
        Self::new(Framing::Length(length), max_size, sink)
    }

    pub fn chunked(max_size: u64, sink: BodySink) -> Self {
        Self::new(Framing::Chunked(ChunkedDecoder::default()), max_size, sink)
    }

    fn new(framing: Framing, max_size: u64, sink: BodySink) -> Self {
        Self {
            framing,
            bytes_read: 0,
            max_size,
            sink: Some(sink),
            decoded: Vec::new(),
        }
    }

    /// Feed raw bytes from the socket. Returns true once the body is complete, after which
    /// `into_sink` yields the finished sink.
    pub fn feed(&mut self, raw: &[u8]) -> Result<bool, BodyError> {
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => return Ok(true),
        };
        let raw = match self.framing {
            // Ignore anything past the declared length.
            Framing::Length(length) => {
                let wanted = length.saturating_sub(self.bytes_read);
                &raw[..raw.len().min(wanted as usize)]
            }
            Framing::Chunked(_) => raw,
        };
        self.bytes_read += raw.len() as u64;
        if self.bytes_read > self.max_size {
            return Err(BodyError::TooLarge);
        }

        let (done_sink, body_ended) = match &mut self.framing {
            Framing::Length(length) => (sink.write(raw)?, self.bytes_read >= *length),
            Framing::Chunked(decoder) => {
                self.decoded.clear();
                let ended = decoder.decode(raw, &mut self.decoded)?;
                (sink.write(&self.decoded)?, ended)
            }
        };
        if done_sink {
            return Ok(true);
        }
        if body_ended {
            sink.finish()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn into_sink(mut self) -> Option<BodySink> {
        self.sink.take()
    }
}

/// Split an urlencoded body into `key=value` pairs. Values are kept exactly as sent; pairs
/// without `=` are skipped.
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(body)
        .trim_end_matches(&['\r', '\n'][..])
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
