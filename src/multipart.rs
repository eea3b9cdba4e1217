//! Streaming `multipart/form-data` upload.

use std::path::{Path, PathBuf};

use crate::body::{BodyError, UploadFile};
use crate::util::{find, url_decode};

/// Part headers longer than this are rejected.
const MAX_PART_HEADER: usize = 8 << 10;

/// Extract the boundary parameter from a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PartState {
    /// Before the first delimiter.
    Preamble,
    /// Just after a delimiter; either part headers or the closing `--` follow.
    Delimiter,
    Headers,
    Content,
    Finished,
}

/// Writes the first file part of a multipart body into a directory. Parts without a filename
/// are skipped. Data is held back only as long as it might be the start of a delimiter.
#[derive(Debug)]
pub struct MultipartUpload {
    /// `--` followed by the boundary.
    delimiter: Vec<u8>,
    dir: PathBuf,
    state: PartState,
    buffer: Vec<u8>,
    file: Option<UploadFile>,
    saved: Option<PathBuf>,
}

impl MultipartUpload {
    pub fn new(boundary: &str, dir: PathBuf) -> Self {
        let mut delimiter = b"--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            dir,
            state: PartState::Preamble,
            buffer: Vec::new(),
            file: None,
            saved: None,
        }
    }

    /// Path of the stored file once the upload has finished.
    pub fn saved(&self) -> Option<&Path> {
        self.saved.as_deref()
    }

    /// Consume body bytes. Returns true once the upload is complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<bool, BodyError> {
        if self.state == PartState::Finished {
            return Ok(true);
        }
        self.buffer.extend_from_slice(data);
        loop {
            match self.state {
                PartState::Preamble => match find(&self.delimiter, &self.buffer) {
                    Some(pos) => {
                        self.buffer.drain(..pos + self.delimiter.len());
                        self.state = PartState::Delimiter;
                    }
                    None => {
                        let keep = self.delimiter.len();
                        let discard = self.buffer.len().saturating_sub(keep);
                        self.buffer.drain(..discard);
                        return Ok(false);
                    }
                },
                PartState::Delimiter => {
                    if self.buffer.len() < 2 {
                        return Ok(false);
                    }
                    if self.buffer.starts_with(b"--") {
                        // closing delimiter without any file part
                        self.state = PartState::Finished;
                        return Ok(true);
                    }
                    self.state = PartState::Headers;
                }
                PartState::Headers => {
                    let end = match find(b"\r\n\r\n", &self.buffer) {
                        Some(end) => end,
                        None if self.buffer.len() > MAX_PART_HEADER => {
                            return Err(BodyError::Malformed("part headers too long".into()))
                        }
                        None => return Ok(false),
                    };
                    let headers = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                    self.buffer.drain(..end + 4);
                    if let Some(filename) = part_filename(&headers)? {
                        let path = self.dir.join(filename);
                        tracing::debug!("receiving upload into {}", path.display());
                        self.file = Some(UploadFile::create(path)?);
                    }
                    self.state = PartState::Content;
                }
                PartState::Content => match find(&self.delimiter, &self.buffer) {
                    Some(pos) => {
                        let end = if self.buffer[..pos].ends_with(b"\r\n") {
                            pos - 2
                        } else {
                            pos
                        };
                        if let Some(file) = self.file.as_mut() {
                            file.write_all(&self.buffer[..end])?;
                        }
                        self.buffer.drain(..pos + self.delimiter.len());
                        if let Some(file) = self.file.take() {
                            self.saved = Some(file.commit());
                            self.state = PartState::Finished;
                            return Ok(true);
                        }
                        self.state = PartState::Delimiter;
                    }
                    None => {
                        // A delimiter may straddle reads, along with the CRLF before it.
                        let keep = self.delimiter.len() + 1;
                        let safe = self.buffer.len().saturating_sub(keep);
                        if let Some(file) = self.file.as_mut() {
                            file.write_all(&self.buffer[..safe])?;
                        }
                        self.buffer.drain(..safe);
                        return Ok(false);
                    }
                },
                PartState::Finished => return Ok(true),
            }
        }
    }

    /// The body ended before a closing delimiter. Keep whatever file data arrived.
    pub fn finish(&mut self) -> Result<(), BodyError> {
        if self.state == PartState::Content {
            if let Some(mut file) = self.file.take() {
                file.write_all(&self.buffer)?;
                self.saved = Some(file.commit());
            }
        }
        self.buffer.clear();
        self.state = PartState::Finished;
        Ok(())
    }
}

/// Filename from the part's Content-Disposition header, reduced to its last path component.
fn part_filename(headers: &str) -> Result<Option<String>, BodyError> {
    let disposition = match headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then(|| value)
    }) {
        Some(disposition) => disposition,
        None => return Ok(None),
    };

    let raw = match disposition
        .split(';')
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("filename"))
    {
        Some((_, value)) => value.trim().trim_matches('"'),
        None => return Ok(None),
    };
    if raw.is_empty() {
        return Ok(None);
    }

    let decoded = String::from_utf8_lossy(&url_decode(raw)).into_owned();
    let name = Path::new(&decoded)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BodyError::Malformed(format!("invalid upload filename `{}'", raw)))?;
    Ok(Some(name))
}
