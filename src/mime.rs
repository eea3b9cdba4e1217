//! Extension to MIME type lookup.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js mjs",
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "audio/wav               wav",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/webp              webp",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/x-matroska        mkv",
    "video/mp4               mp4",
    "video/webm              webm",
];

#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add entries from an `extension:mimetype` file. Entries replace built-in ones.
    pub fn parse_extension_map_file(&mut self, filename: &Path) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", filename.display()))?;
            self.add_extension_line(&line);
        }
        Ok(())
    }

    /// Add line like `.html: text/html`.
    fn add_extension_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let (extension, mimetype) = match line.split_once(':') {
            Some(pair) => pair,
            None => return,
        };
        let extension = extension.trim().trim_start_matches('.');
        let mimetype = mimetype.trim();
        if extension.is_empty() || mimetype.is_empty() {
            return;
        }
        self.mimetypes
            .insert(extension.to_ascii_lowercase(), mimetype.to_string());
    }

    /// Add line from the built-in table: a mimetype followed by its extensions.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return,
        };
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a path by its final extension.
    pub fn content_type(&self, path: &str) -> &str {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.rsplit_once('.')
            .and_then(|(_, extension)| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// Video responses always stream with a length and advertise ranges.
pub fn is_video(mimetype: &str) -> bool {
    mimetype.starts_with("video/")
}
