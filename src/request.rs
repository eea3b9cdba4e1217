//! Request resolution against a virtual host, method routing and the handlers behind it.

use std::fs::{remove_dir, remove_file, symlink_metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::unistd::{access, AccessFlags};

use crate::accounts::Accounts;
use crate::body::{
    parse_form, BodySink, CgiInput, CgiSpool, UploadFile, CGI_MEMORY_LIMIT, PLAIN_TEXT_FILENAME,
};
use crate::cgi::{is_cgi_script, CgiProcess, CgiRequest};
use crate::config::LocationConfig;
use crate::http::RequestHead;
use crate::mime::MimeMap;
use crate::multipart::{boundary_from_content_type, MultipartUpload};
use crate::response::{listing, open_error, serve_file, status_page, Reply};
use crate::util::{make_safe_url, url_decode};
use crate::vhost::VirtualHost;

/// Where uploads and deletions go when the location does not say.
pub const DEFAULT_UPLOAD_DIR: &str = "upload";

/// One parsed request resolved against its virtual host.
#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    /// Decoded and normalized path component of the target.
    pub uri: String,
    pub query: String,
    /// Filesystem path: the applicable root followed by `uri`.
    pub path: String,
    /// Index of the longest matching location.
    pub location: Option<usize>,
    pub redirect: Option<String>,
    pub cgi_interpreter: Option<String>,
}

/// What to do with a request once its head is parsed.
#[derive(Debug, PartialEq)]
pub enum Route {
    Redirect(String),
    NotAllowed,
    Cgi,
    Get,
    Delete,
    Post,
}

impl Request {
    /// Resolve the request target. Fails with a reason for targets that cannot be mapped onto
    /// the filesystem safely.
    pub fn new(head: RequestHead, host: &VirtualHost) -> Result<Self, &'static str> {
        let (target, query) = match head.target.split_once('?') {
            Some((target, query)) => (target, query),
            None => (head.target.as_str(), ""),
        };
        let decoded =
            String::from_utf8(url_decode(target)).map_err(|_| "You requested an invalid URL.")?;
        let uri = make_safe_url(&decoded).ok_or("You requested an invalid URL.")?;

        let matched = host.location(&uri);
        let root = matched
            .and_then(|(_, location)| location.root.as_deref())
            .unwrap_or(&host.config.root);
        let path = format!("{}{}", root.trim_end_matches('/'), uri);
        let redirect = matched
            .and_then(|(_, location)| location.redirection.clone())
            .filter(|redirect| !redirect.is_empty());
        let cgi_interpreter = matched
            .and_then(|(_, location)| location.cgi_path.clone())
            .filter(|interpreter| !interpreter.is_empty() && is_cgi_script(&path));

        Ok(Self {
            query: query.to_string(),
            head,
            uri,
            path,
            location: matched.map(|(index, _)| index),
            redirect,
            cgi_interpreter,
        })
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn location<'h>(&self, host: &'h VirtualHost) -> Option<&'h LocationConfig> {
        self.location.map(|index| &host.config.locations[index])
    }

    pub fn route(&self, host: &VirtualHost) -> Route {
        if let Some(redirect) = &self.redirect {
            return Route::Redirect(redirect.clone());
        }
        match self.location(host) {
            Some(location) if location.allows(self.method()) => {}
            _ => return Route::NotAllowed,
        }
        match self.method() {
            "GET" | "POST" if self.cgi_interpreter.is_some() => Route::Cgi,
            "GET" => Route::Get,
            "POST" => Route::Post,
            "DELETE" => Route::Delete,
            _ => Route::NotAllowed,
        }
    }

    /// Directory that receives uploads for this request.
    pub fn upload_dir(&self, host: &VirtualHost) -> PathBuf {
        PathBuf::from(
            self.location(host)
                .and_then(|location| location.upload_path.as_deref())
                .unwrap_or(DEFAULT_UPLOAD_DIR),
        )
    }
}

/// Process a GET request for a static file or directory.
pub fn process_get(
    host: &VirtualHost,
    mime_map: &MimeMap,
    now: SystemTime,
    request: &Request,
) -> Reply {
    let config = &host.config;
    let range = request.head.header("range");
    let metadata = match std::fs::metadata(&request.path) {
        Ok(metadata) => metadata,
        Err(e) => return open_error(config, now, &e),
    };
    if !metadata.is_dir() {
        return serve_file(config, mime_map, now, &request.path, range);
    }

    let location = request.location(host);
    let index_files = match location {
        Some(location) if !location.index.is_empty() => &location.index,
        _ => &config.index_files,
    };
    let dir = request.path.trim_end_matches('/');
    for name in index_files {
        let candidate = format!("{}/{}", dir, name);
        if Path::new(&candidate).is_file() {
            return serve_file(config, mime_map, now, &candidate, range);
        }
    }

    if location.map_or(false, |location| location.autoindex) {
        return listing(config, now, Path::new(&request.path), &request.uri);
    }
    status_page(
        config,
        now,
        403,
        "Directory listing is not enabled for this URL.",
    )
}

/// Process a DELETE request. The target is the last segment of the URI inside the upload
/// directory.
pub fn process_delete(host: &VirtualHost, now: SystemTime, request: &Request) -> Reply {
    let config = &host.config;
    let name = match request.uri.rsplit('/').find(|segment| !segment.is_empty()) {
        Some(name) => name,
        None => return status_page(config, now, 404, "The URL you requested was not found."),
    };
    let path = request.upload_dir(host).join(name);

    let metadata = match symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) => return open_error(config, now, &e),
    };
    if access(&path, AccessFlags::W_OK).is_err() {
        return status_page(
            config,
            now,
            403,
            "You don't have permission to delete this URL.",
        );
    }
    let removed = if metadata.is_dir() {
        remove_dir(&path)
    } else {
        remove_file(&path)
    };
    match removed {
        Ok(()) => {
            tracing::info!("deleted {}", path.display());
            status_page(config, now, 200, "The file was deleted.")
        }
        Err(e) => {
            let reason = format!("The file could not be deleted: {}.", e);
            status_page(config, now, 500, &reason)
        }
    }
}

/// Choose the sink for a POST body. CGI bodies are passed through untouched; everything else
/// is classified by content type. Fails with a status code and reason.
pub fn body_sink(host: &VirtualHost, request: &Request) -> Result<BodySink, (u16, String)> {
    let upload_dir = request.upload_dir(host);
    if request.cgi_interpreter.is_some() {
        return Ok(BodySink::Cgi(CgiSpool::new(upload_dir, CGI_MEMORY_LIMIT)));
    }

    let content_type = request.head.header("content-type").unwrap_or("");
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match media_type.as_str() {
        "multipart/form-data" => match boundary_from_content_type(content_type) {
            Some(boundary) => Ok(BodySink::Multipart(MultipartUpload::new(
                &boundary, upload_dir,
            ))),
            None => Err((400, "Multipart request without a boundary.".to_string())),
        },
        "application/x-www-form-urlencoded" => Ok(BodySink::Form(Vec::new())),
        "text/plain" | "plain/text" => UploadFile::create(upload_dir.join(PLAIN_TEXT_FILENAME))
            .map(BodySink::PlainText)
            .map_err(|e| {
                tracing::warn!("failed to create upload in {}: {}", upload_dir.display(), e);
                (500, format!("The upload could not be stored: {}.", e))
            }),
        _ => Err((
            400,
            format!("Unsupported content type `{}'.", content_type),
        )),
    }
}

/// Answer a completed urlencoded form post.
pub fn process_form(
    host: &VirtualHost,
    mime_map: &MimeMap,
    now: SystemTime,
    request: &Request,
    accounts: &mut Accounts,
    body: &[u8],
) -> Reply {
    let form = parse_form(body);
    let page = accounts.submit(Path::new(&request.path), &form);
    serve_file(&host.config, mime_map, now, &page.to_string_lossy(), None)
}

/// Start the request's CGI script. Fails with the reply to send instead.
pub fn spawn_cgi(
    host: &VirtualHost,
    request: &Request,
    input: Option<CgiInput>,
    now: SystemTime,
) -> Result<CgiProcess, Reply> {
    let config = &host.config;
    let interpreter = match request.cgi_interpreter.as_deref() {
        Some(interpreter) => interpreter,
        None => return Err(status_page(config, now, 500, "No CGI interpreter configured.")),
    };
    let script = Path::new(&request.path);
    if !script.is_file() {
        return Err(status_page(
            config,
            now,
            404,
            "The URL you requested was not found.",
        ));
    }
    let server_name = if config.server_name.is_empty() {
        &config.host
    } else {
        &config.server_name
    };
    let cgi_request = CgiRequest {
        interpreter,
        script,
        method: request.method(),
        target: &request.head.target,
        uri: &request.uri,
        query: &request.query,
        server_name,
        server_port: config.port,
        content_type: request.head.header("content-type"),
    };
    CgiProcess::spawn(&cgi_request, input, now).map_err(|e| {
        tracing::warn!("failed to start CGI {}: {}", script.display(), e);
        status_page(config, now, 500, "The CGI script could not be started.")
    })
}
