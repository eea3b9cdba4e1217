//! A single-threaded HTTP/1.1 server for static sites with uploads and CGI, configured with
//! nginx-style `server` blocks.

pub mod accounts;
pub mod body;
pub mod cgi;
pub mod config;
pub mod connection;
pub mod http;
pub mod mime;
pub mod multipart;
pub mod poll;
pub mod request;
pub mod response;
pub mod server;
pub mod util;
pub mod vhost;
