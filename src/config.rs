//! `.conf` file parsing into virtual-host definitions.
//!
//! The grammar is a small nginx-like block syntax:
//!
//! ```text
//! server {
//!     listen 127.0.0.1:8080;
//!     server_name example.com;
//!     root ./www;
//!     error_page 404 ./errors/404.html;
//!     location /upload {
//!         method POST DELETE;
//!         upload_path ./www/upload;
//!     }
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_CLIENT_MAX_BODY_SIZE: u64 = 1 << 20;

/// One `server { ... }` block.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHostConfig {
    pub host: String,
    pub port: u16,
    pub root: String,
    pub server_name: String,
    pub index_files: Vec<String>,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: u64,
    pub locations: Vec<LocationConfig>,
}

impl Default for VirtualHostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            root: String::new(),
            server_name: String::new(),
            index_files: vec![DEFAULT_INDEX_NAME.to_string()],
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            locations: Vec::new(),
        }
    }
}

impl VirtualHostConfig {
    /// Address to bind. `localhost` binds every interface.
    pub fn bind_host(&self) -> &str {
        if self.host.is_empty() || self.host == "localhost" {
            DEFAULT_HOST
        } else {
            &self.host
        }
    }
}

/// One `location <path> { ... }` block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationConfig {
    pub path: String,
    /// Upper-case method names. Empty allows every method.
    pub methods: BTreeSet<String>,
    pub autoindex: bool,
    pub root: Option<String>,
    pub index: Vec<String>,
    pub upload_path: Option<String>,
    pub cgi_path: Option<String>,
    pub redirection: Option<String>,
}

impl LocationConfig {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// Virtual hosts sharing one listening address, in declaration order. The first one is the
/// default for requests whose Host header matches none of them.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenGroup {
    pub host: String,
    pub port: u16,
    pub hosts: Vec<usize>,
}

impl ListenGroup {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Group virtual hosts by the address they bind.
pub fn listen_map(hosts: &[VirtualHostConfig]) -> Vec<ListenGroup> {
    let mut groups: Vec<ListenGroup> = Vec::new();
    for (index, config) in hosts.iter().enumerate() {
        let host = config.bind_host();
        match groups
            .iter_mut()
            .find(|group| group.host == host && group.port == config.port)
        {
            Some(group) => group.hosts.push(index),
            None => groups.push(ListenGroup {
                host: host.to_string(),
                port: config.port,
                hosts: vec![index],
            }),
        }
    }
    groups
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> Result<Vec<VirtualHostConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse configuration text.
pub fn parse_config(text: &str) -> Result<Vec<VirtualHostConfig>> {
    let mut parser = Parser::default();
    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        parser
            .parse_line(line)
            .map_err(|e| anyhow!("line {}: {}", line_number, e))?;
    }
    parser.finish()
}

#[derive(Debug)]
enum Opening {
    Server,
    Location(String),
}

#[derive(Debug, Default)]
struct Parser {
    servers: Vec<VirtualHostConfig>,
    server: Option<VirtualHostConfig>,
    location: Option<LocationConfig>,
    /// Block keyword seen on a line without its `{`.
    pending: Option<Opening>,
}

impl Parser {
    fn parse_line(&mut self, line: &str) -> Result<()> {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        }
        .trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(opening) = self.pending.take() {
            if line != "{" {
                bail!("expected `{{' after block keyword");
            }
            return self.open(opening);
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens[0] {
            "server" => {
                let opening = Opening::Server;
                self.begin(opening, &tokens[1..])
            }
            "location" => {
                let path = match tokens.get(1) {
                    Some(&"{") | None => bail!("location requires a path"),
                    Some(path) => path,
                };
                let opening = Opening::Location(normalize_location_path(path)?);
                self.begin(opening, &tokens[2..])
            }
            "}" if tokens.len() == 1 => self.close(),
            _ => self.directive(line),
        }
    }

    /// Handle a block keyword's trailing tokens, which are either `{` or nothing.
    fn begin(&mut self, opening: Opening, rest: &[&str]) -> Result<()> {
        match rest {
            [] => {
                self.check_can_open(&opening)?;
                self.pending = Some(opening);
                Ok(())
            }
            ["{"] => self.open(opening),
            _ => bail!("unexpected tokens after block keyword"),
        }
    }

    fn check_can_open(&self, opening: &Opening) -> Result<()> {
        match opening {
            Opening::Server if self.server.is_some() => bail!("server blocks cannot be nested"),
            Opening::Location(_) if self.server.is_none() => {
                bail!("location block outside of server block")
            }
            Opening::Location(_) if self.location.is_some() => {
                bail!("location blocks cannot be nested")
            }
            _ => Ok(()),
        }
    }

    fn open(&mut self, opening: Opening) -> Result<()> {
        self.check_can_open(&opening)?;
        match opening {
            Opening::Server => self.server = Some(VirtualHostConfig::default()),
            Opening::Location(path) => {
                self.location = Some(LocationConfig {
                    path,
                    ..LocationConfig::default()
                })
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(location) = self.location.take() {
            // A location can only be open inside a server.
            if let Some(server) = self.server.as_mut() {
                server.locations.push(location);
            }
            return Ok(());
        }
        let server = self
            .server
            .take()
            .ok_or_else(|| anyhow!("unexpected `}}'"))?;
        if server.root.is_empty() {
            bail!("server block is missing a root directive");
        }
        if let Some(existing) = self.servers.iter().find(|existing| {
            existing.port == server.port && existing.server_name == server.server_name
        }) {
            bail!(
                "duplicate server for port {} and server_name `{}'",
                existing.port,
                existing.server_name
            );
        }
        self.servers.push(server);
        Ok(())
    }

    fn directive(&mut self, line: &str) -> Result<()> {
        let line = line
            .strip_suffix(';')
            .ok_or_else(|| anyhow!("directive must end with `;'"))?;
        let mut tokens = line.split_whitespace();
        let name = tokens.next().ok_or_else(|| anyhow!("empty directive"))?;
        let args: Vec<&str> = tokens.collect();

        if let Some(location) = self.location.as_mut() {
            return location_directive(location, name, &args);
        }
        match self.server.as_mut() {
            Some(server) => server_directive(server, name, &args),
            None => bail!("directive `{}' outside of server block", name),
        }
    }

    fn finish(self) -> Result<Vec<VirtualHostConfig>> {
        if self.pending.is_some() || self.server.is_some() || self.location.is_some() {
            bail!("unclosed block at end of file");
        }
        if self.servers.is_empty() {
            bail!("no server blocks defined");
        }
        Ok(self.servers)
    }
}

fn single<'a>(name: &str, args: &[&'a str]) -> Result<&'a str> {
    match args {
        [value] => Ok(value),
        _ => bail!("`{}' takes exactly one value", name),
    }
}

fn server_directive(server: &mut VirtualHostConfig, name: &str, args: &[&str]) -> Result<()> {
    match name {
        "listen" => {
            let value = single(name, args)?;
            let (host, port) = match value.rsplit_once(':') {
                Some((host, port)) => (Some(host), port),
                None => (None, value),
            };
            server.port = parse_port(port)?;
            if let Some(host) = host {
                server.host = host.to_string();
            }
        }
        "host" => server.host = single(name, args)?.to_string(),
        "root" => server.root = single(name, args)?.to_string(),
        "server_name" => server.server_name = single(name, args)?.to_string(),
        "index" => {
            if args.is_empty() {
                bail!("`index' needs at least one file name");
            }
            server.index_files = args.iter().map(|arg| arg.to_string()).collect();
        }
        "error_page" => {
            let (path, codes) = match args.split_last() {
                Some((path, codes)) if !codes.is_empty() => (path, codes),
                _ => bail!("`error_page' needs one or more status codes and a path"),
            };
            for code in codes {
                let code: u16 = code
                    .parse()
                    .ok()
                    .filter(|code| (100..600).contains(code))
                    .ok_or_else(|| anyhow!("invalid status code `{}'", code))?;
                server.error_pages.insert(code, path.to_string());
            }
        }
        "client_max_body_size" => {
            server.client_max_body_size = parse_size(single(name, args)?)?;
        }
        _ => bail!("unknown server directive `{}'", name),
    }
    Ok(())
}

fn location_directive(location: &mut LocationConfig, name: &str, args: &[&str]) -> Result<()> {
    match name {
        "method" => {
            let methods: Vec<String> = args
                .iter()
                .flat_map(|arg| arg.split(','))
                .map(str::trim)
                .filter(|method| !method.is_empty())
                .map(str::to_uppercase)
                .collect();
            if methods.is_empty() {
                bail!("`method' needs at least one method");
            }
            location.methods.extend(methods);
        }
        "autoindex" => {
            location.autoindex = match single(name, args)? {
                "on" => true,
                "off" => false,
                value => bail!("invalid autoindex value `{}', expected on or off", value),
            }
        }
        "root" => location.root = Some(single(name, args)?.to_string()),
        "index" => {
            if args.is_empty() {
                bail!("`index' needs at least one file name");
            }
            location.index = args.iter().map(|arg| arg.to_string()).collect();
        }
        "upload_path" => location.upload_path = Some(single(name, args)?.to_string()),
        "cgi_path" => location.cgi_path = Some(single(name, args)?.to_string()),
        "redirection" => location.redirection = Some(single(name, args)?.to_string()),
        _ => bail!("unknown location directive `{}'", name),
    }
    Ok(())
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|&port| port != 0)
        .ok_or_else(|| anyhow!("invalid port `{}'", port))
}

/// Parse a byte count with an optional K, M or G suffix.
fn parse_size(value: &str) -> Result<u64> {
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&value[..value.len() - 1], 1 << 10),
        Some('M') => (&value[..value.len() - 1], 1 << 20),
        Some('G') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|size| size.checked_mul(multiplier))
        .ok_or_else(|| anyhow!("invalid client_max_body_size `{}'", value))
}

fn normalize_location_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        bail!("location path `{}' must start with /", path);
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    const EXAMPLE: &str = "
# two hosts on one port
server {
    listen 127.0.0.1:8080;
    server_name one.test;
    root ./www;
    index index.html index.htm;
    error_page 404 500 ./errors/generic.html;
    client_max_body_size 2K;

    location / {
        method GET,POST;
        autoindex on;
    }
    location /upload/
    {
        method DELETE POST;
        upload_path ./www/upload;
    }
    location /old {
        redirection https://example.com/new;
    }
}

server
{
    listen 127.0.0.1:8080;
    server_name two.test;
    root ./www2;
}
";

    #[test]
    fn parses_full_example() {
        let hosts = parse_config(EXAMPLE).unwrap();
        assert_eq!(hosts.len(), 2);

        let one = &hosts[0];
        assert_eq!(one.host, "127.0.0.1");
        assert_eq!(one.port, 8080);
        assert_eq!(one.server_name, "one.test");
        assert_eq!(one.index_files, vec!["index.html", "index.htm"]);
        assert_eq!(one.error_pages.get(&404).map(String::as_str), Some("./errors/generic.html"));
        assert_eq!(one.error_pages.get(&500).map(String::as_str), Some("./errors/generic.html"));
        assert_eq!(one.client_max_body_size, 2048);
        assert_eq!(one.locations.len(), 3);

        let root = &one.locations[0];
        assert!(root.autoindex);
        assert!(root.allows("GET") && root.allows("POST") && !root.allows("DELETE"));

        let upload = &one.locations[1];
        assert_eq!(upload.path, "/upload");
        assert_eq!(upload.upload_path.as_deref(), Some("./www/upload"));

        assert_eq!(
            one.locations[2].redirection.as_deref(),
            Some("https://example.com/new")
        );
        assert!(one.locations[2].allows("PATCH"));

        let two = &hosts[1];
        assert_eq!(two.index_files, vec![DEFAULT_INDEX_NAME]);
        assert_eq!(two.client_max_body_size, DEFAULT_CLIENT_MAX_BODY_SIZE);
    }

    #[test]
    fn listen_map_groups_by_address() {
        let mut hosts = parse_config(EXAMPLE).unwrap();
        hosts.push(VirtualHostConfig {
            host: "localhost".to_string(),
            port: 9090,
            root: "./x".to_string(),
            ..VirtualHostConfig::default()
        });
        let groups = listen_map(&hosts);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].addr(), "127.0.0.1:8080");
        assert_eq!(groups[0].hosts, vec![0, 1]);
        assert_eq!(groups[1].addr(), "0.0.0.0:9090");
        assert_eq!(groups[1].hosts, vec![2]);
    }

    #[test]
    fn listen_accepts_bare_port() {
        let hosts = parse_config("server {\nlisten 8081;\nroot /srv;\n}\n").unwrap();
        assert_eq!(hosts[0].port, 8081);
        assert_eq!(hosts[0].host, DEFAULT_HOST);
    }

    #[test_case("server {\nroot /srv\n}\n", "line 2" ; "missing semicolon")]
    #[test_case("server {\nroot /srv;\nbogus on;\n}\n", "unknown server directive" ; "unknown directive")]
    #[test_case("server {\nroot /srv;\nlocation / {\nfrobnicate;\n}\n}\n", "unknown location directive" ; "unknown location directive")]
    #[test_case("server {\nroot /srv;\n", "unclosed block" ; "unclosed server")]
    #[test_case("server {\nroot /srv;\nlocation /a {\nlocation /b {\n}\n}\n}\n", "cannot be nested" ; "nested location")]
    #[test_case("server {\nlisten 80;\n}\n", "missing a root" ; "missing root")]
    #[test_case("", "no server blocks" ; "empty file")]
    #[test_case("root /srv;\n", "outside of server" ; "directive outside server")]
    #[test_case("server {\nroot /srv;\nlocation / {\nautoindex maybe;\n}\n}\n", "invalid autoindex" ; "bad autoindex")]
    #[test_case("server {\nroot /srv;\nlisten 99999;\n}\n", "invalid port" ; "bad port")]
    #[test_case("server {\nroot /srv;\nerror_page 404;\n}\n", "error_page" ; "error page without path")]
    #[test_case("server\nroot /srv;\n", "expected `{'" ; "missing brace")]
    fn rejects_invalid_config(text: &str, message: &str) {
        let error = parse_config(text).unwrap_err().to_string();
        assert!(error.contains(message), "{:?} does not mention {:?}", error, message);
    }

    #[test]
    fn rejects_duplicate_port_and_server_name() {
        let text = "server {\nlisten 80;\nroot /a;\n}\nserver {\nlisten 80;\nroot /b;\n}\n";
        let error = parse_config(text).unwrap_err().to_string();
        assert!(error.contains("duplicate server"));
    }

    #[test_case("100", 100)]
    #[test_case("10k", 10 * 1024)]
    #[test_case("3M", 3 * 1024 * 1024)]
    #[test_case("1G", 1024 * 1024 * 1024)]
    fn parse_size_works(value: &str, expected: u64) {
        assert_eq!(parse_size(value).unwrap(), expected);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = load_config(&dir.path().join("missing.conf")).unwrap_err();
        assert!(error.to_string().contains("failed to read config file"));
    }
}
