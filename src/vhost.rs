//! Virtual-host table: location lookup and Host-header resolution.

use crate::config::{LocationConfig, VirtualHostConfig};

/// Location paths of one virtual host, longest first.
#[derive(Debug)]
pub struct LocationTable {
    /// `(path, index into VirtualHostConfig::locations)`. Sorted by descending path length; the
    /// sort is stable so equal paths keep declaration order.
    entries: Vec<(String, usize)>,
}

impl LocationTable {
    pub fn new(locations: &[LocationConfig]) -> Self {
        let mut entries: Vec<_> = locations
            .iter()
            .enumerate()
            .map(|(index, location)| (location.path.clone(), index))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    /// Index of the longest location whose path is `uri` or one of its ancestors.
    pub fn best_match(&self, uri: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(path, _)| is_ancestor(path, uri))
            .map(|&(_, index)| index)
    }
}

/// True if `path` equals `uri` or names a directory containing it.
fn is_ancestor(path: &str, uri: &str) -> bool {
    if path == "/" {
        return true;
    }
    match uri.strip_prefix(path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A configured virtual host with its precomputed location table.
#[derive(Debug)]
pub struct VirtualHost {
    pub config: VirtualHostConfig,
    locations: LocationTable,
}

impl VirtualHost {
    pub fn new(config: VirtualHostConfig) -> Self {
        let locations = LocationTable::new(&config.locations);
        Self { config, locations }
    }

    pub fn location(&self, uri: &str) -> Option<(usize, &LocationConfig)> {
        self.locations
            .best_match(uri)
            .map(|index| (index, &self.config.locations[index]))
    }
}

/// Pick the virtual host among `candidates` whose server_name matches the Host header, falling
/// back to the first candidate.
pub fn resolve_host(hosts: &[VirtualHost], candidates: &[usize], host_header: Option<&str>) -> usize {
    let default = candidates.first().copied().unwrap_or(0);
    let name = match host_header {
        Some(value) => strip_port(value.trim()),
        None => return default,
    };
    candidates
        .iter()
        .copied()
        .find(|&index| {
            let server_name = &hosts[index].config.server_name;
            !server_name.is_empty() && server_name.eq_ignore_ascii_case(name)
        })
        .unwrap_or(default)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn locations(paths: &[&str]) -> Vec<LocationConfig> {
        paths
            .iter()
            .map(|path| LocationConfig {
                path: path.to_string(),
                ..LocationConfig::default()
            })
            .collect()
    }

    #[test_case("/", Some(0) ; "root only")]
    #[test_case("/index.html", Some(0) ; "file under root")]
    #[test_case("/images", Some(1) ; "exact")]
    #[test_case("/images/cat.png", Some(1) ; "child")]
    #[test_case("/imagesx/cat.png", Some(0) ; "not a component prefix")]
    #[test_case("/images/thumbs/a.png", Some(2) ; "longest wins")]
    fn best_match_works(uri: &str, expected: Option<usize>) {
        let table = LocationTable::new(&locations(&["/", "/images", "/images/thumbs"]));
        assert_eq!(table.best_match(uri), expected);
    }

    #[test]
    fn best_match_without_root_location() {
        let table = LocationTable::new(&locations(&["/cgi-bin"]));
        assert_eq!(table.best_match("/index.html"), None);
        assert_eq!(table.best_match("/cgi-bin/a.py"), Some(0));
    }

    #[test]
    fn first_declared_wins_on_ties() {
        let table = LocationTable::new(&locations(&["/a", "/", "/a"]));
        assert_eq!(table.best_match("/a/b"), Some(0));
    }

    fn hosts(names: &[&str]) -> Vec<VirtualHost> {
        names
            .iter()
            .map(|name| {
                VirtualHost::new(VirtualHostConfig {
                    server_name: name.to_string(),
                    root: "/srv".to_string(),
                    ..VirtualHostConfig::default()
                })
            })
            .collect()
    }

    #[test_case(Some("two.test"), 1 ; "exact name")]
    #[test_case(Some("TWO.test:8080"), 1 ; "case and port ignored")]
    #[test_case(Some("three.test"), 0 ; "unknown name falls back")]
    #[test_case(None, 0 ; "missing header falls back")]
    fn resolve_host_works(header: Option<&str>, expected: usize) {
        let hosts = hosts(&["one.test", "two.test"]);
        assert_eq!(resolve_host(&hosts, &[0, 1], header), expected);
    }

    #[test]
    fn resolve_host_only_considers_candidates() {
        let hosts = hosts(&["one.test", "two.test", "three.test"]);
        assert_eq!(resolve_host(&hosts, &[2, 0], Some("two.test")), 2);
    }

    #[test_case("example.com", "example.com")]
    #[test_case("example.com:80", "example.com")]
    #[test_case("[::1]:8080", "[::1]")]
    fn strip_port_works(host: &str, expected: &str) {
        assert_eq!(strip_port(host), expected);
    }
}
