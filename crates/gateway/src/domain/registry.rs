//! Endpoint registry populated by the host at connect time.
//!
//! Only registered endpoints are routable; requests for anything else fail
//! with "not found". The host re-registers everything on reconnect, so the
//! registry is flushed whenever the link drops.
//!
//! File-serving endpoints arrive with a trailing capture pattern
//! (`/printer/files/(.*)`), exactly as the host writes them. Those are
//! keyed by their base and matched by prefix, in a table separate from
//! exact paths, so a listing endpoint and a per-file endpoint can share
//! `/printer/files` without clobbering each other.

use dashmap::DashMap;
use std::path::PathBuf;

/// Trailing pattern marking a prefix-matched registration, as sent on the
/// wire by the host.
pub const PREFIX_PATTERN: &str = "/(.*)";

/// How the surface services an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Proxy the request to the host through the multiplexer
    Plain,
    /// Serve (GET) or delete (DELETE) files under the registered root
    FileRequest,
    /// Accept a multipart upload into the registered root
    FileUpload,
}

impl HandlerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file_request" => Some(HandlerKind::FileRequest),
            "file_upload" => Some(HandlerKind::FileUpload),
            _ => None,
        }
    }
}

/// Query-string parser selected at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgParser {
    /// One value per key
    #[default]
    Default,
    /// Comma-separated lists, bare keys allowed
    Status,
}

/// One routable endpoint.
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    /// Path (or path pattern) exactly as registered
    pub endpoint: String,
    /// Allowed HTTP verbs, uppercase
    pub http_methods: Vec<String>,
    /// Method name used on the host socket
    pub remote_method: String,
    /// Per-endpoint timeout supplied at registration, in seconds
    pub request_timeout: Option<f64>,
    pub handler: HandlerKind,
    /// Filesystem root (or direct file) for file handlers
    pub root: Option<PathBuf>,
    pub arg_parser: ArgParser,
    /// Registered by the gateway itself rather than the host; survives
    /// link teardown.
    pub local: bool,
}

impl EndpointEntry {
    pub fn allows(&self, verb: &str) -> bool {
        self.http_methods.iter().any(|m| m == verb)
    }
}

/// Path resolution result: the entry plus, for prefix-matched entries,
/// the remainder of the request path.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: EndpointEntry,
    pub subpath: Option<String>,
}

/// Base path of a prefix registration, if the endpoint carries the
/// trailing capture pattern.
fn prefix_base(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_suffix(PREFIX_PATTERN)
        .filter(|base| !base.is_empty())
}

/// Mutation-protected endpoint maps: exact paths and prefix bases.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    exact: DashMap<String, EndpointEntry>,
    prefix: DashMap<String, EndpointEntry>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an endpoint. A registration ending in the capture
    /// pattern lands in the prefix table under its base; anything else is
    /// an exact path. The two never overwrite each other.
    pub fn insert(&self, entry: EndpointEntry) {
        match prefix_base(&entry.endpoint) {
            Some(base) => {
                self.prefix.insert(base.to_string(), entry);
            }
            None => {
                self.exact.insert(entry.endpoint.clone(), entry);
            }
        }
    }

    /// Exact-path lookup.
    pub fn get(&self, path: &str) -> Option<EndpointEntry> {
        self.exact.get(path).map(|e| e.value().clone())
    }

    /// Resolve a request path: exact match first, then prefix entries with
    /// the remainder of the path split off.
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        if let Some(entry) = self.get(path) {
            return Some(Resolved {
                entry,
                subpath: None,
            });
        }
        for item in self.prefix.iter() {
            if let Some(rest) = path.strip_prefix(item.key().as_str()) {
                if let Some(sub) = rest.strip_prefix('/') {
                    if !sub.is_empty() {
                        return Some(Resolved {
                            entry: item.value().clone(),
                            subpath: Some(sub.to_string()),
                        });
                    }
                }
            }
        }
        None
    }

    /// Remove every host-registered endpoint, returning the removed
    /// endpoint strings as they were registered.
    pub fn clear_remote(&self) -> Vec<String> {
        let mut removed = Vec::new();
        let exact_keys: Vec<String> = self
            .exact
            .iter()
            .filter(|e| !e.local)
            .map(|e| e.key().clone())
            .collect();
        for key in exact_keys {
            if let Some((_, entry)) = self.exact.remove(&key) {
                removed.push(entry.endpoint);
            }
        }
        let prefix_keys: Vec<String> = self
            .prefix
            .iter()
            .filter(|e| !e.local)
            .map(|e| e.key().clone())
            .collect();
        for key in prefix_keys {
            if let Some((_, entry)) = self.prefix.remove(&key) {
                removed.push(entry.endpoint);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefix.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(path: &str, methods: &[&str]) -> EndpointEntry {
        EndpointEntry {
            endpoint: path.to_string(),
            http_methods: methods.iter().map(|m| m.to_string()).collect(),
            remote_method: format!("handle{}", path.replace('/', "_")),
            request_timeout: None,
            handler: HandlerKind::Plain,
            root: None,
            arg_parser: ArgParser::Default,
            local: false,
        }
    }

    fn file_request(pattern: &str, root: &str) -> EndpointEntry {
        EndpointEntry {
            endpoint: pattern.to_string(),
            http_methods: vec!["GET".into(), "DELETE".into()],
            remote_method: String::new(),
            request_timeout: None,
            handler: HandlerKind::FileRequest,
            root: Some(PathBuf::from(root)),
            arg_parser: ArgParser::Default,
            local: false,
        }
    }

    #[test]
    fn test_unknown_endpoint_unroutable() {
        let registry = EndpointRegistry::new();
        assert!(registry.resolve("/printer/gcode").is_none());
        registry.insert(plain("/printer/gcode", &["POST"]));
        let resolved = registry.resolve("/printer/gcode").unwrap();
        assert!(resolved.entry.allows("POST"));
        assert!(!resolved.entry.allows("GET"));
    }

    #[test]
    fn test_file_prefix_resolution() {
        let registry = EndpointRegistry::new();
        registry.insert(file_request("/printer/files/(.*)", "/tmp/sdcard"));

        let resolved = registry.resolve("/printer/files/test.gcode").unwrap();
        assert_eq!(resolved.subpath.as_deref(), Some("test.gcode"));
        // the bare base is not covered by a prefix registration
        assert!(registry.resolve("/printer/files").is_none());
        // exact paths never match by prefix
        registry.insert(plain("/printer/gcode", &["POST"]));
        assert!(registry.resolve("/printer/gcode/extra").is_none());
    }

    #[test]
    fn test_listing_and_file_handler_share_base() {
        let registry = EndpointRegistry::new();
        registry.insert(plain("/printer/files", &["GET"]));
        registry.insert(file_request("/printer/files/(.*)", "/tmp/sdcard"));

        // the listing stays an exact host-proxied endpoint
        let listing = registry.resolve("/printer/files").unwrap();
        assert_eq!(listing.entry.handler, HandlerKind::Plain);
        assert!(listing.subpath.is_none());

        // named files fall through to the prefix entry
        let file = registry.resolve("/printer/files/part.gcode").unwrap();
        assert_eq!(file.entry.handler, HandlerKind::FileRequest);
        assert_eq!(file.subpath.as_deref(), Some("part.gcode"));
    }

    #[test]
    fn test_clear_remote_keeps_local_entries() {
        let registry = EndpointRegistry::new();
        registry.insert(plain("/printer/gcode", &["POST"]));
        registry.insert(file_request("/printer/files/(.*)", "/tmp/sdcard"));
        let mut log_entry = plain("/server/moonraker.log", &["GET"]);
        log_entry.local = true;
        log_entry.handler = HandlerKind::FileRequest;
        registry.insert(log_entry);

        let mut removed = registry.clear_remote();
        removed.sort();
        assert_eq!(
            removed,
            vec![
                "/printer/files/(.*)".to_string(),
                "/printer/gcode".to_string(),
            ]
        );
        assert!(registry.get("/server/moonraker.log").is_some());
        assert!(registry.get("/printer/gcode").is_none());
        assert!(registry.resolve("/printer/files/part.gcode").is_none());
    }
}
