//! Tenants and storage keys.
//!
//! A [`StorageKey`] is `<host>[/<path_prefix>]<url_path>` with the query
//! string removed. Each tenant owns the key subtree rooted at its
//! [`Tenant::key_prefix`], which is what invalidation deletes.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Segments starting with this are kept for the store's own file names.
pub const RESERVED_SEGMENT_PREFIX: &str = ".sitecache-";

/// One site served through the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub path_prefix: String,
}

impl Tenant {
    /// Normalizes the host to lowercase and strips slashes around the prefix.
    pub fn new(id: impl Into<String>, host: &str, path_prefix: &str) -> Self {
        Self {
            id: id.into(),
            host: host.trim().trim_end_matches('/').to_ascii_lowercase(),
            path_prefix: path_prefix.trim().trim_matches('/').to_string(),
        }
    }

    /// Builds a tenant from a site URL such as `https://example.com/blog/`.
    pub fn from_url(id: impl Into<String>, url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Some(Self::new(id, &host, url.path()))
    }

    /// Root of this tenant's key subtree.
    pub fn key_prefix(&self) -> StorageKey {
        if self.path_prefix.is_empty() {
            StorageKey(self.host.clone())
        } else {
            StorageKey(format!("{}/{}", self.host, self.path_prefix))
        }
    }

    /// Returns the request path relative to this tenant when it serves
    /// `host` + `path`.
    pub fn relative_path<'a>(&self, host: &str, path: &'a str) -> Option<&'a str> {
        if !host_matches(&self.host, host) {
            return None;
        }
        if self.path_prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix('/')?.strip_prefix(self.path_prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

fn host_matches(tenant_host: &str, request_host: &str) -> bool {
    if tenant_host.eq_ignore_ascii_case(request_host) {
        return true;
    }
    // A tenant configured without a port serves the host on any port.
    match request_host.rsplit_once(':') {
        Some((bare, port)) if !tenant_host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            tenant_host.eq_ignore_ascii_case(bare)
        }
        _ => false,
    }
}

/// Location of one page entry, or of a subtree of entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty path segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// True when every segment maps to a plain directory name that cannot
    /// collide with an entry or temp file.
    pub fn is_safe(&self) -> bool {
        let mut any = false;
        for segment in self.segments() {
            any = true;
            if segment == "."
                || segment == ".."
                || segment.starts_with(RESERVED_SEGMENT_PREFIX)
                || segment.contains(['\\', '\0'])
            {
                return false;
            }
        }
        any
    }

    /// True when `self` lies inside the subtree rooted at `prefix`.
    pub fn is_within(&self, prefix: &StorageKey) -> bool {
        let mut own = self.segments();
        prefix
            .segments()
            .all(|expected| own.next().is_some_and(|segment| segment == expected))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps a tenant-relative request path to its storage key. The query string
/// never participates.
pub fn resolve(tenant: &Tenant, request_path: &str) -> StorageKey {
    let path = request_path
        .split_once(['?', '#'])
        .map_or(request_path, |(path, _)| path);
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    StorageKey(format!("{}{}", tenant.key_prefix().0, path))
}

/// All tenants this process serves.
#[derive(Debug, Clone, Default)]
pub struct TenantSet {
    tenants: Vec<Tenant>,
    network: bool,
}

impl TenantSet {
    pub fn single(tenant: Tenant) -> Self {
        Self {
            tenants: vec![tenant],
            network: false,
        }
    }

    /// A network install. The first tenant is the primary site.
    pub fn network(tenants: Vec<Tenant>) -> Self {
        Self {
            tenants,
            network: true,
        }
    }

    pub fn is_network(&self) -> bool {
        self.network
    }

    pub fn primary(&self) -> Option<&Tenant> {
        self.tenants.first()
    }

    pub fn get(&self, id: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|tenant| tenant.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.iter()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Picks the tenant with the longest matching path prefix and returns
    /// the tenant-relative path alongside it.
    pub fn match_request<'a>(&self, host: &str, path: &'a str) -> Option<(&Tenant, &'a str)> {
        self.tenants
            .iter()
            .filter_map(|tenant| {
                tenant
                    .relative_path(host, path)
                    .map(|relative| (tenant, relative))
            })
            .max_by_key(|(tenant, _)| tenant.path_prefix.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_query_and_prefixes_host() {
        let tenant = Tenant::new("main", "Example.com/", "");
        assert_eq!(resolve(&tenant, "/about/").as_str(), "example.com/about/");
        assert_eq!(
            resolve(&tenant, "/about/?utm=x&y=1").as_str(),
            "example.com/about/"
        );
        assert_eq!(resolve(&tenant, "").as_str(), "example.com/");
    }

    #[test]
    fn resolve_includes_tenant_prefix() {
        let tenant = Tenant::new("blog", "example.com", "/blog/");
        assert_eq!(resolve(&tenant, "/post/").as_str(), "example.com/blog/post/");
        assert!(resolve(&tenant, "/post/").is_within(&tenant.key_prefix()));
    }

    #[test]
    fn distinct_tenants_have_disjoint_prefixes() {
        let a = Tenant::new("a", "a.example.com", "");
        let b = Tenant::new("b", "b.example.com", "");
        assert!(!resolve(&a, "/x/").is_within(&b.key_prefix()));
        assert!(!resolve(&b, "/x/").is_within(&a.key_prefix()));
    }

    #[test]
    fn prefix_match_respects_segment_boundaries() {
        let blog = Tenant::new("blog", "example.com", "blog");
        assert_eq!(blog.relative_path("example.com", "/blog"), Some("/"));
        assert_eq!(blog.relative_path("example.com", "/blog/a/"), Some("/a/"));
        assert_eq!(blog.relative_path("example.com", "/blogroll/"), None);
        assert_eq!(blog.relative_path("other.com", "/blog/"), None);
    }

    #[test]
    fn host_without_port_matches_any_port() {
        let tenant = Tenant::new("main", "example.com", "");
        assert!(tenant.relative_path("example.com:8080", "/").is_some());
        let pinned = Tenant::new("dev", "localhost:3000", "");
        assert!(pinned.relative_path("localhost:4000", "/").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let set = TenantSet::network(vec![
            Tenant::new("root", "example.com", ""),
            Tenant::new("blog", "example.com", "blog"),
        ]);
        let (tenant, relative) = set.match_request("example.com", "/blog/hello/").expect("tenant");
        assert_eq!(tenant.id, "blog");
        assert_eq!(relative, "/hello/");

        let (tenant, _) = set.match_request("example.com", "/shop/").expect("tenant");
        assert_eq!(tenant.id, "root");
    }

    #[test]
    fn traversal_segments_are_unsafe() {
        assert!(StorageKey::new("example.com/a/b/").is_safe());
        assert!(!StorageKey::new("example.com/../etc/").is_safe());
        assert!(!StorageKey::new("example.com/./a").is_safe());
        assert!(!StorageKey::new("").is_safe());
    }

    #[test]
    fn reserved_segments_are_unsafe() {
        assert!(!StorageKey::new("example.com/.sitecache-page/").is_safe());
        assert!(!StorageKey::new("example.com/a/.sitecache-tmp-1/").is_safe());
        assert!(StorageKey::new("example.com/index.html/").is_safe());
        assert!(StorageKey::new("example.com/.well-known/").is_safe());
    }

    #[test]
    fn tenant_from_url_keeps_port_and_path() {
        let url = Url::parse("http://localhost:3000/site/").expect("url");
        let tenant = Tenant::from_url("dev", &url).expect("tenant");
        assert_eq!(tenant.key_prefix().as_str(), "localhost:3000/site");
    }
}
