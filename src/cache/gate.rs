//! Request gate: decides whether a request may be served from, or stored
//! into, the page cache.
//!
//! Rules run in a fixed order and the first that fires wins. Anything the
//! gate is unsure about is treated as not cacheable.

use axum::http::{HeaderMap, Method, Request, header};

use super::config::ActiveConfig;
use super::exceptions::RuleInput;

const RESERVED_PATHS: [&str; 2] = ["robots.txt", ".htaccess"];
const DISALLOWED_EXTENSIONS: [&str; 3] = ["php", "xml", "xsl"];
const INDEX_SCRIPT: &str = "index.php";
const BARE_AUTH_MARKERS: [&str; 4] = ["user_", "pass_", "sec_", "logged_in_"];
pub const DEFAULT_INTERACTION_COOKIE: &str = "sitecache_commented_posts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassReason {
    Method,
    ReservedPath,
    Extension,
    Authenticated,
    RecentInteraction,
    ExceptionRule,
}

impl BypassReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::ReservedPath => "reserved_path",
            Self::Extension => "extension",
            Self::Authenticated => "authenticated",
            Self::RecentInteraction => "interaction",
            Self::ExceptionRule => "exception",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Cacheable,
    NotCacheable(BypassReason),
}

impl Classification {
    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Cacheable)
    }
}

/// The view of an incoming request the gate works from.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: Option<String>,
    cookies: Vec<(String, String)>,
}

impl CacheRequest {
    /// `target` is the request target, path plus optional query.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        Self {
            method,
            scheme: "http".to_string(),
            host: String::new(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            cookies: Vec::new(),
        }
    }

    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();
        let target = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
        let headers = request.headers();

        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|authority| authority.as_str().to_string()))
            .unwrap_or_default();
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase())
            .or_else(|| uri.scheme_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string());

        let mut request_view = Self::new(request.method().clone(), &target)
            .with_host(&host)
            .with_scheme(&scheme);
        request_view.cookies = parse_cookies(headers);
        request_view
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.trim().to_ascii_lowercase();
        self
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Path portion, query removed.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Which cookies mark a visitor as logged in or as having just interacted
/// with a page.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    auth_patterns: Vec<String>,
    interaction_cookie: String,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self::new(None, DEFAULT_INTERACTION_COOKIE)
    }
}

impl CookiePolicy {
    /// With no marker, any cookie name containing `user_`, `pass_`, `sec_`
    /// or `logged_in_` counts as authentication. A marker such as
    /// `wordpress` narrows this to `wordpressuser_`, `wordpresspass_`,
    /// `wordpress_sec_` and `wordpress_logged_in_`.
    pub fn new(auth_marker: Option<&str>, interaction_cookie: &str) -> Self {
        let auth_patterns = match auth_marker.map(str::trim).filter(|m| !m.is_empty()) {
            None => BARE_AUTH_MARKERS.iter().map(|m| m.to_string()).collect(),
            Some(marker) => vec![
                format!("{marker}user_"),
                format!("{marker}pass_"),
                format!("{marker}_sec_"),
                format!("{marker}_logged_in_"),
            ],
        };
        Self {
            auth_patterns,
            interaction_cookie: interaction_cookie.trim().to_string(),
        }
    }

    pub fn interaction_cookie(&self) -> &str {
        &self.interaction_cookie
    }

    pub fn is_authenticated(&self, request: &CacheRequest) -> bool {
        request.cookies().any(|(name, _)| {
            self.auth_patterns
                .iter()
                .any(|pattern| name.contains(pattern.as_str()))
        })
    }

    /// Paths the visitor recently interacted with. The cookie holds a JSON
    /// array of paths, possibly percent-encoded; indexed cookies of the
    /// form `name[0]=/path/` are accepted as well.
    pub fn interaction_paths(&self, request: &CacheRequest) -> Vec<String> {
        if self.interaction_cookie.is_empty() {
            return Vec::new();
        }
        let mut paths = Vec::new();
        for (name, value) in request.cookies() {
            let decoded = urlencoding::decode(value)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| value.to_string());
            if name == self.interaction_cookie {
                match serde_json::from_str::<Vec<String>>(&decoded) {
                    Ok(list) => paths.extend(list),
                    Err(_) => paths.push(decoded),
                }
            } else if name
                .strip_prefix(self.interaction_cookie.as_str())
                .is_some_and(|rest| rest.starts_with('[') && rest.ends_with(']'))
            {
                paths.push(decoded);
            }
        }
        paths
    }

    pub fn recently_interacted(&self, request: &CacheRequest) -> bool {
        let path = request.path().trim_end_matches('/');
        self.interaction_paths(request)
            .iter()
            .any(|listed| listed.trim().trim_end_matches('/') == path)
    }
}

/// Classifies `request` against the given config snapshot.
pub fn classify(
    request: &CacheRequest,
    config: &ActiveConfig,
    cookies: &CookiePolicy,
) -> Classification {
    if request.method() != Method::GET {
        return Classification::NotCacheable(BypassReason::Method);
    }

    let target = request.target();
    if RESERVED_PATHS.iter().any(|reserved| target.contains(reserved)) {
        return Classification::NotCacheable(BypassReason::ReservedPath);
    }

    if has_disallowed_extension(request.path()) {
        return Classification::NotCacheable(BypassReason::Extension);
    }

    if cookies.is_authenticated(request) {
        return Classification::NotCacheable(BypassReason::Authenticated);
    }

    if cookies.recently_interacted(request) {
        return Classification::NotCacheable(BypassReason::RecentInteraction);
    }

    let input = RuleInput {
        scheme: request.scheme(),
        host: request.host(),
        path: request.path(),
    };
    if config.rules().first_match(&input).is_some() {
        return Classification::NotCacheable(BypassReason::ExceptionRule);
    }

    Classification::Cacheable
}

fn has_disallowed_extension(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    if lowered.ends_with(INDEX_SCRIPT) {
        return false;
    }
    lowered
        .rsplit_once('.')
        .is_some_and(|(_, extension)| DISALLOWED_EXTENSIONS.contains(&extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;

    fn active(config: CacheConfig) -> ActiveConfig {
        ActiveConfig::new(config)
    }

    fn get(target: &str) -> CacheRequest {
        CacheRequest::new(Method::GET, target).with_host("example.com")
    }

    fn classify_default(request: &CacheRequest) -> Classification {
        classify(request, &active(CacheConfig::default()), &CookiePolicy::default())
    }

    #[test]
    fn plain_get_is_cacheable() {
        assert_eq!(classify_default(&get("/about/")), Classification::Cacheable);
        assert_eq!(classify_default(&get("/about/?page=2")), Classification::Cacheable);
    }

    #[test]
    fn non_get_methods_bypass() {
        for method in [Method::POST, Method::HEAD, Method::PUT, Method::DELETE] {
            let request = CacheRequest::new(method, "/about/");
            assert_eq!(
                classify_default(&request),
                Classification::NotCacheable(BypassReason::Method)
            );
        }
    }

    #[test]
    fn reserved_paths_bypass() {
        assert_eq!(
            classify_default(&get("/robots.txt")),
            Classification::NotCacheable(BypassReason::ReservedPath)
        );
        assert_eq!(
            classify_default(&get("/dir/.htaccess")),
            Classification::NotCacheable(BypassReason::ReservedPath)
        );
    }

    #[test]
    fn script_and_feed_extensions_bypass_except_index_php() {
        for target in ["/wp-login.php", "/sitemap.xml?x=1", "/style.XSL"] {
            assert_eq!(
                classify_default(&get(target)),
                Classification::NotCacheable(BypassReason::Extension),
                "{target}"
            );
        }
        assert_eq!(classify_default(&get("/index.php")), Classification::Cacheable);
        assert_eq!(classify_default(&get("/blog/INDEX.PHP")), Classification::Cacheable);
    }

    #[test]
    fn any_auth_marker_cookie_bypasses() {
        for name in ["wordpress_logged_in_abc", "site_user_1", "xpass_y", "wordpress_sec_1"] {
            let request = get("/").with_cookie(name, "v");
            assert_eq!(
                classify_default(&request),
                Classification::NotCacheable(BypassReason::Authenticated),
                "{name}"
            );
        }
        let anonymous = get("/").with_cookie("theme", "dark");
        assert_eq!(classify_default(&anonymous), Classification::Cacheable);
    }

    #[test]
    fn marker_narrows_auth_cookie_names() {
        let policy = CookiePolicy::new(Some("wordpress"), DEFAULT_INTERACTION_COOKIE);
        let config = active(CacheConfig::default());
        let logged_in = get("/").with_cookie("wordpress_logged_in_123", "x");
        let unrelated = get("/").with_cookie("shop_user_id", "x");
        assert!(!classify(&logged_in, &config, &policy).is_cacheable());
        assert!(classify(&unrelated, &config, &policy).is_cacheable());
    }

    #[test]
    fn interaction_cookie_bypasses_listed_path_only() {
        let encoded = urlencoding::encode(r#"["/post-1/","/post-2"]"#).into_owned();
        let on_listed = get("/post-2/").with_cookie(DEFAULT_INTERACTION_COOKIE, &encoded);
        let elsewhere = get("/post-3/").with_cookie(DEFAULT_INTERACTION_COOKIE, &encoded);
        assert_eq!(
            classify_default(&on_listed),
            Classification::NotCacheable(BypassReason::RecentInteraction)
        );
        assert_eq!(classify_default(&elsewhere), Classification::Cacheable);

        let indexed = get("/post-1").with_cookie("sitecache_commented_posts[0]", "/post-1/");
        assert!(!classify_default(&indexed).is_cacheable());
    }

    #[test]
    fn exception_rules_apply_in_advanced_mode() {
        let config = active(CacheConfig {
            advanced_mode: true,
            cache_exception_urls: vec!["/no-cache/*".to_string()],
            ..CacheConfig::default()
        });
        let policy = CookiePolicy::default();
        assert_eq!(
            classify(&get("/no-cache/foo"), &config, &policy),
            Classification::NotCacheable(BypassReason::ExceptionRule)
        );
        assert!(classify(&get("/cache-me/"), &config, &policy).is_cacheable());
    }

    #[test]
    fn from_request_reads_host_scheme_and_cookies() {
        let request = Request::builder()
            .uri("/shop/?a=1")
            .header(header::HOST, "Example.com")
            .header("x-forwarded-proto", "https")
            .header(header::COOKIE, "a=1; wordpress_logged_in_x=2")
            .body(())
            .expect("request");
        let view = CacheRequest::from_request(&request);
        assert_eq!(view.host(), "example.com");
        assert_eq!(view.scheme(), "https");
        assert_eq!(view.path(), "/shop/");
        assert_eq!(view.query(), Some("a=1"));
        assert_eq!(view.cookies().count(), 2);
    }
}
