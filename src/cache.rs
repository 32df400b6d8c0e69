//! Resource cache resolver.
//!
//! Rewrites remote media and grammar URLs to cache-backed forms the switch
//! can stream. Every expected failure degrades to a best-effort answer; call
//! setup is never blocked on the cache.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::{
    constants::DEFAULT_CACHE_TIMEOUT_MS,
    error::{EslError, EslResult},
};

/// Stream prefixes the switch can play without a cache.
const VALID_SOUND_PROTOCOLS: &[&str] = &["tone_stream://", "shout://", "vlc://"];

/// Cache service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base URL of the cache service, e.g. `http://127.0.0.1:8089/`. Empty disables caching.
    pub url: String,
    /// Local script the switch runs (`shell_stream://`) to stream cached wav files.
    pub script: String,
    /// HTTP timeout for cache lookups.
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            script: String::new(),
            timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    /// Config pointing at `url` with default script and timeout.
    pub fn new(url: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            script: script.into(),
            ..Self::default()
        }
    }

    fn is_enabled(&self) -> bool {
        !self
            .url
            .trim()
            .is_empty()
    }

    /// Base URL without surrounding slashes.
    fn base(&self) -> &str {
        self.url
            .trim()
            .trim_matches('/')
    }
}

/// Content kind reported by the cache service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Wav,
    Mp3,
    Grxml,
    Jsgf,
    /// Not resolved through the cache.
    Unresolved,
}

impl CacheKind {
    /// Parse a `CacheType` value. Unknown kinds map to `Unresolved`.
    pub fn from_cache_type(value: &str) -> Self {
        match value
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "wav" => CacheKind::Wav,
            "mp3" => CacheKind::Mp3,
            "grxml" => CacheKind::Grxml,
            "jsgf" => CacheKind::Jsgf,
            _ => CacheKind::Unresolved,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Wav => "wav",
            CacheKind::Mp3 => "mp3",
            CacheKind::Grxml => "grxml",
            CacheKind::Jsgf => "jsgf",
            CacheKind::Unresolved => "unresolved",
        }
    }

    fn is_grammar(&self) -> bool {
        matches!(self, CacheKind::Grxml | CacheKind::Jsgf)
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ResourceResolver::resolve_media`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookupResult {
    /// URL as given by the caller.
    pub original_url: String,
    /// Kind reported by the cache, or `Unresolved` when the cache was not used.
    pub kind: CacheKind,
    /// What to hand to the switch.
    pub resolved: String,
}

impl CacheLookupResult {
    fn unresolved(original_url: &str, resolved: String) -> Self {
        Self {
            original_url: original_url.to_string(),
            kind: CacheKind::Unresolved,
            resolved,
        }
    }
}

/// Outcome of [`ResourceResolver::resolve_grammar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarResource {
    /// Grammar text given inline with `raw:`.
    Inline(String),
    /// Grammar text fetched over HTTP. `kind` is `Unresolved` when it came
    /// from the origin rather than the cache.
    Fetched { content: String, kind: CacheKind },
    /// Hand the reference to the switch untouched (`url:`, `builtin:`, local file).
    Passthrough,
    /// Neither the cache nor the origin produced a grammar.
    Unavailable,
}

#[derive(Debug, Deserialize)]
struct CacheTypeReply {
    #[serde(rename = "CacheType")]
    cache_type: String,
}

/// `true` for `http://` and `https://` URLs (scheme is case-insensitive).
pub fn is_remote_url(value: &str) -> bool {
    starts_with_ignore_case(value, "http://") || starts_with_ignore_case(value, "https://")
}

/// `true` for `sip:` URIs.
pub fn is_sip_url(value: &str) -> bool {
    value.starts_with("sip:")
}

/// `true` when the switch can stream `value` directly.
pub fn is_valid_sound_proto(value: &str) -> bool {
    VALID_SOUND_PROTOCOLS
        .iter()
        .any(|proto| value.starts_with(proto))
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn strip_scheme(url: &str) -> &str {
    ["http://", "https://"]
        .iter()
        .find(|scheme| starts_with_ignore_case(url, scheme))
        .map_or(url, |scheme| &url[scheme.len()..])
}

/// Cache-free rewrite: remote media that is not `.wav` is streamed with `shout://`.
fn fallback_media(url: &str) -> String {
    if is_remote_url(url) && !url.ends_with(".wav") {
        format!("shout://{}", strip_scheme(url))
    } else {
        url.to_string()
    }
}

fn url_query(url: &str) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("url", url)
        .finish()
}

/// Resolves media and grammar URLs through an optional cache service.
///
/// Holds one HTTP client; lookups share no mutable state and may run concurrently.
#[derive(Debug, Clone)]
pub struct ResourceResolver {
    client: Client,
    cache: Option<CacheConfig>,
}

impl ResourceResolver {
    /// Build a resolver. `None` (or an empty cache URL) disables cache lookups.
    pub fn new(cache: Option<CacheConfig>) -> EslResult<Self> {
        let cache = cache.filter(CacheConfig::is_enabled);
        let timeout_ms = cache
            .as_ref()
            .map_or(DEFAULT_CACHE_TIMEOUT_MS, |c| c.timeout_ms);
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(EslError::cache_unavailable)?;
        Ok(Self { client, cache })
    }

    /// Cache descriptor in use, if any.
    pub fn cache(&self) -> Option<&CacheConfig> {
        self.cache
            .as_ref()
    }

    /// Resolve a media URL to something the switch can play.
    ///
    /// Without a cache, and for anything but `http(s)://` URLs, the input
    /// comes back unchanged. Remote URLs are looked up in the cache: `wav`
    /// becomes a `shell_stream://` through the cache script, `mp3` a
    /// `shout://` stream from the cache. Any failure falls back to streaming
    /// the origin directly.
    pub async fn resolve_media(&self, url: &str) -> CacheLookupResult {
        let Some(cache) = &self.cache else {
            return CacheLookupResult::unresolved(url, url.to_string());
        };
        if !is_remote_url(url) {
            return CacheLookupResult::unresolved(url, url.to_string());
        }

        match self
            .lookup_kind(cache, url)
            .await
        {
            Ok(kind @ CacheKind::Wav) => {
                let resolved = format!(
                    "shell_stream://{} {}/Cache/?{}",
                    cache.script,
                    cache.base(),
                    url_query(url)
                );
                debug!("[CACHE] {} -> {}", url, resolved);
                CacheLookupResult {
                    original_url: url.to_string(),
                    kind,
                    resolved,
                }
            }
            Ok(kind @ CacheKind::Mp3) => {
                let resolved = format!(
                    "shout://{}/Cache/?{}",
                    strip_scheme(cache.base()).trim_matches('/'),
                    url_query(url)
                );
                debug!("[CACHE] {} -> {}", url, resolved);
                CacheLookupResult {
                    original_url: url.to_string(),
                    kind,
                    resolved,
                }
            }
            Ok(other) => {
                warn!("[CACHE] Unsupported media format {} for {}", other, url);
                CacheLookupResult::unresolved(url, fallback_media(url))
            }
            Err(e) => {
                warn!("[CACHE] Lookup for {} failed: {}", url, e);
                CacheLookupResult::unresolved(url, fallback_media(url))
            }
        }
    }

    /// Resolve a grammar reference.
    ///
    /// `raw:` yields the inline body with no network access. `url:`,
    /// `builtin:` and local paths pass through. Remote URLs are fetched
    /// from the cache when it reports `grxml` or `jsgf`, otherwise from the
    /// origin. An empty or failed origin fetch is `Unavailable`.
    pub async fn resolve_grammar(&self, grammar: &str) -> GrammarResource {
        if let Some(body) = grammar.strip_prefix("raw:") {
            debug!("[CACHE] Using raw grammar");
            return GrammarResource::Inline(body.to_string());
        }
        if grammar.starts_with("url:") || grammar.starts_with("builtin:") {
            debug!("[CACHE] Grammar {} handled by the switch", grammar);
            return GrammarResource::Passthrough;
        }
        if !is_remote_url(grammar) {
            debug!("[CACHE] Using local grammar file {}", grammar);
            return GrammarResource::Passthrough;
        }

        if let Some(cache) = &self.cache {
            match self
                .fetch_cached_grammar(cache, grammar)
                .await
            {
                Ok((content, kind)) => return GrammarResource::Fetched { content, kind },
                Err(e) => warn!("[CACHE] Grammar cache lookup for {} failed: {}", grammar, e),
            }
        }

        debug!("[CACHE] Fetching grammar from {}", grammar);
        match self
            .fetch_text(grammar)
            .await
        {
            Ok(content) if !content.is_empty() => GrammarResource::Fetched {
                content,
                kind: CacheKind::Unresolved,
            },
            Ok(_) => {
                warn!("[CACHE] Empty grammar response from {}", grammar);
                GrammarResource::Unavailable
            }
            Err(e) => {
                warn!("[CACHE] Grammar fetch from {} failed: {}", grammar, e);
                GrammarResource::Unavailable
            }
        }
    }

    async fn lookup_kind(&self, cache: &CacheConfig, url: &str) -> EslResult<CacheKind> {
        let lookup = format!("{}/CacheType/?{}", cache.base(), url_query(url));
        debug!("[CACHE] Lookup {}", lookup);
        let reply: CacheTypeReply = self
            .client
            .get(&lookup)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(EslError::cache_unavailable)?
            .json()
            .await
            .map_err(EslError::cache_unavailable)?;
        Ok(CacheKind::from_cache_type(&reply.cache_type))
    }

    async fn fetch_cached_grammar(
        &self,
        cache: &CacheConfig,
        grammar: &str,
    ) -> EslResult<(String, CacheKind)> {
        let kind = self
            .lookup_kind(cache, grammar)
            .await?;
        if !kind.is_grammar() {
            return Err(EslError::cache_unavailable(format!(
                "unsupported grammar format {}",
                kind
            )));
        }
        let cached = format!("{}/Cache/?{}", cache.base(), url_query(grammar));
        debug!("[CACHE] Fetch grammar from {}", cached);
        Ok((self.fetch_text(&cached).await?, kind))
    }

    async fn fetch_text(&self, url: &str) -> EslResult<String> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(EslError::cache_unavailable)?
            .text()
            .await
            .map_err(EslError::cache_unavailable)
    }
}

/// One-shot [`ResourceResolver::resolve_media`].
pub async fn resolve_media(url: &str, cache: Option<&CacheConfig>) -> CacheLookupResult {
    match ResourceResolver::new(cache.cloned()) {
        Ok(resolver) => {
            resolver
                .resolve_media(url)
                .await
        }
        Err(e) => {
            warn!("[CACHE] {}", e);
            CacheLookupResult::unresolved(url, url.to_string())
        }
    }
}

/// One-shot [`ResourceResolver::resolve_grammar`].
pub async fn resolve_grammar(grammar: &str, cache: Option<&CacheConfig>) -> GrammarResource {
    match ResourceResolver::new(cache.cloned()) {
        Ok(resolver) => {
            resolver
                .resolve_grammar(grammar)
                .await
        }
        Err(e) => {
            warn!("[CACHE] {}", e);
            GrammarResource::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_helpers() {
        assert!(is_remote_url("http://host/a.mp3"));
        assert!(is_remote_url("HTTPS://host/a.mp3"));
        assert!(!is_remote_url("/usr/share/sounds/a.wav"));
        assert!(!is_remote_url("http"));

        assert!(is_sip_url("sip:alice@example.com"));
        assert!(!is_sip_url("sips:alice@example.com"));

        assert!(is_valid_sound_proto("tone_stream://%(100,100,350,440)"));
        assert!(is_valid_sound_proto("shout://host/a.mp3"));
        assert!(!is_valid_sound_proto("http://host/a.mp3"));
    }

    #[test]
    fn test_fallback_media() {
        assert_eq!(fallback_media("http://host/a.mp3"), "shout://host/a.mp3");
        assert_eq!(fallback_media("https://host/a.mp3"), "shout://host/a.mp3");
        assert_eq!(fallback_media("http://host/a.wav"), "http://host/a.wav");
        assert_eq!(fallback_media("/local/a.mp3"), "/local/a.mp3");
    }

    #[test]
    fn test_cache_kind_parse() {
        assert_eq!(CacheKind::from_cache_type("mp3"), CacheKind::Mp3);
        assert_eq!(CacheKind::from_cache_type("GRXML"), CacheKind::Grxml);
        assert_eq!(CacheKind::from_cache_type("ogg"), CacheKind::Unresolved);
        assert!(CacheKind::Jsgf.is_grammar());
        assert!(!CacheKind::Wav.is_grammar());
    }

    #[test]
    fn test_query_is_form_encoded() {
        assert_eq!(
            url_query("http://host/a b.mp3?x=1"),
            "url=http%3A%2F%2Fhost%2Fa+b.mp3%3Fx%3D1"
        );
    }

    #[test]
    fn test_empty_cache_url_disables_cache() {
        let resolver = ResourceResolver::new(Some(CacheConfig::default())).unwrap();
        assert!(resolver
            .cache()
            .is_none());
    }

    #[tokio::test]
    async fn test_media_without_cache() {
        let resolver = ResourceResolver::new(None).unwrap();
        let result = resolver
            .resolve_media("http://host/hello.mp3")
            .await;
        assert_eq!(result.kind, CacheKind::Unresolved);
        assert_eq!(result.resolved, "http://host/hello.mp3");

        let local = resolver
            .resolve_media("/var/sounds/hello.wav")
            .await;
        assert_eq!(local.resolved, "/var/sounds/hello.wav");
    }

    #[tokio::test]
    async fn test_grammar_prefixes_skip_network() {
        let resolver = ResourceResolver::new(Some(CacheConfig::new("http://127.0.0.1:9", "")))
            .unwrap();
        assert_eq!(
            resolver
                .resolve_grammar("raw:#JSGF V1.0; grammar yesno;")
                .await,
            GrammarResource::Inline("#JSGF V1.0; grammar yesno;".into())
        );
        assert_eq!(
            resolver
                .resolve_grammar("builtin:grammar/boolean")
                .await,
            GrammarResource::Passthrough
        );
        assert_eq!(
            resolver
                .resolve_grammar("url:http://host/g.grxml")
                .await,
            GrammarResource::Passthrough
        );
        assert_eq!(
            resolver
                .resolve_grammar("/etc/grammars/yesno.grxml")
                .await,
            GrammarResource::Passthrough
        );
    }
}
