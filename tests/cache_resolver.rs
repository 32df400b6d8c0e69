//! Media and grammar resolution against a mock cache service.

use esl_bridge::{resolve_media, CacheConfig, CacheKind, GrammarResource, ResourceResolver};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCRIPT: &str = "/usr/local/bin/cache_stream.sh";
const MP3: &str = "http://media.example.com/hello.mp3";
const ENCODED_MP3: &str = "http%3A%2F%2Fmedia.example.com%2Fhello.mp3";

async fn cache_reporting(kind: &str, url: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CacheType/"))
        .and(query_param("url", url))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "CacheType": kind })))
        .mount(&server)
        .await;
    server
}

fn resolver_for(server: &MockServer) -> ResourceResolver {
    ResourceResolver::new(Some(CacheConfig::new(format!("{}/", server.uri()), SCRIPT))).unwrap()
}

/// Base URL of a port nothing listens on.
async fn dead_cache_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener
        .local_addr()
        .unwrap()
        .port();
    drop(listener);
    format!("http://127.0.0.1:{}/", port)
}

#[tokio::test]
async fn mp3_is_streamed_from_cache_with_shout() {
    let server = cache_reporting("mp3", MP3).await;
    let host = server
        .uri()
        .trim_start_matches("http://")
        .to_string();

    let result = resolver_for(&server)
        .resolve_media(MP3)
        .await;
    assert_eq!(result.kind, CacheKind::Mp3);
    assert_eq!(result.original_url, MP3);
    assert_eq!(
        result.resolved,
        format!("shout://{}/Cache/?url={}", host, ENCODED_MP3)
    );
}

#[tokio::test]
async fn wav_is_streamed_through_shell_script() {
    let wav = "http://media.example.com/prompt.wav";
    let server = cache_reporting("wav", wav).await;

    let result = resolver_for(&server)
        .resolve_media(wav)
        .await;
    assert_eq!(result.kind, CacheKind::Wav);
    assert_eq!(
        result.resolved,
        format!(
            "shell_stream://{} {}/Cache/?url=http%3A%2F%2Fmedia.example.com%2Fprompt.wav",
            SCRIPT,
            server.uri()
        )
    );
}

#[tokio::test]
async fn url_with_spaces_is_used_as_given() {
    let spaced = "http://media.example.com/my song.mp3";
    let server = cache_reporting("mp3", spaced).await;

    let result = resolver_for(&server)
        .resolve_media(spaced)
        .await;
    assert_eq!(result.kind, CacheKind::Mp3);
    assert_eq!(result.original_url, spaced);
    assert!(result
        .resolved
        .ends_with("/Cache/?url=http%3A%2F%2Fmedia.example.com%2Fmy+song.mp3"));

    let cache = CacheConfig::new(dead_cache_url().await, SCRIPT);
    let fallback = resolve_media(spaced, Some(&cache)).await;
    assert_eq!(fallback.resolved, "shout://media.example.com/my song.mp3");
}

#[tokio::test]
async fn unsupported_kind_falls_back() {
    let server = cache_reporting("grxml", MP3).await;

    let result = resolver_for(&server)
        .resolve_media(MP3)
        .await;
    assert_eq!(result.kind, CacheKind::Unresolved);
    assert_eq!(result.resolved, "shout://media.example.com/hello.mp3");
}

#[tokio::test]
async fn cache_error_status_falls_back() {
    let server = MockServer::start().await;
    Mock::given(path("/CacheType/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let wav = "http://media.example.com/prompt.wav";
    let result = resolver_for(&server)
        .resolve_media(wav)
        .await;
    // Remote wav has no shout:// fallback.
    assert_eq!(result.resolved, wav);
    assert_eq!(result.kind, CacheKind::Unresolved);
}

#[tokio::test]
async fn unreachable_cache_falls_back_to_shout() {
    let cache = CacheConfig::new(dead_cache_url().await, SCRIPT);

    let result = resolve_media(MP3, Some(&cache)).await;
    assert_eq!(result.kind, CacheKind::Unresolved);
    assert_eq!(result.resolved, "shout://media.example.com/hello.mp3");
}

#[tokio::test]
async fn without_cache_media_is_unchanged() {
    let result = resolve_media(MP3, None).await;
    assert_eq!(result.resolved, MP3);
    assert_eq!(result.kind, CacheKind::Unresolved);

    let disabled = CacheConfig::new("", SCRIPT);
    let result = resolve_media("/usr/share/sounds/beep.wav", Some(&disabled)).await;
    assert_eq!(result.resolved, "/usr/share/sounds/beep.wav");
}

#[tokio::test]
async fn local_media_never_touches_cache() {
    let server = MockServer::start().await;
    Mock::given(path("/CacheType/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "CacheType": "wav" })))
        .expect(0)
        .mount(&server)
        .await;

    let result = resolver_for(&server)
        .resolve_media("tone_stream://%(100,100,350,440)")
        .await;
    assert_eq!(result.resolved, "tone_stream://%(100,100,350,440)");
}

#[tokio::test]
async fn raw_and_builtin_grammars_need_no_network() {
    let resolver = ResourceResolver::new(Some(CacheConfig::new(dead_cache_url().await, SCRIPT)))
        .unwrap();

    assert_eq!(
        resolver
            .resolve_grammar("raw:<grammar root=\"yes\"/>")
            .await,
        GrammarResource::Inline("<grammar root=\"yes\"/>".to_string())
    );
    assert_eq!(
        resolver
            .resolve_grammar("builtin:grammar/boolean")
            .await,
        GrammarResource::Passthrough
    );
    assert_eq!(
        resolver
            .resolve_grammar("/usr/share/grammars/yesno.gram")
            .await,
        GrammarResource::Passthrough
    );
}

#[tokio::test]
async fn grammar_is_fetched_from_cache() {
    let grammar_url = "http://grammars.example.com/yesno.grxml";
    let server = cache_reporting("grxml", grammar_url).await;
    Mock::given(method("GET"))
        .and(path("/Cache/"))
        .and(query_param("url", grammar_url))
        .respond_with(ResponseTemplate::new(200).set_body_string("<grammar/>"))
        .mount(&server)
        .await;

    let resource = resolver_for(&server)
        .resolve_grammar(grammar_url)
        .await;
    assert_eq!(
        resource,
        GrammarResource::Fetched {
            content: "<grammar/>".to_string(),
            kind: CacheKind::Grxml,
        }
    );
}

#[tokio::test]
async fn grammar_falls_back_to_origin() {
    let server = MockServer::start().await;
    let grammar_url = format!("{}/grammars/yesno.jsgf", server.uri());
    Mock::given(path("/CacheType/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "CacheType": "mp3" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grammars/yesno.jsgf"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#JSGF V1.0;"))
        .mount(&server)
        .await;

    let resource = resolver_for(&server)
        .resolve_grammar(&grammar_url)
        .await;
    assert_eq!(
        resource,
        GrammarResource::Fetched {
            content: "#JSGF V1.0;".to_string(),
            kind: CacheKind::Unresolved,
        }
    );
}

#[tokio::test]
async fn empty_origin_grammar_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(path("/empty.grxml"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let resolver = ResourceResolver::new(None).unwrap();
    let resource = resolver
        .resolve_grammar(&format!("{}/empty.grxml", server.uri()))
        .await;
    assert_eq!(resource, GrammarResource::Unavailable);

    let resource = resolver
        .resolve_grammar(&format!("{}/missing.grxml", server.uri()))
        .await;
    assert_eq!(resource, GrammarResource::Unavailable);
}
