mod common;

use common::{init_tracing, section};
use elog_relay::sources::ElogSource;
use elog_relay::types::{Credentials, FetchConfig, Section};
use futures::{StreamExt, TryStreamExt};
use interfaces::{Entry, EntrySource, SourceError};
use url::Url;
use wiremock::matchers::{header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LISTING: &str = r#"<table class="listframe">
<tr><td><a href="7">7</a></td></tr>
<tr><td><a href="5">5</a></td></tr>
<tr><td><a href="3">3</a></td></tr>
</table>"#;

const ENTRY_5: &str = "$@MID@$: 5\n\
Author: John\n\
Subject: Pump check\n\
Attachment: 231002_101010_pump.png\n\
Encoding: plain\n\
========================================\n\
Seal replaced.\n";

const ENTRY_7: &str = "$@MID@$: 7\n\
In reply to: 5\n\
Author: Jane\n\
Subject: Re: Pump check\n\
Encoding: HTML\n\
========================================\n\
<p>Looks good, see <img src=\"231002/101011_plot.png\"></p>\n";

fn fetch_config() -> FetchConfig {
    FetchConfig {
        timeout_seconds: 5,
        max_retries: 1,
        retry_delay_ms: 1,
        min_request_interval_ms: 0,
        ..FetchConfig::default()
    }
}

fn source(server: &MockServer, configure: impl FnOnce(&mut Section)) -> anyhow::Result<ElogSource> {
    let mut book = section("book");
    book.source_url = Url::parse(&format!("{}/book/", server.uri()))?;
    configure(&mut book);
    Ok(ElogSource::new(&book, fetch_config())?)
}

async fn mount_logbook(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/book/"))
        .and(query_param("mode", "summary"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
        .mount(server)
        .await;
    for (id, text) in [("5", ENTRY_5), ("7", ENTRY_7)] {
        Mock::given(method("GET"))
            .and(path(format!("/book/{id}")))
            .and(query_param("cmd", "download"))
            .respond_with(ResponseTemplate::new(200).set_body_string(text))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_entries_after_marker_come_oldest_first() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_logbook(&server).await;
    Mock::given(method("GET"))
        .and(path("/book/3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let source = source(&server, |_| {})?;

    let entries: Vec<Entry> = source.fetch_since(Some(3)).await?.try_collect().await?;

    assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 7]);
    let base = format!("{}/book/", server.uri());

    let pump = &entries[0];
    assert_eq!(pump.parent_id, None);
    assert_eq!(pump.attributes.get("Subject"), Some("Pump check"));
    assert_eq!(pump.body, "Seal replaced.");
    assert_eq!(pump.source_url, format!("{base}5"));
    assert_eq!(pump.attachments.len(), 1);
    assert_eq!(pump.attachments[0].name, "pump.png");
    assert_eq!(pump.attachments[0].blob_ref, format!("{base}231002/101010_pump.png"));

    let reply = &entries[1];
    assert_eq!(reply.parent_id, Some(5));
    assert!(reply.body.contains("Looks good"));
    assert!(!reply.body.contains("<p>"));
    assert_eq!(reply.attachments[0].blob_ref, format!("{base}231002/101011_plot.png"));
    Ok(())
}

#[tokio::test]
async fn test_only_latest_reads_newest_entry() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_logbook(&server).await;
    let source = source(&server, |s| s.only_latest = true)?;

    let entries: Vec<Entry> = source.fetch_since(None).await?.try_collect().await?;
    assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![7]);

    // Nothing newer than the marker means nothing at all.
    let entries: Vec<Entry> = source.fetch_since(Some(7)).await?.try_collect().await?;
    assert!(entries.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_login_page_is_authentication_failure() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<form><input name="uname"><input type="password" name="upassword"></form>"#,
        ))
        .mount(&server)
        .await;
    let source = source(&server, |_| {})?;

    let result = source.fetch_since(None).await;
    assert!(matches!(result, Err(SourceError::AuthenticationFailed { .. })));
    Ok(())
}

#[tokio::test]
async fn test_credentials_are_sent_as_cookies() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book/"))
        .and(header_regex("cookie", r"^unm=user; upwd=[0-9a-f]{64}$"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<table></table>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/book/"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let anonymous = source(&server, |_| {})?;
    let result = anonymous.fetch_since(None).await;
    assert!(matches!(result, Err(SourceError::AuthenticationFailed { .. })));

    let logged_in = source(&server, |s| {
        s.credentials = Some(Credentials {
            user: "user".to_string(),
            password: "secret".to_string(),
        })
    })?;
    let entries: Vec<Entry> = logged_in.fetch_since(None).await?.try_collect().await?;
    assert!(entries.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_server_errors_are_retried_then_unreachable() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    let source = source(&server, |_| {})?;

    let result = source.fetch_since(None).await;
    assert!(matches!(result, Err(SourceError::SourceUnreachable(_))));
    Ok(())
}

#[tokio::test]
async fn test_broken_export_is_malformed_entry() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="4">4</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/book/4"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Subject: no separator\n"))
        .mount(&server)
        .await;
    let source = source(&server, |_| {})?;

    let results: Vec<Result<Entry, SourceError>> = source.fetch_since(None).await?.collect().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(SourceError::MalformedPage { entry: 4, .. })));
    Ok(())
}

#[tokio::test]
async fn test_attachment_is_downloaded_from_resolved_url() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_logbook(&server).await;
    Mock::given(method("GET"))
        .and(path("/book/231002/101010_pump.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
        .mount(&server)
        .await;
    let source = source(&server, |_| {})?;

    let entries: Vec<Entry> = source.fetch_since(Some(3)).await?.try_collect().await?;
    let data = source.download_attachment(&entries[0].attachments[0]).await?;
    assert_eq!(data, vec![0x89, b'P', b'N', b'G']);

    let missing = source.download_attachment(&entries[1].attachments[0]).await;
    assert!(matches!(missing, Err(SourceError::SourceUnreachable(_))));
    Ok(())
}
