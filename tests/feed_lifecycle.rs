//! Integration tests for the feed lifecycle: subscribe, poll, deliver, persist.
//!
//! Each test creates its own in-memory SQLite database and a wiremock server
//! standing in for the feed host. Runs go through the real HTTP transport.

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dailyfeed::config::Config;
use dailyfeed::feed::{FeedState, HttpTransport};
use dailyfeed::notify::{DeliveryError, Messenger};
use dailyfeed::scheduler::Dispatcher;
use dailyfeed::storage::Database;
use dailyfeed::subscriber::{ChatId, Mode, Subscriber};

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<(ChatId, String)>>,
}

impl Inbox {
    fn to(&self, chat_id: ChatId) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Messenger for Inbox {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
        self.messages.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

struct Setup {
    server: MockServer,
    db: Database,
    inbox: Arc<Inbox>,
    dispatcher: Dispatcher,
}

async fn setup() -> Setup {
    let server = MockServer::start().await;
    let db = Database::open(":memory:").await.unwrap();
    let inbox = Arc::new(Inbox::default());

    let mut config = Config::default();
    config.templates.asap = "{entry.title}".into();
    config.templates.digest_entry = "- {entry.title}".into();
    config.templates.digest_header = "{feed.title} <{feed.link}>".into();
    config.operators = vec![1000];

    let transport = HttpTransport::new("dailyfeed-tests", Duration::from_secs(5)).unwrap();
    let dispatcher = Dispatcher::new(db.clone(), Arc::new(transport), inbox.clone(), Arc::new(config));
    Setup {
        server,
        db,
        inbox,
        dispatcher,
    }
}

/// RSS document whose items are dated `offset` seconds from now.
fn rss(title: &str, items: &[(&str, i64)]) -> String {
    let items: String = items
        .iter()
        .map(|(id, offset)| {
            let date = (Utc::now() + TimeDelta::seconds(*offset)).to_rfc2822();
            format!(
                "<item><guid>{id}</guid><title>{id}</title>\
                 <link>https://example.com/{id}</link><pubDate>{date}</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>{title}</title><link>https://example.com/</link>{items}</channel></rss>"#
    )
}

async fn subscribe(db: &Database, chat_id: ChatId, mode: Mode, url: &str) {
    let mut subscriber = db
        .load_subscriber(chat_id)
        .await
        .unwrap()
        .unwrap_or_else(|| Subscriber::new(chat_id));
    subscriber.add_feed(mode, url).unwrap();
    db.save_subscriber(&subscriber).await.unwrap();
}

async fn feed_state(db: &Database, chat_id: ChatId, mode: Mode, url: &str) -> FeedState {
    db.load_subscriber(chat_id)
        .await
        .unwrap()
        .unwrap()
        .collection(mode)
        .get(url)
        .unwrap()
        .state()
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_asap_delivers_new_entries_then_honors_not_modified() {
    let s = setup().await;
    let url = format!("{}/feed.xml", s.server.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss("Example", &[("second", 120), ("first", 60)]))
                .insert_header("ETag", "\"v1\""),
        )
        .up_to_n_times(1)
        .mount(&s.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Asap, &url).await;

    assert_eq!(s.dispatcher.run_update(1, Mode::Asap).await.unwrap(), Some(2));
    assert_eq!(s.inbox.to(1), vec!["first", "second"]);

    // Validators were persisted, so the second run is conditional
    assert_eq!(s.dispatcher.run_update(1, Mode::Asap).await.unwrap(), Some(0));
    assert_eq!(s.inbox.to(1).len(), 2);
    assert_eq!(feed_state(&s.db, 1, Mode::Asap, &url).await, FeedState::Active);
}

#[tokio::test]
async fn test_digest_groups_entries_under_feed_header() {
    let s = setup().await;
    let url = format!("{}/digest.xml", s.server.uri());

    Mock::given(method("GET"))
        .and(path("/digest.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss("Daily", &[("b", 30), ("a", 10), ("old", -3600)])),
        )
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Digest, &url).await;
    s.dispatcher.run_update(1, Mode::Digest).await.unwrap();

    assert_eq!(
        s.inbox.to(1),
        vec!["Daily <https://example.com/>\n- a\n- b"]
    );
}

// ============================================================================
// Upstream failures
// ============================================================================

#[tokio::test]
async fn test_permanent_redirect_moves_fetch_address_but_not_key() {
    let s = setup().await;
    let old = format!("{}/old.xml", s.server.uri());

    Mock::given(method("GET"))
        .and(path("/old.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new.xml"))
        .expect(1)
        .mount(&s.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("Moved", &[])))
        .expect(2)
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Asap, &old).await;
    s.dispatcher.run_update(1, Mode::Asap).await.unwrap();
    s.dispatcher.run_update(1, Mode::Asap).await.unwrap();

    let subscriber = s.db.load_subscriber(1).await.unwrap().unwrap();
    let feed = subscriber.collection(Mode::Asap).get(&old).unwrap();
    assert_eq!(feed.url(), format!("{}/new.xml", s.server.uri()));
    assert_eq!(subscriber.list_feeds(Mode::Asap)[0].title, "Moved");
}

#[tokio::test]
async fn test_gone_feed_is_never_fetched_again() {
    let s = setup().await;
    let url = format!("{}/gone.xml", s.server.uri());

    Mock::given(method("GET"))
        .and(path("/gone.xml"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Digest, &url).await;
    for _ in 0..3 {
        assert_eq!(s.dispatcher.run_update(1, Mode::Digest).await.unwrap(), Some(0));
    }

    assert_eq!(feed_state(&s.db, 1, Mode::Digest, &url).await, FeedState::Gone);
    let subscriber = s.db.load_subscriber(1).await.unwrap().unwrap();
    assert_eq!(
        subscriber.list_feeds(Mode::Digest)[0].title,
        format!("Feed not found - {url}")
    );
    assert!(s.inbox.to(1).is_empty());
}

#[tokio::test]
async fn test_server_error_pauses_feed_and_reports_once() {
    let s = setup().await;
    let url = format!("{}/broken.xml", s.server.uri());

    Mock::given(method("GET"))
        .and(path("/broken.xml"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Asap, &url).await;
    s.dispatcher.run_update(1, Mode::Asap).await.unwrap();
    // Paused for a day: the next run makes no request and sends nothing
    s.dispatcher.run_update(1, Mode::Asap).await.unwrap();

    assert_eq!(s.inbox.to(1), vec![format!("{url} is temporarily unavailable.")]);
    let reports = s.inbox.to(1000);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("http_status"));

    match feed_state(&s.db, 1, Mode::Asap, &url).await {
        FeedState::Paused { until } => {
            assert!(until > Utc::now() + TimeDelta::hours(23));
        }
        other => panic!("expected a pause, got {other:?}"),
    }
}

#[tokio::test]
async fn test_undated_entries_pause_feed_briefly() {
    let s = setup().await;
    let url = format!("{}/undated.xml", s.server.uri());
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Undated</title>
<item><guid>x</guid><title>x</title></item></channel></rss>"#;

    Mock::given(method("GET"))
        .and(path("/undated.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&s.server)
        .await;

    subscribe(&s.db, 1, Mode::Asap, &url).await;
    s.dispatcher.run_update(1, Mode::Asap).await.unwrap();

    let reports = s.inbox.to(1000);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("missing_timestamp"));
    match feed_state(&s.db, 1, Mode::Asap, &url).await {
        FeedState::Paused { until } => {
            assert!(until < Utc::now() + TimeDelta::hours(7));
            assert!(until > Utc::now() + TimeDelta::hours(5));
        }
        other => panic!("expected a pause, got {other:?}"),
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopening_database() {
    let dir = std::env::temp_dir().join(format!("dailyfeed_it_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("state.db");
    let path_str = path.to_str().unwrap();

    {
        let db = Database::open(path_str).await.unwrap();
        let mut subscriber = Subscriber::new(42);
        subscriber.add_feed(Mode::Digest, "https://example.com/feed.xml").unwrap();
        subscriber.set_digest_time(chrono::NaiveTime::from_hms_opt(7, 15, 0).unwrap());
        db.save_subscriber(&subscriber).await.unwrap();
    }

    let db = Database::open(path_str).await.unwrap();
    let all = db.list_subscribers().await.unwrap();
    assert_eq!(all.len(), 1);
    let loaded = &all[0];
    assert_eq!(loaded.chat_id(), 42);
    assert_eq!(loaded.digest_time().format("%H:%M").to_string(), "07:15");
    assert!(loaded.is_subscribed("https://example.com/feed.xml"));

    std::fs::remove_dir_all(&dir).ok();
}
