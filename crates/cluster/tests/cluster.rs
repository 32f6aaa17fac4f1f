use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use tempfile::tempdir;
use url::Url;
use vigil_bootable::Bootable;
use vigil_cluster::{BootstrapError, ClusterConfig, ClusterStore, Error, WatchEvent};
use vigil_util::port_allocator::allocate_http_url;

fn single_member_config(state_dir: &Path) -> ClusterConfig {
    let client_url = allocate_http_url();
    let peer_url = allocate_http_url();
    let initial_cluster = format!("default={}", peer_url.as_str().trim_end_matches('/'));

    ClusterConfig::new(state_dir, client_url, peer_url, initial_cluster)
}

async fn bootstrap(state_dir: &Path) -> ClusterStore {
    ClusterStore::bootstrap(single_member_config(state_dir))
        .await
        .expect("bootstrap failed")
}

#[tokio::test]
async fn test_put_then_get_single_member() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let client = store.new_client().await.unwrap();

    client.put("key", "value").await.unwrap();

    let kvs = client.range("key").await.unwrap();
    assert_eq!(kvs.len(), 1);
    assert_eq!(kvs[0].key, "key");
    assert_eq!(kvs[0].value.as_ref(), b"value");

    let kv = client.get("key").await.unwrap().expect("key should exist");
    assert_eq!(kv.value.as_ref(), b"value");
    assert_eq!(kv.version, 1);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_missing_key_is_none() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let client = store.new_client().await.unwrap();

    assert!(client.get("missing").await.unwrap().is_none());

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reads_observe_latest_write_across_clients() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let writer = store.new_client().await.unwrap();
    let reader = store.new_client().await.unwrap();

    let mut last_revision = 0;
    for i in 0..20 {
        let value = format!("v{i}");
        let revision = writer.put("counter", value.clone()).await.unwrap();
        assert!(revision > last_revision);
        last_revision = revision;

        let kv = reader.get("counter").await.unwrap().expect("written key");
        assert_eq!(kv.value.as_ref(), value.as_bytes());
        assert_eq!(kv.mod_revision, revision);
    }

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_and_prefix_range() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let client = store.new_client().await.unwrap();

    client.put("agents/b", "2").await.unwrap();
    client.put("agents/a", "1").await.unwrap();
    client.put("checks/x", "3").await.unwrap();

    let keys: Vec<_> = client
        .range("agents/")
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(keys, vec!["agents/a", "agents/b"]);

    assert_eq!(client.delete("agents/a").await.unwrap(), 1);
    assert_eq!(client.delete("agents/a").await.unwrap(), 0);
    assert_eq!(client.range("agents/").await.unwrap().len(), 1);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watch_reports_changes_under_prefix() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let client = store.new_client().await.unwrap();

    let mut watch = client.watch("agents/").await.unwrap();

    client.put("checks/ignored", "x").await.unwrap();
    client.put("agents/a", "1").await.unwrap();
    client.delete("agents/a").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first {
        WatchEvent::Put { kv } => {
            assert_eq!(kv.key, "agents/a");
            assert_eq!(kv.value.as_ref(), b"1");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let second = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(second, WatchEvent::Delete { ref key, .. } if key == "agents/a"));

    store.shutdown().await.unwrap();

    // The member ends open watches on shutdown.
    let end = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap();
    assert!(!matches!(end, Some(Ok(_))));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;
    let client = store.new_client().await.unwrap();

    store.shutdown().await.unwrap();
    store.shutdown().await.unwrap();

    assert!(!store.is_running().await);
    assert!(matches!(store.new_client().await, Err(Error::NotStarted)));
    assert!(client.get("key").await.is_err());

    tokio::time::timeout(Duration::from_secs(1), store.wait())
        .await
        .expect("wait should resolve after shutdown");
}

#[tokio::test]
async fn test_locked_state_dir_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;

    let result = ClusterStore::bootstrap(single_member_config(dir.path())).await;
    assert!(matches!(
        result,
        Err(Error::Bootstrap(BootstrapError::StateDirLocked(_)))
    ));

    // The first member is unaffected.
    let client = store.new_client().await.unwrap();
    client.put("key", "value").await.unwrap();

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_releases_state_dir() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut config = single_member_config(dir.path());
    config.client_listen_url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();

    let result = ClusterStore::bootstrap(config).await;
    assert!(matches!(
        result,
        Err(Error::Bootstrap(BootstrapError::Bind { .. }))
    ));

    // Nothing was left holding the directory.
    let store = bootstrap(dir.path()).await;
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let mut config = single_member_config(dir.path());
    config.initial_cluster = "other=http://127.0.0.1:1".to_string();

    let result = ClusterStore::bootstrap(config).await;
    assert!(matches!(
        result,
        Err(Error::Bootstrap(BootstrapError::InvalidConfig(_)))
    ));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = bootstrap(dir.path()).await;

    assert!(matches!(store.start().await, Err(Error::AlreadyStarted)));

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bootable_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let store = ClusterStore::new(single_member_config(dir.path()));

    assert!(matches!(store.new_client().await, Err(Error::NotStarted)));

    Bootable::start(&store).await.unwrap();
    assert!(store.is_running().await);
    assert!(store.leader().await.is_some());

    Bootable::shutdown(&store).await.unwrap();
    Bootable::shutdown(&store).await.unwrap();
    assert!(!store.is_running().await);
}

#[tokio::test]
async fn test_restart_reuses_state_dir() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let config = single_member_config(dir.path());

    let store = ClusterStore::bootstrap(config.clone()).await.unwrap();
    let first_revision = store
        .new_client()
        .await
        .unwrap()
        .put("key", "value")
        .await
        .unwrap();
    store.shutdown().await.unwrap();

    let store = ClusterStore::bootstrap(config).await.unwrap();
    let client = store.new_client().await.unwrap();

    let kv = client.get("key").await.unwrap().expect("key should survive restart");
    assert_eq!(kv.value.as_ref(), b"value");
    assert_eq!(kv.mod_revision, first_revision);
    assert_eq!(kv.version, 1);

    let second_revision = client.put("key", "updated").await.unwrap();
    assert!(second_revision > first_revision);

    let kv = client.get("key").await.unwrap().unwrap();
    assert_eq!(kv.value.as_ref(), b"updated");
    assert_eq!(kv.create_revision, first_revision);
    assert_eq!(kv.version, 2);

    store.shutdown().await.unwrap();
}
