//! Lifecycle tests for `ServerSet`: start, stop, exit reporting and rebinding.

use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use portico::config::AppConfig;
use portico::http::{ListenerExit, ServerSet, ServerState};

fn config(yaml: &str, dir: &Path) -> AppConfig {
    AppConfig::from_yaml(yaml, dir).unwrap()
}

fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_channel_closes_after_every_listener_reports() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        r#"
ports: { http: 0, https: 0 }
endpoints:
  - url: self.test
    https: self
    redirect: https://example.com
"#,
        dir.path(),
    );
    let mut servers = ServerSet::new(&config, Duration::from_secs(1)).unwrap();
    servers.start().unwrap();
    assert_eq!(servers.state(), ServerState::Running);
    let addrs = servers.local_addrs();
    assert_eq!(addrs.len(), 2);

    servers.stop().await.unwrap();
    assert_eq!(servers.state(), ServerState::Stopped);

    let mut closed = Vec::new();
    while let Some(exit) = servers.next_exit().await {
        match exit {
            ListenerExit::Closed { addr } => closed.push(addr),
            ListenerExit::Failed(e) => panic!("unexpected listener failure: {e}"),
        }
    }
    closed.sort();
    let mut expected = addrs;
    expected.sort();
    assert_eq!(closed, expected);

    // Closed stays closed.
    assert!(servers.next_exit().await.is_none());
}

#[tokio::test]
async fn test_stop_releases_port_for_next_generation() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let yaml = format!(
        "ports: {{ http: {port} }}\nendpoints:\n  - url: localhost\n    redirect: /x\n"
    );

    let mut first = ServerSet::new(&config(&yaml, dir.path()), Duration::from_secs(1)).unwrap();
    first.start().unwrap();
    assert_eq!(first.http_addr().unwrap().port(), port);
    first.stop().await.unwrap();

    let mut second = ServerSet::new(&config(&yaml, dir.path()), Duration::from_secs(1)).unwrap();
    second.start().unwrap();
    assert_eq!(second.http_addr().unwrap().port(), port);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_bounded_with_open_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        "ports: { http: 0 }\nendpoints:\n  - url: localhost\n    redirect: /x\n",
        dir.path(),
    );
    let mut servers = ServerSet::new(&config, Duration::from_millis(300)).unwrap();
    servers.start().unwrap();
    let port = servers.http_addr().unwrap().port();

    // An idle connection that never sends a request.
    let _idle = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), servers.stop()).await;
    assert!(stopped.is_ok(), "stop did not finish within its bound");
    assert_eq!(servers.state(), ServerState::Stopped);
}
