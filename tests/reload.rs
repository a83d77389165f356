//! Reload loop tests: a configuration change restarts the listeners on the
//! same port, and an interrupt ends the loop cleanly.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use portico::reload::ReloadController;
use tokio::sync::oneshot;

fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(path: &Path, port: u16, dir: &str) {
    let yaml = format!(
        "ports: {{ http: {port} }}\nlogFile: /dev/null\nendpoints:\n  - url: \"*\"\n    static: {dir}\n"
    );
    fs::write(path, yaml).unwrap();
}

/// Poll until the body matches, or give up after a few seconds.
async fn wait_for_body(port: u16, expected: &str) -> bool {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(response) = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
        {
            if response.text().await.ok().as_deref() == Some(expected) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_config_change_restarts_on_same_port() {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in [("v1", "first"), ("v2", "second")] {
        fs::create_dir_all(dir.path().join(name)).unwrap();
        fs::write(dir.path().join(name).join("index.html"), body).unwrap();
    }
    let config_path = dir.path().join("config.yaml");
    let port = free_port();
    write_config(&config_path, port, "v1");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = ReloadController::new(&config_path, Duration::from_secs(1));
    let running = tokio::spawn(controller.run(async move {
        let _ = stop_rx.await;
    }));

    assert!(wait_for_body(port, "first").await);

    write_config(&config_path, port, "v2");
    assert!(wait_for_body(port, "second").await);

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "{result:?}");

    // Listeners are gone after the loop returns.
    assert!(reqwest::get(format!("http://127.0.0.1:{port}/")).await.is_err());
}

#[tokio::test]
async fn test_invalid_config_waits_for_fix() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("v1")).unwrap();
    fs::write(dir.path().join("v1/index.html"), "fixed").unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "endpoints: [ { url: a.example } ]\n").unwrap();
    let port = free_port();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = ReloadController::new(&config_path, Duration::from_secs(1));
    let running = tokio::spawn(controller.run(async move {
        let _ = stop_rx.await;
    }));

    // Give the loop time to reject the first file before fixing it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    write_config(&config_path, port, "v1");
    assert!(wait_for_body(port, "fixed").await);

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
}
