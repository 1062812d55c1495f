//! Unit tests for `FileWatcherManager` registration and change delivery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notebook_sessions::session::watcher::{FileWatcherManager, WatchCallback};

fn recorder() -> (WatchCallback, Arc<Mutex<Vec<PathBuf>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: WatchCallback = Arc::new(move |path| sink.lock().unwrap().push(path.to_path_buf()));
    (callback, seen)
}

#[test]
fn one_watcher_per_path_until_last_callback_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nb.py");
    std::fs::write(&path, "x = 1").unwrap();
    let watcher = FileWatcherManager::new();

    let (first, _) = recorder();
    let (second, _) = recorder();
    let a = watcher.add_callback(&path, first).unwrap();
    let b = watcher.add_callback(&path, second).unwrap();
    assert_ne!(a, b);
    assert_eq!(watcher.watched_paths(), vec![path.clone()]);

    watcher.remove_callback(&path, a);
    assert_eq!(watcher.watched_paths().len(), 1);
    watcher.remove_callback(&path, b);
    assert!(watcher.watched_paths().is_empty());
}

#[test]
fn stop_all_drops_every_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = FileWatcherManager::new();
    for name in ["a.py", "b.py"] {
        let path = dir.path().join(name);
        std::fs::write(&path, name).unwrap();
        let (callback, _) = recorder();
        watcher.add_callback(&path, callback).unwrap();
    }
    assert_eq!(watcher.watched_paths().len(), 2);

    watcher.stop_all();
    assert!(watcher.watched_paths().is_empty());
}

#[tokio::test]
async fn content_change_invokes_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nb.py");
    std::fs::write(&path, "x = 1").unwrap();
    let watcher = FileWatcherManager::new();
    let (callback, seen) = recorder();
    watcher.add_callback(&path, callback).unwrap();

    // Give the platform watcher a moment to arm.
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&path, "x = 2").unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("change should be reported");

    assert!(seen.lock().unwrap().iter().all(|changed| changed == &path));
    watcher.stop_all();
}
