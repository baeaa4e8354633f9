use std::time::Duration;

use clap::Parser;
use pinion::cli::{self, Cli};
use pinion_service::config::{Config, IpfsConfig};
use pinion_service::test::{self, HASHES, MockEngine};
use pinion_test::IpfsDaemon;
use serde_json::json;
use tokio::sync::oneshot;

#[test]
fn test_parse_config_arg() {
    let cli = Cli::try_parse_from(["pinion", "--config", "pinion.yml"]).unwrap();
    assert_eq!(cli.config().unwrap().to_str(), Some("pinion.yml"));

    let cli = Cli::try_parse_from(["pinion", "-c", "other.yml"]).unwrap();
    assert_eq!(cli.config().unwrap().to_str(), Some("other.yml"));

    assert!(Cli::try_parse_from(["pinion", "--unknown"]).is_err());
}

#[test]
fn test_load_config_file() {
    let dir = pinion_test::tempdir();
    let path = dir.path().join("pinion.yml");
    std::fs::write(&path, "room: colony\nstores:\n  max_open_stores: 3\n").unwrap();

    let config = cli::load_config(Some(&path)).unwrap();
    assert_eq!(config.room, "colony");
    assert_eq!(config.stores.max_open_stores, 3);
}

#[test]
fn test_load_config_without_room() {
    let dir = pinion_test::tempdir();
    let path = dir.path().join("pinion.yml");
    std::fs::write(&path, "stores:\n  max_open_stores: 3\n").unwrap();

    let error = cli::load_config(Some(&path)).unwrap_err();
    assert_eq!(
        error.to_string(),
        "pinning room is required for pinion to start"
    );
}

#[tokio::test]
async fn test_run_until_shutdown() {
    pinion_test::setup();
    let daemon = IpfsDaemon::new("QmPinner");
    let engine = MockEngine::new();
    let config = Config {
        room: "pinion-room".into(),
        ipfs: IpfsConfig {
            daemon_url: daemon.url().parse().unwrap(),
            request_timeout: Duration::from_secs(5),
            peer_poll_interval: Duration::from_millis(10),
        },
        ..Default::default()
    };

    let (shutdown, signal) = oneshot::channel::<()>();
    let running = tokio::spawn(cli::run(config, engine.clone(), async {
        signal.await.ok();
    }));

    test::wait_until(|| daemon.subscribers() == 1).await;
    assert!(engine.is_connected());

    let action = json!({ "type": "PIN_HASH", "payload": { "ipfsHash": HASHES[0] } });
    daemon.send_message("QmClient", "pinion-room", action.to_string().as_bytes());
    test::wait_until(|| daemon.pinned() == [HASHES[0]]).await;

    shutdown.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert!(!engine.is_connected());
    assert_eq!(engine.disconnects(), 1);
}
