use super::load_config;
use super::settings::{PartialHubSettings, PartialSettings, Settings};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

/// Runs `f` with the current directory switched to a fresh temp dir.
fn in_temp_dir<F: FnOnce(&TempDir)>(f: F) {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");
    f(&tmp);
    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.path, "/chat");
    assert_eq!(settings.server.allowed_origins, vec!["http://localhost:5173"]);
    assert_eq!(settings.hub.max_connections, 1000);
    assert_eq!(settings.hub.outbound_queue_capacity, 256);
    assert_eq!(settings.hub.broker_prefix.as_deref(), Some("/topic/"));
    assert_eq!(settings.hub.routes.len(), 1);
    assert_eq!(settings.hub.routes[0].destination, "/app/sendMessage");
    assert_eq!(settings.hub.routes[0].topic, "/topic/messages");
    assert_eq!(settings.listen_addr(), "127.0.0.1:8080");
}

#[test]
fn test_merge_empty_broker_prefix_disables_it() {
    let partial = PartialSettings {
        server: None,
        hub: Some(PartialHubSettings {
            max_connections: Some(3),
            outbound_queue_capacity: None,
            grace_timeout_ms: None,
            connect_timeout_ms: Some(500),
            broker_prefix: Some(String::new()),
            routes: None,
        }),
        log: None,
    };

    let settings = Settings::merge(partial);
    assert_eq!(settings.hub.max_connections, 3);
    assert_eq!(settings.hub.outbound_queue_capacity, 256);
    assert!(settings.hub.broker_prefix.is_none());
    assert_eq!(settings.hub.connect_timeout().as_millis(), 500);
    assert_eq!(settings.hub.grace_timeout().as_millis(), 2000);
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    in_temp_dir(|_| {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.hub.grace_timeout_ms, 2000);
    });
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            allowed_origins = ["https://chat.example.com", "http://localhost:3000"]

            [hub]
            outbound_queue_capacity = 16

            [[hub.routes]]
            destination = "/app/room/{roomId}/sendMessage"
            topic = "/topic/room/{roomId}"

            [log]
            level = "debug"
        "#;
        fs::write("config/default.toml", toml).expect("write config file");

        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.path, "/chat");
        assert_eq!(
            cfg.server.allowed_origins,
            vec!["https://chat.example.com", "http://localhost:3000"]
        );
        assert_eq!(cfg.hub.outbound_queue_capacity, 16);
        assert_eq!(cfg.hub.max_connections, 1000);
        assert_eq!(cfg.hub.routes.len(), 1);
        assert_eq!(cfg.hub.routes[0].topic, "/topic/room/{roomId}");
        assert_eq!(cfg.log.level, "debug");
    });
}

#[test]
#[serial]
fn load_config_from_environment() {
    in_temp_dir(|_| {
        temp_env::with_vars(
            [
                ("CHATHUB__SERVER__PORT", Some("9100")),
                (
                    "CHATHUB__SERVER__ALLOWED_ORIGINS",
                    Some("http://a.test,http://b.test"),
                ),
                ("CHATHUB__HUB__GRACE_TIMEOUT_MS", Some("50")),
            ],
            || {
                let cfg = load_config().expect("load_config failed");
                assert_eq!(cfg.server.port, 9100);
                assert_eq!(
                    cfg.server.allowed_origins,
                    vec!["http://a.test", "http://b.test"]
                );
                assert_eq!(cfg.hub.grace_timeout_ms, 50);
                assert_eq!(cfg.server.host, "127.0.0.1");
            },
        );
    });
}
