//! Config module tests

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("HUBMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${HUBMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("HUBMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("HUBMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${HUBMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("HUBMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${HUBMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("HUBMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("HUBMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${HUBMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("hubmq.toml");

    std::env::set_var("HUBMQ_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("HUBMQ_TEST_BIND_PORT", "1885");

    let config_content = r#"
[server]
bind = "${HUBMQ_TEST_BIND_HOST}:${HUBMQ_TEST_BIND_PORT}"
workers = ${HUBMQ_TEST_WORKERS:-4}

[limits]
overflow_policy = "drop_oldest"
block_timeout = "250ms"
retry_interval = "0s"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.server.workers, 4);
    assert_eq!(config.limits.overflow_policy, OverflowPolicy::DropOldest);
    assert_eq!(config.limits.block_timeout, Duration::from_millis(250));
    assert_eq!(config.limits.retry_interval, Duration::ZERO);
    // Untouched keys keep their defaults
    assert_eq!(config.session.connect_timeout, Duration::from_secs(10));

    std::env::remove_var("HUBMQ_TEST_BIND_HOST");
    std::env::remove_var("HUBMQ_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.outbound_queue_capacity, 1024);
    assert_eq!(config.storage.backend, "memory");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_connections, 100_000);
    assert_eq!(config.limits.overflow_policy, OverflowPolicy::Block);
    assert_eq!(config.session.keep_alive_grace, 1.5);
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.mqtt.allow_empty_client_id);
    assert!(!config.auth.enabled);
    assert!(!config.acl.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let toml = r#"
[server]
bind = "127.0.0.1:1883"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1883");
}

#[test]
fn test_parse_full_config() {
    let toml = r##"
[log]
level = "debug"

[server]
bind = "0.0.0.0:1883"
workers = 4

[limits]
max_connections = 50000
max_packet_size = 65536
outbound_queue_capacity = 64
overflow_policy = "drop_newest"
block_timeout = "1s"
max_queued_messages = 500
retry_interval = "20s"

[session]
keep_alive_grace = 2.0
connect_timeout = "5s"

[mqtt]
max_qos = 1
retain_available = false
allow_empty_client_id = false
username_as_client_id = true

[auth]
enabled = true
allow_anonymous = false

[[auth.users]]
username = "admin"
password = "secret123"
role = "admin"

[[auth.users]]
username = "sensor1"
password_hash = "$argon2id$v=19$m=19456,t=2,p=1$3QUugnyLZGsTrETNoga03Q$Tnmpw8w1t/PzI36MTps259IB7ntGAb4NA0KlYD9Yzlw"
role = "device"

[[auth.psk]]
identity = "gateway-1"
hint = "hubmq"
key = "c2VjcmV0LWtleQ=="

[acl]
enabled = true

[[acl.roles]]
name = "admin"
publish = ["#"]
subscribe = ["#"]

[[acl.roles]]
name = "device"
publish = ["sensors/%c/#"]
subscribe = ["commands/%c/#"]

[acl.default]
publish = []
subscribe = ["public/#"]

[storage]
backend = "memory"
"##;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.workers, 4);
    assert_eq!(config.limits.max_connections, 50000);
    assert_eq!(config.limits.overflow_policy, OverflowPolicy::DropNewest);
    assert_eq!(config.limits.retry_interval, Duration::from_secs(20));
    assert_eq!(config.session.connect_timeout, Duration::from_secs(5));
    assert!(config.mqtt.username_as_client_id);
    assert!(config.auth.enabled);
    assert!(!config.auth.allow_anonymous);
    assert_eq!(config.auth.users.len(), 2);
    assert_eq!(config.auth.users[0].password, Some("secret123".to_string()));
    assert!(config.auth.users[1].password_hash.is_some());
    assert_eq!(config.auth.psk[0].identity, "gateway-1");
    assert_eq!(config.auth.psk[0].hint.as_deref(), Some("hubmq"));
    assert!(config.acl.enabled);
    assert_eq!(config.acl.roles.len(), 2);
    assert_eq!(config.acl.default.subscribe, vec!["public/#"]);

    let broker = config.to_broker_config();
    assert_eq!(broker.max_packet_size, 65536);
    assert_eq!(broker.outbound_queue_capacity, 64);
    assert_eq!(broker.block_timeout, Duration::from_secs(1));
    assert_eq!(broker.keep_alive_grace, 2.0);
    assert_eq!(broker.max_qos, QoS::AtLeastOnce);
    assert!(!broker.retain_available);
    assert!(!broker.allow_empty_client_id);
    assert!(!broker.allow_anonymous);
    assert!(broker.username_as_client_id);
}

#[test]
fn test_anonymous_allowed_when_auth_disabled() {
    let toml = r#"
[auth]
enabled = false
allow_anonymous = false
"#;
    let config = Config::parse(toml).unwrap();
    assert!(config.to_broker_config().allow_anonymous);
}

#[test]
fn test_invalid_max_qos() {
    let toml = r#"
[mqtt]
max_qos = 3
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_max_topic_levels() {
    assert_eq!(Config::default().to_broker_config().max_topic_levels, 128);

    let toml = r#"
[mqtt]
max_topic_levels = 16
"#;
    let config = Config::parse(toml).unwrap();
    assert_eq!(config.to_broker_config().max_topic_levels, 16);

    let toml = r#"
[mqtt]
max_topic_levels = 5000
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("max_topic_levels"));
}

#[test]
fn test_invalid_keep_alive_grace() {
    let toml = r#"
[session]
keep_alive_grace = 0.5
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("keep_alive_grace"));
}

#[test]
fn test_invalid_queue_capacity() {
    let toml = r#"
[limits]
outbound_queue_capacity = 0
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_invalid_overflow_policy() {
    let toml = r#"
[limits]
overflow_policy = "spill"
"#;
    assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
}

#[test]
fn test_unknown_storage_backend() {
    let toml = r#"
[storage]
backend = "redis"
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("unknown storage backend"));
}

#[test]
fn test_invalid_acl_role_reference() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password = "secret"
role = "nonexistent_role"

[acl]
enabled = true
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_user_missing_password_and_hash() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("must have either 'password' or 'password_hash'"));
}

#[test]
fn test_user_both_password_and_hash() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password = "plaintext"
password_hash = "$argon2id$v=19$m=19456,t=2,p=1$3QUugnyLZGsTrETNoga03Q$Tnmpw8w1t/PzI36MTps259IB7ntGAb4NA0KlYD9Yzlw"
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("cannot have both"));
}

#[test]
fn test_user_invalid_hash_format() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password_hash = "not-a-valid-hash"
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("invalid password_hash format"));
}

#[test]
fn test_user_empty_password() {
    let toml = r#"
[auth]
enabled = true

[[auth.users]]
username = "admin"
password = ""
"#;
    let err = Config::parse(toml).unwrap_err().to_string();
    assert!(err.contains("empty password"));
}
