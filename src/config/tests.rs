use clap::Parser;
use serial_test::serial;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.listen_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::defaults().expect("valid settings");

    assert_eq!(settings.server.listen_addr.port(), DEFAULT_PORT);
    assert_eq!(settings.storage.max_size.get(), 1024 * 1024);
    assert!(settings.storage.supports_transactions);
    assert_eq!(settings.cache.max_uri_args, 100);
    assert_eq!(settings.cache.minimum_old_entity_download_rate.get(), 56);
    assert_eq!(settings.cache.key_spec.len(), 4);
    assert!(!settings.cache.esi_enabled);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn unknown_key_spec_field_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.key_spec = Some(vec!["scheme".into(), "cookie".into()]);

    let err = Settings::from_raw(raw).expect_err("unknown field must fail");
    assert!(matches!(err, LoadError::Invalid { key: "cache.key_spec", .. }));
}

#[test]
fn zero_storage_max_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.storage.max_size_bytes = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero max size must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "storage.max_size_bytes",
            ..
        }
    ));
}

#[test]
fn non_redis_url_is_rejected() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("postgres://localhost/cache".into());

    let err = Settings::from_raw(raw).expect_err("wrong scheme must fail");
    assert!(matches!(err, LoadError::Invalid { key: "redis.url", .. }));
}

#[test]
fn unknown_configuration_keys_are_rejected() {
    let source = config::Config::builder()
        .add_source(config::File::from_str(
            "[cache]\nbuffer_size = 1024\nbufer_size = 2048\n",
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds");

    let result: Result<RawSettings, _> = source.try_deserialize();
    assert!(result.is_err());
}

#[test]
fn file_values_are_deserialized() {
    let source = config::Config::builder()
        .add_source(config::File::from_str(
            "[upstream]\nhost = \"origin.internal\"\nport = 8081\nread_timeout_ms = 2500\n\n[cache]\nkey_spec = [\"host\", \"uri\"]\n",
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds");

    let raw: RawSettings = source.try_deserialize().expect("deserializes");
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.upstream.host, "origin.internal");
    assert_eq!(settings.upstream.port, 8081);
    assert_eq!(settings.upstream.read_timeout, Duration::from_millis(2500));
    assert_eq!(settings.cache.key_spec.len(), 2);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["hoard"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "hoard",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--upstream-port",
        "9000",
        "--esi-enabled",
        "true",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.upstream_port, Some(9000));
            assert_eq!(serve.overrides.esi_enabled, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    // SAFETY: every test touching the process environment is serialized.
    unsafe { std::env::set_var("HOARD_UPSTREAM__HOST", "env-origin.internal") };
    let result = load(&CliArgs::parse_from(["hoard"]));
    unsafe { std::env::remove_var("HOARD_UPSTREAM__HOST") };

    let settings = result.expect("valid settings");
    assert_eq!(settings.upstream.host, "env-origin.internal");
}

#[test]
#[serial]
fn loading_without_overrides_yields_defaults() {
    let settings = load(&CliArgs::parse_from(["hoard"])).expect("valid settings");
    assert_eq!(settings.upstream.host, DEFAULT_UPSTREAM_HOST);
    assert_eq!(settings.server.listen_addr.port(), DEFAULT_PORT);
}
