//! Tests for the bus-runtime-cli library module.

use super::*;
use bus_runtime::DeliveryModel;
use std::io::Write;

// ============================================================================
// Argument Parsing
// ============================================================================

mod parsing {
    use super::*;

    #[test]
    fn test_config_command_parsing() {
        let cli = Cli::try_parse_from(["bus-runtime", "config", "--show", "--format", "json"])
            .unwrap();

        assert_eq!(cli.log_level, "info");
        assert!(!cli.json_logs);
        match cli.command {
            Commands::Config { show, format } => {
                assert!(show);
                assert_eq!(format, ConfigFormat::Json);
            }
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_soak_command_parsing() {
        let cli = Cli::try_parse_from([
            "bus-runtime",
            "--log-level",
            "debug",
            "--json-logs",
            "soak",
            "--messages",
            "50",
            "--workers",
            "8",
            "--fail-every",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        assert!(cli.json_logs);
        match cli.command {
            Commands::Soak {
                messages,
                workers,
                fail_every,
                timeout_secs,
            } => {
                assert_eq!(messages, 50);
                assert_eq!(workers, 8);
                assert_eq!(fail_every, Some(5));
                assert_eq!(timeout_secs, 60);
            }
            _ => panic!("Expected Soak command"),
        }
    }

    #[test]
    fn test_unknown_format_rejected() {
        let result = Cli::try_parse_from(["bus-runtime", "config", "--format", "toml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_command_rejected() {
        assert!(Cli::try_parse_from(["bus-runtime"]).is_err());
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

mod configuration {
    use super::*;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(extension)
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml_file() {
        let file = write_config(
            ".toml",
            r#"
[transport]
delivery_model = "acknowledgment"
input_queue = "orders"
max_concurrent_receives = 7

[retry]
attempts = 2
"#,
        );

        let config = load_configuration(Some(file.path())).unwrap();

        assert_eq!(config.transport.delivery_model, DeliveryModel::Acknowledgment);
        assert_eq!(config.transport.input_queue.as_deref(), Some("orders"));
        assert_eq!(config.transport.max_concurrent_receives, 7);
        assert_eq!(config.transport.lock_duration_secs, 30);
        assert_eq!(config.retry.attempts, 2);
    }

    #[test]
    fn test_load_yaml_file() {
        let file = write_config(
            ".yaml",
            "transport:\n  auto_renew_lock: true\n  lock_duration_secs: 12\n",
        );

        let config = load_configuration(Some(file.path())).unwrap();

        assert!(config.transport.auto_renew_lock);
        assert_eq!(config.transport.lock_duration_secs, 12);
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = load_configuration(Some(Path::new("/nonexistent/bus-runtime.toml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config(".toml", "[transport]\nlock_duration_secs = 0\n");

        let result = load_configuration(Some(file.path()));

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_render_config_formats() {
        let config = BusConfig::default();

        let json = render_config(&config, &ConfigFormat::Json).unwrap();
        let parsed: BusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.transport.max_concurrent_receives, 20);

        let yaml = render_config(&config, &ConfigFormat::Yaml).unwrap();
        assert!(yaml.contains("lock_duration_secs: 30"));
    }
}

// ============================================================================
// Exit Codes
// ============================================================================

mod exit_codes {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            CliError::Configuration(ConfigError::FileNotFound {
                path: PathBuf::from("x"),
            }),
            CliError::Bus(BusError::ConnectionFailed {
                message: "down".to_string(),
            }),
            CliError::InvalidArgument {
                arg: "--workers".to_string(),
                message: "bad".to_string(),
            },
            CliError::Io(std::io::Error::other("io")),
            CliError::SoakFailed {
                message: "lost".to_string(),
            },
        ];

        let codes: Vec<i32> = errors.iter().map(CliError::exit_code).collect();

        assert_eq!(codes, vec![1, 2, 3, 4, 5]);
    }
}
