use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use keystone_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// One inspectable setting: dotted key, rendered value, and the env var that can override it.
struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let webhook_token = match &config.notifications.webhook_token {
        Some(token) if token.expose_secret().trim().is_empty() => "<empty>",
        Some(_) => "<redacted>",
        None => "<unset>",
    };

    vec![
        Field {
            key: "database.url",
            value: config.database.url.clone(),
            env_keys: &["KEYSTONE_DATABASE_URL"],
        },
        Field {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_keys: &["KEYSTONE_DATABASE_MAX_CONNECTIONS"],
        },
        Field {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_keys: &["KEYSTONE_DATABASE_TIMEOUT_SECS"],
        },
        Field {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_keys: &["KEYSTONE_SERVER_BIND_ADDRESS"],
        },
        Field {
            key: "server.port",
            value: config.server.port.to_string(),
            env_keys: &["KEYSTONE_SERVER_PORT"],
        },
        Field {
            key: "server.graceful_shutdown_secs",
            value: config.server.graceful_shutdown_secs.to_string(),
            env_keys: &["KEYSTONE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        },
        Field {
            key: "approvals.escalation_interval_secs",
            value: config.approvals.escalation_interval_secs.to_string(),
            env_keys: &["KEYSTONE_APPROVALS_ESCALATION_INTERVAL_SECS"],
        },
        Field {
            key: "approvals.escalation_batch_size",
            value: config.approvals.escalation_batch_size.to_string(),
            env_keys: &["KEYSTONE_APPROVALS_ESCALATION_BATCH_SIZE"],
        },
        Field {
            key: "approvals.max_conflict_retries",
            value: config.approvals.max_conflict_retries.to_string(),
            env_keys: &["KEYSTONE_APPROVALS_MAX_CONFLICT_RETRIES"],
        },
        Field {
            key: "approvals.dashboard_limit",
            value: config.approvals.dashboard_limit.to_string(),
            env_keys: &["KEYSTONE_APPROVALS_DASHBOARD_LIMIT"],
        },
        Field {
            key: "notifications.webhook_url",
            value: config.notifications.webhook_url.clone().unwrap_or_else(|| "<unset>".into()),
            env_keys: &["KEYSTONE_NOTIFICATIONS_WEBHOOK_URL"],
        },
        Field {
            key: "notifications.webhook_token",
            value: webhook_token.to_string(),
            env_keys: &["KEYSTONE_NOTIFICATIONS_WEBHOOK_TOKEN"],
        },
        Field {
            key: "notifications.timeout_secs",
            value: config.notifications.timeout_secs.to_string(),
            env_keys: &["KEYSTONE_NOTIFICATIONS_TIMEOUT_SECS"],
        },
        Field {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["KEYSTONE_LOGGING_LEVEL", "KEYSTONE_LOG_LEVEL"],
        },
        Field {
            key: "logging.format",
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
            env_keys: &["KEYSTONE_LOGGING_FORMAT", "KEYSTONE_LOG_FORMAT"],
        },
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("keystone.toml"), PathBuf::from("config/keystone.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
