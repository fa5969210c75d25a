use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::error::ConfigError;
use crate::receiver::ReceiverSettings;
use crate::retry_driver::RetrySettings;
use crate::scope::RepositoryScope;

const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
/// GitHub caps webhook payloads at 25 MB.
const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Where the event, checkpoint and failure tables live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    Sqlite(PathBuf),
}

/// Process configuration, read once at startup and handed to constructors.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub bind_address: IpAddr,
    pub webhook_secret: String,
    /// Full `projects/<project>/topics/<topic>` path.
    pub topic_path: String,
    pub pubsub_endpoint: String,
    pub pubsub_token: Option<String>,
    pub store: StoreLocation,
    /// A delivery with this many recorded failures is dead-lettered.
    pub retry_limit: u64,
    pub retry_batch_size: usize,
    pub retry_timeout: Duration,
    /// Cron expression for in-process retry passes.
    pub retry_schedule: Option<String>,
    pub publish_policy: RetryPolicy,
    pub republish_on_redelivery: bool,
    pub repository_scope: RepositoryScope,
    pub max_body_bytes: usize,
    /// Bearer token for `POST /retry`. Unset disables the endpoint.
    pub retry_auth_token: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("webhook_secret", &"<redacted>")
            .field("topic_path", &self.topic_path)
            .field("pubsub_endpoint", &self.pubsub_endpoint)
            .field("pubsub_token", &self.pubsub_token.as_ref().map(|_| "<redacted>"))
            .field("store", &self.store)
            .field("retry_limit", &self.retry_limit)
            .field("retry_batch_size", &self.retry_batch_size)
            .field("retry_timeout", &self.retry_timeout)
            .field("retry_schedule", &self.retry_schedule)
            .field("publish_policy", &self.publish_policy)
            .field("republish_on_redelivery", &self.republish_on_redelivery)
            .field("repository_scope", &self.repository_scope)
            .field("max_body_bytes", &self.max_body_bytes)
            .field(
                "retry_auth_token",
                &self.retry_auth_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let webhook_secret = get("WEBHOOK_SECRET").ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;

        let topic_id = get("TOPIC_ID").ok_or(ConfigError::Missing("TOPIC_ID"))?;
        let topic_path = if topic_id.starts_with("projects/") {
            topic_id
        } else {
            let project_id = get("PROJECT_ID").ok_or(ConfigError::Missing("PROJECT_ID"))?;
            format!("projects/{project_id}/topics/{topic_id}")
        };

        let store = match get("DATABASE_PATH") {
            Some(p) if p == ":memory:" => StoreLocation::InMemory,
            Some(p) => StoreLocation::Sqlite(PathBuf::from(p)),
            None => StoreLocation::Sqlite(PathBuf::from("webhooks.db")),
        };

        let retry_limit: u64 = parse_or(&get, "RETRY_LIMIT", 5)?;
        if retry_limit == 0 {
            return Err(ConfigError::Invalid {
                name: "RETRY_LIMIT",
                reason: "must be at least 1".to_string(),
            });
        }

        let retry_batch_size: usize = parse_or(&get, "RETRY_BATCH_SIZE", 500)?;
        if retry_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "RETRY_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        let retry_schedule = get("RETRY_SCHEDULE");
        if let Some(expr) = &retry_schedule {
            cron::Schedule::from_str(expr).map_err(|e| ConfigError::Invalid {
                name: "RETRY_SCHEDULE",
                reason: e.to_string(),
            })?;
        }

        let publish_policy = RetryPolicy {
            max_attempts: parse_or(&get, "PUBLISH_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(parse_or(&get, "PUBLISH_BASE_DELAY_MS", 200)?),
            jitter: Duration::from_millis(parse_or(&get, "PUBLISH_JITTER_MS", 100)?),
        };

        let repository_scope = match get("REPOSITORY_SCOPE") {
            Some(raw) => raw.parse::<RepositoryScope>().map_err(|reason| ConfigError::Invalid {
                name: "REPOSITORY_SCOPE",
                reason,
            })?,
            None => RepositoryScope::All,
        };

        Ok(Config {
            port: parse_or(&get, "PORT", 8080)?,
            bind_address: parse_or(&get, "BIND_ADDRESS", IpAddr::from([0, 0, 0, 0]))?,
            webhook_secret,
            topic_path,
            pubsub_endpoint: get("PUBSUB_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_PUBSUB_ENDPOINT.to_string()),
            pubsub_token: get("PUBSUB_TOKEN"),
            store,
            retry_limit,
            retry_batch_size,
            retry_timeout: Duration::from_secs(parse_or(&get, "RETRY_TIMEOUT_SECS", 300)?),
            retry_schedule,
            publish_policy,
            republish_on_redelivery: parse_or(&get, "REPUBLISH_ON_REDELIVERY", false)?,
            repository_scope,
            max_body_bytes: parse_or(&get, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            retry_auth_token: get("RETRY_AUTH_TOKEN").map(|t| t.trim().to_string()),
        })
    }

    pub fn receiver_settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            retry_limit: self.retry_limit,
            publish_policy: self.publish_policy,
            republish_on_redelivery: self.republish_on_redelivery,
            repository_scope: self.repository_scope.clone(),
        }
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            retry_limit: self.retry_limit,
            batch_size: self.retry_batch_size,
            timeout: self.retry_timeout,
            publish_policy: self.publish_policy,
        }
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("WEBHOOK_SECRET", "s3cr3t"),
        ("TOPIC_ID", "github-events"),
        ("PROJECT_ID", "demo"),
    ];

    #[test]
    fn defaults_apply() {
        let config = config_from(REQUIRED).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.topic_path, "projects/demo/topics/github-events");
        assert_eq!(config.store, StoreLocation::Sqlite(PathBuf::from("webhooks.db")));
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.retry_batch_size, 500);
        assert_eq!(config.retry_timeout, Duration::from_secs(300));
        assert_eq!(config.publish_policy, RetryPolicy::default());
        assert!(!config.republish_on_redelivery);
        assert_eq!(config.repository_scope, RepositoryScope::All);
        assert!(config.retry_schedule.is_none());
        assert!(config.retry_auth_token.is_none());
    }

    #[test]
    fn retry_auth_token_is_trimmed_and_blank_means_unset() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RETRY_AUTH_TOKEN", "  replay-token  "));
        let config = config_from(&pairs).unwrap();
        assert_eq!(config.retry_auth_token.as_deref(), Some("replay-token"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RETRY_AUTH_TOKEN", "   "));
        assert!(config_from(&pairs).unwrap().retry_auth_token.is_none());
    }

    #[test]
    fn missing_secret_is_fatal() {
        let err = config_from(&[("TOPIC_ID", "t"), ("PROJECT_ID", "p")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WEBHOOK_SECRET")));
    }

    #[test]
    fn blank_secret_is_fatal() {
        let err = config_from(&[
            ("WEBHOOK_SECRET", "   "),
            ("TOPIC_ID", "t"),
            ("PROJECT_ID", "p"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WEBHOOK_SECRET")));
    }

    #[test]
    fn missing_topic_is_fatal() {
        let err = config_from(&[("WEBHOOK_SECRET", "s"), ("PROJECT_ID", "p")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TOPIC_ID")));
    }

    #[test]
    fn full_topic_path_needs_no_project() {
        let config = config_from(&[
            ("WEBHOOK_SECRET", "s"),
            ("TOPIC_ID", "projects/other/topics/events"),
        ])
        .unwrap();
        assert_eq!(config.topic_path, "projects/other/topics/events");
    }

    #[test]
    fn short_topic_needs_project() {
        let err = config_from(&[("WEBHOOK_SECRET", "s"), ("TOPIC_ID", "events")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PROJECT_ID")));
    }

    #[test]
    fn invalid_port_is_reported_by_name() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "eighty"));
        let err = config_from(&pairs).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
    }

    #[test]
    fn zero_retry_limit_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RETRY_LIMIT", "0"));
        assert!(config_from(&pairs).is_err());
    }

    #[test]
    fn bad_cron_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RETRY_SCHEDULE", "every five minutes"));
        let err = config_from(&pairs).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RETRY_SCHEDULE", .. }));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(&[
            ("PORT", "9000"),
            ("DATABASE_PATH", ":memory:"),
            ("RETRY_LIMIT", "2"),
            ("RETRY_SCHEDULE", "0 */5 * * * *"),
            ("PUBLISH_MAX_ATTEMPTS", "1"),
            ("PUBLISH_BASE_DELAY_MS", "0"),
            ("PUBLISH_JITTER_MS", "0"),
            ("REPUBLISH_ON_REDELIVERY", "true"),
            ("REPOSITORY_SCOPE", "octo/hello"),
        ]);
        let config = config_from(&pairs).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.store, StoreLocation::InMemory);
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.retry_schedule.as_deref(), Some("0 */5 * * * *"));
        assert_eq!(config.publish_policy, RetryPolicy::once());
        assert!(config.republish_on_redelivery);
        assert!(matches!(config.repository_scope, RepositoryScope::Selected(_)));
    }

    #[test]
    fn component_settings_follow_config() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(&[("RETRY_LIMIT", "7"), ("RETRY_TIMEOUT_SECS", "12")]);
        let config = config_from(&pairs).unwrap();
        assert_eq!(config.receiver_settings().retry_limit, 7);
        let retry = config.retry_settings();
        assert_eq!(retry.retry_limit, 7);
        assert_eq!(retry.timeout, Duration::from_secs(12));
        assert_eq!(retry.batch_size, 500);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PUBSUB_TOKEN", "ya29.token"));
        pairs.push(("RETRY_AUTH_TOKEN", "replay-token"));
        let rendered = format!("{:?}", config_from(&pairs).unwrap());
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("ya29.token"));
        assert!(!rendered.contains("replay-token"));
    }
}
