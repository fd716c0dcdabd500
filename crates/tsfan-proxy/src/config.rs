//! Flat-YAML proxy configuration.
//!
//! The file is a single mapping of `key: value` pairs (no sections).
//! `filter-prefix` accepts either one string or a sequence of strings.
//! Unknown keys are collected and reported once logging is up; mandatory
//! keys are validated with a message naming the missing key.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Hard cap on configured filter prefixes.
pub const MAX_FILTERS: usize = 1024;

const DEFAULT_STATS_INTERVAL: u32 = 60;

/// Prefix every stats key starts with.
const STATS_METRIC_PREFIX: &str = "systems.services.tsk";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Raw deserialization target; everything optional so validation can name
/// the missing key.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "log-level")]
    log_level: Option<u8>,

    #[serde(rename = "timeseries-backend")]
    timeseries_backend: Option<String>,
    #[serde(rename = "timeseries-dbats-opts")]
    timeseries_dbats_opts: Option<String>,

    #[serde(rename = "kafka-brokers")]
    kafka_brokers: Option<String>,
    #[serde(rename = "kafka-topic-prefix")]
    kafka_topic_prefix: Option<String>,
    #[serde(rename = "kafka-channel")]
    kafka_channel: Option<String>,
    #[serde(rename = "kafka-consumer-group")]
    kafka_consumer_group: Option<String>,
    #[serde(rename = "kafka-offset")]
    kafka_offset: Option<String>,

    #[serde(rename = "filter-prefix")]
    filter_prefix: Option<OneOrMany>,

    #[serde(rename = "stats-interval")]
    stats_interval: Option<u32>,
    #[serde(rename = "stats-ts-backend")]
    stats_ts_backend: Option<String>,
    #[serde(rename = "stats-ts-opts")]
    stats_ts_opts: Option<String>,

    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Validated proxy configuration, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// 0 = error, 1 = info, 2 = debug.
    pub log_level: u8,
    /// Downstream backend name.
    pub timeseries_backend: String,
    /// Option string handed to the downstream backend.
    pub timeseries_opts: String,
    /// Kafka broker list.
    pub kafka_brokers: String,
    /// Topic prefix; the consumed topic is `<prefix>.<channel>`.
    pub kafka_topic_prefix: String,
    /// Channel this proxy demultiplexes.
    pub kafka_channel: String,
    /// Consumer group stem; the group id is suffixed with the topic.
    pub kafka_consumer_group: String,
    /// Initial offset policy (`auto.offset.reset`).
    pub kafka_offset: String,
    /// Keys are kept only if they start with one of these (empty = all).
    pub filter_prefixes: Vec<String>,
    /// Stats flush period in seconds.
    pub stats_interval: u32,
    /// Stats backend name, when statistics are enabled.
    pub stats_backend: Option<String>,
    /// Option string for the stats backend.
    pub stats_opts: Option<String>,
    /// Config keys that were present but not recognised.
    pub unknown_keys: Vec<String>,
}

impl ProxyConfig {
    /// Parses and validates a YAML configuration string.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Yaml`] on malformed YAML,
    /// [`ProxyError::MissingOption`] naming the first absent mandatory key,
    /// [`ProxyError::Config`] on invalid values.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;

        let log_level = raw.log_level.unwrap_or(0);
        if log_level > 2 {
            return Err(ProxyError::Config(format!(
                "log-level {log_level} out of range 0-2"
            )));
        }

        let filter_prefixes = raw
            .filter_prefix
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        if filter_prefixes.len() > MAX_FILTERS {
            return Err(ProxyError::Config(format!(
                "{} filter prefixes exceed the maximum of {MAX_FILTERS}",
                filter_prefixes.len()
            )));
        }

        let stats_interval = raw.stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL);
        if stats_interval == 0 {
            return Err(ProxyError::Config("stats-interval must be positive".into()));
        }

        if raw.stats_ts_backend.is_some() != raw.stats_ts_opts.is_some() {
            return Err(ProxyError::Config(
                "stats-ts-backend and stats-ts-opts must be provided together".into(),
            ));
        }

        Ok(Self {
            log_level,
            timeseries_backend: raw
                .timeseries_backend
                .ok_or(ProxyError::MissingOption("timeseries-backend"))?,
            timeseries_opts: raw
                .timeseries_dbats_opts
                .ok_or(ProxyError::MissingOption("timeseries-dbats-opts"))?,
            kafka_brokers: raw
                .kafka_brokers
                .ok_or(ProxyError::MissingOption("kafka-brokers"))?,
            kafka_topic_prefix: raw
                .kafka_topic_prefix
                .ok_or(ProxyError::MissingOption("kafka-topic-prefix"))?,
            kafka_channel: raw
                .kafka_channel
                .ok_or(ProxyError::MissingOption("kafka-channel"))?,
            kafka_consumer_group: raw
                .kafka_consumer_group
                .ok_or(ProxyError::MissingOption("kafka-consumer-group"))?,
            kafka_offset: raw
                .kafka_offset
                .ok_or(ProxyError::MissingOption("kafka-offset"))?,
            filter_prefixes,
            stats_interval,
            stats_backend: raw.stats_ts_backend,
            stats_opts: raw.stats_ts_opts,
            unknown_keys: raw.unknown.into_keys().collect(),
        })
    }

    /// Parses and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// As [`from_yaml`](Self::from_yaml), plus [`ProxyError::Io`] if the
    /// file cannot be read.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// The topic this proxy consumes.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}.{}", self.kafka_topic_prefix, self.kafka_channel)
    }

    /// The consumer group id: the configured group suffixed with the topic
    /// so proxies for different channels never share a group.
    #[must_use]
    pub fn group_id(&self) -> String {
        format!("{}.{}", self.kafka_consumer_group, self.topic())
    }

    /// Whether self-reporting statistics are configured.
    #[must_use]
    pub fn stats_enabled(&self) -> bool {
        self.stats_backend.is_some() && self.stats_opts.is_some()
    }

    /// The stats key prefix: the fixed stem plus consumer group, topic
    /// prefix and channel, each made graphite-safe first.
    #[must_use]
    pub fn stats_prefix(&self) -> String {
        format!(
            "{STATS_METRIC_PREFIX}.{}.{}.{}",
            graphite_safe(&self.kafka_consumer_group),
            graphite_safe(&self.kafka_topic_prefix),
            graphite_safe(&self.kafka_channel),
        )
    }
}

/// Dots separate graphite nodes, so dots inside a node become dashes.
fn graphite_safe(s: &str) -> String {
    s.replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_YAML: &str = r#"
log-level: 2
timeseries-backend: dbats
timeseries-dbats-opts: "-p /data/dbats"
kafka-brokers: "broker1:9092,broker2:9092"
kafka-topic-prefix: tsk-production
kafka-channel: active.probing
kafka-consumer-group: tsk-proxy
kafka-offset: earliest
filter-prefix:
  - "darknet."
  - "active."
stats-interval: 30
stats-ts-backend: ascii
stats-ts-opts: ""
"#;

    const MINIMAL_YAML: &str = r#"
timeseries-backend: ascii
timeseries-dbats-opts: ""
kafka-brokers: "localhost:9092"
kafka-topic-prefix: tsk
kafka-channel: ch1
kafka-consumer-group: group
kafka-offset: latest
"#;

    #[test]
    fn test_parse_full() {
        let cfg = ProxyConfig::from_yaml(FULL_YAML).unwrap();
        assert_eq!(cfg.log_level, 2);
        assert_eq!(cfg.timeseries_backend, "dbats");
        assert_eq!(cfg.timeseries_opts, "-p /data/dbats");
        assert_eq!(cfg.kafka_brokers, "broker1:9092,broker2:9092");
        assert_eq!(cfg.filter_prefixes, vec!["darknet.", "active."]);
        assert_eq!(cfg.stats_interval, 30);
        assert!(cfg.stats_enabled());
        assert!(cfg.unknown_keys.is_empty());
    }

    #[test]
    fn test_parse_minimal_defaults() {
        let cfg = ProxyConfig::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(cfg.log_level, 0);
        assert!(cfg.filter_prefixes.is_empty());
        assert_eq!(cfg.stats_interval, 60);
        assert!(!cfg.stats_enabled());
    }

    #[test]
    fn test_missing_mandatory_key_is_named() {
        let yaml = MINIMAL_YAML.replace("kafka-brokers: \"localhost:9092\"\n", "");
        let err = ProxyConfig::from_yaml(&yaml).unwrap_err();
        assert_eq!(
            err.to_string(),
            "config option \"kafka-brokers\" not provided"
        );
    }

    #[test]
    fn test_every_mandatory_key_is_checked() {
        for key in [
            "timeseries-backend",
            "timeseries-dbats-opts",
            "kafka-brokers",
            "kafka-topic-prefix",
            "kafka-channel",
            "kafka-consumer-group",
            "kafka-offset",
        ] {
            let yaml: String = MINIMAL_YAML
                .lines()
                .filter(|l| !l.starts_with(key))
                .collect::<Vec<_>>()
                .join("\n");
            let err = ProxyConfig::from_yaml(&yaml).unwrap_err();
            assert!(matches!(err, ProxyError::MissingOption(k) if k == key));
        }
    }

    #[test]
    fn test_filter_prefix_scalar_form() {
        let yaml = format!("{MINIMAL_YAML}filter-prefix: \"only.\"\n");
        let cfg = ProxyConfig::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.filter_prefixes, vec!["only."]);
    }

    #[test]
    fn test_unknown_keys_are_collected() {
        let yaml = format!("{MINIMAL_YAML}frobnicate: yes\n");
        let cfg = ProxyConfig::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.unknown_keys, vec!["frobnicate"]);
    }

    #[test]
    fn test_log_level_range() {
        let yaml = format!("{MINIMAL_YAML}log-level: 3\n");
        assert!(ProxyConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_stats_keys_must_pair() {
        let yaml = format!("{MINIMAL_YAML}stats-ts-backend: ascii\n");
        assert!(ProxyConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_topic_and_group_composition() {
        let cfg = ProxyConfig::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(cfg.topic(), "tsk.ch1");
        assert_eq!(cfg.group_id(), "group.tsk.ch1");
    }

    #[test]
    fn test_stats_prefix_is_graphite_safe() {
        let cfg = ProxyConfig::from_yaml(FULL_YAML).unwrap();
        assert_eq!(
            cfg.stats_prefix(),
            "systems.services.tsk.tsk-proxy.tsk-production.active-probing"
        );
    }
}
