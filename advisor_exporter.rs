//! # Advisor Exporter - Service Limits Across the Fleet
//!
//! Polls the Trusted Advisor "service limits" checks of every known account,
//! keeps each account's answer for a few minutes and republishes the limits
//! and the current usage as Prometheus gauges.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           ADVISOR EXPORTER                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ ACCOUNT SOURCE → FLEET → ACCOUNT COLLECTOR → TTL CACHE → SINK → /metrics  │
//! │                                    ↓ (miss)                              │
//! │                     ADVISORY API → METADATA MAPPER                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded API usage**: one advisory poll per account every five minutes
//! - **Fleet fan-out**: every account is collected concurrently
//! - **Validate-then-trust**: positional metadata becomes typed records once
//! - **Best-effort scrapes**: a failing account never hides healthy ones
//!
//! `UpdateCollector` and `EventCollector` are also provided for embedders
//! that bring their own cluster sources. `build_registry` only registers the
//! Trusted Advisor collector.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry as PrometheusRegistry, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "advisor-exporter";

// ----------------------------------------------------------------------------
// Trusted Advisor
// ----------------------------------------------------------------------------

/// Category returned by Trusted Advisor for checks about service limits and usage.
pub const CATEGORY_SERVICE_LIMITS: &str = "service_limits";

/// Number of metadata fields a service-limit resource carries.
pub const RESOURCE_METADATA_LEN: usize = 6;

const INDEX_REGION: usize = 0;
const INDEX_SERVICE: usize = 1;
const INDEX_NAME: usize = 2;
const INDEX_LIMIT: usize = 3;
const INDEX_USAGE: usize = 4;

/// How long one account's advisory snapshot is served from memory.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);

/// Cache key namespace for advisory snapshots.
pub const SNAPSHOT_CACHE_PREFIX: &str = "__TrustedAdvisorCache__";

pub const DEFAULT_ADVISOR_LANGUAGE: &str = "en";

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

pub const DEFAULT_METRICS_PORT: u16 = 9090;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";

pub const HEALTH_PATH: &str = "/healthz";

pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 30;

/// Prefix for environment variable overrides (`ADVISOR_EXPORTER_SERVER__PATH`).
pub const ENV_PREFIX: &str = "ADVISOR_EXPORTER_";

// ----------------------------------------------------------------------------
// Labels & Dimensions
// ----------------------------------------------------------------------------

pub const LABEL_ACCOUNT_ID: &str = "account_id";
pub const LABEL_REGION: &str = "region";
pub const LABEL_SERVICE: &str = "service";
pub const LABEL_NAME: &str = "name";
pub const LABEL_CLUSTER_ID: &str = "cluster_id";
pub const LABEL_NODE_POOL_ID: &str = "node_pool_id";
pub const LABEL_INSTALLATION: &str = "installation";
pub const LABEL_COLLECTOR: &str = "collector";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Descriptors
// ----------------------------------------------------------------------------

/// Static description of one exported gauge family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricDescriptor {
    /// Metric name without namespace
    pub name: &'static str,
    /// Help text
    pub help: &'static str,
    /// Label names, in the order label values are supplied
    pub labels: &'static [&'static str],
}

impl MetricDescriptor {
    /// Fully qualified metric name under an optional namespace.
    pub fn fq_name(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => format!("{}_{}", ns, self.name),
            _ => self.name.to_string(),
        }
    }

    /// Prometheus options for this descriptor.
    pub fn opts(&self, namespace: Option<&str>) -> Opts {
        let opts = Opts::new(self.name, self.help);
        match namespace {
            Some(ns) if !ns.is_empty() => opts.namespace(ns),
            _ => opts,
        }
    }
}

pub static SERVICE_LIMIT: MetricDescriptor = MetricDescriptor {
    name: "service_limit",
    help: "Service limits as reported by Trusted Advisor.",
    labels: &[LABEL_ACCOUNT_ID, LABEL_REGION, LABEL_SERVICE, LABEL_NAME],
};

pub static SERVICE_USAGE: MetricDescriptor = MetricDescriptor {
    name: "service_usage",
    help: "Service usage as reported by Trusted Advisor.",
    labels: &[LABEL_ACCOUNT_ID, LABEL_REGION, LABEL_SERVICE, LABEL_NAME],
};

// ----------------------------------------------------------------------------
// 3.2 Samples
// ----------------------------------------------------------------------------

/// One gauge observation written to the metric sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub descriptor: &'static MetricDescriptor,
    pub value: f64,
    pub label_values: Vec<String>,
}

impl Sample {
    pub fn new(descriptor: &'static MetricDescriptor, value: f64, label_values: Vec<String>) -> Self {
        debug_assert_eq!(descriptor.labels.len(), label_values.len());
        Self {
            descriptor,
            value,
            label_values,
        }
    }

    /// Look up a label value by label name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.descriptor
            .labels
            .iter()
            .position(|label| *label == name)
            .and_then(|idx| self.label_values.get(idx))
            .map(String::as_str)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Advisory Records
// ----------------------------------------------------------------------------

/// A Trusted Advisor check description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryCheck {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub category: String,
}

impl AdvisoryCheck {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            category: category.into(),
        }
    }

    pub fn is_service_limit(&self) -> bool {
        self.category == CATEGORY_SERVICE_LIMITS
    }
}

/// Positional metadata of one flagged resource, as the provider sends it.
///
/// Service-limit checks use `[region, service, limit name, limit, usage, status]`.
/// Any field may be null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawResourceRecord {
    pub metadata: Vec<Option<String>>,
}

impl RawResourceRecord {
    pub fn new(metadata: Vec<Option<String>>) -> Self {
        Self { metadata }
    }

    /// Build a record from present/absent fields.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            metadata: fields.into_iter().map(|f| f.map(Into::into)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }
}

/// Validated limit/usage observation for one service limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimitRecord {
    pub region: String,
    pub service: String,
    pub limit_name: String,
    pub limit: i64,
    pub usage: i64,
}

impl ServiceLimitRecord {
    /// The limit and usage gauges of this record.
    pub fn metrics(&self, account_id: &str) -> [DerivedMetric; 2] {
        let metric = |kind, value: i64| DerivedMetric {
            account_id: account_id.to_string(),
            region: self.region.clone(),
            service: self.service.clone(),
            limit_name: self.limit_name.clone(),
            kind,
            value: value as f64,
        };
        [metric(MetricKind::Limit, self.limit), metric(MetricKind::Usage, self.usage)]
    }
}

// ----------------------------------------------------------------------------
// 3.4 Snapshots & Derived Metrics
// ----------------------------------------------------------------------------

/// Flagged resources of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub resources: Vec<ServiceLimitRecord>,
}

/// Everything one advisory poll of an account produced. This is the unit
/// stored in the snapshot cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub checks: Vec<CheckResult>,
}

impl AccountSnapshot {
    /// Build a snapshot. Checks are ordered by id so equal data encodes equally.
    pub fn new(account_id: impl Into<String>, mut checks: Vec<CheckResult>) -> Self {
        checks.sort_by(|a, b| a.check_id.cmp(&b.check_id));
        Self {
            account_id: account_id.into(),
            checks,
        }
    }

    pub fn empty(account_id: impl Into<String>) -> Self {
        Self::new(account_id, Vec::new())
    }

    pub fn resource_count(&self) -> usize {
        self.checks.iter().map(|c| c.resources.len()).sum()
    }

    /// Derive the gauges of every resource in the snapshot.
    pub fn metrics(&self) -> Vec<DerivedMetric> {
        self.checks
            .iter()
            .flat_map(|check| check.resources.iter())
            .flat_map(|resource| resource.metrics(&self.account_id))
            .collect()
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Which side of a service limit a gauge reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Limit,
    Usage,
}

impl MetricKind {
    pub fn descriptor(&self) -> &'static MetricDescriptor {
        match self {
            MetricKind::Limit => &SERVICE_LIMIT,
            MetricKind::Usage => &SERVICE_USAGE,
        }
    }
}

/// A limit or usage gauge derived from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetric {
    pub account_id: String,
    pub region: String,
    pub service: String,
    pub limit_name: String,
    pub kind: MetricKind,
    pub value: f64,
}

impl DerivedMetric {
    pub fn into_sample(self) -> Sample {
        Sample::new(
            self.kind.descriptor(),
            self.value,
            vec![self.account_id, self.region, self.service, self.limit_name],
        )
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Exporter Errors
// ----------------------------------------------------------------------------

/// Process-level error type. Subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Collector(e) => e.is_recoverable(),
            ExporterError::Prometheus(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Collector(e) => e.category(),
            ExporterError::Prometheus(_) => "prometheus",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading, validation and construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Record Errors
// ----------------------------------------------------------------------------

/// Shape violations in advisory resource metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("resource metadata has {fields} fields, expected {expected}")]
    Malformed { fields: usize, expected: usize },

    #[error("resource metadata carries no limit")]
    MissingLimit,

    #[error("resource metadata carries no usage")]
    MissingUsage,

    #[error("{field} '{value}' is not an integer")]
    NumericParse { field: &'static str, value: String },
}

// ----------------------------------------------------------------------------
// 4.4 Advisory API Errors
// ----------------------------------------------------------------------------

/// Failures reported by the advisory API or the account source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvisorError {
    #[error("support plan does not include Trusted Advisor")]
    UnsupportedPlan,

    #[error("{operation} failed: {message}")]
    Transport { operation: &'static str, message: String },

    #[error("invalid response from {operation}: {message}")]
    InvalidResponse { operation: &'static str, message: String },
}

impl AdvisorError {
    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        AdvisorError::Transport {
            operation,
            message: message.into(),
        }
    }

    pub fn is_unsupported_plan(&self) -> bool {
        matches!(self, AdvisorError::UnsupportedPlan)
    }
}

/// Failure of a non-advisory collaborator (node pool or event listing).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Task Errors
// ----------------------------------------------------------------------------

/// Why a task of a [`TaskGroup`] produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl From<JoinError> for TaskFailure {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            return TaskFailure::Cancelled;
        }
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        TaskFailure::Panicked(message)
    }
}

// ----------------------------------------------------------------------------
// 4.6 Collector Errors
// ----------------------------------------------------------------------------

/// Errors returned by a collector's collection cycle.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("account {account_id}, check {check_id}: {source}")]
    Record {
        account_id: String,
        check_id: String,
        #[source]
        source: RecordError,
    },

    #[error("account {account_id}: {source}")]
    Advisor {
        account_id: String,
        #[source]
        source: AdvisorError,
    },

    #[error("account discovery failed: {0}")]
    Discovery(#[source] AdvisorError),

    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Task(#[from] TaskFailure),

    #[error("{collector} source failed: {source}")]
    Source {
        collector: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("node pool {node_pool_id}: invalid {annotation} '{value}'")]
    InvalidAnnotation {
        node_pool_id: String,
        annotation: &'static str,
        value: String,
    },

    #[error("expected one cluster with id {cluster_id}, found {found}")]
    ClusterNotFound { cluster_id: String, found: usize },

    #[error("collection did not finish within {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::Record { .. } => false,
            CollectorError::InvalidAnnotation { .. } => false,
            CollectorError::Codec(_) => false,
            CollectorError::Task(TaskFailure::Panicked(_)) => false,
            _ => true,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            CollectorError::Record { .. } => "record",
            CollectorError::Advisor { .. } => "advisor",
            CollectorError::Discovery(_) => "discovery",
            CollectorError::Codec(_) => "codec",
            CollectorError::Task(_) => "task",
            CollectorError::Source { .. } => "source",
            CollectorError::InvalidAnnotation { .. } => "annotation",
            CollectorError::ClusterNotFound { .. } => "not_found",
            CollectorError::Timeout { .. } => "timeout",
        }
    }

    /// The record violation behind this error, if any.
    pub fn record_error(&self) -> Option<&RecordError> {
        match self {
            CollectorError::Record { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

pub type ExporterResult<T> = Result<T, ExporterError>;

pub type CollectorResult<T> = Result<T, CollectorError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration of the exporter process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Process identity and metric naming
    #[serde(default)]
    pub exporter: GeneralConfig,

    /// Scrape endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Trusted Advisor collection
    #[serde(default)]
    pub advisor: AdvisorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from a TOML file, overlaid with `ADVISOR_EXPORTER_`
    /// environment variables, then validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: ExporterConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: ExporterConfig = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The default configuration rendered as TOML.
    pub fn generate_default() -> Result<String, ConfigError> {
        toml::to_string_pretty(&ExporterConfig::default()).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.exporter.validate()?;
        self.server.validate()?;
        self.advisor.validate()?;
        self.logging.validate()?;

        // An account fetch is a check listing followed by the check results.
        if self.advisor.enabled && self.server.scrape_timeout <= self.advisor.request_timeout * 2 {
            return Err(ConfigError::invalid_value(
                "server.scrape_timeout",
                format!(
                    "{} must exceed twice advisor.request_timeout ({})",
                    humantime::format_duration(self.server.scrape_timeout),
                    humantime::format_duration(self.advisor.request_timeout)
                ),
            ));
        }
        Ok(())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.exporter.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Prefix for every exported metric name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            namespace: None,
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "exporter.instance_name",
                "must not be empty",
            ));
        }
        if let Some(ns) = self.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            if !is_valid_metric_name(ns) {
                return Err(ConfigError::invalid_value(
                    "exporter.namespace",
                    format!("'{}' is not a valid metric name prefix", ns),
                ));
            }
        }
        Ok(())
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

// ----------------------------------------------------------------------------
// 5.3 Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,

    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Upper bound for one scrape, including every collector
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            path: default_metrics_path(),
            scrape_timeout: default_scrape_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::invalid_value("server.address", e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid_value("server.path", "must start with '/'"));
        }
        if self.path == HEALTH_PATH {
            return Err(ConfigError::invalid_value(
                "server.path",
                format!("'{}' is reserved for health checks", HEALTH_PATH),
            ));
        }
        if self.scrape_timeout.is_zero() {
            return Err(ConfigError::invalid_value("server.scrape_timeout", "must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.4 Advisor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Language requested for check descriptions
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            language: default_language(),
            request_timeout: default_request_timeout(),
            accounts: Vec::new(),
        }
    }
}

impl AdvisorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.language.trim().is_empty() {
            return Err(ConfigError::invalid_value("advisor.language", "must not be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid_value("advisor.request_timeout", "must be non-zero"));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !seen.insert(account.account_id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "advisor.accounts",
                    format!("account {} is listed more than once", account.account_id),
                ));
            }
        }
        Ok(())
    }
}

/// One monitored account and the endpoint its advisory requests go to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,

    /// Signing proxy or API endpoint for this account
    pub endpoint: String,

    /// Extra headers sent with every advisory request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AccountConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.account_id.len() != 12 || !self.account_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::invalid_value(
                "advisor.accounts.account_id",
                format!("'{}' is not a 12-digit account id", self.account_id),
            ));
        }
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::invalid_value(
                format!("advisor.accounts[{}].endpoint", self.account_id),
                e.to_string(),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid_value(
                format!("advisor.accounts[{}].endpoint", self.account_id),
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, pretty, compact
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.level),
            ));
        }
        if !matches!(self.format.as_str(), "json" | "pretty" | "compact") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}'", self.format),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.6 Default Value Functions
// ----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_instance_name() -> String {
    EXPORTER_NAME.to_string()
}
fn default_server_address() -> String {
    format!("0.0.0.0:{}", DEFAULT_METRICS_PORT)
}
fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}
fn default_scrape_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS)
}
fn default_language() -> String {
    DEFAULT_ADVISOR_LANGUAGE.to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// SECTION 6: LOGGING INITIALIZATION
// ============================================================================

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level = config
        .level
        .parse::<tracing::Level>()
        .map_err(|_| ConfigError::invalid_value("logging.level", config.level.clone()))?;

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from_level(level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_target(true),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_target(true),
            )
            .try_init(),
    };

    installed.map_err(|e| ExporterError::Internal(format!("failed to install logger: {}", e)))?;

    info!(
        target: "advisor_exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TTL CACHE
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Generic Cache
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: quanta::Instant,
}

/// String-keyed byte cache with per-entry expiry.
///
/// Expired entries are treated as absent and dropped when read; there is no
/// background sweep and no size bound. Distinct keys live in different
/// shards and do not contend.
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    clock: quanta::Clock,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::with_clock(quanta::Clock::new())
    }

    /// Cache reading time from `clock`. Tests pass `quanta::Clock::mock()`.
    pub fn with_clock(clock: quanta::Clock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-checked under the shard lock so a concurrent set survives.
            self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
            trace!(target: "advisor_exporter::cache", key = key, "Dropped expired entry");
        }
        None
    }

    /// Store `value` under `key`, replacing any previous entry and its expiry.
    pub fn set(&self, key: impl Into<String>, value: Bytes, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries.insert(key.into(), CacheEntry { value, expires_at });
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TtlCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache").field("entries", &self.entries.len()).finish()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Snapshot Cache
// ----------------------------------------------------------------------------

/// Typed view over a [`TtlCache`] holding one JSON snapshot per account.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    cache: Arc<TtlCache>,
}

impl SnapshotCache {
    pub fn new(cache: Arc<TtlCache>) -> Self {
        Self { cache }
    }

    pub fn key(account_id: &str) -> String {
        format!("{}{}", SNAPSHOT_CACHE_PREFIX, account_id)
    }

    /// Cached snapshot for `account_id`. An entry that no longer decodes is
    /// dropped and reported as a miss.
    pub fn get(&self, account_id: &str) -> Option<AccountSnapshot> {
        let key = Self::key(account_id);
        let raw = self.cache.get(&key)?;
        match AccountSnapshot::decode(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(
                    target: "advisor_exporter::cache",
                    account_id = account_id,
                    error = %e,
                    "Discarding undecodable snapshot"
                );
                self.cache.remove(&key);
                None
            }
        }
    }

    pub fn set(&self, snapshot: &AccountSnapshot) -> Result<(), serde_json::Error> {
        let raw = snapshot.encode()?;
        self.cache.set(Self::key(&snapshot.account_id), raw, SNAPSHOT_TTL);
        Ok(())
    }

    pub fn inner(&self) -> &Arc<TtlCache> {
        &self.cache
    }
}

// ============================================================================
// SECTION 8: METADATA MAPPER
// ============================================================================

/// Validate one flagged resource of a service-limit check.
///
/// Returns `Ok(None)` when the provider sent no usage for the resource; such
/// records are skipped without error.
pub fn map_resource(record: &RawResourceRecord) -> Result<Option<ServiceLimitRecord>, RecordError> {
    let fields = &record.metadata;
    if fields.len() != RESOURCE_METADATA_LEN {
        return Err(RecordError::Malformed {
            fields: fields.len(),
            expected: RESOURCE_METADATA_LEN,
        });
    }

    if fields[INDEX_USAGE].is_none() {
        return Ok(None);
    }

    let (limit, usage) = parse_limit_usage(fields[INDEX_LIMIT].as_deref(), fields[INDEX_USAGE].as_deref())?;
    let label = |idx: usize| fields[idx].clone().unwrap_or_default();

    Ok(Some(ServiceLimitRecord {
        region: label(INDEX_REGION),
        service: label(INDEX_SERVICE),
        limit_name: label(INDEX_NAME),
        limit,
        usage,
    }))
}

/// Parse the limit and usage fields of a resource. Present values must be
/// integers; an empty string is a parse failure, not an absent value.
pub fn parse_limit_usage(limit: Option<&str>, usage: Option<&str>) -> Result<(i64, i64), RecordError> {
    let limit = limit.ok_or(RecordError::MissingLimit)?;
    let usage = usage.ok_or(RecordError::MissingUsage)?;
    Ok((parse_count("limit", limit)?, parse_count("usage", usage)?))
}

/// Map every record of a check. The first invalid record fails the check.
pub fn map_resources(records: &[RawResourceRecord]) -> Result<Vec<ServiceLimitRecord>, RecordError> {
    records
        .iter()
        .filter_map(|record| map_resource(record).transpose())
        .collect()
}

fn parse_count(field: &'static str, raw: &str) -> Result<i64, RecordError> {
    raw.parse::<i64>().map_err(|_| RecordError::NumericParse {
        field,
        value: raw.to_string(),
    })
}

// ============================================================================
// SECTION 9: TASK GROUPS
// ============================================================================

/// What a [`TaskGroup`] does when one of its tasks fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Cancel the remaining tasks and return the first error
    FailFast,
    /// Let every task finish, then return the first error
    WaitAll,
}

/// A set of tasks that cannot outlive the group.
///
/// Every task races a cancellation token; cancelling the group (or its
/// parent token) resolves unfinished tasks with [`TaskFailure::Cancelled`].
/// Dropping the group cancels and aborts whatever is still running.
pub struct TaskGroup<T, E> {
    tasks: JoinSet<Result<T, E>>,
    token: CancellationToken,
    policy: FailurePolicy,
}

impl<T, E> TaskGroup<T, E>
where
    T: Send + 'static,
    E: From<TaskFailure> + Send + 'static,
{
    pub fn new(policy: FailurePolicy) -> Self {
        Self::with_token(CancellationToken::new(), policy)
    }

    /// A group that is cancelled together with `parent`.
    pub fn child_of(parent: &CancellationToken, policy: FailurePolicy) -> Self {
        Self::with_token(parent.child_token(), policy)
    }

    fn with_token(token: CancellationToken, policy: FailurePolicy) -> Self {
        Self {
            tasks: JoinSet::new(),
            token,
            policy,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = self.token.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(E::from(TaskFailure::Cancelled)),
                result = task => result,
            }
        });
    }

    /// Wait for the group according to its policy. Results arrive in
    /// completion order.
    pub async fn join(mut self) -> Result<Vec<T>, E> {
        let mut values = Vec::with_capacity(self.tasks.len());
        let mut first_error: Option<E> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined
                .map_err(TaskFailure::from)
                .map_err(E::from)
                .and_then(|result| result);

            match outcome {
                Ok(value) => values.push(value),
                Err(e) => match self.policy {
                    FailurePolicy::FailFast => {
                        self.token.cancel();
                        self.tasks.abort_all();
                        return Err(e);
                    }
                    FailurePolicy::WaitAll => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

impl<T, E> Drop for TaskGroup<T, E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<T, E> Debug for TaskGroup<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.tasks.len())
            .field("policy", &self.policy)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

// ============================================================================
// SECTION 10: ADVISORY API CONTRACTS
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Client & Account Traits
// ----------------------------------------------------------------------------

/// Per-account access to the advisory API.
#[async_trait]
pub trait AdvisoryClient: Send + Sync {
    /// Every check available to the account.
    ///
    /// Accounts whose support plan lacks Trusted Advisor fail with
    /// [`AdvisorError::UnsupportedPlan`].
    async fn describe_checks(&self) -> Result<Vec<AdvisoryCheck>, AdvisorError>;

    /// Flagged resources of one check.
    async fn describe_check_resources(&self, check_id: &str) -> Result<Vec<RawResourceRecord>, AdvisorError>;
}

/// An account and the client that speaks for it.
#[derive(Clone)]
pub struct AccountHandle {
    pub account_id: String,
    pub client: Arc<dyn AdvisoryClient>,
}

impl AccountHandle {
    pub fn new(account_id: impl Into<String>, client: Arc<dyn AdvisoryClient>) -> Self {
        Self {
            account_id: account_id.into(),
            client,
        }
    }
}

impl Debug for AccountHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Enumerates the accounts to collect.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<AccountHandle>, AdvisorError>;
}

// ----------------------------------------------------------------------------
// 10.2 Static Account Source
// ----------------------------------------------------------------------------

/// Fixed account list, usually built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountSource {
    accounts: Vec<AccountHandle>,
}

impl StaticAccountSource {
    pub fn new(accounts: Vec<AccountHandle>) -> Self {
        Self { accounts }
    }

    /// One HTTP client per configured account.
    pub fn from_config(config: &AdvisorConfig) -> Result<Self, ConfigError> {
        let accounts = config
            .accounts
            .iter()
            .map(|account| {
                let client = HttpAdvisoryClient::new(account, &config.language, config.request_timeout)?;
                Ok(AccountHandle::new(account.account_id.clone(), Arc::new(client)))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { accounts })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl AccountSource for StaticAccountSource {
    async fn list_accounts(&self) -> Result<Vec<AccountHandle>, AdvisorError> {
        Ok(self.accounts.clone())
    }
}

// ----------------------------------------------------------------------------
// 10.3 HTTP Advisory Client
// ----------------------------------------------------------------------------

const SUPPORT_API_TARGET: &str = "AWSSupport_20130415";
const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const UNSUPPORTED_PLAN_FAULT: &str = "SubscriptionRequiredException";

const OP_DESCRIBE_CHECKS: &str = "DescribeTrustedAdvisorChecks";
const OP_DESCRIBE_CHECK_RESULT: &str = "DescribeTrustedAdvisorCheckResult";

/// Advisory client speaking the Support API JSON protocol.
///
/// Requests are sent unsigned to `endpoint`, which is expected to be a
/// signing proxy holding the account's credentials.
#[derive(Debug, Clone)]
pub struct HttpAdvisoryClient {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    language: String,
}

#[derive(Debug, Deserialize)]
struct DescribeChecksOutput {
    #[serde(default)]
    checks: Vec<AdvisoryCheck>,
}

#[derive(Debug, Deserialize)]
struct DescribeCheckResultOutput {
    result: Option<CheckResultPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckResultPayload {
    #[serde(default)]
    flagged_resources: Vec<FlaggedResource>,
}

#[derive(Debug, Deserialize)]
struct FlaggedResource {
    #[serde(default)]
    metadata: Vec<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceFault {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default, alias = "Message")]
    message: String,
}

impl ServiceFault {
    /// Fault types arrive either bare or as `namespace#Name`.
    fn is(&self, name: &str) -> bool {
        self.kind.rsplit('#').next() == Some(name)
    }
}

impl HttpAdvisoryClient {
    pub fn new(account: &AccountConfig, language: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let field = |name: &str| format!("advisor.accounts[{}].{}", account.account_id, name);

        let endpoint = reqwest::Url::parse(&account.endpoint)
            .map_err(|e| ConfigError::invalid_value(field("endpoint"), e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &account.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::invalid_value(field("headers"), e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::invalid_value(field("headers"), e.to_string()))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(format!("{}/{}", EXPORTER_NAME, EXPORTER_VERSION))
            .build()
            .map_err(|e| ConfigError::invalid_value(field("endpoint"), e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            language: language.to_string(),
        })
    }

    async fn call<R: DeserializeOwned>(&self, operation: &'static str, body: serde_json::Value) -> Result<R, AdvisorError> {
        let payload = serde_json::to_vec(&body)
            .map_err(|e| AdvisorError::transport(operation, e.to_string()))?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-Amz-Target", format!("{}.{}", SUPPORT_API_TARGET, operation))
            .header(reqwest::header::CONTENT_TYPE, AMZ_JSON_CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .map_err(|e| AdvisorError::transport(operation, e.to_string()))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| AdvisorError::transport(operation, e.to_string()))?;

        if !status.is_success() {
            let fault: ServiceFault = serde_json::from_slice(&raw).unwrap_or_default();
            if fault.is(UNSUPPORTED_PLAN_FAULT) {
                return Err(AdvisorError::UnsupportedPlan);
            }
            return Err(AdvisorError::transport(
                operation,
                format!("HTTP {} {} {}", status.as_u16(), fault.kind, fault.message)
                    .trim_end()
                    .to_string(),
            ));
        }

        serde_json::from_slice(&raw).map_err(|e| AdvisorError::InvalidResponse {
            operation,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl AdvisoryClient for HttpAdvisoryClient {
    async fn describe_checks(&self) -> Result<Vec<AdvisoryCheck>, AdvisorError> {
        let output: DescribeChecksOutput = self
            .call(OP_DESCRIBE_CHECKS, serde_json::json!({ "language": self.language }))
            .await?;
        Ok(output.checks)
    }

    async fn describe_check_resources(&self, check_id: &str) -> Result<Vec<RawResourceRecord>, AdvisorError> {
        let output: DescribeCheckResultOutput = self
            .call(
                OP_DESCRIBE_CHECK_RESULT,
                serde_json::json!({ "checkId": check_id, "language": self.language }),
            )
            .await?;
        Ok(output
            .result
            .map(|result| {
                result
                    .flagged_resources
                    .into_iter()
                    .map(|resource| RawResourceRecord::new(resource.metadata))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// SECTION 11: METRIC SINK & COLLECTOR TRAIT
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Sink
// ----------------------------------------------------------------------------

/// Multi-producer handle collectors write samples to.
#[derive(Debug, Clone)]
pub struct MetricSink {
    sender: flume::Sender<Sample>,
}

/// Receiving end of a [`MetricSink`].
#[derive(Debug)]
pub struct SampleReceiver {
    receiver: flume::Receiver<Sample>,
}

/// Create a connected sink/receiver pair.
pub fn metric_channel() -> (MetricSink, SampleReceiver) {
    let (sender, receiver) = flume::unbounded();
    (MetricSink { sender }, SampleReceiver { receiver })
}

impl MetricSink {
    /// Send one sample. Returns false once the receiver is gone.
    pub fn emit(&self, sample: Sample) -> bool {
        self.sender.send(sample).is_ok()
    }
}

impl SampleReceiver {
    /// Every sample sent so far.
    pub fn drain(&self) -> Vec<Sample> {
        self.receiver.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 11.2 Collector Trait
// ----------------------------------------------------------------------------

/// A source of gauges, scraped once per request.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    fn name(&self) -> &str;

    /// Every descriptor this collector may emit.
    fn describe(&self) -> Vec<&'static MetricDescriptor>;

    async fn collect(&self, sink: &MetricSink) -> CollectorResult<()>;

    /// Register long-lived instrumentation with the exporter registry.
    fn register_self_metrics(&self, _registry: &PrometheusRegistry) -> prometheus::Result<()> {
        Ok(())
    }
}

// ============================================================================
// SECTION 12: TRUSTED ADVISOR COLLECTOR
// ============================================================================

pub const TRUSTED_ADVISOR_COLLECTOR: &str = "trusted_advisor";

// ----------------------------------------------------------------------------
// 12.1 API Telemetry
// ----------------------------------------------------------------------------

/// Latency histograms of advisory API calls.
#[derive(Debug, Clone)]
pub struct AdvisorTelemetry {
    get_checks_duration: Histogram,
    get_resources_duration: Histogram,
}

impl AdvisorTelemetry {
    pub fn new(namespace: Option<&str>) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| {
            let opts = HistogramOpts::new(name, help);
            match namespace {
                Some(ns) if !ns.is_empty() => opts.namespace(ns),
                _ => opts,
            }
        };

        Ok(Self {
            get_checks_duration: Histogram::with_opts(opts(
                "trusted_advisor_get_checks_duration",
                "Histogram for the duration of Trusted Advisor get checks calls.",
            ))?,
            get_resources_duration: Histogram::with_opts(opts(
                "trusted_advisor_get_resources_duration",
                "Histogram for the duration of Trusted Advisor get resources calls.",
            ))?,
        })
    }

    pub fn register(&self, registry: &PrometheusRegistry) -> prometheus::Result<()> {
        registry.register(Box::new(self.get_checks_duration.clone()))?;
        registry.register(Box::new(self.get_resources_duration.clone()))?;
        Ok(())
    }

    pub fn checks_observed(&self) -> u64 {
        self.get_checks_duration.get_sample_count()
    }

    pub fn resources_observed(&self) -> u64 {
        self.get_resources_duration.get_sample_count()
    }
}

// ----------------------------------------------------------------------------
// 12.2 Account Collector
// ----------------------------------------------------------------------------

/// Collects one account through the snapshot cache.
#[derive(Debug, Clone)]
pub struct AccountCollector {
    cache: SnapshotCache,
    telemetry: AdvisorTelemetry,
}

impl AccountCollector {
    pub fn new(cache: SnapshotCache, telemetry: AdvisorTelemetry) -> Self {
        Self { cache, telemetry }
    }

    /// Emit the limit and usage gauges of `account`, polling the advisory
    /// API only when no snapshot is cached. Returns the number of samples
    /// emitted.
    pub async fn collect(
        &self,
        account: &AccountHandle,
        sink: &MetricSink,
        cancel: &CancellationToken,
    ) -> CollectorResult<usize> {
        let snapshot = match self.cache.get(&account.account_id) {
            Some(snapshot) => {
                debug!(
                    target: "advisor_exporter::collector::trusted_advisor",
                    account_id = %account.account_id,
                    "Snapshot cache hit"
                );
                snapshot
            }
            None => {
                debug!(
                    target: "advisor_exporter::collector::trusted_advisor",
                    account_id = %account.account_id,
                    "Snapshot cache miss, polling advisory API"
                );
                let snapshot = self.fetch_snapshot(account, cancel).await?;
                self.cache.set(&snapshot)?;
                snapshot
            }
        };

        let mut emitted = 0;
        for metric in snapshot.metrics() {
            if sink.emit(metric.into_sample()) {
                emitted += 1;
            }
        }

        Ok(emitted)
    }

    async fn fetch_snapshot(&self, account: &AccountHandle, cancel: &CancellationToken) -> CollectorResult<AccountSnapshot> {
        let timer = self.telemetry.get_checks_duration.start_timer();
        let checks = account.client.describe_checks().await;
        timer.observe_duration();

        let checks = match checks {
            Ok(checks) => checks,
            Err(AdvisorError::UnsupportedPlan) => {
                info!(
                    target: "advisor_exporter::collector::trusted_advisor",
                    account_id = %account.account_id,
                    "Support plan excludes Trusted Advisor, account has no service limits"
                );
                return Ok(AccountSnapshot::empty(account.account_id.clone()));
            }
            Err(source) => {
                return Err(CollectorError::Advisor {
                    account_id: account.account_id.clone(),
                    source,
                })
            }
        };

        let mut group: TaskGroup<CheckResult, CollectorError> =
            TaskGroup::child_of(cancel, FailurePolicy::FailFast);
        for check in checks.into_iter().filter(AdvisoryCheck::is_service_limit) {
            let client = Arc::clone(&account.client);
            let account_id = account.account_id.clone();
            let histogram = self.telemetry.get_resources_duration.clone();

            group.spawn(async move {
                let timer = histogram.start_timer();
                let raw = client.describe_check_resources(&check.id).await;
                timer.observe_duration();

                let raw = raw.map_err(|source| CollectorError::Advisor {
                    account_id: account_id.clone(),
                    source,
                })?;
                let resources = map_resources(&raw).map_err(|source| CollectorError::Record {
                    account_id,
                    check_id: check.id.clone(),
                    source,
                })?;

                Ok(CheckResult {
                    check_id: check.id,
                    resources,
                })
            });
        }

        let checks = group.join().await?;
        let snapshot = AccountSnapshot::new(account.account_id.clone(), checks);
        debug!(
            target: "advisor_exporter::collector::trusted_advisor",
            account_id = %snapshot.account_id,
            checks = snapshot.checks.len(),
            resources = snapshot.resource_count(),
            "Built account snapshot"
        );
        Ok(snapshot)
    }
}

// ----------------------------------------------------------------------------
// 12.3 Fleet Collector
// ----------------------------------------------------------------------------

/// Collects service limits of every account the source lists.
pub struct TrustedAdvisorCollector {
    accounts: Arc<dyn AccountSource>,
    account_collector: AccountCollector,
}

impl TrustedAdvisorCollector {
    pub fn builder() -> TrustedAdvisorCollectorBuilder {
        TrustedAdvisorCollectorBuilder::default()
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        self.account_collector.cache.inner()
    }

    pub fn telemetry(&self) -> &AdvisorTelemetry {
        &self.account_collector.telemetry
    }

    /// One collection cycle across the fleet.
    ///
    /// Accounts are collected concurrently. A failing account does not stop
    /// the others; their samples are emitted and the first failure is
    /// returned once every account has finished.
    pub async fn collect_fleet(&self, sink: &MetricSink) -> CollectorResult<usize> {
        let started = Instant::now();
        let accounts = self
            .accounts
            .list_accounts()
            .await
            .map_err(CollectorError::Discovery)?;

        let mut group: TaskGroup<usize, CollectorError> = TaskGroup::new(FailurePolicy::WaitAll);
        let token = group.token().clone();

        for account in accounts {
            let collector = self.account_collector.clone();
            let sink = sink.clone();
            let token = token.clone();

            group.spawn(async move {
                let result = collector.collect(&account, &sink, &token).await;
                if let Err(e) = &result {
                    warn!(
                        target: "advisor_exporter::collector::trusted_advisor",
                        account_id = %account.account_id,
                        category = e.category(),
                        error = %e,
                        "Account collection failed"
                    );
                }
                result
            });
        }

        let account_count = group.len();
        let emitted: usize = group.join().await?.into_iter().sum();

        debug!(
            target: "advisor_exporter::collector::trusted_advisor",
            accounts = account_count,
            samples = emitted,
            duration_ms = started.elapsed().as_millis() as u64,
            "Fleet collection complete"
        );

        Ok(emitted)
    }
}

impl Debug for TrustedAdvisorCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedAdvisorCollector")
            .field("account_collector", &self.account_collector)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MetricsCollector for TrustedAdvisorCollector {
    fn name(&self) -> &str {
        TRUSTED_ADVISOR_COLLECTOR
    }

    fn describe(&self) -> Vec<&'static MetricDescriptor> {
        vec![&SERVICE_LIMIT, &SERVICE_USAGE]
    }

    async fn collect(&self, sink: &MetricSink) -> CollectorResult<()> {
        self.collect_fleet(sink).await.map(|_| ())
    }

    fn register_self_metrics(&self, registry: &PrometheusRegistry) -> prometheus::Result<()> {
        self.account_collector.telemetry.register(registry)
    }
}

// ----------------------------------------------------------------------------
// 12.4 Builder
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct TrustedAdvisorCollectorBuilder {
    accounts: Option<Arc<dyn AccountSource>>,
    cache: Option<Arc<TtlCache>>,
    namespace: Option<String>,
}

impl TrustedAdvisorCollectorBuilder {
    pub fn accounts(mut self, accounts: Arc<dyn AccountSource>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Share an existing cache. A fresh one is created otherwise.
    pub fn cache(mut self, cache: Arc<TtlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn build(self) -> Result<TrustedAdvisorCollector, ConfigError> {
        let accounts = self.accounts.ok_or_else(|| ConfigError::missing_field("accounts"))?;
        let cache = self.cache.unwrap_or_default();
        let telemetry = AdvisorTelemetry::new(self.namespace.as_deref())
            .map_err(|e| ConfigError::invalid_value("exporter.namespace", e.to_string()))?;

        Ok(TrustedAdvisorCollector {
            accounts,
            account_collector: AccountCollector::new(SnapshotCache::new(cache), telemetry),
        })
    }
}

impl Debug for TrustedAdvisorCollectorBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedAdvisorCollectorBuilder")
            .field("accounts", &self.accounts.is_some())
            .field("cache", &self.cache)
            .field("namespace", &self.namespace)
            .finish()
    }
}

// ============================================================================
// SECTION 13: NODE POOL UPDATE COLLECTOR
// ============================================================================

// Library entry point for embedders that supply a `NodePoolSource`. The
// `advisor-exporter` binary has no node pool source and never registers it.

pub const UPDATE_COLLECTOR: &str = "node_pool_update";

pub const ANNOTATION_UPDATE_MAX_BATCH_SIZE: &str = "alpha.aws.giantswarm.io/update-max-batch-size";
pub const ANNOTATION_UPDATE_PAUSE_TIME: &str = "alpha.aws.giantswarm.io/update-pause-time";

pub const DEFAULT_UPDATE_MAX_BATCH_SIZE: &str = "0.3";
pub const DEFAULT_UPDATE_PAUSE_TIME: &str = "PT15M";

pub static UPDATE_MAX_BATCH_PERCENTAGE: MetricDescriptor = MetricDescriptor {
    name: "update_max_batch_percentage",
    help: "Gauge about the max batch percentage of nodes updated at once.",
    labels: &[LABEL_CLUSTER_ID, LABEL_NODE_POOL_ID],
};

pub static UPDATE_MAX_BATCH_NUMBER: MetricDescriptor = MetricDescriptor {
    name: "update_max_batch_number",
    help: "Gauge about the max number of nodes updated at once.",
    labels: &[LABEL_CLUSTER_ID, LABEL_NODE_POOL_ID],
};

pub static UPDATE_PAUSE_TIME: MetricDescriptor = MetricDescriptor {
    name: "update_pause_time",
    help: "Gauge about the pause time in seconds between node batch updates.",
    labels: &[LABEL_CLUSTER_ID, LABEL_NODE_POOL_ID],
};

/// A node pool as seen by the update collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePool {
    pub cluster_id: String,
    pub node_pool_id: String,
    pub annotations: HashMap<String, String>,
    pub scaling_min: u32,
    pub scaling_max: u32,
}

#[async_trait]
pub trait NodePoolSource: Send + Sync {
    async fn list_node_pools(&self) -> Result<Vec<NodePool>, SourceError>;

    /// Annotations of every cluster object matching `cluster_id`.
    async fn cluster_annotations(&self, cluster_id: &str) -> Result<Vec<HashMap<String, String>>, SourceError>;
}

/// Rolling update settings in effect for one node pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateSettings {
    pub batch_number: f64,
    pub batch_percentage: f64,
    pub pause_time_secs: f64,
}

/// Reports the rolling update settings of every node pool.
pub struct UpdateCollector {
    source: Arc<dyn NodePoolSource>,
}

impl UpdateCollector {
    pub fn new(source: Arc<dyn NodePoolSource>) -> Self {
        Self { source }
    }

    /// Settings of one node pool: its own annotations, then its cluster's,
    /// then the defaults.
    pub async fn settings_for(&self, pool: &NodePool) -> CollectorResult<UpdateSettings> {
        let (batch, pause) = self.update_annotations(pool).await?;
        let (batch_number, batch_percentage) = batch_settings(pool, &batch)?;
        let pause_time = parse_iso8601_duration(&pause).ok_or_else(|| CollectorError::InvalidAnnotation {
            node_pool_id: pool.node_pool_id.clone(),
            annotation: ANNOTATION_UPDATE_PAUSE_TIME,
            value: pause.clone(),
        })?;

        Ok(UpdateSettings {
            batch_number,
            batch_percentage,
            pause_time_secs: pause_time.as_secs_f64(),
        })
    }

    async fn update_annotations(&self, pool: &NodePool) -> CollectorResult<(String, String)> {
        let mut batch = non_empty(pool.annotations.get(ANNOTATION_UPDATE_MAX_BATCH_SIZE));
        let mut pause = non_empty(pool.annotations.get(ANNOTATION_UPDATE_PAUSE_TIME));

        if batch.is_none() || pause.is_none() {
            let clusters = self
                .source
                .cluster_annotations(&pool.cluster_id)
                .await
                .map_err(|source| CollectorError::Source {
                    collector: UPDATE_COLLECTOR,
                    source,
                })?;
            let cluster = match clusters.as_slice() {
                [cluster] => cluster,
                _ => {
                    return Err(CollectorError::ClusterNotFound {
                        cluster_id: pool.cluster_id.clone(),
                        found: clusters.len(),
                    })
                }
            };
            batch = batch.or_else(|| non_empty(cluster.get(ANNOTATION_UPDATE_MAX_BATCH_SIZE)));
            pause = pause.or_else(|| non_empty(cluster.get(ANNOTATION_UPDATE_PAUSE_TIME)));
        }

        Ok((
            batch.unwrap_or_else(|| DEFAULT_UPDATE_MAX_BATCH_SIZE.to_string()),
            pause.unwrap_or_else(|| DEFAULT_UPDATE_PAUSE_TIME.to_string()),
        ))
    }
}

impl Debug for UpdateCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCollector").finish_non_exhaustive()
    }
}

#[async_trait]
impl MetricsCollector for UpdateCollector {
    fn name(&self) -> &str {
        UPDATE_COLLECTOR
    }

    fn describe(&self) -> Vec<&'static MetricDescriptor> {
        vec![&UPDATE_MAX_BATCH_PERCENTAGE, &UPDATE_MAX_BATCH_NUMBER, &UPDATE_PAUSE_TIME]
    }

    async fn collect(&self, sink: &MetricSink) -> CollectorResult<()> {
        let pools = self
            .source
            .list_node_pools()
            .await
            .map_err(|source| CollectorError::Source {
                collector: UPDATE_COLLECTOR,
                source,
            })?;

        // Resolve every pool before emitting so a bad annotation publishes nothing.
        let mut resolved = Vec::with_capacity(pools.len());
        for pool in &pools {
            resolved.push((pool, self.settings_for(pool).await?));
        }

        for (pool, settings) in resolved {
            let labels = vec![pool.cluster_id.clone(), pool.node_pool_id.clone()];
            sink.emit(Sample::new(&UPDATE_MAX_BATCH_PERCENTAGE, settings.batch_percentage, labels.clone()));
            sink.emit(Sample::new(&UPDATE_MAX_BATCH_NUMBER, settings.batch_number, labels.clone()));
            sink.emit(Sample::new(&UPDATE_PAUSE_TIME, settings.pause_time_secs, labels));
        }

        trace!(target: "advisor_exporter::collector::update", node_pools = pools.len(), "Update settings emitted");
        Ok(())
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

/// Interpret a max batch size annotation as `(number, percentage)`.
///
/// Integers are absolute node counts, other non-negative numbers are a
/// fraction of the pool's maximum size.
pub fn batch_settings(pool: &NodePool, batch: &str) -> CollectorResult<(f64, f64)> {
    let max = f64::from(pool.scaling_max);
    let batch = batch.trim();

    if let Ok(count) = batch.parse::<u32>() {
        let percentage = if pool.scaling_max == 0 { 0.0 } else { f64::from(count) / max };
        return Ok((f64::from(count), percentage));
    }

    match batch.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0) {
        Some(fraction) => Ok((max * fraction, fraction)),
        None => Err(CollectorError::InvalidAnnotation {
            node_pool_id: pool.node_pool_id.clone(),
            annotation: ANNOTATION_UPDATE_MAX_BATCH_SIZE,
            value: batch.to_string(),
        }),
    }
}

/// Parse an ISO-8601 duration such as `PT15M`, `P1DT2H` or `PT1.5S`.
///
/// Years and months are rejected since their length is not fixed.
pub fn parse_iso8601_duration(input: &str) -> Option<Duration> {
    let rest = input.trim().strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((_, "")) => return None,
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    if date.is_empty() && time.is_none() {
        return None;
    }

    let mut secs = sum_components(date, &[('W', 604_800.0), ('D', 86_400.0)])?;
    if let Some(time) = time {
        secs += sum_components(time, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    }
    Some(Duration::from_secs_f64(secs))
}

// Units must appear in the given order, each at most once.
fn sum_components(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    let mut next_unit = 0;

    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            number.push(if ch == ',' { '.' } else { ch });
            continue;
        }
        let offset = units[next_unit..].iter().position(|(unit, _)| *unit == ch)?;
        let (_, factor) = units[next_unit + offset];
        let value: f64 = number.parse().ok()?;
        total += value * factor;
        number.clear();
        next_unit += offset + 1;
    }

    if number.is_empty() {
        Some(total)
    } else {
        None
    }
}

// ============================================================================
// SECTION 14: CLOUDFORMATION EVENT COLLECTOR
// ============================================================================

// Library entry point for embedders that supply an `EventSource`. The
// `advisor-exporter` binary has no event source and never registers it.

pub const EVENT_COLLECTOR: &str = "cloudformation_events";

pub const REASON_CREATE_FAILED: &str = "CFCreateFailed";
pub const REASON_DELETE_FAILED: &str = "CFDeleteFailed";
pub const REASON_UPDATE_ROLLBACK_FAILED: &str = "CFUpdateRollbackFailed";
pub const REASON_ROLLBACK_FAILED: &str = "CFRollbackFailed";

pub static CLOUDFORMATION_CREATION_FAILED: MetricDescriptor = MetricDescriptor {
    name: "cloudformation_creation_failed",
    help: "Number of failed CloudFormation stack creations.",
    labels: &[LABEL_INSTALLATION, LABEL_CLUSTER_ID],
};

pub static CLOUDFORMATION_DELETION_FAILED: MetricDescriptor = MetricDescriptor {
    name: "cloudformation_deletion_failed",
    help: "Number of failed CloudFormation stack deletions.",
    labels: &[LABEL_INSTALLATION, LABEL_CLUSTER_ID],
};

pub static CLOUDFORMATION_UPDATE_ROLLBACK_FAILED: MetricDescriptor = MetricDescriptor {
    name: "cloudformation_update_rollback_failed",
    help: "Number of failed CloudFormation stack update rollbacks.",
    labels: &[LABEL_INSTALLATION, LABEL_CLUSTER_ID],
};

pub static CLOUDFORMATION_ROLLBACK_FAILED: MetricDescriptor = MetricDescriptor {
    name: "cloudformation_rollback_failed",
    help: "Number of failed CloudFormation stack rollbacks.",
    labels: &[LABEL_INSTALLATION, LABEL_CLUSTER_ID],
};

static CLOUDFORMATION_FAILURES: [(&str, &MetricDescriptor); 4] = [
    (REASON_CREATE_FAILED, &CLOUDFORMATION_CREATION_FAILED),
    (REASON_DELETE_FAILED, &CLOUDFORMATION_DELETION_FAILED),
    (REASON_UPDATE_ROLLBACK_FAILED, &CLOUDFORMATION_UPDATE_ROLLBACK_FAILED),
    (REASON_ROLLBACK_FAILED, &CLOUDFORMATION_ROLLBACK_FAILED),
];

/// A cluster event, reduced to what failure counting needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub reason: String,
    /// Name of the cluster object the event is about
    pub involved_object: String,
}

impl ClusterEvent {
    pub fn new(reason: impl Into<String>, involved_object: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            involved_object: involved_object.into(),
        }
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_events(&self) -> Result<Vec<ClusterEvent>, SourceError>;
}

/// Counts CloudFormation failure events per cluster.
pub struct EventCollector {
    source: Arc<dyn EventSource>,
    installation: String,
}

impl EventCollector {
    pub fn new(source: Arc<dyn EventSource>, installation: impl Into<String>) -> Result<Self, ConfigError> {
        let installation = installation.into();
        if installation.trim().is_empty() {
            return Err(ConfigError::missing_field("installation"));
        }
        Ok(Self { source, installation })
    }
}

impl Debug for EventCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCollector")
            .field("installation", &self.installation)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MetricsCollector for EventCollector {
    fn name(&self) -> &str {
        EVENT_COLLECTOR
    }

    fn describe(&self) -> Vec<&'static MetricDescriptor> {
        CLOUDFORMATION_FAILURES.iter().map(|(_, descriptor)| *descriptor).collect()
    }

    async fn collect(&self, sink: &MetricSink) -> CollectorResult<()> {
        let events = self
            .source
            .list_events()
            .await
            .map_err(|source| CollectorError::Source {
                collector: EVENT_COLLECTOR,
                source,
            })?;

        for &(reason, descriptor) in CLOUDFORMATION_FAILURES.iter() {
            let mut per_cluster: BTreeMap<&str, u64> = BTreeMap::new();
            for event in events.iter().filter(|event| event.reason == reason) {
                *per_cluster.entry(event.involved_object.as_str()).or_default() += 1;
            }
            for (cluster, count) in per_cluster {
                sink.emit(Sample::new(
                    descriptor,
                    count as f64,
                    vec![self.installation.clone(), cluster.to_string()],
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 15: EXPORTER REGISTRY
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Collector Health
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorStatus {
    /// Not scraped yet
    Unknown,
    Healthy,
    Failed,
}

/// Outcome history of one collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub status: CollectorStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_duration_ms: u64,
}

impl Default for CollectorHealth {
    fn default() -> Self {
        Self {
            status: CollectorStatus::Unknown,
            last_success: None,
            last_failure: None,
            last_error: None,
            consecutive_failures: 0,
            last_duration_ms: 0,
        }
    }
}

impl CollectorHealth {
    fn record(&mut self, elapsed: Duration, error: Option<&CollectorError>) {
        let now = Utc::now();
        self.last_duration_ms = elapsed.as_millis() as u64;
        match error {
            None => {
                self.status = CollectorStatus::Healthy;
                self.last_success = Some(now);
                self.consecutive_failures = 0;
            }
            Some(e) => {
                self.status = CollectorStatus::Failed;
                self.last_failure = Some(now);
                self.last_error = Some(e.to_string());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 15.2 Scrape Report
// ----------------------------------------------------------------------------

/// Samples and failures of one scrape across all collectors.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub samples: Vec<Sample>,
    pub failures: Vec<(String, CollectorError)>,
}

impl ScrapeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Samples repeating the metric and label values of an earlier sample.
pub fn duplicate_series(samples: &[Sample]) -> Vec<&Sample> {
    let mut seen = HashSet::new();
    samples
        .iter()
        .filter(|sample| !seen.insert((sample.descriptor.name, sample.label_values.as_slice())))
        .collect()
}

// ----------------------------------------------------------------------------
// 15.3 Registry
// ----------------------------------------------------------------------------

/// Owns the registered collectors and the exporter's own metrics.
pub struct ExporterRegistry {
    collectors: Vec<Arc<dyn MetricsCollector>>,
    namespace: Option<String>,
    self_metrics: PrometheusRegistry,
    collector_failed: GaugeVec,
    scrape_duration: GaugeVec,
    health: RwLock<HashMap<String, CollectorHealth>>,
    scrape_timeout: Duration,
}

impl ExporterRegistry {
    pub fn new(namespace: Option<String>) -> ExporterResult<Self> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let opts = |name: &str, help: &str| {
            let opts = Opts::new(name, help);
            match namespace.as_deref() {
                Some(ns) => opts.namespace(ns),
                None => opts,
            }
        };

        let collector_failed = GaugeVec::new(
            opts("collector_failed", "Whether the last scrape of a collector failed."),
            &[LABEL_COLLECTOR],
        )?;
        let scrape_duration = GaugeVec::new(
            opts(
                "collector_scrape_duration_seconds",
                "Duration of the last scrape of a collector in seconds.",
            ),
            &[LABEL_COLLECTOR],
        )?;

        let self_metrics = PrometheusRegistry::new();
        self_metrics.register(Box::new(collector_failed.clone()))?;
        self_metrics.register(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            collectors: Vec::new(),
            namespace,
            self_metrics,
            collector_failed,
            scrape_duration,
            health: RwLock::new(HashMap::new()),
            scrape_timeout: Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS),
        })
    }

    /// Deadline applied to each collector on every scrape.
    pub fn with_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.scrape_timeout = timeout;
        self
    }

    pub fn scrape_timeout(&self) -> Duration {
        self.scrape_timeout
    }

    pub fn register(&mut self, collector: Arc<dyn MetricsCollector>) -> ExporterResult<()> {
        let name = collector.name().to_string();
        if self.health.read().contains_key(&name) {
            return Err(ExporterError::Internal(format!("collector {} registered twice", name)));
        }

        collector.register_self_metrics(&self.self_metrics)?;
        self.health.write().insert(name.clone(), CollectorHealth::default());
        self.collectors.push(collector);

        info!(target: "advisor_exporter::registry", collector = %name, "Registered collector");
        Ok(())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn collector_names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    /// Every descriptor of every registered collector, first one wins per name.
    pub fn describe(&self) -> Vec<&'static MetricDescriptor> {
        let mut seen = HashSet::new();
        self.collectors
            .iter()
            .flat_map(|c| c.describe())
            .filter(|descriptor| seen.insert(descriptor.name))
            .collect()
    }

    pub fn health(&self) -> HashMap<String, CollectorHealth> {
        self.health.read().clone()
    }

    /// Run every collector concurrently and gather what they emitted.
    ///
    /// A collector still running at the scrape timeout is abandoned and
    /// reported as failed. Samples it emitted before the deadline are kept,
    /// as is everything the other collectors emitted.
    pub async fn scrape(&self) -> ScrapeReport {
        let (sink, receiver) = metric_channel();
        let timeout = self.scrape_timeout;

        let runs = self.collectors.iter().map(|collector| {
            let sink = sink.clone();
            async move {
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, collector.collect(&sink))
                    .await
                    .unwrap_or(Err(CollectorError::Timeout { timeout }));
                (collector.name().to_string(), started.elapsed(), result)
            }
        });
        let outcomes = futures::future::join_all(runs).await;
        drop(sink);

        let mut failures = Vec::new();
        for (name, elapsed, result) in outcomes {
            self.record_outcome(&name, elapsed, result.as_ref().err());
            if let Err(e) = result {
                error!(
                    target: "advisor_exporter::registry",
                    collector = %name,
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Collector failed"
                );
                failures.push((name, e));
            }
        }

        ScrapeReport {
            samples: receiver.drain(),
            failures,
        }
    }

    fn record_outcome(&self, name: &str, elapsed: Duration, error: Option<&CollectorError>) {
        self.collector_failed
            .with_label_values(&[name])
            .set(if error.is_some() { 1.0 } else { 0.0 });
        self.scrape_duration.with_label_values(&[name]).set(elapsed.as_secs_f64());
        self.health
            .write()
            .entry(name.to_string())
            .or_default()
            .record(elapsed, error);
    }

    /// Encode `samples` and the exporter's own metrics in the text format.
    pub fn render(&self, samples: &[Sample]) -> ExporterResult<String> {
        let registry = PrometheusRegistry::new();
        let mut gauges: HashMap<&'static str, GaugeVec> = HashMap::new();
        for descriptor in self.describe() {
            let gauge = GaugeVec::new(descriptor.opts(self.namespace()), descriptor.labels)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(descriptor.name, gauge);
        }

        // A gauge holds one value per label set, so the last duplicate wins.
        for duplicate in duplicate_series(samples) {
            warn!(
                target: "advisor_exporter::registry",
                metric = duplicate.descriptor.name,
                labels = ?duplicate.label_values,
                "Duplicate series in scrape, keeping the last value"
            );
        }

        for sample in samples {
            let Some(gauge) = gauges.get(sample.descriptor.name) else {
                warn!(
                    target: "advisor_exporter::registry",
                    metric = sample.descriptor.name,
                    "Dropping sample of undescribed metric"
                );
                continue;
            };
            let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
            match gauge.get_metric_with_label_values(&values) {
                Ok(metric) => metric.set(sample.value),
                Err(e) => warn!(
                    target: "advisor_exporter::registry",
                    metric = sample.descriptor.name,
                    error = %e,
                    "Dropping sample with mismatched labels"
                ),
            }
        }

        let mut families = registry.gather();
        families.extend(self.self_metrics.gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExporterError::Internal(e.to_string()))
    }
}

impl Debug for ExporterRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterRegistry")
            .field("collectors", &self.collector_names())
            .field("namespace", &self.namespace)
            .field("scrape_timeout", &self.scrape_timeout)
            .finish_non_exhaustive()
    }
}

/// Build the registry a configuration describes.
pub fn build_registry(config: &ExporterConfig) -> ExporterResult<ExporterRegistry> {
    let namespace = config.namespace().map(str::to_string);
    let mut registry =
        ExporterRegistry::new(namespace.clone())?.with_scrape_timeout(config.server.scrape_timeout);

    if config.advisor.enabled {
        let accounts = StaticAccountSource::from_config(&config.advisor)?;
        if accounts.is_empty() {
            warn!(target: "advisor_exporter::registry", "Trusted Advisor enabled without accounts");
        }
        let collector = TrustedAdvisorCollector::builder()
            .accounts(Arc::new(accounts))
            .namespace(namespace)
            .build()?;
        registry.register(Arc::new(collector))?;
    }

    Ok(registry)
}

// ============================================================================
// SECTION 16: SCRAPE SERVER
// ============================================================================

#[derive(Clone)]
struct ServerState {
    registry: Arc<ExporterRegistry>,
}

/// HTTP routes: the metrics path and `/healthz`.
pub fn router(registry: Arc<ExporterRegistry>, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.path, get(metrics_handler))
        .route(HEALTH_PATH, get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { registry })
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    let report = state.registry.scrape().await;
    match state.registry.render(&report.samples) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(target: "advisor_exporter::server", error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<ServerState>) -> Json<HashMap<String, CollectorHealth>> {
    Json(state.registry.health())
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    registry: Arc<ExporterRegistry>,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> ExporterResult<()> {
    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        target: "advisor_exporter::server",
        address = %addr,
        path = %config.path,
        "Scrape server listening"
    );

    axum::serve(listener, router(registry, config))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(target: "advisor_exporter::server", "Scrape server stopped");
    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub const ACCOUNT_A: &str = "111111111111";
    pub const ACCOUNT_B: &str = "222222222222";
    pub const ACCOUNT_C: &str = "333333333333";

    pub fn limit_record(region: &str, service: &str, name: &str, limit: &str, usage: &str) -> RawResourceRecord {
        RawResourceRecord::from_fields([
            Some(region),
            Some(service),
            Some(name),
            Some(limit),
            Some(usage),
            Some("Green"),
        ])
    }

    /// Advisory client answering from fixed data and counting calls.
    #[derive(Default)]
    pub struct FakeAdvisor {
        pub checks: Vec<AdvisoryCheck>,
        pub resources: HashMap<String, Vec<RawResourceRecord>>,
        pub delays: HashMap<String, Duration>,
        pub checks_error: Option<AdvisorError>,
        pub check_calls: AtomicUsize,
        pub resource_calls: AtomicUsize,
    }

    impl FakeAdvisor {
        /// One service-limit check holding `records`, plus an unrelated check.
        pub fn with_limits(records: Vec<RawResourceRecord>) -> Self {
            let mut resources = HashMap::new();
            resources.insert("limits-ec2".to_string(), records);
            resources.insert(
                "security-groups".to_string(),
                vec![RawResourceRecord::from_fields([Some("open"), Some("sg-1")])],
            );
            Self {
                checks: vec![
                    AdvisoryCheck::new("limits-ec2", CATEGORY_SERVICE_LIMITS),
                    AdvisoryCheck::new("security-groups", "security"),
                ],
                resources,
                ..Default::default()
            }
        }

        pub fn failing(error: AdvisorError) -> Self {
            Self {
                checks_error: Some(error),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> (usize, usize) {
            (
                self.check_calls.load(Ordering::SeqCst),
                self.resource_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl AdvisoryClient for FakeAdvisor {
        async fn describe_checks(&self) -> Result<Vec<AdvisoryCheck>, AdvisorError> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            match &self.checks_error {
                Some(e) => Err(e.clone()),
                None => Ok(self.checks.clone()),
            }
        }

        async fn describe_check_resources(&self, check_id: &str) -> Result<Vec<RawResourceRecord>, AdvisorError> {
            self.resource_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(check_id) {
                tokio::time::sleep(*delay).await;
            }
            Ok(self.resources.get(check_id).cloned().unwrap_or_default())
        }
    }

    pub struct FakeAccounts {
        pub accounts: Vec<AccountHandle>,
        pub error: Option<AdvisorError>,
    }

    impl FakeAccounts {
        pub fn new(accounts: Vec<AccountHandle>) -> Self {
            Self { accounts, error: None }
        }
    }

    #[async_trait]
    impl AccountSource for FakeAccounts {
        async fn list_accounts(&self) -> Result<Vec<AccountHandle>, AdvisorError> {
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(self.accounts.clone()),
            }
        }
    }

    /// Samples as comparable tuples, in a stable order.
    pub fn sorted(samples: &[Sample]) -> Vec<(&'static str, Vec<String>, f64)> {
        let mut rows: Vec<_> = samples
            .iter()
            .map(|s| (s.descriptor.name, s.label_values.clone(), s.value))
            .collect();
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        rows
    }

    pub async fn spawn_app(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

// ----------------------------------------------------------------------------
// 17.1 Cache Tests
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 17.2 Mapper Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod mapper_tests {
    use super::test_support::limit_record;
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0 ; "no fields")]
    #[test_case(5 ; "five fields")]
    #[test_case(7 ; "seven fields")]
    fn wrong_field_count_is_malformed(fields: usize) {
        let record = RawResourceRecord::new(vec![Some("10".to_string()); fields]);
        assert_eq!(
            map_resource(&record),
            Err(RecordError::Malformed { fields, expected: 6 })
        );
    }

    #[test]
    fn valid_record_yields_limit_and_usage() {
        let record = map_resource(&limit_record("us-east-1", "EC2", "X", "10", "3"))
            .unwrap()
            .unwrap();

        let [limit, usage] = record.metrics("123456789012");
        assert_eq!(limit.kind, MetricKind::Limit);
        assert_eq!(limit.value, 10.0);
        assert_eq!(usage.kind, MetricKind::Usage);
        assert_eq!(usage.value, 3.0);

        let sample = limit.into_sample();
        assert_eq!(sample.descriptor.name, "service_limit");
        assert_eq!(sample.label("account_id"), Some("123456789012"));
        assert_eq!(sample.label("region"), Some("us-east-1"));
        assert_eq!(sample.label("service"), Some("EC2"));
        assert_eq!(sample.label("name"), Some("X"));
    }

    #[test_case([Some("r"), Some("s"), Some("n"), Some("5"), None, None] ; "usage absent")]
    #[test_case([Some("r"), Some("s"), Some("n"), None, None, None] ; "limit and usage absent")]
    fn absent_usage_is_skipped(fields: [Option<&str>; 6]) {
        assert_eq!(map_resource(&RawResourceRecord::from_fields(fields)), Ok(None));
    }

    #[test_case([Some("r"), Some("s"), Some("n"), None, Some("3"), None], RecordError::MissingLimit ; "absent limit")]
    #[test_case(
        [Some("r"), Some("s"), Some("n"), Some(""), Some("3"), None],
        RecordError::NumericParse { field: "limit", value: "".into() } ;
        "empty limit"
    )]
    #[test_case(
        [Some("r"), Some("s"), Some("n"), Some("5"), Some(""), None],
        RecordError::NumericParse { field: "usage", value: "".into() } ;
        "empty usage"
    )]
    #[test_case(
        [Some("r"), Some("s"), Some("n"), Some("lots"), Some("3"), None],
        RecordError::NumericParse { field: "limit", value: "lots".into() } ;
        "non numeric limit"
    )]
    #[test_case(
        [Some("r"), Some("s"), Some("n"), Some("5"), Some("2.5"), None],
        RecordError::NumericParse { field: "usage", value: "2.5".into() } ;
        "fractional usage"
    )]
    fn invalid_values_are_rejected(fields: [Option<&str>; 6], expected: RecordError) {
        assert_eq!(map_resource(&RawResourceRecord::from_fields(fields)), Err(expected));
    }

    #[test]
    fn absent_usage_is_an_error_once_past_the_skip() {
        assert_eq!(parse_limit_usage(Some("5"), None), Err(RecordError::MissingUsage));
        assert_eq!(parse_limit_usage(None, None), Err(RecordError::MissingLimit));
        assert_eq!(parse_limit_usage(Some("5"), Some("2")), Ok((5, 2)));
    }

    #[test]
    fn absent_labels_become_empty() {
        let record = RawResourceRecord::from_fields([None, None, None, Some("5"), Some("1"), None]);
        let mapped = map_resource(&record).unwrap().unwrap();
        assert_eq!(
            mapped,
            ServiceLimitRecord {
                region: String::new(),
                service: String::new(),
                limit_name: String::new(),
                limit: 5,
                usage: 1,
            }
        );
    }

    #[test]
    fn map_resources_skips_absent_usage_and_stops_at_first_error() {
        let skipped = RawResourceRecord::from_fields([Some("r"), Some("s"), Some("n"), Some("5"), None, None]);
        let ok = limit_record("eu-west-1", "VPC", "VPCs", "5", "4");

        let mapped = map_resources(&[skipped.clone(), ok.clone()]).unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].limit_name, "VPCs");

        let broken = RawResourceRecord::from_fields([Some("r")]);
        assert_eq!(
            map_resources(&[ok, broken, skipped]),
            Err(RecordError::Malformed { fields: 1, expected: 6 })
        );
    }
}

// ----------------------------------------------------------------------------
// 17.3 Task Group Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod task_group_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn fail_fast_cancels_siblings() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut group: TaskGroup<u32, TaskFailure> = TaskGroup::new(FailurePolicy::FailFast);

        let flag = Arc::clone(&finished);
        group.spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        });
        group.spawn(async { Err(TaskFailure::Panicked("boom".to_string())) });

        let started = Instant::now();
        let result = group.join().await;

        assert_eq!(result, Err(TaskFailure::Panicked("boom".to_string())));
        assert!(started.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_all_lets_every_task_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut group: TaskGroup<u32, TaskFailure> = TaskGroup::new(FailurePolicy::WaitAll);

        group.spawn(async { Err(TaskFailure::Panicked("first".to_string())) });
        let flag = Arc::clone(&finished);
        group.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(2)
        });

        let result = group.join().await;
        assert_eq!(result, Err(TaskFailure::Panicked("first".to_string())));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn join_collects_every_value() {
        let mut group: TaskGroup<u32, TaskFailure> = TaskGroup::new(FailurePolicy::WaitAll);
        for i in 1..=3 {
            group.spawn(async move { Ok(i) });
        }
        assert_eq!(group.len(), 3);

        let mut values = group.join().await.unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_group() {
        let parent = CancellationToken::new();
        let mut group: TaskGroup<u32, TaskFailure> = TaskGroup::child_of(&parent, FailurePolicy::FailFast);
        group.spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        });

        parent.cancel();
        assert_eq!(group.join().await, Err(TaskFailure::Cancelled));
    }

    #[tokio::test]
    async fn panics_surface_as_task_failures() {
        let mut group: TaskGroup<u32, TaskFailure> = TaskGroup::new(FailurePolicy::WaitAll);
        group.spawn(async {
            let explode = true;
            if explode {
                panic!("kaboom");
            }
            Ok(1)
        });

        assert_eq!(group.join().await, Err(TaskFailure::Panicked("kaboom".to_string())));
    }
}

// ----------------------------------------------------------------------------
// 17.4 Trusted Advisor Collector Tests
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 17.5 HTTP Advisory Client Tests
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 17.6 Update Collector Tests
// ----------------------------------------------------------------------------


// ----------------------------------------------------------------------------
// 17.7 Event Collector Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod event_tests {
    use super::test_support::sorted;
    use super::*;
    use pretty_assertions::assert_eq;

    struct FakeEvents(Vec<ClusterEvent>);

    #[async_trait]
    impl EventSource for FakeEvents {
        async fn list_events(&self) -> Result<Vec<ClusterEvent>, SourceError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn counts_failures_per_cluster() {
        let source = FakeEvents(vec![
            ClusterEvent::new(REASON_CREATE_FAILED, "c1"),
            ClusterEvent::new(REASON_CREATE_FAILED, "c1"),
            ClusterEvent::new(REASON_CREATE_FAILED, "c2"),
            ClusterEvent::new(REASON_DELETE_FAILED, "c1"),
            ClusterEvent::new("Scheduled", "c1"),
        ]);
        let collector = EventCollector::new(Arc::new(source), "gauss").unwrap();
        let (sink, receiver) = metric_channel();

        collector.collect(&sink).await.unwrap();

        let labels = |cluster: &str| vec!["gauss".to_string(), cluster.to_string()];
        assert_eq!(
            sorted(&receiver.drain()),
            vec![
                ("cloudformation_creation_failed", labels("c1"), 2.0),
                ("cloudformation_creation_failed", labels("c2"), 1.0),
                ("cloudformation_deletion_failed", labels("c1"), 1.0),
            ]
        );
    }

    #[test]
    fn installation_is_required() {
        let err = EventCollector::new(Arc::new(FakeEvents(Vec::new())), " ").unwrap_err();
        assert_eq!(err, ConfigError::missing_field("installation"));
    }

    #[test]
    fn describes_all_four_failure_gauges() {
        let collector = EventCollector::new(Arc::new(FakeEvents(Vec::new())), "gauss").unwrap();
        assert_eq!(collector.describe().len(), 4);
    }
}

// ----------------------------------------------------------------------------
// 17.8 Registry & Server Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod registry_tests {
    use super::test_support::{limit_record, spawn_app, FakeAccounts, FakeAdvisor, ACCOUNT_A, ACCOUNT_B};
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedCollector(Vec<Sample>);

    #[async_trait]
    impl MetricsCollector for FixedCollector {
        fn name(&self) -> &str {
            "fixed"
        }

        fn describe(&self) -> Vec<&'static MetricDescriptor> {
            vec![&SERVICE_LIMIT, &SERVICE_USAGE]
        }

        async fn collect(&self, sink: &MetricSink) -> CollectorResult<()> {
            for sample in &self.0 {
                sink.emit(sample.clone());
            }
            Ok(())
        }
    }

    struct BrokenCollector;

    #[async_trait]
    impl MetricsCollector for BrokenCollector {
        fn name(&self) -> &str {
            "broken"
        }

        fn describe(&self) -> Vec<&'static MetricDescriptor> {
            vec![&SERVICE_LIMIT]
        }

        async fn collect(&self, _sink: &MetricSink) -> CollectorResult<()> {
            Err(CollectorError::Discovery(AdvisorError::transport("ListAccounts", "denied")))
        }
    }

    fn fixed() -> Arc<dyn MetricsCollector> {
        let record = ServiceLimitRecord {
            region: "us-east-1".to_string(),
            service: "EC2".to_string(),
            limit_name: "X".to_string(),
            limit: 10,
            usage: 3,
        };
        Arc::new(FixedCollector(
            record
                .metrics("123456789012")
                .into_iter()
                .map(DerivedMetric::into_sample)
                .collect(),
        ))
    }

    #[tokio::test]
    async fn renders_collected_gauges() {
        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();

        let report = registry.scrape().await;
        let text = registry.render(&report.samples).unwrap();

        let limit = text.lines().find(|l| l.starts_with("service_limit{")).unwrap();
        assert!(limit.contains(r#"account_id="123456789012""#));
        assert!(limit.contains(r#"region="us-east-1""#));
        assert!(limit.contains(r#"service="EC2""#));
        assert!(limit.contains(r#"name="X""#));
        assert!(limit.ends_with(" 10"));
        assert!(text.contains("# HELP service_usage Service usage as reported by Trusted Advisor."));
        assert!(text.contains(r#"collector_failed{collector="fixed"} 0"#));
    }

    #[tokio::test]
    async fn namespace_prefixes_every_metric() {
        let mut registry = ExporterRegistry::new(Some("aws".to_string())).unwrap();
        registry.register(fixed()).unwrap();

        let report = registry.scrape().await;
        let text = registry.render(&report.samples).unwrap();
        assert!(text.contains("aws_service_limit{"));
        assert!(text.contains("aws_collector_failed{"));
        assert!(!text.lines().any(|l| l.starts_with("service_limit{")));
    }

    #[tokio::test]
    async fn failing_collector_is_reported_and_others_render() {
        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();
        registry.register(Arc::new(BrokenCollector)).unwrap();

        let report = registry.scrape().await;
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "broken");
        assert_eq!(report.samples.len(), 2);

        let text = registry.render(&report.samples).unwrap();
        assert!(text.contains(r#"collector_failed{collector="broken"} 1"#));

        let health = registry.health();
        assert_eq!(health["broken"].status, CollectorStatus::Failed);
        assert_eq!(health["broken"].consecutive_failures, 1);
        assert_eq!(health["fixed"].status, CollectorStatus::Healthy);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();
        assert!(registry.register(fixed()).is_err());
        assert_eq!(registry.collector_names(), vec!["fixed".to_string()]);
    }

    #[test]
    fn describe_deduplicates_by_name() {
        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();
        registry.register(Arc::new(BrokenCollector)).unwrap();
        assert_eq!(registry.describe().len(), 2);
    }

    #[tokio::test]
    async fn serves_metrics_and_health() {
        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();
        let config = ServerConfig::default();
        let addr = spawn_app(router(Arc::new(registry), &config)).await;

        let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let content_type = response.headers()[reqwest::header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
        assert!(response.text().await.unwrap().contains("service_usage{"));

        let health: HashMap<String, CollectorHealth> = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["fixed"].status, CollectorStatus::Healthy);
        assert!(health["fixed"].last_success.is_some());
    }

    #[tokio::test]
    async fn hung_account_times_out_without_hiding_healthy_ones() {
        let healthy = Arc::new(FakeAdvisor::with_limits(vec![limit_record("us-east-1", "EC2", "X", "10", "3")]));
        let mut hung = FakeAdvisor::with_limits(vec![limit_record("eu-west-1", "EC2", "Y", "20", "4")]);
        hung.delays.insert("limits-ec2".to_string(), Duration::from_secs(30));

        let collector = TrustedAdvisorCollector::builder()
            .accounts(Arc::new(FakeAccounts::new(vec![
                AccountHandle::new(ACCOUNT_A, healthy),
                AccountHandle::new(ACCOUNT_B, Arc::new(hung)),
            ])))
            .build()
            .unwrap();
        let mut registry = ExporterRegistry::new(None)
            .unwrap()
            .with_scrape_timeout(Duration::from_millis(300));
        registry.register(Arc::new(collector)).unwrap();
        let addr = spawn_app(router(Arc::new(registry), &ServerConfig::default())).await;

        let started = Instant::now();
        let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let text = response.text().await.unwrap();
        assert!(text.contains(ACCOUNT_A));
        assert!(!text.contains(ACCOUNT_B));
        assert!(text.contains(r#"collector_failed{collector="trusted_advisor"} 1"#));

        let health: HashMap<String, CollectorHealth> = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health[TRUSTED_ADVISOR_COLLECTOR].status, CollectorStatus::Failed);
        assert_eq!(health[TRUSTED_ADVISOR_COLLECTOR].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn timed_out_collector_reports_timeout_error() {
        struct Stalled;

        #[async_trait]
        impl MetricsCollector for Stalled {
            fn name(&self) -> &str {
                "stalled"
            }

            fn describe(&self) -> Vec<&'static MetricDescriptor> {
                vec![&SERVICE_LIMIT]
            }

            async fn collect(&self, _sink: &MetricSink) -> CollectorResult<()> {
                futures::future::pending().await
            }
        }

        let mut registry = ExporterRegistry::new(None)
            .unwrap()
            .with_scrape_timeout(Duration::from_millis(50));
        registry.register(fixed()).unwrap();
        registry.register(Arc::new(Stalled)).unwrap();

        let report = registry.scrape().await;
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.failures.len(), 1);
        let (name, error) = &report.failures[0];
        assert_eq!(name, "stalled");
        assert!(matches!(error, CollectorError::Timeout { timeout } if *timeout == Duration::from_millis(50)));
        assert_eq!(error.category(), "timeout");
        assert!(error.is_recoverable());
    }

    #[test]
    fn build_registry_applies_configured_scrape_timeout() {
        let mut config = ExporterConfig::default();
        config.server.scrape_timeout = Duration::from_secs(42);
        assert_eq!(build_registry(&config).unwrap().scrape_timeout(), Duration::from_secs(42));
    }

    #[test]
    fn duplicate_label_sets_are_detected() {
        let sample = |value: f64| Sample::new(&SERVICE_LIMIT, value, vec![
            ACCOUNT_A.to_string(),
            "us-east-1".to_string(),
            "EC2".to_string(),
            "X".to_string(),
        ]);
        let mut other = sample(7.0);
        other.label_values[1] = "eu-west-1".to_string();
        let samples = vec![sample(10.0), other, sample(12.0)];

        let duplicates = duplicate_series(&samples);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].value, 12.0);

        assert!(duplicate_series(&samples[..2]).is_empty());

        let mut registry = ExporterRegistry::new(None).unwrap();
        registry.register(fixed()).unwrap();
        let text = registry.render(&samples).unwrap();
        let rendered: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("service_limit{") && l.contains("us-east-1"))
            .collect();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].ends_with(" 12"));
    }
}

// ----------------------------------------------------------------------------
// 17.9 Configuration Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[exporter]
namespace = "aws"

[server]
address = "127.0.0.1:9100"
scrape_timeout = "45s"

[advisor]
request_timeout = "3s"

[[advisor.accounts]]
account_id = "123456789012"
endpoint = "http://127.0.0.1:8080/"

[advisor.accounts.headers]
x-signing-profile = "limits"

[logging]
format = "json"
"#;

    #[test]
    fn default_configuration_is_valid() {
        let config = ExporterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.path, "/metrics");
        assert_eq!(config.namespace(), None);
        assert!(config.advisor.enabled);
    }

    #[test]
    fn generated_default_parses_back() {
        let generated = ExporterConfig::generate_default().unwrap();
        assert_eq!(ExporterConfig::from_toml_str(&generated).unwrap(), ExporterConfig::default());
    }

    #[test]
    fn parses_accounts_and_durations() {
        let config = ExporterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.namespace(), Some("aws"));
        assert_eq!(config.server.scrape_timeout, Duration::from_secs(45));
        assert_eq!(config.server.path, DEFAULT_METRICS_PATH);
        assert_eq!(config.advisor.request_timeout, Duration::from_secs(3));
        assert_eq!(config.advisor.language, "en");
        assert_eq!(config.advisor.accounts.len(), 1);
        assert_eq!(config.advisor.accounts[0].headers["x-signing-profile"], "limits");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn rejects_short_account_ids() {
        let content = SAMPLE.replace("123456789012", "12345");
        let err = ExporterConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "advisor.accounts.account_id"));
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let mut config = ExporterConfig::from_toml_str(SAMPLE).unwrap();
        let account = config.advisor.accounts[0].clone();
        config.advisor.accounts.push(account);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_scrape_timeout_within_two_request_timeouts() {
        let mut config = ExporterConfig::default();
        config.server.scrape_timeout = Duration::from_secs(20);
        config.advisor.request_timeout = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { ref field, .. }) if field == "server.scrape_timeout"));

        config.server.scrape_timeout = Duration::from_secs(21);
        config.validate().unwrap();

        config.server.scrape_timeout = Duration::from_secs(5);
        config.advisor.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_relative_metrics_path() {
        let mut config = ExporterConfig::default();
        config.server.path = "metrics".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { ref field, .. }) if field == "server.path"));
    }

    #[test]
    fn rejects_invalid_namespace() {
        let mut config = ExporterConfig::default();
        config.exporter.namespace = Some("1aws".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ExporterConfig::load(file.path()).unwrap();
        assert_eq!(config.server.address, "127.0.0.1:9100");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(
            ExporterConfig::load(&path),
            Err(ConfigError::FileNotFound { path: path.clone() })
        );
    }

    #[test]
    fn error_categories_are_stable() {
        let err = ExporterError::from(ConfigError::missing_field("accounts"));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err = ExporterError::from(CollectorError::Task(TaskFailure::Cancelled));
        assert_eq!(err.category(), "task");
        assert!(err.is_recoverable());
    }
}
