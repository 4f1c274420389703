//! # MeterQL Engine - Metering Query Compiler
//!
//! Compiles metering requests (a meter name, an aggregation level, a set of
//! scope filters and a step) into PromQL expressions, and turns the series a
//! Prometheus-compatible backend returns into billable per-step usage.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            METERQL ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  WINDOW NORMALIZER → TEMPLATE REGISTRY → RENDERER → LEVEL SCOPE → BACKEND   │
//! │                                                        ↓                     │
//! │                                   RESULT AGGREGATOR (scaling + statistics)   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Typed Templates**: every meter declares the placeholders it carries
//! - **Eight Levels**: cluster, node, workspace, namespace, application,
//!   workload, service and pod scopes
//! - **Namespace Isolation**: parser-backed scoping of ad-hoc expressions
//! - **Hour-Aligned Windows**: step coercion, validation and `(start, end]` windows
//! - **Batch Isolation**: one failed meter never aborts its siblings
//!
//! ## Author
//!
//! Metering Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Lazy Initialization
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Args, Parser, Subcommand, ValueEnum};

// ----------------------------------------------------------------------------
// Prometheus Self-Metrics
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ----------------------------------------------------------------------------
// PromQL Parsing
// ----------------------------------------------------------------------------
use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::{self as promql, Expr, VectorSelector};

// ============================================================================
// SECTION 2: CONSTANTS & CONFIGURATION DEFAULTS
// ============================================================================

/// Engine version
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name
pub const ENGINE_NAME: &str = "meterql";

/// Smallest step a metering query may use; shorter steps are raised to it
pub const MIN_METER_STEP: Duration = Duration::from_secs(3600);

/// Step required once a query spans more than [`MAX_SUB_DAILY_RANGE_DAYS`]
pub const DAILY_STEP: Duration = Duration::from_secs(24 * 3600);

/// Longest range (in days) that may still be sampled below [`DAILY_STEP`]
pub const MAX_SUB_DAILY_RANGE_DAYS: i64 = 30;

/// Backend used when the configuration does not name one
pub const DEFAULT_BACKEND: &str = "prometheus";

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "METERQL_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "meterql.toml";

const SECONDS_PER_HOUR: u64 = 3600;

// ============================================================================
// SECTION 3: CORE TYPES & DATA STRUCTURES
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Aggregation Level
// ----------------------------------------------------------------------------

/// The scope at which a meter is computed
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Cluster,
    Node,
    Workspace,
    Namespace,
    Application,
    Workload,
    Service,
    Pod,
}

impl Level {
    pub const ALL: [Level; 8] = [
        Level::Cluster,
        Level::Node,
        Level::Workspace,
        Level::Namespace,
        Level::Application,
        Level::Workload,
        Level::Service,
        Level::Pod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Cluster => "cluster",
            Level::Node => "node",
            Level::Workspace => "workspace",
            Level::Namespace => "namespace",
            Level::Application => "application",
            Level::Workload => "workload",
            Level::Service => "service",
            Level::Pod => "pod",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UsageError::UnknownLevel { level: s.to_string() })
    }
}

// ----------------------------------------------------------------------------
// 3.2 Workload Kinds
// ----------------------------------------------------------------------------

/// Controller kinds recognised in `workload` labels (`<Kind>:<name>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    /// Parses a kind as sent by API callers (`deployment`, `statefulsets`, ...)
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().trim_end_matches('s') {
            "deployment" => Some(WorkloadKind::Deployment),
            "statefulset" => Some(WorkloadKind::StatefulSet),
            "daemonset" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }
}

impl Display for WorkloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Meter Resources
// ----------------------------------------------------------------------------

/// Physical resource a meter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterResource {
    Cpu,
    Memory,
    NetEgress,
    NetIngress,
    Pvc,
}

impl MeterResource {
    pub fn unit(&self) -> &'static str {
        match self {
            MeterResource::Cpu => "cores",
            MeterResource::Memory
            | MeterResource::NetEgress
            | MeterResource::NetIngress
            | MeterResource::Pvc => "bytes",
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Query Options
// ----------------------------------------------------------------------------

/// Time parameters of a metering request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    #[serde(with = "humantime_serde")]
    pub step: Duration,
}

impl MeterOptions {
    /// Single-point options with the one hour step used by instant metering
    pub fn hourly() -> Self {
        Self::with_step(MIN_METER_STEP)
    }

    pub fn with_step(step: Duration) -> Self {
        Self { start: None, end: None, step }
    }

    pub fn ranged(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Self {
        Self { start: Some(start), end: Some(end), step }
    }

    /// Whole hours in the step, truncated
    pub fn step_hours(&self) -> u64 {
        self.step.as_secs() / SECONDS_PER_HOUR
    }
}

/// Scope filters for one compilation
///
/// Every filter is optional; an empty string counts as absent. Regex filters
/// (`resource_filter`, `pvc_filter`) are PromQL regex strings and are inserted
/// verbatim, exact-match values are escaped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub level: Level,
    pub resource_filter: Option<String>,
    pub node_name: Option<String>,
    pub namespace_name: Option<String>,
    pub workspace_name: Option<String>,
    pub application_name: Option<String>,
    pub service_name: Option<String>,
    pub workload_kind: Option<String>,
    pub workload_name: Option<String>,
    pub pod_name: Option<String>,
    pub pvc_filter: Option<String>,
    pub storage_class_name: Option<String>,
    /// Raw matcher list for the pod ownership join
    pub owner_filter: Option<String>,
    /// Raw matcher list for the pod node join
    pub node_filter: Option<String>,
    pub meter_options: Option<MeterOptions>,
}

impl QueryOptions {
    pub fn for_level(level: Level) -> Self {
        Self { level, ..Default::default() }
    }

    pub fn with_resource_filter(mut self, filter: impl Into<String>) -> Self {
        self.resource_filter = Some(filter.into());
        self
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    pub fn with_namespace_name(mut self, name: impl Into<String>) -> Self {
        self.namespace_name = Some(name.into());
        self
    }

    pub fn with_workspace_name(mut self, name: impl Into<String>) -> Self {
        self.workspace_name = Some(name.into());
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_workload(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.workload_kind = Some(kind.into());
        self.workload_name = Some(name.into());
        self
    }

    pub fn with_workload_kind(mut self, kind: impl Into<String>) -> Self {
        self.workload_kind = Some(kind.into());
        self
    }

    pub fn with_pod_name(mut self, name: impl Into<String>) -> Self {
        self.pod_name = Some(name.into());
        self
    }

    pub fn with_pvc_filter(mut self, filter: impl Into<String>) -> Self {
        self.pvc_filter = Some(filter.into());
        self
    }

    pub fn with_storage_class_name(mut self, name: impl Into<String>) -> Self {
        self.storage_class_name = Some(name.into());
        self
    }

    pub fn with_owner_filter(mut self, filter: impl Into<String>) -> Self {
        self.owner_filter = Some(filter.into());
        self
    }

    pub fn with_node_filter(mut self, filter: impl Into<String>) -> Self {
        self.node_filter = Some(filter.into());
        self
    }

    pub fn with_meter_options(mut self, options: MeterOptions) -> Self {
        self.meter_options = Some(options);
        self
    }

    /// Checks that the regex filters compile
    pub fn validate(&self) -> Result<(), UsageError> {
        let regex_filters = [("resource", &self.resource_filter), ("pvc", &self.pvc_filter)];
        for (field, value) in regex_filters {
            if let Some(pattern) = non_empty(value) {
                Regex::new(pattern).map_err(|e| UsageError::InvalidFilter {
                    field,
                    value: pattern.to_string(),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

/// Treats `Some("")` like `None`
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// ----------------------------------------------------------------------------
// 3.5 Filter Helpers
// ----------------------------------------------------------------------------

fn alternation<S: AsRef<str>>(items: &[S]) -> String {
    items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("|")
}

/// PVC regex for the claims owned by an application.
///
/// An empty claim list yields `""`, which under the mandatory application PVC
/// clause matches no series at all.
pub fn pvc_filter_from_claims<S: AsRef<str>>(claims: &[S]) -> String {
    alternation(claims)
}

/// Workload regex for application components given as `<Kind>:<name>`
pub fn component_filter<S: AsRef<str>>(components: &[S]) -> String {
    alternation(components)
}

/// Pod regex for the pods backing a service
pub fn pod_filter<S: AsRef<str>>(pods: &[S]) -> String {
    alternation(pods)
}

// ----------------------------------------------------------------------------
// 3.6 Results
// ----------------------------------------------------------------------------

/// A `(timestamp, value)` pair, timestamp in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Vector,
    Matrix,
}

/// One labelled series (matrix) or sample (vector)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Point>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Point>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_unit: Option<String>,
}

impl MetricValue {
    pub fn instant(point: Point) -> Self {
        Self { sample: Some(point), ..Default::default() }
    }

    pub fn range(series: Vec<Point>) -> Self {
        Self { series, ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.sample.iter().chain(self.series.iter())
    }

    fn scale(&mut self, factor: f64) {
        for point in self.sample.iter_mut().chain(self.series.iter_mut()) {
            point.value *= factor;
        }
    }

    /// Fills min/max/avg/sum from the series, or from the sample when there is no series
    fn update_statistics(&mut self) {
        let values: SmallVec<[f64; 32]> = if self.series.is_empty() {
            self.sample.iter().map(|p| p.value).collect()
        } else {
            self.series.iter().map(|p| p.value).collect()
        };
        if values.is_empty() {
            return;
        }

        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        self.min_value = Some(min);
        self.max_value = Some(max);
        self.sum_value = Some(sum);
        self.avg_value = Some(sum / values.len() as f64);
    }
}

/// Backend payload for one expression
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    #[serde(rename = "resultType")]
    pub metric_type: MetricType,

    #[serde(rename = "result", default)]
    pub values: Vec<MetricValue>,
}

impl MetricData {
    pub fn vector(values: Vec<MetricValue>) -> Self {
        Self { metric_type: MetricType::Vector, values }
    }

    pub fn matrix(values: Vec<MetricValue>) -> Self {
        Self { metric_type: MetricType::Matrix, values }
    }
}

/// A named result; `error` set means `data` carries nothing useful
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric_name: String,

    #[serde(default)]
    pub data: MetricData,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Metric {
    pub fn ok(name: impl Into<String>, data: MetricData) -> Self {
        Self { metric_name: name.into(), data, error: None }
    }

    pub fn failed(name: impl Into<String>, error: impl Display) -> Self {
        Self { metric_name: name.into(), data: MetricData::default(), error: Some(error.to_string()) }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Results in request order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub results: Vec<Metric>,
}

impl Metrics {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.results.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.results.iter().find(|m| m.metric_name == name)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|m| m.is_err()).count()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Caller mistakes; never retried
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("meter options not found")]
    MissingMeterOptions,

    #[error("invalid meter {metric}")]
    UnknownMetric { metric: String },

    #[error("unknown level '{level}'")]
    UnknownLevel { level: String },

    #[error("backend '{backend}' is not supported")]
    UnsupportedBackend { backend: String },

    #[error("placeholder {placeholder} of {metric} cannot be filled at {level} level")]
    PlaceholderNotApplicable { metric: String, placeholder: Placeholder, level: Level },

    #[error("invalid {field} filter '{value}': {message}")]
    InvalidFilter { field: &'static str, value: String, message: String },

    #[error("invalid expression: {message}")]
    InvalidExpression { message: String },
}

/// Rejected time windows, reported before any backend call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("step should be larger than 24 hours when querying more than {max_days} days (got {step:?})")]
    StepTooSmallForRange { step: Duration, max_days: i64 },

    #[error("step should be integer hours (got {step:?})")]
    StepNotIntegerHours { step: Duration },

    #[error("end {end} is before start {start}")]
    InvalidTimeRange { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error("step {step:?} is out of range")]
    StepOutOfRange { step: Duration },
}

/// Failures reported by the metrics backend collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("query failed: {message}")]
    QueryFailed { message: String },

    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl BackendError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. } | BackendError::Timeout { .. })
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },
}

impl MeterError {
    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            MeterError::Usage(_) => "usage",
            MeterError::Validation(_) => "validation",
            MeterError::Backend(_) => "backend",
            MeterError::Config(_) => "config",
            MeterError::Io(_) => "io",
            MeterError::Internal(_) => "internal",
        }
    }

    /// Nothing in the engine retries; this only informs callers
    pub fn is_recoverable(&self) -> bool {
        match self {
            MeterError::Backend(e) => e.is_recoverable(),
            MeterError::Io(_) => true,
            _ => false,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MeterError::Usage(_) | MeterError::Validation(_) => RecoveryHint::FixRequest,
            MeterError::Config(_) => RecoveryHint::FixConfiguration,
            e if e.is_recoverable() => RecoveryHint::RetryWithBackoff,
            _ => RecoveryHint::None,
        }
    }
}

/// What a caller can do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    None,
    FixRequest,
    FixConfiguration,
    RetryWithBackoff,
}

/// Result type alias
pub type MeterResult<T> = Result<T, MeterError>;

/// Result type returned by backend collaborators
pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with METERQL_ environment overrides, validation and
// sensible defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Metering defaults
    #[serde(default)]
    pub metering: MeteringConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.backend_kind() {
            return Err(ConfigError::InvalidValue { field: "engine.backend".into(), message: e.to_string() });
        }

        let step = self.metering.default_step;
        if step < MIN_METER_STEP || !is_whole_hours(step) {
            return Err(ConfigError::InvalidValue {
                field: "metering.default_step".into(),
                message: format!("step must be a whole number of hours of at least 1h, got {step:?}"),
            });
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".into(),
                message: format!("unknown format '{}', expected pretty, compact or json", self.logging.format),
            });
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn backend_kind(&self) -> Result<BackendKind, UsageError> {
        self.engine.backend.parse()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Metrics backend the compiled expressions target
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { instance_name: default_instance_name(), backend: default_backend() }
    }
}

fn default_instance_name() -> String {
    "meterql-engine".into()
}

fn default_backend() -> String {
    DEFAULT_BACKEND.into()
}

// ----------------------------------------------------------------------------
// 5.3 Metering Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Step used when a request does not carry one
    #[serde(default = "default_step", with = "humantime_serde")]
    pub default_step: Duration,

    /// Batches slower than this are logged at warn level
    #[serde(default = "default_slow_batch_threshold", with = "humantime_serde")]
    pub slow_batch_threshold: Duration,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self { default_step: default_step(), slow_batch_threshold: default_slow_batch_threshold() }
    }
}

fn default_step() -> Duration {
    MIN_METER_STEP
}

fn default_slow_batch_threshold() -> Duration {
    Duration::from_secs(5)
}

fn is_whole_hours(step: Duration) -> bool {
    step.subsec_nanos() == 0 && step.as_secs() % SECONDS_PER_HOUR == 0
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
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

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Targets used across the engine:
//   meterql::init     startup
//   meterql::compile  template lookup and rendering
//   meterql::window   time-window normalization
//   meterql::engine   batch execution against the backend
//   meterql::perf     slow operations
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MeterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                subscriber_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "compact" => registry
            .with(subscriber_fmt::layer().compact().with_ansi(config.colors).with_target(true))
            .try_init(),
        _ => registry
            .with(
                subscriber_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };

    installed.map_err(|e| MeterError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "meterql::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past a threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold: Option<Duration>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now(), threshold: None }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold: Duration) -> Self {
        Self { name, start: Instant::now(), threshold: Some(threshold) }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();

        if let Some(threshold) = self.threshold {
            if elapsed > threshold {
                warn!(
                    target: "meterql::perf",
                    operation = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "meterql::perf",
            operation = self.name,
            elapsed_us = elapsed.as_micros() as u64,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// MeterQL CLI
#[derive(Parser, Debug)]
#[command(
    name = "meterql",
    author = "Metering Team",
    version,
    about = "Compile metering requests into PromQL",
    long_about = "MeterQL compiles a meter name, an aggregation level and scope filters \
                  into a PromQL expression, and checks metering time windows before \
                  they reach the metrics backend."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "METERQL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "METERQL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a meter into a PromQL expression
    Compile {
        /// Meter name, e.g. meter_pod_cpu_usage
        metric: String,

        /// Aggregation level
        #[arg(long, value_enum, default_value_t = Level::Cluster)]
        level: Level,

        /// Step (defaults to metering.default_step)
        #[arg(short, long, value_parser = humantime::parse_duration)]
        step: Option<Duration>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// List built-in meters
    Meters {
        /// Only meters of this level
        #[arg(long, value_enum)]
        level: Option<Level>,
    },

    /// Normalize a metering time window
    Normalize {
        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,

        /// Requested step
        #[arg(short, long, value_parser = humantime::parse_duration)]
        step: Duration,
    },

    /// Scope an ad-hoc expression to one namespace
    Scope {
        /// Expression to rewrite
        expr: String,

        /// Target namespace
        #[arg(short, long)]
        namespace: String,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

/// Scope filters accepted by `compile`
#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    /// Regex over the level's primary resource name
    #[arg(long)]
    pub resource_filter: Option<String>,
    #[arg(long)]
    pub node: Option<String>,
    #[arg(long)]
    pub namespace: Option<String>,
    #[arg(long)]
    pub workspace: Option<String>,
    #[arg(long)]
    pub application: Option<String>,
    #[arg(long)]
    pub service: Option<String>,
    #[arg(long)]
    pub workload_kind: Option<String>,
    #[arg(long)]
    pub workload: Option<String>,
    #[arg(long)]
    pub pod: Option<String>,
    /// Regex over PVC names
    #[arg(long)]
    pub pvc_filter: Option<String>,
    #[arg(long)]
    pub storage_class: Option<String>,
    /// Raw matchers for the pod ownership join
    #[arg(long)]
    pub owner_filter: Option<String>,
    /// Raw matchers for the pod node join
    #[arg(long)]
    pub node_filter: Option<String>,
}

impl FilterArgs {
    pub fn into_options(self, level: Level) -> QueryOptions {
        QueryOptions {
            level,
            resource_filter: self.resource_filter,
            node_name: self.node,
            namespace_name: self.namespace,
            workspace_name: self.workspace,
            application_name: self.application,
            service_name: self.service,
            workload_kind: self.workload_kind,
            workload_name: self.workload,
            pod_name: self.pod,
            pvc_filter: self.pvc_filter,
            storage_class_name: self.storage_class,
            owner_filter: self.owner_filter,
            node_filter: self.node_filter,
            meter_options: None,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the compile subcommand
fn handle_compile(
    config: &EngineConfig,
    metric: &str,
    level: Level,
    step: Option<Duration>,
    filters: FilterArgs,
) -> MeterResult<()> {
    let step = step.unwrap_or(config.metering.default_step);
    let options = filters.into_options(level).with_meter_options(MeterOptions::with_step(step));
    let expr = MeterCompiler::builtin().compile(metric, &options)?;
    println!("{expr}");
    Ok(())
}

/// Handle the meters subcommand
fn handle_meters(level: Option<Level>) {
    let registry = TemplateRegistry::builtin();
    let levels: Vec<Level> = match level {
        Some(level) => vec![level],
        None => Level::ALL.to_vec(),
    };

    for level in levels {
        println!("{level}:");
        for name in registry.names_for(level) {
            let unit = registry.resource_of(name).map(|r| r.unit()).unwrap_or("-");
            println!("  {name:<48} {unit}");
        }
    }
}

/// Handle the normalize subcommand
fn handle_normalize(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> MeterResult<()> {
    let window = MeterWindow::normalize(start, end, step)?;
    let rendered =
        serde_json::to_string_pretty(&window).map_err(|e| MeterError::Internal(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

/// Handle the scope subcommand
fn handle_scope(config: &EngineConfig, expr: &str, namespace: &str) -> MeterResult<()> {
    let scoper = config.backend_kind()?.namespace_scoper();
    println!("{}", scoper.scope(expr, namespace)?);
    Ok(())
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> MeterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!();
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{s}"),
                    Err(e) => println!("Failed to serialize: {e}"),
                }
            }

            println!();
            println!("  instance name: {}", config.engine.instance_name);
            println!("  backend:       {}", config.engine.backend);
            println!("  default step:  {}", humantime::format_duration(config.metering.default_step));
            println!("  log format:    {}", config.logging.format);
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {e}");
            Err(MeterError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> MeterResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{ENGINE_NAME} v{ENGINE_VERSION}");
    println!();
    println!("Build Information:");
    println!("  target: {}", std::env::consts::ARCH);
    println!("  os:     {}", std::env::consts::OS);
    println!();
    println!("Built-in meters: {}", TemplateRegistry::builtin().len());
    println!("Backends:        {}", BackendKind::Prometheus);
}

// ============================================================================
// SECTION 8: MAIN ENTRY POINT
// ============================================================================

fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need a loaded configuration
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        EngineConfig::default()
    } else {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!(target: "meterql::init", path = %cli.config.display(), "Config file not found, using defaults");
    }
    debug!(target: "meterql::init", instance = %config.engine.instance_name, "{} v{}", ENGINE_NAME, ENGINE_VERSION);

    match cli.command {
        Commands::Compile { metric, level, step, filters } => {
            handle_compile(&config, &metric, level, step, filters)?
        }
        Commands::Meters { level } => handle_meters(level),
        Commands::Normalize { start, end, step } => handle_normalize(start, end, step)?,
        Commands::Scope { expr, namespace } => handle_scope(&config, &expr, &namespace)?,
        Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 9: TESTS
// ============================================================================



// ============================================================================
// ██████╗ ██╗  ██╗ █████╗ ███████╗███████╗    ██████╗ 
// ██╔══██╗██║  ██║██╔══██╗██╔════╝██╔════╝    ╚════██╗
// ██████╔╝███████║███████║███████╗█████╗       █████╔╝
// ██╔═══╝ ██╔══██║██╔══██║╚════██║██╔══╝      ██╔═══╝ 
// ██║     ██║  ██║██║  ██║███████║███████╗    ███████╗
// ╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚══════╝    ╚══════╝
// EXPRESSION COMPILER - TEMPLATES, RENDERING, LEVEL SCOPES
// ============================================================================

// ============================================================================
// SECTION 10: PLACEHOLDERS & LABEL MATCHERS
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Typed Placeholders
// ----------------------------------------------------------------------------

/// A substitution slot a template may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placeholder {
    /// Subquery range, `<N>h`
    Step,
    /// Node matcher, exact name or resource regex
    NodeSelector,
    /// Same as `NodeSelector` on the `instance` label
    InstanceSelector,
    /// Level-aware PVC clause
    Pvc,
    /// Application name written by `label_replace`
    App,
    /// Service name written by `label_replace`
    Svc,
    /// First positional filter slot
    Filter1,
    /// Second positional filter slot (pod node join)
    Filter2,
}

pub type PlaceholderSet = SmallVec<[Placeholder; 4]>;

impl Placeholder {
    pub const ALL: [Placeholder; 8] = [
        Placeholder::Step,
        Placeholder::NodeSelector,
        Placeholder::InstanceSelector,
        Placeholder::Pvc,
        Placeholder::App,
        Placeholder::Svc,
        Placeholder::Filter1,
        Placeholder::Filter2,
    ];

    pub const fn token(&self) -> &'static str {
        match self {
            Placeholder::Step => "$step",
            Placeholder::NodeSelector => "$nodeSelector",
            Placeholder::InstanceSelector => "$instanceSelector",
            Placeholder::Pvc => "$pvc",
            Placeholder::App => "$app",
            Placeholder::Svc => "$svc",
            Placeholder::Filter1 => "$1",
            Placeholder::Filter2 => "$2",
        }
    }

    /// Whether `level` supplies a value for this slot
    pub fn applies_to(&self, level: Level) -> bool {
        match self {
            Placeholder::Step => true,
            Placeholder::NodeSelector | Placeholder::InstanceSelector => level == Level::Node,
            Placeholder::Pvc => matches!(
                level,
                Level::Node | Level::Workspace | Level::Namespace | Level::Application
            ),
            Placeholder::App => level == Level::Application,
            Placeholder::Svc => level == Level::Service,
            Placeholder::Filter1 => !matches!(level, Level::Cluster | Level::Node),
            Placeholder::Filter2 => level == Level::Pod,
        }
    }
}

impl Display for Placeholder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Replaces placeholder tokens in a single left-to-right pass.
///
/// Inserted values are never rescanned, and a `$` that does not start one of
/// the given tokens is copied through.
fn substitute(text: &str, values: &[(Placeholder, String)]) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let hit = values
            .iter()
            .filter(|(p, _)| tail.starts_with(p.token()))
            .max_by_key(|(p, _)| p.token().len());

        match hit {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.token().len()..];
            }
            None => {
                out.push('$');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

// ----------------------------------------------------------------------------
// 10.2 Label Matchers
// ----------------------------------------------------------------------------

/// A single PromQL label matcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    pub key: String,
    pub op: LabelMatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelMatchOp::Equal, value: value.into() }
    }

    pub fn neq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelMatchOp::NotEqual, value: value.into() }
    }

    pub fn regex(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelMatchOp::Regex, value: pattern.into() }
    }

    pub fn not_regex(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelMatchOp::NotRegex, value: pattern.into() }
    }
}

/// Exact values are escaped; regex values are already PromQL string bodies.
impl Display for LabelMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.op {
            LabelMatchOp::Equal | LabelMatchOp::NotEqual => {
                write!(f, "{}{}\"{}\"", self.key, self.op.as_str(), escape_label_value(&self.value))
            }
            LabelMatchOp::Regex | LabelMatchOp::NotRegex => {
                write!(f, "{}{}\"{}\"", self.key, self.op.as_str(), self.value)
            }
        }
    }
}

/// Label match operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelMatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl LabelMatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelMatchOp::Equal => "=",
            LabelMatchOp::NotEqual => "!=",
            LabelMatchOp::Regex => "=~",
            LabelMatchOp::NotRegex => "!~",
        }
    }
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Ordered matchers that render into one selector slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatcherList {
    matchers: SmallVec<[LabelMatcher; 4]>,
}

impl MatcherList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, matcher: LabelMatcher) {
        self.matchers.push(matcher);
    }

    pub fn push_exact(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.push(LabelMatcher::eq(key, value));
        }
    }

    pub fn push_regex(&mut self, key: &str, pattern: Option<&str>) {
        if let Some(pattern) = pattern {
            self.push(LabelMatcher::regex(key, pattern));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn join(&self, separator: &str) -> String {
        self.matchers.iter().map(ToString::to_string).collect::<Vec<_>>().join(separator)
    }
}

// ============================================================================
// SECTION 11: TEMPLATE REGISTRY
// ============================================================================
// The registry is immutable once built. The built-in catalogue is shared
// through a lazily built `Arc`; callers that need their own catalogue build a
// registry with `from_templates` and inject it into the compiler.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Meter Templates
// ----------------------------------------------------------------------------

/// A meter's PromQL template and the placeholders it declares
#[derive(Debug, Clone, PartialEq)]
pub struct MeterTemplate {
    name: String,
    level: Level,
    resource: MeterResource,
    placeholders: PlaceholderSet,
    text: String,
}

impl MeterTemplate {
    pub fn new(
        name: impl Into<String>,
        level: Level,
        resource: MeterResource,
        placeholders: &[Placeholder],
        text: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            level,
            resource,
            placeholders: placeholders.iter().copied().collect(),
            text: text.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn resource(&self) -> MeterResource {
        self.resource
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn declares(&self, placeholder: Placeholder) -> bool {
        self.placeholders.contains(&placeholder)
    }

    /// Raw template text, before whitespace normalization
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Fails on the first declared placeholder `level` cannot fill
    pub fn check_level(&self, level: Level) -> Result<(), UsageError> {
        match self.placeholders.iter().find(|p| !p.applies_to(level)) {
            Some(placeholder) => Err(UsageError::PlaceholderNotApplicable {
                metric: self.name.clone(),
                placeholder: *placeholder,
                level,
            }),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Registry
// ----------------------------------------------------------------------------

static BUILTIN_REGISTRY: Lazy<Arc<TemplateRegistry>> = Lazy::new(|| Arc::new(TemplateRegistry::builtin()));

/// Meter name to template lookup
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: AHashMap<String, MeterTemplate>,
}

impl TemplateRegistry {
    /// The built-in catalogue
    pub fn builtin() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|spec| {
                let template =
                    MeterTemplate::new(spec.name, spec.level, spec.resource, spec.placeholders, spec.text);
                (spec.name.to_string(), template)
            })
            .collect();
        Self { templates }
    }

    /// Process-wide built-in catalogue
    pub fn shared() -> Arc<TemplateRegistry> {
        Arc::clone(&BUILTIN_REGISTRY)
    }

    /// Builds a registry from custom templates.
    ///
    /// Rejects duplicate names and templates whose declared placeholders do
    /// not occur in their text.
    pub fn from_templates<I>(templates: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = MeterTemplate>,
    {
        let mut map = AHashMap::new();
        for template in templates {
            if let Some(missing) = template.placeholders.iter().find(|p| !template.text.contains(p.token())) {
                return Err(ConfigError::InvalidValue {
                    field: format!("templates.{}", template.name),
                    message: format!("declares {missing} but its text does not contain it"),
                });
            }
            let name = template.name.clone();
            if map.insert(name.clone(), template).is_some() {
                return Err(ConfigError::InvalidValue {
                    field: format!("templates.{name}"),
                    message: "duplicate meter name".into(),
                });
            }
        }
        Ok(Self { templates: map })
    }

    /// Looks a meter up; unknown names are logged and reported as usage errors
    pub fn lookup(&self, metric: &str) -> Result<&MeterTemplate, UsageError> {
        self.templates.get(metric).ok_or_else(|| {
            error!(target: "meterql::compile", metric, "invalid meter");
            UsageError::UnknownMetric { metric: metric.to_string() }
        })
    }

    pub fn get(&self, metric: &str) -> Option<&MeterTemplate> {
        self.templates.get(metric)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.templates.contains_key(metric)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn meter_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Sorted meter names of one level
    pub fn names_for(&self, level: Level) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .templates
            .values()
            .filter(|t| t.level == level)
            .map(MeterTemplate::name)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn resource_of(&self, metric: &str) -> Option<MeterResource> {
        self.templates.get(metric).map(MeterTemplate::resource)
    }
}

// ----------------------------------------------------------------------------
// 11.3 Built-in Catalogue
// ----------------------------------------------------------------------------
// Selector placeholders close their matcher lists, so an empty substitution
// leaves a trailing comma and never a leading one.
//
// Two templates are kept exactly as deployed even though they look wrong:
// meter_service_net_bytes_received groups `by (namepace, pod)`, and
// meter_node_net_bytes_received passes " $1" to label_replace.
// ----------------------------------------------------------------------------

struct TemplateSpec {
    name: &'static str,
    level: Level,
    resource: MeterResource,
    placeholders: &'static [Placeholder],
    text: &'static str,
}

const fn meter(
    name: &'static str,
    level: Level,
    resource: MeterResource,
    placeholders: &'static [Placeholder],
    text: &'static str,
) -> TemplateSpec {
    TemplateSpec { name, level, resource, placeholders, text }
}

const STEP: &[Placeholder] = &[Placeholder::Step];
const STEP_NODE: &[Placeholder] = &[Placeholder::Step, Placeholder::NodeSelector];
const STEP_INSTANCE: &[Placeholder] = &[Placeholder::Step, Placeholder::InstanceSelector];
const STEP_PVC: &[Placeholder] = &[Placeholder::Step, Placeholder::Pvc];
const STEP_FILTER: &[Placeholder] = &[Placeholder::Step, Placeholder::Filter1];
const STEP_FILTER_APP: &[Placeholder] = &[Placeholder::Step, Placeholder::Filter1, Placeholder::App];
const STEP_PVC_APP: &[Placeholder] = &[Placeholder::Step, Placeholder::Pvc, Placeholder::App];
const STEP_FILTER_SVC: &[Placeholder] = &[Placeholder::Step, Placeholder::Filter1, Placeholder::Svc];
const STEP_FILTERS: &[Placeholder] = &[Placeholder::Step, Placeholder::Filter1, Placeholder::Filter2];

static BUILTIN_TEMPLATES: &[TemplateSpec] = &[
    // cluster
    meter(
        "meter_cluster_cpu_usage",
        Level::Cluster,
        MeterResource::Cpu,
        STEP,
        r#"
round(
    (
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="cpu",unit="core"}[1h])[$step:1h])
        ) >=
        (
            sum_over_time(avg_over_time(:node_cpu_utilisation:avg1m[1h])[$step:1h]) *
            sum(
                sum_over_time(avg_over_time(node:node_num_cpu:sum[1h])[$step:1h])
            )
        )
    )
    or
    (
        (
            sum_over_time(avg_over_time(:node_cpu_utilisation:avg1m[1h])[$step:1h]) *
            sum(
                sum_over_time(avg_over_time(node:node_num_cpu:sum[1h])[$step:1h])
            )
        ) >
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="cpu",unit="core"}[1h])[$step:1h])
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_cluster_memory_usage",
        Level::Cluster,
        MeterResource::Memory,
        STEP,
        r#"
round(
    (
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="memory",unit="byte"}[1h])[$step:1h])
        ) >=
        (
            sum_over_time(avg_over_time(:node_memory_utilisation:[1h])[$step:1h]) *
            sum(
                sum_over_time(avg_over_time(node:node_memory_bytes_total:sum[1h])[$step:1h])
            )
        )
    )
    or
    (
        (
            sum_over_time(avg_over_time(:node_memory_utilisation:[1h])[$step:1h]) *
            sum(
                sum_over_time(avg_over_time(node:node_memory_bytes_total:sum[1h])[$step:1h])
            )
        ) >
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="memory",unit="byte"}[1h])[$step:1h])
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_cluster_net_bytes_transmitted",
        Level::Cluster,
        MeterResource::NetEgress,
        STEP,
        r#"
round(
    sum(
        sum_over_time(
            increase(
                node_network_transmit_bytes_total{
                    job="node-exporter",
                    device!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)"
                }[1h]
            )[$step:1h]
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_cluster_net_bytes_received",
        Level::Cluster,
        MeterResource::NetIngress,
        STEP,
        r#"
round(
    sum(
        sum_over_time(
            increase(
                node_network_receive_bytes_total{
                    job="node-exporter",
                    device!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)"
                }[1h]
            )[$step:1h]
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_cluster_pvc_bytes_total",
        Level::Cluster,
        MeterResource::Pvc,
        STEP,
        r#"
sum(
    topk(1, sum_over_time(avg_over_time(namespace:pvc_bytes_pod:sum{}[1h])[$step:1h])) by (persistentvolumeclaim)
)"#,
    ),
    // node
    meter(
        "meter_node_cpu_usage",
        Level::Node,
        MeterResource::Cpu,
        STEP_NODE,
        r#"
round(
    (
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="cpu",unit="core", $nodeSelector}[1h])[$step:1h])
        ) by (node) >=
        sum(
            sum_over_time(avg_over_time(node:node_cpu_utilisation:avg1m{$nodeSelector}[1h])[$step:1h]) *
            sum_over_time(avg_over_time(node:node_num_cpu:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node)
    )
    or
    (
        sum(
            sum_over_time(avg_over_time(node:node_cpu_utilisation:avg1m{$nodeSelector}[1h])[$step:1h]) *
            sum_over_time(avg_over_time(node:node_num_cpu:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node) >
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="cpu",unit="core", $nodeSelector}[1h])[$step:1h])
        ) by (node)
    )
    or
    (
        sum(
            sum_over_time(avg_over_time(node:node_cpu_utilisation:avg1m{$nodeSelector}[1h])[$step:1h]) *
            sum_over_time(avg_over_time(node:node_num_cpu:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node)
    ),
    0.001
)"#,
    ),
    meter(
        "meter_node_memory_usage_wo_cache",
        Level::Node,
        MeterResource::Memory,
        STEP_NODE,
        r#"
round(
    (
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="memory",unit="byte", $nodeSelector}[1h])[$step:1h])
        ) by (node) >=
        sum(
            sum_over_time(avg_over_time(node:node_memory_bytes_total:sum{$nodeSelector}[1h])[$step:1h]) -
            sum_over_time(avg_over_time(node:node_memory_bytes_available:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node)
    )
    or
    (
        sum(
            sum_over_time(avg_over_time(node:node_memory_bytes_total:sum{$nodeSelector}[1h])[$step:1h]) -
            sum_over_time(avg_over_time(node:node_memory_bytes_available:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node) >
        sum(
            sum_over_time(avg_over_time(kube_pod_container_resource_requests{resource="memory",unit="byte", $nodeSelector}[1h])[$step:1h])
        ) by (node)
    )
    or
    (
        sum(
            sum_over_time(avg_over_time(node:node_memory_bytes_total:sum{$nodeSelector}[1h])[$step:1h]) -
            sum_over_time(avg_over_time(node:node_memory_bytes_available:sum{$nodeSelector}[1h])[$step:1h])
        ) by (node)
    ),
    0.001
)"#,
    ),
    meter(
        "meter_node_net_bytes_transmitted",
        Level::Node,
        MeterResource::NetEgress,
        STEP_INSTANCE,
        r#"
round(
    sum by (node) (
        sum without (instance) (
            label_replace(
                sum_over_time(
                    increase(
                        node_network_transmit_bytes_total{
                            job="node-exporter",
                            device!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                            $instanceSelector
                        }[1h]
                    )[$step:1h]
                ),
                "node",
                "$1",
                "instance",
                "(.*)"
            )
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_node_net_bytes_received",
        Level::Node,
        MeterResource::NetIngress,
        STEP_INSTANCE,
        r#"
round(
    sum by (node) (
        sum without (instance) (
            label_replace(
                sum_over_time(
                    increase(
                        node_network_receive_bytes_total{
                            job="node-exporter",
                            device!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                            $instanceSelector
                        }[1h]
                    )[$step:1h]
                ),
                "node", "
                $1",
                "instance",
                "(.*)"
            )
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_node_pvc_bytes_total",
        Level::Node,
        MeterResource::Pvc,
        STEP_PVC,
        r#"
sum(
    topk(
        1,
        sum_over_time(
            avg_over_time(
                namespace:pvc_bytes_pod:sum{$pvc}[1h]
            )[$step:1h]
        )
    ) by (persistentvolumeclaim, node)
) by (node)"#,
    ),
    // workspace
    meter(
        "meter_workspace_cpu_usage",
        Level::Workspace,
        MeterResource::Cpu,
        STEP_FILTER,
        r#"
round(
    (
        sum by (workspace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        namespace!="",
                        resource="cpu",
                        $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (workspace) (
            sum_over_time(
                avg_over_time(namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h])[$step:1h]
            )
        )
    )
    or
    (
        sum by (workspace) (
            sum_over_time(
                avg_over_time(namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h])[$step:1h]
            )
        ) >
        sum by (workspace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        namespace!="",
                        resource="cpu",
                        $1
                    }[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (workspace) (
            sum_over_time(
                avg_over_time(namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h])[$step:1h]
            )
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_workspace_memory_usage",
        Level::Workspace,
        MeterResource::Memory,
        STEP_FILTER,
        r#"
round(
    (
        sum by (workspace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        namespace!="",
                        resource="memory",
                        $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (workspace) (
            sum_over_time(avg_over_time(namespace:container_memory_usage_bytes:sum{namespace!="", $1}[1h])[$step:1h])
        )
    )
    or
    (
        sum by (workspace) (
            sum_over_time(avg_over_time(namespace:container_memory_usage_bytes:sum{namespace!="", $1}[1h])[$step:1h])
        ) >
        sum by (workspace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                    owner_kind!="Job", namespace!="", resource="memory", $1
                    }[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (workspace) (
            sum_over_time(avg_over_time(namespace:container_memory_usage_bytes:sum{namespace!="", $1}[1h])[$step:1h])
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_workspace_net_bytes_transmitted",
        Level::Workspace,
        MeterResource::NetEgress,
        STEP_FILTER,
        r#"
round(
    sum by (workspace) (
        sum by (namespace) (
            sum_over_time(
                increase(
                    container_network_transmit_bytes_total{
                        namespace!="",
                        pod!="",
                        interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                        job="kubelet"
                    }[1h]
                )[$step:1h]
            )
        ) * on (namespace) group_left(workspace)
        kube_namespace_labels{$1}
    ) or on(workspace) max by(workspace) (kube_namespace_labels{$1} * 0), 1)"#,
    ),
    meter(
        "meter_workspace_net_bytes_received",
        Level::Workspace,
        MeterResource::NetIngress,
        STEP_FILTER,
        r#"
round(
    sum by (workspace) (
        sum by (namespace) (
            sum_over_time(
                increase(
                    container_network_receive_bytes_total{
                        namespace!="",
                        pod!="",
                        interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                        job="kubelet"
                    }[1h]
                )[$step:1h]
            )
        ) * on (namespace) group_left(workspace)
        kube_namespace_labels{$1}
    ) or on(workspace) max by(workspace) (kube_namespace_labels{$1} * 0), 1)"#,
    ),
    meter(
        "meter_workspace_pvc_bytes_total",
        Level::Workspace,
        MeterResource::Pvc,
        STEP_PVC,
        r#"
sum (
    topk(
        1,
        sum_over_time(
            avg_over_time(namespace:pvc_bytes_pod:sum{$pvc}[1h])[$step:1h]
        )
    ) by (persistentvolumeclaim, workspace)
) by (workspace)"#,
    ),
    // namespace
    meter(
        "meter_namespace_cpu_usage",
        Level::Namespace,
        MeterResource::Cpu,
        STEP_FILTER,
        r#"
round(
    (
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        namespace!="",
                        resource="cpu",
                        $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (namespace) (
            sum_over_time(
                avg_over_time(namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h])[$step:1h]
            )
        )
    )
    or
    (
        sum by (namespace) (
            sum_over_time(avg_over_time(namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h])[$step:1h])
        ) >
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{owner_kind!="Job", namespace!="", resource="cpu", $1}[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:container_cpu_usage_seconds_total:sum_rate{namespace!="", $1}[1h]
                )[$step:1h]
            )
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_namespace_memory_usage_wo_cache",
        Level::Namespace,
        MeterResource::Memory,
        STEP_FILTER,
        r#"
round(
    (
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        namespace!="",
                        resource="memory",
                        $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (namespace) (
            sum_over_time(avg_over_time(namespace:container_memory_usage_bytes_wo_cache:sum{namespace!="", $1}[1h])[$step:1h])
        )
    )
    or
    (
        sum by (namespace) (
            sum_over_time(avg_over_time(namespace:container_memory_usage_bytes_wo_cache:sum{namespace!="", $1}[1h])[$step:1h])
        ) >
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job", namespace!="", resource="memory", $1
                    }[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (namespace) (
            sum_over_time(
                avg_over_time(
                    namespace:container_memory_usage_bytes_wo_cache:sum{namespace!="", $1}[1h]
                )[$step:1h]
            )
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_namespace_net_bytes_transmitted",
        Level::Namespace,
        MeterResource::NetEgress,
        STEP_FILTER,
        r#"
round(
    sum by (namespace) (
        sum_over_time(
            increase(
                container_network_transmit_bytes_total{
                    namespace!="",
                    pod!="",
                    interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                    job="kubelet"
                }[1h]
            )[$step:1h]
        )
        * on (namespace) group_left(workspace)
        kube_namespace_labels{$1}
    )
    or on(namespace) max by(namespace) (kube_namespace_labels{$1} * 0), 1)"#,
    ),
    meter(
        "meter_namespace_net_bytes_received",
        Level::Namespace,
        MeterResource::NetIngress,
        STEP_FILTER,
        r#"
round(
    sum by (namespace) (
        sum_over_time(
            increase(
                container_network_receive_bytes_total{
                    namespace!="",
                    pod!="",
                    interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                    job="kubelet"
                }[1h]
            )[$step:1h]
        )
        * on (namespace) group_left(workspace)
        kube_namespace_labels{$1}
    )
    or on(namespace) max by(namespace) (kube_namespace_labels{$1} * 0), 1)"#,
    ),
    meter(
        "meter_namespace_pvc_bytes_total",
        Level::Namespace,
        MeterResource::Pvc,
        STEP_PVC,
        r#"
sum (
    topk(
        1,
        sum_over_time(
            avg_over_time(namespace:pvc_bytes_pod:sum{$pvc}[1h])[$step:1h]
        )
    ) by (persistentvolumeclaim, namespace)
) by (namespace)"#,
    ),
    // application
    meter(
        "meter_application_cpu_usage",
        Level::Application,
        MeterResource::Cpu,
        STEP_FILTER_APP,
        r#"
round(
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(
                    avg_over_time(
                        namespace:kube_workload_resource_request:sum{workload!~"Job:.+", resource="cpu", $1}[1h]
                    )[$step:1h]
                ),
                "application",
                "$app",
                "",
                ""
            )
        ) >=
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        ) >
        sum by (namespace, application) (
            label_replace(
                sum_over_time(
                    avg_over_time(
                        namespace:kube_workload_resource_request:sum{workload!~"Job:.+", resource="cpu", $1}[1h]
                    )[$step:1h]
                ),
                "application",
                "$app",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_application_memory_usage_wo_cache",
        Level::Application,
        MeterResource::Memory,
        STEP_FILTER_APP,
        r#"
round(
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(
                    avg_over_time(
                        namespace:kube_workload_resource_request:sum{workload!~"Job:.+", resource="memory", $1}[1h]
                    )[$step:1h]
                ),
                "application",
                "$app",
                "",
                ""
            )
        ) >=
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        ) >
        sum by (namespace, application) (
            label_replace(
                sum_over_time(
                    avg_over_time(
                        namespace:kube_workload_resource_request:sum{workload!~"Job:.+", resource="memory", $1}[1h]
                    )[$step:1h]
                ),
                "application",
                "$app",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, application) (
            label_replace(
                sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h]),
                "application",
                "$app",
                "",
                ""
            )
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_application_net_bytes_transmitted",
        Level::Application,
        MeterResource::NetEgress,
        STEP_FILTER_APP,
        r#"
round(
    sum by (namespace, application) (
        label_replace(
            sum_over_time(
                increase(
                    namespace:workload_net_bytes_transmitted:sum{$1}[1h]
                )[$step:1h]
            ),
            "application",
            "$app",
            "",
            ""
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_application_net_bytes_received",
        Level::Application,
        MeterResource::NetIngress,
        STEP_FILTER_APP,
        r#"
sum by (namespace, application) (
    label_replace(
        sum_over_time(
            increase(
                namespace:workload_net_bytes_received:sum{$1}[1h]
            )[$step:1h]
        ),
        "application",
        "$app",
        "",
        ""
    )
)"#,
    ),
    meter(
        "meter_application_pvc_bytes_total",
        Level::Application,
        MeterResource::Pvc,
        STEP_PVC_APP,
        r#"
sum by (namespace, application) (
    label_replace(
        topk(1, sum_over_time(avg_over_time(namespace:pvc_bytes_pod:sum{$pvc}[1h])[$step:1h])) by (persistentvolumeclaim),
        "application",
        "$app",
        "",
        ""
    )
)"#,
    ),
    // workload
    meter(
        "meter_workload_cpu_usage",
        Level::Workload,
        MeterResource::Cpu,
        STEP_FILTER,
        r#"
round(
    (
        sum by (namespace, workload) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_workload_resource_request:sum{
                        workload!~"Job:.+", resource="cpu", $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h])
        )
    )
    or
    (
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h])
        ) >
        sum by (namespace, workload) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_workload_resource_request:sum{
                        workload!~"Job:.+", resource="cpu", $1
                    }[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_cpu_usage:sum{$1}[1h])[$step:1h])
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_workload_memory_usage_wo_cache",
        Level::Workload,
        MeterResource::Memory,
        STEP_FILTER,
        r#"
round(
    (
        sum by (namespace, workload) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_workload_resource_request:sum{
                        workload!~"Job:.+", resource="memory", $1
                    }[1h]
                )[$step:1h]
            )
        ) >=
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h])
        )
    )
    or
    (
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h])
        ) >
        sum by (namespace, workload) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_workload_resource_request:sum{
                        workload!~"Job:.+", resource="memory", $1
                    }[1h]
                )[$step:1h]
            )
        )
    )
    or
    (
        sum by (namespace, workload) (
            sum_over_time(avg_over_time(namespace:workload_memory_usage_wo_cache:sum{$1}[1h])[$step:1h])
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_workload_net_bytes_transmitted",
        Level::Workload,
        MeterResource::NetEgress,
        STEP_FILTER,
        r#"
round(
    sum_over_time(
        increase(
            namespace:workload_net_bytes_transmitted:sum{$1}[1h]
        )[$step:1h]
    ),
    1
)"#,
    ),
    meter(
        "meter_workload_net_bytes_received",
        Level::Workload,
        MeterResource::NetIngress,
        STEP_FILTER,
        r#"
round(
    sum_over_time(
        increase(
            namespace:workload_net_bytes_received:sum{$1}[1h]
        )[$step:1h]
    ),
    1
)"#,
    ),
    meter(
        "meter_workload_pvc_bytes_total",
        Level::Workload,
        MeterResource::Pvc,
        STEP_FILTER,
        r#"
sum by (namespace, workload) (
    topk(
        1,
        sum_over_time(avg_over_time(namespace:pvc_bytes_pod:sum{$1}[1h])[$step:1h])
    ) by (persistentvolumeclaim, namespace, workload)
)"#,
    ),
    // service
    meter(
        "meter_service_cpu_usage",
        Level::Service,
        MeterResource::Cpu,
        STEP_FILTER_SVC,
        r#"
round(
    sum by (namespace, service) (
        label_replace(
            sum by (namespace, pod) (
                sum_over_time(
                    avg_over_time(
                        namespace:kube_pod_resource_request:sum{owner_kind!="Job", resource="cpu", $1}[1h]
                    )[$step:1h]
                )
            ) >=
            sum by (namespace, pod) (
                sum by (namespace, pod) (
                    sum_over_time(
                        irate(
                            container_cpu_usage_seconds_total{job="kubelet", pod!="", image!=""}[1h]
                        )[$step:1h]
                    )
                ) * on (namespace, pod) group_left(owner_kind, owner_name)
                kube_pod_owner{} * on (namespace, pod) group_left(node)
                kube_pod_info{$1}
            ),
            "service",
            "$svc",
            "",
            ""
        )
    )
    or
    sum by (namespace, service) (
        label_replace(
            sum by (namespace, pod) (
                sum by (namespace, pod) (
                    sum_over_time(
                        irate(
                            container_cpu_usage_seconds_total{job="kubelet", pod!="", image!=""}[1h]
                        )[$step:1h]
                    )
                ) * on (namespace, pod) group_left(owner_kind, owner_name)
                kube_pod_owner{} * on (namespace, pod) group_left(node)
                kube_pod_info{$1}
            ) >
            sum by (namespace, pod) (
                sum_over_time(
                    avg_over_time(namespace:kube_pod_resource_request:sum{owner_kind!="Job", resource="cpu", $1}[1h])[$step:1h]
                )
            ),
            "service",
            "$svc",
            "",
            ""
        )
    )
    or
    sum by (namespace, service) (
        label_replace(
            sum by (namespace, pod) (
                sum by (namespace, pod) (
                    sum_over_time(
                        irate(
                            container_cpu_usage_seconds_total{job="kubelet", pod!="", image!=""}[1h]
                        )[$step:1h]
                    )
                ) * on (namespace, pod) group_left(owner_kind, owner_name)
                kube_pod_owner{} * on (namespace, pod) group_left(node)
                kube_pod_info{$1}
            ),
            "service",
            "$svc",
            "",
            ""
        )
    ),
    0.001
)"#,
    ),
    meter(
        "meter_service_memory_usage_wo_cache",
        Level::Service,
        MeterResource::Memory,
        STEP_FILTER_SVC,
        r#"
round(
    (
        sum by (namespace, service) (
            label_replace(
                sum by (namespace, pod) (
                    sum_over_time(
                        avg_over_time(
                            namespace:kube_pod_resource_request:sum{owner_kind!="Job", resource="memory", $1}[1h]
                        )[$step:1h]
                    )
                ) >=
                sum by (namespace, pod) (
                    sum by (namespace, pod) (
                        sum_over_time(
                            avg_over_time(
                                container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h]
                            )[$step:1h]
                        )
                    ) * on (namespace, pod) group_left(owner_kind, owner_name)
                    kube_pod_owner{} * on (namespace, pod) group_left(node)
                    kube_pod_info{$1}
                ),
                "service",
                "$svc",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, service) (
            label_replace(
                sum by (namespace, pod) (
                    sum by (namespace, pod) (
                        sum_over_time(
                            avg_over_time(
                                container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h]
                            )[$step:1h]
                        )
                    ) * on (namespace, pod) group_left(owner_kind, owner_name)
                    kube_pod_owner{} * on (namespace, pod) group_left(node)
                    kube_pod_info{$1}
                ) >
                sum by (namespace, pod) (
                    sum_over_time(
                        avg_over_time(
                            namespace:kube_pod_resource_request:sum{owner_kind!="Job", resource="memory", $1}[1h]
                        )[$step:1h]
                    )
                ),
                "service",
                "$svc",
                "",
                ""
            )
        )
    )
    or
    (
        sum by (namespace, service) (
            label_replace(
                sum by (namespace, pod) (
                    sum by (namespace, pod) (
                        sum_over_time(
                            avg_over_time(
                                container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h]
                            )[$step:1h]
                        )
                    ) * on (namespace, pod) group_left(owner_kind, owner_name)
                    kube_pod_owner{} * on (namespace, pod) group_left(node)
                    kube_pod_info{$1}
                ),
                "service",
                "$svc",
                "",
                ""
            )
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_service_net_bytes_transmitted",
        Level::Service,
        MeterResource::NetEgress,
        STEP_FILTER_SVC,
        r#"
round(
    sum by (namespace, service) (
        label_replace(
            sum by (namespace, pod) (
                sum by (namespace, pod) (
                    sum_over_time(
                        increase(
                            container_network_transmit_bytes_total{
                                pod!="",
                                interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                                job="kubelet"
                            }[1h]
                        )[$step:1h]
                    )
                ) * on (namespace, pod) group_left(owner_kind, owner_name)
                kube_pod_owner{} * on (namespace, pod) group_left(node)
                kube_pod_info{$1}
            ),
            "service",
            "$svc",
            "",
            ""
        )
    ),
    1
)"#,
    ),
    meter(
        "meter_service_net_bytes_received",
        Level::Service,
        MeterResource::NetIngress,
        STEP_FILTER_SVC,
        r#"
round(
    label_replace(
        sum by (namepace, pod) (
            sum by (namespace, pod) (
                sum_over_time(
                    increase(
                        container_network_receive_bytes_total{
                            pod!="",
                            interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)",
                            job="kubelet"
                        }[1h]
                    )[$step:1h]
                )
            ) * on (namespace, pod) group_left(owner_kind, owner_name)
            kube_pod_owner{} * on (namespace, pod) group_left(node)
            kube_pod_info{$1}
        ),
        "service",
        "$svc",
        "",
        ""
    ),
    1
)"#,
    ),
    // pod
    meter(
        "meter_pod_cpu_usage",
        Level::Pod,
        MeterResource::Cpu,
        STEP_FILTERS,
        r#"
round(
    (
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        resource="cpu",
                    }[1h]
                )[$step:1h]
            )
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2} >=
        sum by (namespace, pod) (
            sum_over_time(
                irate(container_cpu_usage_seconds_total{job="kubelet",pod!="",image!=""}[1h])[$step:1h]
            )
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2}
    )
    or
    (
        sum by (namespace, pod) (
            sum_over_time(irate(container_cpu_usage_seconds_total{job="kubelet",pod!="",image!=""}[1h])[$step:1h])
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2} >
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        resource="cpu",
                    }[1h]
                )[$step:1h]
            )
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2}
    )
    or
    (
        sum by (namespace, pod) (
            sum_over_time(irate(container_cpu_usage_seconds_total{job="kubelet",pod!="",image!=""}[1h])[$step:1h])
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2}
    ),
    0.001
)"#,
    ),
    meter(
        "meter_pod_memory_usage_wo_cache",
        Level::Pod,
        MeterResource::Memory,
        STEP_FILTERS,
        r#"
round(
    (
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        resource="memory",
                    }[1h]
                )[$step:1h]
            )
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2} >=
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h])[$step:1h]
            )
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2}
    )
    or
    (
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h])[$step:1h])
            )
            * on (namespace, pod) group_left(owner_kind, owner_name)
            kube_pod_owner{$1}
            * on (namespace, pod) group_left(node)
            kube_pod_info{$2} >
        sum by (namespace, pod) (
            sum_over_time(
                avg_over_time(
                    namespace:kube_pod_resource_request:sum{
                        owner_kind!="Job",
                        resource="memory",
                    }[1h]
                )[$step:1h]
            )
            * on (namespace, pod) group_left(owner_kind, owner_name)
            kube_pod_owner{$1}
            * on (namespace, pod) group_left(node)
            kube_pod_info{$2}
        )
    )
    or
    (
        sum by (namespace, pod) (
            sum_over_time(avg_over_time(container_memory_working_set_bytes{job="kubelet", pod!="", image!=""}[1h])[$step:1h])
        )
        * on (namespace, pod) group_left(owner_kind, owner_name)
        kube_pod_owner{$1}
        * on (namespace, pod) group_left(node)
        kube_pod_info{$2}
    ),
    0.001
)"#,
    ),
    meter(
        "meter_pod_net_bytes_transmitted",
        Level::Pod,
        MeterResource::NetEgress,
        STEP_FILTERS,
        r#"
sum by (namespace, pod) (
    sum_over_time(
        increase(
            container_network_transmit_bytes_total{
                pod!="", interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)", job="kubelet"
            }[1h]
        )[$step:1h]
    )
)
* on (namespace, pod) group_left(owner_kind, owner_name) kube_pod_owner{$1}
* on (namespace, pod) group_left(node) kube_pod_info{$2}"#,
    ),
    meter(
        "meter_pod_net_bytes_received",
        Level::Pod,
        MeterResource::NetIngress,
        STEP_FILTERS,
        r#"
sum by (namespace, pod) (
    sum_over_time(
        increase(
            container_network_receive_bytes_total{
                pod!="", interface!~"^(cali.+|tunl.+|dummy.+|kube.+|flannel.+|cni.+|docker.+|veth.+|lo.*)", job="kubelet"
            }[1h]
        )[$step:1h]
    )
)
* on (namespace, pod) group_left(owner_kind, owner_name) kube_pod_owner{$1}
* on (namespace, pod) group_left(node) kube_pod_info{$2}"#,
    ),
    meter(
        "meter_pod_pvc_bytes_total",
        Level::Pod,
        MeterResource::Pvc,
        STEP_FILTERS,
        r#"
sum by (namespace, pod) (
    sum_over_time(avg_over_time(namespace:pvc_bytes_pod:sum{}[1h])[$step:1h])
)
* on (namespace, pod) group_left(owner_kind, owner_name) kube_pod_owner{$1}
* on (namespace, pod) group_left(node) kube_pod_info{$2}"#,
    ),
];

// ============================================================================
// SECTION 12: PLACEHOLDER RENDERER
// ============================================================================

/// Collapses every whitespace run to one space and trims the ends
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves the scope-independent placeholders of a template
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    /// Substitution order; positional slots are left to the level scopes
    pub const ORDER: [Placeholder; 6] = [
        Placeholder::Step,
        Placeholder::Pvc,
        Placeholder::NodeSelector,
        Placeholder::InstanceSelector,
        Placeholder::App,
        Placeholder::Svc,
    ];

    pub fn render(&self, template: &MeterTemplate, options: &QueryOptions) -> Result<String, UsageError> {
        let meter = options.meter_options.as_ref().ok_or_else(|| {
            error!(target: "meterql::compile", metric = template.name(), "meter options not found");
            UsageError::MissingMeterOptions
        })?;

        let values: SmallVec<[(Placeholder, String); 6]> = Self::ORDER
            .iter()
            .copied()
            .filter(|p| template.declares(*p))
            .map(|p| (p, Self::value_for(p, meter, options)))
            .collect();

        Ok(substitute(&collapse_whitespace(template.text()), &values))
    }

    fn value_for(placeholder: Placeholder, meter: &MeterOptions, options: &QueryOptions) -> String {
        match placeholder {
            Placeholder::Step => format!("{}h", meter.step_hours()),
            Placeholder::Pvc => pvc_clause(options),
            Placeholder::NodeSelector => node_clause("node", options),
            Placeholder::InstanceSelector => node_clause("instance", options),
            Placeholder::App => replacement_literal(non_empty(&options.application_name).unwrap_or_default()),
            Placeholder::Svc => replacement_literal(non_empty(&options.service_name).unwrap_or_default()),
            Placeholder::Filter1 | Placeholder::Filter2 => String::new(),
        }
    }
}

/// `label_replace` expands `$` in its replacement, so literal names double it
fn replacement_literal(value: &str) -> String {
    escape_label_value(value).replace('$', "$$")
}

/// Exact node name wins over the resource regex
fn push_node_identity(matchers: &mut MatcherList, label: &str, options: &QueryOptions) {
    match (non_empty(&options.node_name), non_empty(&options.resource_filter)) {
        (Some(name), _) => matchers.push(LabelMatcher::eq(label, name)),
        (None, Some(pattern)) => matchers.push(LabelMatcher::regex(label, pattern)),
        (None, None) => {}
    }
}

fn node_clause(label: &str, options: &QueryOptions) -> String {
    let mut matchers = MatcherList::new();
    push_node_identity(&mut matchers, label, options);
    matchers.join(", ")
}

fn push_claim_matchers(matchers: &mut MatcherList, options: &QueryOptions) {
    matchers.push_regex("persistentvolumeclaim", non_empty(&options.pvc_filter));
    matchers.push_exact("storageclass", non_empty(&options.storage_class_name));
}

/// Level-aware PVC clause: scope identity, claim regex, storage class
fn pvc_clause(options: &QueryOptions) -> String {
    let mut matchers = MatcherList::new();

    match options.level {
        Level::Node => {
            push_node_identity(&mut matchers, "node", options);
            push_claim_matchers(&mut matchers, options);
        }
        Level::Workspace => {
            push_workspace_identity(&mut matchers, options);
            push_claim_matchers(&mut matchers, options);
        }
        Level::Namespace => {
            push_namespace_identity(&mut matchers, options);
            push_claim_matchers(&mut matchers, options);
        }
        Level::Application => {
            matchers.push_exact("namespace", non_empty(&options.namespace_name));
            // Always present: an application without claims must match nothing.
            matchers.push(LabelMatcher::regex(
                "persistentvolumeclaim",
                options.pvc_filter.as_deref().unwrap_or_default(),
            ));
            matchers.push_exact("storageclass", non_empty(&options.storage_class_name));
        }
        Level::Cluster | Level::Workload | Level::Service | Level::Pod => {}
    }

    matchers.join(",")
}

// ============================================================================
// SECTION 13: LEVEL SCOPES
// ============================================================================
// One strategy per level fills the positional slots `$1` and `$2`. Exact
// identity filters always win over regex filters, and a level with no
// filters injects nothing.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Strategy Trait
// ----------------------------------------------------------------------------

const MATCHER_SEPARATOR: &str = ", ";

/// Values for the two positional filter slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionalFilters {
    pub first: String,
    pub second: String,
}

impl PositionalFilters {
    fn first(matchers: MatcherList) -> Self {
        Self { first: matchers.join(MATCHER_SEPARATOR), second: String::new() }
    }
}

pub trait LevelScope: Send + Sync + Debug {
    fn level(&self) -> Level;

    fn positional_filters(&self, _template: &MeterTemplate, _options: &QueryOptions) -> PositionalFilters {
        PositionalFilters::default()
    }

    /// Fills the positional slots the template declares
    fn apply(&self, rendered: &str, template: &MeterTemplate, options: &QueryOptions) -> String {
        let filters = self.positional_filters(template, options);

        let mut values: SmallVec<[(Placeholder, String); 2]> = SmallVec::new();
        if template.declares(Placeholder::Filter1) {
            values.push((Placeholder::Filter1, filters.first));
        }
        if template.declares(Placeholder::Filter2) {
            values.push((Placeholder::Filter2, filters.second));
        }

        if values.is_empty() {
            return rendered.to_string();
        }
        substitute(rendered, &values)
    }
}

impl Level {
    pub fn scope(&self) -> &'static dyn LevelScope {
        match self {
            Level::Cluster => &ClusterScope,
            Level::Node => &NodeScope,
            Level::Workspace => &WorkspaceScope,
            Level::Namespace => &NamespaceScope,
            Level::Application => &ApplicationScope,
            Level::Workload => &WorkloadScope,
            Level::Service => &ServiceScope,
            Level::Pod => &PodScope,
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Cluster & Node
// ----------------------------------------------------------------------------

/// Templates are used as rendered
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterScope;

impl LevelScope for ClusterScope {
    fn level(&self) -> Level {
        Level::Cluster
    }
}

/// Node selectors are resolved by the renderer
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeScope;

impl LevelScope for NodeScope {
    fn level(&self) -> Level {
        Level::Node
    }
}

// ----------------------------------------------------------------------------
// 13.3 Workspace & Namespace
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkspaceScope;

impl LevelScope for WorkspaceScope {
    fn level(&self) -> Level {
        Level::Workspace
    }

    fn positional_filters(&self, _template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let mut matchers = MatcherList::new();
        push_workspace_identity(&mut matchers, options);
        PositionalFilters::first(matchers)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceScope;

impl LevelScope for NamespaceScope {
    fn level(&self) -> Level {
        Level::Namespace
    }

    fn positional_filters(&self, _template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let mut matchers = MatcherList::new();
        push_namespace_identity(&mut matchers, options);
        PositionalFilters::first(matchers)
    }
}

/// Exact workspace wins; a workspace regex also drops unassigned series
fn push_workspace_identity(matchers: &mut MatcherList, options: &QueryOptions) {
    match (non_empty(&options.workspace_name), non_empty(&options.resource_filter)) {
        (Some(workspace), _) => matchers.push(LabelMatcher::eq("workspace", workspace)),
        (None, Some(pattern)) => {
            matchers.push(LabelMatcher::regex("workspace", pattern));
            matchers.push(LabelMatcher::neq("workspace", ""));
        }
        (None, None) => {}
    }
}

fn push_namespace_identity(matchers: &mut MatcherList, options: &QueryOptions) {
    match non_empty(&options.namespace_name) {
        Some(namespace) => matchers.push(LabelMatcher::eq("namespace", namespace)),
        None => {
            matchers.push_exact("workspace", non_empty(&options.workspace_name));
            matchers.push_regex("namespace", non_empty(&options.resource_filter));
        }
    }
}

// ----------------------------------------------------------------------------
// 13.4 Application & Workload
// ----------------------------------------------------------------------------

/// The resource filter carries the application's components (`Kind:name|...`)
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationScope;

impl LevelScope for ApplicationScope {
    fn level(&self) -> Level {
        Level::Application
    }

    fn positional_filters(&self, _template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let mut matchers = MatcherList::new();
        matchers.push_exact("namespace", non_empty(&options.namespace_name));
        matchers.push_regex("workload", non_empty(&options.resource_filter));
        PositionalFilters::first(matchers)
    }
}

/// PVC meters also receive the claim and storage class matchers
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadScope;

impl LevelScope for WorkloadScope {
    fn level(&self) -> Level {
        Level::Workload
    }

    fn positional_filters(&self, template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let mut matchers = MatcherList::new();
        matchers.push_exact("namespace", non_empty(&options.namespace_name));
        if let Some(workload) = workload_matcher(options) {
            matchers.push(workload);
        }
        if template.resource() == MeterResource::Pvc {
            push_claim_matchers(&mut matchers, options);
        }
        PositionalFilters::first(matchers)
    }
}

/// `workload` labels read `<Kind>:<name>`; an unknown kind matches any kind
fn workload_matcher(options: &QueryOptions) -> Option<LabelMatcher> {
    let kind = options.workload_kind.as_deref().and_then(WorkloadKind::parse);
    let kind_pattern = kind.map_or(".*", |k| k.as_label());

    match (non_empty(&options.workload_name), non_empty(&options.resource_filter)) {
        (Some(name), _) => Some(match kind {
            Some(kind) => LabelMatcher::eq("workload", format!("{kind}:{name}")),
            None => LabelMatcher::regex("workload", format!(".*:{name}")),
        }),
        (None, Some(pattern)) => Some(LabelMatcher::regex("workload", format!("{kind_pattern}:({pattern})"))),
        (None, None) => kind.map(|kind| LabelMatcher::regex("workload", format!("{kind}:.*"))),
    }
}

// ----------------------------------------------------------------------------
// 13.5 Service & Pod
// ----------------------------------------------------------------------------

/// The resource filter carries the service's pod names
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceScope;

impl LevelScope for ServiceScope {
    fn level(&self) -> Level {
        Level::Service
    }

    fn positional_filters(&self, _template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let mut matchers = MatcherList::new();
        matchers.push_exact("namespace", non_empty(&options.namespace_name));
        matchers.push_regex("pod", non_empty(&options.resource_filter));
        PositionalFilters::first(matchers)
    }
}

/// `$1` filters the ownership join (`kube_pod_owner`), `$2` the node join
/// (`kube_pod_info`). Raw owner/node filters are used verbatim when given.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodScope;

impl LevelScope for PodScope {
    fn level(&self) -> Level {
        Level::Pod
    }

    fn positional_filters(&self, _template: &MeterTemplate, options: &QueryOptions) -> PositionalFilters {
        let first = match non_empty(&options.owner_filter) {
            Some(raw) => raw.to_string(),
            None => owner_matchers(options).join(MATCHER_SEPARATOR),
        };

        let second = match non_empty(&options.node_filter) {
            Some(raw) => raw.to_string(),
            None => {
                let mut matchers = MatcherList::new();
                match (non_empty(&options.pod_name), non_empty(&options.resource_filter)) {
                    (Some(pod), _) => matchers.push(LabelMatcher::eq("pod", pod)),
                    (None, Some(pattern)) => matchers.push(LabelMatcher::regex("pod", pattern)),
                    (None, None) => {}
                }
                matchers.push_exact("namespace", non_empty(&options.namespace_name));
                matchers.push_exact("node", non_empty(&options.node_name));
                matchers.join(MATCHER_SEPARATOR)
            }
        };

        PositionalFilters { first, second }
    }
}

/// Deployment pods are owned by a ReplicaSet named `<deployment>-<hash>`
fn owner_matchers(options: &QueryOptions) -> MatcherList {
    let mut matchers = MatcherList::new();
    let kind = options.workload_kind.as_deref().and_then(WorkloadKind::parse);

    if let (Some(kind), Some(name)) = (kind, non_empty(&options.workload_name)) {
        match kind {
            WorkloadKind::Deployment => {
                matchers.push(LabelMatcher::eq("owner_kind", "ReplicaSet"));
                matchers.push(LabelMatcher::regex("owner_name", format!("^{name}-[^-]{{1,10}}$")));
            }
            WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => {
                matchers.push(LabelMatcher::eq("owner_kind", kind.as_label()));
                matchers.push(LabelMatcher::eq("owner_name", name));
            }
        }
    }
    matchers
}

// ============================================================================
// SECTION 14: METER COMPILER
// ============================================================================

/// Registry lookup, rendering and level scoping in one call
#[derive(Debug, Clone)]
pub struct MeterCompiler {
    registry: Arc<TemplateRegistry>,
    renderer: PlaceholderRenderer,
}

impl Default for MeterCompiler {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MeterCompiler {
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self { registry, renderer: PlaceholderRenderer }
    }

    /// Compiler over the shared built-in catalogue
    pub fn builtin() -> Self {
        Self::new(TemplateRegistry::shared())
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Compiles one meter into a PromQL expression
    #[instrument(level = "trace", target = "meterql::compile", skip(self, options), fields(level = %options.level))]
    pub fn compile(&self, metric: &str, options: &QueryOptions) -> MeterResult<String> {
        let template = self.registry.lookup(metric)?;
        template.check_level(options.level)?;
        options.validate()?;

        let rendered = self.renderer.render(template, options)?;
        let expr = options.level.scope().apply(&rendered, template, options);

        debug!(
            target: "meterql::compile",
            metric,
            level = %options.level,
            expr = %expr,
            "Compiled meter"
        );
        Ok(expr)
    }
}

// ============================================================================
// SECTION 15: COMPILER TESTS
// ============================================================================

#[cfg(test)]
mod compiler_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const SELECTOR_TOKENS: [&str; 6] = ["$step", "$pvc", "$nodeSelector", "$instanceSelector", "$app", "$svc"];

    fn hourly(level: Level) -> QueryOptions {
        QueryOptions::for_level(level).with_meter_options(MeterOptions::hourly())
    }

    fn compile(metric: &str, options: &QueryOptions) -> String {
        MeterCompiler::builtin().compile(metric, options).unwrap()
    }

    /// The template with `$step` as 1h and every other slot empty
    fn unfiltered(template: &MeterTemplate) -> String {
        let values: Vec<(Placeholder, String)> = template
            .placeholders()
            .iter()
            .map(|p| match p {
                Placeholder::Step => (*p, "1h".to_string()),
                Placeholder::Pvc if template.level() == Level::Application => {
                    (*p, "persistentvolumeclaim=~\"\"".to_string())
                }
                _ => (*p, String::new()),
            })
            .collect();
        substitute(&collapse_whitespace(template.text()), &values)
    }

    // ---- placeholders ----

    #[test]
    fn test_substitute_single_pass() {
        let values = vec![
            (Placeholder::Filter1, "a=\"$2\"".to_string()),
            (Placeholder::Filter2, "b=\"x\"".to_string()),
        ];
        assert_eq!(substitute("{$1} {$2} $3 $", &values), "{a=\"$2\"} {b=\"x\"} $3 $");
    }

    #[test]
    fn test_placeholder_applicability() {
        assert!(Placeholder::Step.applies_to(Level::Cluster));
        assert!(Placeholder::NodeSelector.applies_to(Level::Node));
        assert!(!Placeholder::NodeSelector.applies_to(Level::Pod));
        assert!(Placeholder::Pvc.applies_to(Level::Application));
        assert!(!Placeholder::Pvc.applies_to(Level::Workload));
        assert!(!Placeholder::Filter1.applies_to(Level::Node));
        assert!(Placeholder::Filter2.applies_to(Level::Pod));
        assert!(!Placeholder::Filter2.applies_to(Level::Service));
    }

    #[test]
    fn test_label_matcher_rendering() {
        assert_eq!(LabelMatcher::eq("node", "n1").to_string(), r#"node="n1""#);
        assert_eq!(LabelMatcher::neq("workspace", "").to_string(), r#"workspace!="""#);
        assert_eq!(LabelMatcher::regex("pod", "a|b").to_string(), r#"pod=~"a|b""#);
        assert_eq!(LabelMatcher::not_regex("job", "x.*").to_string(), r#"job!~"x.*""#);
        assert_eq!(LabelMatcher::eq("namespace", r#"we"ird\"#).to_string(), r#"namespace="we\"ird\\""#);
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("\n  sum(\n\tfoo{a=\"b\"}  )\n"), "sum( foo{a=\"b\"} )");
    }

    // ---- registry ----

    #[test]
    fn test_builtin_catalogue_shape() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(registry.len(), 39);

        for level in Level::ALL {
            let expected = if level == Level::Service { 4 } else { 5 };
            assert_eq!(registry.names_for(level).len(), expected, "level {level}");
        }

        assert_eq!(registry.resource_of("meter_pod_pvc_bytes_total"), Some(MeterResource::Pvc));
        assert_eq!(registry.resource_of("meter_node_cpu_usage").map(|r| r.unit()), Some("cores"));
        assert!(registry.contains("meter_cluster_memory_usage"));
        assert!(registry.contains("meter_workspace_memory_usage"));
        assert!(registry.contains("meter_namespace_memory_usage_wo_cache"));
        assert!(!registry.contains("meter_service_pvc_bytes_total"));
    }

    #[test]
    fn test_builtin_templates_declare_their_tokens() {
        let registry = TemplateRegistry::builtin();

        for name in registry.meter_names() {
            let template = registry.get(name).unwrap();
            let text = template.text();

            assert!(template.check_level(template.level()).is_ok(), "{name}");
            for placeholder in template.placeholders() {
                assert!(text.contains(placeholder.token()), "{name} lacks {placeholder}");
            }
            for token in SELECTOR_TOKENS {
                let declared = template.placeholders().iter().any(|p| p.token() == token);
                assert_eq!(text.contains(token), declared, "{name} and {token}");
            }
        }
    }

    #[test]
    fn test_registry_lookup_unknown() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(
            registry.lookup("meter_cluster_gpu_usage").unwrap_err(),
            UsageError::UnknownMetric { metric: "meter_cluster_gpu_usage".into() }
        );
    }

    #[test]
    fn test_custom_registry_validation() {
        let good = MeterTemplate::new("custom", Level::Pod, MeterResource::Cpu, &[Placeholder::Filter1], "up{$1}");
        let registry = TemplateRegistry::from_templates(vec![good.clone()]).unwrap();
        assert_eq!(registry.len(), 1);

        let duplicate = TemplateRegistry::from_templates(vec![good.clone(), good]);
        assert!(duplicate.is_err());

        let undeclared = MeterTemplate::new("broken", Level::Pod, MeterResource::Cpu, &[Placeholder::Filter2], "up{$1}");
        assert!(TemplateRegistry::from_templates(vec![undeclared]).is_err());
    }

    // ---- rendering ----

    #[test]
    fn test_cluster_template_used_verbatim() {
        let registry = TemplateRegistry::builtin();
        let template = registry.get("meter_cluster_cpu_usage").unwrap();
        let expected = collapse_whitespace(template.text()).replace("$step", "1h");

        assert_eq!(compile("meter_cluster_cpu_usage", &hourly(Level::Cluster)), expected);
    }

    #[test]
    fn test_step_rendered_in_whole_hours() {
        let options = QueryOptions::for_level(Level::Cluster)
            .with_meter_options(MeterOptions::with_step(Duration::from_secs(3 * 3600)));
        let expr = compile("meter_cluster_net_bytes_received", &options);

        assert!(expr.contains("[3h:1h]"));
        assert!(!expr.contains("$step"));
    }

    #[test]
    fn test_missing_meter_options() {
        let err = MeterCompiler::builtin()
            .compile("meter_cluster_cpu_usage", &QueryOptions::for_level(Level::Cluster))
            .unwrap_err();
        assert!(matches!(err, MeterError::Usage(UsageError::MissingMeterOptions)));
    }

    #[test]
    fn test_unknown_metric() {
        let err = MeterCompiler::builtin().compile("meter_pod_gpu_usage", &hourly(Level::Pod)).unwrap_err();
        assert!(matches!(err, MeterError::Usage(UsageError::UnknownMetric { .. })));
    }

    #[test]
    fn test_placeholder_not_applicable_at_level() {
        let err = MeterCompiler::builtin().compile("meter_node_cpu_usage", &hourly(Level::Cluster)).unwrap_err();
        match err {
            MeterError::Usage(UsageError::PlaceholderNotApplicable { placeholder, level, .. }) => {
                assert_eq!(placeholder, Placeholder::NodeSelector);
                assert_eq!(level, Level::Cluster);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_regex_filter_rejected() {
        let options = hourly(Level::Node).with_resource_filter("node-(");
        let err = MeterCompiler::builtin().compile("meter_node_cpu_usage", &options).unwrap_err();
        assert!(matches!(err, MeterError::Usage(UsageError::InvalidFilter { .. })));
    }

    #[rstest]
    fn test_no_filters_injects_no_selector(
        #[values(
            Level::Cluster,
            Level::Node,
            Level::Workspace,
            Level::Namespace,
            Level::Application,
            Level::Workload,
            Level::Service,
            Level::Pod
        )]
        level: Level,
    ) {
        let registry = TemplateRegistry::builtin();
        for name in registry.names_for(level) {
            let template = registry.get(name).unwrap();
            assert_eq!(compile(name, &hourly(level)), unfiltered(template), "{name}");
        }
    }

    // ---- node ----

    #[test]
    fn test_node_name_beats_resource_filter() {
        let options = hourly(Level::Node).with_node_name("node-1").with_resource_filter("node-.*");

        let cpu = compile("meter_node_cpu_usage", &options);
        assert!(cpu.contains(r#"kube_pod_container_resource_requests{resource="cpu",unit="core", node="node-1"}"#));
        assert!(cpu.contains(r#"node:node_num_cpu:sum{node="node-1"}"#));
        assert!(!cpu.contains("node=~"));

        let net = compile("meter_node_net_bytes_transmitted", &options);
        assert!(net.contains(r#"instance="node-1" }"#));
        assert!(!net.contains("instance=~"));
    }

    #[test]
    fn test_node_resource_filter_regex() {
        let options = hourly(Level::Node).with_resource_filter("node-(1|2)");
        let cpu = compile("meter_node_memory_usage_wo_cache", &options);
        assert!(cpu.contains(r#"node:node_memory_bytes_total:sum{node=~"node-(1|2)"}"#));
    }

    #[test]
    fn test_node_label_replace_reference_survives() {
        let options = hourly(Level::Node).with_node_name("node-1");

        let transmitted = compile("meter_node_net_bytes_transmitted", &options);
        assert!(transmitted.contains(r#""node", "$1", "instance", "(.*)""#));

        // deployed template carries a leading space in the replacement
        let received = compile("meter_node_net_bytes_received", &options);
        assert!(received.contains(r#""node", " $1", "instance", "(.*)""#));
    }

    #[test]
    fn test_node_pvc_clause() {
        let options = hourly(Level::Node)
            .with_node_name("node-1")
            .with_pvc_filter("data-.*")
            .with_storage_class_name("ssd");
        let expr = compile("meter_node_pvc_bytes_total", &options);
        assert!(expr.contains(
            r#"namespace:pvc_bytes_pod:sum{node="node-1",persistentvolumeclaim=~"data-.*",storageclass="ssd"}"#
        ));
    }

    // ---- workspace / namespace ----

    #[test]
    fn test_workspace_exact_and_regex() {
        let exact = compile("meter_workspace_cpu_usage", &hourly(Level::Workspace).with_workspace_name("ws1"));
        assert!(exact.contains(r#"sum_rate{namespace!="", workspace="ws1"}"#));

        let regex = compile("meter_workspace_net_bytes_received", &hourly(Level::Workspace).with_resource_filter("ws.*"));
        assert!(regex.contains(r#"kube_namespace_labels{workspace=~"ws.*", workspace!=""}"#));
    }

    #[test]
    fn test_workspace_pvc_clause() {
        let expr = compile("meter_workspace_pvc_bytes_total", &hourly(Level::Workspace).with_workspace_name("ws1"));
        assert!(expr.contains(r#"namespace:pvc_bytes_pod:sum{workspace="ws1"}"#));
    }

    #[test]
    fn test_pvc_clause_follows_scope_precedence() {
        let workspace = compile(
            "meter_workspace_pvc_bytes_total",
            &hourly(Level::Workspace).with_resource_filter("ws-.*").with_storage_class_name("ssd"),
        );
        assert!(workspace.contains(r#"namespace:pvc_bytes_pod:sum{workspace=~"ws-.*",workspace!="",storageclass="ssd"}"#));

        let namespace = compile(
            "meter_namespace_pvc_bytes_total",
            &hourly(Level::Namespace)
                .with_workspace_name("ws1")
                .with_resource_filter("ns-a|ns-b")
                .with_pvc_filter("data-.*"),
        );
        assert!(namespace.contains(
            r#"namespace:pvc_bytes_pod:sum{workspace="ws1",namespace=~"ns-a|ns-b",persistentvolumeclaim=~"data-.*"}"#
        ));
    }

    #[rstest]
    #[case::workspace_exact(hourly(Level::Workspace).with_workspace_name("ws1"), vec![r#"workspace="ws1""#])]
    #[case::workspace_regex(
        hourly(Level::Workspace).with_resource_filter("ws-.*"),
        vec![r#"workspace=~"ws-.*""#, r#"workspace!="""#]
    )]
    #[case::namespace_exact(hourly(Level::Namespace).with_namespace_name("demo"), vec![r#"namespace="demo""#])]
    #[case::namespace_regex(hourly(Level::Namespace).with_resource_filter("ns-a|ns-b"), vec![r#"namespace=~"ns-a|ns-b""#])]
    #[case::namespace_in_workspace(hourly(Level::Namespace).with_workspace_name("ws1"), vec![r#"workspace="ws1""#])]
    #[case::namespace_regex_in_workspace(
        hourly(Level::Namespace).with_workspace_name("ws1").with_resource_filter("ns-a|ns-b"),
        vec![r#"workspace="ws1""#, r#"namespace=~"ns-a|ns-b""#]
    )]
    fn test_scope_matchers_reach_every_meter(#[case] options: QueryOptions, #[case] expected: Vec<&str>) {
        let registry = TemplateRegistry::builtin();
        let names = registry.names_for(options.level);
        assert!(!names.is_empty());

        for name in names {
            let expr = compile(name, &options);
            for matcher in &expected {
                assert!(expr.contains(matcher), "{name} is missing {matcher}: {expr}");
            }
        }
    }

    #[test]
    fn test_namespace_filters() {
        let exact = compile(
            "meter_namespace_cpu_usage",
            &hourly(Level::Namespace).with_namespace_name("demo").with_workspace_name("ws1"),
        );
        assert!(exact.contains(r#"sum_rate{namespace!="", namespace="demo"}"#));
        assert!(!exact.contains("workspace=\"ws1\""));

        let scoped = compile(
            "meter_namespace_net_bytes_transmitted",
            &hourly(Level::Namespace).with_workspace_name("ws1").with_resource_filter("demo|prod"),
        );
        assert!(scoped.contains(r#"kube_namespace_labels{workspace="ws1", namespace=~"demo|prod"}"#));
    }

    #[test]
    fn test_exact_values_are_escaped() {
        let expr = compile("meter_namespace_cpu_usage", &hourly(Level::Namespace).with_namespace_name("a\"b"));
        assert!(expr.contains(r#"namespace="a\"b""#));
    }

    // ---- application ----

    #[test]
    fn test_application_empty_claims_match_nothing() {
        let claims: Vec<String> = Vec::new();
        let options = hourly(Level::Application)
            .with_namespace_name("demo")
            .with_application_name("shop")
            .with_pvc_filter(pvc_filter_from_claims(&claims));
        let expr = compile("meter_application_pvc_bytes_total", &options);

        assert!(expr.contains(r#"namespace:pvc_bytes_pod:sum{namespace="demo",persistentvolumeclaim=~""}"#));
        assert!(expr.contains(r#""application", "shop", "", """#));
    }

    #[test]
    fn test_application_components_and_relabel() {
        let options = hourly(Level::Application)
            .with_namespace_name("demo")
            .with_application_name("shop")
            .with_resource_filter(component_filter(&["Deployment:web", "StatefulSet:db"]));
        let expr = compile("meter_application_cpu_usage", &options);

        assert!(expr.contains(
            r#"namespace:workload_cpu_usage:sum{namespace="demo", workload=~"Deployment:web|StatefulSet:db"}"#
        ));
        assert!(expr.contains(r#""application", "shop", "", """#));
        assert!(!expr.contains('$'));
    }

    #[test]
    fn test_relabel_names_keep_literal_dollar() {
        let options = hourly(Level::Application).with_namespace_name("demo").with_application_name("shop$1");
        let expr = compile("meter_application_cpu_usage", &options);
        assert!(expr.contains(r#""application", "shop$$1", "", """#));
    }

    // ---- workload ----

    #[test]
    fn test_workload_selectors() {
        let options = hourly(Level::Workload).with_namespace_name("demo").with_workload("deployment", "web");
        let cpu = compile("meter_workload_cpu_usage", &options);
        assert!(cpu.contains(r#"namespace:workload_cpu_usage:sum{namespace="demo", workload="Deployment:web"}"#));

        let any_kind = compile(
            "meter_workload_net_bytes_received",
            &hourly(Level::Workload).with_resource_filter("web|api"),
        );
        assert!(any_kind.contains(r#"namespace:workload_net_bytes_received:sum{workload=~".*:(web|api)"}"#));
    }

    #[test]
    fn test_workload_pvc_meter_gets_claim_matchers() {
        let options = hourly(Level::Workload)
            .with_namespace_name("demo")
            .with_workload("statefulset", "db")
            .with_pvc_filter("data-db-.*")
            .with_storage_class_name("standard");

        let pvc = compile("meter_workload_pvc_bytes_total", &options);
        assert!(pvc.contains(
            r#"namespace:pvc_bytes_pod:sum{namespace="demo", workload="StatefulSet:db", persistentvolumeclaim=~"data-db-.*", storageclass="standard"}"#
        ));

        let cpu = compile("meter_workload_cpu_usage", &options);
        assert!(!cpu.contains("persistentvolumeclaim"));
    }

    // ---- service ----

    #[test]
    fn test_service_selectors_and_relabel() {
        let options = hourly(Level::Service)
            .with_namespace_name("demo")
            .with_service_name("frontend")
            .with_resource_filter(pod_filter(&["web-1", "web-2"]));
        let expr = compile("meter_service_net_bytes_transmitted", &options);

        assert!(expr.contains(r#"kube_pod_info{namespace="demo", pod=~"web-1|web-2"}"#));
        assert!(expr.contains(r#""service", "frontend", "", """#));
        assert!(expr.contains("kube_pod_owner{}"));
    }

    #[test]
    fn test_service_received_keeps_deployed_grouping() {
        let expr = compile("meter_service_net_bytes_received", &hourly(Level::Service).with_service_name("frontend"));
        assert!(expr.contains("sum by (namepace, pod)"));
    }

    // ---- pod ----

    #[test]
    fn test_pod_raw_filters_fill_both_joins() {
        let options = hourly(Level::Pod)
            .with_owner_filter(r#"owner_kind="Deployment""#)
            .with_node_filter(r#"node="node-1""#);

        for metric in ["meter_pod_cpu_usage", "meter_pod_net_bytes_received", "meter_pod_pvc_bytes_total"] {
            let expr = compile(metric, &options);
            assert!(expr.contains(r#"group_left(owner_kind, owner_name) kube_pod_owner{owner_kind="Deployment"}"#));
            assert!(expr.contains(r#"group_left(node) kube_pod_info{node="node-1"}"#));
            assert!(!expr.contains("$1") && !expr.contains("$2"), "{metric}");
        }
    }

    #[test]
    fn test_pod_filters_derived_from_options() {
        let options = hourly(Level::Pod)
            .with_namespace_name("demo")
            .with_workload("deployment", "web")
            .with_pod_name("web-5d8f-abcde")
            .with_node_name("node-2");
        let expr = compile("meter_pod_memory_usage_wo_cache", &options);

        assert!(expr.contains(r#"kube_pod_owner{owner_kind="ReplicaSet", owner_name=~"^web-[^-]{1,10}$"}"#));
        assert!(expr.contains(r#"kube_pod_info{pod="web-5d8f-abcde", namespace="demo", node="node-2"}"#));
    }

    #[test]
    fn test_pod_daemonset_owner() {
        let options = hourly(Level::Pod).with_workload("daemonset", "agent").with_resource_filter("agent-.*");
        let expr = compile("meter_pod_net_bytes_transmitted", &options);

        assert!(expr.contains(r#"kube_pod_owner{owner_kind="DaemonSet", owner_name="agent"}"#));
        assert!(expr.contains(r#"kube_pod_info{pod=~"agent-.*"}"#));
    }

    proptest! {
        #[test]
        fn prop_compile_is_idempotent(
            level_index in 0usize..8,
            name in "[a-z][a-z0-9-]{0,12}",
            filter in "[a-z0-9-]{1,12}(\\|[a-z0-9-]{1,8})?",
            hours in 1u64..48,
        ) {
            let compiler = MeterCompiler::builtin();
            let level = Level::ALL[level_index];
            let options = QueryOptions::for_level(level)
                .with_resource_filter(filter)
                .with_namespace_name(name.clone())
                .with_workspace_name(name.clone())
                .with_application_name(name.clone())
                .with_service_name(name.clone())
                .with_meter_options(MeterOptions::with_step(Duration::from_secs(hours * 3600)));

            for metric in compiler.registry().names_for(level) {
                let first = compiler.compile(metric, &options).unwrap();
                let second = compiler.compile(metric, &options).unwrap();
                prop_assert_eq!(&first, &second);

                for token in SELECTOR_TOKENS {
                    prop_assert!(!first.contains(token), "{} kept {}", metric, token);
                }
                if level != Level::Node {
                    prop_assert!(!first.contains('$'), "{} kept a placeholder", metric);
                }
            }
        }
    }
}


// ============================================================================
// ██████╗ ██╗  ██╗ █████╗ ███████╗███████╗    ██████╗ 
// ██╔══██╗██║  ██║██╔══██╗██╔════╝██╔════╝    ╚════██╗
// ██████╔╝███████║███████║███████╗█████╗       █████╔╝
// ██╔═══╝ ██╔══██║██╔══██║╚════██║██╔══╝       ╚═══██╗
// ██║     ██║  ██║██║  ██║███████║███████╗    ██████╔╝
// ╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚══════╝    ╚═════╝ 
// EVALUATION - ISOLATION, TIME WINDOWS, SCALING, ENGINE
// ============================================================================

// ============================================================================
// SECTION 16: NAMESPACE ISOLATION
// ============================================================================
// Ad-hoc expressions are confined to one namespace by rewriting every vector
// selector. The scoper is picked once from configuration.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Backend Kinds
// ----------------------------------------------------------------------------

/// Metrics backends the compiled expressions can target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Prometheus,
}

impl BackendKind {
    pub const ALL: [BackendKind; 1] = [BackendKind::Prometheus];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Prometheus => "prometheus",
        }
    }

    pub fn namespace_scoper(&self) -> Box<dyn NamespaceScoper> {
        match self {
            BackendKind::Prometheus => Box::new(PrometheusNamespaceScoper),
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UsageError::UnsupportedBackend { backend: s.to_string() })
    }
}

// ----------------------------------------------------------------------------
// 16.2 Scoper Trait
// ----------------------------------------------------------------------------

pub trait NamespaceScoper: Send + Sync + Debug {
    fn backend(&self) -> BackendKind;

    /// Restricts `expr` to series of `namespace`; an empty namespace is a no-op
    fn scope(&self, expr: &str, namespace: &str) -> MeterResult<String>;
}

// ----------------------------------------------------------------------------
// 16.3 Prometheus Scoper
// ----------------------------------------------------------------------------

const NAMESPACE_LABEL: &str = "namespace";

/// Rewrites every vector and matrix selector of a parsed expression
///
/// Existing `namespace` matchers are replaced whatever their operator, and
/// each `or` group of a selector gets its own copy. Strings, grouping label
/// lists and function names never hold selectors, so they pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusNamespaceScoper;

impl NamespaceScoper for PrometheusNamespaceScoper {
    fn backend(&self) -> BackendKind {
        BackendKind::Prometheus
    }

    fn scope(&self, expr: &str, namespace: &str) -> MeterResult<String> {
        if namespace.is_empty() {
            return Ok(expr.to_string());
        }
        if !is_dns1123_label(namespace) {
            return Err(invalid_expression(format!("namespace '{namespace}' is not a valid DNS-1123 label")).into());
        }

        let mut ast = promql::parse(expr).map_err(invalid_expression)?;
        for_each_selector(&mut ast, &mut |selector| pin_namespace(selector, namespace));

        let scoped = ast.to_string();
        trace!(target: "meterql::engine", namespace, expr = %scoped, "Scoped expression");
        Ok(scoped)
    }
}

fn invalid_expression(message: impl Into<String>) -> UsageError {
    UsageError::InvalidExpression { message: message.into() }
}

fn is_dns1123_label(name: &str) -> bool {
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();

    bytes.len() <= 63
        && bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
}

/// Visits every selector in `expr`, matrix selectors included
fn for_each_selector(expr: &mut Expr, visit: &mut dyn FnMut(&mut VectorSelector)) {
    match expr {
        Expr::VectorSelector(vs) => visit(vs),
        Expr::MatrixSelector(ms) => visit(&mut ms.vs),
        Expr::Subquery(sq) => for_each_selector(&mut sq.expr, visit),
        Expr::Aggregate(agg) => {
            for_each_selector(&mut agg.expr, visit);
            if let Some(param) = agg.param.as_mut() {
                for_each_selector(param, visit);
            }
        }
        Expr::Binary(b) => {
            for_each_selector(&mut b.lhs, visit);
            for_each_selector(&mut b.rhs, visit);
        }
        Expr::Paren(p) => for_each_selector(&mut p.expr, visit),
        Expr::Unary(u) => for_each_selector(&mut u.expr, visit),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                for_each_selector(arg, visit);
            }
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) | Expr::Extension(_) => {}
    }
}

fn pin_namespace(selector: &mut VectorSelector, namespace: &str) {
    let pin = |matchers: &mut Vec<Matcher>| {
        matchers.retain(|m| m.name != NAMESPACE_LABEL);
        matchers.push(Matcher {
            op: MatchOp::Equal,
            name: NAMESPACE_LABEL.to_string(),
            value: namespace.to_string(),
        });
    };

    let groups = &mut selector.matchers;
    if groups.or_matchers.is_empty() {
        pin(&mut groups.matchers);
    } else {
        groups.or_matchers.iter_mut().for_each(pin);
    }
}

// ============================================================================
// SECTION 17: TIME-WINDOW NORMALIZER
// ============================================================================

/// A validated metering window; the interval is `(start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeterWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    #[serde(with = "humantime_serde")]
    pub step: Duration,

    /// Set when a sub-hour step was raised to one hour
    pub step_coerced: bool,
}

impl MeterWindow {
    /// Validates a requested window and advances its start by one step.
    ///
    /// A step below one hour is raised to one hour with a warning. Ranges
    /// longer than thirty days need a daily step, and steps must be whole
    /// hours. When `start + step` passes `end` the window collapses to `end`.
    pub fn normalize(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Result<Self, ValidationError> {
        if end < start {
            return Err(ValidationError::InvalidTimeRange { start, end });
        }

        let mut step = step;
        let mut step_coerced = false;
        if step < MIN_METER_STEP {
            warn!(
                target: "meterql::window",
                requested = %humantime::format_duration(step),
                "step is smaller than one hour, using 1h"
            );
            step = MIN_METER_STEP;
            step_coerced = true;
        }

        if end - start > chrono::Duration::days(MAX_SUB_DAILY_RANGE_DAYS) && step < DAILY_STEP {
            return Err(ValidationError::StepTooSmallForRange { step, max_days: MAX_SUB_DAILY_RANGE_DAYS });
        }

        if !is_whole_hours(step) {
            return Err(ValidationError::StepNotIntegerHours { step });
        }

        let advance = chrono::Duration::from_std(step).map_err(|_| ValidationError::StepOutOfRange { step })?;
        let start = match start.checked_add_signed(advance) {
            Some(next) if next <= end => next,
            _ => end,
        };

        debug!(target: "meterql::window", %start, %end, step_hours = step.as_secs() / SECONDS_PER_HOUR, "Normalized window");
        Ok(Self { start, end, step, step_coerced })
    }

    pub fn step_hours(&self) -> u64 {
        self.step.as_secs() / SECONDS_PER_HOUR
    }

    pub fn meter_options(&self) -> MeterOptions {
        MeterOptions::ranged(self.start, self.end, self.step)
    }
}

// ============================================================================
// SECTION 18: SCALING & RESULT AGGREGATION
// ============================================================================

/// Per-meter multipliers turning hourly samples into per-step usage
#[derive(Debug, Clone, Default)]
pub struct ScalingFactorMap {
    factors: AHashMap<String, f64>,
}

impl ScalingFactorMap {
    /// One factor per registered meter, equal to the step in hours
    pub fn generate(registry: &TemplateRegistry, step: Duration) -> Self {
        let hours = step.as_secs_f64() / SECONDS_PER_HOUR as f64;
        Self { factors: registry.meter_names().map(|name| (name.to_string(), hours)).collect() }
    }

    pub fn factor(&self, metric: &str) -> Option<f64> {
        self.factors.get(metric).copied()
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Scales every value of `metric`; returns false when it has no factor
    pub fn scale(&self, metric: &mut Metric) -> bool {
        match self.factor(&metric.metric_name) {
            Some(factor) => {
                for value in &mut metric.data.values {
                    value.scale(factor);
                }
                true
            }
            None => false,
        }
    }
}

/// Collects per-meter outcomes in request order.
///
/// A failed meter becomes an entry with `error` set; it never aborts the batch.
#[derive(Debug)]
pub struct ResultAggregator<'r> {
    registry: &'r TemplateRegistry,
    scaling: Option<ScalingFactorMap>,
    results: Vec<Metric>,
}

impl<'r> ResultAggregator<'r> {
    pub fn new(registry: &'r TemplateRegistry, scaling: Option<ScalingFactorMap>) -> Self {
        Self { registry, scaling, results: Vec::new() }
    }

    pub fn record(&mut self, metric: &str, outcome: MeterResult<MetricData>) {
        let data = match outcome {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    target: "meterql::engine",
                    metric,
                    category = err.category(),
                    error = %err,
                    "Meter evaluation failed"
                );
                self.results.push(Metric::failed(metric, err));
                return;
            }
        };

        let mut result = Metric::ok(metric, data);
        if let Some(scaling) = &self.scaling {
            scaling.scale(&mut result);
        }

        let unit = self.registry.resource_of(metric).map(|r| r.unit());
        for value in &mut result.data.values {
            value.update_statistics();
            value.resource_unit = unit.map(str::to_string);
        }
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn finish(self) -> Metrics {
        Metrics { results: self.results }
    }
}

// ============================================================================
// SECTION 19: METRICS BACKEND
// ============================================================================

/// Query evaluation collaborator; timeouts and retries are its business
#[cfg_attr(test, mockall::automock)]
pub trait MetricsBackend: Send + Sync {
    fn evaluate_instant(&self, expr: &str, time: DateTime<Utc>) -> BackendResult<MetricData>;

    fn evaluate_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> BackendResult<MetricData>;
}

// ============================================================================
// SECTION 20: ENGINE SELF-METRICS
// ============================================================================

/// Counters about the engine itself, exported in the Prometheus text format
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    compilations: IntCounterVec,
    failures: IntCounterVec,
    step_coercions: IntCounter,
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> MeterResult<Self> {
        let internal = |e: prometheus::Error| MeterError::Internal(format!("self-metrics: {e}"));

        let registry = PrometheusRegistry::new();
        let compilations = IntCounterVec::new(
            Opts::new("meterql_compilations_total", "Meter expressions compiled, by level"),
            &["level"],
        )
        .map_err(internal)?;
        let failures = IntCounterVec::new(
            Opts::new("meterql_failures_total", "Failed meter or expression evaluations, by error category"),
            &["category"],
        )
        .map_err(internal)?;
        let step_coercions =
            IntCounter::new("meterql_step_coercions_total", "Sub-hour steps raised to one hour").map_err(internal)?;

        registry.register(Box::new(compilations.clone())).map_err(internal)?;
        registry.register(Box::new(failures.clone())).map_err(internal)?;
        registry.register(Box::new(step_coercions.clone())).map_err(internal)?;

        Ok(Self { registry, compilations, failures, step_coercions })
    }

    fn record_compilation(&self, level: Level) {
        self.compilations.with_label_values(&[level.as_str()]).inc();
    }

    fn record_failure(&self, error: &MeterError) {
        self.failures.with_label_values(&[error.category()]).inc();
    }

    /// Text exposition of every counter
    pub fn render(&self) -> MeterResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MeterError::Internal(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| MeterError::Internal(format!("metrics are not UTF-8: {e}")))
    }
}

// ============================================================================
// SECTION 21: METERING ENGINE
// ============================================================================
// Ties compiler, namespace scoper, window normalizer and backend together.
// Every batch operation returns one entry per requested meter, in order.
// ============================================================================

pub struct MeteringEngine {
    config: EngineConfig,
    compiler: MeterCompiler,
    scoper: Box<dyn NamespaceScoper>,
    backend: Arc<dyn MetricsBackend>,
    metrics: EngineMetrics,
}

impl Debug for MeteringEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteringEngine")
            .field("instance", &self.config.engine.instance_name)
            .field("backend", &self.scoper.backend())
            .field("meters", &self.compiler.registry().len())
            .finish_non_exhaustive()
    }
}

impl MeteringEngine {
    /// Engine over the built-in catalogue
    pub fn new(config: EngineConfig, backend: Arc<dyn MetricsBackend>) -> MeterResult<Self> {
        Self::with_registry(config, TemplateRegistry::shared(), backend)
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: Arc<TemplateRegistry>,
        backend: Arc<dyn MetricsBackend>,
    ) -> MeterResult<Self> {
        let kind = config.backend_kind()?;
        config.validate()?;

        info!(
            target: "meterql::engine",
            instance = %config.engine.instance_name,
            backend = %kind,
            meters = registry.len(),
            "Metering engine ready"
        );

        Ok(Self {
            scoper: kind.namespace_scoper(),
            compiler: MeterCompiler::new(registry),
            metrics: EngineMetrics::new()?,
            config,
            backend,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn compiler(&self) -> &MeterCompiler {
        &self.compiler
    }

    pub fn compile(&self, metric: &str, options: &QueryOptions) -> MeterResult<String> {
        let compiled = self.compiler.compile(metric, options);
        match &compiled {
            Ok(_) => self.metrics.record_compilation(options.level),
            Err(e) => self.metrics.record_failure(e),
        }
        compiled
    }

    /// Sorted meter names of one level
    pub fn available_meters(&self, level: Level) -> Vec<&str> {
        self.compiler.registry().names_for(level)
    }

    // ------------------------------------------------------------------------
    // Ad-hoc expressions
    // ------------------------------------------------------------------------

    pub fn get_metric(&self, expr: &str, namespace: &str, time: DateTime<Utc>) -> Metric {
        let outcome = self
            .scope(expr, namespace)
            .and_then(|scoped| self.backend.evaluate_instant(&scoped, time).map_err(|e| self.backend_failure(e)));
        Self::unnamed(outcome)
    }

    pub fn get_metric_over_time(
        &self,
        expr: &str,
        namespace: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Metric {
        let outcome = self.scope(expr, namespace).and_then(|scoped| {
            self.backend.evaluate_range(&scoped, start, end, step).map_err(|e| self.backend_failure(e))
        });
        Self::unnamed(outcome)
    }

    fn scope(&self, expr: &str, namespace: &str) -> MeterResult<String> {
        self.scoper.scope(expr, namespace).map_err(|e| {
            self.metrics.record_failure(&e);
            e
        })
    }

    fn unnamed(outcome: MeterResult<MetricData>) -> Metric {
        match outcome {
            Ok(data) => Metric::ok("", data),
            Err(err) => {
                warn!(target: "meterql::engine", category = err.category(), error = %err, "Expression evaluation failed");
                Metric::failed("", err)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Named meters
    // ------------------------------------------------------------------------

    /// Instant metering over the last hour; values are not scaled
    pub fn get_named_meters<S: AsRef<str>>(&self, meters: &[S], time: DateTime<Utc>, options: &QueryOptions) -> Metrics {
        let options = options.clone().with_meter_options(MeterOptions::hourly());
        let timer = PerfTimer::with_threshold("get_named_meters", self.config.metering.slow_batch_threshold);

        let mut aggregator = ResultAggregator::new(self.compiler.registry(), None);
        for meter in meters {
            let meter = meter.as_ref();
            let outcome = self
                .compile(meter, &options)
                .and_then(|expr| self.backend.evaluate_instant(&expr, time).map_err(|e| self.backend_failure(e)));
            aggregator.record(meter, outcome);
        }

        timer.stop();
        aggregator.finish()
    }

    /// Range metering; values are multiplied by the step in hours
    pub fn get_named_meters_over_time<S: AsRef<str>>(
        &self,
        meters: &[S],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        options: &QueryOptions,
    ) -> MeterResult<Metrics> {
        let window = MeterWindow::normalize(start, end, step).map_err(|e| {
            let e = MeterError::from(e);
            self.metrics.record_failure(&e);
            e
        })?;
        if window.step_coerced {
            self.metrics.step_coercions.inc();
        }

        let options = options.clone().with_meter_options(window.meter_options());
        let scaling = ScalingFactorMap::generate(self.compiler.registry(), window.step);
        let timer = PerfTimer::with_threshold("get_named_meters_over_time", self.config.metering.slow_batch_threshold);

        let mut aggregator = ResultAggregator::new(self.compiler.registry(), Some(scaling));
        for meter in meters {
            let meter = meter.as_ref();
            let outcome = self.compile(meter, &options).and_then(|expr| {
                self.backend
                    .evaluate_range(&expr, window.start, window.end, window.step)
                    .map_err(|e| self.backend_failure(e))
            });
            aggregator.record(meter, outcome);
        }

        let elapsed = timer.stop();
        debug!(
            target: "meterql::engine",
            meters = meters.len(),
            step_hours = window.step_hours(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Metered batch"
        );
        Ok(aggregator.finish())
    }

    fn backend_failure(&self, error: BackendError) -> MeterError {
        let error = MeterError::from(error);
        self.metrics.record_failure(&error);
        error
    }

    /// Self-metrics in the Prometheus text format
    pub fn metrics_text(&self) -> MeterResult<String> {
        self.metrics.render()
    }
}

// ============================================================================
// SECTION 22: EVALUATION TESTS
// ============================================================================

#[cfg(test)]
mod evaluation_tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn scope(expr: &str) -> String {
        PrometheusNamespaceScoper.scope(expr, "demo").unwrap()
    }

    /// Namespace matcher values per selector, in walk order
    fn selector_namespaces(expr: &str) -> Vec<Vec<String>> {
        let mut ast = promql::parse(expr).unwrap();
        let mut found = Vec::new();
        for_each_selector(&mut ast, &mut |selector| {
            let groups = &selector.matchers;
            found.push(
                groups
                    .matchers
                    .iter()
                    .chain(groups.or_matchers.iter().flatten())
                    .filter(|m| m.name == NAMESPACE_LABEL)
                    .map(|m| match m.op {
                        MatchOp::Equal => m.value.clone(),
                        _ => format!("{:?}:{}", m.op, m.value),
                    })
                    .collect(),
            );
        });
        found
    }

    fn pinned(selectors: usize) -> Vec<Vec<String>> {
        vec![vec!["demo".to_string()]; selectors]
    }

    fn vector(value: f64) -> MetricData {
        MetricData::vector(vec![MetricValue::instant(Point::new(1_709_251_200, value))])
    }

    fn engine(backend: MockMetricsBackend) -> MeteringEngine {
        MeteringEngine::new(EngineConfig::default(), Arc::new(backend)).unwrap()
    }

    // ---- namespace isolation ----

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("prometheus".parse::<BackendKind>().unwrap(), BackendKind::Prometheus);
        assert_eq!(" Prometheus ".parse::<BackendKind>().unwrap(), BackendKind::Prometheus);
        assert_eq!(
            "victoria".parse::<BackendKind>().unwrap_err(),
            UsageError::UnsupportedBackend { backend: "victoria".into() }
        );
        assert_eq!(BackendKind::Prometheus.namespace_scoper().backend(), BackendKind::Prometheus);
    }

    #[test]
    fn test_scope_bare_metric() {
        assert_eq!(scope("up"), r#"up{namespace="demo"}"#);
        assert_eq!(selector_namespaces(&scope("up == 0")), pinned(1));
    }

    #[test]
    fn test_scope_replaces_existing_namespace() {
        let scoped = scope(r#"sum by (pod) (rate(http_requests_total{job="api", namespace=~"other|more"}[5m]))"#);

        assert_eq!(selector_namespaces(&scoped), pinned(1));
        assert!(scoped.contains(r#"job="api""#));
        assert!(!scoped.contains("other"));
    }

    #[test]
    fn test_scope_bare_matcher_list() {
        assert_eq!(selector_namespaces(&scope(r#"{__name__="up"}"#)), pinned(1));
        assert_eq!(selector_namespaces(&scope("up{}")), pinned(1));
    }

    #[test]
    fn test_scope_leaves_strings_and_grouping_alone() {
        let relabeled = scope(r#"label_replace(up, "dst", "$1", "instance", "(.*)")"#);
        assert_eq!(selector_namespaces(&relabeled), pinned(1));
        assert!(relabeled.contains("$1"));
        assert!(relabeled.contains("(.*)"));

        let joined = scope("sum(a) by (pod) * on (pod) group_left (node) b");
        assert_eq!(selector_namespaces(&joined), pinned(2));
        assert!(joined.contains("group_left"));

        assert_eq!(selector_namespaces(&scope("rate(x[5m] offset 1h) > bool 0.5")), pinned(1));
        assert_eq!(selector_namespaces(&scope("max_over_time(rate(x[5m])[1h:5m])")), pinned(1));
        assert_eq!(selector_namespaces(&scope(r#"topk(3, m{a="}"}) or vector(1)"#)), pinned(1));
    }

    #[test]
    fn test_scope_ignores_comments() {
        for expr in ["sum(up) # legacy (see runbook", "sum(up) # it's fine"] {
            assert_eq!(selector_namespaces(&scope(expr)), pinned(1), "{expr}");
        }
    }

    #[test]
    fn test_scope_empty_namespace_is_noop() {
        let expr = r#"sum(rate(x{a="b"}[5m]))"#;
        assert_eq!(PrometheusNamespaceScoper.scope(expr, "").unwrap(), expr);
    }

    #[test]
    fn test_scope_rejects_malformed_input() {
        let scoper = PrometheusNamespaceScoper;
        for expr in [r#"up{job="a""#, "sum(up", "up)", r#"up{job="a}"#, "rate(up[5m)"] {
            let err = scoper.scope(expr, "demo").unwrap_err();
            assert!(
                matches!(err, MeterError::Usage(UsageError::InvalidExpression { .. })),
                "{expr}: {err:?}"
            );
        }

        let too_long = "a".repeat(64);
        for namespace in ["Demo", "-demo", "demo_1", too_long.as_str()] {
            assert!(scoper.scope("up", namespace).is_err(), "{namespace}");
        }
    }

    #[test]
    fn test_scope_compiled_meters() {
        let compiler = MeterCompiler::builtin();
        let options = QueryOptions::for_level(Level::Cluster).with_meter_options(MeterOptions::hourly());

        for name in compiler.registry().names_for(Level::Cluster) {
            let expr = compiler.compile(name, &options).unwrap();
            let selectors = selector_namespaces(&expr).len();
            assert!(selectors > 0, "{name}");
            assert_eq!(selector_namespaces(&scope(&expr)), pinned(selectors), "{name}");
        }

        let expr = compiler.compile("meter_cluster_net_bytes_transmitted", &options).unwrap();
        let scoped = scope(&expr);
        assert!(scoped.contains(r#"job="node-exporter""#));
        assert!(scoped.contains("device!~"));
    }

    // ---- time window ----

    #[test]
    fn test_window_coerces_sub_hour_step() {
        let start = t0();
        let end = start + chrono::Duration::minutes(30);
        let window = MeterWindow::normalize(start, end, Duration::from_secs(30 * 60)).unwrap();

        assert_eq!(window.step, HOUR);
        assert!(window.step_coerced);
        assert_eq!(window.start, end);
        assert_eq!(window.end, end);
    }

    #[test]
    fn test_window_long_range_needs_daily_step() {
        let start = t0();
        let end = start + chrono::Duration::days(31);

        assert_eq!(
            MeterWindow::normalize(start, end, 12 * HOUR).unwrap_err(),
            ValidationError::StepTooSmallForRange { step: 12 * HOUR, max_days: 30 }
        );
        assert!(MeterWindow::normalize(start, end, 24 * HOUR).is_ok());
        // exactly thirty days is still allowed
        assert!(MeterWindow::normalize(start, start + chrono::Duration::days(30), HOUR).is_ok());
    }

    #[test]
    fn test_window_rejects_fractional_hours() {
        let start = t0();
        let err = MeterWindow::normalize(start, start + chrono::Duration::hours(2), Duration::from_secs(90 * 60));
        assert_eq!(err.unwrap_err(), ValidationError::StepNotIntegerHours { step: Duration::from_secs(90 * 60) });
    }

    #[test]
    fn test_window_start_is_exclusive() {
        let start = t0();
        let end = start + chrono::Duration::hours(3);
        let window = MeterWindow::normalize(start, end, HOUR).unwrap();

        assert_eq!(window.start, start + chrono::Duration::hours(1));
        assert_eq!(window.end, end);
        assert!(!window.step_coerced);
        assert_eq!(window.meter_options(), MeterOptions::ranged(window.start, end, HOUR));
    }

    #[test]
    fn test_window_rejects_reversed_range() {
        let start = t0();
        let end = start - chrono::Duration::hours(1);
        assert_eq!(
            MeterWindow::normalize(start, end, HOUR).unwrap_err(),
            ValidationError::InvalidTimeRange { start, end }
        );
    }

    proptest! {
        #[test]
        fn prop_window_stays_inside_range(span_secs in 0i64..(60 * 86_400), step_secs in 1u64..(48 * 3600)) {
            let start = t0();
            let end = start + chrono::Duration::seconds(span_secs);
            let step = Duration::from_secs(step_secs);

            match MeterWindow::normalize(start, end, step) {
                Ok(window) => {
                    prop_assert!(window.start > start || window.start == end);
                    prop_assert!(window.start <= end);
                    prop_assert_eq!(window.end, end);
                    prop_assert!(window.step >= MIN_METER_STEP);
                    prop_assert_eq!(window.step.as_secs() % 3600, 0);
                    prop_assert_eq!(window.step_coerced, step_secs < 3600);
                }
                Err(ValidationError::StepTooSmallForRange { .. }) => {
                    prop_assert!(span_secs > 30 * 86_400);
                    prop_assert!(step_secs < 24 * 3600);
                }
                Err(ValidationError::StepNotIntegerHours { .. }) => {
                    prop_assert!(step_secs > 3600 && step_secs % 3600 != 0);
                }
                Err(other) => {
                    prop_assert!(false, "unexpected {:?}", other);
                }
            }
        }
    }

    // ---- scaling & aggregation ----

    #[test]
    fn test_scaling_factor_is_step_hours() {
        let registry = TemplateRegistry::builtin();
        let scaling = ScalingFactorMap::generate(&registry, 3 * HOUR);

        assert_eq!(scaling.len(), registry.len());
        assert_eq!(scaling.factor("meter_pod_cpu_usage"), Some(3.0));
        assert_eq!(scaling.factor("custom_metric"), None);

        let mut custom = Metric::ok("custom_metric", vector(2.0));
        assert!(!scaling.scale(&mut custom));
        assert_eq!(custom.data.values[0].sample.map(|p| p.value), Some(2.0));

        let mut meter = Metric::ok("meter_pod_cpu_usage", vector(2.0));
        assert!(scaling.scale(&mut meter));
        assert_eq!(meter.data.values[0].sample.map(|p| p.value), Some(6.0));
    }

    #[test]
    fn test_aggregator_records_in_order() {
        let registry = TemplateRegistry::builtin();
        let mut aggregator = ResultAggregator::new(&registry, None);

        aggregator.record("meter_cluster_cpu_usage", Ok(vector(1.5)));
        aggregator.record(
            "meter_cluster_memory_usage",
            Err(BackendError::Unavailable { message: "down".into() }.into()),
        );
        assert_eq!(aggregator.len(), 2);

        let metrics = aggregator.finish();
        assert_eq!(metrics.failures(), 1);

        let cpu = &metrics.results[0];
        assert_eq!(cpu.metric_name, "meter_cluster_cpu_usage");
        assert_eq!(cpu.data.values[0].avg_value, Some(1.5));
        assert_eq!(cpu.data.values[0].resource_unit.as_deref(), Some("cores"));

        let memory = &metrics.results[1];
        assert_eq!(memory.error.as_deref(), Some("Backend error: backend unavailable: down"));
        assert!(memory.data.values.is_empty());
    }

    // ---- engine ----

    #[test]
    fn test_engine_rejects_unsupported_backend() {
        let mut config = EngineConfig::default();
        config.engine.backend = "influx".into();

        let err = MeteringEngine::new(config, Arc::new(MockMetricsBackend::new())).unwrap_err();
        assert!(matches!(err, MeterError::Usage(UsageError::UnsupportedBackend { .. })));
    }

    #[test]
    fn test_named_meters_isolate_unknown_meter() {
        let mut backend = MockMetricsBackend::new();
        backend.expect_evaluate_instant().times(2).returning(|_, _| Ok(vector(4.0)));
        let engine = engine(backend);

        let meters = ["meter_cluster_cpu_usage", "meter_cluster_gpu_usage", "meter_cluster_pvc_bytes_total"];
        let metrics = engine.get_named_meters(&meters, t0(), &QueryOptions::for_level(Level::Cluster));

        assert_eq!(metrics.len(), 3);
        let names: Vec<&str> = metrics.iter().map(|m| m.metric_name.as_str()).collect();
        assert_eq!(names, meters.to_vec());

        assert!(!metrics.results[0].is_err());
        assert_eq!(metrics.results[1].error.as_deref(), Some("Usage error: invalid meter meter_cluster_gpu_usage"));
        assert!(!metrics.results[2].is_err());
        // instant metering is never scaled
        assert_eq!(metrics.results[2].data.values[0].sum_value, Some(4.0));
    }

    #[test]
    fn test_named_meters_isolate_backend_failure() {
        let mut backend = MockMetricsBackend::new();
        backend.expect_evaluate_instant().times(3).returning(|expr, _| {
            if expr.contains("node_network_receive_bytes_total") {
                Err(BackendError::Timeout { timeout_ms: 500 })
            } else {
                Ok(vector(1.0))
            }
        });
        let engine = engine(backend);

        let meters = ["meter_cluster_cpu_usage", "meter_cluster_net_bytes_received", "meter_cluster_memory_usage"];
        let metrics = engine.get_named_meters(&meters, t0(), &QueryOptions::default());

        assert_eq!(metrics.failures(), 1);
        assert!(metrics.results[1].is_err());
        assert!(!metrics.results[2].is_err());

        let text = engine.metrics_text().unwrap();
        assert!(text.contains(r#"meterql_failures_total{category="backend"} 1"#));
        assert!(text.contains(r#"meterql_compilations_total{level="cluster"} 3"#));
    }

    #[test]
    fn test_named_meters_over_time_scales_by_step() {
        let start = t0();
        let end = start + chrono::Duration::hours(6);

        let mut backend = MockMetricsBackend::new();
        backend.expect_evaluate_range().times(1).returning(move |expr, from, to, step| {
            assert!(expr.contains("[3h:1h]"));
            assert_eq!(from, start + chrono::Duration::hours(3));
            assert_eq!(to, end);
            assert_eq!(step, 3 * HOUR);
            Ok(MetricData::matrix(vec![MetricValue::range(vec![
                Point::new(1, 1.0),
                Point::new(2, 2.0),
            ])
            .with_label("node", "node-1")]))
        });
        let engine = engine(backend);

        let options = QueryOptions::for_level(Level::Node).with_node_name("node-1");
        let metrics = engine
            .get_named_meters_over_time(&["meter_node_cpu_usage"], start, end, 3 * HOUR, &options)
            .unwrap();

        let value = &metrics.results[0].data.values[0];
        let scaled: Vec<f64> = value.series.iter().map(|p| p.value).collect();
        assert_eq!(scaled, vec![3.0, 6.0]);
        assert_eq!(value.sum_value, Some(9.0));
        assert_eq!(value.avg_value, Some(4.5));
        assert_eq!(value.min_value, Some(3.0));
        assert_eq!(value.max_value, Some(6.0));
        assert_eq!(value.resource_unit.as_deref(), Some("cores"));
        assert_eq!(value.metadata.get("node").map(String::as_str), Some("node-1"));
    }

    #[test]
    fn test_named_meters_over_time_validates_before_backend() {
        let engine = engine(MockMetricsBackend::new());
        let start = t0();

        let err = engine
            .get_named_meters_over_time(
                &["meter_cluster_cpu_usage"],
                start,
                start + chrono::Duration::hours(4),
                Duration::from_secs(150 * 60),
                &QueryOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, MeterError::Validation(ValidationError::StepNotIntegerHours { .. })));
    }

    #[test]
    fn test_step_coercion_is_counted() {
        let mut backend = MockMetricsBackend::new();
        backend.expect_evaluate_range().returning(|_, _, _, _| Ok(MetricData::matrix(Vec::new())));
        let engine = engine(backend);

        let start = t0();
        let metrics = engine
            .get_named_meters_over_time(
                &["meter_cluster_cpu_usage"],
                start,
                start + chrono::Duration::hours(2),
                Duration::from_secs(60),
                &QueryOptions::default(),
            )
            .unwrap();

        assert_eq!(metrics.failures(), 0);
        assert!(engine.metrics_text().unwrap().contains("meterql_step_coercions_total 1"));
    }

    #[test]
    fn test_get_metric_scopes_expression() {
        let mut backend = MockMetricsBackend::new();
        backend.expect_evaluate_instant().times(1).returning(|expr, _| {
            assert_eq!(selector_namespaces(expr), pinned(1));
            assert!(expr.contains(r#"pod!="""#));
            Ok(vector(42.0))
        });
        let engine = engine(backend);

        let metric = engine.get_metric(r#"sum(container_memory_working_set_bytes{pod!=""})"#, "demo", t0());
        assert!(!metric.is_err());
        assert_eq!(metric.metric_name, "");
        assert_eq!(metric.data.values[0].sample, Some(Point::new(1_709_251_200, 42.0)));
    }

    #[test]
    fn test_get_metric_over_time_reports_failures_inline() {
        let engine = engine(MockMetricsBackend::new());
        let start = t0();

        let metric = engine.get_metric_over_time("sum(up", "demo", start, start + chrono::Duration::hours(1), HOUR);
        assert!(metric.is_err());
        assert!(metric.error.unwrap_or_default().contains("invalid expression"));
    }

    #[test]
    fn test_available_meters() {
        let engine = engine(MockMetricsBackend::new());
        assert_eq!(
            engine.available_meters(Level::Service),
            vec![
                "meter_service_cpu_usage",
                "meter_service_memory_usage_wo_cache",
                "meter_service_net_bytes_received",
                "meter_service_net_bytes_transmitted",
            ]
        );
        assert!(format!("{engine:?}").contains("MeteringEngine"));
    }
}
