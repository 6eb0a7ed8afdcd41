//! # Axon Exporter - Lifecycle Latency Metrics
//!
//! A lifecycle-event-to-Prometheus aggregation engine. Axon subscribes to
//! process/activity audit events delivered by a host event bus, pairs each
//! "started" notification with its matching "completed"/"faulted" notification,
//! and records the elapsed duration into per-entity latency histograms exposed
//! for scraping.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            AXON EXPORTER                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  EVENT BUS → FILTER POLICY → CORRELATION TABLE → METRIC REGISTRY → HTTP  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Rule-Based Filtering**: regex include lists for applications, processes
//!   and activities (activities are opt-in only)
//! - **Bucket Overrides**: per-entity histogram boundaries, first match wins
//! - **Lock-Friendly**: lazy exactly-once histogram creation under contention,
//!   no engine-wide mutex on the event path
//! - **Prometheus Native**: standard text exposition plus runtime self-metrics
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::env;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::Context as AnyhowContext;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// HTTP - Axum
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Json};
use figment::Figment;

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior of the exporter.
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "axon-exporter";
pub const EXPORTER_FULL_NAME: &str = "Axon Lifecycle Metrics Exporter";

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Environment variable naming the JSON configuration file. When unset the
/// exporter runs with defaults: no filtering restrictions, default buckets.
pub const CONFIG_PATH_ENV: &str = "AXON_METRICS_CONFIG";

/// Default TCP port for the metrics exposition endpoint
pub const DEFAULT_HTTP_PORT: u16 = 1234;

/// Default histogram bucket boundaries (seconds), shared by processes and
/// activities unless overridden in configuration
pub const DEFAULT_HISTOGRAM_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

// ----------------------------------------------------------------------------
// Metric Naming & Labels
// ----------------------------------------------------------------------------

/// Label names attached to every latency histogram
pub const HISTOGRAM_LABEL_NAMES: [&str; 2] = ["application", "success"];

/// Help text for process latency histograms
pub const PROCESS_HISTOGRAM_HELP: &str = "Latency of process execution.";

/// Help text for activity latency histograms
pub const ACTIVITY_HISTOGRAM_HELP: &str = "Latency of individual activity execution.";

/// Separator used in registry entity keys for activities (`process/activity`).
/// Never conflated with the match-signature separator below.
pub const ENTITY_KEY_SEPARATOR: &str = "/";

/// Separator used when matching activities against include/override rules
/// (`process#activity`)
pub const ACTIVITY_SIGNATURE_SEPARATOR: &str = "#";

// ============================================================================
// SECTION 3: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the exporter. Designed for:
// - Clear error categorization
// - Easy error propagation with context
// - A hard rule: no event-path failure ever propagates back to the event bus
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Top-Level Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable. Configuration and registration
    /// failures are fatal; event-path failures are skippable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Registry(_) => false,
            ExporterError::Event(_) => true,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Registry(_) => "registry",
            ExporterError::Event(_) => "event",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

/// Convenient result alias used throughout the exporter
pub type ExporterResult<T> = Result<T, ExporterError>;

// ----------------------------------------------------------------------------
// 3.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
/// Any of these aborts activation: the exporter never comes up partially
/// initialized.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("Invalid pattern '{pattern}' in '{field}': {message}")]
    InvalidPattern {
        field: String,
        pattern: String,
        message: String,
    },
}

// ----------------------------------------------------------------------------
// 3.3 Metric Registry Errors
// ----------------------------------------------------------------------------

/// Errors from histogram creation and backend registration.
/// A registration clash (two entity names normalizing to the same metric
/// name) is fatal for that key: the backend enforces global uniqueness and
/// there is no retry path.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to build histogram '{name}': {source}")]
    Build {
        name: String,
        source: prometheus::Error,
    },

    #[error("Metrics backend rejected registration of '{name}': {source}")]
    Registration {
        name: String,
        source: prometheus::Error,
    },
}

// ----------------------------------------------------------------------------
// 3.4 Event Processing Errors
// ----------------------------------------------------------------------------

/// Recoverable failures on the event path. Policy: log and skip the
/// observation, never destabilize the event bus with a propagated fault.
#[derive(Error, Debug)]
pub enum EventError {
    /// An end event arrived for an execution id with no recorded start
    /// (lost or duplicate delivery, or the exporter restarted mid-flight)
    #[error("No recorded start for execution '{execution_id}'")]
    MissingStart { execution_id: String },

    /// An end event's entity key was never registered (start dropped by a
    /// filter the end passed, which a deterministic policy should prevent)
    #[error("No histogram registered for entity '{key}'")]
    HistogramMissing { key: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ============================================================================
// SECTION 4: EVENT MODEL
// ============================================================================
// Lifecycle notifications delivered by the host event bus. A closed tagged
// enum with an exhaustive match at the dispatch point: behavior per variant
// is fixed at compile time, never discovered via runtime type inspection.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Execution States
// ----------------------------------------------------------------------------

/// State an execution transitioned into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Started,
    Completed,
    Faulted,
}

impl ExecutionState {
    /// Whether this state ends an execution
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Faulted)
    }

    /// Value of the `success` label recorded with the observation.
    /// Only `Completed` counts as success.
    pub fn success_label(&self) -> &'static str {
        match self {
            ExecutionState::Completed => "true",
            _ => "false",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Started => write!(f, "started"),
            ExecutionState::Completed => write!(f, "completed"),
            ExecutionState::Faulted => write!(f, "faulted"),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Lifecycle Events
// ----------------------------------------------------------------------------

/// A process instance lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Application the process belongs to
    pub application: String,
    /// Stable process name (metric identity)
    pub process: String,
    /// Unique id of this in-flight process instance
    pub instance_id: String,
    /// State the instance transitioned into
    pub state: ExecutionState,
    /// Instance start timestamp, epoch millis
    pub start_time_ms: i64,
    /// Instance end timestamp, epoch millis (meaningful on terminal states)
    pub end_time_ms: i64,
}

/// An activity execution lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Application the enclosing process belongs to
    pub application: String,
    /// Name of the enclosing process
    pub process: String,
    /// Stable activity name within the process
    pub activity: String,
    /// Unique id of this in-flight activity execution
    pub execution_id: String,
    /// State the execution transitioned into
    pub state: ExecutionState,
    /// Execution start timestamp, epoch millis
    pub start_time_ms: i64,
    /// Execution end timestamp, epoch millis (meaningful on terminal states)
    pub end_time_ms: i64,
}

/// A lifecycle notification from the host event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LifecycleEvent {
    Process(ProcessEvent),
    Activity(ActivityEvent),
    /// Transition between activities. Accepted and ignored: a deliberate
    /// no-op branch, not an error.
    Transition { application: String },
}

impl LifecycleEvent {
    /// Application name carried by every event kind, used by the coarse
    /// application gate before any scope-specific gate runs
    pub fn application(&self) -> &str {
        match self {
            LifecycleEvent::Process(ev) => &ev.application,
            LifecycleEvent::Activity(ev) => &ev.application,
            LifecycleEvent::Transition { application } => application,
        }
    }
}

impl ActivityEvent {
    /// Registry entity key: `process/activity`
    pub fn entity_key(&self) -> String {
        format!("{}{}{}", self.process, ENTITY_KEY_SEPARATOR, self.activity)
    }

    /// Rule-match signature: `process#activity`
    pub fn signature(&self) -> String {
        format!(
            "{}{}{}",
            self.process, ACTIVITY_SIGNATURE_SEPARATOR, self.activity
        )
    }
}

// ============================================================================
// SECTION 5: PATTERN RULES
// ============================================================================
// Compiled name-matching rules used for both include filtering (no payload)
// and bucket-override resolution (payload = bucket boundaries). Matching is
// whole-string: a substring hit is never sufficient.
// ============================================================================

/// Anchor a user-supplied pattern so it must match the entire candidate,
/// mirroring `Matcher.matches()` semantics rather than `find()`
fn anchored(pattern: &str) -> String {
    format!(r"\A(?:{pattern})\z")
}

/// A single compiled rule: name pattern plus optional bucket payload
#[derive(Debug, Clone)]
pub struct MatchRule {
    pattern: Regex,
    payload: Option<Vec<f64>>,
}

impl MatchRule {
    /// Compile a rule from a raw pattern string. Invalid patterns are a
    /// fatal configuration error.
    pub fn compile(
        field: &str,
        pattern: &str,
        payload: Option<Vec<f64>>,
    ) -> Result<Self, ConfigError> {
        let regex = Regex::new(&anchored(pattern)).map_err(|e| ConfigError::InvalidPattern {
            field: field.to_owned(),
            pattern: pattern.to_owned(),
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern: regex,
            payload,
        })
    }

    /// Whole-string match against a candidate name
    pub fn is_match(&self, candidate: &str) -> bool {
        self.pattern.is_match(candidate)
    }

    /// Bucket payload, present only on override rules
    pub fn payload(&self) -> Option<&[f64]> {
        self.payload.as_deref()
    }
}

/// An ordered collection of compiled rules, scanned in configuration order
#[derive(Debug, Clone, Default)]
pub struct PatternRuleSet {
    rules: Vec<MatchRule>,
}

impl PatternRuleSet {
    /// Compile an include list (rules without payloads)
    pub fn compile(field: &str, patterns: &[String]) -> Result<Self, ConfigError> {
        let rules = patterns
            .iter()
            .map(|p| MatchRule::compile(field, p, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Compile an override list (rules carrying bucket payloads)
    pub fn compile_overrides(field: &str, overrides: &[BucketOverride]) -> Result<Self, ConfigError> {
        let rules = overrides
            .iter()
            .map(|o| MatchRule::compile(field, &o.name, Some(o.buckets.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// True iff any rule fully matches the candidate
    pub fn matches(&self, candidate: &str) -> bool {
        self.rules.iter().any(|rule| rule.is_match(candidate))
    }

    /// Payload of the first fully-matching rule with a payload, in set
    /// order; `default` if none match. Order is configuration order, not
    /// specificity.
    pub fn resolve<'a>(&'a self, candidate: &str, default: &'a [f64]) -> &'a [f64] {
        for rule in &self.rules {
            if let Some(payload) = rule.payload() {
                if rule.is_match(candidate) {
                    return payload;
                }
            }
        }
        default
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// SECTION 6: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - JSON file parsing (path from the AXON_METRICS_CONFIG environment
//   variable; no file means "all defaults, no filtering restrictions")
// - Environment variable overrides
// - Validation at load time (fatal on malformed regex)
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// A bucket-override entry: name pattern plus replacement boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketOverride {
    /// Regular expression matched against the entity name
    /// (`process` or `process#activity`)
    pub name: String,
    /// Replacement bucket boundaries in seconds
    pub buckets: Vec<f64>,
}

/// Root configuration for the exporter.
///
/// Field names mirror the JSON document:
///
/// ```json
/// {
///   "httpPort": 1234,
///   "includeApplications": [ "samples.prometheus.application" ],
///   "includeProcesses": [ "samples.prometheus.*" ],
///   "includeActivities": [ "samples.prometheus.*#JDBC.*" ],
///   "processHistogramBuckets": [ 0.005, 0.01, 0.05, 0.1, 0.5, 1, 5, 10 ],
///   "activityHistogramBuckets": [ 0.002, 0.005, 0.01, 0.05, 0.1, 0.5 ],
///   "processHistogramOverrides": [
///     { "name": "samples.prometheus.batch.*", "buckets": [ 1, 10, 60, 600 ] }
///   ],
///   "activityHistogramOverrides": [
///     { "name": "samples.prometheus.*#HDFS.*", "buckets": [ 0.5, 1, 5, 10 ] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExporterConfig {
    /// TCP port of the metrics exposition endpoint
    #[serde(alias = "httpport")]
    pub http_port: u16,

    /// Application include rules. Absent means allow every application.
    #[serde(alias = "includeapplications")]
    pub include_applications: Option<Vec<String>>,

    /// Process include rules. Absent means allow every process.
    #[serde(alias = "includeprocesses")]
    pub include_processes: Option<Vec<String>>,

    /// Activity include rules, matched against `process#activity`.
    /// Absent means NO activity statistics: activities are opt-in only,
    /// to avoid an explosion of per-activity histograms by default.
    #[serde(alias = "includeactivities")]
    pub include_activities: Option<Vec<String>>,

    /// Default bucket boundaries for process histograms
    #[serde(alias = "processhistogrambuckets")]
    pub process_histogram_buckets: Option<Vec<f64>>,

    /// Default bucket boundaries for activity histograms. Absent falls
    /// back to the process boundaries, not the compiled-in default.
    #[serde(alias = "activityhistogrambuckets")]
    pub activity_histogram_buckets: Option<Vec<f64>>,

    /// Per-process bucket overrides, first match wins in list order
    #[serde(alias = "processhistogramoverrides")]
    pub process_histogram_overrides: Vec<BucketOverride>,

    /// Per-activity bucket overrides, matched against `process#activity`
    #[serde(alias = "activityhistogramoverrides")]
    pub activity_histogram_overrides: Vec<BucketOverride>,

    /// Log level: trace, debug, info, warn, error
    #[serde(alias = "loglevel")]
    pub log_level: String,

    /// Log format: pretty, compact, json
    #[serde(alias = "logformat")]
    pub log_format: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            include_applications: None,
            include_processes: None,
            include_activities: None,
            process_histogram_buckets: None,
            activity_histogram_buckets: None,
            process_histogram_overrides: Vec::new(),
            activity_histogram_overrides: Vec::new(),
            log_level: "info".into(),
            log_format: "pretty".into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.2 Loading & Validation
// ----------------------------------------------------------------------------

impl ExporterConfig {
    /// Load configuration from a JSON file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        // Environment keys fold to lowercase with underscores removed, so
        // both AXON_HTTP_PORT and AXON_HTTPPORT land on the `httpport`
        // alias carried by the serde field.
        let figment = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("AXON_").map(|key| {
                key.as_str().replace('_', "").to_ascii_lowercase().into()
            }));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Parse {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the path named by `AXON_METRICS_CONFIG`; defaults when the
    /// variable is unset
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load from a JSON string (for testing)
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Malformed patterns are fatal; suspect
    /// bucket lists are only warned about (see [`Self::warn_suspect_buckets`]),
    /// since the backend rejects unsorted boundaries at registration time
    /// anyway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, list) in [
            ("includeApplications", &self.include_applications),
            ("includeProcesses", &self.include_processes),
            ("includeActivities", &self.include_activities),
        ] {
            if let Some(patterns) = list {
                PatternRuleSet::compile(field, patterns)?;
            }
        }
        PatternRuleSet::compile_overrides(
            "processHistogramOverrides",
            &self.process_histogram_overrides,
        )?;
        PatternRuleSet::compile_overrides(
            "activityHistogramOverrides",
            &self.activity_histogram_overrides,
        )?;

        Ok(())
    }

    /// Warn about bucket lists the backend will reject at registration
    /// time. Runs at activation rather than at load time, since loading
    /// happens before the tracing subscriber is installed and the
    /// diagnostic would otherwise be lost.
    pub fn warn_suspect_buckets(&self) {
        for (field, buckets) in self.suspect_bucket_lists() {
            warn!(
                field,
                ?buckets,
                "bucket boundaries are not strictly ascending positive floats; \
                 histogram registration will likely fail"
            );
        }
    }

    /// Bucket lists that fail the ascending-positive check
    fn suspect_bucket_lists(&self) -> Vec<(&'static str, Vec<f64>)> {
        self.bucket_lists()
            .into_iter()
            .filter(|(_, buckets)| !is_strictly_ascending_positive(buckets))
            .collect()
    }

    fn bucket_lists(&self) -> Vec<(&'static str, Vec<f64>)> {
        let mut lists = Vec::new();
        if let Some(b) = &self.process_histogram_buckets {
            lists.push(("processHistogramBuckets", b.clone()));
        }
        if let Some(b) = &self.activity_histogram_buckets {
            lists.push(("activityHistogramBuckets", b.clone()));
        }
        for o in &self.process_histogram_overrides {
            lists.push(("processHistogramOverrides", o.buckets.clone()));
        }
        for o in &self.activity_histogram_overrides {
            lists.push(("activityHistogramOverrides", o.buckets.clone()));
        }
        lists
    }

    /// Effective process bucket boundaries
    pub fn effective_process_buckets(&self) -> Vec<f64> {
        self.process_histogram_buckets
            .clone()
            .unwrap_or_else(|| DEFAULT_HISTOGRAM_BUCKETS.to_vec())
    }

    /// Effective activity bucket boundaries. Falls back to the process
    /// boundaries when absent.
    pub fn effective_activity_buckets(&self) -> Vec<f64> {
        self.activity_histogram_buckets
            .clone()
            .unwrap_or_else(|| self.effective_process_buckets())
    }
}

/// Check a bucket list for strictly ascending positive boundaries
fn is_strictly_ascending_positive(buckets: &[f64]) -> bool {
    buckets.iter().all(|b| *b > 0.0) && buckets.windows(2).all(|w| w[0] < w[1])
}

// ============================================================================
// SECTION 7: FILTER POLICY & BUCKET RESOLUTION
// ============================================================================
// Immutable, shared read-only views over the compiled configuration rules.
// Both are constructed once at activation and never mutated afterwards.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Filter Policy
// ----------------------------------------------------------------------------

/// Decides, per event, whether statistics should be recorded at all.
/// Three independent gates; the application gate is evaluated first and
/// short-circuits everything downstream.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    applications: Option<PatternRuleSet>,
    processes: Option<PatternRuleSet>,
    activities: Option<PatternRuleSet>,
}

impl FilterPolicy {
    /// Compile the policy from configuration
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        let compile = |field: &str, list: &Option<Vec<String>>| -> Result<_, ConfigError> {
            list.as_deref()
                .map(|patterns| PatternRuleSet::compile(field, patterns))
                .transpose()
        };
        Ok(Self {
            applications: compile("includeApplications", &config.include_applications)?,
            processes: compile("includeProcesses", &config.include_processes)?,
            activities: compile("includeActivities", &config.include_activities)?,
        })
    }

    /// Applications default to allow-all when no rule list is configured
    pub fn allows_application(&self, application: &str) -> bool {
        match &self.applications {
            Some(rules) => rules.matches(application),
            None => true,
        }
    }

    /// Processes default to allow-all when no rule list is configured
    pub fn allows_process(&self, process: &str) -> bool {
        match &self.processes {
            Some(rules) => rules.matches(process),
            None => true,
        }
    }

    /// Activities are opt-in only: no rule list means deny all. Rules match
    /// against the `process#activity` signature.
    pub fn allows_activity(&self, process: &str, activity: &str) -> bool {
        match &self.activities {
            Some(rules) => rules.matches(&format!(
                "{process}{ACTIVITY_SIGNATURE_SEPARATOR}{activity}"
            )),
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Bucket Resolver
// ----------------------------------------------------------------------------

/// Resolves the effective histogram bucket boundaries for an entity by
/// scanning override rules in configuration order, first match wins.
/// Boundary validity is the config layer's concern, not enforced here.
#[derive(Debug, Clone)]
pub struct BucketResolver {
    process_defaults: Vec<f64>,
    activity_defaults: Vec<f64>,
    process_overrides: PatternRuleSet,
    activity_overrides: PatternRuleSet,
}

impl BucketResolver {
    /// Compile the resolver from configuration
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            process_defaults: config.effective_process_buckets(),
            activity_defaults: config.effective_activity_buckets(),
            process_overrides: PatternRuleSet::compile_overrides(
                "processHistogramOverrides",
                &config.process_histogram_overrides,
            )?,
            activity_overrides: PatternRuleSet::compile_overrides(
                "activityHistogramOverrides",
                &config.activity_histogram_overrides,
            )?,
        })
    }

    /// Effective boundaries for a process histogram
    pub fn process_buckets(&self, process: &str) -> &[f64] {
        self.process_overrides
            .resolve(process, &self.process_defaults)
    }

    /// Effective boundaries for an activity histogram; overrides match
    /// against the `process#activity` signature
    pub fn activity_buckets(&self, process: &str, activity: &str) -> &[f64] {
        let signature = format!("{process}{ACTIVITY_SIGNATURE_SEPARATOR}{activity}");
        self.activity_overrides
            .resolve(&signature, &self.activity_defaults)
    }
}

// ============================================================================
// SECTION 8: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with level/format selected by configuration.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &ExporterConfig) -> ExporterResult<()> {
    let level_filter = match config.log_level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.log_format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {e}")))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().compact().with_target(true));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {e}")))?;
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().pretty().with_target(true));
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {e}")))?;
        }
    }

    info!(
        level = %config.log_level,
        format = %config.log_format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 9: METRIC REGISTRY
// ============================================================================
// Maps normalized entity keys to lazily-created histogram handles.
// Guarantees exactly-once backend registration per key under concurrent
// first use: the factory runs while holding only the key's shard entry,
// never an engine-wide lock.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Metric Naming
// ----------------------------------------------------------------------------

/// Replace every character outside `[A-Za-z0-9:_]` with `_`. Deterministic;
/// distinct entity names differing only in punctuation can collide, which
/// the backend then rejects as a duplicate registration.
pub fn normalize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ':' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Exposed metric name for a process latency histogram
pub fn process_metric_name(process: &str) -> String {
    format!("process__{}__latency_seconds", normalize_metric_name(process))
}

/// Exposed metric name for an activity latency histogram
pub fn activity_metric_name(process: &str, activity: &str) -> String {
    format!(
        "activity__{}__{}__latency_seconds",
        normalize_metric_name(process),
        normalize_metric_name(activity)
    )
}

// ----------------------------------------------------------------------------
// 9.2 Registry
// ----------------------------------------------------------------------------

/// Lazily-populated entity-key → histogram map over an injected Prometheus
/// backend registry
pub struct MetricRegistry {
    backend: Registry,
    histograms: DashMap<String, HistogramVec>,
}

impl MetricRegistry {
    /// Create an empty registry over the given backend
    pub fn new(backend: Registry) -> Self {
        Self {
            backend,
            histograms: DashMap::new(),
        }
    }

    /// The underlying Prometheus registry (for exposition and factories)
    pub fn backend(&self) -> &Registry {
        &self.backend
    }

    /// Get the histogram for `key`, creating and registering it via
    /// `factory` on first use. If concurrent callers race on the same
    /// unseen key, exactly one factory invocation succeeds and every caller
    /// observes the same handle. Only same-shard creation is serialized.
    pub fn ensure<F>(&self, key: &str, factory: F) -> Result<HistogramVec, RegistryError>
    where
        F: FnOnce() -> Result<HistogramVec, RegistryError>,
    {
        match self.histograms.entry(key.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let histogram = factory()?;
                entry.insert(histogram.clone());
                Ok(histogram)
            }
        }
    }

    /// Look up an existing histogram by entity key
    pub fn get(&self, key: &str) -> Option<HistogramVec> {
        self.histograms.get(key).map(|h| h.value().clone())
    }

    /// Number of registered entity keys
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Drop all entries. Does not unregister from the backend: the backend
    /// is discarded alongside at deactivation.
    pub fn clear(&self) {
        self.histograms.clear();
    }
}

impl Debug for MetricRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("len", &self.histograms.len())
            .finish()
    }
}

/// Build a factory that constructs a labeled latency histogram and performs
/// the side-effecting backend registration. Runs at most once per entity key.
pub fn histogram_factory(
    backend: Registry,
    name: String,
    help: &'static str,
    buckets: Vec<f64>,
) -> impl FnOnce() -> Result<HistogramVec, RegistryError> {
    move || {
        let opts = HistogramOpts::new(name.clone(), help).buckets(buckets);
        let histogram =
            HistogramVec::new(opts, &HISTOGRAM_LABEL_NAMES).map_err(|e| RegistryError::Build {
                name: name.clone(),
                source: e,
            })?;
        backend
            .register(Box::new(histogram.clone()))
            .map_err(|e| RegistryError::Registration {
                name: name.clone(),
                source: e,
            })?;
        debug!(metric = %name, "registered latency histogram");
        Ok(histogram)
    }
}

// ============================================================================
// SECTION 10: CORRELATION TABLE
// ============================================================================
// Pairs a "started" event with its matching terminal event via the
// execution identifier. Entries for executions whose end event is lost leak
// for the exporter's lifetime; accepted bounded risk.
// ============================================================================

/// In-flight execution id → start timestamp (epoch millis)
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<String, i64>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a start. Unconditional insert: a duplicate start event for
    /// the same execution overwrites the stale entry, last write wins.
    pub fn begin(&self, execution_id: &str, start_time_ms: i64) {
        self.entries.insert(execution_id.to_owned(), start_time_ms);
    }

    /// Atomically remove the start entry and compute the elapsed duration
    /// in millis. An end event with no matching start is a caller-visible
    /// failure, never a silently-assumed zero duration.
    pub fn end(&self, execution_id: &str, end_time_ms: i64) -> Result<i64, EventError> {
        self.entries
            .remove(execution_id)
            .map(|(_, start)| end_time_ms - start)
            .ok_or_else(|| EventError::MissingStart {
                execution_id: execution_id.to_owned(),
            })
    }

    /// Number of currently in-flight executions
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// Drop all entries (shutdown, best-effort)
    pub fn clear(&self) {
        self.entries.clear();
    }
}

// ============================================================================
// SECTION 11: AGGREGATION ENGINE
// ============================================================================
// The event handler. Consumes one lifecycle event at a time from arbitrarily
// many concurrent delivery threads; all shared state is the metric registry
// and the two correlation tables. State machine per execution:
//
//     Unseen → Started → Ended(success | failure)
//
// No failure here ever propagates to the event bus: begin/ensure are not
// idempotent, so a provoked re-delivery could double-count.
// ============================================================================

/// Aggregates lifecycle events into latency histograms
pub struct AggregationEngine {
    filter: FilterPolicy,
    buckets: BucketResolver,
    registry: MetricRegistry,
    processes: CorrelationTable,
    activities: CorrelationTable,
}

impl AggregationEngine {
    /// Assemble the engine from its compiled parts
    pub fn new(filter: FilterPolicy, buckets: BucketResolver, registry: MetricRegistry) -> Self {
        Self {
            filter,
            buckets,
            registry,
            processes: CorrelationTable::new(),
            activities: CorrelationTable::new(),
        }
    }

    /// Compile filter and resolver from configuration and assemble the
    /// engine over the given backend registry
    pub fn from_config(config: &ExporterConfig, backend: Registry) -> Result<Self, ConfigError> {
        Ok(Self::new(
            FilterPolicy::from_config(config)?,
            BucketResolver::from_config(config)?,
            MetricRegistry::new(backend),
        ))
    }

    /// The metric registry owned by this engine
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Handle one lifecycle event. Never fails toward the caller: event-path
    /// errors are logged and the observation skipped.
    pub fn handle_event(&self, event: &LifecycleEvent) {
        // Coarse gate first: failing the application gate short-circuits
        // all downstream processing for this event.
        if !self.filter.allows_application(event.application()) {
            trace!(application = event.application(), "application filtered out");
            return;
        }

        match event {
            LifecycleEvent::Process(ev) => {
                if !self.filter.allows_process(&ev.process) {
                    trace!(process = %ev.process, "process filtered out");
                    return;
                }
                match ev.state {
                    ExecutionState::Started => {
                        if let Err(e) = self.process_start(ev) {
                            error!(
                                process = %ev.process,
                                instance_id = %ev.instance_id,
                                error = %e,
                                "failed to record process start"
                            );
                        }
                    }
                    ExecutionState::Completed | ExecutionState::Faulted => {
                        if let Err(e) = self.process_end(ev) {
                            warn!(
                                process = %ev.process,
                                instance_id = %ev.instance_id,
                                error = %e,
                                "skipping process observation"
                            );
                        }
                    }
                }
            }
            LifecycleEvent::Activity(ev) => {
                if !self.filter.allows_activity(&ev.process, &ev.activity) {
                    trace!(signature = %ev.signature(), "activity filtered out");
                    return;
                }
                match ev.state {
                    ExecutionState::Started => {
                        if let Err(e) = self.activity_start(ev) {
                            error!(
                                activity = %ev.entity_key(),
                                execution_id = %ev.execution_id,
                                error = %e,
                                "failed to record activity start"
                            );
                        }
                    }
                    ExecutionState::Completed | ExecutionState::Faulted => {
                        if let Err(e) = self.activity_end(ev) {
                            warn!(
                                activity = %ev.entity_key(),
                                execution_id = %ev.execution_id,
                                error = %e,
                                "skipping activity observation"
                            );
                        }
                    }
                }
            }
            LifecycleEvent::Transition { .. } => {}
        }
    }

    fn process_start(&self, event: &ProcessEvent) -> Result<(), EventError> {
        let name = process_metric_name(&event.process);
        let buckets = self.buckets.process_buckets(&event.process).to_vec();
        self.registry.ensure(
            &event.process,
            histogram_factory(
                self.registry.backend().clone(),
                name,
                PROCESS_HISTOGRAM_HELP,
                buckets,
            ),
        )?;
        self.processes.begin(&event.instance_id, event.start_time_ms);
        Ok(())
    }

    fn process_end(&self, event: &ProcessEvent) -> Result<(), EventError> {
        let duration_ms = self.processes.end(&event.instance_id, event.end_time_ms)?;
        let histogram =
            self.registry
                .get(&event.process)
                .ok_or_else(|| EventError::HistogramMissing {
                    key: event.process.clone(),
                })?;
        histogram
            .with_label_values(&[&event.application, event.state.success_label()])
            .observe(duration_ms as f64 / 1000.0);
        Ok(())
    }

    fn activity_start(&self, event: &ActivityEvent) -> Result<(), EventError> {
        let name = activity_metric_name(&event.process, &event.activity);
        let buckets = self
            .buckets
            .activity_buckets(&event.process, &event.activity)
            .to_vec();
        self.registry.ensure(
            &event.entity_key(),
            histogram_factory(
                self.registry.backend().clone(),
                name,
                ACTIVITY_HISTOGRAM_HELP,
                buckets,
            ),
        )?;
        self.activities
            .begin(&event.execution_id, event.start_time_ms);
        Ok(())
    }

    fn activity_end(&self, event: &ActivityEvent) -> Result<(), EventError> {
        let duration_ms = self.activities.end(&event.execution_id, event.end_time_ms)?;
        let key = event.entity_key();
        let histogram = self
            .registry
            .get(&key)
            .ok_or(EventError::HistogramMissing { key })?;
        histogram
            .with_label_values(&[&event.application, event.state.success_label()])
            .observe(duration_ms as f64 / 1000.0);
        Ok(())
    }

    /// Drop all mutable state (deactivation, best-effort, no drain)
    pub fn clear(&self) {
        debug!(
            histograms = self.registry.len(),
            processes_in_flight = self.processes.in_flight(),
            activities_in_flight = self.activities.in_flight(),
            "clearing engine state"
        );
        self.registry.clear();
        self.processes.clear();
        self.activities.clear();
    }
}

impl Debug for AggregationEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("histograms", &self.registry.len())
            .field("processes_in_flight", &self.processes.in_flight())
            .field("activities_in_flight", &self.activities.in_flight())
            .finish()
    }
}

// ============================================================================
// SECTION 12: METRICS EXPOSITION ENDPOINT
// ============================================================================
// HTTP server exposing the engine's registry in Prometheus text format on
// GET /metrics, with graceful stop via a oneshot shutdown signal.
// ============================================================================

/// The metrics exposition HTTP server
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsServer {
    /// Bind the configured port and start serving. A bind failure aborts
    /// activation.
    pub async fn start(port: u16, backend: Registry) -> ExporterResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(backend);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "metrics server terminated abnormally");
            }
        });

        info!(%addr, "metrics exposition endpoint started");
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Actual bound address (useful when started on port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and wait for the server task to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(addr = %self.addr, "metrics exposition endpoint stopped");
    }
}

/// GET /metrics: encode the registry in Prometheus text format
async fn metrics_handler(State(backend): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let families = backend.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failure").into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
        .into_response()
}

// ============================================================================
// SECTION 13: EXPORTER LIFECYCLE
// ============================================================================
// Explicit activate/deactivate lifecycle owning all mutable state. No
// ambient global singletons: the exporter instance is constructed once and
// its engine handle threaded through to wherever the event bus hands off
// events.
// ============================================================================

/// The process-wide exporter: aggregation engine plus exposition endpoint
#[derive(Debug)]
pub struct Exporter {
    engine: Arc<AggregationEngine>,
    server: MetricsServer,
}

impl Exporter {
    /// Construct filter policy and bucket resolver from configuration,
    /// register runtime self-metrics, and open the exposition endpoint.
    /// Any failure aborts activation.
    pub async fn activate(config: ExporterConfig) -> ExporterResult<Self> {
        config.warn_suspect_buckets();

        let backend = Registry::new();

        register_runtime_metrics(&backend)?;

        let engine = Arc::new(AggregationEngine::from_config(&config, backend.clone())?);
        let server = MetricsServer::start(config.http_port, backend).await?;

        info!(
            port = server.local_addr().port(),
            applications_filtered = config.include_applications.is_some(),
            processes_filtered = config.include_processes.is_some(),
            activities_filtered = config.include_activities.is_some(),
            "exporter activated"
        );

        Ok(Self { engine, server })
    }

    /// Handle to the aggregation engine, for the event bus integration
    pub fn engine(&self) -> Arc<AggregationEngine> {
        Arc::clone(&self.engine)
    }

    /// Close the exposition endpoint and clear all engine state.
    /// Best-effort: in-flight events are not drained.
    pub async fn deactivate(self) {
        self.server.stop().await;
        self.engine.clear();
        info!("exporter deactivated");
    }
}

/// Register standard runtime self-metrics (CPU, memory, fds) once at
/// activation, the backend-native counterpart of JVM default exports
fn register_runtime_metrics(backend: &Registry) -> ExporterResult<()> {
    #[cfg(target_os = "linux")]
    {
        use prometheus::process_collector::ProcessCollector;
        backend
            .register(Box::new(ProcessCollector::for_self()))
            .map_err(|e| RegistryError::Registration {
                name: "process_collector".into(),
                source: e,
            })?;
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = backend;
        debug!("process self-metrics unavailable on this platform");
    }
    Ok(())
}

// ============================================================================
// SECTION 14: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the exporter binary. Configuration comes from the
/// file named by AXON_METRICS_CONFIG; there is no command-line surface.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ExporterConfig::from_env().context("Failed to load configuration")?;

    init_logging(&config)?;

    info!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);

    let exporter = Exporter::activate(config)
        .await
        .context("Failed to activate exporter")?;

    // The host event bus delivers lifecycle events to exporter.engine();
    // the binary itself just serves /metrics until interrupted.
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("shutdown signal received");
    exporter.deactivate().await;

    Ok(())
}

// ============================================================================
// SECTION 15: COMPONENT TESTS
// ============================================================================


// ============================================================================
// SECTION 16: ENGINE & ENDPOINT TESTS
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;

    fn process_event(
        application: &str,
        process: &str,
        instance_id: &str,
        state: ExecutionState,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> LifecycleEvent {
        LifecycleEvent::Process(ProcessEvent {
            application: application.into(),
            process: process.into(),
            instance_id: instance_id.into(),
            state,
            start_time_ms,
            end_time_ms,
        })
    }

    fn activity_event(
        process: &str,
        activity: &str,
        execution_id: &str,
        state: ExecutionState,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> LifecycleEvent {
        LifecycleEvent::Activity(ActivityEvent {
            application: "app".into(),
            process: process.into(),
            activity: activity.into(),
            execution_id: execution_id.into(),
            state,
            start_time_ms,
            end_time_ms,
        })
    }

    fn find_family<'a>(
        families: &'a [prometheus::proto::MetricFamily],
        name: &str,
    ) -> Option<&'a prometheus::proto::MetricFamily> {
        families.iter().find(|f| f.get_name() == name)
    }

    fn engine_with(config_json: &str) -> (AggregationEngine, Registry) {
        let config = ExporterConfig::from_json_str(config_json).unwrap();
        let backend = Registry::new();
        let engine = AggregationEngine::from_config(&config, backend.clone()).unwrap();
        (engine, backend)
    }

    #[test]
    fn test_process_start_end_records_observation() {
        let (engine, backend) =
            engine_with(r#"{ "includeProcesses": [ "app\\.main" ] }"#);

        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Started,
            1000,
            0,
        ));
        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Completed,
            1000,
            3000,
        ));

        let families = backend.gather();
        let family = find_family(&families, "process__app_main__latency_seconds")
            .expect("histogram should be registered");

        let metric = &family.get_metric()[0];
        let histogram = metric.get_histogram();
        assert_eq!(histogram.get_sample_count(), 1);
        assert!((histogram.get_sample_sum() - 2.0).abs() < 1e-9);

        let labels: Vec<(&str, &str)> = metric
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert!(labels.contains(&("application", "app")));
        assert!(labels.contains(&("success", "true")));
    }

    #[test]
    fn test_faulted_process_records_failure_label() {
        let (engine, backend) = engine_with("{}");

        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Started,
            500,
            0,
        ));
        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Faulted,
            500,
            1500,
        ));

        let families = backend.gather();
        let family = find_family(&families, "process__app_main__latency_seconds").unwrap();
        let labels: Vec<(&str, &str)> = family.get_metric()[0]
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert!(labels.contains(&("success", "false")));
    }

    #[test]
    fn test_filtered_process_never_creates_histogram() {
        let (engine, backend) =
            engine_with(r#"{ "includeProcesses": [ "app\\.main" ] }"#);

        engine.handle_event(&process_event(
            "app",
            "app.other",
            "i9",
            ExecutionState::Started,
            1000,
            0,
        ));

        assert!(engine.registry().is_empty());
        assert!(backend.gather().is_empty());
    }

    #[test]
    fn test_application_gate_short_circuits() {
        let (engine, _backend) = engine_with(
            r#"{ "includeApplications": [ "allowed\\..*" ] }"#,
        );

        // The process would pass its own gate (allow-all), but the
        // application gate fails first and drops the whole event.
        engine.handle_event(&process_event(
            "blocked.app",
            "app.main",
            "i1",
            ExecutionState::Started,
            1000,
            0,
        ));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_end_without_start_is_skipped() {
        let (engine, backend) = engine_with("{}");

        // Must not panic and must not record anything.
        engine.handle_event(&process_event(
            "app",
            "app.main",
            "ghost",
            ExecutionState::Completed,
            0,
            1000,
        ));
        assert!(backend.gather().is_empty());
    }

    #[test]
    fn test_end_after_start_dropped_then_recorded_start() {
        let (engine, backend) = engine_with("{}");

        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Started,
            1000,
            0,
        ));
        // Wrong instance id: MissingStart, skipped, histogram count stays 0.
        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i2",
            ExecutionState::Completed,
            1000,
            2000,
        ));

        // The vec exists but carries no observation for the ghost end.
        let total: u64 = backend
            .gather()
            .iter()
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_histogram().get_sample_count())
            .sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_activity_flow_with_override_buckets() {
        let (engine, backend) = engine_with(
            r#"{
                "includeActivities": [ "app\\.main#db\\..*" ],
                "activityHistogramOverrides": [
                    { "name": "app\\.main#db\\..*", "buckets": [ 0.1, 0.5, 1.0 ] }
                ]
            }"#,
        );

        engine.handle_event(&activity_event(
            "app.main",
            "db.query",
            "e1",
            ExecutionState::Started,
            100,
            0,
        ));
        engine.handle_event(&activity_event(
            "app.main",
            "db.query",
            "e1",
            ExecutionState::Completed,
            100,
            350,
        ));
        // Not opted in: silently ignored.
        engine.handle_event(&activity_event(
            "app.main",
            "fs.write",
            "e2",
            ExecutionState::Started,
            100,
            0,
        ));

        let families = backend.gather();
        let family = find_family(
            &families,
            "activity__app_main__db_query__latency_seconds",
        )
        .expect("activity histogram should be registered");

        let histogram = family.get_metric()[0].get_histogram();
        assert_eq!(histogram.get_sample_count(), 1);
        assert!((histogram.get_sample_sum() - 0.25).abs() < 1e-9);
        // Override boundaries plus the implicit +Inf bucket.
        assert_eq!(histogram.get_bucket().len(), 3);

        assert!(find_family(&families, "activity__app_main__fs_write__latency_seconds").is_none());
    }

    #[test]
    fn test_transition_events_are_ignored() {
        let (engine, backend) = engine_with("{}");
        engine.handle_event(&LifecycleEvent::Transition {
            application: "app".into(),
        });
        assert!(engine.registry().is_empty());
        assert!(backend.gather().is_empty());
    }

    #[test]
    fn test_concurrent_interleaved_executions() {
        use std::sync::Barrier;

        let (engine, backend) = engine_with("{}");
        let engine = Arc::new(engine);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..50 {
                        let id = format!("w{worker}-i{i}");
                        engine.handle_event(&LifecycleEvent::Process(ProcessEvent {
                            application: "app".into(),
                            process: "app.main".into(),
                            instance_id: id.clone(),
                            state: ExecutionState::Started,
                            start_time_ms: 1000,
                            end_time_ms: 0,
                        }));
                        engine.handle_event(&LifecycleEvent::Process(ProcessEvent {
                            application: "app".into(),
                            process: "app.main".into(),
                            instance_id: id,
                            state: ExecutionState::Completed,
                            start_time_ms: 1000,
                            end_time_ms: 2000,
                        }));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // One histogram, every start paired with its end.
        assert_eq!(engine.registry().len(), 1);
        let families = backend.gather();
        let family = find_family(&families, "process__app_main__latency_seconds").unwrap();
        let total: u64 = family
            .get_metric()
            .iter()
            .map(|m| m.get_histogram().get_sample_count())
            .sum();
        assert_eq!(total, 8 * 50);
    }

    #[test]
    fn test_engine_clear_drops_state() {
        let (engine, _backend) = engine_with("{}");
        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Started,
            1000,
            0,
        ));
        assert_eq!(engine.registry().len(), 1);

        engine.clear();
        assert!(engine.registry().is_empty());
    }

    // ---- Exposition endpoint ----

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_format() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let backend = Registry::new();
        let registry = MetricRegistry::new(backend.clone());
        registry
            .ensure(
                "app.main",
                histogram_factory(
                    backend.clone(),
                    process_metric_name("app.main"),
                    PROCESS_HISTOGRAM_HELP,
                    DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
                ),
            )
            .unwrap()
            .with_label_values(&["app", "true"])
            .observe(0.2);

        let server = MetricsServer::start(0, backend).await.unwrap();
        let addr = server.local_addr();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();

        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("process__app_main__latency_seconds"));
        assert!(body.contains("application=\"app\""));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_exporter_activate_deactivate() {
        let config = ExporterConfig {
            http_port: 0,
            ..ExporterConfig::default()
        };
        let exporter = Exporter::activate(config).await.unwrap();
        let engine = exporter.engine();

        engine.handle_event(&process_event(
            "app",
            "app.main",
            "i1",
            ExecutionState::Started,
            1000,
            0,
        ));
        assert_eq!(engine.registry().len(), 1);

        exporter.deactivate().await;
        assert!(engine.registry().is_empty());
    }
}
