//! Live routing state: hostname to backend mappings plus scalar settings

use crate::pipeline::{Pipeline, PipelineFactory};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// One backend mapping
#[derive(Debug, Clone)]
pub struct HostTarget {
    target: Url,
    /// Target as written in the configuration file
    raw: String,
    pipeline: Option<Arc<Pipeline>>,
}

impl HostTarget {
    pub fn new(target: Url) -> Self {
        Self {
            raw: target.as_str().to_string(),
            target,
            pipeline: None,
        }
    }

    /// Parse `raw`, keeping the original spelling for persistence
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        let target = Url::parse(raw)?;
        Ok(Self {
            target,
            raw: raw.to_string(),
            pipeline: None,
        })
    }

    pub fn with_pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.as_ref()
    }
}

/// Hostname (lowercase, optionally with `:port`) to backend
pub type HostMappingTable = HashMap<String, HostTarget>;

/// Scalar settings that travel with the mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub max_requests: u32,
    pub window_size: Duration,
}

/// A fully validated configuration, ready to install
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub hosts: HostMappingTable,
    pub settings: Settings,
}

struct Inner {
    hosts: HostMappingTable,
    settings: Settings,
    /// Bumped by every `replace_all`
    generation: u64,
}

/// The process-wide live configuration.
///
/// The table and the scalar settings share one lock and are replaced
/// together, so readers see either the old or the new configuration.
pub struct ProxyConfig {
    inner: RwLock<Inner>,
    factory: PipelineFactory,
}

fn normalize(hostname: &str) -> Cow<'_, str> {
    if hostname.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(hostname.to_ascii_lowercase())
    } else {
        Cow::Borrowed(hostname)
    }
}

impl ProxyConfig {
    pub fn new(parsed: ParsedConfig, factory: PipelineFactory) -> Self {
        Self {
            inner: RwLock::new(Inner {
                hosts: parsed.hosts,
                settings: parsed.settings,
                generation: 0,
            }),
            factory,
        }
    }

    pub fn factory(&self) -> &PipelineFactory {
        &self.factory
    }

    /// Copy of the entry for `hostname`, compared case-insensitively
    pub fn lookup(&self, hostname: &str) -> Option<HostTarget> {
        let key = normalize(hostname);
        self.inner.read().hosts.get(key.as_ref()).cloned()
    }

    /// Insert or replace a single entry
    pub fn store(&self, hostname: &str, target: HostTarget) {
        let key = normalize(hostname).into_owned();
        self.inner.write().hosts.insert(key, target);
    }

    /// Cache `pipeline` on the entry `seen` was read from.
    ///
    /// The pipeline is stored only if the entry still points at the same
    /// target and has none yet; otherwise the cached pipeline wins. If a
    /// reload replaced or removed the entry meanwhile, nothing is stored and
    /// `pipeline` is returned for this one request.
    pub fn memoize_pipeline(&self, hostname: &str, seen: &HostTarget, pipeline: Arc<Pipeline>) -> Arc<Pipeline> {
        let key = normalize(hostname);
        let mut inner = self.inner.write();

        match inner.hosts.get_mut(key.as_ref()) {
            Some(entry) if entry.target == seen.target => match &entry.pipeline {
                Some(existing) => Arc::clone(existing),
                None => {
                    entry.pipeline = Some(Arc::clone(&pipeline));
                    pipeline
                }
            },
            _ => pipeline,
        }
    }

    /// Substitute the table and settings in one step
    pub fn replace_all(&self, parsed: ParsedConfig) {
        let mut inner = self.inner.write();
        inner.hosts = parsed.hosts;
        inner.settings = parsed.settings;
        inner.generation += 1;
    }

    pub fn settings(&self) -> Settings {
        self.inner.read().settings.clone()
    }

    /// `(max_requests, window_size)` for the rate limiter
    pub fn rate_limit(&self) -> (u32, Duration) {
        let inner = self.inner.read();
        (inner.settings.max_requests, inner.settings.window_size)
    }

    /// Number of successful reloads since construction
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn len(&self) -> usize {
        self.inner.read().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().hosts.is_empty()
    }

    /// Sorted list of mapped hostnames
    pub fn hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().hosts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Consistent copy of the table and settings
    pub fn snapshot(&self) -> ParsedConfig {
        let inner = self.inner.read();
        ParsedConfig {
            hosts: inner.hosts.clone(),
            settings: inner.settings.clone(),
        }
    }

    /// Every cached pipeline
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.inner
            .read()
            .hosts
            .values()
            .filter_map(|entry| entry.pipeline.clone())
            .collect()
    }
}
