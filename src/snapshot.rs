//! Rule snapshots and their hot refresh.
//!
//! A [`RuleSnapshot`] is an immutable, fully built rule tree. The
//! [`SnapshotStore`] holds the current one behind an `Arc` swap, the same way
//! a live configuration is held: readers clone the `Arc` once per request and
//! evaluate without any lock, and a refresh builds a complete replacement
//! before swapping it in.
//!
//! # Refresh
//!
//! A snapshot built with a refresh interval becomes stale once
//! `next_refresh_at` passes. Two paths rebuild it:
//!
//! - [`SnapshotStore::refresh_if_stale`] waits for the refresh lock, then
//!   re-checks staleness. Callers that queued behind a successful refresh find
//!   a fresh snapshot and do no work.
//! - [`SnapshotStore::trigger_background`] only spawns when it can take the
//!   lock immediately, so at most one background refresh is in flight.
//!
//! A failed build leaves the current snapshot (and its deadline) in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::{ExternalDataConfig, GuardConfig, RawRule};
use crate::context::RequestContext;
use crate::external_data::{self, DataSource};
use crate::interfaces::InterfaceSource;
use crate::rules::{BuildContext, RuleNode, matches_any};
use crate::{Error, Result};

/// An immutable rule tree plus its lifetime.
#[derive(Debug)]
pub struct RuleSnapshot {
    created_at: DateTime<Utc>,
    next_refresh_at: Option<Instant>,
    roots: Vec<RuleNode>,
}

impl RuleSnapshot {
    /// Wrap built roots. With `refresh_interval`, the snapshot goes stale that
    /// long after now.
    #[must_use]
    pub fn new(roots: Vec<RuleNode>, refresh_interval: Option<Duration>) -> Self {
        Self {
            created_at: Utc::now(),
            next_refresh_at: refresh_interval.map(|d| Instant::now() + d),
            roots,
        }
    }

    /// Wall-clock build time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the snapshot goes stale; `None` means never.
    #[must_use]
    pub fn next_refresh_at(&self) -> Option<Instant> {
        self.next_refresh_at
    }

    /// Root rules.
    #[must_use]
    pub fn roots(&self) -> &[RuleNode] {
        &self.roots
    }

    /// Whether the refresh deadline has passed.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.next_refresh_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Evaluate the roots as one implicit `anyOf`.
    pub fn matches(&self, ctx: &mut RequestContext) -> bool {
        matches_any(&self.roots, ctx)
    }
}

/// Builds snapshots from configuration: fetch, render, construct.
pub struct SnapshotBuilder {
    rules: Vec<RawRule>,
    external_data: ExternalDataConfig,
    refresh_interval: Option<Duration>,
    data_source: Arc<dyn DataSource>,
    interfaces: Arc<dyn InterfaceSource>,
}

impl SnapshotBuilder {
    /// Capture the rule-related parts of `config`.
    pub fn new(
        config: &GuardConfig,
        data_source: Arc<dyn DataSource>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        Self {
            rules: config.rules.clone(),
            external_data: config.external_data.clone(),
            refresh_interval: config.refresh_interval,
            data_source,
            interfaces,
        }
    }

    /// Fetch external data (when configured) and build a complete snapshot.
    pub async fn build(&self) -> Result<RuleSnapshot> {
        let template_data = self.template_data().await?;
        let roots = RuleNode::build_all(
            &self.rules,
            &BuildContext {
                template_data: &template_data,
                interfaces: self.interfaces.as_ref(),
            },
        )?;
        Ok(RuleSnapshot::new(roots, self.refresh_interval))
    }

    async fn template_data(&self) -> Result<Value> {
        if !self.external_data.is_enabled() {
            return Ok(json!({}));
        }
        let document = self.data_source.fetch(&self.external_data).await?;
        let data = external_data::project(document, &self.external_data.data_key)?;
        Ok(json!({ "data": data }))
    }
}

/// Result of a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was installed
    Refreshed,
    /// The current snapshot was still fresh
    NotNeeded,
}

/// Holds the current snapshot and serializes refreshes.
pub struct SnapshotStore {
    current: RwLock<Arc<RuleSnapshot>>,
    builder: SnapshotBuilder,
    refresh_lock: Arc<Mutex<()>>,
    refresh_timeout: Duration,
}

impl SnapshotStore {
    /// Build the first snapshot. Any failure here is fatal to the caller.
    pub async fn initialize(builder: SnapshotBuilder, refresh_timeout: Duration) -> Result<Self> {
        let snapshot = builder.build().await?;
        info!(
            rules = snapshot.roots().len(),
            created_at = %snapshot.created_at(),
            "Rule snapshot built"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            builder,
            refresh_lock: Arc::new(Mutex::new(())),
            refresh_timeout,
        })
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Whether the current snapshot is past its deadline.
    pub fn is_stale(&self) -> bool {
        self.current.read().is_stale()
    }

    /// Refresh synchronously if stale, waiting for an in-flight refresh first.
    ///
    /// The build is bounded by the configured refresh timeout.
    pub async fn refresh_if_stale(&self) -> Result<RefreshOutcome> {
        if !self.is_stale() {
            return Ok(RefreshOutcome::NotNeeded);
        }
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Spawn a background refresh when stale and no refresh is running.
    ///
    /// Returns `true` when a task was spawned.
    pub fn trigger_background(self: &Arc<Self>) -> bool {
        if !self.is_stale() {
            return false;
        }
        let Ok(guard) = Arc::clone(&self.refresh_lock).try_lock_owned() else {
            debug!("Refresh already in flight");
            return false;
        };

        let store = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = store.refresh_locked().await {
                warn!(error = %e, "Background rule refresh failed; keeping current rules");
            }
        });
        true
    }

    /// Must be called with the refresh lock held.
    async fn refresh_locked(&self) -> Result<RefreshOutcome> {
        if !self.is_stale() {
            return Ok(RefreshOutcome::NotNeeded);
        }

        let built = timeout(self.refresh_timeout, self.builder.build())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "rule refresh exceeded {}ms",
                    self.refresh_timeout.as_millis()
                ))
            })
            .and_then(|r| r);

        match built {
            Ok(snapshot) => {
                info!(
                    rules = snapshot.roots().len(),
                    created_at = %snapshot.created_at(),
                    "Rule snapshot refreshed"
                );
                *self.current.write() = Arc::new(snapshot);
                telemetry_metrics::counter!("tls_guard_refresh_total", "result" => "success")
                    .increment(1);
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                telemetry_metrics::counter!("tls_guard_refresh_total", "result" => "failure")
                    .increment(1);
                Err(e)
            }
        }
    }
}
