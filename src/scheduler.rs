//! Supervised background tasks.
//!
//! Each task runs as its own tokio task and catches its own errors — a
//! failure in one never takes down another or the process. Grounded on the
//! teacher's pattern of spawning independent long-lived tasks from
//! `startup.rs` and holding their `JoinHandle`s for a graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::cache_index::CacheIndex;
use crate::config::SchedulerConfig;
use crate::context_store::ContextStore;
use crate::key_pool::KeyPool;
use crate::model_limits::ModelLimitsRegistry;
use crate::usage::UsageTracker;

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start all background tasks. Returns a handle that must be awaited on
    /// shutdown so each task can finish its current iteration cleanly.
    pub fn start(
        config: &SchedulerConfig,
        usage: Arc<UsageTracker>,
        context_store: Arc<ContextStore>,
        cache_index: Arc<CacheIndex>,
        key_pool: Arc<KeyPool>,
        model_limits: Arc<ModelLimitsRegistry>,
        memory_cleanup_interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();

        handles.push(spawn_daily_reset(
            usage.clone(),
            key_pool.clone(),
            config.timezone(),
            shutdown.clone(),
        ));
        handles.push(spawn_score_refresh(
            key_pool.clone(),
            Duration::from_secs(config.score_refresh_interval_seconds.max(1) as u64),
            shutdown.clone(),
        ));
        handles.push(spawn_usage_report(
            usage.clone(),
            key_pool.clone(),
            model_limits,
            Duration::from_secs(config.usage_report_interval_minutes.max(1) * 60),
            shutdown.clone(),
        ));
        handles.push(spawn_context_sweep(
            context_store.clone(),
            memory_cleanup_interval,
            shutdown.clone(),
        ));
        handles.push(spawn_cache_sweep(cache_index, memory_cleanup_interval, shutdown));

        Self { handles }
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_daily_reset(
    usage: Arc<UsageTracker>,
    key_pool: Arc<KeyPool>,
    tz: chrono_tz::Tz,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now().with_timezone(&tz);
            let next_midnight = (now.date_naive() + chrono::Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .expect("midnight is a valid time")
                .and_local_timezone(tz)
                .single()
                .unwrap_or(now);
            let sleep_for = (next_midnight - now).to_std().unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {
                    usage.daily_reset(Utc::now());
                    key_pool.clear_quota_exhausted_marks();
                    tracing::info!("daily usage counters and quota-exhausted marks reset");
                }
            }
        }
    })
}

fn spawn_score_refresh(
    key_pool: Arc<KeyPool>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    // Scores are recomputed lazily on the next `select`;
                    // this just invalidates the cache so that happens for
                    // every (key, model) pair rather than only the ones
                    // whose individual TTL has separately expired.
                    key_pool.force_refresh_scores();
                    tracing::debug!("score cache refresh forced");
                }
            }
        }
    })
}

fn spawn_usage_report(
    usage: Arc<UsageTracker>,
    key_pool: Arc<KeyPool>,
    model_limits: Arc<crate::model_limits::ModelLimitsRegistry>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    let report = build_usage_report(&usage, &key_pool, &model_limits, Utc::now());
                    tracing::info!(
                        total_keys = report.total_keys,
                        enabled_keys = report.enabled_keys,
                        total_requests = report.total_requests,
                        screened_this_cycle = report.screened_entries,
                        sizing_suggestion = %report.sizing_suggestion,
                        "usage report"
                    );
                    for key_usage in &report.per_key {
                        tracing::info!(
                            key_id = %key_usage.key_id,
                            model = %key_usage.model_id,
                            rpd_used = key_usage.rpd_used,
                            rpd_headroom = key_usage.rpd_headroom,
                            tpd_input_used = key_usage.tpd_input_used,
                            "usage report: per-key"
                        );
                    }
                }
            }
        }
    })
}

/// One model's usage under one key, as surfaced by the periodic report.
#[derive(Debug, Clone)]
pub struct KeyModelUsage {
    pub key_id: String,
    pub model_id: String,
    pub rpd_used: u32,
    /// Remaining daily requests, or `None` if the model has no configured
    /// daily limit to measure headroom against.
    pub rpd_headroom: Option<u32>,
    pub tpd_input_used: u64,
}

/// Structured snapshot emitted by the usage-report scheduler task. Shape
/// grounded on spec's listed contents: totals, per-key, screening summary,
/// estimated remaining headroom, and a key-pool sizing suggestion.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub total_keys: usize,
    pub enabled_keys: usize,
    pub total_requests: u64,
    pub screened_entries: usize,
    pub per_key: Vec<KeyModelUsage>,
    /// A plain-language suggestion on whether the pool looks under- or
    /// over-provisioned for its current load.
    pub sizing_suggestion: String,
}

fn build_usage_report(
    usage: &UsageTracker,
    key_pool: &KeyPool,
    model_limits: &crate::model_limits::ModelLimitsRegistry,
    now: chrono::DateTime<Utc>,
) -> UsageReport {
    let keys = key_pool.list_keys();
    let models: Vec<String> = model_limits.model_ids().map(str::to_string).collect();

    let mut per_key = Vec::new();
    let mut total_requests: u64 = 0;
    let mut near_exhaustion = 0usize;
    let mut screened_entries = 0usize;

    for key in &keys {
        screened_entries += key_pool.screening_log(&key.id).len();
        for model_id in &models {
            let snap = usage.snapshot(&key.id, model_id, now);
            if snap.rpd_used == 0 && snap.tpd_input_used == 0 {
                continue;
            }
            total_requests += snap.rpd_used as u64;
            let limit = model_limits.lookup(model_id);
            let headroom = limit.map(|l| l.rpd.saturating_sub(snap.rpd_used));
            if let Some(h) = headroom {
                if h < limit.map(|l| l.rpd / 10).unwrap_or(0) {
                    near_exhaustion += 1;
                }
            }
            per_key.push(KeyModelUsage {
                key_id: key.id.clone(),
                model_id: model_id.clone(),
                rpd_used: snap.rpd_used,
                rpd_headroom: headroom,
                tpd_input_used: snap.tpd_input_used,
            });
        }
    }

    let enabled_keys = keys.iter().filter(|k| k.enabled).count();
    let sizing_suggestion = if enabled_keys == 0 {
        "no enabled keys - pool cannot serve requests".to_string()
    } else if near_exhaustion * 2 > enabled_keys {
        format!(
            "{near_exhaustion}/{enabled_keys} enabled keys are within 10% of their daily cap - consider adding keys"
        )
    } else {
        "pool headroom looks adequate".to_string()
    };

    UsageReport {
        total_keys: keys.len(),
        enabled_keys,
        total_requests,
        screened_entries,
        per_key,
        sizing_suggestion,
    }
}

fn spawn_context_sweep(
    context_store: Arc<ContextStore>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    match context_store.sweep_expired().await {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "swept expired context records");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "context sweep failed"),
                    }
                }
            }
        }
    })
}

fn spawn_cache_sweep(
    cache_index: Arc<CacheIndex>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    match cache_index.sweep_expired(Utc::now()).await {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "swept expired cache handles");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::{score_weights_default, UpstreamKey};
    use std::collections::HashMap;

    #[test]
    fn report_flags_pool_as_underprovisioned_near_daily_cap() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "m1".to_string(),
            crate::model_limits::ModelLimit {
                rpm: 100,
                rpd: 10,
                tpm_input: 10_000,
                tpd_input: 100_000,
                input_token_limit: 100_000,
                output_token_limit: 8_000,
            },
        );
        let model_limits = Arc::new(ModelLimitsRegistry::new(overrides, 32_000));
        let usage = Arc::new(UsageTracker::new(chrono_tz::America::Los_Angeles));
        let key_pool = KeyPool::new(usage.clone(), model_limits.clone(), score_weights_default(), 60, 300, 30, None).unwrap();
        key_pool
            .add_key(UpstreamKey {
                id: "k1".to_string(),
                secret: "s".to_string(),
                description: String::new(),
                enabled: true,
                created_at: Utc::now(),
                expires_at: None,
                context_completion_enabled: false,
                last_used_at: None,
            })
            .unwrap();

        let now = Utc::now();
        for _ in 0..9 {
            usage.record_request("k1", "m1", 10, now);
        }

        let report = build_usage_report(&usage, &key_pool, &model_limits, now);
        assert_eq!(report.total_keys, 1);
        assert!(report.sizing_suggestion.contains("consider adding keys"));
    }

    #[test]
    fn report_is_healthy_with_no_usage() {
        let model_limits = Arc::new(ModelLimitsRegistry::new(HashMap::new(), 32_000));
        let usage = Arc::new(UsageTracker::new(chrono_tz::America::Los_Angeles));
        let key_pool = KeyPool::new(usage.clone(), model_limits.clone(), score_weights_default(), 60, 300, 30, None).unwrap();
        key_pool
            .add_key(UpstreamKey {
                id: "k1".to_string(),
                secret: "s".to_string(),
                description: String::new(),
                enabled: true,
                created_at: Utc::now(),
                expires_at: None,
                context_completion_enabled: false,
                last_used_at: None,
            })
            .unwrap();
        let report = build_usage_report(&usage, &key_pool, &model_limits, Utc::now());
        assert_eq!(report.sizing_suggestion, "pool headroom looks adequate");
    }
}
