use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::anomaly::{self, AnomalyStats, CompressedStats, ConcernScore};
use crate::autotune;
use crate::cache::Cache;
use crate::config::{AnomalyParams, AutotuneParams, Config, CorridorParams, TimeoutParams};
use crate::corridor::{self, CorridorPayload, RestoredCorridor};
use crate::error::Result;
use crate::grafana::GrafanaClient;
use crate::metrics;
use crate::series::{self, Sample, Series};

/// A validated `query_range` request.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub query: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

/// One fully analysed series, ready for the formatter.
#[derive(Debug, Clone)]
pub struct SeriesRow {
    pub series: Series,
    pub corridor: Option<RestoredCorridor>,
    pub stats: Option<AnomalyStats>,
    pub concern: Option<ConcernScore>,
    pub historical: Option<CompressedStats>,
    pub rebuild_count: u64,
    pub placeholder: bool,
}

impl SeriesRow {
    fn placeholder(mut series: Series) -> SeriesRow {
        series.set_label("unused_metric", "true");
        SeriesRow {
            series,
            corridor: None,
            stats: None,
            concern: None,
            historical: None,
            rebuild_count: 0,
            placeholder: true,
        }
    }
}

/// Everything the per-series workers share for one request.
struct SeriesContext {
    cache: Arc<Cache>,
    req: RangeQuery,
    corridor_params: CorridorParams,
    anomaly_params: AnomalyParams,
    autotune_params: AutotuneParams,
    config_hash: String,
    hist_end: i64,
    hist_step: i64,
    period_days: f64,
    now: i64,
}

/// The per-request driver: fetch, group, consult the cache tiers, rebuild
/// corridors where stale, restore, detect, score.
pub struct Pipeline {
    cache: Arc<Cache>,
}

impl Pipeline {
    pub fn new(cache: Arc<Cache>) -> Self {
        Pipeline { cache }
    }

    pub async fn run(
        &self,
        client: &GrafanaClient,
        cfg: &Config,
        req: &RangeQuery,
        now: i64,
    ) -> Result<Vec<SeriesRow>> {
        let corridor_params = CorridorParams::from_config(cfg);
        let timeout_params = TimeoutParams::from_config(cfg);
        let fetch_budget = Duration::from_secs(timeout_params.request_seconds.max(1));

        // History window, clamped by the per-metric fetch-budget memo.
        let hist_end = now - (corridor_params.historical_offset_days * 86_400.0) as i64;
        let mut period_days = corridor_params.historical_period_days;
        if let Ok(Some(max_days)) = self.cache.load_max_period(&req.query) {
            if max_days > 0.0 && max_days < period_days {
                tracing::info!(
                    query = %req.query,
                    configured = period_days,
                    clamped = max_days,
                    "history window clamped by fetch-budget memo"
                );
                period_days = max_days;
            }
        }
        let hist_start = hist_end - (period_days * 86_400.0) as i64;
        let hist_step = corridor_params.history_step.max(1);

        // Live and history fetches proceed concurrently; both must land
        // before any corridor work starts.
        let fetch_started = Instant::now();
        let (live, history) = tokio::join!(
            client.fetch_range(&req.query, req.start, req.end, req.step, fetch_budget),
            client.fetch_range(&req.query, hist_start, hist_end, hist_step, fetch_budget),
        );
        let fetch_elapsed = fetch_started.elapsed();

        let live = live?;
        let history = match history {
            Ok(points) => points,
            Err(e) => {
                // A lost history window degrades every series to a
                // placeholder instead of failing the request.
                tracing::warn!(error = %e, query = %req.query, "history fetch failed");
                metrics::record_upstream_failure("history");
                Vec::new()
            }
        };

        // Feed the fetch-budget heuristic: a history fetch consuming more
        // than half the request budget halves the next window.
        if fetch_elapsed > fetch_budget / 2 && period_days > 1.0 {
            let reduced = (period_days / 2.0).max(1.0);
            if let Err(e) = self.cache.save_max_period(&req.query, reduced, now) {
                tracing::warn!(error = %e, "failed to persist fetch-budget memo");
            }
        }

        let live_series = series::group_samples(live);
        let history_series = series::group_samples(history);

        let context = Arc::new(SeriesContext {
            cache: self.cache.clone(),
            req: req.clone(),
            corridor_params,
            anomaly_params: AnomalyParams::from_config(cfg),
            autotune_params: AutotuneParams::from_config(cfg),
            config_hash: cfg.config_hash(),
            hist_end,
            hist_step,
            period_days,
            now,
        });

        // The per-series loop fans out over blocking workers; the metric
        // cap bounds the worker count. No inter-series ordering is
        // guaranteed in the response.
        let mut workers: JoinSet<Result<SeriesRow>> = JoinSet::new();
        for (index, (labels_json, series)) in live_series.into_iter().enumerate() {
            if index >= timeout_params.max_metrics {
                tracing::warn!(
                    query = %req.query,
                    cap = timeout_params.max_metrics,
                    "metric cap reached, emitting partial result"
                );
                break;
            }
            let history_points = history_series
                .get(&labels_json)
                .map(|s| s.points.clone())
                .unwrap_or_default();
            let context = context.clone();
            workers.spawn_blocking(move || process_series(&context, series, &history_points));
        }

        let mut rows = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(row)) => rows.push(row),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, query = %req.query, "series analysis failed, omitting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, query = %req.query, "series worker panicked, omitting");
                }
            }
        }
        Ok(rows)
    }
}

/// Analyse one series. Never lets a cache failure surface: a broken read
/// is a miss, a broken write loses only persistence.
fn process_series(
    ctx: &SeriesContext,
    series: Series,
    history_points: &[Sample],
) -> Result<SeriesRow> {
    if history_points.len() < ctx.corridor_params.min_data_points {
        metrics::record_placeholder();
        return Ok(SeriesRow::placeholder(series));
    }

    let labels_json = series.labels_json.clone();
    let stale = ctx
        .cache
        .should_recreate(&ctx.req.query, &labels_json, &ctx.config_hash, ctx.now)
        .unwrap_or(true);

    let mut payload = None;
    if !stale {
        match ctx.cache.load_corridor(&ctx.req.query, &labels_json, ctx.now) {
            Ok(Some(cached)) => {
                metrics::record_cache_hit();
                payload = Some(cached);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed, treating as miss");
            }
        }
    }

    let payload = match payload {
        Some(payload) => payload,
        None => {
            metrics::record_cache_miss();
            match rebuild(ctx, &series, history_points)? {
                Some(payload) => payload,
                None => {
                    metrics::record_placeholder();
                    return Ok(SeriesRow::placeholder(series));
                }
            }
        }
    };

    // Restore over the request grid and score the live window.
    let restored = corridor::restore(
        &payload,
        ctx.req.start,
        ctx.req.end,
        ctx.req.step,
        &ctx.corridor_params,
    );
    let (points, upper, lower) = align_to_grid(&series.points, &restored);
    let stats = anomaly::detect(&points, &upper, &lower, ctx.req.step);
    let concern = anomaly::score(&stats, &payload.meta.anomaly_stats, &ctx.anomaly_params);

    Ok(SeriesRow {
        series,
        corridor: Some(restored),
        stats: Some(stats),
        concern: Some(concern),
        historical: Some(payload.meta.anomaly_stats.clone()),
        rebuild_count: payload.meta.rebuild_count,
        placeholder: false,
    })
}

/// The MISS path: consult the permanent memo, auto-tune on memo miss,
/// trim the history to the optimal period, rebuild and persist.
fn rebuild(
    ctx: &SeriesContext,
    series: &Series,
    history_points: &[Sample],
) -> Result<Option<CorridorPayload>> {
    let labels_json = &series.labels_json;
    let request_md5 =
        normalized_request_md5(&ctx.req.query, labels_json, ctx.hist_step, ctx.period_days);

    let optimal_days = if ctx.corridor_params.auto_tune {
        let memo = ctx
            .cache
            .load_autotune(&ctx.req.query, labels_json)
            .unwrap_or(None);
        match memo {
            Some(entry) if entry.request_md5 == request_md5 => entry.optimal_period_days,
            _ => {
                metrics::record_autotune_run();
                let result = autotune::optimal_period(history_points, &ctx.autotune_params);
                if let Err(e) = ctx.cache.save_autotune(
                    &ctx.req.query,
                    labels_json,
                    &ctx.config_hash,
                    &request_md5,
                    &result,
                    ctx.corridor_params.scale_corridor,
                    ctx.now,
                ) {
                    tracing::warn!(error = %e, "failed to persist auto-tune memo");
                }
                result.optimal_period_days
            }
        }
    } else {
        ctx.period_days
    };

    let mut effective_days = optimal_days;
    if !(effective_days > 0.0) || effective_days > ctx.period_days {
        effective_days = ctx.period_days;
    }
    let trim_start = ctx.hist_end - (effective_days * 86_400.0) as i64;
    let trimmed: Vec<Sample> = history_points
        .iter()
        .filter(|p| p.time >= trim_start)
        .copied()
        .collect();

    let Some(bounds) =
        corridor::bounds_from_history(&trimmed, trim_start, ctx.hist_end, ctx.hist_step)
    else {
        return Ok(None);
    };

    let prior_rebuilds = ctx
        .cache
        .load_corridor(&ctx.req.query, labels_json, ctx.now)
        .ok()
        .flatten()
        .map(|p| p.meta.rebuild_count)
        .unwrap_or(0);
    let rebuild_count = prior_rebuilds + 1;
    if rebuild_count > ctx.corridor_params.max_rebuild_count {
        tracing::warn!(
            labels = %labels_json,
            rebuild_count,
            cap = ctx.corridor_params.max_rebuild_count,
            "rebuild count exceeded its cap, rebuilding anyway"
        );
    }

    let mut payload = corridor::build(
        &bounds,
        &ctx.corridor_params,
        ctx.config_hash.clone(),
        series.labels.clone(),
        rebuild_count,
        anomaly::empty_compressed(),
        ctx.now,
    );

    // Historical baseline: the history window scored against its own
    // corridor.
    let hist_restored = corridor::restore(
        &payload,
        bounds.times[0],
        *bounds.times.last().unwrap(),
        ctx.hist_step,
        &ctx.corridor_params,
    );
    let (hist_points, hist_upper, hist_lower) = align_to_grid(&trimmed, &hist_restored);
    let hist_stats = anomaly::detect(&hist_points, &hist_upper, &hist_lower, ctx.hist_step);
    payload.meta.anomaly_stats = anomaly::compress(&hist_stats, &ctx.anomaly_params.percentiles);

    if let Err(e) = ctx.cache.save_corridor(
        &ctx.req.query,
        labels_json,
        &payload,
        &ctx.config_hash,
        ctx.now,
    ) {
        tracing::warn!(error = %e, "failed to persist corridor payload");
    }
    metrics::record_rebuild();

    Ok(Some(payload))
}

/// Index-align a point set to a restored corridor grid: keep only grid
/// slots that have an observation, with the corridor values at the same
/// slots.
fn align_to_grid(
    points: &[Sample],
    restored: &RestoredCorridor,
) -> (Vec<Sample>, Vec<f64>, Vec<f64>) {
    let by_time: BTreeMap<i64, f64> = points.iter().map(|p| (p.time, p.value)).collect();
    let mut out_points = Vec::new();
    let mut out_upper = Vec::new();
    let mut out_lower = Vec::new();
    for (i, &t) in restored.times.iter().enumerate() {
        if let Some(&value) = by_time.get(&t) {
            out_points.push(Sample { time: t, value });
            out_upper.push(restored.upper[i]);
            out_lower.push(restored.lower[i]);
        }
    }
    (out_points, out_upper, out_lower)
}

/// The normalised request identity for the permanent auto-tune memo: the
/// request shape (query, series, history grid, configured base period),
/// not the volatile window or the corridor configuration.
pub fn normalized_request_md5(
    query: &str,
    labels_json: &str,
    hist_step: i64,
    period_days: f64,
) -> String {
    let text = format!("{}|{}|{}|{:.5}", query, labels_json, hist_step, period_days);
    format!("{:x}", md5::compute(text))
}
