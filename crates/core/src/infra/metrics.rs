use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::error::ErrorCode;
use crate::domain::job::StageName;

/// 保持するレイテンシ記録の上限
const MAX_LATENCY_RECORDS: usize = 1000;
const RECENT_LATENCIES: usize = 20;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    calendar_events_posted: u64,
    calendar_events_failed: u64,
    errors: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub stage: StageName,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub calendar_events_posted: u64,
    pub calendar_events_failed: u64,
    /// エラーコード (`E_...`) ごとの件数
    pub error_counts: BTreeMap<String, u64>,
    /// ステージごとの平均所要時間（記録がないステージは含まない）
    pub avg_stage_ms: BTreeMap<StageName, f64>,
    pub recent_latencies: Vec<LatencyRecord>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    pub fn inc_jobs_completed(&self) {
        self.counters.lock().jobs_completed += 1;
    }

    pub fn inc_jobs_failed(&self) {
        self.counters.lock().jobs_failed += 1;
    }

    pub fn add_calendar_results(&self, posted: u32, failed: u32) {
        let mut c = self.counters.lock();
        c.calendar_events_posted += posted as u64;
        c.calendar_events_failed += failed as u64;
    }

    pub fn inc_error(&self, code: ErrorCode) {
        *self.counters.lock().errors.entry(code.as_str()).or_insert(0) += 1;
    }

    pub fn record_stage_latency(&self, stage: StageName, duration_ms: u64) {
        let record = LatencyRecord {
            stage,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        if latencies.len() > MAX_LATENCY_RECORDS {
            let excess = latencies.len() - MAX_LATENCY_RECORDS;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let mut totals: BTreeMap<StageName, (f64, u32)> = BTreeMap::new();
        for r in latencies.iter() {
            let entry = totals.entry(r.stage).or_insert((0.0, 0));
            entry.0 += r.duration_ms as f64;
            entry.1 += 1;
        }
        let avg_stage_ms = totals
            .into_iter()
            .map(|(stage, (sum, n))| (stage, sum / n as f64))
            .collect();

        let recent: Vec<LatencyRecord> = latencies
            .iter()
            .rev()
            .take(RECENT_LATENCIES)
            .cloned()
            .collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_completed: c.jobs_completed,
            jobs_failed: c.jobs_failed,
            calendar_events_posted: c.calendar_events_posted,
            calendar_events_failed: c.calendar_events_failed,
            error_counts: c
                .errors
                .iter()
                .map(|(code, n)| (code.to_string(), *n))
                .collect(),
            avg_stage_ms,
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
