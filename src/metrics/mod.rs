use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct StackMetrics {
    opens: u64,
    open_failures: u64,
    closes: u64,
    vetoes: u64,
    update_passes: u64,
    deferred_actions: u64,
    peak_depth: usize,
}

impl StackMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self, depth: usize) {
        self.opens = self.opens.saturating_add(1);
        self.peak_depth = self.peak_depth.max(depth);
    }

    pub fn record_open_failure(&mut self) {
        self.open_failures = self.open_failures.saturating_add(1);
    }

    pub fn record_close(&mut self) {
        self.closes = self.closes.saturating_add(1);
    }

    pub fn record_veto(&mut self) {
        self.vetoes = self.vetoes.saturating_add(1);
    }

    pub fn record_update_pass(&mut self) {
        self.update_passes = self.update_passes.saturating_add(1);
    }

    pub fn record_deferred(&mut self, count: usize) {
        if count > 0 {
            self.deferred_actions = self.deferred_actions.saturating_add(count as u64);
        }
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            opens: self.opens,
            open_failures: self.open_failures,
            closes: self.closes,
            vetoes: self.vetoes,
            update_passes: self.update_passes,
            deferred_actions: self.deferred_actions,
            peak_depth: self.peak_depth as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub opens: u64,
    pub open_failures: u64,
    pub closes: u64,
    pub vetoes: u64,
    pub update_passes: u64,
    pub deferred_actions: u64,
    pub peak_depth: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "stack_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("opens".to_string(), json!(self.opens));
        map.insert("open_failures".to_string(), json!(self.open_failures));
        map.insert("closes".to_string(), json!(self.closes));
        map.insert("vetoes".to_string(), json!(self.vetoes));
        map.insert("update_passes".to_string(), json!(self.update_passes));
        map.insert("deferred_actions".to_string(), json!(self.deferred_actions));
        map.insert("peak_depth".to_string(), json!(self.peak_depth));
        map
    }
}
