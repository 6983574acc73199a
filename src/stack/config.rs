use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::frame::{FrameSource, UpdateMode};
use crate::logging::Logger;
use crate::metrics::StackMetrics;
use crate::registry::ViewLocator;

use super::audit::{NullStackAudit, StackAudit};

pub const DEFAULT_LOG_TARGET: &str = "view_stack::stack";

/// Configuration knobs for a [`ViewModelStack`](super::ViewModelStack).
#[derive(Clone)]
pub struct StackConfig {
    /// Whether update callbacks run on frame ticks or on explicit request.
    pub update_mode: UpdateMode,
    /// Tick source subscribed to in [`UpdateMode::PerFrame`].
    pub frame_source: Option<Rc<dyn FrameSource>>,
    /// Fallback consulted when no explicit mapping names a view.
    pub view_locator: Option<Rc<dyn ViewLocator>>,
    /// Optional structured logger.
    pub logger: Option<Logger>,
    /// Target field used for stack log events.
    pub log_target: String,
    /// Counters shared with whoever snapshots them.
    pub metrics: Option<Arc<Mutex<StackMetrics>>>,
    pub audit: Arc<dyn StackAudit>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::Manual,
            frame_source: None,
            view_locator: None,
            logger: None,
            log_target: DEFAULT_LOG_TARGET.to_string(),
            metrics: None,
            audit: Arc::new(NullStackAudit),
        }
    }
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive update callbacks from `source` on every frame.
    pub fn per_frame(mut self, source: Rc<dyn FrameSource>) -> Self {
        self.update_mode = UpdateMode::PerFrame;
        self.frame_source = Some(source);
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    pub fn with_view_locator(mut self, locator: Rc<dyn ViewLocator>) -> Self {
        self.view_locator = Some(locator);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn StackAudit>) -> Self {
        self.audit = audit;
        self
    }

    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(StackMetrics::new())));
        }
    }

    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    pub fn metrics_handle(&self) -> Option<Arc<Mutex<StackMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}
