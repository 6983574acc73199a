//! A stack of view-models for layered, modal navigation.
//!
//! Applications map parameter types to view-model factories, open entries by
//! value, and close them through each entry's [`ServiceHandle`]. Closing is
//! negotiated: an entry may veto its own removal, synchronously or after
//! awaiting something (typically a confirmation prompt). Requests made while
//! an entry is being built or torn down are deferred until that step ends.

pub mod defer;
pub mod error;
pub mod events;
pub mod frame;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod stack;
pub mod view_model;

pub use defer::{DeferGate, DeferScope, DeferredAction, FlushOutcome};
pub use error::{Result, StackError};
pub use events::{EventSource, SubscriptionId};
pub use frame::{FrameSource, FrameSubscription, FrameTicker, UpdateMode};
pub use logging::{
    FileSink, LogEvent, LogFields, LogLevel, LogSink, Logger, LoggingError, LoggingResult,
    MemorySink, NullSink,
};
pub use metrics::{MetricSnapshot, StackMetrics};
pub use registry::{ConventionLocator, TypeDescriptor, TypeMappingRegistry, ViewLocator, ViewType};
pub use stack::audit::{
    NullStackAudit, RecordingStackAudit, StackAudit, StackAuditEvent, StackAuditEventBuilder,
    StackAuditStage,
};
pub use stack::{
    ClosedCallback, CollectionChange, DEFAULT_LOG_TARGET, EntryId, RemoveTopViewModelCommand,
    ServiceHandle, StackConfig, ViewModelStack,
};
pub use view_model::{AsAny, ViewModel};
