pub mod structured_logging;

pub use structured_logging::{
    init_structured_logging,
    LogFormat,
    LoggingConfig,
    StructuredLogEntry,
    ExecutionContext,
    OperationTimer,
};
