//! Analyst SDK
//!
//! Shared library providing the engine error type and the wire contracts
//! exchanged with capability adapters (forecast, document retrieval,
//! structured data).

/// Error types and handling
pub mod errors;

/// Capability input/output types
pub mod types;

// Re-export commonly used types
pub use errors::{AnalystErrorExt, EngineError};
pub use types::{
    ForecastPayload, ForecastPoint, ForecastResult, RetrievalResult, Source, StructuredResult,
};
