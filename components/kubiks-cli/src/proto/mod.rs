//! OTLP protobuf types used on the wire.
//!
//! Generated code comes from `opentelemetry-proto` (tonic flavour) instead of a local
//! `build.rs`, these re-exports keep call sites short.

/// `LogsService` client/server and export messages
pub mod collector {
    pub use opentelemetry_proto::tonic::collector::logs::v1::*;
}
/// `KeyValue`, `AnyValue`, `InstrumentationScope`
pub mod common {
    pub use opentelemetry_proto::tonic::common::v1::*;
}
/// `LogRecord`, `ResourceLogs`, `ScopeLogs`
pub mod logs {
    pub use opentelemetry_proto::tonic::logs::v1::*;
}
/// `Resource`
pub mod resource {
    pub use opentelemetry_proto::tonic::resource::v1::*;
}
