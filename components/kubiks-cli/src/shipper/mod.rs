//! Transport to the collector.

/// OTLP/gRPC exporter and the `LogExporter` seam
pub mod shipper;
