//! This module defines conversions between internal records and their OTLP protobuf equivalents.
//!
//! These conversions are total, they never fail: every internal field has a valid
//! representation in the protobuf type.

// Local crates
use crate::proto::{
    collector::ExportLogsServiceRequest,
    common::{AnyValue, InstrumentationScope, KeyValue, any_value},
    logs::{LogRecord as ProtoLogRecord, ResourceLogs, ScopeLogs},
    resource::Resource,
};
use crate::telemetry::record::{ATTR_SERVICE_NAME, LogRecord as InternalLogRecord};

// External crates
use chrono::{DateTime, Utc};

/// Instrumentation scope reported with every batch
pub const SCOPE_NAME: &str = "kubiks-cli";

/// Build a string-valued OTLP attribute
pub fn string_kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn unix_nanos(timestamp: DateTime<Utc>) -> u64 {
    timestamp
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or(0)
}

/// Convert internal `LogRecord` (from telemetry::record) -> protobuf `LogRecord` (from proto::logs).
impl From<InternalLogRecord> for ProtoLogRecord {
    fn from(record: InternalLogRecord) -> Self {
        let time_unix_nano = unix_nanos(record.timestamp);

        Self {
            time_unix_nano,
            observed_time_unix_nano: unix_nanos(Utc::now()).max(time_unix_nano),
            severity_number: record.severity.number(),
            severity_text: record.severity.text().to_string(),
            body: Some(AnyValue {
                value: Some(any_value::Value::StringValue(record.body)),
            }),
            attributes: record
                .attributes
                .iter()
                .map(|(key, value)| string_kv(key, value))
                .collect(),
            ..Default::default()
        }
    }
}

/// Wrap one batch of records for a single service into an export request.
///
/// The request always carries exactly one `ResourceLogs` with one `ScopeLogs`; a
/// session never spans more than one service name.
pub fn export_request(service_name: &str, records: Vec<InternalLogRecord>) -> ExportLogsServiceRequest {
    let resource = Resource {
        attributes: vec![string_kv(ATTR_SERVICE_NAME, service_name)],
        ..Default::default()
    };

    let scope_logs = ScopeLogs {
        scope: Some(InstrumentationScope {
            name: SCOPE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }),
        log_records: records.into_iter().map(Into::into).collect(),
        ..Default::default()
    };

    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(resource),
            scope_logs: vec![scope_logs],
            ..Default::default()
        }],
    }
}

/// Read back the string value of an OTLP attribute, used by tests and the mock collector.
pub fn string_value(kv: &KeyValue) -> Option<&str> {
    match kv.value.as_ref()?.value.as_ref()? {
        any_value::Value::StringValue(s) => Some(s.as_str()),
        _ => None,
    }
}
