//! Shipper - responsibility and behavior
//!
//! The Shipper is the transport end of the telemetry pipeline. It takes *already-built* batches
//! of `LogRecord`s and forwards them to the collector with the OTLP/gRPC
//! `LogsService/Export` call.
//!
//! Key responsibilities:
//! - Establish the outbound gRPC channel once, at construction. TLS is used for `https`
//! endpoints; a failure here is fatal for the invocation and is never retried.
//! - Attach the auth token to every request as the `x-kubiks-key` header.
//! - Report per-batch failures (`Status`, partial rejection) to the caller, which is the
//! batch processor worker. That worker logs and counts them; nothing is redelivered.
//!
//! Important design notes:
//! - The Shipper *does not* queue or batch. That's the responsibility of the buffer-batcher
//! module, which owns the only background task in the pipeline.
//! - [`LogExporter`] is the seam between the two, so the batch processor can be driven by
//! any transport.

// Local crates
use crate::{
    helpers::{converters::export_request, errors::KubiksError, load_config::ExporterConfig},
    proto::collector::logs_service_client::LogsServiceClient,
    telemetry::record::LogRecord,
};

// External crates
use std::future::Future;
use tonic::codegen::InterceptedService;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::instrument;

/// Request header carrying the auth token
pub const AUTH_HEADER: &str = "x-kubiks-key";

/// Shipper error handling
/// - Per-batch failures only. Connection failures surface as [`KubiksError::Transport`]
/// from [`OtlpExporter::connect`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    /// Non-OK gRPC status
    #[error("collector returned {0}")]
    Status(#[from] Status),
    /// OK response carrying a partial success
    #[error("collector rejected {rejected} records: {message}")]
    PartiallyRejected {
        /// Count reported by the collector
        rejected: i64,
        /// Collector's explanation, may be empty
        message: String,
    },
    /// Export call outlived the export timeout
    #[error("export did not complete within {0:?}")]
    Timeout(std::time::Duration),
    /// Invocation was cancelled mid-export
    #[error("export abandoned, invocation cancelled")]
    Cancelled,
}

/// Anything that can deliver a batch of records somewhere.
///
/// Implementations are owned by the batch processor worker task and called with one batch
/// at a time, never concurrently.
pub trait LogExporter: Send + Sync + 'static {
    /// Deliver one batch, in order
    fn export(&self, batch: Vec<LogRecord>) -> impl Future<Output = Result<(), ShipperError>> + Send;
}

/// Adds the auth token header to every outgoing request
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    token: AsciiMetadataValue,
}

impl AuthInterceptor {
    /// Fails when the token contains bytes that are not allowed in a header value.
    pub fn new(token: &str) -> Result<Self, KubiksError> {
        let token = AsciiMetadataValue::try_from(token).map_err(|e| {
            KubiksError::configuration_with("authentication token is not a valid header value", e)
        })?;
        Ok(Self { token })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request.metadata_mut().insert(AUTH_HEADER, self.token.clone());
        Ok(request)
    }
}

/// OTLP/gRPC log exporter
#[derive(Debug, Clone)]
pub struct OtlpExporter {
    client: LogsServiceClient<InterceptedService<Channel, AuthInterceptor>>,
    service_name: String,
}

impl OtlpExporter {
    /// Connect to the configured collector endpoint.
    ///
    /// Token problems are reported as configuration errors before any socket is opened.
    /// Endpoint parsing, TLS setup and the connect itself fail with
    /// [`KubiksError::Transport`].
    #[instrument(
        name = "kubiks_shipper::connect",
        target = "shipper::shipper::OtlpExporter",
        skip_all,
        fields(endpoint = %config.endpoint),
        level = "debug"
    )]
    pub async fn connect(
        config: &ExporterConfig,
        token: &str,
        service_name: &str,
    ) -> Result<Self, KubiksError> {
        let interceptor = AuthInterceptor::new(token)?;
        let transport_error = |source| KubiksError::Transport {
            endpoint: config.endpoint.clone(),
            source,
        };

        let mut endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(transport_error)?
            .connect_timeout(config.connection_timeout())
            .timeout(config.export_timeout());

        if config.endpoint.starts_with("https://") {
            tracing::debug!("Configuring TLS with webpki root certificates");
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(transport_error)?;
        }

        tracing::debug!("Creating HTTP/2 connection channel to telemetry collector");
        let channel = endpoint.connect().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to telemetry collector");
            transport_error(e)
        })?;
        tracing::debug!("Connected to telemetry collector");

        Ok(Self {
            client: LogsServiceClient::with_interceptor(channel, interceptor),
            service_name: service_name.to_string(),
        })
    }
}

impl LogExporter for OtlpExporter {
    #[instrument(
        name = "kubiks_shipper::export",
        target = "shipper::shipper::OtlpExporter",
        skip_all,
        fields(batch_size = batch.len()),
        level = "trace"
    )]
    async fn export(&self, batch: Vec<LogRecord>) -> Result<(), ShipperError> {
        let request = export_request(&self.service_name, batch);
        // Clones share the underlying channel.
        let mut client = self.client.clone();
        let response = client.export(request).await?.into_inner();

        match response.partial_success {
            Some(partial) if partial.rejected_log_records > 0 => Err(ShipperError::PartiallyRejected {
                rejected: partial.rejected_log_records,
                message: partial.error_message,
            }),
            _ => Ok(()),
        }
    }
}
