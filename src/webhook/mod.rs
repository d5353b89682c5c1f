//! Conversion webhook for the CloudStack CRDs
//!
//! The API server stores every kind at the hub version and calls this
//! webhook whenever a client reads or writes another served version.

pub mod conversion;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::Error;

/// Path the CRDs' conversion webhook client config points at
pub const CONVERT_PATH: &str = "/convert";

/// Default port for the webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Create the webhook router
///
/// - POST /convert - ConversionReview for any served kind
/// - GET /healthz - liveness
pub fn webhook_router() -> Router {
    Router::new()
        .route(CONVERT_PATH, post(conversion::convert_handler))
        .route("/healthz", get(|| async { "ok" }))
}

/// Serve the webhook over TLS until the process is stopped
pub async fn serve(addr: SocketAddr, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| Error::validation(format!("TLS config error: {e}")))?;

    info!(addr = %addr, "Starting conversion webhook server");

    axum_server::bind_rustls(addr, tls_config)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| Error::internal_with_context(e.to_string(), "webhook server"))
}
