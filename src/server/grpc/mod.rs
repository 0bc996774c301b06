//! The gRPC frontend: `LinkGateway` streams and the gateway/cluster unary calls.

pub mod link;
pub mod service;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::info;

pub use link::{run_link, GrpcFrontend, GrpcOptions, GrpcService, MqttInfo};
pub use service::{GsClient, GsServer, GtwGsClient, GtwGsServer};

use crate::utils::GsError;

/// Serves the `GtwGs` and `Gs` services on `listener` until `shutdown` is cancelled.
///
/// With an `identity`, connections are TLS.
pub async fn serve(
    listener: TcpListener,
    identity: Option<Identity>,
    service: Arc<GrpcService>,
    shutdown: CancellationToken,
) -> Result<(), GsError> {
    let address = listener.local_addr()?;
    let mut builder = tonic::transport::Server::builder();
    if let Some(identity) = identity {
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(identity))
            .map_err(|e| GsError::Configuration(format!("gRPC TLS: {}", e)))?;
    }
    info!(%address, "gRPC frontend listening");
    builder
        .add_service(GtwGsServer::from_arc(Arc::clone(&service)))
        .add_service(GsServer::from_arc(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
        .map_err(|e| GsError::Connection(e.to_string()))
}
