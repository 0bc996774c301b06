use std::sync::Arc;

use async_trait::async_trait;
use tonic::codegen::http;
use tonic::{Code, Request, Status};
use tracing::warn;

use super::{CodecType, EndDeviceVersionIdentifiers, GetPayloadFormatterRequest, MessagePayloadFormatter};
use crate::cluster::{Cluster, Role};
use crate::utils::GsError;

pub const GET_UPLINK_DECODER: &str = "/ttn.lorawan.v3.DeviceRepository/GetUplinkDecoder";
pub const GET_DOWNLINK_DECODER: &str = "/ttn.lorawan.v3.DeviceRepository/GetDownlinkDecoder";
pub const GET_DOWNLINK_ENCODER: &str = "/ttn.lorawan.v3.DeviceRepository/GetDownlinkEncoder";

/// Looks up the payload formatters of end device models.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get_formatter(
        &self,
        ids: &EndDeviceVersionIdentifiers,
        codec_type: CodecType,
    ) -> Result<MessagePayloadFormatter, GsError>;
}

fn path(codec_type: CodecType) -> &'static str {
    match codec_type {
        CodecType::UplinkDecoder => GET_UPLINK_DECODER,
        CodecType::DownlinkDecoder => GET_DOWNLINK_DECODER,
        CodecType::DownlinkEncoder => GET_DOWNLINK_ENCODER,
    }
}

pub(crate) fn status_to_error(status: Status) -> GsError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unauthenticated => GsError::Unauthenticated(message),
        Code::PermissionDenied => GsError::PermissionDenied(message),
        Code::InvalidArgument => GsError::InvalidArgument(message),
        Code::NotFound => GsError::NotFound(message),
        Code::FailedPrecondition => GsError::FailedPrecondition(message),
        Code::Unimplemented => GsError::Unimplemented(message),
        Code::Aborted => GsError::aborted(message, Vec::new()),
        Code::DataLoss => GsError::Corruption(message),
        Code::Cancelled => GsError::Canceled,
        Code::Unavailable | Code::DeadlineExceeded => GsError::Unavailable(message),
        _ => GsError::Internal(message),
    }
}

/// Calls the Device Repository peer of the cluster.
pub struct ClusterClient {
    cluster: Arc<Cluster>,
}

impl ClusterClient {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Client for ClusterClient {
    async fn get_formatter(
        &self,
        ids: &EndDeviceVersionIdentifiers,
        codec_type: CodecType,
    ) -> Result<MessagePayloadFormatter, GsError> {
        let peer = self.cluster.get_peer(Role::DeviceRepository)?;
        let channel = peer
            .conn()
            .ok_or_else(|| GsError::Unavailable(format!("peer {} has no connection", peer.name)))?;

        let mut request = Request::new(GetPayloadFormatterRequest {
            version_ids: Some(ids.clone()),
        });
        self.cluster.keys().authorize(request.metadata_mut())?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(|e| {
            peer.set_healthy(false);
            GsError::Unavailable(format!("device repository not ready: {}", e))
        })?;
        let result = grpc
            .unary::<_, MessagePayloadFormatter, _>(
                request,
                http::uri::PathAndQuery::from_static(path(codec_type)),
                tonic::codec::ProstCodec::default(),
            )
            .await;
        match result {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                if status.code() == Code::Unavailable {
                    warn!(peer = %peer.name, error = %status.message(), "Device repository unavailable");
                    peer.set_healthy(false);
                }
                Err(status_to_error(status))
            }
        }
    }
}
