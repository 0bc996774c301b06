//! Server and client bindings of the `ttn.lorawan.v3.GtwGs` and `ttn.lorawan.v3.Gs`
//! services, in the shape `tonic-build` generates them.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tonic::codegen::{empty_body, http, Body, BoxFuture, Bytes, StdError};
use tonic::{Request, Response, Status, Streaming};

use crate::model::{
    ConcentratorConfig, Empty, GatewayConnectionStats, GatewayDown, GatewayIdentifiers, GatewayUp,
    MqttConnectionInfo,
};

pub const LINK_GATEWAY: &str = "/ttn.lorawan.v3.GtwGs/LinkGateway";
pub const GET_CONCENTRATOR_CONFIG: &str = "/ttn.lorawan.v3.GtwGs/GetConcentratorConfig";
pub const GET_MQTT_CONNECTION_INFO: &str = "/ttn.lorawan.v3.GtwGs/GetMQTTConnectionInfo";
pub const GET_MQTT_V2_CONNECTION_INFO: &str = "/ttn.lorawan.v3.GtwGs/GetMQTTV2ConnectionInfo";
pub const GET_GATEWAY_CONNECTION_STATS: &str = "/ttn.lorawan.v3.Gs/GetGatewayConnectionStats";

/// The gateway-facing service.
#[tonic::async_trait]
pub trait GtwGs: Send + Sync + 'static {
    type LinkGatewayStream: Stream<Item = Result<GatewayDown, Status>> + Send + 'static;

    async fn link_gateway(
        &self,
        request: Request<Streaming<GatewayUp>>,
    ) -> Result<Response<Self::LinkGatewayStream>, Status>;

    async fn get_concentrator_config(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<ConcentratorConfig>, Status>;

    async fn get_mqtt_connection_info(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status>;

    async fn get_mqtt_v2_connection_info(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status>;
}

/// The cluster-facing service.
#[tonic::async_trait]
pub trait Gs: Send + Sync + 'static {
    async fn get_gateway_connection_stats(
        &self,
        request: Request<GatewayIdentifiers>,
    ) -> Result<Response<GatewayConnectionStats>, Status>;
}

fn unimplemented_route() -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert("grpc-status", http::HeaderValue::from_static("12"));
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

macro_rules! unary_route {
    ($inner:expr, $req:expr, $trait:ident, $method:ident, $in:ty, $out:ty) => {{
        struct Svc<T: $trait>(Arc<T>);
        impl<T: $trait> tonic::server::UnaryService<$in> for Svc<T> {
            type Response = $out;
            type Future = BoxFuture<Response<Self::Response>, Status>;

            fn call(&mut self, request: Request<$in>) -> Self::Future {
                let inner = Arc::clone(&self.0);
                Box::pin(async move { inner.$method(request).await })
            }
        }
        let inner = $inner;
        let req = $req;
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
            Ok(grpc.unary(Svc(inner), req).await)
        })
    }};
}

#[derive(Debug)]
pub struct GtwGsServer<T: GtwGs> {
    inner: Arc<T>,
}

impl<T: GtwGs> GtwGsServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T: GtwGs> Clone for GtwGsServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for GtwGsServer<T>
where
    T: GtwGs,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        match req.uri().path() {
            LINK_GATEWAY => {
                struct LinkGatewaySvc<T: GtwGs>(Arc<T>);
                impl<T: GtwGs> tonic::server::StreamingService<GatewayUp> for LinkGatewaySvc<T> {
                    type Response = GatewayDown;
                    type ResponseStream = T::LinkGatewayStream;
                    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

                    fn call(&mut self, request: Request<Streaming<GatewayUp>>) -> Self::Future {
                        let inner = Arc::clone(&self.0);
                        Box::pin(async move { inner.link_gateway(request).await })
                    }
                }
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                    Ok(grpc.streaming(LinkGatewaySvc(inner), req).await)
                })
            }
            GET_CONCENTRATOR_CONFIG => unary_route!(
                inner,
                req,
                GtwGs,
                get_concentrator_config,
                Empty,
                ConcentratorConfig
            ),
            GET_MQTT_CONNECTION_INFO => unary_route!(
                inner,
                req,
                GtwGs,
                get_mqtt_connection_info,
                GatewayIdentifiers,
                MqttConnectionInfo
            ),
            GET_MQTT_V2_CONNECTION_INFO => unary_route!(
                inner,
                req,
                GtwGs,
                get_mqtt_v2_connection_info,
                GatewayIdentifiers,
                MqttConnectionInfo
            ),
            _ => Box::pin(async move { Ok(unimplemented_route()) }),
        }
    }
}

impl<T: GtwGs> tonic::server::NamedService for GtwGsServer<T> {
    const NAME: &'static str = "ttn.lorawan.v3.GtwGs";
}

#[derive(Debug)]
pub struct GsServer<T: Gs> {
    inner: Arc<T>,
}

impl<T: Gs> GsServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T: Gs> Clone for GsServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for GsServer<T>
where
    T: Gs,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        match req.uri().path() {
            GET_GATEWAY_CONNECTION_STATS => unary_route!(
                inner,
                req,
                Gs,
                get_gateway_connection_stats,
                GatewayIdentifiers,
                GatewayConnectionStats
            ),
            _ => Box::pin(async move { Ok(unimplemented_route()) }),
        }
    }
}

impl<T: Gs> tonic::server::NamedService for GsServer<T> {
    const NAME: &'static str = "ttn.lorawan.v3.Gs";
}

/// Client of the gateway-facing service, used by gateways and tests.
#[derive(Debug, Clone)]
pub struct GtwGsClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl GtwGsClient<tonic::transport::Channel> {
    pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
    where
        D: TryInto<tonic::transport::Endpoint>,
        D::Error: Into<StdError>,
    {
        let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
        Ok(Self::new(conn))
    }
}

impl<T> GtwGsClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {}", e.into())))
    }

    pub async fn link_gateway(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = GatewayUp>,
    ) -> Result<Response<Streaming<GatewayDown>>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static(LINK_GATEWAY);
        self.inner
            .streaming(
                request.into_streaming_request(),
                path,
                tonic::codec::ProstCodec::default(),
            )
            .await
    }

    pub async fn get_concentrator_config(
        &mut self,
        request: impl tonic::IntoRequest<Empty>,
    ) -> Result<Response<ConcentratorConfig>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static(GET_CONCENTRATOR_CONFIG);
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn get_mqtt_connection_info(
        &mut self,
        request: impl tonic::IntoRequest<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static(GET_MQTT_CONNECTION_INFO);
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }

    pub async fn get_mqtt_v2_connection_info(
        &mut self,
        request: impl tonic::IntoRequest<GatewayIdentifiers>,
    ) -> Result<Response<MqttConnectionInfo>, Status> {
        self.ready().await?;
        let path = http::uri::PathAndQuery::from_static(GET_MQTT_V2_CONNECTION_INFO);
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }
}

/// Client of the cluster-facing service.
#[derive(Debug, Clone)]
pub struct GsClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> GsClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    pub async fn get_gateway_connection_stats(
        &mut self,
        request: impl tonic::IntoRequest<GatewayIdentifiers>,
    ) -> Result<Response<GatewayConnectionStats>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {}", e.into())))?;
        let path = http::uri::PathAndQuery::from_static(GET_GATEWAY_CONNECTION_STATS);
        self.inner
            .unary(request.into_request(), path, tonic::codec::ProstCodec::default())
            .await
    }
}
