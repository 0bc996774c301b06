// src/server/mod.rs
pub mod basicstation;
pub mod grpc;
pub mod health;
pub mod industries;
pub mod middleware;
pub mod mqtt;
pub mod stream;
pub mod ws;

// Re-export public components
pub use basicstation::{BasicStationFrontend, BasicStationOptions};
pub use grpc::{GrpcFrontend, GrpcOptions, GrpcService};
pub use health::HealthMetrics;
pub use industries::{IndustriesFrontend, IndustriesOptions};
pub use middleware::rate_limit::{RateLimiter, Resource};
pub use mqtt::{MqttFrontend, MqttOptions};
pub use stream::GatewayStream;
