use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

use config::Config;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use tokio_rustls::{
    rustls::{
        server::AllowAnyAuthenticatedClient, Certificate, PrivateKey, RootCertStore,
        ServerConfig as RustlsServerConfig,
    },
    TlsAcceptor,
};
use tracing::info;

use crate::cluster::{ClusterKeys, PeerConfig};
use crate::gateway::identity::RegisteredGateway;
use crate::gateway::{BaseConfig, ConnectionOptions, GatewayServerOptions};
use crate::server::basicstation::BasicStationOptions;
use crate::server::grpc::{GrpcOptions, MqttInfo};
use crate::server::industries::IndustriesOptions;
use crate::server::middleware::rate_limit::Profile;
use crate::server::mqtt::MqttOptions;
use crate::server::ws::KeepaliveOptions;
use crate::utils::GsError;

/// File name of the rate limiting profiles in `rate_limiting.directory`.
pub const RATE_LIMITING_FILE: &str = "rate-limiting.yml";

fn configuration_error(err: impl std::fmt::Display) -> GsError {
    GsError::Configuration(err.to_string())
}

/// Listen addresses; a frontend without address is disabled.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ListenerConfig {
    pub grpc: Option<SocketAddr>,
    pub grpc_tls: Option<SocketAddr>,
    pub mqtt: Option<SocketAddr>,
    pub mqtts: Option<SocketAddr>,
    pub mqtt_v2: Option<SocketAddr>,
    pub mqtt_v2_tls: Option<SocketAddr>,
    pub basic_station: Option<SocketAddr>,
    pub industries: Option<SocketAddr>,
    /// Metrics, health and connection stats.
    pub http: Option<SocketAddr>,
}

impl ListenerConfig {
    fn any(&self) -> bool {
        [
            self.grpc,
            self.grpc_tls,
            self.mqtt,
            self.mqtts,
            self.mqtt_v2,
            self.mqtt_v2_tls,
            self.basic_station,
            self.industries,
        ]
        .iter()
        .any(Option::is_some)
    }
}

/// PEM server key pair shared by the TLS listeners.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Hex encoded keys of 16, 24 or 32 bytes; the first one identifies this server.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub tls: bool,
}

fn default_cluster_name() -> String {
    "gs".into()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            keys: Vec::new(),
            peers: Vec::new(),
            tls: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Directory holding a `rate-limiting.yml`.
    pub directory: Option<PathBuf>,
    pub url: Option<String>,
    pub blob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<Profile>,
}

impl RateLimitingConfig {
    /// Resolves the profiles from the configured source.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` for remote sources, `Configuration` for unreadable files.
    pub fn load_profiles(&self) -> Result<Vec<Profile>, GsError> {
        if self.url.is_some() || self.blob.is_some() {
            return Err(GsError::FailedPrecondition(
                "rate limiting profiles can only be read from a directory".into(),
            ));
        }
        let mut profiles = self.profiles.clone();
        if let Some(dir) = &self.directory {
            let path = dir.join(RATE_LIMITING_FILE);
            let file: ProfilesFile = Config::builder()
                .add_source(config::File::from(path.as_path()))
                .build()
                .and_then(|c| c.try_deserialize())
                .map_err(|e| GsError::Configuration(format!("{:?}: {}", path, e)))?;
            profiles.extend(file.profiles);
        }
        Ok(profiles)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_missed_pongs")]
    pub missed_pong_threshold: u32,
}

fn default_ping_interval() -> u64 {
    10
}

fn default_missed_pongs() -> u32 {
    2
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            missed_pong_threshold: default_missed_pongs(),
        }
    }
}

impl KeepaliveConfig {
    pub fn options(&self) -> KeepaliveOptions {
        KeepaliveOptions {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            missed_pong_threshold: self.missed_pong_threshold,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BasicStationConfig {
    /// Admits stations that send no `Authorization` header.
    #[serde(default)]
    pub allow_unauthenticated: bool,
    #[serde(default = "default_round_trip")]
    pub max_round_trip_delay_ms: u64,
    /// Terminates TLS on the Basic Station listener.
    #[serde(default)]
    pub tls: bool,
}

fn default_round_trip() -> u64 {
    3000
}

impl Default for BasicStationConfig {
    fn default() -> Self {
        Self {
            allow_unauthenticated: false,
            max_round_trip_delay_ms: default_round_trip(),
            tls: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndustriesConfig {
    /// PEM bundle of the CAs that sign gateway client certificates.
    pub gateway_ca: Option<PathBuf>,
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,
}

fn default_hello_timeout() -> u64 {
    10
}

impl Default for IndustriesConfig {
    fn default() -> Self {
        Self {
            gateway_ca: None,
            hello_timeout_secs: default_hello_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_upstream_buffer")]
    pub upstream_buffer: usize,
    #[serde(default = "default_downstream_buffer")]
    pub downstream_buffer: usize,
    #[serde(default = "default_stats_ttl")]
    pub stats_ttl_secs: u64,
    #[serde(default = "default_location_debounce")]
    pub update_location_debounce_secs: u64,
}

fn default_upstream_buffer() -> usize {
    64
}

fn default_downstream_buffer() -> usize {
    16
}

fn default_stats_ttl() -> u64 {
    60
}

fn default_location_debounce() -> u64 {
    60 * 60
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            upstream_buffer: default_upstream_buffer(),
            downstream_buffer: default_downstream_buffer(),
            stats_ttl_secs: default_stats_ttl(),
            update_location_debounce_secs: default_location_debounce(),
        }
    }
}

/// Public MQTT addresses reported to gateways over gRPC.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MqttPublicConfig {
    pub v3: Option<MqttInfo>,
    pub v2: Option<MqttInfo>,
}

/// Configuration settings for the Gateway Server.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub basic_station: BasicStationConfig,
    #[serde(default)]
    pub industries: IndustriesConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub mqtt_public: MqttPublicConfig,
    /// Proxies whose `X-Forwarded-For` is trusted.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    /// Gateways of the built-in identity registry.
    #[serde(default)]
    pub gateways: Vec<RegisteredGateway>,
    /// Extra frequency plan files on top of the built-in plans.
    pub frequency_plans_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Loads the configuration from the optional file named by `GS_CONFIG` and from
    /// environment variables prefixed with `GS_`, nested with `__`.
    ///
    /// # Errors
    /// Returns a `GsError::Configuration` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, GsError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("GS_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("GS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cluster.keys")
                    .with_list_parse_key("trusted_proxies"),
            )
            .build()
            .map_err(configuration_error)?
            .try_deserialize()
            .map_err(configuration_error)
    }

    /// Loads the configuration from one file.
    pub fn from_file(path: &Path) -> Result<Self, GsError> {
        Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(configuration_error)?
            .try_deserialize()
            .map_err(configuration_error)
    }

    fn tls_listener(&self) -> bool {
        self.listeners.grpc_tls.is_some()
            || self.listeners.mqtts.is_some()
            || self.listeners.mqtt_v2_tls.is_some()
            || self.listeners.industries.is_some()
            || (self.listeners.basic_station.is_some() && self.basic_station.tls)
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// * `FailedPrecondition` when a TLS listener has no key pair, the Industries
    ///   listener has no gateway CA, or profiles come from a remote source.
    /// * `Configuration` for every other inconsistency.
    pub fn validate(&self) -> Result<(), GsError> {
        if !self.listeners.any() {
            return Err(GsError::Configuration("no frontend listener configured".into()));
        }

        if self.tls_listener() {
            for (name, path) in [("certificate", &self.tls.certificate), ("key", &self.tls.key)] {
                match path {
                    None => {
                        return Err(GsError::FailedPrecondition(format!(
                            "TLS listeners need tls.{}",
                            name
                        )))
                    }
                    Some(path) if !path.exists() => {
                        return Err(GsError::Configuration(format!("TLS {} not found: {:?}", name, path)))
                    }
                    Some(_) => {}
                }
            }
        }

        if self.listeners.industries.is_some() {
            match &self.industries.gateway_ca {
                None => {
                    return Err(GsError::FailedPrecondition(
                        "the Industries listener needs industries.gateway_ca".into(),
                    ))
                }
                Some(path) if !path.exists() => {
                    return Err(GsError::Configuration(format!("gateway CA not found: {:?}", path)))
                }
                Some(_) => {}
            }
        }

        ClusterKeys::from_hex(&self.cluster.keys)?;

        if self.keepalive.ping_interval_secs == 0 {
            return Err(GsError::Configuration("keepalive.ping_interval_secs must be greater than 0".into()));
        }
        if self.keepalive.missed_pong_threshold == 0 {
            return Err(GsError::Configuration(
                "keepalive.missed_pong_threshold must be greater than 0".into(),
            ));
        }
        if self.basic_station.max_round_trip_delay_ms == 0 {
            return Err(GsError::Configuration(
                "basic_station.max_round_trip_delay_ms must be greater than 0".into(),
            ));
        }
        if self.connection.upstream_buffer == 0 || self.connection.downstream_buffer == 0 {
            return Err(GsError::Configuration("connection buffers must be greater than 0".into()));
        }

        if self.rate_limiting.url.is_some() || self.rate_limiting.blob.is_some() {
            return Err(GsError::FailedPrecondition(
                "rate limiting profiles can only be read from a directory".into(),
            ));
        }

        Ok(())
    }

    pub fn gateway_server_options(&self) -> GatewayServerOptions {
        GatewayServerOptions {
            connection: ConnectionOptions {
                upstream_buffer: self.connection.upstream_buffer,
                downstream_buffer: self.connection.downstream_buffer,
            },
            stats_ttl: Duration::from_secs(self.connection.stats_ttl_secs),
            update_location_debounce: Duration::from_secs(self.connection.update_location_debounce_secs),
            base: BaseConfig {
                trusted_proxies: self.trusted_proxies.clone(),
            },
        }
    }

    pub fn grpc_options(&self, cluster_keys: ClusterKeys) -> GrpcOptions {
        GrpcOptions {
            mqtt: self.mqtt_public.v3.clone(),
            mqtt_v2: self.mqtt_public.v2.clone(),
            cluster_keys: Some(cluster_keys),
            downlink_buffer: self.connection.downstream_buffer,
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        MqttOptions::default()
    }

    pub fn basic_station_options(&self) -> BasicStationOptions {
        BasicStationOptions {
            allow_unauthenticated: self.basic_station.allow_unauthenticated,
            keepalive: self.keepalive.options(),
            max_round_trip_delay: Duration::from_millis(self.basic_station.max_round_trip_delay_ms),
            tls: self.basic_station.tls,
        }
    }

    pub fn industries_options(&self) -> IndustriesOptions {
        IndustriesOptions {
            keepalive: self.keepalive.options(),
            hello_timeout: Duration::from_secs(self.industries.hello_timeout_secs),
        }
    }

    fn key_pair(&self) -> Result<(Vec<Certificate>, PrivateKey), GsError> {
        let (cert_path, key_path) = match (&self.tls.certificate, &self.tls.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(GsError::FailedPrecondition("no TLS key pair configured".into())),
        };
        let certs = read_certificates(cert_path)?;
        let key_pem = fs::read(key_path)
            .map_err(|e| GsError::Configuration(format!("Key error: {} (path: {:?})", e, key_path)))?;
        let mut keys = pkcs8_private_keys(&mut key_pem.as_slice())
            .map_err(|e| GsError::Configuration(format!("Key parse error: {}", e)))?;
        if keys.is_empty() {
            return Err(GsError::Configuration(format!("no PKCS#8 key in {:?}", key_path)));
        }
        Ok((certs, PrivateKey(keys.remove(0))))
    }

    /// The server TLS configuration without client authentication.
    ///
    /// # Errors
    /// `FailedPrecondition` without key pair, `Configuration` for unreadable PEM.
    pub fn rustls_config(&self) -> Result<Arc<RustlsServerConfig>, GsError> {
        let (certs, key) = self.key_pair()?;
        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GsError::Configuration(format!("TLS config error: {}", e)))?;
        Ok(Arc::new(config))
    }

    /// Creates the TLS acceptor of the MQTT listeners.
    pub fn create_tls_acceptor(&self) -> Result<Arc<TlsAcceptor>, GsError> {
        Ok(Arc::new(TlsAcceptor::from(self.rustls_config()?)))
    }

    /// Creates the Industries acceptor, which requires a client certificate signed by
    /// the gateway CA bundle.
    pub fn create_industries_acceptor(&self) -> Result<Arc<TlsAcceptor>, GsError> {
        let ca_path = self
            .industries
            .gateway_ca
            .as_ref()
            .ok_or_else(|| GsError::FailedPrecondition("no gateway CA configured".into()))?;
        let mut roots = RootCertStore::empty();
        for cert in read_certificates(ca_path)? {
            roots
                .add(&cert)
                .map_err(|e| GsError::Configuration(format!("gateway CA {:?}: {}", ca_path, e)))?;
        }
        info!(ca = ?ca_path, roots = roots.len(), "Loaded gateway CA bundle");
        let (certs, key) = self.key_pair()?;
        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
            .with_single_cert(certs, key)
            .map_err(|e| GsError::Configuration(format!("TLS config error: {}", e)))?;
        Ok(Arc::new(TlsAcceptor::from(Arc::new(config))))
    }

    /// The gRPC server identity.
    pub fn grpc_identity(&self) -> Result<tonic::transport::Identity, GsError> {
        let (cert_path, key_path) = match (&self.tls.certificate, &self.tls.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(GsError::FailedPrecondition("no TLS key pair configured".into())),
        };
        let read = |path: &PathBuf| -> Result<Vec<u8>, GsError> {
            fs::read(path).map_err(|e| GsError::Configuration(format!("{:?}: {}", path, e)))
        };
        Ok(tonic::transport::Identity::from_pem(read(cert_path)?, read(key_path)?))
    }
}

fn read_certificates(path: &Path) -> Result<Vec<Certificate>, GsError> {
    let pem = fs::read(path)
        .map_err(|e| GsError::Configuration(format!("Certificate error: {} (path: {:?})", e, path)))?;
    let certs = certs(&mut pem.as_slice())
        .map_err(|e: io::Error| GsError::Configuration(format!("Cert parse error: {}", e)))?;
    if certs.is_empty() {
        return Err(GsError::Configuration(format!("no certificate in {:?}", path)));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorCode;
    use std::io::Write;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gs.yml",
            r#"
listeners:
  grpc: "127.0.0.1:1884"
  mqtt: "127.0.0.1:1882"
cluster:
  keys: ["000102030405060708090a0b0c0d0e0f"]
gateways:
  - gateway_id: gtw-1
    eui: "0102030405060708"
    frequency_plan_id: EU_863_870_TTN
    api_key: secret
"#,
        );
        let config = ServerConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateways.len(), 1);
        assert_eq!(config.keepalive.ping_interval_secs, 10);
        assert!(!config.basic_station.allow_unauthenticated);
        assert_eq!(config.basic_station_options().max_round_trip_delay, Duration::from_secs(3));
    }

    #[test]
    fn tls_listeners_need_key_pair() {
        let config = ServerConfig {
            listeners: ListenerConfig {
                mqtts: Some("127.0.0.1:8883".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::FailedPrecondition);
        assert_eq!(
            config.create_tls_acceptor().err().unwrap().code(),
            ErrorCode::FailedPrecondition
        );
    }

    #[test]
    fn rejects_inconsistent_settings() {
        assert!(ServerConfig::default().validate().is_err());

        let mut config = ServerConfig {
            listeners: ListenerConfig {
                grpc: Some("127.0.0.1:1884".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();

        config.cluster.keys = vec!["abcd".into()];
        assert!(config.validate().is_err());
        config.cluster.keys.clear();

        config.keepalive.missed_pong_threshold = 0;
        assert!(config.validate().is_err());
        config.keepalive.missed_pong_threshold = 2;

        config.rate_limiting.url = Some("https://example.com/rate-limiting.yml".into());
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::FailedPrecondition);
    }

    #[test]
    fn profiles_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            RATE_LIMITING_FILE,
            r#"
profiles:
  - name: accept
    max_per_min: 10
    associations: ["gs:accept:mqtt"]
"#,
        );
        let rate_limiting = RateLimitingConfig {
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let profiles = rate_limiting.load_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].burst(), 10);

        let missing = RateLimitingConfig {
            directory: Some(dir.path().join("missing")),
            ..Default::default()
        };
        assert!(missing.load_profiles().is_err());
    }
}
