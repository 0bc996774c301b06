//! The slice of the identity registry the Gateway Server depends on.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::gateway::AntennaLocation;
use crate::model::{Gateway, GatewayIdentifiers, Right, Rights};
use crate::utils::{Eui64, GsError};

/// Resolves gateways, evaluates API keys and stores location updates.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Looks up a gateway by ID, or by EUI when the ID is empty.
    async fn get_gateway(&self, ids: &GatewayIdentifiers) -> Result<Gateway, GsError>;

    /// Evaluates the rights an `Authorization` header value grants on a gateway.
    ///
    /// # Errors
    ///
    /// * `Unauthenticated` when no credentials are given.
    /// * `InvalidArgument` for a scheme other than `Bearer`.
    /// * `PermissionDenied` when the key is not valid for the gateway.
    async fn authorize(
        &self,
        ids: &GatewayIdentifiers,
        authorization: Option<&str>,
    ) -> Result<Rights, GsError>;

    async fn update_antenna_locations(
        &self,
        ids: &GatewayIdentifiers,
        locations: Vec<AntennaLocation>,
    ) -> Result<(), GsError>;

    /// Subscribes to gateway record updates.
    fn subscribe_updates(&self) -> broadcast::Receiver<Gateway>;
}

/// Splits a `Bearer <key>` header value.
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, GsError> {
    let value = authorization
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GsError::Unauthenticated("missing credentials".into()))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| GsError::InvalidArgument("malformed authorization value".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GsError::InvalidArgument(format!(
            "unsupported authorization scheme `{}`",
            scheme
        )));
    }
    Ok(token.trim())
}

/// A gateway entry as configured for the in-process registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredGateway {
    #[serde(flatten)]
    pub gateway: Gateway,
    pub api_key: String,
    #[serde(default = "default_key_rights")]
    pub rights: Vec<Right>,
}

fn default_key_rights() -> Vec<Right> {
    vec![Right::GatewayAll]
}

struct Entry {
    gateway: Gateway,
    api_keys: Vec<(String, Rights)>,
}

/// An in-process registry backed by configuration.
pub struct StaticRegistry {
    gateways: DashMap<String, Entry>,
    euis: DashMap<Eui64, String>,
    updates: broadcast::Sender<Gateway>,
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            gateways: DashMap::new(),
            euis: DashMap::new(),
            updates,
        }
    }

    pub fn from_config(entries: &[RegisteredGateway]) -> Result<Self, GsError> {
        let registry = Self::new();
        for entry in entries {
            registry.add_gateway(
                entry.gateway.clone(),
                &entry.api_key,
                Rights::new(entry.rights.iter().copied()),
            )?;
        }
        Ok(registry)
    }

    /// Registers a gateway with one API key.
    ///
    /// Adding a gateway that already exists only adds the key.
    pub fn add_gateway(&self, gateway: Gateway, api_key: &str, rights: Rights) -> Result<(), GsError> {
        gateway.validate()?;
        if let Some(eui) = gateway.eui {
            self.euis.insert(eui, gateway.gateway_id.clone());
        }
        self.gateways
            .entry(gateway.gateway_id.clone())
            .or_insert_with(|| Entry {
                gateway,
                api_keys: Vec::new(),
            })
            .api_keys
            .push((api_key.to_string(), rights));
        Ok(())
    }

    /// Replaces a gateway record and notifies subscribers.
    pub fn update_gateway(&self, gateway: Gateway) -> Result<(), GsError> {
        gateway.validate()?;
        let mut entry = self
            .gateways
            .get_mut(&gateway.gateway_id)
            .ok_or_else(|| GsError::NotFound(format!("gateway `{}`", gateway.gateway_id)))?;
        if let Some(eui) = gateway.eui {
            self.euis.insert(eui, gateway.gateway_id.clone());
        }
        entry.gateway = gateway.clone();
        drop(entry);
        let _ = self.updates.send(gateway);
        Ok(())
    }

    fn resolve_id(&self, ids: &GatewayIdentifiers) -> Result<String, GsError> {
        if !ids.gateway_id.is_empty() {
            return Ok(ids.gateway_id.clone());
        }
        let eui = ids
            .eui64()
            .ok_or_else(|| GsError::InvalidArgument("gateway identifiers are empty".into()))?;
        self.euis
            .get(&eui)
            .map(|id| id.clone())
            .ok_or_else(|| GsError::NotFound(format!("gateway with EUI {}", eui)))
    }
}

#[async_trait]
impl IdentityRegistry for StaticRegistry {
    async fn get_gateway(&self, ids: &GatewayIdentifiers) -> Result<Gateway, GsError> {
        let id = self.resolve_id(ids)?;
        self.gateways
            .get(&id)
            .map(|entry| entry.gateway.clone())
            .ok_or_else(|| GsError::NotFound(format!("gateway `{}`", id)))
    }

    async fn authorize(
        &self,
        ids: &GatewayIdentifiers,
        authorization: Option<&str>,
    ) -> Result<Rights, GsError> {
        let key = bearer_token(authorization)?;
        let id = self.resolve_id(ids)?;
        let entry = self
            .gateways
            .get(&id)
            .ok_or_else(|| GsError::PermissionDenied(format!("no rights on gateway `{}`", id)))?;
        // Every configured key is compared so that timing does not reveal which matched.
        let mut granted = None;
        for (candidate, rights) in &entry.api_keys {
            if bool::from(candidate.as_bytes().ct_eq(key.as_bytes())) {
                granted = Some(rights.clone());
            }
        }
        granted.ok_or_else(|| GsError::PermissionDenied(format!("invalid API key for `{}`", id)))
    }

    async fn update_antenna_locations(
        &self,
        ids: &GatewayIdentifiers,
        locations: Vec<AntennaLocation>,
    ) -> Result<(), GsError> {
        let id = self.resolve_id(ids)?;
        let mut gateway = self.get_gateway(&GatewayIdentifiers::from_id(id)).await?;
        for (antenna, location) in gateway.antennas.iter_mut().zip(locations) {
            antenna.location = Some(location);
        }
        debug!(gateway_uid = %gateway.gateway_id, "Updated antenna locations");
        self.update_gateway(gateway)
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<Gateway> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::gateway::GatewayAntenna;
    use crate::utils::ErrorCode;

    fn registry() -> StaticRegistry {
        let registry = StaticRegistry::new();
        let gateway = Gateway {
            gateway_id: "test-gateway".into(),
            eui: Some(Eui64::from_u64(0x0102030405060708)),
            frequency_plan_id: "EU_863_870_TTN".into(),
            antennas: vec![GatewayAntenna::default()],
            ..Default::default()
        };
        registry
            .add_gateway(gateway, "test-key", Rights::new([Right::GatewayLink]))
            .unwrap();
        registry
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(Some("bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(None).unwrap_err().code(), ErrorCode::Unauthenticated);
        assert_eq!(
            bearer_token(Some("Basic abc")).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn authorizes_configured_pairs_only() {
        let registry = registry();
        let ids = GatewayIdentifiers::from_id("test-gateway");
        let rights = registry.authorize(&ids, Some("Bearer test-key")).await.unwrap();
        assert!(rights.includes(Right::GatewayLink));

        let err = registry.authorize(&ids, Some("Bearer wrong-key")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let other = GatewayIdentifiers::from_id("other-gateway");
        let err = registry.authorize(&other, Some("Bearer test-key")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn resolves_by_eui() {
        let registry = registry();
        let ids = GatewayIdentifiers::from_eui(Eui64::from_u64(0x0102030405060708));
        let gateway = registry.get_gateway(&ids).await.unwrap();
        assert_eq!(gateway.gateway_id, "test-gateway");

        let unknown = GatewayIdentifiers::from_eui(Eui64::from_u64(1));
        assert_eq!(
            registry.get_gateway(&unknown).await.unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn location_updates_are_published() {
        let registry = registry();
        let mut updates = registry.subscribe_updates();
        let location = AntennaLocation {
            latitude: 52.0,
            longitude: 4.0,
            ..Default::default()
        };
        registry
            .update_antenna_locations(&GatewayIdentifiers::from_id("test-gateway"), vec![location.clone()])
            .await
            .unwrap();
        let updated = updates.recv().await.unwrap();
        assert_eq!(updated.antennas[0].location, Some(location));
    }
}
