//! Shared-secret authentication between trusted components.

use rand::RngCore;
use subtle::{Choice, ConstantTimeEq};
use tonic::metadata::MetadataMap;
use tracing::warn;

use crate::utils::GsError;

/// Authorization scheme of inter-component calls.
pub const SCHEME: &str = "ClusterKey";

/// The outcome of cluster authentication, handed explicitly to handlers that care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedContext {
    cluster: bool,
}

impl VerifiedContext {
    /// A caller that presented a valid cluster key.
    pub fn cluster() -> Self {
        Self { cluster: true }
    }

    /// A caller that did not present cluster credentials.
    pub fn anonymous() -> Self {
        Self { cluster: false }
    }

    pub fn is_cluster_authenticated(&self) -> bool {
        self.cluster
    }
}

/// The shared keys of the cluster; read-only after startup.
#[derive(Clone)]
pub struct ClusterKeys {
    keys: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ClusterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKeys")
            .field("count", &self.keys.len())
            .finish()
    }
}

impl ClusterKeys {
    /// Decodes hex keys of 16, 24 or 32 bytes.
    ///
    /// Without configured keys a random 32-byte key is generated; such a server can
    /// only authenticate itself.
    ///
    /// # Errors
    ///
    /// Returns `GsError::Configuration` for keys that are not hex or have another length.
    pub fn from_hex<S: AsRef<str>>(hex_keys: &[S]) -> Result<Self, GsError> {
        let mut keys = Vec::with_capacity(hex_keys.len());
        for (i, key) in hex_keys.iter().enumerate() {
            let key = hex::decode(key.as_ref().trim()).map_err(|e| {
                GsError::Configuration(format!("cluster key {} is not hex: {}", i, e))
            })?;
            if !matches!(key.len(), 16 | 24 | 32) {
                return Err(GsError::Configuration(format!(
                    "cluster key {} has {} bytes, expected 16, 24 or 32",
                    i,
                    key.len()
                )));
            }
            keys.push(key);
        }
        if keys.is_empty() {
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            warn!("No cluster keys configured, generated a random key");
            keys.push(key);
        }
        Ok(Self { keys })
    }

    /// The authorization value this component presents: `ClusterKey <hex>`.
    pub fn auth_value(&self) -> String {
        format!("{} {}", SCHEME, hex::encode(&self.keys[0]))
    }

    /// Adds the cluster authorization to outgoing call metadata.
    pub fn authorize(&self, metadata: &mut MetadataMap) -> Result<(), GsError> {
        let value = self
            .auth_value()
            .parse()
            .map_err(|_| GsError::Internal("cluster key is not valid metadata".into()))?;
        metadata.insert("authorization", value);
        Ok(())
    }

    /// Compares `candidate` against every key without short-circuiting.
    pub fn verify_key(&self, candidate: &[u8]) -> bool {
        let matched = self
            .keys
            .iter()
            .fold(Choice::from(0), |acc, key| acc | key.as_slice().ct_eq(candidate));
        matched.into()
    }

    /// Verifies an `authorization` value that must carry a cluster key.
    ///
    /// # Errors
    ///
    /// * `Unauthenticated` when the value is missing.
    /// * `InvalidArgument` when it uses another scheme or is not hex.
    /// * `PermissionDenied` when no key matches.
    pub fn verify(&self, authorization: Option<&str>) -> Result<VerifiedContext, GsError> {
        let value = authorization
            .ok_or_else(|| GsError::Unauthenticated("missing cluster authorization".into()))?;
        let (scheme, token) = value
            .split_once(' ')
            .ok_or_else(|| GsError::InvalidArgument("malformed authorization".into()))?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(GsError::InvalidArgument(format!(
                "unsupported authorization scheme `{}`",
                scheme
            )));
        }
        let candidate = hex::decode(token.trim())
            .map_err(|_| GsError::InvalidArgument("cluster key is not hex".into()))?;
        if self.verify_key(&candidate) {
            Ok(VerifiedContext::cluster())
        } else {
            Err(GsError::PermissionDenied("invalid cluster key".into()))
        }
    }

    /// Verifies incoming call metadata that must carry a cluster key.
    pub fn verify_metadata(&self, metadata: &MetadataMap) -> Result<VerifiedContext, GsError> {
        let value = metadata
            .get("authorization")
            .map(|v| v.to_str())
            .transpose()
            .map_err(|_| GsError::InvalidArgument("authorization is not ASCII".into()))?;
        self.verify(value)
    }

    /// Inspects metadata that may or may not come from a cluster peer.
    ///
    /// Only values using the cluster scheme are verified; anything else yields an
    /// anonymous context and is left to the regular authentication path.
    pub fn inspect(&self, metadata: &MetadataMap) -> Result<VerifiedContext, GsError> {
        let cluster_scheme = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_once(' '))
            .map(|(scheme, _)| scheme.eq_ignore_ascii_case(SCHEME))
            .unwrap_or(false);
        if cluster_scheme {
            self.verify_metadata(metadata)
        } else {
            Ok(VerifiedContext::anonymous())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "00112233445566778899aabbccddeeff";
    const KEY_B: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa9988";

    #[test]
    fn validates_key_lengths() {
        assert!(ClusterKeys::from_hex(&[KEY_A, KEY_B]).is_ok());
        assert!(ClusterKeys::from_hex(&["0011"]).is_err());
        assert!(ClusterKeys::from_hex(&["zz112233445566778899aabbccddeeff"]).is_err());
        let generated = ClusterKeys::from_hex::<&str>(&[]).unwrap();
        assert_eq!(generated.keys[0].len(), 32);
    }

    #[test]
    fn first_key_identifies_all_keys_verify() {
        let keys = ClusterKeys::from_hex(&[KEY_A, KEY_B]).unwrap();
        assert_eq!(keys.auth_value(), format!("ClusterKey {}", KEY_A));
        assert!(keys.verify(Some(format!("ClusterKey {}", KEY_A).as_str())).is_ok());
        assert!(keys.verify(Some(format!("ClusterKey {}", KEY_B).as_str())).is_ok());
    }

    #[test]
    fn verification_failures_map_to_codes() {
        let keys = ClusterKeys::from_hex(&[KEY_A]).unwrap();
        assert!(matches!(keys.verify(None), Err(GsError::Unauthenticated(_))));
        assert!(matches!(
            keys.verify(Some("Bearer abc")),
            Err(GsError::InvalidArgument(_))
        ));
        assert!(matches!(
            keys.verify(Some(format!("ClusterKey {}", KEY_B).as_str())),
            Err(GsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn inspect_ignores_other_schemes() {
        let keys = ClusterKeys::from_hex(&[KEY_A]).unwrap();
        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "Bearer key".parse().unwrap());
        assert!(!keys.inspect(&metadata).unwrap().is_cluster_authenticated());

        let mut metadata = MetadataMap::new();
        keys.authorize(&mut metadata).unwrap();
        assert!(keys.inspect(&metadata).unwrap().is_cluster_authenticated());

        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", "ClusterKey 0011".parse().unwrap());
        assert!(keys.inspect(&metadata).is_err());
    }
}
