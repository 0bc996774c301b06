use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::utils::GsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Right {
    GatewayLink,
    GatewayInfo,
    GatewayStatusRead,
    GatewayLocationRead,
    GatewayAll,
}

/// The rights an API key grants on a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rights(HashSet<Right>);

impl Rights {
    pub fn new(rights: impl IntoIterator<Item = Right>) -> Self {
        Rights(rights.into_iter().collect())
    }

    pub fn includes(&self, right: Right) -> bool {
        self.0.contains(&right) || self.0.contains(&Right::GatewayAll)
    }

    /// # Errors
    ///
    /// Returns `GsError::PermissionDenied` naming the missing right.
    pub fn require(&self, right: Right) -> Result<(), GsError> {
        if self.includes(right) {
            Ok(())
        } else {
            Err(GsError::PermissionDenied(format!("missing right {:?}", right)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_implies_every_right() {
        let rights = Rights::new([Right::GatewayAll]);
        assert!(rights.require(Right::GatewayLink).is_ok());
        assert!(rights.require(Right::GatewayInfo).is_ok());

        let link_only = Rights::new([Right::GatewayLink]);
        assert!(link_only.require(Right::GatewayInfo).is_err());
    }

    #[test]
    fn deserializes_wire_names() {
        let right: Right = serde_json::from_str("\"GATEWAY_LINK\"").unwrap();
        assert_eq!(right, Right::GatewayLink);
    }
}
