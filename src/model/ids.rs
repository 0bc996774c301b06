use std::fmt;

use crate::utils::{Eui64, GsError};

/// Identifies a gateway by its registry ID and, where known, its EUI.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct GatewayIdentifiers {
    #[prost(string, tag = "1")]
    pub gateway_id: String,
    /// Either empty or exactly 8 bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub eui: Vec<u8>,
}

/// Identifies one antenna of a gateway.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayAntennaIdentifiers {
    #[prost(message, optional, tag = "1")]
    pub gateway_ids: Option<GatewayIdentifiers>,
    #[prost(uint32, tag = "2")]
    pub antenna_index: u32,
}

impl GatewayIdentifiers {
    pub fn from_id(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            eui: Vec::new(),
        }
    }

    pub fn from_eui(eui: Eui64) -> Self {
        Self {
            gateway_id: String::new(),
            eui: eui.0.to_vec(),
        }
    }

    /// The EUI, if one is set and well formed.
    pub fn eui64(&self) -> Option<Eui64> {
        if self.eui.is_empty() {
            return None;
        }
        Eui64::from_slice(&self.eui).ok()
    }

    /// The unique ID used as registry and topic key.
    pub fn uid(&self) -> &str {
        &self.gateway_id
    }

    /// Checks the identifiers the way the registry would on lookup.
    ///
    /// Gateway IDs are 2-36 characters of lowercase alphanumerics and dashes, not
    /// starting or ending with a dash.
    pub fn validate(&self) -> Result<(), GsError> {
        if !self.eui.is_empty() && self.eui.len() != 8 {
            return Err(GsError::InvalidArgument(format!(
                "gateway EUI must be 8 bytes, got {}",
                self.eui.len()
            )));
        }
        if self.gateway_id.is_empty() {
            if self.eui.is_empty() {
                return Err(GsError::InvalidArgument("gateway identifiers are empty".into()));
            }
            return Ok(());
        }
        let id = &self.gateway_id;
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if id.len() < 2 || id.len() > 36 || !valid_chars || id.starts_with('-') || id.ends_with('-')
        {
            return Err(GsError::InvalidArgument(format!("invalid gateway ID `{}`", id)));
        }
        Ok(())
    }
}

impl fmt::Display for GatewayIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.gateway_id.is_empty(), self.eui64()) {
            (false, _) => f.write_str(&self.gateway_id),
            (true, Some(eui)) => write!(f, "eui:{}", eui),
            (true, None) => f.write_str("<unknown>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_gateway_ids() {
        assert!(GatewayIdentifiers::from_id("test-gateway").validate().is_ok());
        assert!(GatewayIdentifiers::from_id("eui-0102030405060708").validate().is_ok());
        assert!(GatewayIdentifiers::from_id("Test").validate().is_err());
        assert!(GatewayIdentifiers::from_id("-gw").validate().is_err());
        assert!(GatewayIdentifiers::from_id("g").validate().is_err());
        assert!(GatewayIdentifiers::default().validate().is_err());
        assert!(GatewayIdentifiers::from_eui(Eui64([1; 8])).validate().is_ok());

        let bad_eui = GatewayIdentifiers {
            gateway_id: "gw".into(),
            eui: vec![1, 2, 3],
        };
        assert!(bad_eui.validate().is_err());
    }
}
