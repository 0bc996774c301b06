use serde::{Deserialize, Serialize};

use super::ids::GatewayIdentifiers;
use super::messages::{Location, LocationSource};
use crate::utils::{Eui64, GsError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AntennaLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: i32,
    #[serde(default)]
    pub accuracy: i32,
}

impl AntennaLocation {
    pub fn to_proto(&self, source: LocationSource) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            accuracy: self.accuracy,
            source: source as i32,
        }
    }

    pub fn from_proto(location: &Location) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            altitude: location.altitude,
            accuracy: location.accuracy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayAntenna {
    /// Antenna gain in dBi.
    #[serde(default)]
    pub gain: f32,
    #[serde(default)]
    pub location: Option<AntennaLocation>,
}

/// A gateway record as held by the identity registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub gateway_id: String,
    #[serde(default)]
    pub eui: Option<Eui64>,
    pub frequency_plan_id: String,
    /// All plans the gateway operates; the first entry equals `frequency_plan_id`.
    #[serde(default)]
    pub frequency_plan_ids: Vec<String>,
    #[serde(default)]
    pub antennas: Vec<GatewayAntenna>,
    #[serde(default)]
    pub gs_address: String,
    #[serde(default)]
    pub location_public: bool,
    #[serde(default)]
    pub update_location_from_status: bool,
}

impl Gateway {
    pub fn ids(&self) -> GatewayIdentifiers {
        GatewayIdentifiers {
            gateway_id: self.gateway_id.clone(),
            eui: self.eui.map(|eui| eui.0.to_vec()).unwrap_or_default(),
        }
    }

    /// The plan IDs in priority order, primary first and without duplicates.
    pub fn plan_ids(&self) -> Vec<String> {
        let mut ids = vec![self.frequency_plan_id.clone()];
        for id in &self.frequency_plan_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub fn antenna_gain(&self, index: u32) -> f32 {
        self.antennas
            .get(index as usize)
            .map(|a| a.gain)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), GsError> {
        self.ids().validate()?;
        if self.gateway_id.is_empty() {
            return Err(GsError::InvalidArgument("gateway record without ID".into()));
        }
        if self.frequency_plan_id.is_empty() {
            return Err(GsError::InvalidArgument(format!(
                "gateway `{}` has no frequency plan",
                self.gateway_id
            )));
        }
        Ok(())
    }

    /// Whether a registry update changes something a live connection depends on.
    pub fn connection_relevant_change(&self, updated: &Gateway) -> bool {
        let gains = |g: &Gateway| g.antennas.iter().map(|a| a.gain).collect::<Vec<_>>();
        gains(self) != gains(updated)
            || self.location_public != updated.location_public
            || self.plan_ids() != updated.plan_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Gateway {
        Gateway {
            gateway_id: "test-gateway".into(),
            eui: Some(Eui64([1, 2, 3, 4, 5, 6, 7, 8])),
            frequency_plan_id: "EU_863_870_TTN".into(),
            frequency_plan_ids: vec!["EU_863_870_TTN".into(), "US_902_928_FSB_2".into()],
            antennas: vec![GatewayAntenna {
                gain: 3.0,
                location: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn plan_ids_are_deduplicated() {
        assert_eq!(gateway().plan_ids(), vec!["EU_863_870_TTN", "US_902_928_FSB_2"]);
        assert_eq!(gateway().antenna_gain(0), 3.0);
        assert_eq!(gateway().antenna_gain(4), 0.0);
        assert!(gateway().validate().is_ok());
    }

    #[test]
    fn detects_relevant_changes() {
        let old = gateway();
        let mut renamed = old.clone();
        renamed.gs_address = "elsewhere".into();
        assert!(!old.connection_relevant_change(&renamed));

        let mut gain = old.clone();
        gain.antennas[0].gain = 6.0;
        assert!(old.connection_relevant_change(&gain));

        let mut public = old.clone();
        public.location_public = true;
        assert!(old.connection_relevant_change(&public));
    }
}
