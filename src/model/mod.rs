//! The data model shared by every frontend.
pub mod band;
pub mod frequency_plan;
pub mod gateway;
pub mod ids;
pub mod messages;
pub mod rights;

pub use band::Band;
pub use frequency_plan::{FrequencyPlan, FrequencyPlanStore};
pub use gateway::Gateway;
pub use ids::{GatewayAntennaIdentifiers, GatewayIdentifiers};
pub use messages::*;
pub use rights::{Right, Rights};
