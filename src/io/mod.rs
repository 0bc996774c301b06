//! Protocol-independent plumbing shared by the frontends.
pub mod dedup;
pub mod tokens;
pub mod uplink_token;

pub use dedup::unique_by_rssi;
pub use tokens::{format_correlation_id, parse_token_from_correlation_ids, DownlinkTokens};
