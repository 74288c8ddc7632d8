//! Field-management system (FMS) integration
//!
//! The hub client turns hub notifications into [`HubEvent`]s; the settings
//! source reads system config values that notifications only name.

mod hub;
mod settings;
mod status;

pub use hub::{FmsHub, HubEvent};
pub use settings::{FmsSettings, SettingsSource};
pub use status::{MatchState, MatchStatus, TournamentLevel};
