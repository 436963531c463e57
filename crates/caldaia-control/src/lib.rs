//! `caldaia-control`: the long-running loops driving the boiler.
//!
//! | Loop                     | Woken by                                   |
//! |--------------------------|--------------------------------------------|
//! | [`RuleTimingController`] | rule list changes, per-rule window timers  |
//! | [`SwitchController`]     | rules, protection flag, temperature samples |
//! | [`OverheatingController`]| fixed tick                                  |
//!
//! All of them mutate state only through [`caldaia_store::Boiler`] and stop
//! when their shutdown token is cancelled. [`supervise`] restarts them on
//! failure.

pub mod error;
pub mod orchestrator;
pub mod overheating;
pub mod supervisor;
pub mod switch;

pub use error::{ControlError, Result};
pub use orchestrator::{plan, Planned, RuleTimingController, Transition};
pub use overheating::{current_overheating_index, overheating_index, OverheatingController};
pub use supervisor::{supervise, RestartPolicy};
pub use switch::{should_heat, SwitchController};
