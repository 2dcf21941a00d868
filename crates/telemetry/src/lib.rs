//! Cost accounting for tasklane.
//!
//! Turns the usage a provider reports into the [`TokenAccounting`] attached to
//! each `api_req_started` message, using a built-in table of model prices.
//!
//! [`TokenAccounting`]: tasklane_core::TokenAccounting

pub mod pricing;

pub use pricing::{ModelPricing, PricingTable};
