//! Automatic risk de-escalation for trading bots.
//!
//! Per candle and side, [`engine::AutoRisk`] combines market-regime
//! classification, feature drift against a training baseline and market
//! context breakage into one entry gate and one size multiplier.

pub mod artifacts;
pub mod config;
pub mod decision;
pub mod drift;
pub mod engine;
pub mod features;
pub mod logging;
pub mod market_context;
pub mod persist;
pub mod regime;
pub mod state;
pub mod stats;
pub mod table;

pub use config::AutoRiskConfig;
pub use decision::{Decision, DriftStatus, MarketContextStatus, Side};
pub use engine::AutoRisk;
pub use regime::Regime;
pub use table::{Bar, PriceTable};
