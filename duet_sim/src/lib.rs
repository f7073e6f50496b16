//! DUET Deterministic Simulation Harness
//!
//! A controlled environment where a complete result-sync session runs
//! against an in-memory broker, driven by a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: virtual clock, advanced only by backoff sleeps
//! - **Broker**: in-memory topics with configurable loss, duplication,
//!   refused connects and forced drops
//! - **Data**: road networks and result records generated from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ScenarioRunner                        │
//! │   ┌───────────────┐  publish   ┌───────────────────────────┐ │
//! │   │ SyntheticNet. │──────────► │ SimBroker (fault inject.) │ │
//! │   └───────────────┘            └─────────────┬─────────────┘ │
//! │                                              │ SimTransport  │
//! │   ┌──────────────────────────────────────────▼─────────────┐ │
//! │   │ SubscriptionManager ─► ResultDispatcher ─► Session     │ │
//! │   │       (SimContext: virtual clock, seeded RNG)          │ │
//! │   └────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use duet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ChaosStorm);
//! assert!(result.passed);
//! ```

mod context;
pub mod harness;
mod network;
pub mod roads;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use harness::{Harness, OutcomeLog};
pub use network::{BrokerStats, FaultConfig, SimBroker, SimTransport};
pub use roads::SyntheticNetwork;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
