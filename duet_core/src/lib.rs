//! DUET Core - Simulation Result Sync for the digital-twin viewer
//!
//! This library turns asynchronous simulation results published on a
//! message broker into map layers:
//! 1. **Routing**: per-region topic catalogs resolved into broker subscriptions
//! 2. **Matching**: results accepted only for scenarios this session requested
//! 3. **Enrichment**: vector tiles joined with result records, diffed into
//!    delta attributes and offset so opposite directions stay apart
//!
//! ```text
//!   broker ──► SubscriptionManager ──► ResultDispatcher ──► Session
//!                                                            │
//!                             LayerRegistry ◄── layers ──────┤
//!                             TileSource    ◄── TilePipeline ┘
//! ```

pub mod config;
pub mod datasets;
pub mod delta;
pub mod dispatcher;
pub mod enrichment;
pub mod error;
pub mod layers;
pub mod notify;
pub mod offset;
pub mod payload;
pub mod pending;
pub mod properties;
pub mod session;
pub mod subscription;
pub mod tiles;
pub mod topics;

// Re-export key types for convenience
pub use config::{DeploymentMode, DuetConfig, ReconnectPolicy, RequestTarget};
pub use datasets::{DatasetDescriptor, DatasetTable, OffsetRule};
pub use delta::{compute_delta, DeltaRecord};
pub use dispatcher::{DiscardReason, DispatchOutcome, ResultDispatcher};
pub use enrichment::{EnrichmentMode, ResultHashmap, TilePipeline};
pub use error::{CoreError, CoreResult};
pub use layers::{InMemoryLayerRegistry, LayerDefinition, LayerKind, LayerRegistry, LayerRole};
pub use notify::{Level, Notification, Notifications};
pub use offset::{offset_line, OffsetCorrector};
pub use payload::{RasterProvider, ResultClass, ResultPayload, VectorResult};
pub use pending::{ClaimOutcome, PendingScenarios};
pub use session::{ScenarioPhase, Session};
pub use subscription::{ConnectionState, MessageSink, RequestPublisher, RoutedMessage, SubscriptionManager};
pub use tiles::{MemoryTileSource, MemoryTileSourceFactory, Tile, TileCoord, TileFeature, TileSource, TileSourceFactory};
pub use topics::{TopicCatalog, TopicClass, TopicDescriptor, TopicRoute};
