//! Tile-addressable vector data and the tile provider boundary.
//!
//! The rendering side owns the tile cache. It loads tiles as the view
//! changes and notifies registered listeners with the freshly loaded tile;
//! listeners mutate features in place and ask for a redraw.

use crate::error::{CoreError, CoreResult};
use crate::layers::VectorLayerSpec;
use crate::properties::PropertyMap;
use async_trait::async_trait;
use geo::Geometry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

// ============================================================================
// TILE MODEL
// ============================================================================

/// Tile address `z/x/y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// The root tile. Redrawing it refreshes everything currently rendered.
    pub const ROOT: TileCoord = TileCoord { z: 0, x: 0, y: 0 };

    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Parses `z/x/y`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('/').map(|p| p.parse::<u32>().ok());
        let coord = Self::new(parts.next()??, parts.next()??, parts.next()??);
        if parts.next().is_some() {
            return None;
        }
        Some(coord)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A feature resident in a loaded tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFeature {
    pub geometry: Geometry<f64>,
    pub properties: PropertyMap,

    /// Set once the lateral line offset has been applied
    pub offset_applied: bool,
}

impl TileFeature {
    pub fn new(geometry: impl Into<Geometry<f64>>, properties: PropertyMap) -> Self {
        Self {
            geometry: geometry.into(),
            properties,
            offset_applied: false,
        }
    }
}

/// A loaded tile and its features.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tile {
    pub coord: TileCoord,
    pub features: Vec<TileFeature>,
}

impl Default for TileCoord {
    fn default() -> Self {
        Self::ROOT
    }
}

impl Tile {
    pub fn new(coord: TileCoord, features: Vec<TileFeature>) -> Self {
        Self { coord, features }
    }
}

// ============================================================================
// PROVIDER BOUNDARY
// ============================================================================

/// Handle returned by [`TileSource::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Receives every freshly loaded tile of a layer.
pub trait TileLoadListener: Send + Sync {
    /// Processes one tile batch. `source` is the layer the tile belongs to.
    fn on_tile_loaded(&self, tile: &mut Tile, source: &dyn TileSource);
}

/// A tile provider backing one vector tile layer.
#[async_trait]
pub trait TileSource: Send + Sync {
    fn layer_name(&self) -> &str;

    /// Resolves once the provider accepts listeners.
    async fn ready(&self) -> CoreResult<()>;

    fn add_listener(&self, listener: Arc<dyn TileLoadListener>) -> ListenerId;

    /// Returns `false` if the id was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Requests a redraw of the given tiles. Idempotent.
    fn redraw(&self, tiles: &[TileCoord]);
}

/// Opens tile sources for vector tile layers.
pub trait TileSourceFactory: Send + Sync {
    fn open(&self, layer_name: &str, spec: &VectorLayerSpec) -> CoreResult<Arc<dyn TileSource>>;
}

// ============================================================================
// IN-MEMORY PROVIDER
// ============================================================================

/// Tile source kept entirely in memory.
///
/// Used by the headless agent and by the simulation harness, which feeds it
/// tiles through [`MemoryTileSource::load_tile`].
pub struct MemoryTileSource {
    layer_name: String,
    ready_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn TileLoadListener>)>>,
    next_listener: AtomicU64,
    loaded: Mutex<BTreeMap<TileCoord, Tile>>,
    redraws: Mutex<Vec<Vec<TileCoord>>>,
}

impl MemoryTileSource {
    /// Creates a source that is ready immediately.
    pub fn new(layer_name: impl Into<String>) -> Self {
        let source = Self::new_pending(layer_name);
        source.mark_ready();
        source
    }

    /// Creates a source whose `ready()` blocks until [`Self::mark_ready`].
    pub fn new_pending(layer_name: impl Into<String>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            layer_name: layer_name.into(),
            ready_tx,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            loaded: Mutex::new(BTreeMap::new()),
            redraws: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    /// Simulates the provider loading a tile: listeners run in
    /// registration order and the processed tile is cached.
    pub fn load_tile(&self, mut tile: Tile) -> Tile {
        let listeners: Vec<Arc<dyn TileLoadListener>> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_tile_loaded(&mut tile, self);
        }
        lock(&self.loaded).insert(tile.coord, tile.clone());
        tile
    }

    /// Runs the listeners again over every cached tile.
    pub fn reload_all(&self) -> Vec<Tile> {
        let tiles: Vec<Tile> = lock(&self.loaded).values().cloned().collect();
        tiles.into_iter().map(|t| self.load_tile(t)).collect()
    }

    pub fn tile(&self, coord: TileCoord) -> Option<Tile> {
        lock(&self.loaded).get(&coord).cloned()
    }

    /// Every cached tile in coordinate order.
    pub fn loaded_tiles(&self) -> Vec<Tile> {
        lock(&self.loaded).values().cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Redraw requests received so far.
    pub fn redraw_requests(&self) -> Vec<Vec<TileCoord>> {
        lock(&self.redraws).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl TileSource for MemoryTileSource {
    fn layer_name(&self) -> &str {
        &self.layer_name
    }

    async fn ready(&self) -> CoreResult<()> {
        let mut rx = self.ready_tx.subscribe();
        if rx.wait_for(|ready| *ready).await.is_err() {
            return Err(CoreError::layer(format!(
                "tile source {} closed before ready",
                self.layer_name
            )));
        }
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn TileLoadListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        lock(&self.listeners).push((id, listener));
        debug!(layer = %self.layer_name, listener = id.0, "tile listener attached");
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    fn redraw(&self, tiles: &[TileCoord]) {
        lock(&self.redraws).push(tiles.to_vec());
    }
}

/// Factory producing [`MemoryTileSource`]s and remembering them by layer name.
#[derive(Default)]
pub struct MemoryTileSourceFactory {
    sources: Mutex<BTreeMap<String, Arc<MemoryTileSource>>>,
}

impl MemoryTileSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The source opened for a layer, if any.
    pub fn source(&self, layer_name: &str) -> Option<Arc<MemoryTileSource>> {
        lock(&self.sources).get(layer_name).cloned()
    }

    pub fn layer_names(&self) -> Vec<String> {
        lock(&self.sources).keys().cloned().collect()
    }
}

impl TileSourceFactory for MemoryTileSourceFactory {
    fn open(&self, layer_name: &str, spec: &VectorLayerSpec) -> CoreResult<Arc<dyn TileSource>> {
        let source = Arc::new(MemoryTileSource::new(layer_name));
        debug!(layer = layer_name, url = %spec.geometry_url, "opened in-memory tile source");
        lock(&self.sources).insert(layer_name.to_string(), Arc::clone(&source));
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;

    struct CountingListener(Mutex<usize>);

    impl TileLoadListener for CountingListener {
        fn on_tile_loaded(&self, tile: &mut Tile, source: &dyn TileSource) {
            *self.0.lock().unwrap() += tile.features.len();
            source.redraw(&[TileCoord::ROOT]);
        }
    }

    #[test]
    fn test_tile_coord_parse() {
        assert_eq!(TileCoord::parse("0/0/0"), Some(TileCoord::ROOT));
        assert_eq!(TileCoord::parse("14/8392/5467"), Some(TileCoord::new(14, 8392, 5467)));
        assert_eq!(TileCoord::parse("1/2"), None);
        assert_eq!(TileCoord::parse("1/2/3/4"), None);
        assert_eq!(TileCoord::new(3, 1, 2).to_string(), "3/1/2");
    }

    #[test]
    fn test_listeners_run_and_can_be_removed() {
        let source = MemoryTileSource::new("layer");
        let listener = Arc::new(CountingListener(Mutex::new(0)));
        let id = source.add_listener(listener.clone());

        let feature = TileFeature::new(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)], PropertyMap::new());
        source.load_tile(Tile::new(TileCoord::new(1, 0, 0), vec![feature.clone(), feature]));
        assert_eq!(*listener.0.lock().unwrap(), 2);
        assert_eq!(source.redraw_requests(), vec![vec![TileCoord::ROOT]]);

        assert!(source.remove_listener(id));
        assert!(!source.remove_listener(id));
        source.reload_all();
        assert_eq!(*listener.0.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ready_waits_for_mark() {
        let source = Arc::new(MemoryTileSource::new_pending("layer"));
        let waiter = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.ready().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        source.mark_ready();
        assert!(waiter.await.unwrap().is_ok());
    }
}
