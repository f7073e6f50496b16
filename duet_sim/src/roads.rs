//! Seeded synthetic road network.
//!
//! Generates two-way road links laid out on a grid, the reference
//! properties the tile server would carry, and the result records a
//! traffic model would publish for them.

use duet_core::properties::PropertyMap;
use duet_core::tiles::{Tile, TileCoord, TileFeature};
use geo::{Coord, LineString};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

/// Number of flow periods per link.
pub const PERIODS: usize = 4;

/// One road link of the synthetic network.
#[derive(Debug, Clone)]
pub struct Link {
    pub id: u64,
    pub line: LineString<f64>,

    /// Reference flow, one value per period
    pub reference_flow: Vec<f64>,

    /// Simulated flow; may be shorter or longer than the reference
    pub result_flow: Vec<f64>,
}

/// A generated network.
#[derive(Debug, Clone)]
pub struct SyntheticNetwork {
    pub seed: u64,
    pub links: Vec<Link>,
}

impl SyntheticNetwork {
    /// Generates `count` links. With `exception_id` set, the first link gets
    /// that id.
    pub fn generate(seed: u64, count: usize, exception_id: Option<u64>) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut links = Vec::with_capacity(count);
        for i in 0..count {
            let id = match (i, exception_id) {
                (0, Some(exception)) => exception,
                _ => 1_000 + i as u64,
            };
            links.push(Link {
                id,
                line: polyline(&mut rng, i),
                reference_flow: flows(&mut rng, PERIODS),
                result_flow: {
                    // Some models report fewer or extra periods
                    let len = match rng.gen_range(0..10) {
                        0 => PERIODS - 1,
                        1 => PERIODS + 1,
                        _ => PERIODS,
                    };
                    flows(&mut rng, len)
                },
            });
        }
        Self { seed, links }
    }

    /// Splits the network into tiles of at most `per_tile` features.
    pub fn tiles(&self, per_tile: usize) -> Vec<Tile> {
        self.links
            .chunks(per_tile.max(1))
            .enumerate()
            .map(|(i, chunk)| {
                let features = chunk.iter().map(|link| TileFeature::new(link.line.clone(), reference_properties(link))).collect();
                Tile::new(TileCoord::new(14, 8_000 + i as u32, 5_000), features)
            })
            .collect()
    }

    /// Result message a traffic model would publish for this network.
    pub fn result_payload(&self, scenario_id: &str, name: &str, geometry_url: &str) -> Value {
        let records: Vec<Value> = self
            .links
            .iter()
            .map(|link| json!({"link_id": link.id, "Traffic": link.result_flow, "from_node_id": link.id * 10}))
            .collect();
        json!({
            "scenarioid": scenario_id,
            "name": name,
            "data": {
                "metadata": {"status": "ok", "road_network_geom_url": geometry_url},
                "result": records,
            }
        })
    }

    pub fn link(&self, id: u64) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }
}

fn reference_properties(link: &Link) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert("link_id".into(), json!(link.id));
    props.insert("flow".into(), json!(link.reference_flow));
    props.insert("name".into(), json!(format!("link {}", link.id)));
    props
}

fn flows(rng: &mut ChaCha8Rng, len: usize) -> Vec<f64> {
    (0..len).map(|_| rng.gen_range(0..2_000) as f64).collect()
}

/// A 2-5 vertex polyline heading roughly east, in metres.
fn polyline(rng: &mut ChaCha8Rng, row: usize) -> LineString<f64> {
    let vertices = rng.gen_range(2..=5);
    let mut x = 0.0;
    let y0 = row as f64 * 50.0;
    let mut coords = Vec::with_capacity(vertices);
    for _ in 0..vertices {
        coords.push(Coord {
            x,
            y: y0 + rng.gen_range(-10.0..10.0),
        });
        x += rng.gen_range(20.0..120.0);
    }
    LineString::new(coords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exception_id_and_tiling() {
        let network = SyntheticNetwork::generate(42, 10, Some(8344));
        assert_eq!(network.links[0].id, 8344);
        assert_eq!(network.links[1].id, 1_001);

        let tiles = network.tiles(4);
        assert_eq!(tiles.len(), 3);
        assert_eq!(tiles[2].features.len(), 2);
        assert_eq!(tiles[0].features[0].properties["link_id"], json!(8344));
    }

    #[test]
    fn test_payload_shape() {
        let network = SyntheticNetwork::generate(1, 3, None);
        let payload = network.result_payload("s1", "traffic.gent", "https://g/net.json");
        assert_eq!(payload["data"]["result"].as_array().unwrap().len(), 3);
        assert_eq!(payload["data"]["metadata"]["status"], json!("ok"));
    }

    proptest! {
        #[test]
        fn prop_generation_is_deterministic(seed in any::<u64>(), count in 1usize..30) {
            let a = SyntheticNetwork::generate(seed, count, None);
            let b = SyntheticNetwork::generate(seed, count, None);
            prop_assert_eq!(a.links.len(), count);
            for (x, y) in a.links.iter().zip(b.links.iter()) {
                prop_assert_eq!(&x.line, &y.line);
                prop_assert_eq!(&x.result_flow, &y.result_flow);
                prop_assert!(x.line.0.len() >= 2);
                prop_assert!(x.line.0.windows(2).all(|w| w[1].x > w[0].x));
            }
        }
    }
}
