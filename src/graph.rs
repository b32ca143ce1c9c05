use geo::prelude::*;
use geo::Point;
use itertools::Itertools;
use petgraph::algo::astar;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::{EngineError, EngineResult};
use crate::geometry::RouteGeometry;
use crate::safety::HazardGrid;

#[derive(Debug, Clone, Copy)]
pub struct GeoNode {
    pub lat: f64,
    pub lon: f64,
}

impl GeoNode {
    fn point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoadEdge {
    pub distance_m: f64,
}

/// R-tree entry: `[lon, lat]` of a graph node.
struct NodeEntry {
    point: [f64; 2],
    index: NodeIndex,
}

impl RTreeObject for NodeEntry {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for NodeEntry {
    /// Squared distance in degree space; good enough to pick the nearest
    /// node at city scale.
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlon = self.point[0] - point[0];
        let dlat = self.point[1] - point[1];
        dlon * dlon + dlat * dlat
    }
}

#[derive(Debug, Clone)]
pub struct PlannedRoute {
    pub geometry: RouteGeometry,
    pub distance_m: f64,
    /// Hazard-weighted A* cost.
    pub cost: f64,
}

pub struct NavigationGraph {
    pub graph: Graph<GeoNode, RoadEdge>,
    spatial_idx: RTree<NodeEntry>,
}

impl Default for NavigationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationGraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            spatial_idx: RTree::new(),
        }
    }

    pub fn add_node(&mut self, lon: f64, lat: f64) -> NodeIndex {
        let index = self.graph.add_node(GeoNode { lat, lon });
        self.spatial_idx.insert(NodeEntry {
            point: [lon, lat],
            index,
        });
        index
    }

    /// Connect `a` and `b` in both directions; returns the haversine length.
    pub fn add_road(&mut self, a: NodeIndex, b: NodeIndex) -> f64 {
        let dist = self.graph[a].point().haversine_distance(&self.graph[b].point());
        let edge = RoadEdge {
            distance_m: dist,
        };
        self.graph.add_edge(a, b, edge);
        self.graph.add_edge(b, a, edge);
        dist
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[cfg(feature = "osm")]
    pub fn from_pbf(path: &std::path::Path) -> anyhow::Result<Self> {
        use std::collections::HashMap;

        use osmpbf::{Element, ElementReader};
        use tracing::info;

        info!(path = %path.display(), "parsing OSM PBF");

        let mut nav = Self::new();
        let mut osm_id_map: HashMap<i64, NodeIndex> = HashMap::new();
        let mut temp_nodes: HashMap<i64, (f64, f64)> = HashMap::new();

        // PASS 1: Nodes
        let reader = ElementReader::from_path(path)?;
        reader.for_each(|element| match element {
            Element::Node(node) => {
                temp_nodes.insert(node.id(), (node.lon(), node.lat()));
            }
            Element::DenseNode(node) => {
                temp_nodes.insert(node.id(), (node.lon(), node.lat()));
            }
            _ => {}
        })?;
        info!(nodes = temp_nodes.len(), "loaded nodes, building roads");

        // PASS 2: Ways
        let reader_pass2 = ElementReader::from_path(path)?;
        reader_pass2.for_each(|element| {
            let Element::Way(way) = element else {
                return;
            };
            let highway = way
                .tags()
                .find(|(key, _)| *key == "highway")
                .map(|(_, value)| value)
                .unwrap_or("");
            let is_road = matches!(
                highway,
                "motorway" | "trunk" | "primary" | "secondary" | "tertiary" | "unclassified"
                    | "residential" | "living_street" | "service" | "motorway_link"
                    | "trunk_link" | "primary_link" | "secondary_link" | "tertiary_link"
                    | "pedestrian" | "footway" | "path"
            );
            if !is_road {
                return;
            }

            for (id_a, id_b) in way.refs().tuple_windows() {
                let (Some(&(lon_a, lat_a)), Some(&(lon_b, lat_b))) =
                    (temp_nodes.get(&id_a), temp_nodes.get(&id_b))
                else {
                    continue;
                };
                let idx_a = match osm_id_map.get(&id_a) {
                    Some(&idx) => idx,
                    None => {
                        let idx = nav.add_node(lon_a, lat_a);
                        osm_id_map.insert(id_a, idx);
                        idx
                    }
                };
                let idx_b = match osm_id_map.get(&id_b) {
                    Some(&idx) => idx,
                    None => {
                        let idx = nav.add_node(lon_b, lat_b);
                        osm_id_map.insert(id_b, idx);
                        idx
                    }
                };
                nav.add_road(idx_a, idx_b);
            }
        })?;

        info!(
            nodes = nav.node_count(),
            edges = nav.edge_count(),
            "graph built"
        );
        Ok(nav)
    }

    pub fn nearest_node(&self, lon: f64, lat: f64) -> Option<NodeIndex> {
        self.spatial_idx
            .nearest_neighbor(&[lon, lat])
            .map(|entry| entry.index)
    }

    /// Cheapest path under `distance * (1 + alpha * risk)`, where `risk` is
    /// the highest grid penalty at either end or the middle of the edge.
    ///
    /// `origin` and `destination` are `[lon, lat]` and get snapped to the
    /// nearest nodes. `Ok(None)` when they snap to the same node or no path
    /// exists.
    pub fn plan(
        &self,
        origin: [f64; 2],
        destination: [f64; 2],
        alpha: f64,
        grid: &HazardGrid,
    ) -> EngineResult<Option<PlannedRoute>> {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "risk weight must be non-negative, got {alpha}"
            )));
        }
        let g = &self.graph;

        // 1. Snap input coordinates to nearest graph nodes
        let (Some(start_node), Some(end_node)) = (
            self.nearest_node(origin[0], origin[1]),
            self.nearest_node(destination[0], destination[1]),
        ) else {
            return Ok(None);
        };
        if start_node == end_node {
            return Ok(None);
        }
        let dest = g[end_node].point();

        // 2. Weighted A*
        let path_result = astar(
            g,
            start_node,
            |finish| finish == end_node,
            |e| {
                let from = g[e.source()];
                let to = g[e.target()];
                let risk = grid
                    .risk_at(from.lon, from.lat)
                    .max(grid.risk_at((from.lon + to.lon) / 2.0, (from.lat + to.lat) / 2.0))
                    .max(grid.risk_at(to.lon, to.lat));
                e.weight().distance_m * (1.0 + alpha * risk)
            },
            // Edge lengths are haversine, so this never overestimates.
            |n| g[n].point().haversine_distance(&dest),
        );

        let Some((cost, nodes)) = path_result else {
            return Ok(None);
        };

        // 3. Reconstruct geometry and real distance
        let distance_m = nodes
            .iter()
            .tuple_windows()
            .filter_map(|(&a, &b)| g.find_edge(a, b).map(|edge| g[edge].distance_m))
            .sum();
        let geometry = RouteGeometry::from_network_path(nodes.iter().map(|&n| [g[n].lon, g[n].lat]))?;

        Ok(Some(PlannedRoute {
            geometry,
            distance_m,
            cost,
        }))
    }
}
