//! Hex board model.
//!
//! The board is an arena of tiles, corners and edges addressed by index.
//! Adjacency is stored as index lists, so the graph has no reference
//! cycles and ids stay stable for the whole session. Tiles are laid out
//! in rows of a half-offset hex grid and built from a compact textual
//! descriptor (the "map key"), which `map_key()` can regenerate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::PlayerId;

pub type TileId = usize;
pub type CornerId = usize;
pub type EdgeId = usize;

/// Standard 2-4 player layout.
pub const BASE_MAP_KEY: &str = "S(br_*3).S.S(bl_W2).S\n-S.M10.G2.J9.S(bl_O2)\n-S(r_L2).F12.C6.G4.C10.S\n-S.F9.J11.D.J3.M8.S(l_*3)\n+S(r_B2).J8.M3.F4.G5.S\n+S.C5.F6.G11.S(tl_S2)\n+S(tr_*3).S.S(tl_*3).S";

/// Extended layout for 5-6 player sessions.
pub const EXTENDED_MAP_KEY: &str = "S(br_*3).S.S.S(bl_W2).S\n-S.M10.G2.J9.F6.S(bl_O2)\n-S(r_L2).F12.C6.G4.C10.M3.S\n-S.F9.J11.D.J3.M8.G5.S(l_*3)\n+S(r_B2).J8.M3.F4.G5.C11.S\n+S.C5.F6.G11.J4.S(tl_S2)\n+S(tr_*3).S.S.S(tl_*3).S";

/// Large layout for 7-8 player sessions.
pub const LARGE_MAP_KEY: &str = "S(br_*3).S.S.S.S(bl_W2).S\n-S.M10.G2.J9.F6.C5.S(bl_O2)\n-S(r_L2).F12.C6.G4.C10.M3.G9.S\n-S.F9.J11.D.J3.M8.G5.F10.S(l_*3)\n-S.G6.F3.M5.C8.J10.F11.J12.S\n+S(r_B2).J8.M3.F4.G5.C11.M12.S\n+S.C5.F6.G11.J4.M2.S(tl_S2)\n+S(tr_*3).S.S.S.S(tl_*3).S";

/// The five producible resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Sheep,
    Lumber,
    Brick,
    Ore,
    Wheat,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Sheep,
        Resource::Lumber,
        Resource::Brick,
        Resource::Ore,
        Resource::Wheat,
    ];

    pub fn letter(self) -> char {
        match self {
            Resource::Sheep => 'S',
            Resource::Lumber => 'L',
            Resource::Brick => 'B',
            Resource::Ore => 'O',
            Resource::Wheat => 'W',
        }
    }

    fn from_letter(c: char) -> Option<Resource> {
        match c {
            'S' => Some(Resource::Sheep),
            'L' => Some(Resource::Lumber),
            'B' => Some(Resource::Brick),
            'O' => Some(Resource::Ore),
            'W' => Some(Resource::Wheat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terrain {
    Grassland,
    Jungle,
    ClayPit,
    Mountain,
    Fields,
    Desert,
    Sea,
}

impl Terrain {
    /// What this terrain yields, if anything.
    pub fn resource(self) -> Option<Resource> {
        match self {
            Terrain::Grassland => Some(Resource::Sheep),
            Terrain::Jungle => Some(Resource::Lumber),
            Terrain::ClayPit => Some(Resource::Brick),
            Terrain::Mountain => Some(Resource::Ore),
            Terrain::Fields => Some(Resource::Wheat),
            Terrain::Desert | Terrain::Sea => None,
        }
    }

    pub fn is_land(self) -> bool {
        self != Terrain::Sea
    }

    fn letter(self) -> char {
        match self {
            Terrain::Grassland => 'G',
            Terrain::Jungle => 'J',
            Terrain::ClayPit => 'C',
            Terrain::Mountain => 'M',
            Terrain::Fields => 'F',
            Terrain::Desert => 'D',
            Terrain::Sea => 'S',
        }
    }

    fn from_letter(c: char) -> Option<Terrain> {
        match c {
            'G' => Some(Terrain::Grassland),
            'J' => Some(Terrain::Jungle),
            'C' => Some(Terrain::ClayPit),
            'M' => Some(Terrain::Mountain),
            'F' => Some(Terrain::Fields),
            'D' => Some(Terrain::Desert),
            'S' => Some(Terrain::Sea),
            _ => None,
        }
    }
}

/// The six edge directions of a pointy-top hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDir {
    TopLeft,
    TopRight,
    Left,
    Right,
    BottomLeft,
    BottomRight,
}

impl EdgeDir {
    pub const ALL: [EdgeDir; 6] = [
        EdgeDir::TopLeft,
        EdgeDir::TopRight,
        EdgeDir::Left,
        EdgeDir::Right,
        EdgeDir::BottomLeft,
        EdgeDir::BottomRight,
    ];

    fn index(self) -> usize {
        match self {
            EdgeDir::TopLeft => 0,
            EdgeDir::TopRight => 1,
            EdgeDir::Left => 2,
            EdgeDir::Right => 3,
            EdgeDir::BottomLeft => 4,
            EdgeDir::BottomRight => 5,
        }
    }

    pub fn opposite(self) -> EdgeDir {
        match self {
            EdgeDir::TopLeft => EdgeDir::BottomRight,
            EdgeDir::TopRight => EdgeDir::BottomLeft,
            EdgeDir::Left => EdgeDir::Right,
            EdgeDir::Right => EdgeDir::Left,
            EdgeDir::BottomLeft => EdgeDir::TopRight,
            EdgeDir::BottomRight => EdgeDir::TopLeft,
        }
    }

    /// The two corner slots this edge connects.
    fn corners(self) -> [CornerDir; 2] {
        match self {
            EdgeDir::TopLeft => [CornerDir::Top, CornerDir::TopLeft],
            EdgeDir::TopRight => [CornerDir::Top, CornerDir::TopRight],
            EdgeDir::Left => [CornerDir::TopLeft, CornerDir::BottomLeft],
            EdgeDir::Right => [CornerDir::TopRight, CornerDir::BottomRight],
            EdgeDir::BottomLeft => [CornerDir::Bottom, CornerDir::BottomLeft],
            EdgeDir::BottomRight => [CornerDir::Bottom, CornerDir::BottomRight],
        }
    }

    fn short(self) -> &'static str {
        match self {
            EdgeDir::TopLeft => "tl",
            EdgeDir::TopRight => "tr",
            EdgeDir::Left => "l",
            EdgeDir::Right => "r",
            EdgeDir::BottomLeft => "bl",
            EdgeDir::BottomRight => "br",
        }
    }

    fn from_short(s: &str) -> Option<EdgeDir> {
        match s {
            "tl" => Some(EdgeDir::TopLeft),
            "tr" => Some(EdgeDir::TopRight),
            "l" => Some(EdgeDir::Left),
            "r" => Some(EdgeDir::Right),
            "bl" => Some(EdgeDir::BottomLeft),
            "br" => Some(EdgeDir::BottomRight),
            _ => None,
        }
    }
}

/// The six corner slots of a pointy-top hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CornerDir {
    Top,
    TopLeft,
    TopRight,
    Bottom,
    BottomLeft,
    BottomRight,
}

impl CornerDir {
    fn index(self) -> usize {
        match self {
            CornerDir::Top => 0,
            CornerDir::TopLeft => 1,
            CornerDir::TopRight => 2,
            CornerDir::Bottom => 3,
            CornerDir::BottomLeft => 4,
            CornerDir::BottomRight => 5,
        }
    }
}

/// What a port trades for the listed ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Any,
    Resource(Resource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub dir: EdgeDir,
    pub kind: PortKind,
    pub ratio: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingKind {
    Settlement,
    City,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub owner: PlayerId,
    pub kind: BuildingKind,
}

/// A buildable piece kind, used by build intents and cost tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    Road,
    Settlement,
    City,
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub id: TileId,
    pub terrain: Terrain,
    pub number: Option<u8>,
    pub port: Option<Port>,
    neighbors: [Option<TileId>; 6],
    corners: [CornerId; 6],
    edges: [EdgeId; 6],
}

impl Tile {
    pub fn neighbor(&self, dir: EdgeDir) -> Option<TileId> {
        self.neighbors[dir.index()]
    }

    pub fn edge_at(&self, dir: EdgeDir) -> EdgeId {
        self.edges[dir.index()]
    }

    pub fn corner_ids(&self) -> [CornerId; 6] {
        self.corners
    }

    fn corner_at(&self, dir: CornerDir) -> CornerId {
        self.corners[dir.index()]
    }
}

#[derive(Debug, Clone)]
pub struct Corner {
    pub id: CornerId,
    pub tiles: Vec<TileId>,
    pub edges: Vec<EdgeId>,
    pub building: Option<Building>,
    /// Trade access granted by an adjacent port edge.
    pub port: Option<(PortKind, u8)>,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub corners: [CornerId; 2],
    pub tiles: Vec<TileId>,
    pub road: Option<PlayerId>,
}

impl Edge {
    pub fn other_corner(&self, corner: CornerId) -> CornerId {
        if self.corners[0] == corner {
            self.corners[1]
        } else {
            self.corners[0]
        }
    }
}

/// Half-hex offset of a row relative to the one above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowSign {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub(crate) struct Row {
    pub(crate) sign: Option<RowSign>,
    pub(crate) tiles: Vec<TileId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapParseError {
    #[error("map descriptor has no rows")]
    Empty,
    #[error("row {0} must start with '+' or '-'")]
    MissingRowSign(usize),
    #[error("unrecognized tile token `{0}`")]
    BadToken(String),
    #[error("invalid port spec in `{0}`")]
    BadPort(String),
    #[error("roll number out of range in `{0}`")]
    BadNumber(String),
    #[error("map descriptor has no land tiles")]
    NoLand,
}

/// One resource grant produced by a dice distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceYield {
    pub player: PlayerId,
    pub resource: Resource,
    pub count: u8,
}

#[derive(Debug, Clone)]
pub struct Board {
    pub(crate) tiles: Vec<Tile>,
    pub(crate) corners: Vec<Corner>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) rows: Vec<Row>,
    pub robber: TileId,
}

const UNSET: usize = usize::MAX;

impl Board {
    pub fn from_map_key(key: &str) -> Result<Board, MapParseError> {
        let mut rows_spec: Vec<(Option<RowSign>, Vec<(Terrain, Option<u8>, Option<Port>)>)> =
            Vec::new();
        for line in key.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (sign, body) = if rows_spec.is_empty() {
                (None, line)
            } else if let Some(rest) = line.strip_prefix('-') {
                (Some(RowSign::Left), rest)
            } else if let Some(rest) = line.strip_prefix('+') {
                (Some(RowSign::Right), rest)
            } else {
                return Err(MapParseError::MissingRowSign(rows_spec.len()));
            };
            let tokens = body
                .split('.')
                .map(parse_token)
                .collect::<Result<Vec<_>, _>>()?;
            rows_spec.push((sign, tokens));
        }
        if rows_spec.is_empty() {
            return Err(MapParseError::Empty);
        }

        let mut board = Board {
            tiles: Vec::new(),
            corners: Vec::new(),
            edges: Vec::new(),
            rows: Vec::new(),
            robber: 0,
        };

        // Pass 1: tiles with row-major ids.
        for (sign, tokens) in &rows_spec {
            let mut row = Row {
                sign: *sign,
                tiles: Vec::with_capacity(tokens.len()),
            };
            for &(terrain, number, port) in tokens {
                let id = board.tiles.len();
                row.tiles.push(id);
                board.tiles.push(Tile {
                    id,
                    terrain,
                    number,
                    port,
                    neighbors: [None; 6],
                    corners: [UNSET; 6],
                    edges: [UNSET; 6],
                });
            }
            board.rows.push(row);
        }

        board.wire_neighbors();
        board.synthesize_corners_and_edges();
        board.attach_ports();

        board.robber = board
            .tiles
            .iter()
            .find(|t| t.terrain == Terrain::Desert)
            .or_else(|| board.tiles.iter().find(|t| t.terrain.is_land()))
            .map(|t| t.id)
            .ok_or(MapParseError::NoLand)?;

        Ok(board)
    }

    fn wire_neighbors(&mut self) {
        let mut links: Vec<(TileId, EdgeDir, TileId)> = Vec::new();
        for (r, row) in self.rows.iter().enumerate() {
            for (j, &id) in row.tiles.iter().enumerate() {
                if j + 1 < row.tiles.len() {
                    links.push((id, EdgeDir::Right, row.tiles[j + 1]));
                }
                if r == 0 {
                    continue;
                }
                let prev = &self.rows[r - 1].tiles;
                match row.sign {
                    // Row shifted half a hex left: column j sits under
                    // the gap between prev[j-1] and prev[j].
                    Some(RowSign::Left) => {
                        if let Some(&up) = prev.get(j) {
                            links.push((id, EdgeDir::TopRight, up));
                        }
                        if j > 0 {
                            if let Some(&up) = prev.get(j - 1) {
                                links.push((id, EdgeDir::TopLeft, up));
                            }
                        }
                    }
                    Some(RowSign::Right) => {
                        if let Some(&up) = prev.get(j) {
                            links.push((id, EdgeDir::TopLeft, up));
                        }
                        if let Some(&up) = prev.get(j + 1) {
                            links.push((id, EdgeDir::TopRight, up));
                        }
                    }
                    None => {}
                }
            }
        }
        for (a, dir, b) in links {
            self.tiles[a].neighbors[dir.index()] = Some(b);
            self.tiles[b].neighbors[dir.opposite().index()] = Some(a);
        }
    }

    /// Create each physical corner and edge exactly once. Tiles are
    /// visited in id order, so shared corners/edges are looked up from
    /// the up and left neighbors that were already processed.
    fn synthesize_corners_and_edges(&mut self) {
        for t in 0..self.tiles.len() {
            let tl_n = self.tiles[t].neighbor(EdgeDir::TopLeft);
            let tr_n = self.tiles[t].neighbor(EdgeDir::TopRight);
            let l_n = self.tiles[t].neighbor(EdgeDir::Left);

            let shared_corner = |board: &Board, nb: Option<TileId>, slot: CornerDir| {
                nb.map(|n| board.tiles[n].corner_at(slot))
                    .filter(|&c| c != UNSET)
            };

            let corner_sources: [(CornerDir, Option<CornerId>); 6] = [
                (
                    CornerDir::Top,
                    shared_corner(self, tl_n, CornerDir::BottomRight)
                        .or_else(|| shared_corner(self, tr_n, CornerDir::BottomLeft)),
                ),
                (
                    CornerDir::TopLeft,
                    shared_corner(self, l_n, CornerDir::TopRight)
                        .or_else(|| shared_corner(self, tl_n, CornerDir::Bottom)),
                ),
                (
                    CornerDir::TopRight,
                    shared_corner(self, tr_n, CornerDir::Bottom),
                ),
                (CornerDir::Bottom, None),
                (
                    CornerDir::BottomLeft,
                    shared_corner(self, l_n, CornerDir::BottomRight),
                ),
                (CornerDir::BottomRight, None),
            ];

            for (slot, existing) in corner_sources {
                let cid = match existing {
                    Some(cid) => {
                        self.corners[cid].tiles.push(t);
                        cid
                    }
                    None => {
                        let cid = self.corners.len();
                        self.corners.push(Corner {
                            id: cid,
                            tiles: vec![t],
                            edges: Vec::new(),
                            building: None,
                            port: None,
                        });
                        cid
                    }
                };
                self.tiles[t].corners[slot.index()] = cid;
            }

            let shared_edge = |board: &Board, nb: Option<TileId>, dir: EdgeDir| {
                nb.map(|n| board.tiles[n].edges[dir.index()])
                    .filter(|&e| e != UNSET)
            };

            let edge_sources: [(EdgeDir, Option<EdgeId>); 6] = [
                (
                    EdgeDir::TopLeft,
                    shared_edge(self, tl_n, EdgeDir::BottomRight),
                ),
                (
                    EdgeDir::TopRight,
                    shared_edge(self, tr_n, EdgeDir::BottomLeft),
                ),
                (EdgeDir::Left, shared_edge(self, l_n, EdgeDir::Right)),
                (EdgeDir::Right, None),
                (EdgeDir::BottomLeft, None),
                (EdgeDir::BottomRight, None),
            ];

            for (dir, existing) in edge_sources {
                let eid = match existing {
                    Some(eid) => {
                        self.edges[eid].tiles.push(t);
                        eid
                    }
                    None => {
                        let [ca, cb] = dir.corners();
                        let ca = self.tiles[t].corner_at(ca);
                        let cb = self.tiles[t].corner_at(cb);
                        let eid = self.edges.len();
                        self.edges.push(Edge {
                            id: eid,
                            corners: [ca, cb],
                            tiles: vec![t],
                            road: None,
                        });
                        self.corners[ca].edges.push(eid);
                        self.corners[cb].edges.push(eid);
                        eid
                    }
                };
                self.tiles[t].edges[dir.index()] = eid;
            }
        }
    }

    fn attach_ports(&mut self) {
        for t in 0..self.tiles.len() {
            if let Some(port) = self.tiles[t].port {
                for slot in port.dir.corners() {
                    let cid = self.tiles[t].corner_at(slot);
                    self.corners[cid].port = Some((port.kind, port.ratio));
                }
            }
        }
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        self.tiles.get(id)
    }

    pub fn corner(&self, id: CornerId) -> Option<&Corner> {
        self.corners.get(id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn corner_count(&self) -> usize {
        self.corners.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn corner_touches_land(&self, corner: &Corner) -> bool {
        corner
            .tiles
            .iter()
            .any(|&t| self.tiles[t].terrain.is_land())
    }

    fn edge_touches_land(&self, edge: &Edge) -> bool {
        edge.tiles.iter().any(|&t| self.tiles[t].terrain.is_land())
    }

    pub(crate) fn edge_touches_land_id(&self, edge: EdgeId) -> bool {
        self.edge_touches_land(&self.edges[edge])
    }

    fn corner_has_adjacent_building(&self, corner: &Corner) -> bool {
        corner.edges.iter().any(|&e| {
            let other = self.edges[e].other_corner(corner.id);
            self.corners[other].building.is_some()
        })
    }

    fn valid_settlement_corner(&self, corner: &Corner) -> bool {
        corner.building.is_none()
            && self.corner_touches_land(corner)
            && !self.corner_has_adjacent_building(corner)
    }

    /// Corners legal for a free settlement placement: empty, on land,
    /// and honoring the two-hex distance rule. Road reachability is not
    /// considered; this is the initial-placement query. There is no
    /// per-player exclusion here: every player's buildings block a
    /// corner equally, so the one caller needs no player argument.
    pub fn settlement_locations(&self) -> Vec<CornerId> {
        self.corners
            .iter()
            .filter(|c| self.valid_settlement_corner(c))
            .map(|c| c.id)
            .collect()
    }

    /// Empty edges a player could extend their road network onto.
    /// Expansion never passes through a corner occupied by an opponent.
    pub fn road_locations_from_roads(&self, player: PlayerId, roads: &[EdgeId]) -> Vec<EdgeId> {
        let mut out = HashSet::new();
        for &e in roads {
            for &c in &self.edges[e].corners {
                let corner = &self.corners[c];
                if corner.building.map_or(false, |b| b.owner != player) {
                    continue;
                }
                for &next in &corner.edges {
                    let edge = &self.edges[next];
                    if edge.road.is_none() && self.edge_touches_land(edge) {
                        out.insert(next);
                    }
                }
            }
        }
        let mut out: Vec<EdgeId> = out.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Corners on a player's road network legal for a new settlement.
    pub fn settlement_locations_from_roads(&self, roads: &[EdgeId]) -> Vec<CornerId> {
        let mut out = HashSet::new();
        for &e in roads {
            for &c in &self.edges[e].corners {
                if self.valid_settlement_corner(&self.corners[c]) {
                    out.insert(c);
                }
            }
        }
        let mut out: Vec<CornerId> = out.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// All land tiles the robber could move to.
    pub fn robbable_tiles(&self) -> Vec<TileId> {
        self.tiles
            .iter()
            .filter(|t| t.terrain.is_land() && t.id != self.robber)
            .map(|t| t.id)
            .collect()
    }

    /// Place a piece. Validates emptiness and terrain only; phase and
    /// connectivity rules belong to the session engine.
    pub fn build(&mut self, player: PlayerId, piece: PieceKind, location: usize) -> bool {
        match piece {
            PieceKind::Road => {
                let Some(edge) = self.edges.get(location) else {
                    return false;
                };
                if edge.road.is_some() || !self.edge_touches_land(edge) {
                    return false;
                }
                self.edges[location].road = Some(player);
                true
            }
            PieceKind::Settlement => {
                let Some(corner) = self.corners.get(location) else {
                    return false;
                };
                if !self.valid_settlement_corner(corner) {
                    return false;
                }
                self.corners[location].building = Some(Building {
                    owner: player,
                    kind: BuildingKind::Settlement,
                });
                true
            }
            PieceKind::City => {
                let Some(corner) = self.corners.get(location) else {
                    return false;
                };
                match corner.building {
                    Some(Building {
                        owner,
                        kind: BuildingKind::Settlement,
                    }) if owner == player => {
                        self.corners[location].building = Some(Building {
                            owner: player,
                            kind: BuildingKind::City,
                        });
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn move_robber(&mut self, tile: TileId) -> bool {
        match self.tiles.get(tile) {
            Some(t) if t.terrain.is_land() && t.id != self.robber => {
                self.robber = tile;
                true
            }
            _ => false,
        }
    }

    /// Resource grants for a rolled total. The robber's tile never
    /// produces; settlements yield one unit, cities two.
    pub fn distribute(&self, total: u8) -> Vec<ResourceYield> {
        let mut grants: BTreeMap<(PlayerId, Resource), u8> = BTreeMap::new();
        for tile in &self.tiles {
            if tile.number != Some(total) || tile.id == self.robber {
                continue;
            }
            let Some(resource) = tile.terrain.resource() else {
                continue;
            };
            for &c in &tile.corners {
                if let Some(building) = self.corners[c].building {
                    let count = match building.kind {
                        BuildingKind::Settlement => 1,
                        BuildingKind::City => 2,
                    };
                    *grants.entry((building.owner, resource)).or_insert(0) += count;
                }
            }
        }
        grants
            .into_iter()
            .map(|((player, resource), count)| ResourceYield {
                player,
                resource,
                count,
            })
            .collect()
    }

    /// Longest simple path (no repeated edge) through the subgraph of a
    /// player's road edges, as an ordered edge-id list. Corners holding
    /// an opponent building end a path. Exhaustive DFS; the per-player
    /// road supply keeps the subgraph small.
    pub fn longest_path_from_roads(&self, player: PlayerId, roads: &[EdgeId]) -> Vec<EdgeId> {
        let road_set: HashSet<EdgeId> = roads.iter().copied().collect();
        let mut best = Vec::new();
        let mut path = Vec::new();
        let mut used = HashSet::new();
        for &start in roads {
            let [a, b] = self.edges[start].corners;
            for from in [a, b] {
                path.clear();
                used.clear();
                path.push(start);
                used.insert(start);
                let to = self.edges[start].other_corner(from);
                self.extend_path(player, &road_set, to, &mut used, &mut path, &mut best);
            }
        }
        best
    }

    fn extend_path(
        &self,
        player: PlayerId,
        roads: &HashSet<EdgeId>,
        at: CornerId,
        used: &mut HashSet<EdgeId>,
        path: &mut Vec<EdgeId>,
        best: &mut Vec<EdgeId>,
    ) {
        if path.len() > best.len() {
            best.clone_from(path);
        }
        let corner = &self.corners[at];
        if corner.building.map_or(false, |b| b.owner != player) {
            return;
        }
        for &e in &corner.edges {
            if !roads.contains(&e) || used.contains(&e) {
                continue;
            }
            used.insert(e);
            path.push(e);
            self.extend_path(player, roads, self.edges[e].other_corner(at), used, path, best);
            path.pop();
            used.remove(&e);
        }
    }

    /// Regenerate the textual descriptor for the current board state.
    pub fn map_key(&self) -> String {
        self.rows
            .iter()
            .map(|row| {
                let sign = match row.sign {
                    Some(RowSign::Left) => "-",
                    Some(RowSign::Right) => "+",
                    None => "",
                };
                let body = row
                    .tiles
                    .iter()
                    .map(|&t| tile_token(&self.tiles[t]))
                    .collect::<Vec<_>>()
                    .join(".");
                format!("{sign}{body}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn tile_token(tile: &Tile) -> String {
    match tile.terrain {
        Terrain::Desert => "D".to_string(),
        Terrain::Sea => match tile.port {
            Some(port) => {
                let kind = match port.kind {
                    PortKind::Any => '*',
                    PortKind::Resource(r) => r.letter(),
                };
                format!("S({}_{}{})", port.dir.short(), kind, port.ratio)
            }
            None => "S".to_string(),
        },
        land => {
            let number = tile.number.unwrap_or(0);
            format!("{}{}", land.letter(), number)
        }
    }
}

fn parse_token(token: &str) -> Result<(Terrain, Option<u8>, Option<Port>), MapParseError> {
    let token = token.trim();
    let mut chars = token.chars();
    let first = chars
        .next()
        .ok_or_else(|| MapParseError::BadToken(token.to_string()))?;
    let rest = chars.as_str();

    if first == 'S' {
        if rest.is_empty() {
            return Ok((Terrain::Sea, None, None));
        }
        let spec = rest
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| MapParseError::BadPort(token.to_string()))?;
        let (dir, trade) = spec
            .split_once('_')
            .ok_or_else(|| MapParseError::BadPort(token.to_string()))?;
        let dir =
            EdgeDir::from_short(dir).ok_or_else(|| MapParseError::BadPort(token.to_string()))?;
        let mut trade_chars = trade.chars();
        let kind_letter = trade_chars
            .next()
            .ok_or_else(|| MapParseError::BadPort(token.to_string()))?;
        let kind = if kind_letter == '*' {
            PortKind::Any
        } else {
            Resource::from_letter(kind_letter)
                .map(PortKind::Resource)
                .ok_or_else(|| MapParseError::BadPort(token.to_string()))?
        };
        let ratio: u8 = trade_chars
            .as_str()
            .parse()
            .map_err(|_| MapParseError::BadPort(token.to_string()))?;
        return Ok((Terrain::Sea, None, Some(Port { dir, kind, ratio })));
    }

    if first == 'D' && rest.is_empty() {
        return Ok((Terrain::Desert, None, None));
    }

    let terrain =
        Terrain::from_letter(first).ok_or_else(|| MapParseError::BadToken(token.to_string()))?;
    if terrain == Terrain::Desert || !terrain.is_land() {
        return Err(MapParseError::BadToken(token.to_string()));
    }
    let number: u8 = rest
        .parse()
        .map_err(|_| MapParseError::BadNumber(token.to_string()))?;
    if !(2..=12).contains(&number) {
        return Err(MapParseError::BadNumber(token.to_string()));
    }
    Ok((terrain, Some(number), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_board() -> Board {
        Board::from_map_key(BASE_MAP_KEY).unwrap()
    }

    #[test]
    fn parses_the_base_map() {
        let board = base_board();
        assert_eq!(board.tile_count(), 37);
        let deserts: Vec<_> = board
            .tiles
            .iter()
            .filter(|t| t.terrain == Terrain::Desert)
            .collect();
        assert_eq!(deserts.len(), 1);
        assert_eq!(board.robber, deserts[0].id);
    }

    #[test]
    fn map_key_round_trips_on_default_layouts() {
        for key in [BASE_MAP_KEY, EXTENDED_MAP_KEY, LARGE_MAP_KEY] {
            let board = Board::from_map_key(key).unwrap();
            assert_eq!(board.map_key(), key);
        }
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(matches!(Board::from_map_key(""), Err(MapParseError::Empty)));
        assert!(matches!(
            Board::from_map_key("S.S\nS.S"),
            Err(MapParseError::MissingRowSign(1))
        ));
        assert!(matches!(
            Board::from_map_key("S.X4"),
            Err(MapParseError::BadToken(_))
        ));
        assert!(matches!(
            Board::from_map_key("S.G13"),
            Err(MapParseError::BadNumber(_))
        ));
        assert!(matches!(
            Board::from_map_key("S(xx_W2).G5"),
            Err(MapParseError::BadPort(_))
        ));
        assert!(matches!(
            Board::from_map_key("S.S"),
            Err(MapParseError::NoLand)
        ));
    }

    #[test]
    fn neighbor_links_are_symmetric() {
        let board = base_board();
        for tile in &board.tiles {
            for dir in EdgeDir::ALL {
                if let Some(n) = tile.neighbor(dir) {
                    assert_eq!(
                        board.tiles[n].neighbor(dir.opposite()),
                        Some(tile.id),
                        "tile {} dir {:?}",
                        tile.id,
                        dir
                    );
                    assert_eq!(tile.edge_at(dir), board.tiles[n].edge_at(dir.opposite()));
                }
            }
        }
    }

    #[test]
    fn corners_and_edges_are_deduplicated() {
        let board = base_board();
        for corner in &board.corners {
            assert!(
                (1..=3).contains(&corner.tiles.len()),
                "corner {}",
                corner.id
            );
            assert!(
                (2..=3).contains(&corner.edges.len()),
                "corner {}",
                corner.id
            );
        }
        for edge in &board.edges {
            assert!((1..=2).contains(&edge.tiles.len()), "edge {}", edge.id);
            assert_ne!(edge.corners[0], edge.corners[1]);
        }
        // Shared corners mean far fewer than six per tile.
        assert!(board.corner_count() < board.tile_count() * 3);
    }

    #[test]
    fn ports_grant_trades_to_both_edge_corners() {
        let board = base_board();
        let port_corners = board.corners.iter().filter(|c| c.port.is_some()).count();
        // Base map carries nine ports, two corners each, all distinct.
        assert_eq!(port_corners, 18);
        for corner in board.corners.iter().filter(|c| c.port.is_some()) {
            let (_, ratio) = corner.port.unwrap();
            assert!((2..=4).contains(&ratio));
        }
    }

    #[test]
    fn settlement_distance_rule() {
        let mut board = base_board();
        let spot = board.settlement_locations()[0];
        assert!(board.build(1, PieceKind::Settlement, spot));
        let remaining = board.settlement_locations();
        assert!(!remaining.contains(&spot));
        for &e in &board.corners[spot].edges.clone() {
            let neighbor = board.edges[e].other_corner(spot);
            assert!(!remaining.contains(&neighbor));
        }
    }

    #[test]
    fn settlement_cannot_be_replaced_only_upgraded() {
        let mut board = base_board();
        let spot = board.settlement_locations()[0];
        assert!(board.build(1, PieceKind::Settlement, spot));
        assert!(!board.build(2, PieceKind::Settlement, spot));
        assert!(!board.build(2, PieceKind::City, spot));
        assert!(board.build(1, PieceKind::City, spot));
        assert_eq!(
            board.corners[spot].building,
            Some(Building {
                owner: 1,
                kind: BuildingKind::City
            })
        );
        // A city is terminal.
        assert!(!board.build(1, PieceKind::City, spot));
    }

    #[test]
    fn robber_blocks_distribution() {
        let mut board = base_board();
        let tile = board
            .tiles
            .iter()
            .find(|t| t.terrain == Terrain::Mountain && t.number == Some(10))
            .unwrap()
            .id;
        let corner = board.tiles[tile].corner_ids()[0];
        assert!(board.build(1, PieceKind::Settlement, corner));
        let before = board.distribute(10);
        assert!(before
            .iter()
            .any(|y| y.player == 1 && y.resource == Resource::Ore));
        assert!(board.move_robber(tile));
        let after = board.distribute(10);
        assert!(!after
            .iter()
            .any(|y| y.player == 1 && y.resource == Resource::Ore));
    }

    #[test]
    fn cities_yield_double() {
        let mut board = base_board();
        let tile = board
            .tiles
            .iter()
            .find(|t| t.terrain == Terrain::Fields && t.number == Some(12))
            .unwrap()
            .id;
        let corner = board.tiles[tile].corner_ids()[0];
        assert!(board.build(3, PieceKind::Settlement, corner));
        assert!(board.build(3, PieceKind::City, corner));
        let yields = board.distribute(12);
        assert!(yields.contains(&ResourceYield {
            player: 3,
            resource: Resource::Wheat,
            count: 2
        }));
    }

    #[test]
    fn longest_path_blocked_by_opponent_building() {
        let mut board = base_board();
        // A three-edge chain starting from a legal settlement corner.
        let start = board.settlement_locations()[5];
        let mut chain = Vec::new();
        let mut at = start;
        for _ in 0..3 {
            let e = board.corners[at]
                .edges
                .iter()
                .copied()
                .find(|&e| {
                    !chain.contains(&e) && board.edge_touches_land(&board.edges[e])
                })
                .unwrap();
            chain.push(e);
            at = board.edges[e].other_corner(at);
        }
        for &e in &chain {
            assert!(board.build(1, PieceKind::Road, e));
        }
        assert_eq!(board.longest_path_from_roads(1, &chain).len(), 3);

        // An opponent settlement in the middle splits the path.
        let mid = board.edges[chain[0]].other_corner(start);
        board.corners[mid].building = Some(Building {
            owner: 2,
            kind: BuildingKind::Settlement,
        });
        assert_eq!(board.longest_path_from_roads(1, &chain).len(), 2);
    }
}
