//! Core grid-world types and pure helpers shared across the GridBot workspace.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use thiserror::Error;

/// High level simulation clock (discrete time steps advanced by the host
/// environment). Monotonic in normal operation, but the value may jump
/// forward when ticks are skipped and may move backward after a restart.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Ticks elapsed since `earlier`, clamped to zero when the clock has
    /// moved backward.
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the current tick, owned by the host environment.
pub trait TickClock {
    /// The tick the host is currently executing.
    fn now(&self) -> Tick;
}

/// Settable clock for tests and demos.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: Cell<u64>,
}

impl ManualClock {
    /// Create a clock starting at the given tick.
    #[must_use]
    pub fn new(start: Tick) -> Self {
        Self {
            current: Cell::new(start.0),
        }
    }

    /// Move the clock to an arbitrary tick, forward or backward.
    pub fn set(&self, tick: Tick) {
        self.current.set(tick.0);
    }

    /// Advance the clock by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.current.set(self.current.get() + ticks);
    }
}

impl TickClock for ManualClock {
    fn now(&self) -> Tick {
        Tick(self.current.get())
    }
}

/// A tile coordinate inside a named region of the grid world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub region: String,
}

impl GridPos {
    /// Construct a new position.
    #[must_use]
    pub fn new(x: i32, y: i32, region: impl Into<String>) -> Self {
        Self {
            x,
            y,
            region: region.into(),
        }
    }

    /// The position offset by `(dx, dy)` within the same region.
    #[must_use]
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            region: self.region.clone(),
        }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {},{}]", self.region, self.x, self.y)
    }
}

/// Terrain classification of a tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TerrainKind {
    Plain,
    Wall,
    Swamp,
}

/// Constructed structures that can occupy a tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Road,
    Spawn,
    Extension,
}

/// One feature occupying a tile, as reported by the host world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum TileFeature {
    Terrain(TerrainKind),
    Structure(StructureKind),
}

/// Read access to the host world's terrain and structure occupancy.
pub trait WorldTerrain {
    /// Every feature occupying the given tile. An unknown or empty tile
    /// reports no features.
    fn features_at(&self, pos: &GridPos) -> Vec<TileFeature>;
}

/// Errors raised by the geometry helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The two positions lie in different named regions; cross-region
    /// distance is undefined.
    #[error("positions {0} and {1} lie in different regions")]
    RegionMismatch(String, String),
}

/// Euclidean distance between two positions in the same region.
pub fn distance(a: &GridPos, b: &GridPos) -> Result<f64, GeometryError> {
    check_same_region(a, b)?;
    let dx = f64::from(b.x - a.x);
    let dy = f64::from(b.y - a.y);
    Ok((dx * dx + dy * dy).sqrt())
}

/// Manhattan distance between two positions in the same region.
pub fn manhattan_distance(a: &GridPos, b: &GridPos) -> Result<u32, GeometryError> {
    check_same_region(a, b)?;
    Ok(a.x.abs_diff(b.x) + a.y.abs_diff(b.y))
}

fn check_same_region(a: &GridPos, b: &GridPos) -> Result<(), GeometryError> {
    if a.region == b.region {
        Ok(())
    } else {
        Err(GeometryError::RegionMismatch(
            a.region.clone(),
            b.region.clone(),
        ))
    }
}

// Interior band within which all 8 neighbors of a tile can be sampled.
const NEIGHBOR_MIN_X: i32 = 1;
const NEIGHBOR_MAX_X: i32 = 48;
const NEIGHBOR_MIN_Y: i32 = 1;
const NEIGHBOR_MAX_Y: i32 = 49;

/// Counts empty tiles around a position.
///
/// Everything that does not carry wall terrain counts as free space. Returns
/// `None` when the position sits outside the interior band where the full
/// 3×3 neighborhood exists.
pub fn empty_tiles_around(world: &dyn WorldTerrain, pos: &GridPos) -> Option<u8> {
    if pos.x < NEIGHBOR_MIN_X
        || pos.x > NEIGHBOR_MAX_X
        || pos.y < NEIGHBOR_MIN_Y
        || pos.y > NEIGHBOR_MAX_Y
    {
        return None;
    }

    let mut spaces = 0;
    for dy in -1..=1 {
        for dx in -1..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            if !has_wall(&world.features_at(&pos.offset(dx, dy))) {
                spaces += 1;
            }
        }
    }
    Some(spaces)
}

fn has_wall(features: &[TileFeature]) -> bool {
    features
        .iter()
        .any(|feature| matches!(feature, TileFeature::Terrain(TerrainKind::Wall)))
}

/// Per-category tile totals produced by [`examine_path`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathProfile {
    pub normal: u32,
    pub road: u32,
    pub swamp: u32,
}

impl PathProfile {
    /// Total number of tiles classified.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.normal + self.road + self.swamp
    }
}

/// Classifies each tile along a path as exactly one of swamp, road, or
/// normal. Swamp terrain takes priority over a constructed road on the same
/// tile.
pub fn examine_path(world: &dyn WorldTerrain, path: &[GridPos]) -> PathProfile {
    let mut profile = PathProfile::default();
    for pos in path {
        let features = world.features_at(pos);
        let swamp = features
            .iter()
            .any(|feature| matches!(feature, TileFeature::Terrain(TerrainKind::Swamp)));
        let road = features
            .iter()
            .any(|feature| matches!(feature, TileFeature::Structure(StructureKind::Road)));
        if swamp {
            profile.swamp += 1;
        } else if road {
            profile.road += 1;
        } else {
            profile.normal += 1;
        }
    }
    profile
}

/// Body parts an agent can be assembled from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BodyPart {
    Move,
    Work,
    Carry,
    Attack,
    RangedAttack,
    Heal,
    Claim,
    Tough,
}

impl BodyPart {
    /// Energy cost of assembling this part.
    #[must_use]
    pub const fn cost(self) -> u32 {
        match self {
            Self::Move | Self::Carry => 50,
            Self::Work => 100,
            Self::Attack => 80,
            Self::RangedAttack => 150,
            Self::Heal => 250,
            Self::Claim => 600,
            Self::Tough => 10,
        }
    }

    /// Parse a part from its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "move" => Some(Self::Move),
            "work" => Some(Self::Work),
            "carry" => Some(Self::Carry),
            "attack" => Some(Self::Attack),
            "ranged_attack" => Some(Self::RangedAttack),
            "heal" => Some(Self::Heal),
            "claim" => Some(Self::Claim),
            "tough" => Some(Self::Tough),
            _ => None,
        }
    }

    /// Wire name of this part.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Work => "work",
            Self::Carry => "carry",
            Self::Attack => "attack",
            Self::RangedAttack => "ranged_attack",
            Self::Heal => "heal",
            Self::Claim => "claim",
            Self::Tough => "tough",
        }
    }
}

/// Total energy cost of assembling an agent from the named parts.
///
/// Any unknown part name invalidates the whole list; no partial sum is
/// reported.
pub fn build_cost<'a, I>(part_names: I) -> Option<u32>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut cost = 0;
    for name in part_names {
        cost += BodyPart::from_name(name)?.cost();
    }
    Some(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeWorld {
        tiles: HashMap<(i32, i32), Vec<TileFeature>>,
    }

    impl FakeWorld {
        fn new() -> Self {
            Self {
                tiles: HashMap::new(),
            }
        }

        fn put(&mut self, x: i32, y: i32, feature: TileFeature) {
            self.tiles.entry((x, y)).or_default().push(feature);
        }
    }

    impl WorldTerrain for FakeWorld {
        fn features_at(&self, pos: &GridPos) -> Vec<TileFeature> {
            self.tiles.get(&(pos.x, pos.y)).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn tick_arithmetic() {
        assert_eq!(Tick::zero().next(), Tick(1));
        assert_eq!(Tick(7).saturating_since(Tick(3)), 4);
        assert_eq!(Tick(3).saturating_since(Tick(7)), 0);
    }

    #[test]
    fn manual_clock_moves_both_directions() {
        let clock = ManualClock::new(Tick(10));
        assert_eq!(clock.now(), Tick(10));
        clock.advance(5);
        assert_eq!(clock.now(), Tick(15));
        clock.set(Tick(2));
        assert_eq!(clock.now(), Tick(2));
    }

    #[test]
    fn distance_within_region() {
        let a = GridPos::new(0, 0, "A");
        let b = GridPos::new(3, 4, "A");
        let d = distance(&a, &b).expect("same region");
        assert!((d - 5.0).abs() < f64::EPSILON);
        assert_eq!(manhattan_distance(&a, &b), Ok(7));
    }

    #[test]
    fn distance_across_regions_is_undefined() {
        let a = GridPos::new(0, 0, "A");
        let b = GridPos::new(3, 4, "B");
        assert_eq!(
            distance(&a, &b),
            Err(GeometryError::RegionMismatch("A".into(), "B".into()))
        );
        assert!(manhattan_distance(&a, &b).is_err());
    }

    #[test]
    fn empty_tiles_rejects_border_positions() {
        let world = FakeWorld::new();
        assert_eq!(
            empty_tiles_around(&world, &GridPos::new(0, 1, "A")),
            None,
            "x below the interior band"
        );
        assert_eq!(empty_tiles_around(&world, &GridPos::new(49, 1, "A")), None);
        assert_eq!(empty_tiles_around(&world, &GridPos::new(1, 0, "A")), None);
        assert_eq!(empty_tiles_around(&world, &GridPos::new(1, 50, "A")), None);
    }

    #[test]
    fn empty_tiles_counts_non_wall_neighbors() {
        let mut world = FakeWorld::new();
        world.put(9, 9, TileFeature::Terrain(TerrainKind::Wall));
        world.put(10, 9, TileFeature::Terrain(TerrainKind::Swamp));
        world.put(11, 10, TileFeature::Structure(StructureKind::Road));
        let count = empty_tiles_around(&world, &GridPos::new(10, 10, "A"));
        assert_eq!(count, Some(7), "only the wall blocks a neighbor");
    }

    #[test]
    fn empty_tiles_fully_walled_in() {
        let mut world = FakeWorld::new();
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx != 0 || dy != 0 {
                    world.put(5 + dx, 5 + dy, TileFeature::Terrain(TerrainKind::Wall));
                }
            }
        }
        assert_eq!(empty_tiles_around(&world, &GridPos::new(5, 5, "A")), Some(0));
    }

    #[test]
    fn examine_path_classifies_each_tile_once() {
        let mut world = FakeWorld::new();
        world.put(1, 1, TileFeature::Structure(StructureKind::Road));
        world.put(2, 1, TileFeature::Terrain(TerrainKind::Swamp));
        let path = vec![
            GridPos::new(1, 1, "A"),
            GridPos::new(2, 1, "A"),
            GridPos::new(3, 1, "A"),
        ];
        let profile = examine_path(&world, &path);
        assert_eq!(
            profile,
            PathProfile {
                normal: 1,
                road: 1,
                swamp: 1,
            }
        );
        assert_eq!(profile.total(), 3);
    }

    #[test]
    fn examine_path_swamp_beats_road() {
        let mut world = FakeWorld::new();
        world.put(4, 4, TileFeature::Structure(StructureKind::Road));
        world.put(4, 4, TileFeature::Terrain(TerrainKind::Swamp));
        let profile = examine_path(&world, &[GridPos::new(4, 4, "A")]);
        assert_eq!(profile.swamp, 1);
        assert_eq!(profile.road, 0);
    }

    #[test]
    fn build_cost_sums_known_parts() {
        assert_eq!(build_cost(["move", "work", "carry"]), Some(200));
        assert_eq!(build_cost(["tough", "claim"]), Some(610));
        assert_eq!(build_cost([]), Some(0));
    }

    #[test]
    fn build_cost_rejects_unknown_parts_wholesale() {
        assert_eq!(build_cost(["move", "wings"]), None);
        assert_eq!(BodyPart::from_name("wings"), None);
    }

    #[test]
    fn body_part_names_round_trip() {
        for part in [
            BodyPart::Move,
            BodyPart::Work,
            BodyPart::Carry,
            BodyPart::Attack,
            BodyPart::RangedAttack,
            BodyPart::Heal,
            BodyPart::Claim,
            BodyPart::Tough,
        ] {
            assert_eq!(BodyPart::from_name(part.name()), Some(part));
        }
    }
}
