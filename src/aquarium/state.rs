//! Aquarium state definitions
//!
//! Passive data for one epoch: the negotiated terminal capability and the
//! layout derived from it, fish, their bubbles, and poof bursts.

use std::fmt;

use rand::Rng;
use smallvec::SmallVec;

use crate::aquarium::constants::{bubble, chrome, motion, poof, spawn_speed_range, sprite, terminal};
use crate::util::vec2::Vec2;

/// Opaque, monotonically increasing session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Fish identifier; doubles as the fish's overlay placement id
pub type FishId = u32;

/// Character grid size as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub columns: u32,
    pub rows: u32,
}

impl GridSize {
    pub const DEFAULT: GridSize = GridSize {
        columns: 80,
        rows: 24,
    };

    pub fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    pub fn is_known(&self) -> bool {
        self.columns > 0 && self.rows > 0
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// 1-based terminal cell coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellPos {
    pub col: u32,
    pub row: u32,
}

impl CellPos {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Epoch-wide terminal geometry, fixed once negotiation resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalCapability {
    pub columns: u32,
    pub rows: u32,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl TerminalCapability {
    /// Used whenever the terminal does not answer the pixel-size query
    pub const DEFAULT: TerminalCapability = TerminalCapability {
        columns: 80,
        rows: 24,
        cell_width: 8,
        cell_height: 16,
    };

    /// Derive cell size from a window pixel report and the character grid.
    ///
    /// Cell dimensions are rounded to the nearest pixel and never drop below 1.
    /// A report implying cells larger than `MAX_CELL_PIXELS` is not believed
    /// and yields [`TerminalCapability::DEFAULT`].
    pub fn from_pixel_report(grid: GridSize, pixel_width: u32, pixel_height: u32) -> Self {
        let grid = if grid.is_known() { grid } else { GridSize::DEFAULT };
        let per_cell = |pixels: u32, cells: u32| -> u32 {
            ((pixels as f64 / cells as f64).round() as u32).max(1)
        };
        let cell_width = per_cell(pixel_width, grid.columns);
        let cell_height = per_cell(pixel_height, grid.rows);
        if cell_width > terminal::MAX_CELL_PIXELS || cell_height > terminal::MAX_CELL_PIXELS {
            return Self::DEFAULT;
        }
        Self {
            columns: grid.columns,
            rows: grid.rows,
            cell_width,
            cell_height,
        }
    }

    pub fn canvas_width(&self) -> f32 {
        self.columns as f32 * self.cell_width as f32
    }

    pub fn canvas_height(&self) -> f32 {
        self.rows as f32 * self.cell_height as f32
    }

    /// Cells needed to cover `pixels` horizontally
    pub fn cells_wide(&self, pixels: u32) -> u32 {
        pixels.div_ceil(self.cell_width).max(1)
    }

    /// Cells needed to cover `pixels` vertically
    pub fn cells_high(&self, pixels: u32) -> u32 {
        pixels.div_ceil(self.cell_height).max(1)
    }

    /// Last row; reserved for the status bar
    pub fn status_row(&self) -> u32 {
        self.rows
    }

    /// First row of the floor tiles, kept clear of the status row
    pub fn floor_row(&self) -> u32 {
        let tile_rows = self.cells_high(chrome::FLOOR_TILE_PIXELS);
        let row = if tile_rows > 1 {
            self.rows.saturating_sub(tile_rows)
        } else {
            self.rows.saturating_sub(1)
        };
        row.max(1)
    }

    /// Pixel height available to fish (everything above the floor)
    pub fn usable_height(&self) -> f32 {
        (self.floor_row() - 1) as f32 * self.cell_height as f32
    }

    /// Rectangle the top-left corner of a sprite must stay within
    pub fn bounds(&self) -> Bounds {
        Bounds {
            max_x: (self.canvas_width() - sprite::WIDTH).max(0.0),
            max_y: (self.usable_height() - sprite::HEIGHT).max(0.0),
        }
    }

    /// Cell containing a pixel, plus the pixel offset inside that cell
    pub fn locate(&self, point: Vec2) -> (CellPos, u32, u32) {
        let x = point.x.max(0.0) as u32;
        let y = point.y.max(0.0) as u32;
        (
            CellPos::new(x / self.cell_width + 1, y / self.cell_height + 1),
            x % self.cell_width,
            y % self.cell_height,
        )
    }

    /// Top-left pixel of a 1-based cell
    pub fn cell_origin(&self, cell: CellPos) -> Vec2 {
        Vec2::new(
            cell.col.saturating_sub(1) as f32 * self.cell_width as f32,
            cell.row.saturating_sub(1) as f32 * self.cell_height as f32,
        )
    }

    pub fn contains(&self, cell: CellPos) -> bool {
        (1..=self.columns).contains(&cell.col) && (1..=self.rows).contains(&cell.row)
    }
}

/// Allowed range of a sprite's top-left corner: `[0, max_x] x [0, max_y]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub max_x: f32,
    pub max_y: f32,
}

/// Which pre-uploaded sprite represents a fish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Left,
    Right,
}

impl Facing {
    pub fn from_velocity(velocity: Vec2) -> Self {
        if velocity.x > 0.0 {
            Facing::Right
        } else {
            Facing::Left
        }
    }

    pub fn image_id(&self) -> u32 {
        match self {
            Facing::Left => sprite::LEFT_IMAGE_ID,
            Facing::Right => sprite::RIGHT_IMAGE_ID,
        }
    }
}

/// Stepped bob: four buckets of the integer phase map to {0, A/2, A, A/2}
pub fn stepped_bob(phase: f32) -> f32 {
    let bucket = (phase.max(0.0).floor() as u64) % motion::BOB_STEPS as u64;
    match bucket {
        0 => 0.0,
        2 => motion::BOB_AMPLITUDE,
        _ => motion::BOB_AMPLITUDE / 2.0,
    }
}

/// A bubble rising from its fish
#[derive(Debug, Clone, PartialEq)]
pub struct Bubble {
    pub position: Vec2,
    pub glyph: char,
    /// Cell the bubble was last drawn in, cleared before it is redrawn
    pub prev_cell: Option<CellPos>,
}

impl Bubble {
    pub fn new(position: Vec2, glyph: char) -> Self {
        Self {
            position,
            glyph,
            prev_cell: None,
        }
    }

    pub fn random_glyph<R: Rng>(rng: &mut R) -> char {
        bubble::GLYPHS[rng.gen_range(0..bubble::GLYPHS.len())]
    }
}

/// A fish owned by exactly one session
#[derive(Debug, Clone)]
pub struct Fish {
    pub position: Vec2,
    pub velocity: Vec2,
    pub bob_phase: f32,
    pub bubbles: SmallVec<[Bubble; 8]>,
    /// Cells of bubbles that expired this tick and still need clearing
    pub cleared: Vec<CellPos>,
    /// Sprite variant of the last emitted placement
    pub last_facing: Option<Facing>,
    pub id: FishId,
    pub owner: SessionId,
    pub owner_name: String,
}

impl Fish {
    /// Spawn at a random spot inside the usable area with a small random drift
    pub fn spawn<R: Rng>(
        id: FishId,
        owner: SessionId,
        owner_name: String,
        capability: &TerminalCapability,
        rng: &mut R,
    ) -> Self {
        let bounds = capability.bounds();
        let speed_x = spawn_speed_range(capability.cell_width, motion::SPAWN_SPEED_X);
        let speed_y = spawn_speed_range(capability.cell_height, motion::SPAWN_SPEED_Y);
        Self {
            position: Vec2::new(
                rng.gen::<f32>() * bounds.max_x,
                rng.gen::<f32>() * bounds.max_y,
            ),
            velocity: Vec2::new(
                (rng.gen::<f32>() - 0.5) * speed_x,
                (rng.gen::<f32>() - 0.5) * speed_y,
            ),
            bob_phase: rng.gen::<f32>() * 100.0,
            bubbles: SmallVec::new(),
            cleared: Vec::new(),
            last_facing: None,
            id,
            owner,
            owner_name,
        }
    }

    pub fn placement_id(&self) -> u32 {
        self.id
    }

    pub fn facing(&self) -> Facing {
        Facing::from_velocity(self.velocity)
    }

    pub fn bob_offset(&self) -> f32 {
        stepped_bob(self.bob_phase)
    }

    /// Where the sprite is drawn: physics position plus the bob offset
    pub fn rendered_position(&self) -> Vec2 {
        Vec2::new(self.position.x, self.position.y + self.bob_offset())
    }

    /// Whether a pixel lies on the sprite as currently drawn (edges inclusive)
    pub fn hit_test(&self, point: Vec2) -> bool {
        let origin = self.rendered_position();
        point.x >= origin.x
            && point.x <= origin.x + sprite::WIDTH
            && point.y >= origin.y
            && point.y <= origin.y + sprite::HEIGHT
    }

    /// Add a bubble unless the fish already carries the maximum
    pub fn push_bubble(&mut self, bubble: Bubble) -> bool {
        if self.bubbles.len() >= bubble::MAX_PER_FISH {
            return false;
        }
        self.bubbles.push(bubble);
        true
    }

    /// Drop the oldest bubbles until `count` more fit. Cells they were drawn
    /// in are queued for clearing.
    pub fn make_room(&mut self, count: usize) {
        let keep = bubble::MAX_PER_FISH.saturating_sub(count);
        if self.bubbles.len() <= keep {
            return;
        }
        let excess = self.bubbles.len() - keep;
        for old in self.bubbles.drain(..excess) {
            if let Some(cell) = old.prev_cell {
                self.cleared.push(cell);
            }
        }
    }

    /// Cell at the centre of the sprite
    pub fn center_cell(&self, capability: &TerminalCapability) -> CellPos {
        let center = self.position + Vec2::new(sprite::WIDTH / 2.0, sprite::HEIGHT / 2.0);
        capability.locate(center).0
    }
}

/// Short-lived burst drawn where a fish left the aquarium
#[derive(Debug, Clone, PartialEq)]
pub struct Poof {
    pub cells: Vec<(CellPos, char)>,
    pub ttl: u32,
}

impl Poof {
    /// Ring of glyphs around `center`, clipped to the grid
    pub fn around(center: CellPos, capability: &TerminalCapability) -> Self {
        const RING: [(i64, i64); 8] = [
            (0, -1),
            (2, -1),
            (3, 0),
            (2, 1),
            (0, 1),
            (-2, 1),
            (-3, 0),
            (-2, -1),
        ];
        let cells = std::iter::once((0i64, 0i64))
            .chain(RING)
            .enumerate()
            .filter_map(|(i, (dc, dr))| {
                let col = center.col as i64 + dc;
                let row = center.row as i64 + dr;
                if col < 1 || row < 1 {
                    return None;
                }
                let cell = CellPos::new(col as u32, row as u32);
                capability
                    .contains(cell)
                    .then_some((cell, poof::GLYPHS[i % poof::GLYPHS.len()]))
            })
            .collect();
        Self {
            cells,
            ttl: poof::LIFETIME_TICKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_capability_from_report_rounds() {
        let cap = TerminalCapability::from_pixel_report(GridSize::new(100, 30), 1005, 602);
        assert_eq!(cap.cell_width, 10);
        assert_eq!(cap.cell_height, 20);
        assert_eq!(cap.columns, 100);
        assert_eq!(cap.rows, 30);

        let cap = TerminalCapability::from_pixel_report(GridSize::new(100, 30), 1060, 585);
        assert_eq!(cap.cell_width, 11);
        assert_eq!(cap.cell_height, 20);
    }

    #[test]
    fn test_capability_from_report_minimum_one() {
        let cap = TerminalCapability::from_pixel_report(GridSize::new(80, 24), 0, 3);
        assert_eq!(cap.cell_width, 1);
        assert_eq!(cap.cell_height, 1);
    }

    #[test]
    fn test_capability_rejects_huge_cells() {
        let cap = TerminalCapability::from_pixel_report(GridSize::new(2, 1), 4_294_967_295, 16);
        assert_eq!(cap, TerminalCapability::DEFAULT);
        let cap = TerminalCapability::from_pixel_report(GridSize::new(80, 24), 800, 4_294_967_295);
        assert_eq!(cap, TerminalCapability::DEFAULT);
    }

    #[test]
    fn test_layout_math_on_large_canvas() {
        let max = terminal::MAX_CELL_PIXELS;
        let cap = TerminalCapability::from_pixel_report(GridSize::new(65_535, 65_535), 65_535 * max, 65_535 * max);
        assert_eq!(cap.cell_width, max);
        assert_eq!(cap.cell_height, max);
        assert_eq!(cap.canvas_width(), 65_535.0 * max as f32);
        assert!(cap.usable_height() > 0.0);
        let origin = cap.cell_origin(CellPos::new(60_000, 60_000));
        assert_eq!(origin.x, 59_999.0 * max as f32);
        assert_eq!(origin.y, 59_999.0 * max as f32);
    }

    #[test]
    fn test_capability_unknown_grid_uses_default_grid() {
        let cap = TerminalCapability::from_pixel_report(GridSize::new(0, 0), 640, 384);
        assert_eq!(cap, TerminalCapability::DEFAULT);
    }

    #[test]
    fn test_layout_reserves_floor_and_status() {
        let cap = TerminalCapability::DEFAULT;
        // 48px tiles on 16px cells: three floor rows above the status row.
        assert_eq!(cap.cells_high(chrome::FLOOR_TILE_PIXELS), 3);
        assert_eq!(cap.floor_row(), 21);
        assert_eq!(cap.status_row(), 24);
        assert_eq!(cap.usable_height(), 320.0);
        let bounds = cap.bounds();
        assert_eq!(bounds.max_x, 640.0 - sprite::WIDTH);
        assert_eq!(bounds.max_y, 320.0 - sprite::HEIGHT);
    }

    #[test]
    fn test_tiny_terminal_bounds_collapse_to_zero() {
        let cap = TerminalCapability {
            columns: 4,
            rows: 3,
            cell_width: 8,
            cell_height: 16,
        };
        let bounds = cap.bounds();
        assert_eq!(bounds.max_x, 0.0);
        assert_eq!(bounds.max_y, 0.0);
    }

    #[test]
    fn test_locate() {
        let cap = TerminalCapability::DEFAULT;
        let (cell, dx, dy) = cap.locate(Vec2::new(17.5, 33.0));
        assert_eq!(cell, CellPos::new(3, 3));
        assert_eq!(dx, 1);
        assert_eq!(dy, 1);
        assert_eq!(cap.cell_origin(cell), Vec2::new(16.0, 32.0));
    }

    #[test]
    fn test_stepped_bob_levels() {
        let half = motion::BOB_AMPLITUDE / 2.0;
        assert_eq!(stepped_bob(0.2), 0.0);
        assert_eq!(stepped_bob(1.9), half);
        assert_eq!(stepped_bob(2.0), motion::BOB_AMPLITUDE);
        assert_eq!(stepped_bob(3.5), half);
        assert_eq!(stepped_bob(4.1), 0.0);
    }

    #[test]
    fn test_facing_from_velocity() {
        assert_eq!(Facing::from_velocity(Vec2::new(1.0, 0.0)), Facing::Right);
        assert_eq!(Facing::from_velocity(Vec2::new(-1.0, 0.0)), Facing::Left);
        assert_eq!(Facing::from_velocity(Vec2::ZERO), Facing::Left);
        assert_ne!(Facing::Left.image_id(), Facing::Right.image_id());
    }

    #[test]
    fn test_spawn_inside_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let cap = TerminalCapability::DEFAULT;
        let bounds = cap.bounds();
        for id in 1..200 {
            let fish = Fish::spawn(id, SessionId(1), "ann".into(), &cap, &mut rng);
            assert!(fish.position.x >= 0.0 && fish.position.x <= bounds.max_x);
            assert!(fish.position.y >= 0.0 && fish.position.y <= bounds.max_y);
            assert!(fish.last_facing.is_none());
            assert_eq!(fish.placement_id(), id);
        }
    }

    #[test]
    fn test_hit_test_uses_bobbed_rect() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut fish = Fish::spawn(1, SessionId(1), "ann".into(), &TerminalCapability::DEFAULT, &mut rng);
        fish.position = Vec2::new(100.0, 100.0);
        fish.bob_phase = 2.5; // full amplitude
        let drop = motion::BOB_AMPLITUDE;

        // Just above the drawn sprite, although inside the un-bobbed rectangle.
        assert!(!fish.hit_test(Vec2::new(110.0, 100.0 + drop - 1.0)));
        assert!(fish.hit_test(Vec2::new(110.0, 100.0 + drop)));
        assert!(fish.hit_test(Vec2::new(100.0 + sprite::WIDTH, 100.0 + drop + sprite::HEIGHT)));
    }

    #[test]
    fn test_push_bubble_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut fish = Fish::spawn(1, SessionId(1), "ann".into(), &TerminalCapability::DEFAULT, &mut rng);
        for _ in 0..bubble::MAX_PER_FISH {
            assert!(fish.push_bubble(Bubble::new(Vec2::new(1.0, 1.0), 'o')));
        }
        assert!(!fish.push_bubble(Bubble::new(Vec2::new(1.0, 1.0), 'o')));
        assert_eq!(fish.bubbles.len(), bubble::MAX_PER_FISH);
    }

    #[test]
    fn test_make_room_evicts_oldest() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut fish = Fish::spawn(1, SessionId(1), "ann".into(), &TerminalCapability::DEFAULT, &mut rng);
        for i in 0..bubble::MAX_PER_FISH {
            let mut b = Bubble::new(Vec2::new(1.0, i as f32), 'o');
            b.prev_cell = Some(CellPos::new(1, i as u32 + 1));
            fish.bubbles.push(b);
        }

        fish.make_room(3);
        assert_eq!(fish.bubbles.len(), bubble::MAX_PER_FISH - 3);
        assert_eq!(fish.bubbles[0].position.y, 3.0);
        assert_eq!(fish.cleared, vec![CellPos::new(1, 1), CellPos::new(1, 2), CellPos::new(1, 3)]);

        // Enough room already: nothing goes
        fish.cleared.clear();
        fish.make_room(3);
        assert_eq!(fish.bubbles.len(), bubble::MAX_PER_FISH - 3);
        assert!(fish.cleared.is_empty());
    }

    #[test]
    fn test_poof_clipped_to_grid() {
        let cap = TerminalCapability::DEFAULT;
        let corner = Poof::around(CellPos::new(1, 1), &cap);
        assert!(corner.cells.iter().all(|(c, _)| cap.contains(*c)));
        assert!(corner.cells.len() < 9);

        let middle = Poof::around(CellPos::new(40, 10), &cap);
        assert_eq!(middle.cells.len(), 9);
        assert_eq!(middle.ttl, poof::LIFETIME_TICKS);
    }
}
