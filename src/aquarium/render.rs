//! Render diff emitter
//!
//! Turns epoch state into the byte stream broadcast each tick. Fish are
//! re-placed every tick; only bubbles and the chrome track what was drawn
//! before so they can clear it.

use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;

use crate::aquarium::constants::{chrome, sprite};
use crate::aquarium::state::{CellPos, Fish, FishId, Poof, TerminalCapability};
use crate::net::overlay::{self, Placement};
use crate::util::vec2::Vec2;

/// Accumulates one frame of terminal output
#[derive(Debug, Default)]
pub struct RenderBuffer {
    out: Vec<u8>,
}

impl RenderBuffer {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
        }
    }

    fn move_to(&mut self, cell: CellPos) {
        self.out
            .extend_from_slice(format!("\x1b[{};{}H", cell.row, cell.col).as_bytes());
    }

    /// Overwrite one cell with a space
    pub fn clear_cell(&mut self, cell: CellPos) {
        self.move_to(cell);
        self.out.push(b' ');
    }

    /// Erase a whole row
    pub fn clear_row(&mut self, row: u32) {
        self.move_to(CellPos::new(1, row));
        self.out.extend_from_slice(b"\x1b[2K");
    }

    pub fn text(&mut self, cell: CellPos, text: &str) {
        self.move_to(cell);
        self.out.extend_from_slice(text.as_bytes());
    }

    pub fn placement(&mut self, placement: &Placement) {
        self.move_to(CellPos::new(placement.col, placement.row));
        overlay::append_placement(&mut self.out, placement);
    }

    pub fn deletion(&mut self, image_id: u32, placement_id: u32) {
        self.out
            .extend_from_slice(&overlay::encode_deletion(image_id, placement_id));
    }

    pub fn deletion_by_placement(&mut self, placement_id: u32) {
        self.out
            .extend_from_slice(&overlay::encode_deletion_by_placement(placement_id));
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.out
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.out)
    }
}

/// Emit the per-tick diff for one fish.
///
/// Order: expired bubble cells, live bubbles, then the sprite. A facing
/// change deletes the old variant's placement before the new one is placed.
pub fn render_fish(buf: &mut RenderBuffer, fish: &mut Fish, capability: &TerminalCapability) {
    for cell in fish.cleared.drain(..) {
        buf.clear_cell(cell);
    }

    for bubble in fish.bubbles.iter_mut() {
        let (cell, _, _) = capability.locate(bubble.position);
        if let Some(prev) = bubble.prev_cell {
            if prev != cell {
                buf.clear_cell(prev);
            }
        }
        if capability.contains(cell) {
            let mut glyph = [0u8; 4];
            buf.text(cell, bubble.glyph.encode_utf8(&mut glyph));
            bubble.prev_cell = Some(cell);
        } else {
            bubble.prev_cell = None;
        }
    }

    let facing = fish.facing();
    if let Some(previous) = fish.last_facing {
        if previous != facing {
            buf.deletion(previous.image_id(), fish.placement_id());
        }
    }

    let (cell, x_offset, y_offset) = capability.locate(fish.rendered_position());
    buf.placement(&Placement {
        image_id: facing.image_id(),
        placement_id: fish.placement_id(),
        cell_width: capability.cells_wide(sprite::WIDTH as u32),
        cell_height: capability.cells_high(sprite::HEIGHT as u32),
        col: cell.col,
        row: cell.row,
        x_offset,
        y_offset,
    });
    fish.last_facing = Some(facing);
}

/// Render every fish in the table
pub fn render_all(
    buf: &mut RenderBuffer,
    fishes: &mut HashMap<FishId, Fish>,
    capability: &TerminalCapability,
) {
    for fish in fishes.values_mut() {
        render_fish(buf, fish, capability);
    }
}

/// Remove a departing fish: draw its poof, clear its bubbles, delete its
/// placement. Returns the poof so its cells can be cleared later.
pub fn render_departure(buf: &mut RenderBuffer, fish: &Fish, capability: &TerminalCapability) -> Poof {
    let poof = Poof::around(fish.center_cell(capability), capability);
    render_poof(buf, &poof);

    for cell in fish.cleared.iter() {
        buf.clear_cell(*cell);
    }
    for cell in fish.bubbles.iter().filter_map(|b| b.prev_cell) {
        buf.clear_cell(cell);
    }

    match fish.last_facing {
        Some(facing) => buf.deletion(facing.image_id(), fish.placement_id()),
        None => buf.deletion_by_placement(fish.placement_id()),
    }
    poof
}

pub fn render_poof(buf: &mut RenderBuffer, poof: &Poof) {
    let mut glyph = [0u8; 4];
    for (cell, ch) in poof.cells.iter() {
        buf.text(*cell, ch.encode_utf8(&mut glyph));
    }
}

pub fn clear_poof(buf: &mut RenderBuffer, poof: &Poof) {
    for (cell, _) in poof.cells.iter() {
        buf.clear_cell(*cell);
    }
}

/// Tile the floor image across the floor row
pub fn render_floor(buf: &mut RenderBuffer, capability: &TerminalCapability, tile_index: usize) {
    let tile_width = capability.cells_wide(chrome::FLOOR_TILE_PIXELS);
    let tile_height = capability.cells_high(chrome::FLOOR_TILE_PIXELS);
    let row = capability.floor_row();
    let image_id = chrome::FLOOR_IMAGE_BASE + (tile_index % chrome::FLOOR_TILE_COUNT) as u32;

    for i in 0..capability.columns.div_ceil(tile_width) {
        buf.placement(&Placement {
            image_id,
            placement_id: chrome::FLOOR_PLACEMENT_BASE + i,
            cell_width: tile_width,
            cell_height: tile_height,
            col: i * tile_width + 1,
            row,
            x_offset: 0,
            y_offset: 0,
        });
    }
}

/// Redraw the status row: owner names under their fish, epoch age on the right
pub fn render_status<'a>(
    buf: &mut RenderBuffer,
    capability: &TerminalCapability,
    fishes: impl IntoIterator<Item = &'a Fish>,
    age: Duration,
) {
    let row = capability.status_row();
    let columns = capability.columns as usize;
    buf.clear_row(row);

    for fish in fishes {
        let name: String = fish
            .owner_name
            .chars()
            .take(chrome::MAX_NAME_LEN.min(columns))
            .collect();
        if name.is_empty() {
            continue;
        }
        let len = name.chars().count();
        let center = capability
            .locate(fish.position + Vec2::new(sprite::WIDTH / 2.0, 0.0))
            .0
            .col as usize;
        let start = center
            .saturating_sub(len / 2)
            .clamp(1, (columns + 1).saturating_sub(len).max(1));
        buf.text(CellPos::new(start as u32, row), &name);
    }

    let age = format_age(age);
    let col = (columns + 1).saturating_sub(age.len()).max(1);
    buf.text(CellPos::new(col as u32, row), &age);
}

/// Compact epoch age: `42s`, `7m`, `3h`
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs_f64();
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        format!("{:.0}m", secs / 60.0)
    } else {
        format!("{:.0}h", secs / 3600.0)
    }
}
