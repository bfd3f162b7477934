/// Fish sprite geometry - the uploaded PNGs are drawn at their native size
pub mod sprite {
    /// Sprite width in pixels
    pub const WIDTH: f32 = 64.0;
    /// Sprite height in pixels
    pub const HEIGHT: f32 = 36.0;
    /// Image id of the left-facing sprite
    pub const LEFT_IMAGE_ID: u32 = 1;
    /// Image id of the right-facing sprite
    pub const RIGHT_IMAGE_ID: u32 = 2;
}

/// Fish motion constants
pub mod motion {
    /// Bob amplitude in pixels (the full step of the stepped bob)
    pub const BOB_AMPLITUDE: f32 = 12.0;
    /// Bob phase advance per second (one bucket every ~0.4s)
    pub const BOB_FREQUENCY: f32 = 2.4;
    /// Number of discrete bob buckets per cycle
    pub const BOB_STEPS: u32 = 4;
    /// Initial horizontal speed range, in cell widths per second
    pub const SPAWN_SPEED_X: f32 = 2.4;
    /// Initial vertical speed range, in cell heights per second
    pub const SPAWN_SPEED_Y: f32 = 0.6;
    /// Angles (degrees) a clicked fish may turn by
    pub const CLICK_TURN_ANGLES: [f32; 3] = [90.0, 180.0, 260.0];
}

/// Bubble constants
pub mod bubble {
    /// Spawn probability per fish per second
    pub const SPAWN_RATE: f32 = 0.03;
    /// Upward speed in pixels per second
    pub const SPEED: f32 = 120.0;
    /// Glyphs a bubble may be drawn with
    pub const GLYPHS: [char; 4] = ['°', 'o', 'O', '•'];
    /// Bubbles released by a click on your own fish
    pub const CLICK_BURST: usize = 3;
    /// Vertical spacing between burst bubbles (pixels)
    pub const BURST_SPACING: f32 = 5.0;
    /// Horizontal jitter of burst bubbles around the fish centre (pixels)
    pub const BURST_JITTER: f32 = 20.0;
    /// Bubbles start this far above the fish (pixels)
    pub const SPAWN_LIFT: f32 = 2.0;
    /// Live bubbles a single fish may carry; spawns beyond this are dropped
    pub const MAX_PER_FISH: usize = 32;
}

/// Floor and status bar chrome
pub mod chrome {
    /// Number of floor tile images (image ids start at `FLOOR_IMAGE_BASE`)
    pub const FLOOR_TILE_COUNT: usize = 6;
    /// First floor tile image id
    pub const FLOOR_IMAGE_BASE: u32 = 10;
    /// Floor tile edge in pixels
    pub const FLOOR_TILE_PIXELS: u32 = 48;
    /// First placement id used by floor tiles
    pub const FLOOR_PLACEMENT_BASE: u32 = 1000;
    /// Placement ids from the base up to here are never handed to fish
    pub const FLOOR_PLACEMENT_END: u32 = 2000;
    /// Status bar refresh interval in milliseconds
    pub const STATUS_INTERVAL_MS: u64 = 1000;
    /// Longest owner name shown in the status bar
    pub const MAX_NAME_LEN: usize = 12;
}

/// Poof burst shown when a fish leaves the aquarium
pub mod poof {
    /// Glyph ring drawn around the fish centre
    pub const GLYPHS: [char; 4] = ['*', '·', '°', '+'];
    /// Ticks the burst stays on screen before its cells are cleared
    pub const LIFETIME_TICKS: u32 = 10;
}

/// Limits on what a terminal may report about itself
pub mod terminal {
    /// Largest believable cell edge in pixels
    pub const MAX_CELL_PIXELS: u32 = 1024;
}

/// Scheduler cadence
pub mod timing {
    /// Normal tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Debug tick rate in Hz
    pub const DEBUG_TICK_RATE: u32 = 1;
    /// How long epoch teardown waits for the scheduler before aborting it (ms)
    pub const SCHEDULER_STOP_TIMEOUT_MS: u64 = 2000;
    /// Largest dt fed to physics; a stalled scheduler must not teleport fish
    pub const MAX_DT: f32 = 0.25;
}

/// Convert a velocity bound expressed in cells into pixels per second
pub fn spawn_speed_range(cell_size: u32, fraction: f32) -> f32 {
    fraction * cell_size as f32
}
