//! Fixed control sequences written outside the overlay protocol

/// Hide the cursor, turn on button and drag mouse reporting, clear the screen
pub const SETUP: &[u8] = b"\x1b[?25l\x1b[?1000h\x1b[?1002h\x1b[2J";

/// Undo [`SETUP`] and leave a parting line
pub const TEARDOWN: &[u8] = b"\x1b[?1000l\x1b[?1002l\x1b[?25h\x1b[2J\x1b[H\r\nAquarium session ended.\r\n";

/// Ask the terminal for its window size in pixels (`ESC [ 4 ; H ; W t` answer)
pub const PIXEL_SIZE_QUERY: &[u8] = b"\x1b[14t";
