//! Inbound byte stream decoding
//!
//! The session's inbound stream has no framing of its own: pixel-size
//! reports, mouse reports and keystrokes arrive interleaved and may be split
//! across reads. [`InputDecoder`] buffers partial escape sequences and yields
//! complete logical events.

/// Longest partial escape sequence kept between reads
const MAX_PENDING: usize = 64;

const ESC: u8 = 0x1b;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

/// Window size in pixels, as answered to the `CSI 14 t` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelReport {
    pub width: u32,
    pub height: u32,
}

/// Decoded X10 mouse report (`ESC [ M b c r`, each byte offset by 32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEvent {
    pub button: u8,
    /// 1-based column
    pub col: u32,
    /// 1-based row
    pub row: u32,
}

impl PointerEvent {
    /// Left button pressed, without motion or modifier bits
    pub fn is_left_press(&self) -> bool {
        self.button == 0
    }
}

/// Logical events carried by the inbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    PixelSize(PixelReport),
    Pointer(PointerEvent),
    Disconnect,
}

/// Outcome of trying to decode one sequence at the head of the buffer
enum Step {
    Event(InputEvent, usize),
    Skip(usize),
    NeedMore,
}

/// Per-session incremental decoder
#[derive(Debug, Default)]
pub struct InputDecoder {
    pending: Vec<u8>,
}

impl InputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read bytes and collect every complete event.
    ///
    /// Ctrl-C disconnects wherever it appears. Ctrl-D, `q` and `Q` only count
    /// when they arrive alone with nothing pending, so the same bytes inside
    /// pasted text or a mangled escape sequence are ignored.
    pub fn feed(&mut self, data: &[u8]) -> Vec<InputEvent> {
        if let [CTRL_D | b'q' | b'Q'] = data {
            if self.pending.is_empty() {
                return vec![InputEvent::Disconnect];
            }
        }
        self.pending.extend_from_slice(data);
        let mut events = Vec::new();
        let mut pos = 0;

        while pos < self.pending.len() {
            match decode_one(&self.pending[pos..]) {
                Step::Event(event, used) => {
                    events.push(event);
                    pos += used;
                }
                Step::Skip(used) => pos += used,
                Step::NeedMore => break,
            }
        }

        self.pending.drain(..pos);
        if self.pending.len() > MAX_PENDING {
            tracing::trace!("Dropping {} bytes of unterminated input", self.pending.len());
            self.pending.clear();
        }
        events
    }

    /// Bytes held back waiting for the rest of a sequence
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_one(buf: &[u8]) -> Step {
    match buf[0] {
        CTRL_C => Step::Event(InputEvent::Disconnect, 1),
        ESC => decode_escape(buf),
        _ => Step::Skip(1),
    }
}

fn decode_escape(buf: &[u8]) -> Step {
    match buf.get(1) {
        None => Step::NeedMore,
        Some(b'[') => match buf.get(2) {
            None => Step::NeedMore,
            Some(b'M') => decode_mouse(buf),
            Some(_) => decode_csi(buf),
        },
        // Alt+key and other two-byte escapes carry nothing we act on
        Some(_) => Step::Skip(2),
    }
}

fn decode_mouse(buf: &[u8]) -> Step {
    if buf.len() < 6 {
        return Step::NeedMore;
    }
    let decoded = (
        buf[3].checked_sub(32),
        buf[4].checked_sub(32),
        buf[5].checked_sub(32),
    );
    match decoded {
        (Some(button), Some(col), Some(row)) if col > 0 && row > 0 => Step::Event(
            InputEvent::Pointer(PointerEvent {
                button,
                col: col as u32,
                row: row as u32,
            }),
            6,
        ),
        _ => {
            tracing::debug!("Ignoring out-of-range mouse report {:?}", &buf[..6]);
            Step::Skip(6)
        }
    }
}

/// `ESC [ params final` where params are digits and ';'
fn decode_csi(buf: &[u8]) -> Step {
    for (i, &byte) in buf.iter().enumerate().skip(2) {
        match byte {
            b'0'..=b'9' | b';' => continue,
            0x40..=0x7e => {
                let used = i + 1;
                if byte == b't' {
                    if let Some(report) = parse_pixel_report(&buf[2..i]) {
                        return Step::Event(InputEvent::PixelSize(report), used);
                    }
                }
                tracing::debug!(
                    "Ignoring escape sequence {:?}",
                    String::from_utf8_lossy(&buf[..used])
                );
                return Step::Skip(used);
            }
            _ => {
                // Not a sequence we understand; drop the introducer only
                return Step::Skip(2);
            }
        }
    }
    Step::NeedMore
}

/// Parameters of `ESC [ 4 ; height ; width t`
fn parse_pixel_report(params: &[u8]) -> Option<PixelReport> {
    let text = std::str::from_utf8(params).ok()?;
    let mut parts = text.split(';');
    if parts.next()? != "4" {
        return None;
    }
    let height = parts.next()?.parse().ok()?;
    let width = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(PixelReport { width, height })
}
