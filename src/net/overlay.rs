//! Kitty graphics protocol codec
//!
//! Every command is an APC frame: `ESC _ G <control> [; <payload>] ESC \`.
//! The control part is a comma separated list of `key=value` pairs; the
//! payload, when present, is base64 image data.
//!
//! Uploads are split into [`CHUNK_SIZE`] character chunks. Only the first
//! frame carries the transmit metadata, later frames carry just the
//! more-chunks flag `m`, and the last frame is the only one with `m=0`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Base64 characters per upload frame
pub const CHUNK_SIZE: usize = 4096;

/// Kitty's format code for PNG data
pub const FORMAT_PNG: u32 = 100;

const FRAME_START: &[u8] = b"\x1b_G";
const FRAME_END: &[u8] = b"\x1b\\";

/// Errors raised while decoding overlay frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Frame starting at byte {0} is not terminated")]
    Unterminated(usize),
    #[error("Malformed control pair '{0}'")]
    MalformedPair(String),
    #[error("Missing control key '{0}'")]
    MissingKey(&'static str),
    #[error("Invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("Upload must start with a transmit frame")]
    NotTransmit,
    #[error("Continuation frame carries transmit metadata")]
    UnexpectedMetadata,
    #[error("Frames continue after the final chunk")]
    ChunkAfterFinal,
    #[error("Upload ended without a final chunk")]
    MissingFinalChunk,
    #[error("No frames to reassemble")]
    Empty,
    #[error("Invalid base64 payload: {0}")]
    Base64(String),
}

/// Where and how large to draw an uploaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub image_id: u32,
    pub placement_id: u32,
    /// Width in cells
    pub cell_width: u32,
    /// Height in cells
    pub cell_height: u32,
    /// 1-based column of the anchor cell
    pub col: u32,
    /// 1-based row of the anchor cell
    pub row: u32,
    /// Pixel offset inside the anchor cell
    pub x_offset: u32,
    pub y_offset: u32,
}

fn write_frame(out: &mut Vec<u8>, control: &str, payload: Option<&[u8]>) {
    out.extend_from_slice(FRAME_START);
    out.extend_from_slice(control.as_bytes());
    if let Some(payload) = payload {
        out.push(b';');
        out.extend_from_slice(payload);
    }
    out.extend_from_slice(FRAME_END);
}

/// Encode an image upload as a sequence of frames, one per chunk
pub fn encode_upload(image: &[u8], image_id: u32) -> Vec<Vec<u8>> {
    let encoded = STANDARD.encode(image);
    let chunks: Vec<&[u8]> = if encoded.is_empty() {
        vec![&b""[..]]
    } else {
        encoded.as_bytes().chunks(CHUNK_SIZE).collect()
    };
    let last = chunks.len() - 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let more = u8::from(i != last);
            let control = if i == 0 {
                format!("a=t,f={},i={},m={},q=1", FORMAT_PNG, image_id, more)
            } else {
                format!("m={}", more)
            };
            let mut frame = Vec::with_capacity(chunk.len() + control.len() + 8);
            write_frame(&mut frame, &control, Some(chunk));
            frame
        })
        .collect()
}

/// Move the cursor to the anchor cell and place the image there.
///
/// `C=1` keeps the cursor where it is; without it every placement would
/// advance the cursor and eventually scroll the terminal.
pub fn encode_placement(placement: &Placement) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(format!("\x1b[{};{}H", placement.row, placement.col).as_bytes());
    append_placement(&mut out, placement);
    out
}

/// Placement command alone, for callers that position the cursor themselves
pub fn append_placement(out: &mut Vec<u8>, placement: &Placement) {
    let control = format!(
        "a=p,i={},p={},c={},r={},C=1,X={},Y={},q=1",
        placement.image_id,
        placement.placement_id,
        placement.cell_width,
        placement.cell_height,
        placement.x_offset,
        placement.y_offset,
    );
    write_frame(out, &control, None);
}

/// Remove one placement of an image, keeping the image data cached
pub fn encode_deletion(image_id: u32, placement_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    write_frame(
        &mut out,
        &format!("a=d,d=i,i={},p={},q=1", image_id, placement_id),
        None,
    );
    out
}

/// Remove a placement by id alone, for when the image variant is unknown
pub fn encode_deletion_by_placement(placement_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    write_frame(&mut out, &format!("a=d,d=i,p={},q=1", placement_id), None);
    out
}

/// One decoded APC graphics frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFrame {
    pub control: Vec<(String, String)>,
    pub payload: Option<Vec<u8>>,
}

impl OverlayFrame {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.control
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u32(&self, key: &'static str) -> Result<u32, CodecError> {
        let value = self.get(key).ok_or(CodecError::MissingKey(key))?;
        value.parse().map_err(|_| CodecError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// More-chunks flag; absent means no more chunks
    pub fn has_more(&self) -> Result<bool, CodecError> {
        match self.get("m") {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(other) => Err(CodecError::InvalidValue {
                key: "m".to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn action(&self) -> Option<&str> {
        self.get("a")
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn parse_control(raw: &[u8]) -> Result<Vec<(String, String)>, CodecError> {
    let text = String::from_utf8_lossy(raw);
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|pair| {
            pair.split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| CodecError::MalformedPair(pair.to_string()))
        })
        .collect()
}

/// Decode every graphics frame in a byte stream.
///
/// Bytes outside frames (cursor movement, plain text) are skipped.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<OverlayFrame>, CodecError> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    while let Some(start) = find(bytes, FRAME_START, cursor) {
        let body_start = start + FRAME_START.len();
        let end = find(bytes, FRAME_END, body_start).ok_or(CodecError::Unterminated(start))?;
        let body = &bytes[body_start..end];

        let (control, payload) = match body.iter().position(|b| *b == b';') {
            Some(split) => (&body[..split], Some(body[split + 1..].to_vec())),
            None => (body, None),
        };

        frames.push(OverlayFrame {
            control: parse_control(control)?,
            payload,
        });
        cursor = end + FRAME_END.len();
    }

    Ok(frames)
}

/// A transmitted image reassembled from its chunk frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub image_id: u32,
    pub format: u32,
    /// Concatenated base64 payload
    pub data: String,
}

impl Upload {
    pub fn decode_image(&self) -> Result<Vec<u8>, CodecError> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| CodecError::Base64(e.to_string()))
    }
}

/// Join a transmit sequence back into a single upload.
///
/// The first frame must be `a=t` with an image id and format; each later
/// frame may only carry `m`. Only the final frame may have `m=0`.
pub fn reassemble_upload(frames: &[OverlayFrame]) -> Result<Upload, CodecError> {
    let (first, rest) = frames.split_first().ok_or(CodecError::Empty)?;
    if first.action() != Some("t") {
        return Err(CodecError::NotTransmit);
    }

    let mut upload = Upload {
        image_id: first.get_u32("i")?,
        format: first.get_u32("f")?,
        data: String::new(),
    };
    let mut more = first.has_more()?;
    push_payload(&mut upload.data, first);

    for frame in rest {
        if !more {
            return Err(CodecError::ChunkAfterFinal);
        }
        if frame.control.iter().any(|(k, _)| k != "m") {
            return Err(CodecError::UnexpectedMetadata);
        }
        more = frame.has_more()?;
        push_payload(&mut upload.data, frame);
    }

    if more {
        return Err(CodecError::MissingFinalChunk);
    }
    Ok(upload)
}

fn push_payload(data: &mut String, frame: &OverlayFrame) {
    if let Some(payload) = &frame.payload {
        data.push_str(&String::from_utf8_lossy(payload));
    }
}
