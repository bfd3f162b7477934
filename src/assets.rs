//! Sprite and floor tile images, loaded once at startup
//!
//! Every session receives the same upload sequence, so it is encoded once
//! here and shared as a single [`Bytes`] buffer.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::aquarium::constants::{chrome, sprite};
use crate::net::overlay::encode_upload;

/// Left-facing sprite; also used for the right-facing one when that is absent
pub const FISH_LEFT_FILE: &str = "fish.png";
pub const FISH_RIGHT_FILE: &str = "fish-right.png";

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Cannot read {path}: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is empty")]
    Empty(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SpriteAssets {
    pub fish_left: Bytes,
    pub fish_right: Bytes,
    pub floor_tiles: Vec<Bytes>,
    uploads: Bytes,
}

fn read_image(path: &Path) -> Result<Bytes, AssetError> {
    let data = std::fs::read(path).map_err(|source| AssetError::Missing {
        path: path.to_path_buf(),
        source,
    })?;
    if data.is_empty() {
        return Err(AssetError::Empty(path.to_path_buf()));
    }
    Ok(Bytes::from(data))
}

pub fn floor_tile_file(index: usize) -> String {
    format!("floor_{}.png", index)
}

impl SpriteAssets {
    /// Load all images from `dir`. Any missing or empty file is an error.
    pub fn load(dir: &Path) -> Result<Self, AssetError> {
        let fish_left = read_image(&dir.join(FISH_LEFT_FILE))?;
        let right_path = dir.join(FISH_RIGHT_FILE);
        let fish_right = if right_path.exists() {
            read_image(&right_path)?
        } else {
            tracing::warn!("{} not found, mirroring {}", FISH_RIGHT_FILE, FISH_LEFT_FILE);
            fish_left.clone()
        };

        let floor_tiles = (0..chrome::FLOOR_TILE_COUNT)
            .map(|i| read_image(&dir.join(floor_tile_file(i))))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "Loaded sprite assets from {} ({} floor tiles)",
            dir.display(),
            floor_tiles.len()
        );
        Ok(Self::from_images(fish_left, fish_right, floor_tiles))
    }

    pub fn from_images(fish_left: Bytes, fish_right: Bytes, floor_tiles: Vec<Bytes>) -> Self {
        let mut uploads = Vec::new();
        let images = [
            (sprite::LEFT_IMAGE_ID, &fish_left),
            (sprite::RIGHT_IMAGE_ID, &fish_right),
        ];
        for (id, image) in images {
            uploads.extend(encode_upload(image, id).concat());
        }
        for (i, tile) in floor_tiles.iter().enumerate() {
            uploads.extend(encode_upload(tile, chrome::FLOOR_IMAGE_BASE + i as u32).concat());
        }

        Self {
            fish_left,
            fish_right,
            floor_tiles,
            uploads: Bytes::from(uploads),
        }
    }

    /// Small stand-in images for tests and benchmarks
    pub fn placeholder() -> Self {
        let tile = |i: u8| Bytes::from(vec![0x89, b'P', b'N', b'G', i]);
        Self::from_images(
            Bytes::from_static(b"\x89PNG-left"),
            Bytes::from_static(b"\x89PNG-right"),
            (0..chrome::FLOOR_TILE_COUNT as u8).map(tile).collect(),
        )
    }

    /// Upload frames for every image, concatenated
    pub fn upload_sequence(&self) -> Bytes {
        self.uploads.clone()
    }
}
