//! Bounded cache of rendered watermark tiles.
//!
//! Rendering a tile means laying out text and rotating a bitmap, which costs
//! far more than compositing it. Every page of a batch shares the same tile,
//! so one render serves the whole document.
//!
//! The lock covers lookup and insertion only. Rendering happens outside it,
//! and compositing works on a shared `Arc` of the tile, so a slow composite
//! never blocks other workers. Two workers missing on the same key at once
//! may both render; the first insert wins and the other copy is dropped.

use crate::error::RelayError;
use image::RgbaImage;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Everything that changes a tile's pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub text: String,
    pub font_id: String,
    pub font_size: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub color: [u8; 3],
    pub opacity: u8,
    /// Rotation in hundredths of a degree.
    pub angle_centideg: i32,
    pub text_offset: i32,
}

/// Hit/render counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub renders: u64,
}

/// LRU cache of rendered tiles.
pub struct TileCache {
    tiles: Mutex<LruCache<TileKey, Arc<RgbaImage>>>,
    hits: AtomicU64,
    renders: AtomicU64,
}

impl TileCache {
    /// A cache holding at most `capacity` tiles (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tiles: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            renders: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
        }
    }

    /// Return the cached tile for `key`, rendering and inserting it on a miss.
    pub fn get_or_render<F>(&self, key: TileKey, render: F) -> Result<Arc<RgbaImage>, RelayError>
    where
        F: FnOnce() -> Result<RgbaImage, RelayError>,
    {
        if let Some(tile) = self.lock().get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tile);
        }

        let tile = Arc::new(render()?);
        self.renders.fetch_add(1, Ordering::Relaxed);
        debug!(
            text = %key.text,
            width = tile.width(),
            height = tile.height(),
            "Rendered watermark tile"
        );

        let mut tiles = self.lock();
        if let Some(existing) = tiles.get(&key).cloned() {
            return Ok(existing);
        }
        tiles.put(key, tile.clone());
        Ok(tile)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<TileKey, Arc<RgbaImage>>> {
        self.tiles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(32)
    }
}
