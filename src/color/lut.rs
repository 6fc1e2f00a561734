//! Gain lookup tables for software white balance.
//!
//! A table maps every pixel value `v` in `0..=max` to `clamp(round(v * gain), 0, max)`.
//! Tables exist for 8-bit (max 255) and 16-bit (max 65535) data and for every gain on a grid
//! (by default 0.00 to 2.00 in steps of 0.01). Gains are keyed by their two-decimal string form.
//!
//! The full set is persisted so it is only built once:
//!
//! ```text
//! magic      [u8; 8]   "CCDLUT01"
//! grid       3 x f64   start, end, step
//! count      u32
//! entries    count x { max u32, key_len u8, key, len u32, len x u16 }
//! checksum   [u8; 32]  SHA-256 of everything above
//! ```
//!
//! All integers are little-endian. Any mismatch means the file is rebuilt.

use crate::error::{CaptureError, CaptureResult};
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

const MAGIC: &[u8; 8] = b"CCDLUT01";
const CHECKSUM_LEN: usize = 32;

/// Pixel maxima tables are built for.
pub const MAX_VALUES: [u32; 2] = [255, 65535];

/// Two-decimal key of a gain.
pub fn gain_key(gain: f64) -> String {
    format!("{gain:.2}")
}

/// One gain table.
#[derive(Debug, Clone, PartialEq)]
pub struct GainLut {
    max_value: u32,
    key: String,
    table: Vec<u16>,
}

impl GainLut {
    /// Compute the table for `gain` (rounded to two decimals).
    pub fn compute(max_value: u32, gain: f64) -> Self {
        let key = gain_key(gain);
        let gain: f64 = key.parse().unwrap_or(gain);
        let max = f64::from(max_value);
        let table = (0..=max_value)
            .map(|v| (f64::from(v) * gain).round().clamp(0.0, max) as u16)
            .collect();
        Self {
            max_value,
            key,
            table,
        }
    }

    /// Largest pixel value covered.
    pub fn max_value(&self) -> u32 {
        self.max_value
    }

    /// Gain key, e.g. `"1.25"`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mapped value for `v`; values above the maximum saturate.
    pub fn apply(&self, v: u32) -> u16 {
        let idx = v.min(self.max_value) as usize;
        self.table[idx]
    }

    /// Raw table, `max_value + 1` entries.
    pub fn table(&self) -> &[u16] {
        &self.table
    }
}

/// The gain grid tables are built over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainGrid {
    /// First gain
    pub start: f64,
    /// Last gain
    pub end: f64,
    /// Spacing
    pub step: f64,
}

impl Default for GainGrid {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 2.0,
            step: 0.01,
        }
    }
}

impl GainGrid {
    /// Gains on the grid, inclusive of both ends.
    pub fn gains(&self) -> Vec<f64> {
        if !(self.step > 0.0) || self.end < self.start {
            return vec![self.start];
        }
        let steps = ((self.end - self.start) / self.step).round() as usize;
        (0..=steps).map(|i| self.start + i as f64 * self.step).collect()
    }
}

/// All gain tables, keyed by `(max_value, gain_key)`.
#[derive(Debug, Clone)]
pub struct GainLutCache {
    grid: GainGrid,
    luts: HashMap<(u32, String), GainLut>,
}

impl GainLutCache {
    /// Build every table on `grid` for both 8- and 16-bit data.
    pub fn build(grid: GainGrid) -> Self {
        let mut luts = HashMap::new();
        for max_value in MAX_VALUES {
            for gain in grid.gains() {
                let lut = GainLut::compute(max_value, gain);
                luts.insert((max_value, lut.key.clone()), lut);
            }
        }
        tracing::debug!(tables = luts.len(), "gain LUTs built");
        Self { grid, luts }
    }

    /// Load from `path`, or rebuild and persist when the file is missing, corrupt, or was built
    /// for a different grid. Never fails; a failed save is only logged.
    pub fn load_or_build(path: &Path, grid: GainGrid) -> Self {
        match Self::load(path, grid) {
            Ok(cache) => {
                tracing::info!(path = %path.display(), tables = cache.len(), "gain LUT cache loaded");
                return cache;
            }
            Err(CaptureError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no gain LUT cache, building");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "gain LUT cache unusable, rebuilding");
            }
        }

        let cache = Self::build(grid);
        if let Err(e) = cache.save(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist gain LUT cache");
        }
        cache
    }

    /// Read a persisted cache, verifying checksum and grid.
    pub fn load(path: &Path, grid: GainGrid) -> CaptureResult<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < MAGIC.len() + 24 + 4 + CHECKSUM_LEN {
            return Err(CaptureError::Lut("file truncated".into()));
        }

        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(CaptureError::Lut("checksum mismatch".into()));
        }

        let mut buf = body;
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(CaptureError::Lut("bad magic".into()));
        }
        buf.advance(MAGIC.len());

        let stored = GainGrid {
            start: buf.get_f64_le(),
            end: buf.get_f64_le(),
            step: buf.get_f64_le(),
        };
        if stored != grid {
            return Err(CaptureError::Lut(format!(
                "cache built for grid {stored:?}, wanted {grid:?}"
            )));
        }

        let count = buf.get_u32_le() as usize;
        let mut luts = HashMap::with_capacity(count);
        for _ in 0..count {
            let lut = read_entry(&mut buf)?;
            luts.insert((lut.max_value, lut.key.clone()), lut);
        }
        if buf.has_remaining() {
            return Err(CaptureError::Lut("trailing bytes".into()));
        }

        Ok(Self { grid, luts })
    }

    /// Persist atomically (write to a sibling temp file, then rename).
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        let mut out: Vec<u8> = Vec::new();
        out.put_slice(MAGIC);
        out.put_f64_le(self.grid.start);
        out.put_f64_le(self.grid.end);
        out.put_f64_le(self.grid.step);
        out.put_u32_le(self.luts.len() as u32);

        let mut keys: Vec<&(u32, String)> = self.luts.keys().collect();
        keys.sort();
        for key in keys {
            let lut = &self.luts[key];
            out.put_u32_le(lut.max_value);
            out.put_u8(lut.key.len() as u8);
            out.put_slice(lut.key.as_bytes());
            out.put_u32_le(lut.table.len() as u32);
            for v in &lut.table {
                out.put_u16_le(*v);
            }
        }
        let checksum = Sha256::digest(&out);
        out.put_slice(checksum.as_slice());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &out)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), bytes = out.len(), "gain LUT cache saved");
        Ok(())
    }

    /// Table for `(max_value, gain)` if it is on the grid.
    pub fn get(&self, max_value: u32, gain: f64) -> Option<&GainLut> {
        self.luts.get(&(max_value, gain_key(gain)))
    }

    /// Table for `(max_value, gain)`, computed on the fly when off the grid.
    pub fn lut(&self, max_value: u32, gain: f64) -> Cow<'_, GainLut> {
        match self.get(max_value, gain) {
            Some(lut) => Cow::Borrowed(lut),
            None => Cow::Owned(GainLut::compute(max_value, gain)),
        }
    }

    /// Grid the cache covers.
    pub fn grid(&self) -> GainGrid {
        self.grid
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.luts.len()
    }

    /// True when no tables exist.
    pub fn is_empty(&self) -> bool {
        self.luts.is_empty()
    }
}

fn read_entry(buf: &mut &[u8]) -> CaptureResult<GainLut> {
    let truncated = || CaptureError::Lut("entry truncated".into());

    if buf.remaining() < 5 {
        return Err(truncated());
    }
    let max_value = buf.get_u32_le();
    let key_len = buf.get_u8() as usize;
    if buf.remaining() < key_len + 4 {
        return Err(truncated());
    }
    let key = String::from_utf8(buf[..key_len].to_vec())
        .map_err(|_| CaptureError::Lut("gain key is not UTF-8".into()))?;
    buf.advance(key_len);

    let len = buf.get_u32_le() as usize;
    if len != max_value as usize + 1 || buf.remaining() < len * 2 {
        return Err(CaptureError::Lut(format!(
            "table for ({max_value}, {key}) has bad length {len}"
        )));
    }
    let table = (0..len).map(|_| buf.get_u16_le()).collect();

    Ok(GainLut {
        max_value,
        key,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_grid() -> GainGrid {
        GainGrid {
            start: 0.5,
            end: 1.5,
            step: 0.25,
        }
    }

    #[test]
    fn clamps_and_rounds() {
        assert_eq!(GainLut::compute(255, 2.0).apply(200), 255);
        assert_eq!(GainLut::compute(255, 1.5).apply(100), 150);
        assert_eq!(GainLut::compute(255, 0.5).apply(3), 2);
        assert_eq!(GainLut::compute(65535, 2.0).apply(40000), 65535);
    }

    #[test]
    fn unit_gain_is_identity() {
        for max in MAX_VALUES {
            let lut = GainLut::compute(max, 1.0);
            assert!(lut.table().iter().enumerate().all(|(i, v)| *v as usize == i));
        }
    }

    #[test]
    fn keys_use_two_decimals() {
        assert_eq!(gain_key(1.0), "1.00");
        assert_eq!(gain_key(0.126), "0.13");
        assert_eq!(GainLut::compute(255, 1.004).key(), "1.00");
    }

    #[test]
    fn default_grid_has_201_gains() {
        let gains = GainGrid::default().gains();
        assert_eq!(gains.len(), 201);
        assert_eq!(gain_key(gains[100]), "1.00");
        assert_eq!(gain_key(*gains.last().unwrap()), "2.00");
    }

    #[test]
    fn build_covers_both_depths() {
        let cache = GainLutCache::build(small_grid());
        assert_eq!(cache.len(), 10);
        assert!(cache.get(255, 0.75).is_some());
        assert!(cache.get(65535, 1.5).is_some());
        assert!(cache.get(255, 1.1).is_none());
        // off-grid gains are computed on demand
        assert_eq!(cache.lut(255, 1.1).apply(100), 110);
    }

    #[test]
    fn save_and_load_preserve_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("luts.bin");
        let cache = GainLutCache::build(small_grid());
        cache.save(&path).unwrap();

        let loaded = GainLutCache::load(&path, small_grid()).unwrap();
        assert_eq!(loaded.len(), cache.len());
        assert_eq!(loaded.get(255, 1.25), cache.get(255, 1.25));
    }

    #[test]
    fn corrupt_cache_is_rebuilt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("luts.bin");
        GainLutCache::build(small_grid()).save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            GainLutCache::load(&path, small_grid()),
            Err(CaptureError::Lut(_))
        ));

        let rebuilt = GainLutCache::load_or_build(&path, small_grid());
        assert_eq!(rebuilt.len(), 10);
        assert!(GainLutCache::load(&path, small_grid()).is_ok());
    }

    #[test]
    fn missing_cache_is_built_and_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("luts.bin");
        let cache = GainLutCache::load_or_build(&path, small_grid());
        assert_eq!(cache.len(), 10);
        assert!(path.exists());
    }

    #[test]
    fn grid_change_invalidates_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("luts.bin");
        GainLutCache::build(small_grid()).save(&path).unwrap();
        let other = GainGrid {
            step: 0.5,
            ..small_grid()
        };
        assert!(GainLutCache::load(&path, other).is_err());
    }
}
