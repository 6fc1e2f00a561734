//! Double-buffered shared memory for frame delivery.
//!
//! The controller owns two memory-mapped regions; the camera worker writes each frame into
//! one of them and announces it with a [`FrameMessage`] whose `buffer_selector` says which.
//! There is no per-frame lock. Safety during resizing comes from the session protocol instead:
//! [`FrameBufferPool::allocate`] demands a [`Quiesced`] proof that the worker has acknowledged a
//! pause (or was never streaming), and every allocation bumps a generation counter that frames
//! must carry to be read.
//!
//! # Region Layout
//! ```text
//! [64-byte header] [capacity bytes of frame data]
//!
//! Header (little-endian):
//!   magic: u64        (0xCCD0_F8A3_0000_0001)
//!   capacity: u64     (size of data region)
//!   generation: u64   (pool generation at creation)
//!   padding: [u8; 40]
//! ```
//!
//! Regions are plain files under a shared-memory directory (`/dev/shm` on Linux) so any
//! process can map them by path. They are unlinked when the pool releases them.

use crate::error::{CaptureError, CaptureResult};
use crate::messages::{BufferSelector, FrameMessage};
use anyhow::{anyhow, Context};
use memmap2::{Mmap, MmapMut, MmapOptions};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Magic number for region header validation
const MAGIC: u64 = 0xCCD0_F8A3_0000_0001;

/// Size of the region header in bytes
const HEADER_SIZE: usize = 64;

/// Proof that nothing is writing into the current regions.
///
/// Only the session state machine can mint one, either after the worker acknowledged
/// `set_preview_pause` or while no stream is running.
#[derive(Debug)]
pub struct Quiesced {
    _private: (),
}

impl Quiesced {
    pub(crate) fn pause_acknowledged() -> Self {
        Self { _private: () }
    }

    pub(crate) fn not_streaming() -> Self {
        Self { _private: () }
    }
}

/// Names of a freshly allocated region pair, as sent with `set_image_buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionAnnouncement {
    /// Primary region path
    pub shm1: PathBuf,
    /// Secondary region path
    pub shm2: PathBuf,
    /// Generation frames written into these regions must carry
    pub generation: u64,
    /// Data capacity of each region
    pub size: usize,
}

impl RegionAnnouncement {
    /// `set_image_buffer` payload.
    pub fn to_payload(&self) -> Value {
        json!({
            "shm1": self.shm1.to_string_lossy(),
            "shm2": self.shm2.to_string_lossy(),
            "generation": self.generation,
            "size": self.size,
        })
    }

    /// Inverse of [`to_payload`](Self::to_payload).
    pub fn from_payload(data: &Value) -> Option<Self> {
        Some(Self {
            shm1: PathBuf::from(data.get("shm1")?.as_str()?),
            shm2: PathBuf::from(data.get("shm2")?.as_str()?),
            generation: data.get("generation")?.as_u64()?,
            size: usize::try_from(data.get("size")?.as_u64()?).ok()?,
        })
    }
}

/// One owned region, mapped read-only on the controller side.
struct SharedRegion {
    path: PathBuf,
    mmap: Mmap,
    capacity: usize,
}

impl SharedRegion {
    fn create(path: PathBuf, capacity: usize, generation: u64) -> CaptureResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((HEADER_SIZE + capacity) as u64)?;

        // SAFETY: we just created the file and sized it; nothing else maps it yet
        #[allow(unsafe_code)]
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        mmap[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[8..16].copy_from_slice(&(capacity as u64).to_le_bytes());
        mmap[16..24].copy_from_slice(&generation.to_le_bytes());
        mmap[24..HEADER_SIZE].fill(0);
        mmap.flush()?;

        Ok(Self {
            path,
            mmap: mmap.make_read_only()?,
            capacity,
        })
    }

    fn data(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..]
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "region unlink failed");
        }
    }
}

/// Controller-side owner of the two frame regions.
pub struct FrameBufferPool {
    dir: PathBuf,
    prefix: String,
    regions: Option<[SharedRegion; 2]>,
    generation: u64,
}

impl std::fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("dir", &self.dir)
            .field("generation", &self.generation)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl FrameBufferPool {
    /// A pool that will create its regions in `dir`. Nothing is allocated yet.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            regions: None,
            generation: 0,
        }
    }

    /// Continue numbering after `generation`, so frames from an earlier pool never match.
    pub fn continuing_from(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Tear down both regions and create new ones of `size` bytes each.
    ///
    /// Frames announced before this call carry the old generation and are rejected by
    /// [`consume`](Self::consume) afterwards.
    pub fn allocate(&mut self, size: usize, _quiesced: &Quiesced) -> CaptureResult<RegionAnnouncement> {
        if size == 0 {
            return Err(CaptureError::InvalidArgument(
                "frame region size must be non-zero".into(),
            ));
        }

        self.release();
        std::fs::create_dir_all(&self.dir)?;
        let generation = self.generation + 1;
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let name = |suffix: &str| {
            self.dir
                .join(format!("{}_{}_{}{}", self.prefix, &tag[..12], generation, suffix))
        };

        let primary = SharedRegion::create(name("_a"), size, generation)?;
        let secondary = SharedRegion::create(name("_b"), size, generation)?;
        let announcement = RegionAnnouncement {
            shm1: primary.path.clone(),
            shm2: secondary.path.clone(),
            generation,
            size,
        };

        self.regions = Some([primary, secondary]);
        self.generation = generation;
        tracing::info!(generation, size, "frame regions allocated");
        Ok(announcement)
    }

    /// Unmap and unlink both regions. The generation is kept so it keeps increasing.
    pub fn release(&mut self) {
        if self.regions.take().is_some() {
            tracing::debug!(generation = self.generation, "frame regions released");
        }
    }

    /// Read-only view of exactly the bytes described by `frame`.
    pub fn consume(&self, frame: &FrameMessage) -> CaptureResult<&[u8]> {
        let regions = self
            .regions
            .as_ref()
            .ok_or_else(|| CaptureError::Buffer("no frame regions allocated".into()))?;

        if frame.generation != self.generation {
            return Err(CaptureError::Buffer(format!(
                "stale frame generation {} (current {})",
                frame.generation, self.generation
            )));
        }

        let expected = frame.shape.byte_size();
        if expected == 0 || frame.byte_size != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: frame.byte_size,
            });
        }

        let region = &regions[frame.buffer_selector.index()];
        if expected > region.capacity {
            return Err(CaptureError::FrameSize {
                expected,
                actual: region.capacity,
            });
        }

        Ok(&region.data()[..expected])
    }

    /// Current generation; 0 before the first allocation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Data capacity of each region, 0 when unallocated.
    pub fn capacity(&self) -> usize {
        self.regions.as_ref().map_or(0, |r| r[0].capacity)
    }

    /// Whether regions currently exist.
    pub fn is_allocated(&self) -> bool {
        self.regions.is_some()
    }

    /// Paths of the two regions, if allocated.
    pub fn region_paths(&self) -> Option<[&Path; 2]> {
        self.regions
            .as_ref()
            .map(|[a, b]| [a.path.as_path(), b.path.as_path()])
    }
}

/// Worker-side writable mapping of an announced region pair.
pub struct RegionWriter {
    maps: [MmapMut; 2],
    capacity: usize,
    generation: u64,
}

impl RegionWriter {
    /// Map both regions from a `set_image_buffer` announcement and validate their headers.
    pub fn open(announcement: &RegionAnnouncement) -> anyhow::Result<Self> {
        let primary = map_region(&announcement.shm1)?;
        let secondary = map_region(&announcement.shm2)?;

        let (cap_a, gen_a) = read_header(&primary, &announcement.shm1)?;
        let (cap_b, gen_b) = read_header(&secondary, &announcement.shm2)?;
        if cap_a != cap_b || gen_a != gen_b {
            return Err(anyhow!(
                "region pair mismatch: capacity {cap_a}/{cap_b}, generation {gen_a}/{gen_b}"
            ));
        }
        if gen_a != announcement.generation {
            return Err(anyhow!(
                "announced generation {} but regions carry {}",
                announcement.generation,
                gen_a
            ));
        }

        Ok(Self {
            maps: [primary, secondary],
            capacity: cap_a,
            generation: gen_a,
        })
    }

    /// Copy a frame into the selected region.
    pub fn write(&mut self, selector: BufferSelector, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.len() > self.capacity {
            return Err(anyhow!(
                "frame of {} bytes exceeds region capacity {}",
                bytes.len(),
                self.capacity
            ));
        }
        let map = &mut self.maps[selector.index()];
        map[HEADER_SIZE..HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Generation to stamp on frames written here.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Data capacity of each region.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn map_region(path: &Path) -> anyhow::Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open frame region: {}", path.display()))?;
    // SAFETY: the controller created and sized this file; it stays mapped until release
    #[allow(unsafe_code)]
    let mmap = unsafe {
        MmapOptions::new()
            .map_mut(&file)
            .context("Failed to map frame region")?
    };
    if mmap.len() < HEADER_SIZE {
        return Err(anyhow!("frame region {} is truncated", path.display()));
    }
    Ok(mmap)
}

fn read_header(map: &[u8], path: &Path) -> anyhow::Result<(usize, u64)> {
    let word = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&map[at..at + 8]);
        u64::from_le_bytes(buf)
    };
    let magic = word(0);
    if magic != MAGIC {
        return Err(anyhow!(
            "Invalid frame region magic in {}: expected 0x{:016X}, got 0x{:016X}",
            path.display(),
            MAGIC,
            magic
        ));
    }
    let capacity = usize::try_from(word(8)).context("region capacity overflows usize")?;
    if map.len() < HEADER_SIZE + capacity {
        return Err(anyhow!("frame region {} is shorter than its header claims", path.display()));
    }
    Ok((capacity, word(16)))
}
