//! Deterministic capture-and-replay log for a video subsystem's
//! state-mutating events.
//!
//! A recording session observes register/palette/OAM/VRAM mutations and
//! frame boundaries, coalesces VRAM write bursts through a dirty bitmap,
//! and multiplexes per-channel packet streams into one append-only
//! backing store as optionally deflate-compressed blocks. Replay walks
//! the blocks back per channel, bit-for-bit, and drives a renderer
//! backend without re-running CPU emulation.
//!
//! The on-disk layout is documented in `format.rs`: a `mVL\0` file
//! header, an optional opaque initial-state snapshot, zero-length
//! channel-header placeholders, interleaved channel-homogeneous data
//! blocks, and a terminating footer.

mod compress;
mod container;
mod error;
mod format;
mod io;
mod replay;
mod ring;
mod tracker;

pub use crate::container::{probe, ChannelId, LogContainer, WriteOptions, BUFFER_BASE_SIZE};
pub use crate::error::{LogError, Result};
pub use crate::format::{
    BlockHeader, DirtyPacket, FileHeader, PlatformId, BLOCK_CHANNEL_HEADER, BLOCK_DATA,
    BLOCK_DUMMY, BLOCK_FLAG_COMPRESSED, BLOCK_FOOTER, BLOCK_HEADER_SIZE, BLOCK_INITIAL_STATE,
    FILE_HEADER_SIZE, FLAG_HAS_INITIAL_STATE, MAX_CHANNELS, MVL_MAGIC, PACKET_FILLER, PACKET_SIZE,
    VRAM_PAGE_SIZE,
};
pub use crate::replay::{LoggerHooks, NoHooks, ReplayBackend, ReplayEngine, ReplayStep};
pub use crate::tracker::{
    ChannelSink, DirtySink, DirtyTracker, NullSink, PassThroughSink, VramSource, OAM_SLOT_SIZE,
};
