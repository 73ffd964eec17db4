//! On-disk layout of the multiplexed video log container.
//!
//! All integers are little-endian u32. The container is a flat stream:
//! file header, optional initial-state block, one zero-length channel
//! header block per channel, interleaved data blocks, one footer block.

use std::io::{Read, Write};

use crate::error::{LogError, Result};
use crate::io::{ReadLeExt, WriteLeExt};

pub const MVL_MAGIC: &[u8; 4] = b"mVL\0";

/// Hard limit on channels per container; also bounds the header scan.
pub const MAX_CHANNELS: usize = 32;

pub const FLAG_HAS_INITIAL_STATE: u32 = 1;

pub const BLOCK_DUMMY: u32 = 0;
pub const BLOCK_INITIAL_STATE: u32 = 1;
pub const BLOCK_CHANNEL_HEADER: u32 = 2;
pub const BLOCK_DATA: u32 = 3;
pub const BLOCK_FOOTER: u32 = 0x784C_566D;

/// Data-block flag bit 0: payload is a complete zlib stream.
pub const BLOCK_FLAG_COMPRESSED: u32 = 1;

pub const FILE_HEADER_SIZE: usize = 16;
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Fixed size of an encoded dirty packet, excluding any trailing blob.
pub const PACKET_SIZE: usize = 16;

/// Unused packet params carry this filler on the wire.
pub const PACKET_FILLER: u32 = 0xDEAD_BEEF;

/// Granularity of VRAM dirty tracking and of emitted VRAM transfers.
pub const VRAM_PAGE_SIZE: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformId(pub u32);

impl PlatformId {
    pub const GBA: PlatformId = PlatformId(0);
    pub const GB: PlatformId = PlatformId(1);

    pub fn name(self) -> Option<&'static str> {
        match self {
            PlatformId::GBA => Some("GBA"),
            PlatformId::GB => Some("GB"),
            _ => None,
        }
    }
}

impl core::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.name() {
            write!(f, "{name}({})", self.0)
        } else {
            write!(f, "PlatformId({})", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub flags: u32,
    pub platform: PlatformId,
    pub n_channels: u32,
}

impl FileHeader {
    pub fn has_initial_state(&self) -> bool {
        self.flags & FLAG_HAS_INITIAL_STATE != 0
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_bytes(MVL_MAGIC)?;
        w.write_u32_le(self.flags)?;
        w.write_u32_le(self.platform.0)?;
        w.write_u32_le(self.n_channels)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MVL_MAGIC {
            return Err(LogError::InvalidMagic);
        }
        let flags = r.read_u32_le()?;
        let platform = PlatformId(r.read_u32_le()?);
        let n_channels = r.read_u32_le()?;
        Ok(Self {
            flags,
            platform,
            n_channels,
        })
    }
}

/// Block headers are not validated on decode: unknown block types must
/// survive parsing so readers can skip them by `length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: u32,
    pub length: u32,
    pub channel_id: u32,
    pub flags: u32,
}

impl BlockHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & BLOCK_FLAG_COMPRESSED != 0
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.block_type)?;
        w.write_u32_le(self.length)?;
        w.write_u32_le(self.channel_id)?;
        w.write_u32_le(self.flags)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            block_type: r.read_u32_le()?,
            length: r.read_u32_le()?,
            channel_id: r.read_u32_le()?,
            flags: r.read_u32_le()?,
        })
    }
}

const TAG_REGISTER: u32 = 1;
const TAG_PALETTE: u32 = 2;
const TAG_OAM: u32 = 3;
const TAG_VRAM: u32 = 4;
const TAG_SCANLINE: u32 = 5;
const TAG_RANGE: u32 = 6;
const TAG_FLUSH: u32 = 7;
const TAG_FRAME: u32 = 8;
const TAG_BUFFER: u32 = 9;

/// One state mutation or marker, as carried inside decoded data-block
/// payloads. `Vram` and `Buffer` records are immediately followed in the
/// stream by their declared number of raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyPacket {
    Register { address: u32, value: u16 },
    Palette { address: u32, value: u16 },
    Oam { address: u32, value: u16 },
    Vram { offset: u32, len: u32 },
    Scanline { y: u32 },
    Range { y: u32, start_x: u32, end_x: u32 },
    Flush,
    Frame,
    Buffer { buffer_id: u32, offset: u32, len: u32 },
}

impl DirtyPacket {
    /// Number of out-of-band bytes following the fixed record.
    pub fn trailing_len(&self) -> usize {
        match *self {
            DirtyPacket::Vram { len, .. } => len as usize,
            DirtyPacket::Buffer { len, .. } => len as usize,
            _ => 0,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let (tag, p0, p1, p2) = match *self {
            DirtyPacket::Register { address, value } => {
                (TAG_REGISTER, address, u32::from(value), PACKET_FILLER)
            }
            DirtyPacket::Palette { address, value } => {
                (TAG_PALETTE, address, u32::from(value), PACKET_FILLER)
            }
            DirtyPacket::Oam { address, value } => {
                (TAG_OAM, address, u32::from(value), PACKET_FILLER)
            }
            DirtyPacket::Vram { offset, len } => (TAG_VRAM, offset, len, PACKET_FILLER),
            DirtyPacket::Scanline { y } => (TAG_SCANLINE, y, 0, PACKET_FILLER),
            DirtyPacket::Range { y, start_x, end_x } => (TAG_RANGE, y, start_x, end_x),
            DirtyPacket::Flush => (TAG_FLUSH, 0, 0, PACKET_FILLER),
            DirtyPacket::Frame => (TAG_FRAME, 0, 0, PACKET_FILLER),
            DirtyPacket::Buffer {
                buffer_id,
                offset,
                len,
            } => (TAG_BUFFER, buffer_id, offset, len),
        };
        let mut out = [0u8; PACKET_SIZE];
        out[0..4].copy_from_slice(&tag.to_le_bytes());
        out[4..8].copy_from_slice(&p0.to_le_bytes());
        out[8..12].copy_from_slice(&p1.to_le_bytes());
        out[12..16].copy_from_slice(&p2.to_le_bytes());
        out
    }

    /// An unrecognized tag is a hard error: the stream is position
    /// significant, so playback cannot resynchronize past it.
    pub fn decode(bytes: &[u8; PACKET_SIZE]) -> Result<Self> {
        let tag = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let p0 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let p1 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let p2 = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        match tag {
            TAG_REGISTER => Ok(DirtyPacket::Register {
                address: p0,
                value: p1 as u16,
            }),
            TAG_PALETTE => Ok(DirtyPacket::Palette {
                address: p0,
                value: p1 as u16,
            }),
            TAG_OAM => Ok(DirtyPacket::Oam {
                address: p0,
                value: p1 as u16,
            }),
            TAG_VRAM => Ok(DirtyPacket::Vram {
                offset: p0,
                len: p1,
            }),
            TAG_SCANLINE => Ok(DirtyPacket::Scanline { y: p0 }),
            TAG_RANGE => Ok(DirtyPacket::Range {
                y: p0,
                start_x: p1,
                end_x: p2,
            }),
            TAG_FLUSH => Ok(DirtyPacket::Flush),
            TAG_FRAME => Ok(DirtyPacket::Frame),
            TAG_BUFFER => Ok(DirtyPacket::Buffer {
                buffer_id: p0,
                offset: p1,
                len: p2,
            }),
            other => Err(LogError::UnknownPacketTag(other)),
        }
    }
}
