//! Capture side: observes GPU-state mutations and encodes dirty packets.
//!
//! Register, palette and OAM writes are order-significant and emit
//! immediately. VRAM writes only flip a page bit; the pages are swept out
//! as single transfers at the next flush point, collapsing per-pixel
//! write bursts into one copy per page.

use std::io::{Seek, Write};

use crate::container::{ChannelId, LogContainer};
use crate::error::Result;
use crate::format::{DirtyPacket, VRAM_PAGE_SIZE};

/// OAM dirty-tracking granularity: one attribute slot.
pub const OAM_SLOT_SIZE: usize = 8;

/// Destination for encoded dirty packets and their trailing blobs.
pub trait DirtySink {
    fn write_packet(&mut self, packet: &DirtyPacket) -> Result<()>;
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;
}

/// Streams packets into one container channel.
pub struct ChannelSink<'a, S> {
    container: &'a mut LogContainer<S>,
    channel: ChannelId,
}

impl<'a, S: Write + Seek> ChannelSink<'a, S> {
    pub fn new(container: &'a mut LogContainer<S>, channel: ChannelId) -> Self {
        Self { container, channel }
    }

    /// Attach by raw channel id. An out-of-range id yields no sink, so the
    /// caller falls back to discarding capture output.
    pub fn attach(container: &'a mut LogContainer<S>, raw: u32) -> Option<Self> {
        let channel = container.channel(raw)?;
        Some(Self { container, channel })
    }
}

impl<S: Write + Seek> DirtySink for ChannelSink<'_, S> {
    fn write_packet(&mut self, packet: &DirtyPacket) -> Result<()> {
        self.container.append(self.channel, &packet.encode())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.container.append(self.channel, data)
    }
}

/// Discards everything; the sink of a read-only logger.
pub struct NullSink;

impl DirtySink for NullSink {
    fn write_packet(&mut self, _packet: &DirtyPacket) -> Result<()> {
        Ok(())
    }

    fn write_bytes(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Forwards raw encoded packets to any writer, bypassing the container.
/// Used when a cooperating consumer sits on the other end of a pipe.
pub struct PassThroughSink<W>(pub W);

impl<W: Write> DirtySink for PassThroughSink<W> {
    fn write_packet(&mut self, packet: &DirtyPacket) -> Result<()> {
        self.0.write_all(&packet.encode())?;
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data)?;
        Ok(())
    }
}

/// Supplies VRAM contents for page transfers during capture. Implemented
/// by the renderer backend, which owns the memory being recorded.
pub trait VramSource {
    fn vram(&self) -> &[u8];
}

impl VramSource for [u8] {
    fn vram(&self) -> &[u8] {
        self
    }
}

impl VramSource for Vec<u8> {
    fn vram(&self) -> &[u8] {
        self
    }
}

/// One bit per fixed-size region of a tracked memory.
struct DirtyBitmap {
    words: Vec<u32>,
    regions: usize,
}

impl DirtyBitmap {
    fn new(memory_len: usize, region_size: usize) -> Self {
        let regions = memory_len.div_ceil(region_size);
        Self {
            words: vec![0; regions.div_ceil(32)],
            regions,
        }
    }

    fn set(&mut self, region: usize) -> bool {
        if region >= self.regions {
            return false;
        }
        let bit = 1u32 << (region & 31);
        let word = &mut self.words[region >> 5];
        let newly = *word & bit == 0;
        *word |= bit;
        newly
    }

    fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

pub struct DirtyTracker {
    vram_dirty: DirtyBitmap,
    oam_dirty: DirtyBitmap,
    vram_len: usize,
}

impl DirtyTracker {
    pub fn new(vram_len: usize, oam_len: usize) -> Self {
        Self {
            vram_dirty: DirtyBitmap::new(vram_len, VRAM_PAGE_SIZE),
            oam_dirty: DirtyBitmap::new(oam_len, OAM_SLOT_SIZE),
            vram_len,
        }
    }

    /// Clear all dirty state, e.g. when the recorded core resets.
    pub fn reset(&mut self) {
        self.vram_dirty.clear_all();
        self.oam_dirty.clear_all();
    }

    pub fn write_register<K: DirtySink>(
        &mut self,
        sink: &mut K,
        address: u32,
        value: u16,
    ) -> Result<()> {
        sink.write_packet(&DirtyPacket::Register { address, value })
    }

    pub fn write_palette<K: DirtySink>(
        &mut self,
        sink: &mut K,
        address: u32,
        value: u16,
    ) -> Result<()> {
        sink.write_packet(&DirtyPacket::Palette { address, value })
    }

    pub fn write_oam<K: DirtySink>(
        &mut self,
        sink: &mut K,
        address: u32,
        value: u16,
    ) -> Result<()> {
        self.oam_dirty.set(address as usize / OAM_SLOT_SIZE);
        sink.write_packet(&DirtyPacket::Oam { address, value })
    }

    /// Defer a VRAM write: repeated writes to one page before the next
    /// flush collapse into a single transfer.
    pub fn write_vram(&mut self, address: u32) {
        self.vram_dirty.set(address as usize / VRAM_PAGE_SIZE);
    }

    /// Sweep the dirty bitmap, emitting one page transfer per still-set
    /// bit, then clear it. Every reader past this point sees VRAM state
    /// current as of the following marker.
    pub fn flush_vram<K: DirtySink, V: VramSource + ?Sized>(
        &mut self,
        sink: &mut K,
        vram: &V,
    ) -> Result<()> {
        let memory = vram.vram();
        for word_index in 0..self.vram_dirty.words.len() {
            if self.vram_dirty.words[word_index] == 0 {
                continue;
            }
            let bitmap = std::mem::take(&mut self.vram_dirty.words[word_index]);
            for bit in 0..32 {
                if bitmap & (1 << bit) == 0 {
                    continue;
                }
                let page = (word_index << 5) | bit;
                let offset = page * VRAM_PAGE_SIZE;
                let end = (offset + VRAM_PAGE_SIZE).min(self.vram_len).min(memory.len());
                if offset >= end {
                    continue;
                }
                sink.write_packet(&DirtyPacket::Vram {
                    offset: offset as u32,
                    len: (end - offset) as u32,
                })?;
                sink.write_bytes(&memory[offset..end])?;
            }
        }
        Ok(())
    }

    pub fn draw_scanline<K: DirtySink, V: VramSource + ?Sized>(
        &mut self,
        sink: &mut K,
        vram: &V,
        y: u32,
    ) -> Result<()> {
        self.flush_vram(sink, vram)?;
        sink.write_packet(&DirtyPacket::Scanline { y })
    }

    pub fn draw_range<K: DirtySink, V: VramSource + ?Sized>(
        &mut self,
        sink: &mut K,
        vram: &V,
        y: u32,
        start_x: u32,
        end_x: u32,
    ) -> Result<()> {
        self.flush_vram(sink, vram)?;
        sink.write_packet(&DirtyPacket::Range { y, start_x, end_x })
    }

    /// Explicit flush point: push out deferred VRAM, then a marker the
    /// replay loop consumes for alignment.
    pub fn flush<K: DirtySink, V: VramSource + ?Sized>(
        &mut self,
        sink: &mut K,
        vram: &V,
    ) -> Result<()> {
        self.flush_vram(sink, vram)?;
        sink.write_packet(&DirtyPacket::Flush)
    }

    pub fn finish_frame<K: DirtySink>(&mut self, sink: &mut K) -> Result<()> {
        sink.write_packet(&DirtyPacket::Frame)
    }

    pub fn write_buffer<K: DirtySink>(
        &mut self,
        sink: &mut K,
        buffer_id: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        sink.write_packet(&DirtyPacket::Buffer {
            buffer_id,
            offset,
            len: data.len() as u32,
        })?;
        sink.write_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectSink {
        packets: Vec<DirtyPacket>,
        blobs: Vec<Vec<u8>>,
    }

    impl DirtySink for CollectSink {
        fn write_packet(&mut self, packet: &DirtyPacket) -> Result<()> {
            self.packets.push(*packet);
            Ok(())
        }

        fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
            self.blobs.push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn repeated_page_writes_coalesce() {
        let vram = vec![0xa5u8; 4 * VRAM_PAGE_SIZE];
        let mut tracker = DirtyTracker::new(vram.len(), 0x400);
        let mut sink = CollectSink::default();

        for i in 0..100 {
            tracker.write_vram(VRAM_PAGE_SIZE as u32 + i);
        }
        tracker.flush_vram(&mut sink, &vram).unwrap();

        assert_eq!(
            sink.packets,
            vec![DirtyPacket::Vram {
                offset: VRAM_PAGE_SIZE as u32,
                len: VRAM_PAGE_SIZE as u32,
            }]
        );
        assert_eq!(sink.blobs.len(), 1);
        assert_eq!(sink.blobs[0].len(), VRAM_PAGE_SIZE);

        // A second flush with no intervening writes emits nothing.
        sink.packets.clear();
        tracker.flush_vram(&mut sink, &vram).unwrap();
        assert!(sink.packets.is_empty());
    }

    #[test]
    fn scanline_flushes_deferred_vram_first() {
        let vram = vec![0u8; 2 * VRAM_PAGE_SIZE];
        let mut tracker = DirtyTracker::new(vram.len(), 0x400);
        let mut sink = CollectSink::default();

        tracker.write_vram(0);
        tracker.draw_scanline(&mut sink, &vram, 17).unwrap();

        assert_eq!(sink.packets.len(), 2);
        assert!(matches!(sink.packets[0], DirtyPacket::Vram { .. }));
        assert_eq!(sink.packets[1], DirtyPacket::Scanline { y: 17 });
    }

    #[test]
    fn short_tail_page_is_clamped() {
        // VRAM length not a page multiple: the last transfer shrinks.
        let vram = vec![0u8; VRAM_PAGE_SIZE + 0x200];
        let mut tracker = DirtyTracker::new(vram.len(), 0x400);
        let mut sink = CollectSink::default();

        tracker.write_vram(VRAM_PAGE_SIZE as u32 + 1);
        tracker.flush_vram(&mut sink, &vram).unwrap();

        assert_eq!(
            sink.packets,
            vec![DirtyPacket::Vram {
                offset: VRAM_PAGE_SIZE as u32,
                len: 0x200,
            }]
        );
    }

    #[test]
    fn pass_through_sink_forwards_raw_packets() {
        let mut sink = PassThroughSink(Vec::new());
        let packet = DirtyPacket::Scanline { y: 3 };
        sink.write_packet(&packet).unwrap();
        sink.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(&sink.0[..16], &packet.encode());
        assert_eq!(&sink.0[16..], &[1, 2, 3]);
    }

    #[test]
    fn attach_rejects_out_of_range_channel() {
        use crate::container::WriteOptions;
        use crate::format::PlatformId;
        use std::io::Cursor;

        let mut container = LogContainer::recorder(
            Cursor::new(Vec::new()),
            PlatformId::GBA,
            WriteOptions { compress: false },
        )
        .unwrap();
        container.add_channel().unwrap();
        assert!(ChannelSink::attach(&mut container, 0).is_some());
        assert!(ChannelSink::attach(&mut container, 1).is_none());
    }

    #[test]
    fn reset_clears_pending_pages() {
        let vram = vec![0u8; VRAM_PAGE_SIZE];
        let mut tracker = DirtyTracker::new(vram.len(), 0x400);
        let mut sink = CollectSink::default();

        tracker.write_vram(12);
        tracker.reset();
        tracker.flush_vram(&mut sink, &vram).unwrap();
        assert!(sink.packets.is_empty());
    }
}
