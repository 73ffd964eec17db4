//! The multiplexed log container: header/footer protocol, channel
//! staging buffers, block-level flush on the write side and the lazy
//! per-channel block scan on the read side.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use flate2::Status;
use log::{debug, warn};

use crate::compress::{deflate_block, ChannelInflater};
use crate::error::{LogError, Result};
use crate::format::{
    BlockHeader, FileHeader, PlatformId, BLOCK_CHANNEL_HEADER, BLOCK_DATA, BLOCK_FLAG_COMPRESSED,
    BLOCK_FOOTER, BLOCK_INITIAL_STATE, FLAG_HAS_INITIAL_STATE, MAX_CHANNELS,
};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::ring::StagingRing;

/// Base staging-ring capacity and the per-call fill request size.
pub const BUFFER_BASE_SIZE: usize = 0x20000;

const READ_CHUNK: usize = 0x800;
const INFLATE_IN_CHUNK: usize = 0x400;
const INFLATE_OUT_CHUNK: usize = 0x800;

/// Identifier of one logical sub-stream. Only obtainable from
/// [`LogContainer::add_channel`] or [`LogContainer::channel`], so a held
/// id is always in range for its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Deflate each flushed block's payload. All-or-nothing per block,
    /// chosen once per recording.
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { compress: true }
    }
}

#[derive(Debug)]
struct LogChannel {
    ring: StagingRing,
    /// Backing-store offset where this channel's scan resumes.
    cursor: u64,
    /// Bytes left unconsumed in the data block currently being drained.
    pending: u64,
    inflater: Option<ChannelInflater>,
}

impl LogChannel {
    fn new() -> Self {
        Self {
            ring: StagingRing::with_capacity(BUFFER_BASE_SIZE),
            cursor: 0,
            pending: 0,
            inflater: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Record,
    Replay,
}

enum FillOutcome {
    Satisfied,
    EndOfStream,
}

struct InflateRead {
    produced: usize,
    /// The block's zlib stream ended and was torn down.
    finished: bool,
    /// Corrupt stream; the rest of the block was skipped.
    aborted: bool,
    /// The backing store ran out mid-block.
    truncated: bool,
}

/// Read just the file header from a backing store, without building a
/// container. Useful for sniffing platform and channel count.
pub fn probe<S: Read + Seek>(backing: &mut S) -> Result<FileHeader> {
    backing.seek(SeekFrom::Start(0))?;
    FileHeader::decode(backing)
}

#[derive(Debug)]
pub struct LogContainer<S> {
    backing: S,
    mode: Mode,
    platform: PlatformId,
    initial_state: Option<Vec<u8>>,
    channels: Vec<LogChannel>,
    active_channel: u32,
    options: WriteOptions,
    /// Latched once any channel's scan reaches the footer; nothing is
    /// ever written past a footer, so this is terminal until rewind.
    footer_seen: bool,
    finished: bool,
}

impl<S> LogContainer<S> {
    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    pub fn channel_count(&self) -> u32 {
        self.channels.len() as u32
    }

    /// Opaque baseline snapshot captured at recording start, if any. The
    /// format belongs to the emulation core; it is reapplied on rewind.
    pub fn initial_state(&self) -> Option<&[u8]> {
        self.initial_state.as_deref()
    }

    pub fn footer_seen(&self) -> bool {
        self.footer_seen
    }

    /// Resolve a raw channel id. Out-of-range ids resolve to `None`, so
    /// attaching a logger to a bogus id quietly degrades to no capture.
    pub fn channel(&self, raw: u32) -> Option<ChannelId> {
        if (raw as usize) < self.channels.len() {
            Some(ChannelId(raw))
        } else {
            None
        }
    }

    /// Current staging capacity of a channel. Monotonically
    /// non-decreasing over the channel's lifetime.
    pub fn buffer_capacity(&self, channel: ChannelId) -> usize {
        self.channels[channel.index()].ring.capacity()
    }

    pub fn into_inner(self) -> S {
        self.backing
    }

    fn require(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            return Err(LogError::WrongMode(match mode {
                Mode::Record => "recording",
                Mode::Replay => "replay",
            }));
        }
        Ok(())
    }
}

impl<S: Write + Seek> LogContainer<S> {
    /// Start a recording session. The backing store is rewound and owned
    /// for the container's lifetime.
    pub fn recorder(mut backing: S, platform: PlatformId, options: WriteOptions) -> Result<Self> {
        backing.seek(SeekFrom::Start(0))?;
        Ok(Self {
            backing,
            mode: Mode::Record,
            platform,
            initial_state: None,
            channels: Vec::new(),
            active_channel: 0,
            options,
            footer_seen: false,
            finished: false,
        })
    }

    pub fn set_initial_state(&mut self, state: Vec<u8>) -> Result<()> {
        self.require(Mode::Record)?;
        self.initial_state = Some(state);
        Ok(())
    }

    /// Register a new channel; `None` once `MAX_CHANNELS` are in use.
    pub fn add_channel(&mut self) -> Option<ChannelId> {
        if self.mode != Mode::Record || self.channels.len() >= MAX_CHANNELS {
            return None;
        }
        let id = self.channels.len() as u32;
        self.channels.push(LogChannel::new());
        Some(ChannelId(id))
    }

    /// Emit the file header, the initial-state block if present, and one
    /// zero-length channel-header placeholder per registered channel.
    /// Channel identities are thereby established before any data.
    pub fn write_header(&mut self) -> Result<()> {
        self.require(Mode::Record)?;
        let mut flags = 0;
        if self.initial_state.is_some() {
            flags |= FLAG_HAS_INITIAL_STATE;
        }
        FileHeader {
            flags,
            platform: self.platform,
            n_channels: self.channels.len() as u32,
        }
        .encode(&mut self.backing)?;

        if let Some(state) = &self.initial_state {
            let length = u32::try_from(state.len())
                .map_err(|_| LogError::Corrupt("initial state too large"))?;
            BlockHeader {
                block_type: BLOCK_INITIAL_STATE,
                length,
                channel_id: 0,
                flags: 0,
            }
            .encode(&mut self.backing)?;
            self.backing.write_bytes(state)?;
        }

        for id in 0..self.channels.len() as u32 {
            BlockHeader {
                block_type: BLOCK_CHANNEL_HEADER,
                length: 0,
                channel_id: id,
                flags: 0,
            }
            .encode(&mut self.backing)?;
        }
        Ok(())
    }

    /// Buffer bytes for a channel. Switching the active channel flushes
    /// the previous one first, so every block stays channel-homogeneous.
    pub fn append(&mut self, channel: ChannelId, data: &[u8]) -> Result<()> {
        self.require(Mode::Record)?;
        let id = channel.raw();
        if id != self.active_channel {
            self.flush_active()?;
            self.active_channel = id;
        }

        if self.channels[channel.index()].ring.free() < data.len() {
            self.flush_active()?;
            let ring = &mut self.channels[channel.index()].ring;
            if ring.capacity() < data.len() {
                // Next power of two at or above the oversized append;
                // growth failure is the one fatal write-path error.
                ring.grow_to(data.len().next_power_of_two())?;
            }
        }

        let written = self.channels[channel.index()].ring.write(data);
        debug_assert_eq!(written, data.len());

        // Exactly full: flush eagerly to bound buffering latency.
        if self.channels[channel.index()].ring.free() == 0 {
            self.flush_active()?;
        }
        Ok(())
    }

    /// Flush any staged data and append the footer. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        self.require(Mode::Record)?;
        if self.finished {
            return Ok(());
        }
        self.flush_active()?;
        BlockHeader {
            block_type: BLOCK_FOOTER,
            length: 0,
            channel_id: 0,
            flags: 0,
        }
        .encode(&mut self.backing)?;
        self.backing.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Write the active channel's staged bytes out as one data block.
    /// An empty ring flushes to nothing at all.
    fn flush_active(&mut self) -> Result<()> {
        let Some(channel) = self.channels.get_mut(self.active_channel as usize) else {
            return Ok(());
        };
        if channel.ring.is_empty() {
            return Ok(());
        }

        if self.options.compress {
            let payload = deflate_block(&mut channel.ring)?;
            let length = u32::try_from(payload.len())
                .map_err(|_| LogError::Corrupt("data block too large"))?;
            BlockHeader {
                block_type: BLOCK_DATA,
                length,
                channel_id: self.active_channel,
                flags: BLOCK_FLAG_COMPRESSED,
            }
            .encode(&mut self.backing)?;
            self.backing.write_bytes(&payload)?;
        } else {
            let length = u32::try_from(channel.ring.len())
                .map_err(|_| LogError::Corrupt("data block too large"))?;
            BlockHeader {
                block_type: BLOCK_DATA,
                length,
                channel_id: self.active_channel,
                flags: 0,
            }
            .encode(&mut self.backing)?;
            let mut chunk = [0u8; READ_CHUNK];
            while !channel.ring.is_empty() {
                let n = channel.ring.read(&mut chunk);
                self.backing.write_bytes(&chunk[..n])?;
            }
        }
        Ok(())
    }
}

impl<S: Read + Seek> LogContainer<S> {
    /// Open a finished recording for replay. The header and the optional
    /// initial-state blob are parsed eagerly; data blocks are discovered
    /// lazily by per-channel scans.
    pub fn open(mut backing: S) -> Result<Self> {
        let (header, initial_state) = read_front(&mut backing)?;
        let pos = backing.stream_position()?;
        let channels = (0..header.n_channels)
            .map(|_| {
                let mut channel = LogChannel::new();
                channel.cursor = pos;
                channel
            })
            .collect();
        Ok(Self {
            backing,
            mode: Mode::Replay,
            platform: header.platform,
            initial_state,
            channels,
            active_channel: 0,
            options: WriteOptions::default(),
            footer_seen: false,
            finished: true,
        })
    }

    /// Read up to `buf.len()` bytes of a channel's decoded sub-stream,
    /// draining the staging ring and refilling it from the backing store
    /// as needed. Returns a short count at end of stream.
    pub fn read_channel(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize> {
        self.require(Mode::Replay)?;
        let id = channel.index();
        if self.channels[id].ring.len() >= buf.len() {
            return Ok(self.channels[id].ring.read(buf));
        }
        let mut total = self.channels[id].ring.read(buf);
        let _ = self.fill(id, BUFFER_BASE_SIZE)?;
        total += self.channels[id].ring.read(&mut buf[total..]);
        Ok(total)
    }

    /// Scan the backing store from the channel's cursor, replenishing its
    /// ring with up to `length` decoded bytes. Blocks belonging to other
    /// channels, and unknown block types, are skipped by their declared
    /// length alone.
    fn fill(&mut self, id: usize, length: usize) -> Result<FillOutcome> {
        let mut length = length.min(self.channels[id].ring.free());
        self.backing
            .seek(SeekFrom::Start(self.channels[id].cursor))?;

        while length > 0 {
            // An inflater may outlive its block's input: the stream can
            // still hold undrained output after the last payload byte
            // was consumed.
            if self.channels[id].pending > 0 || self.channels[id].inflater.is_some() {
                if self.channels[id].inflater.is_some() {
                    let read = self.read_compressed(id, length)?;
                    length -= read.produced;
                    if read.aborted {
                        // Keep what was already buffered; the next fill
                        // resumes after the bad block.
                        return Ok(FillOutcome::Satisfied);
                    }
                    if read.truncated {
                        return Ok(FillOutcome::EndOfStream);
                    }
                    continue;
                }
                let want = (self.channels[id].pending).min(length as u64) as usize;
                let got = self.read_raw(id, want)?;
                length -= got;
                if got < want {
                    return Ok(FillOutcome::EndOfStream);
                }
                continue;
            }

            let header = match BlockHeader::decode(&mut self.backing) {
                Ok(header) => header,
                Err(LogError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(FillOutcome::EndOfStream);
                }
                Err(err) => return Err(err),
            };
            if header.block_type == BLOCK_FOOTER {
                self.footer_seen = true;
                return Ok(FillOutcome::EndOfStream);
            }
            if header.channel_id != id as u32 || header.block_type != BLOCK_DATA {
                if header.block_type != BLOCK_DATA && header.block_type != BLOCK_CHANNEL_HEADER
                    && header.block_type != BLOCK_INITIAL_STATE
                {
                    debug!(
                        "skipping unknown block type {:#x} ({} bytes)",
                        header.block_type, header.length
                    );
                }
                self.backing
                    .seek(SeekFrom::Current(i64::from(header.length)))?;
                continue;
            }

            // Matched: the cursor moves past the consumed header so this
            // block header is never re-scanned.
            self.channels[id].cursor = self.backing.stream_position()?;
            if header.length == 0 {
                continue;
            }
            self.channels[id].pending = u64::from(header.length);
            if header.is_compressed() {
                self.channels[id].inflater = Some(ChannelInflater::new());
            }
        }
        Ok(FillOutcome::Satisfied)
    }

    /// Copy plain block payload into the ring, advancing cursor and
    /// pending counts by exactly what was buffered.
    fn read_raw(&mut self, id: usize, want: usize) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        while total < want {
            let take = (want - total).min(READ_CHUNK);
            let n = self.backing.read(&mut chunk[..take])?;
            if n == 0 {
                break;
            }
            let channel = &mut self.channels[id];
            let buffered = channel.ring.write(&chunk[..n]);
            channel.pending -= buffered as u64;
            channel.cursor += buffered as u64;
            total += buffered;
            if buffered < n {
                // Ring full; unbuffered bytes are re-read next fill since
                // the cursor was not advanced past them.
                break;
            }
        }
        Ok(total)
    }

    /// Feed compressed block payload through the channel's persistent
    /// inflate stream into the ring. `budget` bounds the decoded output;
    /// compressed input that was read but not consumed is re-read on the
    /// next fill because the cursor only tracks consumed bytes.
    fn read_compressed(&mut self, id: usize, budget: usize) -> Result<InflateRead> {
        let mut fbuf = [0u8; INFLATE_IN_CHUNK];
        let mut zbuf = [0u8; INFLATE_OUT_CHUNK];
        let mut read = InflateRead {
            produced: 0,
            finished: false,
            aborted: false,
            truncated: false,
        };

        'refill: while read.produced < budget {
            let in_len = if self.channels[id].pending > 0 {
                let take = (self.channels[id].pending as usize).min(INFLATE_IN_CHUNK);
                let n = self.backing.read(&mut fbuf[..take])?;
                if n == 0 {
                    read.truncated = true;
                    break;
                }
                n
            } else {
                // No block bytes left: drain output still buffered inside
                // the inflate state.
                0
            };

            let mut consumed = 0;
            loop {
                if read.produced >= budget {
                    break 'refill;
                }
                let out_budget = (budget - read.produced).min(INFLATE_OUT_CHUNK);
                let channel = &mut self.channels[id];
                let inflater = channel.inflater.as_mut().expect("inflater set by fill");
                let (step_in, step_out, status) =
                    inflater.step(&fbuf[consumed..in_len], &mut zbuf[..out_budget]);

                consumed += step_in;
                channel.pending -= step_in as u64;
                channel.cursor += step_in as u64;
                read.produced += channel.ring.write(&zbuf[..step_out]);

                match status {
                    Some(Status::StreamEnd) => {
                        read.finished = true;
                        break 'refill;
                    }
                    Some(_) if step_in == 0 && step_out == 0 => {
                        // No forward progress and no stream end: malformed
                        // input would loop forever without this guard.
                        read.aborted = true;
                        break 'refill;
                    }
                    Some(_) => {}
                    None => {
                        read.aborted = true;
                        break 'refill;
                    }
                }

                if consumed == in_len {
                    continue 'refill;
                }
            }
        }

        let channel = &mut self.channels[id];
        if read.finished || read.aborted {
            channel.inflater = None;
        }
        if read.finished && channel.pending > 0 {
            // Trailing bytes after the stream end; never written by the
            // recorder. Skip them rather than misreading them as a plain
            // payload.
            debug!(
                "channel {id}: {} byte(s) after compressed stream end",
                channel.pending
            );
            channel.cursor += channel.pending;
            channel.pending = 0;
        }
        if read.aborted {
            warn!(
                "corrupt compressed block on channel {id}: skipping {} bytes",
                channel.pending
            );
            // Jump the scan past the rest of the payload.
            channel.cursor += channel.pending;
            channel.pending = 0;
        }
        if read.finished || read.aborted {
            // The chunked reads may have run ahead of the consumed count;
            // put the scan back at the cursor before the caller continues.
            let cursor = channel.cursor;
            self.backing.seek(SeekFrom::Start(cursor))?;
        }
        Ok(read)
    }

    /// Reset every channel to the start of the data region and reload the
    /// initial-state snapshot, so a finished recording can be replayed
    /// again without reopening the backing store.
    pub fn rewind(&mut self) -> Result<()> {
        self.require(Mode::Replay)?;
        let (_, initial_state) = read_front(&mut self.backing)?;
        self.initial_state = initial_state;
        let pos = self.backing.stream_position()?;
        for channel in &mut self.channels {
            channel.ring.clear();
            channel.pending = 0;
            channel.cursor = pos;
            channel.inflater = None;
        }
        self.footer_seen = false;
        Ok(())
    }
}

/// Parse the file header and, if flagged, the initial-state block that
/// must immediately follow it. Leaves the stream at the start of the
/// channel-header placeholders.
fn read_front<S: Read + Seek>(backing: &mut S) -> Result<(FileHeader, Option<Vec<u8>>)> {
    backing.seek(SeekFrom::Start(0))?;
    let header = FileHeader::decode(backing)?;
    if header.n_channels as usize > MAX_CHANNELS {
        return Err(LogError::TooManyChannels(header.n_channels));
    }
    let mut initial_state = None;
    if header.has_initial_state() {
        let block = BlockHeader::decode(backing)?;
        if block.block_type != BLOCK_INITIAL_STATE {
            return Err(LogError::Corrupt("expected initial-state block"));
        }
        initial_state = Some(backing.read_exact_vec(block.length as usize)?);
    }
    Ok((header, initial_state))
}
