//! Replay side: pulls decoded packets from one channel in order and
//! dispatches them to a renderer backend.

use std::io::{Read, Seek};

use crate::container::{ChannelId, LogContainer};
use crate::error::{LogError, Result};
use crate::format::{DirtyPacket, PACKET_SIZE};

/// Renderer backend boundary. The engine applies shadow-state mutations
/// and draw triggers here; what is visually correct is the backend's
/// business.
pub trait ReplayBackend {
    fn write_register(&mut self, address: u32, value: u16);
    fn write_palette(&mut self, address: u32, value: u16);
    fn write_oam(&mut self, address: u32, value: u16);
    fn write_vram(&mut self, offset: u32, data: &[u8]);
    fn draw_scanline(&mut self, y: u32);
    fn draw_range(&mut self, y: u32, start_x: u32, end_x: u32);
    fn finish_frame(&mut self);
    fn write_buffer(&mut self, _buffer_id: u32, _offset: u32, _data: &[u8]) {}
}

/// Synchronization hooks for a producer/consumer pair sharing a live
/// container across two execution contexts. All default to no-ops, which
/// is correct for the common case of replaying a finished recording.
pub trait LoggerHooks {
    fn lock(&self) {}
    fn unlock(&self) {}
    /// Park until the producer signals that more data exists.
    fn wait(&self) {}
    /// Producer side: signal a parked consumer.
    fn wake(&self) {}
}

/// No synchronization: single reader over a static backing store.
pub struct NoHooks;

impl LoggerHooks for NoHooks {}

/// Outcome of one `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStep {
    /// At least one packet was dispatched; call again for more.
    Progress,
    /// Non-blocking mode and nothing buffered yet; retry later.
    WouldBlock,
    /// The footer was reached (or the stream will not grow); terminal.
    EndOfStream,
}

enum StepOutcome {
    Packet,
    /// No complete packet was dispatched; `advanced` reports whether any
    /// bytes of a partial header or blob were consumed.
    NoData { advanced: bool },
}

/// Decodes one channel's packet stream. A packet and its trailing blob
/// are the atomic unit of consumption: partial records are buffered here
/// across calls, never half-dispatched.
pub struct ReplayEngine<H = NoHooks> {
    channel: ChannelId,
    hooks: H,
    header: [u8; PACKET_SIZE],
    header_len: usize,
    packet: Option<DirtyPacket>,
    blob: Vec<u8>,
}

impl ReplayEngine<NoHooks> {
    pub fn new(channel: ChannelId) -> Self {
        Self::with_hooks(channel, NoHooks)
    }
}

impl<H: LoggerHooks> ReplayEngine<H> {
    pub fn with_hooks(channel: ChannelId, hooks: H) -> Self {
        Self {
            channel,
            hooks,
            header: [0; PACKET_SIZE],
            header_len: 0,
            packet: None,
            blob: Vec::new(),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Dispatch packets until the stream runs dry.
    ///
    /// With `block` set, an exhausted stream parks on the wait hook; if
    /// the hook returns without new data appearing (the no-op hooks of a
    /// static recording), that is treated as end of stream. Without
    /// `block`, the call returns immediately with `WouldBlock` or
    /// `Progress` so the caller can poll.
    pub fn run<S, B>(
        &mut self,
        container: &mut LogContainer<S>,
        backend: &mut B,
        block: bool,
    ) -> Result<ReplayStep>
    where
        S: Read + Seek,
        B: ReplayBackend,
    {
        let mut progressed = false;
        let mut waited = false;
        loop {
            match self.step(container, backend)? {
                StepOutcome::Packet => {
                    progressed = true;
                    waited = false;
                }
                StepOutcome::NoData { advanced } => {
                    // A partially assembled record still consumed bytes;
                    // only a step that moved nothing may arm the
                    // end-of-stream fallback.
                    if advanced {
                        progressed = true;
                        waited = false;
                    }
                    if container.footer_seen() {
                        if self.header_len != 0 || self.packet.is_some() {
                            return Err(LogError::Corrupt("truncated packet at end of stream"));
                        }
                        return Ok(ReplayStep::EndOfStream);
                    }
                    if !block {
                        return Ok(if progressed {
                            ReplayStep::Progress
                        } else {
                            ReplayStep::WouldBlock
                        });
                    }
                    if waited {
                        return Ok(ReplayStep::EndOfStream);
                    }
                    self.hooks.wait();
                    waited = true;
                }
            }
        }
    }

    /// Consume and dispatch at most one packet. Partial progress stays
    /// buffered in `self` so a later call resumes mid-record.
    fn step<S, B>(
        &mut self,
        container: &mut LogContainer<S>,
        backend: &mut B,
    ) -> Result<StepOutcome>
    where
        S: Read + Seek,
        B: ReplayBackend,
    {
        if self.packet.is_none() {
            let n = {
                self.hooks.lock();
                let result =
                    container.read_channel(self.channel, &mut self.header[self.header_len..]);
                self.hooks.unlock();
                result?
            };
            self.header_len += n;
            if self.header_len < PACKET_SIZE {
                return Ok(StepOutcome::NoData { advanced: n > 0 });
            }
            self.packet = Some(DirtyPacket::decode(&self.header)?);
            self.header_len = 0;
            self.blob.clear();
        }

        let packet = self.packet.expect("set above");
        let need = packet.trailing_len();
        if self.blob.len() < need {
            let start = self.blob.len();
            self.blob
                .try_reserve_exact(need - start)
                .map_err(|_| LogError::OutOfMemory { len: need })?;
            self.blob.resize(need, 0);
            let n = {
                self.hooks.lock();
                let result = container.read_channel(self.channel, &mut self.blob[start..]);
                self.hooks.unlock();
                result?
            };
            self.blob.truncate(start + n);
            if self.blob.len() < need {
                return Ok(StepOutcome::NoData { advanced: n > 0 });
            }
        }

        match packet {
            DirtyPacket::Register { address, value } => backend.write_register(address, value),
            DirtyPacket::Palette { address, value } => backend.write_palette(address, value),
            DirtyPacket::Oam { address, value } => backend.write_oam(address, value),
            DirtyPacket::Vram { offset, .. } => backend.write_vram(offset, &self.blob),
            DirtyPacket::Scanline { y } => backend.draw_scanline(y),
            DirtyPacket::Range { y, start_x, end_x } => backend.draw_range(y, start_x, end_x),
            DirtyPacket::Flush => {
                // Alignment marker only; consumed without effect.
            }
            DirtyPacket::Frame => backend.finish_frame(),
            DirtyPacket::Buffer {
                buffer_id, offset, ..
            } => backend.write_buffer(buffer_id, offset, &self.blob),
        }
        self.packet = None;
        self.blob.clear();
        Ok(StepOutcome::Packet)
    }
}
