//! Inspect a video log: print its header and walk one channel's packet
//! stream, reporting per-frame packet counts.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use mvl::{probe, LogContainer, ReplayBackend, ReplayEngine};

#[derive(Parser, Debug)]
#[command(
    name = "mvl-replay",
    about = "Replay a video log capture and print per-frame statistics."
)]
struct Args {
    /// Video log path (.mvl)
    log: PathBuf,

    /// Channel to replay
    #[arg(long, default_value_t = 0, value_name = "ID")]
    channel: u32,

    /// Print the header and exit without replaying
    #[arg(long, action = clap::ArgAction::SetTrue)]
    probe: bool,

    /// Suppress per-frame lines
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet: bool,
}

#[derive(Default)]
struct FrameStats {
    registers: u64,
    palette: u64,
    oam: u64,
    vram_pages: u64,
    vram_bytes: u64,
    scanlines: u64,
    ranges: u64,
    buffers: u64,
}

impl FrameStats {
    fn is_empty(&self) -> bool {
        self.registers == 0
            && self.palette == 0
            && self.oam == 0
            && self.vram_pages == 0
            && self.scanlines == 0
            && self.ranges == 0
            && self.buffers == 0
    }
}

/// Counts packets instead of rendering them.
struct StatsBackend {
    quiet: bool,
    frame_index: u64,
    frame: FrameStats,
    total: FrameStats,
}

impl StatsBackend {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            frame_index: 0,
            frame: FrameStats::default(),
            total: FrameStats::default(),
        }
    }
}

impl ReplayBackend for StatsBackend {
    fn write_register(&mut self, _address: u32, _value: u16) {
        self.frame.registers += 1;
        self.total.registers += 1;
    }

    fn write_palette(&mut self, _address: u32, _value: u16) {
        self.frame.palette += 1;
        self.total.palette += 1;
    }

    fn write_oam(&mut self, _address: u32, _value: u16) {
        self.frame.oam += 1;
        self.total.oam += 1;
    }

    fn write_vram(&mut self, _offset: u32, data: &[u8]) {
        self.frame.vram_pages += 1;
        self.frame.vram_bytes += data.len() as u64;
        self.total.vram_pages += 1;
        self.total.vram_bytes += data.len() as u64;
    }

    fn draw_scanline(&mut self, _y: u32) {
        self.frame.scanlines += 1;
        self.total.scanlines += 1;
    }

    fn draw_range(&mut self, _y: u32, _start_x: u32, _end_x: u32) {
        self.frame.ranges += 1;
        self.total.ranges += 1;
    }

    fn finish_frame(&mut self) {
        if !self.quiet {
            let f = &self.frame;
            println!(
                "frame {}: reg={} pal={} oam={} vram={} pages ({} bytes) scanlines={} ranges={} buffers={}",
                self.frame_index,
                f.registers,
                f.palette,
                f.oam,
                f.vram_pages,
                f.vram_bytes,
                f.scanlines,
                f.ranges,
                f.buffers,
            );
        }
        self.frame_index += 1;
        self.frame = FrameStats::default();
    }

    fn write_buffer(&mut self, _buffer_id: u32, _offset: u32, _data: &[u8]) {
        self.frame.buffers += 1;
        self.total.buffers += 1;
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut file =
        File::open(&args.log).with_context(|| format!("open {}", args.log.display()))?;

    if args.probe {
        let header = probe(&mut file).context("not a video log")?;
        println!(
            "platform={} channels={} initial_state={}",
            header.platform,
            header.n_channels,
            if header.has_initial_state() { "yes" } else { "no" },
        );
        return Ok(());
    }

    let mut container = LogContainer::open(file).context("not a video log")?;
    println!(
        "platform={} channels={} initial_state={} bytes",
        container.platform(),
        container.channel_count(),
        container.initial_state().map_or(0, <[u8]>::len),
    );

    let Some(channel) = container.channel(args.channel) else {
        bail!(
            "channel {} out of range (log has {})",
            args.channel,
            container.channel_count()
        );
    };

    let mut backend = StatsBackend::new(args.quiet);
    ReplayEngine::new(channel)
        .run(&mut container, &mut backend, true)
        .context("replay failed")?;
    if !backend.frame.is_empty() {
        println!("(trailing packets after the last frame marker)");
    }

    let t = &backend.total;
    println!(
        "{} frames: reg={} pal={} oam={} vram={} pages ({} bytes) scanlines={} ranges={} buffers={}",
        backend.frame_index,
        t.registers,
        t.palette,
        t.oam,
        t.vram_pages,
        t.vram_bytes,
        t.scanlines,
        t.ranges,
        t.buffers,
    );
    if !container.footer_seen() {
        println!("(no footer: recording was not finalized)");
    }
    Ok(())
}
