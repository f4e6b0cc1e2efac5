//! armsoc-sim - drive the scanout core against a virtual display
//!
//! Runs a client that swaps a full-screen window at 60 Hz on the first
//! head. Partway through the window shrinks so swaps fall back to blits,
//! then grows again and the screen returns to flipping. At the end the
//! swap and flip counters are logged.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use armsoc_scanout::alloc::Access;
use armsoc_scanout::swap::{Attachment, SwapStatus};
use armsoc_scanout::{
    Device, DriverOptions, Drawable, MemAllocator, Screen, SwapBuffer, SwapCompletion, SwapKind,
    VirtualHead, VirtualKms,
};

#[derive(Parser, Debug)]
#[command(name = "armsoc-sim")]
#[command(about = "Exercise the ARM SoC scanout core on a virtual KMS device", long_about = None)]
struct Args {
    /// Driver options file
    #[arg(short, long, default_value = "armsoc.toml")]
    config: PathBuf,

    /// Number of frames to swap
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Head layout, left to right
    #[arg(long, value_delimiter = ',', default_value = "1920x1080,1280x1024")]
    heads: Vec<String>,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,

    /// Also write a daily log file to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn parse_head(spec: &str) -> Result<VirtualHead> {
    let (w, h) = spec
        .split_once('x')
        .ok_or_else(|| anyhow!("head {:?} is not WIDTHxHEIGHT", spec))?;
    let width: u16 = w.trim().parse().with_context(|| format!("bad width in {:?}", spec))?;
    let height: u16 = h.trim().parse().with_context(|| format!("bad height in {:?}", spec))?;
    if width == 0 || height == 0 {
        bail!("head {:?} has no area", spec);
    }
    Ok(VirtualHead::connected(width, height, 60))
}

/// The simulated client and the screen it draws on
struct Sim {
    screen: Screen,
    window: Drawable,
    front: SwapBuffer,
    back: SwapBuffer,
    /// Full-screen geometry of the first head
    fullscreen: (i32, i32, u32, u32),
    frame: u32,
    frames: u32,
    flips: Rc<Cell<u32>>,
    blits: Rc<Cell<u32>>,
    failed: Rc<Cell<u32>>,
    done: bool,
}

impl Sim {
    fn new(screen: Screen, frames: u32) -> Result<Self> {
        let crtc = screen
            .config()
            .crtcs
            .iter()
            .find(|c| c.enabled)
            .ok_or_else(|| anyhow!("no enabled CRTC"))?;
        let fullscreen = (crtc.x, crtc.y, crtc.width(), crtc.height());

        let (x, y, w, h) = fullscreen;
        let window = Drawable::window(1, x, y, w, h, screen.root_pixmap().clone());
        let front = screen.create_swap_buffer(&window, Attachment::FrontLeft)?;
        let back = screen.create_swap_buffer(&window, Attachment::BackLeft)?;

        Ok(Self {
            screen,
            window,
            front,
            back,
            fullscreen,
            frame: 0,
            frames,
            flips: Rc::new(Cell::new(0)),
            blits: Rc::new(Cell::new(0)),
            failed: Rc::new(Cell::new(0)),
            done: false,
        })
    }

    /// Resize the window and give it a back buffer of the new size
    fn reshape(&mut self, width: u32, height: u32) -> Result<()> {
        let (x, y, _, _) = self.fullscreen;
        info!("Frame {}: window now {}x{}", self.frame, width, height);
        self.window.x = x;
        self.window.y = y;
        self.window.width = width;
        self.window.height = height;
        self.window.clip = vec![self.window.bounds()];
        self.back = self
            .screen
            .create_swap_buffer(&self.window, Attachment::BackLeft)?;
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        // Complete the previous frame's flip before reusing its buffers
        self.screen.dispatch_events()?;
        self.back.reuse()?;

        let (_, _, w, h) = self.fullscreen;
        if self.frame == self.frames / 2 {
            self.reshape(w / 2, h / 2)?;
        } else if self.frame == self.frames * 3 / 4 {
            self.reshape(w, h)?;
        }

        self.render()?;

        let (flips, blits, failed) = (self.flips.clone(), self.blits.clone(), self.failed.clone());
        let callback = Box::new(move |c: SwapCompletion| {
            if c.status == SwapStatus::Failed {
                failed.set(failed.get() + 1);
                return;
            }
            match c.kind {
                SwapKind::Flip => flips.set(flips.get() + 1),
                SwapKind::Blit => blits.set(blits.get() + 1),
            }
        });
        match self
            .screen
            .schedule_swap(&mut self.window, &mut self.front, &mut self.back, callback)
        {
            Ok(kind) => debug!("Frame {}: {:?}", self.frame, kind),
            Err(e) => warn!("Frame {}: swap failed: {}", self.frame, e),
        }

        self.frame += 1;
        Ok(())
    }

    /// Fill the back buffer with a colour that changes every frame
    fn render(&self) -> Result<()> {
        let bo = self
            .back
            .pixmap
            .bo()
            .ok_or_else(|| anyhow!("back buffer has no bo"))?;
        let shade = (self.frame * 4 % 256) as u8;
        let mut access = bo.cpu_access(Access::Write)?;
        for pixel in access.bytes_mut().chunks_exact_mut(4) {
            pixel.copy_from_slice(&[shade, 0x40, 0xff - shade, 0xff]);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.screen.close_screen()?;
        info!(
            "{} frames: {} flipped, {} blitted, {} failed",
            self.frame,
            self.flips.get(),
            self.blits.get(),
            self.failed.get()
        );
        self.done = true;
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut options = DriverOptions::load(&args.config)?;
    options.debug |= args.debug;

    let default_filter = options.log_filter();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, _guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "armsoc-sim.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (
                Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let heads = args
        .heads
        .iter()
        .map(|h| parse_head(h))
        .collect::<Result<Vec<_>>>()?;
    info!(heads = heads.len(), frames = args.frames, "armsoc-sim starting");

    let kms = Rc::new(VirtualKms::new(heads));
    if !Screen::probe(kms.as_ref())? {
        bail!("virtual device has no usable CRTCs");
    }
    let device = Device::new(Rc::new(MemAllocator::new(options.pitch_alignment)), kms.clone());
    let mut screen = Screen::pre_init(options, device)?;
    screen.screen_init()?;

    let mut sim = Sim::new(screen, args.frames)?;

    let mut event_loop: EventLoop<Sim> = EventLoop::try_new()?;
    let frame_timer = Timer::from_duration(Duration::from_millis(16));
    event_loop
        .handle()
        .insert_source(frame_timer, |_, _, sim| {
            if sim.done {
                return TimeoutAction::Drop;
            }
            let result = if sim.frame < sim.frames {
                sim.tick()
            } else {
                sim.finish()
            };
            if let Err(e) = result {
                error!("Frame {}: {:#}", sim.frame, e);
                sim.done = true;
                return TimeoutAction::Drop;
            }
            TimeoutAction::ToDuration(Duration::from_millis(16))
        })
        .map_err(|e| anyhow!("Failed to insert frame timer: {}", e.error))?;

    info!("Entering event loop");
    while !sim.done {
        event_loop.dispatch(Some(Duration::from_millis(100)), &mut sim)?;
    }

    let stats = kms.stats();
    info!(
        set_crtc = stats.set_crtc,
        page_flips = stats.page_flips,
        events = stats.events_delivered,
        "Done"
    );
    Ok(())
}
