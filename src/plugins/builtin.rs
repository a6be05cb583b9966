//! Built-in demo content sources.
//!
//! Stand-ins for the external plugin catalog so the binary shows something
//! out of the box: a UTC clock and a striped banner. The banner doubles as
//! the Vegas/dynamic-duration exercise plugin in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::frame::Frame;
use crate::plugins::{ModeDecl, Plugin, PluginError, Segment, SegmentMode};

/// 3x5 glyph table for clock digits — one byte per row, low 3 bits used.
static GLYPHS: Lazy<HashMap<char, [u8; 5]>> = Lazy::new(|| {
    HashMap::from([
        ('0', [0b111, 0b101, 0b101, 0b101, 0b111]),
        ('1', [0b010, 0b110, 0b010, 0b010, 0b111]),
        ('2', [0b111, 0b001, 0b111, 0b100, 0b111]),
        ('3', [0b111, 0b001, 0b111, 0b001, 0b111]),
        ('4', [0b101, 0b101, 0b111, 0b001, 0b001]),
        ('5', [0b111, 0b100, 0b111, 0b001, 0b111]),
        ('6', [0b111, 0b100, 0b111, 0b101, 0b111]),
        ('7', [0b111, 0b001, 0b010, 0b010, 0b010]),
        ('8', [0b111, 0b101, 0b111, 0b101, 0b111]),
        ('9', [0b111, 0b101, 0b111, 0b001, 0b111]),
        (':', [0b000, 0b010, 0b000, 0b010, 0b000]),
    ])
});

fn draw_glyph(canvas: &mut Frame, ch: char, x: i32, y: i32, rgba: [u8; 4]) {
    let Some(rows) = GLYPHS.get(&ch) else {
        return;
    };
    for (dy, row) in rows.iter().enumerate() {
        for dx in 0..3 {
            if row & (0b100 >> dx) != 0 {
                canvas.set_pixel(x + dx as i32, y + dy as i32, rgba);
            }
        }
    }
}

/// HH:MM clock (UTC), updated from the wall clock at render time.
pub struct ClockPlugin {
    color: [u8; 4],
}

impl ClockPlugin {
    pub fn new() -> Self {
        Self { color: [255, 176, 0, 255] }
    }

    fn hhmm() -> (usize, usize) {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let minutes = (secs / 60) % (24 * 60);
        ((minutes / 60) as usize, (minutes % 60) as usize)
    }
}

impl Default for ClockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ClockPlugin {
    fn id(&self) -> &str {
        "clock"
    }

    fn modes(&self) -> Vec<ModeDecl> {
        vec![ModeDecl::fixed("time", Duration::from_secs(10))]
    }

    fn render(&self, _mode: &str, canvas: &mut Frame) -> Result<(), PluginError> {
        let (h, m) = Self::hhmm();
        let text = format!("{:02}:{:02}", h, m);
        // 3px glyphs + 1px gap, centered
        let total_w = text.chars().count() as i32 * 4 - 1;
        let x0 = (canvas.width() as i32 - total_w) / 2;
        let y0 = (canvas.height() as i32 - 5) / 2;
        canvas.clear();
        for (i, ch) in text.chars().enumerate() {
            draw_glyph(canvas, ch, x0 + i as i32 * 4, y0, self.color);
        }
        Ok(())
    }
}

/// Striped banner with a palette rotated by `update()`. Declares Vegas
/// SCROLL content and dynamic duration (one cycle = one full palette pass).
pub struct BannerPlugin {
    stripes: Mutex<Vec<[u8; 4]>>,
    cycle_pos: AtomicUsize,
    cycle_done: AtomicBool,
    segment_height: u32,
}

impl BannerPlugin {
    pub fn new(segment_height: u32) -> Self {
        Self {
            stripes: Mutex::new(vec![
                [226, 61, 40, 255],
                [245, 171, 53, 255],
                [46, 204, 113, 255],
                [52, 152, 219, 255],
            ]),
            cycle_pos: AtomicUsize::new(0),
            cycle_done: AtomicBool::new(false),
            segment_height,
        }
    }

    fn stripe_frame(&self, width: u32, height: u32) -> Frame {
        let stripes = self.stripes.lock().expect("lock");
        let mut frame = Frame::new(width, height);
        let band = (width / stripes.len() as u32).max(1);
        for (i, color) in stripes.iter().enumerate() {
            frame.fill_rect((i as u32 * band) as i32, 0, band, height, *color);
        }
        frame
    }
}

impl Plugin for BannerPlugin {
    fn id(&self) -> &str {
        "banner"
    }

    fn modes(&self) -> Vec<ModeDecl> {
        vec![ModeDecl::dynamic("stripes", Duration::from_secs(15))]
    }

    fn render(&self, _mode: &str, canvas: &mut Frame) -> Result<(), PluginError> {
        let (w, h) = (canvas.width(), canvas.height());
        let stripe = self.stripe_frame(w, h);
        canvas.blit(&stripe, 0, 0);
        // One render pass per stripe counts toward the cycle
        let stripe_count = self.stripes.lock().expect("lock").len();
        let pos = self.cycle_pos.fetch_add(1, Ordering::Relaxed) + 1;
        if pos >= stripe_count {
            self.cycle_done.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn update(&self) -> Result<(), PluginError> {
        let mut stripes = self.stripes.lock().expect("lock");
        stripes.rotate_left(1);
        Ok(())
    }

    fn supports_dynamic_duration(&self) -> bool {
        true
    }

    fn is_cycle_complete(&self) -> bool {
        self.cycle_done.load(Ordering::Relaxed)
    }

    fn reset_cycle_state(&self) {
        self.cycle_pos.store(0, Ordering::Relaxed);
        self.cycle_done.store(false, Ordering::Relaxed);
    }

    fn vegas_content(&self) -> Option<Vec<Segment>> {
        Some(vec![Segment::scroll(vec![self.stripe_frame(
            self.segment_height * 4,
            self.segment_height,
        )])])
    }

    fn vegas_mode(&self) -> SegmentMode {
        SegmentMode::Scroll
    }
}
