use std::{fmt, time::Duration};

use crate::{VideoFormat, BYTES_PER_PIXEL};

/// Length of one animation loop in phase units.
pub const PHASE_PERIOD: f64 = 2.0;
/// Phase units advanced per second of elapsed time.
const PHASE_RATE: f64 = 0.3;
/// Above this larger-side resolution the animator switches to large cells.
const LARGE_CELL_THRESHOLD: u32 = 720;
const LARGE_CELL: usize = 96;
const SMALL_CELL: usize = 48;

const DOT_COLOR: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Synthesises the placeholder frames shown while no producer is attached:
/// a grid of dots whose size swells around a focal point that sweeps across
/// the frame and back once per period.
///
/// Output is a BGRA bitmap of exactly `width * height * 4` bytes and depends
/// only on the dimensions and the sequence of elapsed times fed in.
pub struct FrameAnimator {
    width: usize,
    height: usize,
    cell: usize,
    rows: usize,
    columns: usize,
    padding_x: usize,
    padding_y: usize,
    phase: f64,
    canvas: Vec<u8>,
}

impl FrameAnimator {
    pub fn new(format: &VideoFormat) -> Self {
        let width = format.width as usize;
        let height = format.height as usize;
        let cell = if format.width.max(format.height) > LARGE_CELL_THRESHOLD {
            LARGE_CELL
        } else {
            SMALL_CELL
        };
        let rows = height / cell;
        let columns = width / cell;

        Self {
            width,
            height,
            cell,
            rows,
            columns,
            padding_x: (width - columns * cell) / 2,
            padding_y: (height - rows * cell) / 2,
            phase: 0.0,
            canvas: vec![0; width * height * BYTES_PER_PIXEL],
        }
    }

    /// Current position in the loop, always within `[0, PHASE_PERIOD)`.
    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn cell_size(&self) -> usize {
        self.cell
    }

    /// Advances the animation by `elapsed` and renders the next frame.
    pub fn next_frame(&mut self, elapsed: Duration) -> &[u8] {
        self.phase = (self.phase + elapsed.as_secs_f64() * PHASE_RATE).rem_euclid(PHASE_PERIOD);
        self.render();
        &self.canvas
    }

    fn render(&mut self) {
        self.canvas.fill(0);

        let sweep = (self.phase - 1.0).abs();
        let eased = sweep * sweep * (3.0 - 2.0 * sweep);
        let focus_x = self.width as f64 * eased;
        let focus_y = self.height as f64 / 2.0;
        let range = self.width.min(self.height) as f64 / 2.0;
        let range_sq = (range * range).max(f64::EPSILON);
        let cell = self.cell as f64;

        for row in 0..self.rows {
            for column in 0..self.columns {
                let x = (self.padding_x + column * self.cell) as f64;
                let y = (self.padding_y + row * self.cell) as f64;
                let distance_sq = (focus_x - x).powi(2) + (focus_y - y).powi(2);
                let falloff = (distance_sq / range_sq).clamp(0.0, 1.0);
                // Between a half and three quarters of the cell.
                let diameter = 0.75 * cell - 0.25 * falloff * cell;
                let padding = (cell - diameter) / 2.0;
                self.fill_disc(x + padding, y + padding, diameter);
            }
        }
    }

    fn fill_disc(&mut self, left: f64, top: f64, diameter: f64) {
        let radius = diameter / 2.0;
        let center_x = left + radius;
        let center_y = top + radius;
        let stride = self.width * BYTES_PER_PIXEL;

        let first_row = top.floor().max(0.0) as usize;
        let last_row = ((top + diameter).ceil() as usize).min(self.height);
        for py in first_row..last_row {
            let dy = py as f64 + 0.5 - center_y;
            let span_sq = radius * radius - dy * dy;
            if span_sq <= 0.0 {
                continue;
            }
            let span = span_sq.sqrt();
            let start = (center_x - span).round().max(0.0) as usize;
            let end = ((center_x + span).round().max(0.0) as usize).min(self.width);
            if start >= end {
                continue;
            }
            let row = &mut self.canvas[py * stride..(py + 1) * stride];
            let pixels = &mut row[start * BYTES_PER_PIXEL..end * BYTES_PER_PIXEL];
            for pixel in pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
                pixel.copy_from_slice(&DOT_COLOR);
            }
        }
    }
}

impl fmt::Debug for FrameAnimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAnimator")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("cell", &self.cell)
            .field("grid", &(self.columns, self.rows))
            .field("phase", &self.phase)
            .finish()
    }
}
