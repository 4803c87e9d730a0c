//! Raw frames and the single-slot latest-frame buffer between capture and feed.

use std::sync::{Mutex, PoisonError};

use crate::geometry::BoundingBox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub const BYTES_PER_PIXEL: usize = 3;

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::BYTES_PER_PIXEL
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::byte_len(width, height)],
        }
    }

    fn put_pixel(&mut self, x: i64, y: i64, bgr: [u8; 3]) {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * Self::BYTES_PER_PIXEL;
        if let Some(px) = self.data.get_mut(idx..idx + Self::BYTES_PER_PIXEL) {
            px.copy_from_slice(&bgr);
        }
    }

    pub fn draw_rect(&mut self, b: &BoundingBox, bgr: [u8; 3], thickness: u32) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let (w, h) = (i64::from(self.width), i64::from(self.height));
        // f64 -> i64 casts saturate, so out-of-range corners stay ordered
        let x0 = b.x.round() as i64;
        let y0 = b.y.round() as i64;
        let x1 = (b.x + b.width).round() as i64;
        let y1 = (b.y + b.height).round() as i64;
        let (cx0, cx1) = (x0.max(0), x1.min(w - 1));
        let (cy0, cy1) = (y0.max(0), y1.min(h - 1));
        if cx0 > cx1 || cy0 > cy1 {
            return;
        }
        for t in 0..i64::from(thickness).min(w.max(h)) {
            for x in cx0..=cx1 {
                self.put_pixel(x, y0.saturating_add(t), bgr);
                self.put_pixel(x, y1.saturating_sub(t), bgr);
            }
            for y in cy0..=cy1 {
                self.put_pixel(x0.saturating_add(t), y, bgr);
                self.put_pixel(x1.saturating_sub(t), y, bgr);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    frame: Option<Frame>,
    grabbed: bool,
    consumed: bool,
}

/// Holds at most one unread frame. Writers overwrite, readers poll.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, dropping any unread one. Never waits on a reader.
    pub fn write(&self, frame: Frame) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.frame = Some(frame);
        slot.grabbed = true;
        slot.consumed = false;
    }

    pub fn read(&self) -> Option<Frame> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.grabbed || slot.consumed {
            return None;
        }
        let copy = slot.frame.clone()?;
        slot.consumed = true;
        Some(copy)
    }
}
