//! Capabilities the tracking controller consumes. Concrete detectors and
//! trackers live outside this crate and plug in behind these traits.

use crate::frame::Frame;
use crate::geometry::BoundingBox;

pub trait ObjectTracker: Send {
    /// Arm the tracker on `initial`. `false` means the tracker refused the box.
    fn init(&mut self, frame: &Frame, initial: BoundingBox) -> bool;

    /// Follow the target into `frame`; `None` when it was lost this frame.
    fn update(&mut self, frame: &Frame) -> Option<BoundingBox>;
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<BoundingBox>;
}

pub trait VisionBackend: Send + Sync {
    fn detector(&self) -> &dyn FaceDetector;
    fn new_tracker(&self) -> Box<dyn ObjectTracker>;
}

/// Built-in backend used when no real vision stack is linked: it detects no
/// faces, and its tracker reports the initial box on every frame.
#[derive(Debug, Default)]
pub struct StaticVision;

#[derive(Debug, Default)]
struct NoFaces;

impl FaceDetector for NoFaces {
    fn detect(&self, _frame: &Frame) -> Vec<BoundingBox> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct StaticTracker {
    target: Option<BoundingBox>,
}

impl ObjectTracker for StaticTracker {
    fn init(&mut self, _frame: &Frame, initial: BoundingBox) -> bool {
        self.target = Some(initial);
        true
    }

    fn update(&mut self, _frame: &Frame) -> Option<BoundingBox> {
        self.target
    }
}

static NO_FACES: NoFaces = NoFaces;

impl VisionBackend for StaticVision {
    fn detector(&self) -> &dyn FaceDetector {
        &NO_FACES
    }

    fn new_tracker(&self) -> Box<dyn ObjectTracker> {
        Box::new(StaticTracker::default())
    }
}
