//! Per-rover tracking state machine: detection, tracker initialisation,
//! per-frame updates and the follow loop that steers the rover.

mod follow;

pub use follow::{FollowMode, Follower};

use log::{debug, info, warn};
use std::sync::Arc;

use crate::config::FollowConfig;
use crate::error::{Reason, Result};
use crate::frame::Frame;
use crate::geometry::BoundingBox;
use crate::protocol::{RoverCommand, TrackingCommand};
use crate::vision::{ObjectTracker, VisionBackend};

const OVERLAY_BGR: [u8; 3] = [0, 255, 0];
const OVERLAY_THICKNESS: u32 = 2;

pub trait CommandSink: Send + Sync {
    fn send(&self, cmd: &RoverCommand) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Custom,
    Face,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Idle,
    PendingInit(TargetKind),
    Active(TargetKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub wheels: bool,
    pub gimbal: bool,
}

pub struct TrackingController {
    rover_id: String,
    caps: Capabilities,
    frame_size: (u32, u32),
    vision: Arc<dyn VisionBackend>,
    tracker: Option<Box<dyn ObjectTracker>>,
    state: TrackingState,
    initial_box: Option<BoundingBox>,
    initial_area_ratio: f64,
    following_wheels: bool,
    following_camera: bool,
    follower: Follower,
}

impl TrackingController {
    pub fn new(
        rover_id: &str,
        caps: Capabilities,
        frame_size: (u32, u32),
        vision: Arc<dyn VisionBackend>,
        tuning: FollowConfig,
    ) -> Self {
        Self {
            rover_id: rover_id.to_string(),
            caps,
            frame_size,
            vision,
            tracker: None,
            state: TrackingState::Idle,
            initial_box: None,
            initial_area_ratio: 0.0,
            following_wheels: false,
            following_camera: false,
            follower: Follower::new(tuning),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn following(&self) -> (bool, bool) {
        (self.following_wheels, self.following_camera)
    }

    pub fn initial_box(&self) -> Option<BoundingBox> {
        self.initial_box
    }

    pub fn initial_area_ratio(&self) -> f64 {
        self.initial_area_ratio
    }

    pub fn apply(&mut self, cmd: &TrackingCommand) -> Result<(), Reason> {
        match *cmd {
            TrackingCommand::TrackCustom(roi) => self.track_custom(roi),
            TrackingCommand::TrackFaces => {
                self.track_faces();
                Ok(())
            }
            TrackingCommand::StopTracking => {
                self.stop_tracking();
                Ok(())
            }
            TrackingCommand::Follow { wheels, camera } => {
                self.follow(wheels, camera);
                Ok(())
            }
        }
    }

    pub fn track_custom(&mut self, roi: BoundingBox) -> Result<(), Reason> {
        if !roi.is_valid_roi() {
            return Err(Reason::BadRoi);
        }
        self.reset_target();
        self.initial_box = Some(roi);
        self.initial_area_ratio = roi.area_ratio(self.frame_size.0, self.frame_size.1);
        self.state = TrackingState::PendingInit(TargetKind::Custom);
        info!("tracking[{}]: custom roi {:?}", self.rover_id, roi);
        Ok(())
    }

    pub fn track_faces(&mut self) {
        self.reset_target();
        self.state = TrackingState::PendingInit(TargetKind::Face);
        info!("tracking[{}]: waiting for a face", self.rover_id);
    }

    pub fn stop_tracking(&mut self) {
        self.reset_target();
        self.state = TrackingState::Idle;
        info!("tracking[{}]: stopped", self.rover_id);
    }

    /// Honoured only while a target is selected; motors the rover lacks stay off.
    pub fn follow(&mut self, wheels: bool, camera: bool) {
        if self.state == TrackingState::Idle {
            info!(
                "tracking[{}]: follow ignored, no target selected",
                self.rover_id
            );
            return;
        }
        self.following_wheels = wheels && self.caps.wheels;
        self.following_camera = camera && self.caps.gimbal;
        self.follower.reset();
        let mode = FollowMode::from_flags(self.following_wheels, self.following_camera);
        if mode == FollowMode::Both {
            warn!(
                "tracking[{}]: wheels+camera follow is not supported; holding still",
                self.rover_id
            );
        }
        info!("tracking[{}]: follow mode {:?}", self.rover_id, mode);
    }

    fn reset_target(&mut self) {
        self.tracker = None;
        self.initial_box = None;
        self.initial_area_ratio = 0.0;
        self.following_wheels = false;
        self.following_camera = false;
        self.follower.reset();
    }

    /// Run one tracking cycle on `frame`, painting the tracked box onto it and
    /// sending follow commands through `sink`.
    pub fn do_tracking(&mut self, frame: &mut Frame, sink: &dyn CommandSink) {
        match self.state {
            TrackingState::Idle => {}
            TrackingState::PendingInit(TargetKind::Face) => {
                let Some(first) = self.vision.detector().detect(frame).into_iter().next() else {
                    return;
                };
                self.initial_box = Some(first);
                self.initial_area_ratio = first.area_ratio(frame.width, frame.height);
                self.arm(frame, first, TargetKind::Face);
            }
            TrackingState::PendingInit(TargetKind::Custom) => {
                if let Some(roi) = self.initial_box {
                    self.arm(frame, roi, TargetKind::Custom);
                }
            }
            TrackingState::Active(_) => {
                let Some(tracker) = self.tracker.as_mut() else {
                    return;
                };
                match tracker.update(frame) {
                    Some(target) => {
                        frame.draw_rect(&target, OVERLAY_BGR, OVERLAY_THICKNESS);
                        self.follow_step(&target, frame.width, frame.height, sink);
                    }
                    None => debug!("tracking[{}]: update lost the target", self.rover_id),
                }
            }
        }
    }

    fn arm(&mut self, frame: &Frame, initial: BoundingBox, kind: TargetKind) {
        let mut tracker = self.vision.new_tracker();
        if tracker.init(frame, initial) {
            self.tracker = Some(tracker);
            self.state = TrackingState::Active(kind);
            info!(
                "tracking[{}]: {:?} target acquired at {:?}",
                self.rover_id, kind, initial
            );
        } else {
            warn!(
                "tracking[{}]: tracker init failed, retrying next frame",
                self.rover_id
            );
        }
    }

    fn follow_step(&mut self, target: &BoundingBox, w: u32, h: u32, sink: &dyn CommandSink) {
        let mode = FollowMode::from_flags(self.following_wheels, self.following_camera);
        if mode == FollowMode::Off {
            return;
        }
        for cmd in self
            .follower
            .step(mode, target, w, h, self.initial_area_ratio)
        {
            debug!("tracking[{}]: -> {:?}", self.rover_id, cmd);
            if let Err(e) = sink.send(&cmd) {
                warn!("tracking[{}]: command send failed: {e}", self.rover_id);
                break;
            }
        }
    }
}
