//! Closed-loop follow: turn a tracked box into camera or wheel commands.

use crate::config::FollowConfig;
use crate::geometry::BoundingBox;
use crate::protocol::{CamDirection, Direction, Motors, RoverCommand};
use crate::ring::RingBuffer;

pub const SMOOTHING_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowMode {
    Off,
    Camera,
    Wheels,
    /// Requested together; no combined behaviour exists, so nothing is sent.
    Both,
}

impl FollowMode {
    pub fn from_flags(wheels: bool, camera: bool) -> Self {
        match (wheels, camera) {
            (false, false) => FollowMode::Off,
            (false, true) => FollowMode::Camera,
            (true, false) => FollowMode::Wheels,
            (true, true) => FollowMode::Both,
        }
    }
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let p = 10f64.powi(decimals);
    (v * p).round() / p
}

/// Angular camera speed (deg/s) for an offset along one axis.
pub fn camera_speed(delta: f64, frame_dim: u32) -> f64 {
    if frame_dim == 0 {
        return 0.0;
    }
    90.0 * (delta.abs() / f64::from(frame_dim)).powf(1.2)
}

pub fn forward_speed(delta_area: f64) -> f64 {
    0.1 * (1.0 + delta_area.abs())
}

pub fn rotate_speed(delta_x: f64, frame_w: u32) -> f64 {
    if frame_w == 0 {
        return 0.005;
    }
    0.005 * (1.0 + (delta_x.abs() / f64::from(frame_w)).powi(3))
}

/// Smoothing histories and per-axis stop latches for one follow session.
#[derive(Debug, Clone)]
pub struct Follower {
    cfg: FollowConfig,
    distance: RingBuffer<SMOOTHING_WINDOW>,
    area: RingBuffer<SMOOTHING_WINDOW>,
    camera_stop_sent: bool,
    wheels_stop_sent: bool,
}

impl Follower {
    pub fn new(cfg: FollowConfig) -> Self {
        Self {
            cfg,
            distance: RingBuffer::new(),
            area: RingBuffer::new(),
            camera_stop_sent: false,
            wheels_stop_sent: false,
        }
    }

    pub fn reset(&mut self) {
        self.distance.clear();
        self.area.clear();
        self.camera_stop_sent = false;
        self.wheels_stop_sent = false;
    }

    /// Commands for one successfully tracked frame, in send order.
    pub fn step(
        &mut self,
        mode: FollowMode,
        target: &BoundingBox,
        frame_w: u32,
        frame_h: u32,
        initial_area_ratio: f64,
    ) -> Vec<RoverCommand> {
        let center = target.center();
        let delta_x = center.x - f64::from(frame_w) / 2.0;
        let delta_y = center.y - f64::from(frame_h) / 2.0;

        match mode {
            FollowMode::Camera => self.follow_camera(delta_x, delta_y, frame_w, frame_h),
            FollowMode::Wheels => {
                let delta_area = target.area_ratio(frame_w, frame_h) - initial_area_ratio;
                self.follow_wheels(delta_x, delta_area, frame_w)
            }
            FollowMode::Off | FollowMode::Both => Vec::new(),
        }
    }

    fn stop_camera(&mut self, out: &mut Vec<RoverCommand>) {
        if !self.camera_stop_sent {
            self.camera_stop_sent = true;
            out.push(RoverCommand::MoveStop(Motors::CAMERA));
        }
    }

    fn stop_wheels(&mut self, out: &mut Vec<RoverCommand>) {
        if !self.wheels_stop_sent {
            self.wheels_stop_sent = true;
            out.push(RoverCommand::MoveStop(Motors::WHEELS));
        }
    }

    fn follow_camera(
        &mut self,
        delta_x: f64,
        delta_y: f64,
        frame_w: u32,
        frame_h: u32,
    ) -> Vec<RoverCommand> {
        let mut out = Vec::new();
        self.distance.append(delta_x.hypot(delta_y));
        if self.distance.average() < self.cfg.cam_dead_band {
            self.stop_camera(&mut out);
            return out;
        }
        self.camera_stop_sent = false;

        let speed_x = camera_speed(delta_x, frame_w);
        let speed_y = camera_speed(delta_y, frame_h);
        if speed_x > self.cfg.cam_min_speed && speed_y > self.cfg.cam_min_speed {
            out.push(RoverCommand::SetCamSpeed([
                round_to(speed_x, 2),
                round_to(speed_y, 2),
            ]));
        }

        let mut dir = CamDirection::EMPTY;
        if delta_x.abs() > self.cfg.cam_move_threshold {
            dir = dir | if delta_x > 0.0 { CamDirection::CW } else { CamDirection::CCW };
        }
        if delta_y.abs() > self.cfg.cam_move_threshold {
            dir = dir | if delta_y > 0.0 { CamDirection::DOWN } else { CamDirection::UP };
        }
        if !dir.is_empty() {
            out.push(RoverCommand::MoveCam(dir));
        }
        out
    }

    fn follow_wheels(&mut self, delta_x: f64, delta_area: f64, frame_w: u32) -> Vec<RoverCommand> {
        let mut out = Vec::new();
        let turn = delta_x.abs() > self.cfg.wheel_move_threshold;
        let side = if delta_x > 0.0 { Direction::RIGHT } else { Direction::LEFT };

        if delta_area < self.cfg.area_threshold {
            // target receding: drive towards it
            self.area.append(delta_area.abs());
            if self.area.average() < self.cfg.area_dead_band {
                self.stop_wheels(&mut out);
                return out;
            }
            self.wheels_stop_sent = false;
            let speed = round_to(forward_speed(delta_area), 2);
            if speed > self.cfg.min_forward_speed {
                out.push(RoverCommand::SetSpeed(speed));
            }
            let dir = if turn { Direction::FORWARD | side } else { Direction::FORWARD };
            out.push(RoverCommand::Move(dir));
        } else if turn {
            // close enough: rotate in place to re-centre
            self.distance.append(delta_x.abs());
            if self.distance.average() < self.cfg.rotate_dead_band {
                self.stop_wheels(&mut out);
                return out;
            }
            self.wheels_stop_sent = false;
            out.push(RoverCommand::SetSpeed(round_to(rotate_speed(delta_x, frame_w), 3)));
            out.push(RoverCommand::Move(side));
        } else {
            self.stop_wheels(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 640;
    const H: u32 = 480;

    fn centered(w: f64, h: f64) -> BoundingBox {
        BoundingBox::new(
            f64::from(W) / 2.0 - w / 2.0,
            f64::from(H) / 2.0 - h / 2.0,
            w,
            h,
        )
    }

    fn shifted(dx: f64, dy: f64) -> BoundingBox {
        let b = centered(40.0, 40.0);
        BoundingBox::new(b.x + dx, b.y + dy, b.width, b.height)
    }

    #[test]
    fn centered_target_stops_camera_once() {
        let mut f = Follower::new(FollowConfig::default());
        let target = centered(50.0, 50.0);

        let first = f.step(FollowMode::Camera, &target, W, H, 0.0);
        assert_eq!(first, vec![RoverCommand::MoveStop(Motors::CAMERA)]);

        let again = f.step(FollowMode::Camera, &target, W, H, 0.0);
        assert!(again.is_empty());
    }

    #[test]
    fn off_centre_frame_rearms_camera_stop() {
        let mut f = Follower::new(FollowConfig::default());
        f.step(FollowMode::Camera, &centered(50.0, 50.0), W, H, 0.0);

        // average of [0, ~283] is far outside the dead band
        let moved = f.step(FollowMode::Camera, &shifted(200.0, 200.0), W, H, 0.0);
        assert!(matches!(moved[0], RoverCommand::SetCamSpeed(_)));
        assert_eq!(
            moved[1],
            RoverCommand::MoveCam(CamDirection::CW | CamDirection::DOWN)
        );

        // back to centre: average still high until the window drains
        let mut stops = 0;
        for _ in 0..SMOOTHING_WINDOW {
            stops += f
                .step(FollowMode::Camera, &centered(50.0, 50.0), W, H, 0.0)
                .iter()
                .filter(|c| **c == RoverCommand::MoveStop(Motors::CAMERA))
                .count();
        }
        assert_eq!(stops, 1);
    }

    #[test]
    fn camera_speed_formula() {
        let v = camera_speed(-320.0, 640);
        assert!((v - 90.0 * 0.5f64.powf(1.2)).abs() < 1e-9);
        assert_eq!(camera_speed(10.0, 0), 0.0);
    }

    #[test]
    fn receding_target_drives_forward() {
        let mut f = Follower::new(FollowConfig::default());
        // 192 x 128 on 640 x 480 is an area ratio of 0.08
        let target = centered(192.0, 128.0);
        let cmds = f.step(FollowMode::Wheels, &target, W, H, 0.10);
        assert_eq!(
            cmds,
            vec![
                RoverCommand::SetSpeed(0.10),
                RoverCommand::Move(Direction::FORWARD),
            ]
        );
    }

    #[test]
    fn receding_and_off_centre_adds_turn() {
        let mut f = Follower::new(FollowConfig::default());
        let b = centered(192.0, 128.0);
        let target = BoundingBox::new(b.x - 100.0, b.y, b.width, b.height);
        let cmds = f.step(FollowMode::Wheels, &target, W, H, 0.10);
        assert_eq!(
            cmds.last(),
            Some(&RoverCommand::Move(Direction::FORWARD | Direction::LEFT))
        );
    }

    #[test]
    fn close_target_off_centre_rotates_in_place() {
        let mut f = Follower::new(FollowConfig::default());
        let target = shifted(160.0, 0.0);
        let ratio = target.area_ratio(W, H);
        let cmds = f.step(FollowMode::Wheels, &target, W, H, ratio);
        // 0.005 * (1 + 0.25^3) rounds to 0.005
        assert_eq!(
            cmds,
            vec![
                RoverCommand::SetSpeed(0.005),
                RoverCommand::Move(Direction::RIGHT),
            ]
        );
    }

    #[test]
    fn close_centred_target_stops_wheels_once() {
        let mut f = Follower::new(FollowConfig::default());
        let target = centered(100.0, 100.0);
        let ratio = target.area_ratio(W, H);
        assert_eq!(
            f.step(FollowMode::Wheels, &target, W, H, ratio),
            vec![RoverCommand::MoveStop(Motors::WHEELS)]
        );
        assert!(f.step(FollowMode::Wheels, &target, W, H, ratio).is_empty());
    }

    #[test]
    fn slightly_receding_target_inside_area_dead_band_stops_once() {
        let mut f = Follower::new(FollowConfig::default());
        // ratio 0.08 against 0.092: receding by 0.012, under the 0.015 band
        let target = centered(192.0, 128.0);
        assert_eq!(
            f.step(FollowMode::Wheels, &target, W, H, 0.092),
            vec![RoverCommand::MoveStop(Motors::WHEELS)]
        );
        assert!(f.step(FollowMode::Wheels, &target, W, H, 0.092).is_empty());

        // a clear recession lifts the average and drives again
        let cmds = f.step(FollowMode::Wheels, &target, W, H, 0.20);
        assert_eq!(cmds.last(), Some(&RoverCommand::Move(Direction::FORWARD)));
    }

    #[test]
    fn small_rotation_offset_stops_then_rearms() {
        let mut f = Follower::new(FollowConfig::default());
        let near = shifted(50.0, 0.0);
        let ratio = near.area_ratio(W, H);

        // 50px: past the turn threshold, inside the rotate dead band
        assert_eq!(
            f.step(FollowMode::Wheels, &near, W, H, ratio),
            vec![RoverCommand::MoveStop(Motors::WHEELS)]
        );
        assert!(f.step(FollowMode::Wheels, &near, W, H, ratio).is_empty());

        let far = shifted(300.0, 0.0);
        let cmds = f.step(FollowMode::Wheels, &far, W, H, ratio);
        assert_eq!(cmds.last(), Some(&RoverCommand::Move(Direction::RIGHT)));

        // the 300px sample has to leave the window before stopping again
        let mut stops = 0;
        for _ in 0..SMOOTHING_WINDOW {
            stops += f
                .step(FollowMode::Wheels, &near, W, H, ratio)
                .iter()
                .filter(|c| **c == RoverCommand::MoveStop(Motors::WHEELS))
                .count();
        }
        assert_eq!(stops, 1);
    }

    #[test]
    fn combined_mode_does_nothing() {
        let mut f = Follower::new(FollowConfig::default());
        assert!(
            f.step(FollowMode::Both, &shifted(300.0, 200.0), W, H, 0.5)
                .is_empty()
        );
    }
}
