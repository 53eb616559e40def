//! Render-side easing of corrections.
//!
//! Physics snaps to the corrected state immediately; only the pose handed to
//! renderers carries a decaying offset so the car glides into place.

use glam::{Quat, Vec3};

/// Default correction blend time in seconds
pub const DEFAULT_CORRECTION_DURATION: f32 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothCorrection {
    duration: f32,
    time_remaining: f32,
    initial_offset: Vec3,
    initial_rotation: Quat,
    position_offset: Vec3,
    rotation_offset: Quat,
}

impl SmoothCorrection {
    pub fn new(duration: f32) -> Self {
        Self {
            duration: duration.max(0.0),
            time_remaining: 0.0,
            initial_offset: Vec3::ZERO,
            initial_rotation: Quat::IDENTITY,
            position_offset: Vec3::ZERO,
            rotation_offset: Quat::IDENTITY,
        }
    }

    /// Begin easing out the jump between the pose shown before a correction
    /// and the corrected pose.
    ///
    /// Any offset still being blended is folded in, so back-to-back
    /// corrections never pop.
    pub fn start(&mut self, shown_position: Vec3, shown_rotation: Quat, position: Vec3, rotation: Quat) {
        if self.duration <= 0.0 {
            return;
        }
        let offset = shown_position - position;
        let rotation_offset = (shown_rotation * rotation.inverse()).normalize();

        self.initial_offset = offset;
        self.initial_rotation = rotation_offset;
        self.position_offset = offset;
        self.rotation_offset = rotation_offset;
        self.time_remaining = self.duration;
    }

    /// Advance the blend by `delta` seconds
    pub fn update(&mut self, delta: f32) {
        if self.time_remaining <= 0.0 {
            return;
        }

        self.time_remaining -= delta;
        if self.time_remaining <= 0.0 {
            self.time_remaining = 0.0;
            self.position_offset = Vec3::ZERO;
            self.rotation_offset = Quat::IDENTITY;
            return;
        }

        let t = 1.0 - self.time_remaining / self.duration;
        let remaining = 1.0 - ease_out_cubic(t);
        self.position_offset = self.initial_offset * remaining;
        self.rotation_offset = Quat::IDENTITY.slerp(self.initial_rotation, remaining);
    }

    /// Pose to draw for a physics pose
    pub fn apply(&self, position: Vec3, rotation: Quat) -> (Vec3, Quat) {
        (
            position + self.position_offset,
            (self.rotation_offset * rotation).normalize(),
        )
    }

    pub fn offset(&self) -> Vec3 {
        self.position_offset
    }

    pub fn is_complete(&self) -> bool {
        self.time_remaining <= 0.0
    }
}

impl Default for SmoothCorrection {
    fn default() -> Self {
        Self::new(DEFAULT_CORRECTION_DURATION)
    }
}

/// https://easings.net/#easeOutCubic
fn ease_out_cubic(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_completes() {
        let mut correction = SmoothCorrection::default();
        correction.start(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY, Vec3::ZERO, Quat::IDENTITY);

        let mut frames = 0;
        while !correction.is_complete() && frames < 100 {
            correction.update(1.0 / 60.0);
            frames += 1;
        }

        assert!(correction.is_complete());
        assert_eq!(correction.offset(), Vec3::ZERO);
        assert_eq!(correction.apply(Vec3::ONE, Quat::IDENTITY).0, Vec3::ONE);
    }

    #[test]
    fn offset_shrinks_each_frame() {
        let mut correction = SmoothCorrection::default();
        correction.start(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY, Vec3::ZERO, Quat::IDENTITY);
        assert_eq!(correction.offset().x, 10.0);

        correction.update(1.0 / 60.0);
        let first = correction.offset().length();
        correction.update(1.0 / 60.0);
        let second = correction.offset().length();

        assert!(first < 10.0);
        assert!(second < first);
    }

    #[test]
    fn shown_pose_starts_where_the_car_was() {
        let mut correction = SmoothCorrection::default();
        let shown_rotation = Quat::from_rotation_y(0.4);
        correction.start(Vec3::new(3.0, 0.0, 1.0), shown_rotation, Vec3::ZERO, Quat::IDENTITY);

        let (position, rotation) = correction.apply(Vec3::ZERO, Quat::IDENTITY);
        assert!((position - Vec3::new(3.0, 0.0, 1.0)).length() < 1e-5);
        assert!(rotation.angle_between(shown_rotation) < 1e-4);
    }

    #[test]
    fn ease_out_cubic_shape() {
        assert_eq!(ease_out_cubic(0.0), 0.0);
        assert!((ease_out_cubic(1.0) - 1.0).abs() < 0.001);
        assert!(ease_out_cubic(0.5) > 0.5);
    }
}
