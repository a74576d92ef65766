use std::time::{Duration, Instant};

pub struct FrameTimer {
    delta: Duration,
    total: Duration,
    frames: u64,
    last_update: Instant,
}

impl FrameTimer {
    pub fn new() -> FrameTimer {
        FrameTimer {
            delta: Duration::ZERO,
            total: Duration::ZERO,
            frames: 0,
            last_update: Instant::now(),
        }
    }

    pub fn delta(&self) -> Duration {
        self.delta
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn average(&self) -> Duration {
        match u32::try_from(self.frames) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(frames) => self.total / frames,
        }
    }

    /// Call once per frame.
    pub fn update(&mut self) {
        let now = Instant::now();
        self.delta = now - self.last_update;
        self.last_update = now;
        self.total += self.delta;
        self.frames += 1;
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_over_frames() {
        let mut timer = FrameTimer::new();
        assert_eq!(timer.average(), Duration::ZERO);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            timer.update();
        }
        assert_eq!(timer.frames(), 3);
        assert!(timer.total() >= Duration::from_millis(6));
        assert!(timer.average() >= Duration::from_millis(2));
    }
}
