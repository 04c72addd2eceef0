use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderState {
    Idle,
    Scheduled { at: Instant },
    Rendering,
}

/// Folds any number of render requests between two frames into one draw.
#[derive(Debug)]
pub struct RenderCoalescer {
    frame: Duration,
    state: RenderState,
    renders: u64,
}

impl RenderCoalescer {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            state: RenderState::Idle,
            renders: 0,
        }
    }

    /// Returns true only when this call scheduled a new frame.
    pub fn request_render(&mut self, now: Instant) -> bool {
        match self.state {
            RenderState::Idle => {
                self.state = RenderState::Scheduled {
                    at: now + self.frame,
                };
                true
            }
            RenderState::Scheduled { .. } | RenderState::Rendering => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            RenderState::Scheduled { at } => Some(at),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        !matches!(self.state, RenderState::Idle)
    }

    /// Called when the frame deadline passes. A true result obliges the
    /// caller to draw and then call [`RenderCoalescer::end_frame`].
    pub fn begin_frame(&mut self, now: Instant) -> bool {
        match self.state {
            RenderState::Scheduled { at } if at <= now => {
                self.state = RenderState::Rendering;
                true
            }
            _ => false,
        }
    }

    pub fn end_frame(&mut self) {
        if self.state == RenderState::Rendering {
            self.renders += 1;
            self.state = RenderState::Idle;
        }
    }

    pub fn cancel(&mut self) {
        self.state = RenderState::Idle;
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(16);

    fn drive(coalescer: &mut RenderCoalescer, now: Instant) {
        if coalescer.begin_frame(now) {
            coalescer.end_frame();
        }
    }

    #[test]
    fn burst_of_requests_renders_once() {
        let start = Instant::now();
        let mut coalescer = RenderCoalescer::new(FRAME);
        assert!(coalescer.request_render(start));
        for offset in 1..10 {
            assert!(!coalescer.request_render(start + Duration::from_millis(offset)));
        }
        assert_eq!(coalescer.deadline(), Some(start + FRAME));

        drive(&mut coalescer, start + FRAME);
        drive(&mut coalescer, start + FRAME * 2);
        assert_eq!(coalescer.renders(), 1);
        assert!(!coalescer.is_pending());
    }

    #[test]
    fn no_request_means_no_render() {
        let start = Instant::now();
        let mut coalescer = RenderCoalescer::new(FRAME);
        drive(&mut coalescer, start + FRAME * 4);
        assert_eq!(coalescer.renders(), 0);
        assert_eq!(coalescer.deadline(), None);
    }

    #[test]
    fn frame_does_not_fire_early() {
        let start = Instant::now();
        let mut coalescer = RenderCoalescer::new(FRAME);
        coalescer.request_render(start);
        assert!(!coalescer.begin_frame(start + Duration::from_millis(5)));
        assert!(coalescer.begin_frame(start + FRAME));
    }

    #[test]
    fn requests_during_render_are_absorbed_then_next_one_schedules() {
        let start = Instant::now();
        let mut coalescer = RenderCoalescer::new(FRAME);
        coalescer.request_render(start);
        assert!(coalescer.begin_frame(start + FRAME));
        assert!(!coalescer.request_render(start + FRAME));
        coalescer.end_frame();

        let later = start + FRAME * 3;
        assert!(coalescer.request_render(later));
        drive(&mut coalescer, later + FRAME);
        assert_eq!(coalescer.renders(), 2);
    }

    #[test]
    fn cancel_clears_pending_frame() {
        let start = Instant::now();
        let mut coalescer = RenderCoalescer::new(FRAME);
        coalescer.request_render(start);
        coalescer.cancel();
        drive(&mut coalescer, start + FRAME);
        assert_eq!(coalescer.renders(), 0);
    }
}
