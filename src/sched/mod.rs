//! # Frame scheduler
//!
//! Decides *when* to issue the next render. The draw timer is armed
//! so that rendering finishes just before the upcoming vblank:
//! `next_render = deadline - render_budget`, where the budget is the
//! 98th percentile of recent render times and the deadline is the
//! nearest vblank instant far enough away to fit the budget.
//!
//! The scheduler is deliberately pure: it never touches the server
//! or the backend, it hands the caller a `SchedAction` describing
//! what to arm. That is also what makes the budget math testable
//! with canned numbers.

// Austin Shafer - 2024
pub mod stats;

use stats::{IntervalEstimator, RollingQuantile};
use utils::log;
use utils::timing::Countdown;

/// How many render time samples the budget estimator keeps
const RENDER_WINDOW: usize = 128;
/// The render budget quantile
const BUDGET_QUANTILE: f64 = 0.98;
/// Rank drift tolerance of the quantile estimator
const BUDGET_TOLERANCE: f64 = 0.01;

/// What the caller should do after a scheduling decision
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedAction {
    /// Arm the draw timer to fire after this many microseconds
    ArmTimer(u64),
    /// Ask the server for a vblank notification; the render
    /// completion will be re-checked when it fires
    WaitVblank,
}

/// What happened as a result of a vblank notification
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VblankOutcome {
    /// Nothing to do
    Idle,
    /// The backend is still busy, keep vblank events coming
    KeepWaiting,
    /// The backend finished and a redraw is queued; the caller must
    /// run `schedule_render` again
    Reschedule,
}

/// Scheduling telemetry
///
/// The divisor is the frame-rate division a sustained over-budget
/// render load would force (budget/frame-time, rounded up). It is
/// computed for observability but never applied to timer arming.
#[derive(Debug, Copy, Clone, Default)]
pub struct SchedTelemetry {
    pub st_frames: u64,
    /// over-budget frame divisor, 1 when we fit in a frame
    pub st_divisor: u32,
    /// how late the draw callback ran relative to its planned
    /// start, microseconds
    pub st_last_deviation: i64,
    pub st_vblank_resets: u64,
}

pub struct FrameScheduler {
    /// a redraw has been requested and not yet drawn
    s_render_queued: bool,
    /// the backend has a frame in flight; cleared by the
    /// vblank-driven completion re-check
    s_backend_busy: bool,
    /// planned absolute start of the next render, 0 when unplanned
    s_next_render: u64,
    s_frame_pacing: bool,
    /// the draw timer; expiry is polled by the event loop
    s_timer: Countdown,

    // -- vblank tracking --
    s_last_msc: Option<u64>,
    /// timestamp of the last seen vblank, anchors deadlines
    s_last_ust: u64,
    s_vblank_stats: IntervalEstimator,

    // -- render time tracking --
    s_render_stats: RollingQuantile,
    /// cpu scheduling delay of the current draw, folded into the
    /// next render time sample
    s_cpu_delay: u64,

    s_telemetry: SchedTelemetry,
}

impl FrameScheduler {
    pub fn new(frame_pacing: bool) -> FrameScheduler {
        FrameScheduler {
            s_render_queued: false,
            s_backend_busy: false,
            s_next_render: 0,
            s_frame_pacing: frame_pacing,
            s_timer: Countdown::new(),
            s_last_msc: None,
            s_last_ust: 0,
            s_vblank_stats: IntervalEstimator::new(),
            s_render_stats: RollingQuantile::new(
                RENDER_WINDOW,
                BUDGET_QUANTILE,
                BUDGET_TOLERANCE,
            ),
            s_cpu_delay: 0,
            s_telemetry: SchedTelemetry::default(),
        }
    }

    pub fn is_render_queued(&self) -> bool {
        self.s_render_queued
    }

    pub fn is_backend_busy(&self) -> bool {
        self.s_backend_busy
    }

    pub fn telemetry(&self) -> SchedTelemetry {
        self.s_telemetry
    }

    /// Planned absolute start of the next render
    pub fn next_render(&self) -> u64 {
        self.s_next_render
    }

    /// Microseconds until the draw timer fires, None when disarmed.
    /// The event loop clamps its poll timeout to this.
    pub fn timer_remaining(&self, now: u64) -> Option<u64> {
        self.s_timer.time_remaining(now)
    }

    pub fn timer_expired(&self, now: u64) -> bool {
        self.s_timer.is_expired(now)
    }

    /// Request a redraw. Idempotent while one is already queued:
    /// N consecutive calls arm the draw timer exactly once.
    pub fn queue_redraw(&mut self, now: u64, redirected: bool) -> Option<SchedAction> {
        if self.s_render_queued {
            return None;
        }
        self.s_render_queued = true;
        return Some(self.schedule_render(now, redirected));
    }

    /// Work out when the queued render should start
    pub fn schedule_render(&mut self, now: u64, redirected: bool) -> SchedAction {
        // While the backend still owns the previous frame we wait
        // for a vblank and re-check completion there.
        if self.s_backend_busy {
            return SchedAction::WaitVblank;
        }

        if !self.s_frame_pacing || !redirected {
            self.s_timer.arm(now, 0);
            return SchedAction::ArmTimer(0);
        }

        let budget = self.s_render_stats.estimate().map(|b| b as u64);
        let frame_time = self.s_vblank_stats.mean();

        let (budget, frame_time) = match (budget, frame_time) {
            (Some(b), Some(ft)) if ft > 0 => (b, ft),
            // not enough statistics yet, render immediately
            _ => {
                self.s_timer.arm(now, 0);
                return SchedAction::ArmTimer(0);
            }
        };

        if budget >= frame_time {
            // over budget: best-effort catch-up. The divisor this
            // load implies is recorded but not applied.
            self.s_telemetry.st_divisor = (budget / frame_time + 1) as u32;
            self.s_timer.arm(now, 0);
            return SchedAction::ArmTimer(0);
        }
        self.s_telemetry.st_divisor = 1;

        // nearest vblank instant that still fits the budget
        let mut deadline = self.s_last_ust;
        while deadline < now + budget {
            deadline += frame_time;
        }

        self.s_next_render = deadline - budget;
        let delay = self.s_next_render.saturating_sub(now);
        self.s_timer.arm(now, delay);
        log::verbose!(
            "scheduled render at {} (deadline {}, budget {})",
            self.s_next_render,
            deadline,
            budget
        );
        return SchedAction::ArmTimer(delay);
    }

    /// The draw callback is starting
    pub fn on_draw_start(&mut self, now: u64) {
        self.s_timer.disarm();
        self.s_telemetry.st_frames += 1;

        if self.s_next_render > 0 {
            let deviation = now as i64 - self.s_next_render as i64;
            self.s_telemetry.st_last_deviation = deviation;
            self.s_cpu_delay = deviation.max(0) as u64;
        } else {
            self.s_cpu_delay = 0;
        }
    }

    /// The draw callback issued its render commands
    pub fn on_draw_end(&mut self, redirected: bool) {
        if self.s_frame_pacing && redirected {
            self.s_backend_busy = true;
        }
        self.s_render_queued = false;
        self.s_next_render = 0;
    }

    /// A vblank notification arrived. `last_render` is the
    /// backend's completion report for the in-flight frame.
    pub fn on_vblank(
        &mut self,
        msc: u64,
        ust: u64,
        last_render: Option<u64>,
        _now: u64,
    ) -> VblankOutcome {
        // interval statistics; only consecutive vblanks are valid
        // samples and a backward counter resets everything
        if let Some(last) = self.s_last_msc {
            if msc < last {
                self.s_vblank_stats.reset();
                self.s_telemetry.st_vblank_resets += 1;
            } else if msc == last + 1 {
                if self.s_vblank_stats.push(ust.saturating_sub(self.s_last_ust)) {
                    self.s_telemetry.st_vblank_resets += 1;
                }
            }
        }
        self.s_last_msc = Some(msc);
        self.s_last_ust = ust;

        if !self.s_backend_busy {
            return VblankOutcome::Idle;
        }

        match last_render {
            Some(gpu_time) => {
                self.s_backend_busy = false;
                self.record_render_time(gpu_time);
                match self.s_render_queued {
                    true => VblankOutcome::Reschedule,
                    false => VblankOutcome::Idle,
                }
            }
            None => VblankOutcome::KeepWaiting,
        }
    }

    /// Fold the completed render into the budget statistics: GPU
    /// time plus the cpu scheduling delay of that frame.
    fn record_render_time(&mut self, gpu_time: u64) {
        let sample = gpu_time + self.s_cpu_delay;
        self.s_render_stats.push(sample.min(u32::MAX as u64) as u32);
    }

    /// Feed a render time directly, used when frame pacing is off
    /// and completion is polled rather than vblank-driven
    pub fn push_render_sample(&mut self, usec: u64) {
        self.s_render_stats.push(usec.min(u32::MAX as u64) as u32);
    }

    /// Drop collected state when the screen is unredirected
    pub fn on_unredirect(&mut self) {
        self.s_backend_busy = false;
        self.s_next_render = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primed_scheduler(render_usec: u32, vblank_usec: u64, last_ust: u64) -> FrameScheduler {
        let mut sched = FrameScheduler::new(true);
        for _ in 0..RENDER_WINDOW {
            sched.s_render_stats.push(render_usec);
        }
        // feed consecutive vblanks to build the interval estimate
        let mut ust = last_ust.saturating_sub(vblank_usec * 64);
        for msc in 0..65u64 {
            sched.on_vblank(msc, ust, None, ust);
            ust += vblank_usec;
        }
        sched.s_last_ust = last_ust;
        return sched;
    }

    #[test]
    fn schedules_before_deadline() {
        // render budget 4000, vblank 16667, last vblank 1000 ago
        let mut sched = primed_scheduler(4_000, 16_667, 1_000_000);
        let now = 1_001_000;

        let action = sched.queue_redraw(now, true).unwrap();
        match action {
            SchedAction::ArmTimer(delay) => {
                // 16667 - 4000 - 1000
                assert!(
                    (delay as i64 - 11_667).abs() <= 100,
                    "unexpected delay {}",
                    delay
                );
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn over_budget_renders_immediately() {
        let mut sched = primed_scheduler(20_000, 16_667, 1_000_000);
        let now = 1_001_000;

        let action = sched.queue_redraw(now, true).unwrap();
        assert_eq!(action, SchedAction::ArmTimer(0));
        // the implied divisor is recorded but never applied
        assert_eq!(sched.telemetry().st_divisor, 2);
    }

    #[test]
    fn queue_redraw_is_idempotent() {
        let mut sched = primed_scheduler(4_000, 16_667, 1_000_000);
        let now = 1_001_000;

        assert!(sched.queue_redraw(now, true).is_some());
        for _ in 0..10 {
            assert!(sched.queue_redraw(now, true).is_none());
        }
    }

    #[test]
    fn busy_backend_defers_to_vblank() {
        let mut sched = primed_scheduler(4_000, 16_667, 1_000_000);
        sched.s_backend_busy = true;

        let action = sched.queue_redraw(1_001_000, true).unwrap();
        assert_eq!(action, SchedAction::WaitVblank);

        // still rendering at the first vblank
        let out = sched.on_vblank(100, 1_016_667, None, 1_016_667);
        assert_eq!(out, VblankOutcome::KeepWaiting);

        // done by the second; redraw still queued so reschedule
        let out = sched.on_vblank(101, 1_033_334, Some(4_000), 1_033_334);
        assert_eq!(out, VblankOutcome::Reschedule);
        assert!(!sched.is_backend_busy());
    }

    #[test]
    fn no_pacing_always_immediate() {
        let mut sched = FrameScheduler::new(false);
        let action = sched.queue_redraw(500, true).unwrap();
        assert_eq!(action, SchedAction::ArmTimer(0));
    }
}
