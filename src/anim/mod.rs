//! # Animation engine
//!
//! Opacity and the related paint outputs (blur opacity, scale,
//! crop, offsets) evolve over real time on animation curves.
//! Transitions in a window's observable state pick a trigger, the
//! trigger picks a configured script, and the engine owns the live
//! instance: advancing it each frame, resuming smoothly when a new
//! transition interrupts a running one, and firing exactly one end
//! callback per instance.

// Austin Shafer - 2024
pub mod script;

use crate::config::Config;
use crate::server::Xid;
use crate::window::{WinRecord, WinState};
use script::{AnimContext, AnimOutputs, AnimScript, OutputKind};

use utils::log;
use utils::region::Rect;

use std::rc::Rc;

/// Below this, two opacity values are the same pixel on an 8-bit
/// display
pub const OPACITY_EPSILON: f64 = 1.0 / 255.0;

/// The state transition that starts an animation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AnimTrigger {
    /// unmapped to mapped as part of a window being created
    Open,
    /// unmapped to mapped for an already open window
    Show,
    Hide,
    Close,
    OpacityInc,
    OpacityDec,
}

bitflags::bitflags! {
    pub struct TriggerMask: u32 {
        const OPEN        = 1 << 0;
        const SHOW        = 1 << 1;
        const HIDE        = 1 << 2;
        const CLOSE       = 1 << 3;
        const OPACITY_INC = 1 << 4;
        const OPACITY_DEC = 1 << 5;
    }
}

impl AnimTrigger {
    pub fn mask(&self) -> TriggerMask {
        match self {
            AnimTrigger::Open => TriggerMask::OPEN,
            AnimTrigger::Show => TriggerMask::SHOW,
            AnimTrigger::Hide => TriggerMask::HIDE,
            AnimTrigger::Close => TriggerMask::CLOSE,
            AnimTrigger::OpacityInc => TriggerMask::OPACITY_INC,
            AnimTrigger::OpacityDec => TriggerMask::OPACITY_DEC,
        }
    }
}

impl TriggerMask {
    pub fn from_name(name: &str) -> Option<TriggerMask> {
        Some(match name {
            "open" => TriggerMask::OPEN,
            "show" => TriggerMask::SHOW,
            "hide" => TriggerMask::HIDE,
            "close" => TriggerMask::CLOSE,
            "opacity-inc" => TriggerMask::OPACITY_INC,
            "opacity-dec" => TriggerMask::OPACITY_DEC,
            _ => return None,
        })
    }
}

/// How an animation instance ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnimEndKind {
    /// Ran to its natural end
    Completed,
    /// Replaced or cancelled mid-flight, ends at its current value
    Interrupted,
    /// Forced to its computed target
    Skipped,
}

/// End notification, fired exactly once per instance
#[derive(Debug, Copy, Clone)]
pub struct AnimEndEvent {
    pub ae_win: Xid,
    pub ae_trigger: AnimTrigger,
    pub ae_kind: AnimEndKind,
}

/// A live evaluator state for one animation script
pub struct AnimInstance {
    ai_script: Rc<dyn AnimScript>,
    ai_trigger: AnimTrigger,
    /// seconds since the instance started
    ai_elapsed: f64,
    /// per-output memory: the values the animation started from.
    /// A replacement instance is seeded with the old instance's
    /// last outputs, which is what makes resume seamless.
    ai_start: AnimOutputs,
    /// last evaluated outputs
    ai_outputs: AnimOutputs,
    /// triggers that continue this instance instead of replacing it
    ai_suppressions: TriggerMask,
    /// opacity target before the transition that started this
    ai_opacity_before: f64,
}

impl AnimInstance {
    fn new(
        script: Rc<dyn AnimScript>,
        trigger: AnimTrigger,
        start: AnimOutputs,
        opacity_before: f64,
    ) -> AnimInstance {
        let suppressions = script.suppressions();
        AnimInstance {
            ai_script: script,
            ai_trigger: trigger,
            ai_elapsed: 0.0,
            ai_start: start,
            ai_outputs: start,
            ai_suppressions: suppressions,
            ai_opacity_before: opacity_before,
        }
    }

    pub fn trigger(&self) -> AnimTrigger {
        self.ai_trigger
    }

    pub fn elapsed(&self) -> f64 {
        self.ai_elapsed
    }

    fn is_finished(&self) -> bool {
        self.ai_elapsed >= self.ai_script.duration()
    }
}

fn make_ctx(rec: &WinRecord, monitor: Rect<i32>, opacity_before: f64) -> AnimContext {
    AnimContext {
        ctx_geom: rec.w_geom.to_rect(),
        ctx_monitor: monitor,
        ctx_opacity_target: rec.w_opacity_target,
        ctx_opacity_before: opacity_before,
    }
}

/// Install the resolved output vector on the record
///
/// Outputs the script did not produce fall back to their defaults;
/// the shadow opacity tracks the animated window opacity unless the
/// script drives it separately.
fn apply_outputs(rec: &mut WinRecord, produced: &AnimOutputs) {
    let mut outs = AnimOutputs::defaults(rec.w_state == WinState::Mapped, rec.w_opacity_target);
    outs.merge_produced(produced);
    if !produced.was_produced(OutputKind::ShadowOpacity) {
        outs.set(OutputKind::ShadowOpacity, outs.get(OutputKind::Opacity));
    }
    rec.w_opacity = outs.get(OutputKind::Opacity);
    rec.w_anim_outputs = outs;
}

/// Snap the record to its computed target with no animation
fn apply_immediate(rec: &mut WinRecord) {
    let outs = AnimOutputs::defaults(rec.w_state == WinState::Mapped, rec.w_opacity_target);
    rec.w_opacity = rec.w_opacity_target;
    rec.w_anim_outputs = outs;
}

fn commit_prev(rec: &mut WinRecord) {
    rec.w_prev_state = rec.w_state;
    rec.w_prev_opacity_target = rec.w_opacity_target;
}

/// Figure out which trigger a transition maps to, if any
fn determine_trigger(
    prev: WinState,
    cur: WinState,
    in_openclose: bool,
    opacity_delta: f64,
    has_running: bool,
) -> Option<AnimTrigger> {
    match (prev, cur) {
        (WinState::Unmapped, WinState::Mapped) => Some(if in_openclose {
            AnimTrigger::Open
        } else {
            AnimTrigger::Show
        }),
        (WinState::Mapped, WinState::Unmapped) => Some(AnimTrigger::Hide),
        (WinState::Mapped, WinState::Destroyed) => Some(AnimTrigger::Close),
        // a window that dies mid-animation still plays its close
        (WinState::Unmapped, WinState::Destroyed) => match has_running {
            true => Some(AnimTrigger::Close),
            false => None,
        },
        (WinState::Mapped, WinState::Mapped) => {
            if opacity_delta > OPACITY_EPSILON {
                Some(AnimTrigger::OpacityInc)
            } else if opacity_delta < -OPACITY_EPSILON {
                Some(AnimTrigger::OpacityDec)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// End any running instance at its current value
pub fn interrupt(rec: &mut WinRecord, events: &mut Vec<AnimEndEvent>) {
    if let Some(anim) = rec.w_anim.take() {
        events.push(AnimEndEvent {
            ae_win: rec.w_xid,
            ae_trigger: anim.ai_trigger,
            ae_kind: AnimEndKind::Interrupted,
        });
    }
}

/// Force any running instance to its computed target
pub fn skip(rec: &mut WinRecord, events: &mut Vec<AnimEndEvent>) {
    if let Some(anim) = rec.w_anim.take() {
        events.push(AnimEndEvent {
            ae_win: rec.w_xid,
            ae_trigger: anim.ai_trigger,
            ae_kind: AnimEndKind::Skipped,
        });
        apply_immediate(rec);
    }
}

/// Advance or (re)start the animation on one record
///
/// Called once per frame for every living record, after the primary
/// flag drain has recomputed the opacity target. `delta_t` is the
/// elapsed real time since the previous frame in seconds. Returns
/// whether the record's observable state changed this frame.
pub fn process(
    rec: &mut WinRecord,
    cfg: &Config,
    monitor: Rect<i32>,
    delta_t: f64,
    redirected: bool,
    events: &mut Vec<AnimEndEvent>,
) -> bool {
    let state_changed = rec.w_state != rec.w_prev_state;
    let opacity_delta = rec.w_opacity_target - rec.w_prev_opacity_target;
    let opacity_changed = opacity_delta.abs() > OPACITY_EPSILON;

    // With the screen not redirected, or for a window that has never
    // been damaged and isn't on screen, there is nothing to animate.
    if !redirected || (!rec.w_ever_damaged && rec.w_state != WinState::Mapped) {
        skip(rec, events);
        apply_immediate(rec);
        commit_prev(rec);
        return state_changed;
    }

    // No transition: keep any running animation moving
    if !state_changed && !opacity_changed {
        // ctx only reads geometry/opacity, build it before taking
        // the mutable borrow on the instance
        let ctx = match rec.w_anim.as_ref() {
            Some(anim) => make_ctx(rec, monitor, anim.ai_opacity_before),
            None => return false,
        };

        let (finished, outs, trigger) = match rec.w_anim.as_mut() {
            Some(anim) => {
                anim.ai_elapsed += delta_t;
                match anim.ai_script.evaluate(anim.ai_elapsed, &ctx, &anim.ai_start) {
                    Ok(outs) => {
                        anim.ai_outputs = outs;
                        (anim.is_finished(), Some(outs), anim.ai_trigger)
                    }
                    Err(e) => {
                        log::error!("animation evaluation failed: {:?}", e);
                        (true, None, anim.ai_trigger)
                    }
                }
            }
            None => return false,
        };

        match outs {
            Some(o) => apply_outputs(rec, &o),
            // evaluation error, land on the target
            None => apply_immediate(rec),
        };

        if finished {
            rec.w_anim = None;
            events.push(AnimEndEvent {
                ae_win: rec.w_xid,
                ae_trigger: trigger,
                ae_kind: AnimEndKind::Completed,
            });
            finish_openclose(rec, trigger);
            return true;
        }
        return false;
    }

    // A transition happened, pick the trigger for it
    let opacity_before = rec.w_prev_opacity_target;
    let trigger = determine_trigger(
        rec.w_prev_state,
        rec.w_state,
        rec.w_in_openclose,
        opacity_delta,
        rec.w_anim.is_some(),
    );
    commit_prev(rec);

    let trigger = match trigger {
        Some(t) => t,
        None => {
            interrupt(rec, events);
            apply_immediate(rec);
            return true;
        }
    };

    // A running animation can mask triggers it expects to cause,
    // in which case it keeps running instead of being replaced
    if let Some(anim) = rec.w_anim.as_ref() {
        if anim.ai_suppressions.contains(trigger.mask()) {
            return true;
        }
    }

    // Fade-excluded windows complete every transition immediately
    let script = match rec.w_fade_excluded {
        true => None,
        false => cfg.animation_for(trigger),
    };
    let script = match script {
        Some(s) => s,
        None => {
            interrupt(rec, events);
            apply_immediate(rec);
            finish_openclose(rec, trigger);
            return true;
        }
    };

    // Instantiate. If an instance is already running the new one
    // resumes from its current observable outputs.
    let start = match rec.w_anim.take() {
        Some(old) => {
            events.push(AnimEndEvent {
                ae_win: rec.w_xid,
                ae_trigger: old.ai_trigger,
                ae_kind: AnimEndKind::Interrupted,
            });
            old.ai_outputs
        }
        None => rec.w_anim_outputs,
    };

    let mut inst = AnimInstance::new(script, trigger, start, opacity_before);
    let ctx = make_ctx(rec, monitor, inst.ai_opacity_before);
    match inst.ai_script.evaluate(0.0, &ctx, &inst.ai_start) {
        Ok(outs) => {
            inst.ai_outputs = outs;
            apply_outputs(rec, &outs);
            rec.w_anim = Some(inst);
        }
        Err(e) => {
            log::error!("animation evaluation failed: {:?}", e);
            events.push(AnimEndEvent {
                ae_win: rec.w_xid,
                ae_trigger: trigger,
                ae_kind: AnimEndKind::Skipped,
            });
            apply_immediate(rec);
        }
    }
    return true;
}

/// The map-open phase ends when the first animation after mapping
/// finishes. A close that lands before that still counts as part of
/// the open/close pair.
fn finish_openclose(rec: &mut WinRecord, trigger: AnimTrigger) {
    match trigger {
        AnimTrigger::Open | AnimTrigger::Show | AnimTrigger::Close => {
            rec.w_in_openclose = false;
        }
        _ => {}
    }
}
