//! # Squall
//!
//! The core of a compositing window-manager helper for X. For each
//! managed toplevel it tracks the observable state derived from the
//! server, drives per-window animations and opacity transitions,
//! owns the GPU-side image resources tied to the window, schedules
//! repaints, and paces frame delivery against display vblanks.
//!
//! The concrete X client and the GPU renderer are collaborators
//! behind the `server::DisplayServer` and `backend::Backend` traits;
//! squall supplies the machinery between them:
//!
//! * `registry` - window identity, lifecycle and stacking order
//! * `window` - per-window flags, drains and derived attributes
//! * `anim` - transition-triggered animation instances
//! * `sched` - render budgeting and vblank pacing
//!
//! Everything runs on one thread. The `Compositor` owns the event
//! loop: server events set stale flags, the draw timer drains them,
//! advances animations and hands a frame to the backend.

// Austin Shafer - 2024
pub mod anim;
pub mod backend;
pub mod config;
mod event;
pub mod paint;
pub mod registry;
pub mod rules;
pub mod sched;
pub mod server;
pub mod window;

#[cfg(test)]
mod tests;

extern crate thiserror;
use thiserror::Error;

extern crate utils;
pub use utils::region::{Rect, Region};
pub use utils::timing::{Clock, MonotonicClock};
pub use utils::{anyhow, Context, Error, Result};
use utils::fdwatch::FdWatch;
use utils::log;
use utils::timing::StopWatch;

pub use crate::anim::{AnimEndEvent, AnimEndKind, AnimTrigger};
pub use crate::backend::{Backend, DeviceStatus, ShaderHandle};
pub use crate::config::Config;
pub use crate::registry::Registry;
pub use crate::rules::WinRule;
pub use crate::sched::{SchedAction, SchedTelemetry, VblankOutcome};
pub use crate::server::{Atom, Atoms, DisplayServer, ServerEvent, Xid};
pub use crate::window::{WinId, WinRecord, WinState};

extern crate paste;
use paste::paste;

/// Squall error codes
#[allow(non_camel_case_types)]
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SquallError {
    #[error("Invalid or unknown window handle")]
    INVALID_HANDLE,
    #[error("Async reply outlived its target window")]
    GENERATION_MISMATCH,
    #[error("Could not bind the window pixmap")]
    IMAGE_BIND_FAILED,
    #[error("The rendering device was lost")]
    DEVICE_RESET,
    #[error("Could not present the frame")]
    PRESENT_FAILED,
    #[error("The screen is not redirected")]
    NOT_REDIRECTED,
}

/// What the embedder's loop should do after one dispatch
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Continue,
    /// tear everything down and exit
    Quit,
    /// tear the session down and build a new one
    Reset,
}

fn min_timeout(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, y) => y,
    }
}

/// The compositor core
///
/// Owns the registry, the animation engine state, the frame
/// scheduler and the GPU resources of every window. Single
/// threaded; `dispatch` is one iteration of the event loop.
pub struct Compositor {
    c_server: Box<dyn DisplayServer>,
    c_backend: Box<dyn Backend>,
    c_clock: Box<dyn Clock>,
    c_cfg: Config,
    c_atoms: Atoms,
    c_registry: Registry,
    c_sched: sched::FrameScheduler,
    c_damage: paint::DamageRing,
    c_redirect: paint::RedirectState,
    /// compiled foreground shader rules
    c_shaders: Vec<(ShaderHandle, WinRule)>,
    /// the EWMH active window, mirrored off the root property
    c_active_win: Option<Xid>,
    c_active_leader: Option<Xid>,
    /// when the previous draw ran, for animation delta time
    c_last_draw: u64,
    c_quit: bool,
    c_reset: bool,
    /// end-of-animation notifications since the last drain
    c_anim_events: Vec<AnimEndEvent>,
    c_fdwatch: FdWatch,
}

// The force-override entry points all look identical: poke the
// registry, repaint if it stuck.
macro_rules! define_force_overrides {
    ($name:ident) => {
        paste! {
            pub fn [<window_set_ $name _force>](&mut self, win: Xid, force: Option<bool>) {
                if self.c_registry.[<window_set_ $name _force>](win, force) {
                    self.queue_redraw();
                }
            }
        }
    };
}

impl Compositor {
    /// Build the core around a connected server and backend.
    ///
    /// Takes over the screen: interns atoms, compiles configured
    /// shaders, redirects subwindows and adopts every existing
    /// toplevel.
    pub fn new(
        mut server: Box<dyn DisplayServer>,
        mut backend: Box<dyn Backend>,
        clock: Box<dyn Clock>,
        cfg: Config,
    ) -> Result<Compositor> {
        let atoms = Atoms::intern(server.as_mut());

        let mut shaders = Vec::new();
        for (src, rule) in cfg.c_window_shader_rules.iter() {
            let handle = backend
                .create_shader(src)
                .context("compiling window shader rule")?;
            shaders.push((handle, rule.clone()));
        }

        let root_geom = server.root_geometry();
        let max_age = backend.max_buffer_age();
        let frame_pacing = cfg.c_frame_pacing;

        let mut comp = Compositor {
            c_server: server,
            c_backend: backend,
            c_clock: clock,
            c_cfg: cfg,
            c_atoms: atoms,
            c_registry: Registry::new(),
            c_sched: sched::FrameScheduler::new(frame_pacing),
            c_damage: paint::DamageRing::new(root_geom, max_age),
            c_redirect: paint::RedirectState::new(),
            c_shaders: shaders,
            c_active_win: None,
            c_active_leader: None,
            c_last_draw: 0,
            c_quit: false,
            c_reset: false,
            c_anim_events: Vec::new(),
            c_fdwatch: FdWatch::new(),
        };

        comp.c_server
            .acquire_compositor_selection()
            .context("claiming the compositor selection")?;
        comp.c_server
            .redirect_subwindows()
            .context("redirecting subwindows for compositing")?;
        comp.c_redirect.rs_redirected = true;

        // adopt everything that already exists, bottom-to-top so
        // the stacking order comes out right
        let root = comp.c_server.root();
        let children = comp.c_server.query_tree(root)?;
        for child in children.iter() {
            comp.c_registry
                .note_new_toplevel(comp.c_server.as_mut(), *child);
        }

        event::refresh_active_win(
            &mut comp.c_registry,
            comp.c_server.as_mut(),
            &mut comp.c_active_win,
            &mut comp.c_active_leader,
        );

        let fd = comp.c_server.connection_fd();
        comp.c_fdwatch.add_fd(fd);
        comp.c_fdwatch.register_events();
        // start the vblank statistics flowing
        comp.c_server.request_vblank_event();

        return Ok(comp);
    }

    fn now(&self) -> u64 {
        self.c_clock.now_usec()
    }

    // ------------------------------
    // Public control surface
    // ------------------------------

    define_force_overrides!(focused);
    define_force_overrides!(shadow);
    define_force_overrides!(fade);
    define_force_overrides!(invert_color);

    /// Ask for a repaint. Idempotent while one is queued.
    pub fn queue_redraw(&mut self) {
        let now = self.now();
        let redirected = self.c_redirect.rs_redirected;
        if let Some(action) = self.c_sched.queue_redraw(now, redirected) {
            self.perform_sched_action(action);
        }
    }

    fn perform_sched_action(&mut self, action: SchedAction) {
        match action {
            // the timer is polled off our loop timeout
            SchedAction::ArmTimer(_) => {}
            SchedAction::WaitVblank => self.c_server.request_vblank_event(),
        }
    }

    /// Declare a screen-space region as changed
    pub fn add_damage(&mut self, region: &Region) {
        self.c_damage.add(region);
        self.queue_redraw();
    }

    /// The root contents changed, everything must repaint
    pub fn root_damaged(&mut self) {
        self.c_damage.reset_full();
        self.queue_redraw();
    }

    /// Throw away incremental state and repaint from scratch
    pub fn force_repaint(&mut self) {
        self.c_damage.reset_full();
        self.queue_redraw();
    }

    /// Queue a property refresh for the given atoms
    pub fn window_set_properties_stale(&mut self, win: Xid, atoms: &[Atom]) {
        if let Some(rec) = self.c_registry.win_by_xid_mut(win) {
            rec.set_properties_stale(atoms);
            self.queue_redraw();
        }
    }

    pub fn restack_above(&mut self, win: Xid, below: Xid) {
        self.c_registry.restack_above(win, below);
        self.queue_redraw();
    }

    pub fn restack_top(&mut self, win: Xid) {
        self.c_registry.restack_top(win);
        self.queue_redraw();
    }

    pub fn restack_bottom(&mut self, win: Xid) {
        self.c_registry.restack_bottom(win);
        self.queue_redraw();
    }

    /// Signal handlers set these; the loop honors them at the next
    /// safe point
    pub fn request_quit(&mut self) {
        self.c_quit = true;
    }

    pub fn request_reset(&mut self) {
        self.c_reset = true;
    }

    /// Drain the end-of-animation notifications collected since the
    /// last call
    pub fn drain_animation_events(&mut self) -> Vec<AnimEndEvent> {
        std::mem::replace(&mut self.c_anim_events, Vec::new())
    }

    /// Record a cross-fade source for `win`: it will render using
    /// `from`'s last contents, which keeps `from` alive until the
    /// reference is dropped or `win` goes away.
    pub fn window_set_prev_trans(&mut self, win: Xid, from: Option<Xid>) {
        let win_id = self.c_registry.lookup(win);
        let from_id = from.and_then(|xid| self.c_registry.lookup(xid));
        if let Some(id) = win_id {
            self.c_registry.set_prev_trans(id, from_id);
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.c_registry
    }

    pub fn telemetry(&self) -> SchedTelemetry {
        self.c_sched.telemetry()
    }

    pub fn is_redirected(&self) -> bool {
        self.c_redirect.rs_redirected
    }

    // ------------------------------
    // Event pump
    // ------------------------------

    /// Decode and route everything the server has queued. Returns
    /// whether any of it warrants a repaint.
    fn drain_server_events(&mut self) -> bool {
        let mut needs_redraw = false;

        while let Some(ev) = self.c_server.poll_event() {
            match ev {
                ServerEvent::Vblank { msc, ust } => self.handle_vblank(msc, ust),
                ServerEvent::Configure { window, geom, .. }
                    if window == self.c_server.root() =>
                {
                    // the root changed size; every derived size and
                    // all damage history is invalid
                    log::debug!("root resized to {:?}", geom);
                    self.c_backend.root_change();
                    self.c_damage.set_root(geom.to_rect());
                    needs_redraw = true;
                }
                other => {
                    needs_redraw |= event::handle_event(
                        &mut self.c_registry,
                        self.c_server.as_mut(),
                        &mut self.c_damage,
                        &self.c_atoms,
                        &mut self.c_active_win,
                        &mut self.c_active_leader,
                        other,
                    );
                }
            }
        }
        return needs_redraw;
    }

    fn handle_vblank(&mut self, msc: u64, ust: u64) {
        let last_render = self.c_backend.last_render_time();
        let now = self.now();

        match self.c_sched.on_vblank(msc, ust, last_render, now) {
            VblankOutcome::KeepWaiting => self.c_server.request_vblank_event(),
            VblankOutcome::Reschedule => {
                let redirected = self.c_redirect.rs_redirected;
                let action = self.c_sched.schedule_render(now, redirected);
                self.perform_sched_action(action);
            }
            VblankOutcome::Idle => {}
        }
    }

    // ------------------------------
    // The event loop
    // ------------------------------

    /// One iteration: drain events, run the draw callback if its
    /// timer expired, then sleep until there is something to do.
    ///
    /// `timeout_usec` caps how long the iteration may sleep waiting
    /// for server events; None sleeps until the next armed timer or
    /// fd readiness.
    pub fn dispatch(&mut self, timeout_usec: Option<u64>) -> Result<DispatchResult> {
        if self.c_quit {
            return Ok(DispatchResult::Quit);
        }

        if self.drain_server_events() {
            self.queue_redraw();
        }

        let now = self.now();
        if self.c_redirect.rs_unredir_timer.is_expired(now) {
            self.commit_unredirect();
        }

        if self.c_sched.is_render_queued() && self.c_sched.timer_expired(now) {
            self.frame()?;
        }

        if self.c_quit {
            return Ok(DispatchResult::Quit);
        }
        if self.c_reset {
            self.c_reset = false;
            return Ok(DispatchResult::Reset);
        }

        // Pre-sleep: flush our requests out, then drain anything
        // the server already handed us. Queued events must never
        // sit hidden in userspace buffers while we sleep in poll.
        self.c_server.flush();
        if self.drain_server_events() {
            self.queue_redraw();
            return Ok(DispatchResult::Continue);
        }

        let now = self.now();
        let timeout = min_timeout(
            timeout_usec,
            min_timeout(
                self.c_sched.timer_remaining(now),
                self.c_redirect.rs_unredir_timer.time_remaining(now),
            ),
        );
        self.c_fdwatch.wait_for_events(timeout);

        return Ok(DispatchResult::Continue);
    }

    /// Run until quit or reset
    pub fn run(&mut self) -> Result<DispatchResult> {
        loop {
            match self.dispatch(None)? {
                DispatchResult::Continue => {}
                other => return Ok(other),
            }
        }
    }

    // ------------------------------
    // The draw callback
    // ------------------------------

    /// The frame body: drain flags, advance animations, refresh
    /// images, preprocess, render. The phase order here is a hard
    /// guarantee, nothing may reorder it.
    fn frame(&mut self) -> Result<()> {
        let mut stop = StopWatch::new();
        stop.start();

        let now = self.now();
        self.c_sched.on_draw_start(now);

        let delta_t = match self.c_last_draw {
            0 => 0.0,
            last => (now.saturating_sub(last)) as f64 / 1_000_000.0,
        };
        self.c_last_draw = now;

        if self.c_backend.device_status() == DeviceStatus::ResetRequired {
            // give the driver a moment, then have the outer loop
            // rebuild the session
            log::error!("rendering device lost, requesting session reset");
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.c_reset = true;
            return Ok(());
        }

        let redirected = self.c_redirect.rs_redirected;
        let monitors = self.c_server.monitors();
        let root_geom = self.c_server.root_geometry();
        let ids = self.c_registry.top_down();

        // -- phase 1: primary flag drain, stacking order --
        let mut focus_leaders: Vec<Option<Xid>> = Vec::new();
        for id in ids.iter() {
            let ctx = window::DrainCtx {
                dc_cfg: &self.c_cfg,
                dc_atoms: &self.c_atoms,
                dc_monitors: monitors.as_slice(),
                dc_root_geom: root_geom,
                dc_active_win: self.c_active_win,
                dc_active_leader: self.c_active_leader,
                dc_shaders: self.c_shaders.as_slice(),
            };
            if let Some(rec) = self.c_registry.win_mut(*id) {
                let outcome = window::drain_primary(
                    rec,
                    self.c_server.as_mut(),
                    self.c_backend.as_mut(),
                    &ctx,
                );
                if outcome.dr_focus_changed {
                    focus_leaders.push(rec.w_leader);
                }
                self.c_damage.add(&outcome.dr_damage);
            }
        }

        // focus propagates across leader groups; mark the group
        // members stale and drain the factor flags once more
        if self.c_cfg.c_detect_leader && !focus_leaders.is_empty() {
            for id in ids.iter() {
                if let Some(rec) = self.c_registry.win_mut(*id) {
                    if rec.w_leader.is_some() && focus_leaders.contains(&rec.w_leader) {
                        rec.w_flags |= window::WinFlags::FACTOR_CHANGED;
                        rec.w_factor_mask |= window::props::FactorMask::FOCUS;
                    }
                }
            }
            for id in ids.iter() {
                let ctx = window::DrainCtx {
                    dc_cfg: &self.c_cfg,
                    dc_atoms: &self.c_atoms,
                    dc_monitors: monitors.as_slice(),
                    dc_root_geom: root_geom,
                    dc_active_win: self.c_active_win,
                    dc_active_leader: self.c_active_leader,
                    dc_shaders: self.c_shaders.as_slice(),
                };
                if let Some(rec) = self.c_registry.win_mut(*id) {
                    let outcome = window::drain_primary(
                        rec,
                        self.c_server.as_mut(),
                        self.c_backend.as_mut(),
                        &ctx,
                    );
                    self.c_damage.add(&outcome.dr_damage);
                }
            }
        }

        // -- phase 2: animation advance --
        let mut any_animating = false;
        for id in ids.iter() {
            let monitor = {
                let rec = match self.c_registry.win(*id) {
                    Some(r) => r,
                    None => continue,
                };
                rec.w_monitor
                    .and_then(|i| monitors.get(i).copied())
                    .unwrap_or(root_geom)
            };
            if let Some(rec) = self.c_registry.win_mut(*id) {
                let changed = anim::process(
                    rec,
                    &self.c_cfg,
                    monitor,
                    delta_t,
                    redirected,
                    &mut self.c_anim_events,
                );
                if changed || rec.is_animating() {
                    self.c_damage.add_rect(rec.extents_with_shadow(
                        self.c_cfg.c_shadow_radius,
                        self.c_cfg.c_shadow_offset,
                    ));
                }
                any_animating |= rec.is_animating();
            }
        }

        // -- phase 3: image flag drain --
        for id in ids.iter() {
            if let Some(rec) = self.c_registry.win_mut(*id) {
                window::drain_image(rec, self.c_server.as_mut(), self.c_backend.as_mut());
            }
        }

        // -- phase 4: reap destroyed records nothing needs anymore --
        {
            let Compositor {
                c_registry,
                c_server,
                c_backend,
                ..
            } = self;
            c_registry.finalize_destroyed(|rec| {
                window::release_images(rec, c_server.as_mut(), c_backend.as_mut());
            });
        }

        // -- phase 5: paint preprocess --
        let plan =
            paint::preprocess(&mut self.c_registry, root_geom, self.c_redirect.rs_redirected);

        // -- phase 6: redirection decision --
        self.update_redirection(&plan, now);
        if !self.c_redirect.rs_redirected {
            // nothing to render, the server is presenting directly
            self.c_sched.on_draw_end(false);
            return Ok(());
        }

        // -- phase 7: render --
        paint::prepare_resources(
            &mut self.c_registry,
            self.c_backend.as_mut(),
            &self.c_cfg,
            &plan,
        );
        let age = self.c_backend.max_buffer_age();
        let damage = self.c_damage.accumulate(age);
        let frame = paint::build_frame(&self.c_registry, &self.c_cfg, &plan, damage);

        // render failure is fatal, there is no meaningful recovery
        self.c_backend
            .present(&frame)
            .context(SquallError::PRESENT_FAILED)?;
        self.c_damage.finish_frame();

        for id in self.c_registry.top_down() {
            if let Some(rec) = self.c_registry.win_mut(id) {
                rec.w_painted_last_frame = rec.w_to_paint;
            }
        }

        self.c_sched.on_draw_end(true);
        // the completion re-check (and render statistics) ride the
        // next vblank notification
        if self.c_cfg.c_frame_pacing {
            self.c_server.request_vblank_event();
        } else if let Some(t) = self.c_backend.last_render_time() {
            self.c_sched.push_render_sample(t);
        }

        if any_animating {
            self.queue_redraw();
        }

        stop.end();
        log::profiling!(
            "spent {} ms preparing this frame",
            stop.get_duration().as_millis()
        );
        return Ok(());
    }

    /// Decide whether the screen should stay redirected given the
    /// current paint plan
    fn update_redirection(&mut self, plan: &paint::PaintPlan, now: u64) {
        let want_unredirect =
            self.c_cfg.c_unredir_if_possible && plan.pp_unredir_possible;

        if self.c_redirect.rs_redirected {
            if want_unredirect {
                if self.c_cfg.c_unredir_delay_usec == 0 {
                    self.commit_unredirect();
                } else if !self.c_redirect.rs_unredir_timer.is_armed() {
                    self.c_redirect
                        .rs_unredir_timer
                        .arm(now, self.c_cfg.c_unredir_delay_usec);
                }
            } else {
                self.c_redirect.rs_unredir_timer.disarm();
            }
        } else if !want_unredirect {
            self.redirect_now();
        }
    }

    /// Hand the screen back to the server and drop every GPU
    /// resource we hold
    fn commit_unredirect(&mut self) {
        if !self.c_redirect.rs_redirected {
            self.c_redirect.rs_unredir_timer.disarm();
            return;
        }
        log::debug!("unredirecting the screen");

        self.c_redirect.rs_unredir_timer.disarm();
        self.c_server.unredirect_subwindows();
        self.c_redirect.rs_redirected = false;

        let Compositor {
            c_registry,
            c_server,
            c_backend,
            ..
        } = self;
        for id in c_registry.top_down() {
            if let Some(rec) = c_registry.win_mut(id) {
                window::release_images(rec, c_server.as_mut(), c_backend.as_mut());
            }
        }

        self.c_damage.teardown();
        self.c_sched.on_unredirect();
    }

    /// Start compositing again after an unredirected stretch
    fn redirect_now(&mut self) {
        log::debug!("redirecting the screen");
        match self.c_server.redirect_subwindows() {
            Ok(()) => {
                self.c_redirect.rs_redirected = true;
                self.c_damage.reset_full();
                self.queue_redraw();
            }
            Err(e) => log::error!("could not redirect the screen: {:?}", e),
        }
    }
}
