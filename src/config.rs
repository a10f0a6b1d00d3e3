// Compositor options
//
// All in-memory. Parsing a configuration file into this struct is
// the embedder's job, the core only consumes the resolved values.
//
// Austin Shafer - 2024
use crate::anim::{script::AnimScript, AnimTrigger};
use crate::rules::WinRule;
use crate::server::WinType;

use std::collections::HashMap;
use std::rc::Rc;

/// Per-EWMH-type overrides
#[derive(Debug, Clone, Default)]
pub struct WinTypeOptions {
    /// override the global shadow policy for this type
    pub wt_shadow: Option<bool>,
    /// exclude this type from fading
    pub wt_fade: Option<bool>,
    /// fixed opacity for this type
    pub wt_opacity: Option<f64>,
    /// windows of this type count as focused
    pub wt_focus: bool,
    pub wt_blur_background: Option<bool>,
}

/// The resolved option set the core runs with
pub struct Config {
    // -- frame scheduling --
    /// pace renders against vblank using collected statistics
    pub c_frame_pacing: bool,
    pub c_unredir_if_possible: bool,
    /// how long a full-screen solid window must stay on top before
    /// the screen is unredirected
    pub c_unredir_delay_usec: u64,

    // -- shadows --
    pub c_shadow: bool,
    /// no shadows on irregularly shaped windows unless they are
    /// merely round-cornered
    pub c_shadow_ignore_shaped: bool,
    pub c_shadow_radius: i32,
    pub c_shadow_offset: (i32, i32),
    pub c_shadow_color: (f64, f64, f64, f64),
    pub c_shadow_exclude: Vec<WinRule>,
    pub c_clip_shadow_above: Vec<WinRule>,

    // -- focus --
    /// trust _NET_ACTIVE_WINDOW on the root
    pub c_use_ewmh_active_win: bool,
    /// windows managed by the WM itself count as focused
    pub c_mark_wmwin_focused: bool,
    /// group-focus propagation through client leaders
    pub c_detect_leader: bool,
    /// the focus blacklist
    pub c_focus_exclude: Vec<WinRule>,
    pub c_focus_rules: Vec<WinRule>,

    // -- opacity --
    pub c_active_opacity: f64,
    pub c_inactive_opacity: f64,
    pub c_frame_opacity: f64,
    pub c_opacity_rules: Vec<(f64, WinRule)>,

    // -- other paint policies --
    pub c_blur_background: bool,
    pub c_blur_exclude: Vec<WinRule>,
    pub c_corner_radius: f64,
    pub c_rounded_corners_exclude: Vec<WinRule>,
    pub c_invert_color_rules: Vec<WinRule>,
    /// foreground shader source per condition, compiled at startup
    pub c_window_shader_rules: Vec<(String, WinRule)>,
    pub c_paint_exclude: Vec<WinRule>,
    pub c_unredir_exclude: Vec<WinRule>,
    pub c_fade_exclude: Vec<WinRule>,
    pub c_transparent_clipping: bool,
    pub c_transparent_clipping_exclude: Vec<WinRule>,

    // -- per window type --
    pub c_wintype_opts: HashMap<WinType, WinTypeOptions>,

    // -- animations --
    c_animations: HashMap<AnimTrigger, Rc<dyn AnimScript>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            c_frame_pacing: true,
            c_unredir_if_possible: false,
            c_unredir_delay_usec: 0,
            c_shadow: true,
            c_shadow_ignore_shaped: false,
            c_shadow_radius: 12,
            c_shadow_offset: (-15, -15),
            c_shadow_color: (0.0, 0.0, 0.0, 0.75),
            c_shadow_exclude: Vec::new(),
            c_clip_shadow_above: Vec::new(),
            c_use_ewmh_active_win: true,
            c_mark_wmwin_focused: false,
            c_detect_leader: false,
            c_focus_exclude: Vec::new(),
            c_focus_rules: Vec::new(),
            c_active_opacity: 1.0,
            c_inactive_opacity: 1.0,
            c_frame_opacity: 1.0,
            c_opacity_rules: Vec::new(),
            c_blur_background: false,
            c_blur_exclude: Vec::new(),
            c_corner_radius: 0.0,
            c_rounded_corners_exclude: Vec::new(),
            c_invert_color_rules: Vec::new(),
            c_window_shader_rules: Vec::new(),
            c_paint_exclude: Vec::new(),
            c_unredir_exclude: Vec::new(),
            c_fade_exclude: Vec::new(),
            c_transparent_clipping: false,
            c_transparent_clipping_exclude: Vec::new(),
            c_wintype_opts: HashMap::new(),
            c_animations: HashMap::new(),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Install an animation script for a trigger
    pub fn set_animation(&mut self, trigger: AnimTrigger, script: Rc<dyn AnimScript>) {
        self.c_animations.insert(trigger, script);
    }

    pub fn clear_animation(&mut self, trigger: AnimTrigger) {
        self.c_animations.remove(&trigger);
    }

    /// The script configured for this trigger, if any
    pub fn animation_for(&self, trigger: AnimTrigger) -> Option<Rc<dyn AnimScript>> {
        self.c_animations.get(&trigger).cloned()
    }

    /// Whether any animation is configured at all, used to shortcut
    /// frame work when fading is off
    pub fn has_animations(&self) -> bool {
        !self.c_animations.is_empty()
    }

    pub fn wintype_opt(&self, ty: WinType) -> Option<&WinTypeOptions> {
        self.c_wintype_opts.get(&ty)
    }
}
