// Derived attribute recomputation
//
// A "factor" is any raw or derived input that can influence how a
// window is painted. When one changes, the dependency table in
// `props` says which of the groups below need recomputing; this
// module does the actual work.
//
// Austin Shafer - 2024
use crate::anim::OPACITY_EPSILON;
use crate::rules::{opacity_rule_match, rules_match};
use crate::window::props::FactorMask;
use crate::window::{update_monitor, DrainCtx, PaintMode, WinRecord, WinState};

use utils::log;

/// The six-clause focus decision
fn compute_focused(rec: &WinRecord, ctx: &DrainCtx) -> bool {
    if let Some(forced) = rec.w_focused_force {
        return forced;
    }

    let cfg = ctx.dc_cfg;

    // the active EWMH window is this record (frame or client)
    if cfg.c_use_ewmh_active_win
        && ctx.dc_active_win.is_some()
        && (ctx.dc_active_win == Some(rec.w_xid) || ctx.dc_active_win == rec.w_client)
    {
        return true;
    }

    // focus-by-type
    if cfg
        .wintype_opt(rec.w_type)
        .map(|o| o.wt_focus)
        .unwrap_or(false)
    {
        return true;
    }

    // WM windows: managed windows with no client underneath
    if cfg.c_mark_wmwin_focused && rec.w_managed && rec.w_client.is_none() {
        return true;
    }

    // explicit focus rules, gated by the blacklist
    if !rules_match(&cfg.c_focus_exclude, rec) && rules_match(&cfg.c_focus_rules, rec) {
        return true;
    }

    // group focus via the client leader
    if cfg.c_detect_leader
        && rec.w_leader.is_some()
        && rec.w_leader == ctx.dc_active_leader
    {
        return true;
    }

    return false;
}

fn compute_opacity_target(rec: &WinRecord, ctx: &DrainCtx) -> f64 {
    if rec.w_state != WinState::Mapped {
        return 0.0;
    }

    let cfg = ctx.dc_cfg;

    // the client hint beats everything
    if let Some(raw) = rec.w_opacity_prop {
        return raw as f64 / 0xffffffffu32 as f64;
    }
    if let Some(op) = opacity_rule_match(&cfg.c_opacity_rules, rec) {
        return op;
    }
    if let Some(op) = cfg.wintype_opt(rec.w_type).and_then(|o| o.wt_opacity) {
        return op;
    }

    match rec.w_focused {
        true => cfg.c_active_opacity,
        false => cfg.c_inactive_opacity,
    }
}

/// Shadow policy: default on, disabled by type, by exclude rule, by
/// shape, or by the client hint. The force override wins over all
/// of it.
fn compute_shadow(rec: &WinRecord, ctx: &DrainCtx) -> bool {
    if let Some(forced) = rec.w_shadow_force {
        return forced;
    }

    let cfg = ctx.dc_cfg;
    let mut shadow = cfg.c_shadow;

    if let Some(by_type) = cfg.wintype_opt(rec.w_type).and_then(|o| o.wt_shadow) {
        shadow = by_type;
    }
    if rules_match(&cfg.c_shadow_exclude, rec) {
        shadow = false;
    }
    // irregularly shaped windows cast broken shadows; a merely
    // round-cornered window is fine
    if cfg.c_shadow_ignore_shaped
        && rec.w_bounding_shape.is_some()
        && rec.w_corner_radius <= 0.0
    {
        shadow = false;
    }
    if rec.w_shadow_hint == Some(false) {
        shadow = false;
    }
    return shadow;
}

fn compute_paint_mode(rec: &WinRecord) -> PaintMode {
    if rec.w_argb || rec.w_opacity_target < 1.0 - OPACITY_EPSILON {
        return PaintMode::ArgbTrans;
    }
    if rec.w_frame_opacity < 1.0 - OPACITY_EPSILON {
        return PaintMode::FrameTrans;
    }
    return PaintMode::Solid;
}

/// Recompute the derived attribute groups named in the record's
/// factor mask. Returns whether the focus value changed, so the
/// caller can propagate it across the leader group.
pub fn recompute(rec: &mut WinRecord, ctx: &DrainCtx) -> bool {
    let mut mask = rec.w_factor_mask;
    let cfg = ctx.dc_cfg;
    let mut focus_changed = false;

    if mask.contains(FactorMask::FULLSCREEN) {
        let before = rec.w_is_fullscreen;
        update_monitor(rec, ctx.dc_monitors);
        if rec.w_is_fullscreen != before {
            // fullscreen feeds the rule conditions
            mask |= FactorMask::all();
        }
    }

    if mask.contains(FactorMask::FOCUS) {
        let focused = compute_focused(rec, ctx);
        if focused != rec.w_focused {
            log::debug!("window {} focused: {}", rec.w_xid, focused);
            rec.w_focused = focused;
            focus_changed = true;
            // focus feeds opacity and the rule conditions
            mask |= FactorMask::all();
        }
    }

    if mask.contains(FactorMask::OPACITY) {
        rec.w_opacity_target = compute_opacity_target(rec, ctx);
        rec.w_frame_opacity = cfg.c_frame_opacity;
    }

    // corners before shadow, the shadow policy looks at them
    if mask.contains(FactorMask::CORNERS) {
        rec.w_corner_radius = match rules_match(&cfg.c_rounded_corners_exclude, rec) {
            true => 0.0,
            false => cfg.c_corner_radius,
        };
    }

    if mask.contains(FactorMask::SHADOW) {
        rec.w_shadow = compute_shadow(rec, ctx);
        rec.w_clip_shadow_above = rules_match(&cfg.c_clip_shadow_above, rec);
    }

    if mask.contains(FactorMask::BLUR) {
        let mut blur = cfg.c_blur_background;
        if let Some(by_type) = cfg.wintype_opt(rec.w_type).and_then(|o| o.wt_blur_background)
        {
            blur = by_type;
        }
        rec.w_blur_background = blur && !rules_match(&cfg.c_blur_exclude, rec);
    }

    if mask.contains(FactorMask::INVERT) {
        rec.w_invert_color = rec
            .w_invert_color_force
            .unwrap_or_else(|| rules_match(&cfg.c_invert_color_rules, rec));
    }

    if mask.contains(FactorMask::SHADER) {
        rec.w_fg_shader = ctx
            .dc_shaders
            .iter()
            .find(|(_, rule)| rule.matches(rec))
            .map(|(shader, _)| *shader);
    }

    if mask.contains(FactorMask::PAINT_MODE) {
        rec.w_paint_mode = compute_paint_mode(rec);
    }

    if mask.contains(FactorMask::EXCLUDES) {
        rec.w_paint_excluded = rules_match(&cfg.c_paint_exclude, rec);
        rec.w_unredir_excluded = rules_match(&cfg.c_unredir_exclude, rec);

        let mut fade_excluded = rules_match(&cfg.c_fade_exclude, rec);
        if cfg
            .wintype_opt(rec.w_type)
            .and_then(|o| o.wt_fade)
            == Some(false)
        {
            fade_excluded = true;
        }
        if let Some(forced) = rec.w_fade_force {
            fade_excluded = !forced;
        }
        rec.w_fade_excluded = fade_excluded;

        rec.w_transparent_clipping = cfg.c_transparent_clipping
            && !rules_match(&cfg.c_transparent_clipping_exclude, rec);
    }

    return focus_changed;
}
