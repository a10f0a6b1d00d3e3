// Paint preprocessing and damage accumulation
//
// Before render commands are issued, one pass over the stacking
// order decides which records are painted at all (`to_paint`),
// maintains the cumulative region that cannot be seen through the
// windows above (`reg_ignore`), and determines whether the screen
// could be unredirected.
//
// Austin Shafer - 2024
use crate::anim::script::OutputKind;
use crate::anim::OPACITY_EPSILON;
use crate::backend::{Backend, DrawCmd, Frame, ShadowCmd};
use crate::config::Config;
use crate::registry::Registry;
use crate::window::{PaintMode, WinFlags, WinId, WinState};

use utils::log;
use utils::region::{Rect, Region};
use utils::timing::Countdown;

use std::collections::VecDeque;

/// Damage accumulated per presented buffer
///
/// The backend reuses buffers, so repainting buffer of age N must
/// cover the damage of the last N frames. The ring keeps one region
/// per recent frame, newest first.
pub struct DamageRing {
    dr_cap: usize,
    dr_root: Rect<i32>,
    /// damage of already presented frames, newest at the front
    dr_frames: VecDeque<Region>,
    /// damage accumulated for the frame being prepared
    dr_current: Region,
}

impl DamageRing {
    pub fn new(root: Rect<i32>, max_buffer_age: usize) -> DamageRing {
        let mut ring = DamageRing {
            dr_cap: max_buffer_age.max(1),
            dr_root: root,
            dr_frames: VecDeque::new(),
            dr_current: Region::new(),
        };
        // the first frame repaints everything
        ring.reset_full();
        return ring;
    }

    pub fn add(&mut self, region: &Region) {
        self.dr_current.union(region);
    }

    pub fn add_rect(&mut self, rect: Rect<i32>) {
        self.dr_current.add_rect(rect);
    }

    /// Everything changed (root background swap, resolution change)
    pub fn reset_full(&mut self) {
        self.dr_current = Region::from_rect(self.dr_root);
    }

    /// The root was resized, old frame damage is meaningless
    pub fn set_root(&mut self, root: Rect<i32>) {
        self.dr_root = root;
        self.dr_frames.clear();
        self.reset_full();
    }

    pub fn is_empty(&self) -> bool {
        self.dr_current.is_empty()
    }

    /// The region a buffer of `age` needs repainted: the pending
    /// damage plus the damage of the last `age - 1` frames. An age
    /// outside the ring means a full repaint.
    pub fn accumulate(&self, age: usize) -> Region {
        if age == 0 || age > self.dr_frames.len() + 1 {
            return Region::from_rect(self.dr_root);
        }

        let mut ret = self.dr_current.clone();
        for frame in self.dr_frames.iter().take(age - 1) {
            ret.union(frame);
        }
        return ret;
    }

    /// The pending damage was presented, rotate it into the ring
    pub fn finish_frame(&mut self) {
        let presented = std::mem::replace(&mut self.dr_current, Region::new());
        self.dr_frames.push_front(presented);
        self.dr_frames.truncate(self.dr_cap);
    }

    /// Unredirection drops all damage history
    pub fn teardown(&mut self) {
        self.dr_frames.clear();
        self.dr_current.clear();
    }
}

/// Whether the server is currently compositing through us
pub struct RedirectState {
    pub rs_redirected: bool,
    /// pending deferred unredirection
    pub rs_unredir_timer: Countdown,
}

impl RedirectState {
    pub fn new() -> RedirectState {
        RedirectState {
            rs_redirected: false,
            rs_unredir_timer: Countdown::new(),
        }
    }
}

/// Result of the paint preprocess pass
#[derive(Debug)]
pub struct PaintPlan {
    /// records to paint, front-to-back
    pub pp_to_paint: Vec<WinId>,
    /// a full-screen solid window sits on top and nothing forbids
    /// handing the screen back to the server
    pub pp_unredir_possible: bool,
}

/// The opaque on-screen region of a record, empty when it is
/// translucent in any way
fn opaque_region(
    rec: &crate::window::WinRecord,
) -> Region {
    if rec.w_paint_mode != PaintMode::Solid
        || rec.w_opacity < 1.0 - OPACITY_EPSILON
        || rec.w_corner_radius > 0.0
    {
        return Region::new();
    }

    let rect = rec.rect();
    match rec.w_bounding_shape.as_ref() {
        Some(shape) => {
            let mut reg = shape.clone();
            reg.translate(rect.r_pos.0, rect.r_pos.1);
            reg.intersect(&Region::from_rect(rect))
        }
        None => Region::from_rect(rect),
    }
}

/// Walk the stacking order top-to-bottom deciding `to_paint` for
/// every record and refreshing the cached `reg_ignore` regions.
///
/// `redirected` matters for the image check: while the screen is
/// handed back to the server our images are intentionally released,
/// and the pass only feeds the re-redirection decision.
pub fn preprocess(registry: &mut Registry, root_geom: Rect<i32>, redirected: bool) -> PaintPlan {
    let mut plan = PaintPlan {
        pp_to_paint: Vec::new(),
        pp_unredir_possible: false,
    };
    // opaque coverage of everything above the current record
    let mut above = Region::new();
    let mut topmost_seen = false;

    for id in registry.top_down() {
        let rec = match registry.win_mut(id) {
            Some(r) => r,
            None => continue,
        };

        if !rec.w_managed {
            rec.w_to_paint = false;
            continue;
        }

        let rect = rec.rect();
        let mut to_paint = true;

        // off screen, invisible, excluded or broken windows are
        // skipped entirely
        if rec.w_state != WinState::Mapped && !rec.is_animating() {
            to_paint = false;
        } else if !rect.intersects(&root_geom) {
            to_paint = false;
        } else if rec.w_opacity < OPACITY_EPSILON
            && !(rec.w_blur_background && rec.w_opacity > 0.0)
        {
            to_paint = false;
        } else if rec.w_paint_excluded {
            to_paint = false;
        } else if rec.w_flags.contains(WinFlags::IMAGE_ERROR) {
            to_paint = false;
        } else if redirected && rec.w_image.is_none() && rec.w_saved_image.is_none() {
            to_paint = false;
        } else if above.covers_rect(&rect) {
            // completely hidden behind opaque windows
            to_paint = false;
        }

        rec.w_to_paint = to_paint;
        if !to_paint {
            continue;
        }

        // the cached clip-ignore is only rebuilt when invalid
        if rec.w_reg_ignore.is_none() {
            rec.w_reg_ignore = Some(above.clone());
        }

        if !topmost_seen {
            topmost_seen = true;
            // only the top visible window can justify unredirection
            plan.pp_unredir_possible = rec.w_is_fullscreen
                && rec.w_paint_mode == PaintMode::Solid
                && rec.w_opacity >= 1.0 - OPACITY_EPSILON
                && !rec.w_unredir_excluded;
        }

        above.union(&opaque_region(rec));
        plan.pp_to_paint.push(id);
    }

    return plan;
}

/// Lazily rebuild the shadow and mask images the paint plan needs
pub fn prepare_resources(
    registry: &mut Registry,
    backend: &mut dyn Backend,
    cfg: &Config,
    plan: &PaintPlan,
) {
    for id in plan.pp_to_paint.iter() {
        let rec = match registry.win_mut(*id) {
            Some(r) => r,
            None => continue,
        };

        let size = (
            rec.rect().r_size.0.max(0) as u32,
            rec.rect().r_size.1.max(0) as u32,
        );

        if rec.w_shadow && rec.w_shadow_image.is_none() {
            match backend.render_shadow(size, cfg.c_shadow_radius, cfg.c_shadow_color) {
                Ok(img) => rec.w_shadow_image = Some(img),
                Err(e) => log::error!("shadow render failed for {}: {:?}", rec.w_xid, e),
            }
        }

        if rec.w_bounding_shape.is_some() && rec.w_mask_image.is_none() {
            let shape = rec.w_bounding_shape.clone().unwrap_or_else(Region::new);
            match backend.make_mask(size, &shape) {
                Ok(img) => rec.w_mask_image = Some(img),
                Err(e) => log::error!("mask render failed for {}: {:?}", rec.w_xid, e),
            }
        }

        // push the per-image paint parameters down before present
        if let Some(image) = rec.w_image {
            let props = [
                crate::backend::ImageProperty::InvertColor(rec.w_invert_color),
                crate::backend::ImageProperty::CornerRadius(rec.w_corner_radius),
                crate::backend::ImageProperty::FgShader(rec.w_fg_shader),
            ];
            for prop in props.iter() {
                if let Err(e) = backend.set_image_property(image, *prop) {
                    log::error!("image property update failed for {}: {:?}", rec.w_xid, e);
                }
            }
        }
    }
}

/// Clamp a possibly-infinite crop output into pixel space
fn crop_extent(val: f64, fallback: i32) -> i32 {
    if val.is_infinite() {
        return fallback;
    }
    return val as i32;
}

/// Turn the paint plan into backend draw commands, bottom-to-top
pub fn build_frame(
    registry: &Registry,
    cfg: &Config,
    plan: &PaintPlan,
    damage: Region,
) -> Frame {
    let mut cmds = Vec::with_capacity(plan.pp_to_paint.len());

    // commands are issued back-to-front
    for id in plan.pp_to_paint.iter().rev() {
        let rec = match registry.win(*id) {
            Some(r) => r,
            None => continue,
        };
        // windows mid-teardown fall back to their saved contents
        let image = match rec.w_image.or(rec.w_saved_image) {
            Some(img) => img,
            None => continue,
        };

        let outs = &rec.w_anim_outputs;
        let base = rec.rect();
        let rect = Rect::new(
            base.r_pos.0 + outs.get(OutputKind::OffsetX) as i32,
            base.r_pos.1 + outs.get(OutputKind::OffsetY) as i32,
            (base.r_size.0 as f64 * outs.get(OutputKind::ScaleX)) as i32,
            (base.r_size.1 as f64 * outs.get(OutputKind::ScaleY)) as i32,
        );
        let crop = Rect::new(
            rect.r_pos.0 + outs.get(OutputKind::CropX) as i32,
            rect.r_pos.1 + outs.get(OutputKind::CropY) as i32,
            crop_extent(outs.get(OutputKind::CropWidth), rect.r_size.0),
            crop_extent(outs.get(OutputKind::CropHeight), rect.r_size.1),
        );

        let shadow = match (rec.w_shadow, rec.w_shadow_image) {
            (true, Some(img)) => Some(ShadowCmd {
                sc_image: img,
                sc_rect: Rect::new(
                    rect.r_pos.0 + cfg.c_shadow_offset.0
                        + outs.get(OutputKind::ShadowOffsetX) as i32,
                    rect.r_pos.1 + cfg.c_shadow_offset.1
                        + outs.get(OutputKind::ShadowOffsetY) as i32,
                    (rect.r_size.0 as f64 * outs.get(OutputKind::ShadowScaleX)) as i32,
                    (rect.r_size.1 as f64 * outs.get(OutputKind::ShadowScaleY)) as i32,
                ),
                sc_opacity: outs.get(OutputKind::ShadowOpacity),
                // shadows never bleed onto the windows above us
                sc_clip: match rec.w_clip_shadow_above {
                    true => rec.w_reg_ignore.clone().unwrap_or_else(Region::new),
                    false => Region::new(),
                },
            }),
            _ => None,
        };

        cmds.push(DrawCmd {
            dc_image: image,
            dc_rect: rect,
            dc_opacity: rec.w_opacity,
            dc_blur_behind: rec.w_blur_background,
            dc_blur_opacity: outs.get(OutputKind::BlurOpacity),
            dc_crop: crop,
            dc_shadow: shadow,
        });
    }

    Frame {
        f_cmds: cmds,
        f_damage: damage,
    }
}
