//! # Per-window state
//!
//! Every managed toplevel is one `WinRecord`. Raw server-side
//! attributes (geometry, properties, client window, bounding shape,
//! map state) feed a larger set of derived paint attributes. Server
//! notifications only set *stale* flags on the record; the actual
//! recomputation happens in two drain phases the frame loop runs
//! before painting:
//!
//! * the primary drain (`drain_primary`) handles structural work:
//!   map starts, client re-detection, geometry commits, property
//!   refreshes and derived-attribute recomputation
//! * the image drain (`drain_image`) refreshes GPU resources, i.e.
//!   rebinding the named pixmap when contents went stale
//!
//! Derived attributes are only valid once every flag other than
//! `IMAGE_ERROR` has been drained in the current frame.

// Austin Shafer - 2024
pub mod factor;
pub mod props;

use crate::anim::script::AnimOutputs;
use crate::anim::AnimInstance;
use crate::backend::{Backend, BackendImage, ShaderHandle};
use crate::server::{
    Atoms, DisplayServer, Pixmap, WinAttrs, WinClass, WinGeometry, WinType, Xid,
};
use crate::window::props::{FactorMask, PropertySet};

use utils::log;
use utils::region::{Rect, Region};

pub use crate::rules::WinRule;

/// Records are addressed by generational arena ids, so stale
/// cross-references resolve to None instead of dangling.
pub type WinId = utils::arena::Id;

bitflags::bitflags! {
    /// Pending work items for a record
    ///
    /// Set by event handling, drained once per frame.
    pub struct WinFlags: u32 {
        /// a map-start must run
        const MAPPED         = 1 << 0;
        /// the pixmap binding is out of date
        const PIXMAP_STALE   = 1 << 1;
        /// no pixmap binding exists at all
        const PIXMAP_NONE    = 1 << 2;
        /// binding failed; excluded from painting until a re-bind
        const IMAGE_ERROR    = 1 << 3;
        /// the client window must be re-detected
        const CLIENT_STALE   = 1 << 4;
        /// properties in the stale set must be refreshed
        const PROPERTY_STALE = 1 << 5;
        const SIZE_STALE     = 1 << 6;
        const POSITION_STALE = 1 << 7;
        /// derived attributes must be recomputed
        const FACTOR_CHANGED = 1 << 8;
    }
}

/// Lifecycle state of a record
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WinState {
    Unmapped,
    Mapped,
    /// The server handle is gone. The record lingers in the
    /// stacking order until its tear-down animation finishes.
    Destroyed,
}

/// How the window must be composited
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PaintMode {
    /// fully opaque
    Solid,
    /// only the frame is translucent
    FrameTrans,
    /// the whole window carries alpha
    ArgbTrans,
}

/// _NET_FRAME_EXTENTS, the WM decoration border
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FrameExtents {
    pub fe_left: i32,
    pub fe_right: i32,
    pub fe_top: i32,
    pub fe_bottom: i32,
}

/// One managed (or stacking-placeholder) toplevel window
pub struct WinRecord {
    /// our arena identity
    pub w_id: WinId,
    /// the server handle
    pub w_xid: Xid,
    /// registry generation at creation, detects handle reuse
    pub w_xid_gen: u64,

    // -- stacking links --
    /// the window in front of this one
    pub w_prev: Option<WinId>,
    /// the window behind this one
    pub w_next: Option<WinId>,

    // -- raw attributes --
    pub w_state: WinState,
    pub w_class: WinClass,
    /// renderable records are managed; input-only and overlay
    /// windows stay as stacking placeholders
    pub w_managed: bool,
    /// geometry from the last configure, committed to `w_geom`
    /// during the primary drain
    pub w_pending_geom: WinGeometry,
    pub w_geom: WinGeometry,
    /// bounding shape in window-local coordinates, None when the
    /// window is an ordinary rectangle
    pub w_bounding_shape: Option<Region>,
    pub w_client: Option<Xid>,
    pub w_leader: Option<Xid>,
    pub w_type: WinType,
    pub w_name: String,
    pub w_class_instance: String,
    pub w_class_general: String,
    pub w_role: String,
    pub w_frame_extents: FrameExtents,
    /// raw _NET_WM_WINDOW_OPACITY, None when unset
    pub w_opacity_prop: Option<u32>,
    /// fullscreen bit out of _NET_WM_STATE
    pub w_fullscreen_hint: bool,
    /// the shadow-hint property: Some(false) forces shadows off
    pub w_shadow_hint: Option<bool>,
    /// the visual carries an alpha channel
    pub w_argb: bool,

    // -- derived attributes --
    pub w_paint_mode: PaintMode,
    pub w_shadow: bool,
    pub w_clip_shadow_above: bool,
    pub w_blur_background: bool,
    pub w_invert_color: bool,
    pub w_corner_radius: f64,
    pub w_fg_shader: Option<ShaderHandle>,
    pub w_frame_opacity: f64,
    pub w_opacity_target: f64,
    /// current animated opacity
    pub w_opacity: f64,
    pub w_is_fullscreen: bool,
    pub w_focused: bool,
    pub w_monitor: Option<usize>,
    pub w_paint_excluded: bool,
    pub w_unredir_excluded: bool,
    pub w_fade_excluded: bool,
    pub w_transparent_clipping: bool,

    // -- overrides --
    pub w_focused_force: Option<bool>,
    pub w_shadow_force: Option<bool>,
    pub w_fade_force: Option<bool>,
    pub w_invert_color_force: Option<bool>,

    // -- animation state --
    pub w_anim: Option<AnimInstance>,
    /// previous snapshot for transition detection
    pub w_prev_state: WinState,
    pub w_prev_opacity_target: f64,
    /// the record we cross-fade from; holds that record alive
    pub w_prev_trans: Option<WinId>,
    /// still inside the open half of the open/close pair; decides
    /// open vs show on map. Cleared when the first animation after
    /// the map completes.
    pub w_in_openclose: bool,
    pub w_ever_damaged: bool,
    pub w_painted_last_frame: bool,
    pub w_to_paint: bool,

    // -- GPU resources --
    pub w_pixmap: Option<Pixmap>,
    pub w_image: Option<BackendImage>,
    /// snapshot for cross-fade on resize/unmap
    pub w_saved_image: Option<BackendImage>,
    pub w_shadow_image: Option<BackendImage>,
    pub w_mask_image: Option<BackendImage>,

    // -- bookkeeping --
    pub w_flags: WinFlags,
    pub w_stale_props: PropertySet,
    /// which derived groups the next factor recompute must touch
    pub w_factor_mask: FactorMask,
    /// cached region obscured by windows above, None when invalid
    pub w_reg_ignore: Option<Region>,
    /// resolved animation outputs for the paint pass
    pub w_anim_outputs: AnimOutputs,
}

impl WinRecord {
    /// A fresh placeholder for a window we just learned about.
    ///
    /// Attributes are unknown until the async fetch replies; until
    /// then the record only participates in stacking.
    pub fn placeholder(id: WinId, xid: Xid, gen: u64) -> WinRecord {
        WinRecord {
            w_id: id,
            w_xid: xid,
            w_xid_gen: gen,
            w_prev: None,
            w_next: None,
            w_state: WinState::Unmapped,
            w_class: WinClass::InputOnly,
            w_managed: false,
            w_pending_geom: WinGeometry::default(),
            w_geom: WinGeometry::default(),
            w_bounding_shape: None,
            w_client: None,
            w_leader: None,
            w_type: WinType::Unknown,
            w_name: String::new(),
            w_class_instance: String::new(),
            w_class_general: String::new(),
            w_role: String::new(),
            w_frame_extents: FrameExtents::default(),
            w_opacity_prop: None,
            w_fullscreen_hint: false,
            w_shadow_hint: None,
            w_argb: false,
            w_paint_mode: PaintMode::Solid,
            w_shadow: false,
            w_clip_shadow_above: false,
            w_blur_background: false,
            w_invert_color: false,
            w_corner_radius: 0.0,
            w_fg_shader: None,
            w_frame_opacity: 1.0,
            w_opacity_target: 0.0,
            w_opacity: 0.0,
            w_is_fullscreen: false,
            w_focused: false,
            w_monitor: None,
            w_paint_excluded: false,
            w_unredir_excluded: false,
            w_fade_excluded: false,
            w_transparent_clipping: false,
            w_focused_force: None,
            w_shadow_force: None,
            w_fade_force: None,
            w_invert_color_force: None,
            w_anim: None,
            w_prev_state: WinState::Unmapped,
            w_prev_opacity_target: 0.0,
            w_prev_trans: None,
            w_in_openclose: true,
            w_ever_damaged: false,
            w_painted_last_frame: false,
            w_to_paint: false,
            w_pixmap: None,
            w_image: None,
            w_saved_image: None,
            w_shadow_image: None,
            w_mask_image: None,
            w_flags: WinFlags::PIXMAP_NONE,
            w_stale_props: PropertySet::new(),
            w_factor_mask: FactorMask::empty(),
            w_reg_ignore: None,
            w_anim_outputs: AnimOutputs::defaults(false, 0.0),
        }
    }

    /// Fill in the attribute reply, deciding whether this record is
    /// managed (renderable) or remains a stacking placeholder.
    pub fn promote(&mut self, attrs: &WinAttrs) {
        self.w_class = attrs.wa_class;
        self.w_managed =
            attrs.wa_class == WinClass::InputOutput && !attrs.wa_override_redirect;
        self.w_pending_geom = attrs.wa_geom;
        self.w_geom = attrs.wa_geom;
        self.w_argb = attrs.wa_argb;
    }

    /// The on-screen rectangle of the committed geometry
    pub fn rect(&self) -> Rect<i32> {
        self.w_geom.to_rect()
    }

    /// The on-screen extents including the shadow, used when
    /// damaging the area a window used to occupy
    pub fn extents_with_shadow(&self, radius: i32, offset: (i32, i32)) -> Rect<i32> {
        let r = self.rect();
        if !self.w_shadow {
            return r;
        }
        Rect::new(
            r.r_pos.0 + offset.0 - radius,
            r.r_pos.1 + offset.1 - radius,
            r.r_size.0 + 2 * radius + offset.0.abs(),
            r.r_size.1 + 2 * radius + offset.1.abs(),
        )
    }

    /// Is this record currently animating
    pub fn is_animating(&self) -> bool {
        self.w_anim.is_some()
    }

    /// Begin mapping. Runs during the primary drain when the
    /// `MAPPED` flag is set.
    pub fn map_start(&mut self) {
        self.w_state = WinState::Mapped;
        // contents become available once the server hands us a new
        // named pixmap; a previous bind failure gets retried
        self.w_flags |= WinFlags::PIXMAP_STALE | WinFlags::FACTOR_CHANGED;
        self.w_flags.remove(WinFlags::IMAGE_ERROR);
        self.w_factor_mask = FactorMask::all();
        self.w_reg_ignore = None;
    }

    /// Begin unmapping. Runs directly from event handling; the
    /// image is kept so the hide animation has contents to draw.
    pub fn unmap_start(&mut self) {
        self.w_state = WinState::Unmapped;
        // the drains skip unmapped windows, so the target the hide
        // animation heads for is set here
        self.w_opacity_target = 0.0;
        self.w_flags.remove(WinFlags::MAPPED);
        self.w_reg_ignore = None;
    }

    /// Queue a property refresh for the given atoms
    pub fn set_properties_stale(&mut self, atoms: &[crate::server::Atom]) {
        for a in atoms.iter() {
            self.w_stale_props.insert(*a);
        }
        self.w_flags |= WinFlags::PROPERTY_STALE;
    }
}

/// Read-only context handed to the drains
pub struct DrainCtx<'a> {
    pub dc_cfg: &'a crate::config::Config,
    pub dc_atoms: &'a Atoms,
    pub dc_monitors: &'a [Rect<i32>],
    pub dc_root_geom: Rect<i32>,
    /// the EWMH active window
    pub dc_active_win: Option<Xid>,
    /// leader of the active window, for group focus
    pub dc_active_leader: Option<Xid>,
    /// compiled foreground shader rules
    pub dc_shaders: &'a [(ShaderHandle, WinRule)],
}

/// What a primary drain pass produced
#[derive(Debug)]
pub struct DrainOutcome {
    /// damage to add to the ring
    pub dr_damage: Region,
    /// the record's focus changed; the caller propagates it to the
    /// rest of the leader group
    pub dr_focus_changed: bool,
}

impl DrainOutcome {
    fn new() -> DrainOutcome {
        DrainOutcome {
            dr_damage: Region::new(),
            dr_focus_changed: false,
        }
    }
}

/// Walk down the window tree looking for the client window, i.e.
/// the first descendant carrying WM_STATE.
fn find_client_win(server: &mut dyn DisplayServer, win: Xid) -> Option<Xid> {
    if server.has_wm_state(win) {
        return Some(win);
    }

    let children = match server.query_tree(win) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("query_tree failed on {}: {:?}", win, e);
            return None;
        }
    };
    for child in children.iter() {
        if let Some(found) = find_client_win(server, *child) {
            return Some(found);
        }
    }
    return None;
}

/// Pick the monitor with the largest overlap and decide whether the
/// window covers it entirely.
pub(crate) fn update_monitor(rec: &mut WinRecord, monitors: &[Rect<i32>]) {
    let r = rec.rect();
    let mut best: Option<(usize, i64)> = None;

    for (i, mon) in monitors.iter().enumerate() {
        let overlap = match r.intersection(mon) {
            Some(o) => o.r_size.0 as i64 * o.r_size.1 as i64,
            None => 0,
        };
        if overlap > 0 && best.map(|(_, a)| overlap > a).unwrap_or(true) {
            best = Some((i, overlap));
        }
    }
    rec.w_monitor = best.map(|(i, _)| i);

    let covers = rec
        .w_monitor
        .map(|i| {
            r.r_pos.0 <= monitors[i].r_pos.0
                && r.r_pos.1 <= monitors[i].r_pos.1
                && r.x2() >= monitors[i].x2()
                && r.y2() >= monitors[i].y2()
        })
        .unwrap_or(false);
    rec.w_is_fullscreen = rec.w_fullscreen_hint || covers;
}

/// The primary flag drain for one record
///
/// Runs once per frame in stacking order, before animations are
/// advanced. Structural changes (client, geometry, properties)
/// funnel into the factor recompute at the end.
pub fn drain_primary(
    rec: &mut WinRecord,
    server: &mut dyn DisplayServer,
    backend: &mut dyn Backend,
    ctx: &DrainCtx,
) -> DrainOutcome {
    let mut outcome = DrainOutcome::new();

    // 1. pending map
    if rec.w_flags.contains(WinFlags::MAPPED) {
        rec.map_start();
        rec.w_flags.remove(WinFlags::MAPPED);
    }

    // 2. nothing structural to do for off-screen windows
    if rec.w_state != WinState::Mapped {
        return outcome;
    }

    // 3. client re-detection
    if rec.w_flags.contains(WinFlags::CLIENT_STALE) {
        rec.w_client = find_client_win(server, rec.w_xid);
        log::debug!("window {} client is now {:?}", rec.w_xid, rec.w_client);

        props::refresh_client_props(rec, server, ctx.dc_atoms);
        rec.w_flags |= WinFlags::FACTOR_CHANGED;
        rec.w_factor_mask = FactorMask::all();
        rec.w_flags.remove(WinFlags::CLIENT_STALE);
    }

    // 4. geometry commit
    if rec
        .w_flags
        .intersects(WinFlags::SIZE_STALE | WinFlags::POSITION_STALE)
    {
        if rec.w_painted_last_frame {
            outcome.dr_damage.add_rect(rec.extents_with_shadow(
                ctx.dc_cfg.c_shadow_radius,
                ctx.dc_cfg.c_shadow_offset,
            ));
        }

        let size_changed = !rec.w_geom.size_eq(&rec.w_pending_geom);
        rec.w_geom = rec.w_pending_geom;

        if size_changed {
            // shadow and mask are rebuilt lazily at the new size
            if let Some(img) = rec.w_shadow_image.take() {
                backend.release_image(img);
            }
            if let Some(img) = rec.w_mask_image.take() {
                backend.release_image(img);
            }
            rec.w_flags |= WinFlags::PIXMAP_STALE | WinFlags::FACTOR_CHANGED;
            rec.w_flags.remove(WinFlags::IMAGE_ERROR);
            rec.w_factor_mask |= FactorMask::FULLSCREEN
                | FactorMask::SHADOW
                | FactorMask::EXCLUDES
                | FactorMask::PAINT_MODE;
        }
        update_monitor(rec, ctx.dc_monitors);

        outcome.dr_damage.add_rect(rec.extents_with_shadow(
            ctx.dc_cfg.c_shadow_radius,
            ctx.dc_cfg.c_shadow_offset,
        ));
        rec.w_reg_ignore = None;
        rec.w_flags
            .remove(WinFlags::SIZE_STALE | WinFlags::POSITION_STALE);
    }

    // 5. property refreshes
    if rec.w_flags.contains(WinFlags::PROPERTY_STALE) {
        let damaged = props::refresh_stale(rec, server, ctx.dc_atoms);
        if damaged {
            outcome.dr_damage.add_rect(rec.extents_with_shadow(
                ctx.dc_cfg.c_shadow_radius,
                ctx.dc_cfg.c_shadow_offset,
            ));
        }
        rec.w_stale_props.clear();
        rec.w_flags.remove(WinFlags::PROPERTY_STALE);
    }

    // 6. derived attribute recompute
    if rec.w_flags.contains(WinFlags::FACTOR_CHANGED) {
        outcome.dr_focus_changed = factor::recompute(rec, ctx);
        rec.w_reg_ignore = None;
        rec.w_factor_mask = FactorMask::empty();
        rec.w_flags.remove(WinFlags::FACTOR_CHANGED);
    }

    return outcome;
}

/// The image flag drain for one record
///
/// Runs after animations have advanced. Acquires a fresh named
/// pixmap and binds it into a backend image when contents are
/// stale.
pub fn drain_image(
    rec: &mut WinRecord,
    server: &mut dyn DisplayServer,
    backend: &mut dyn Backend,
) {
    if !rec.w_flags.contains(WinFlags::PIXMAP_STALE)
        || rec.w_state != WinState::Mapped
        || rec.w_flags.contains(WinFlags::IMAGE_ERROR)
    {
        return;
    }

    // release-then-reacquire: a stale binding without PIXMAP_NONE
    // means there is an old binding to drop first. The old contents
    // are snapshotted so a resize can cross-fade out of them.
    if let Some(img) = rec.w_image.take() {
        let full = Region::from_rect(Rect::new(
            0,
            0,
            rec.w_geom.g_width + rec.w_geom.g_border * 2,
            rec.w_geom.g_height + rec.w_geom.g_border * 2,
        ));
        match backend.clone_image(img, &full) {
            Ok(saved) => {
                if let Some(old_saved) = rec.w_saved_image.replace(saved) {
                    backend.release_image(old_saved);
                }
            }
            Err(e) => log::debug!("could not save old contents of {}: {:?}", rec.w_xid, e),
        }
        backend.release_image(img);
    }
    if let Some(pixmap) = rec.w_pixmap.take() {
        server.free_pixmap(pixmap);
    }
    rec.w_flags |= WinFlags::PIXMAP_NONE;

    let pixmap = match server.name_window_pixmap(rec.w_xid) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("could not name pixmap for {}: {:?}", rec.w_xid, e);
            rec.w_flags |= WinFlags::IMAGE_ERROR;
            return;
        }
    };

    match backend.bind_pixmap(pixmap) {
        Ok(image) => {
            rec.w_pixmap = Some(pixmap);
            rec.w_image = Some(image);
            rec.w_flags
                .remove(WinFlags::PIXMAP_STALE | WinFlags::PIXMAP_NONE);
        }
        Err(e) => {
            log::error!("binding pixmap for {} failed: {:?}", rec.w_xid, e);
            server.free_pixmap(pixmap);
            rec.w_flags |= WinFlags::IMAGE_ERROR;
        }
    }
}

/// Drop every GPU resource this record holds
///
/// Must happen before the record is freed, and also runs when the
/// screen is unredirected.
pub fn release_images(
    rec: &mut WinRecord,
    server: &mut dyn DisplayServer,
    backend: &mut dyn Backend,
) {
    for slot in [
        &mut rec.w_image,
        &mut rec.w_saved_image,
        &mut rec.w_shadow_image,
        &mut rec.w_mask_image,
    ]
    .iter_mut()
    {
        if let Some(img) = slot.take() {
            backend.release_image(img);
        }
    }
    if let Some(pixmap) = rec.w_pixmap.take() {
        server.free_pixmap(pixmap);
    }
    rec.w_flags |= WinFlags::PIXMAP_NONE | WinFlags::PIXMAP_STALE;
}
