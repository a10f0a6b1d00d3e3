/// Squall tests
///
/// The scenarios drive the whole core through a scripted display
/// server and a recording backend, with a manually advanced clock.
///
/// Austin Shafer - 2024
use crate as sq;

use sq::anim::script::KeyframeScript;
use sq::anim::{AnimEndKind, AnimTrigger};
use sq::backend::{
    Backend, BackendImage, DeviceStatus, Frame, ImageProperty, ShaderHandle,
};
use sq::config::Config;
use sq::server::{
    Atom, DisplayServer, Pixmap, ServerEvent, ServerMapState, WinAttrs, WinClass,
    WinGeometry, Xid,
};
use sq::window::WinState;

use utils::anyhow;
use utils::region::{Rect, Region};
use utils::timing::Clock;
use utils::Result;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;

// ------------------------------
// Manually advanced clock
// ------------------------------

#[derive(Clone)]
struct ManualClock {
    mc_now: Rc<Cell<u64>>,
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.mc_now.get()
    }
}

// ------------------------------
// Scripted display server
// ------------------------------

struct MockWin {
    mw_attrs: WinAttrs,
    mw_has_wm_state: bool,
    mw_children: Vec<Xid>,
    mw_cardinals: HashMap<Atom, Vec<u32>>,
    mw_atom_props: HashMap<Atom, Vec<Atom>>,
    mw_strings: HashMap<Atom, Vec<String>>,
    mw_window_props: HashMap<Atom, Xid>,
    mw_shape: Option<Region>,
}

impl MockWin {
    fn new(geom: WinGeometry) -> MockWin {
        MockWin {
            mw_attrs: WinAttrs {
                wa_class: WinClass::InputOutput,
                wa_map_state: ServerMapState::Unmapped,
                wa_geom: geom,
                wa_override_redirect: false,
                wa_argb: false,
            },
            mw_has_wm_state: true,
            mw_children: Vec::new(),
            mw_cardinals: HashMap::new(),
            mw_atom_props: HashMap::new(),
            mw_strings: HashMap::new(),
            mw_window_props: HashMap::new(),
            mw_shape: None,
        }
    }
}

struct ServerState {
    st_root: Xid,
    st_geom: Rect<i32>,
    st_monitors: Vec<Rect<i32>>,
    st_events: VecDeque<ServerEvent>,
    st_wins: HashMap<Xid, MockWin>,
    st_atoms: HashMap<String, Atom>,
    st_next_atom: u32,
    st_active: Option<Xid>,
    st_vblank_requests: u32,
    st_redirected: bool,
    st_freed_pixmaps: Vec<Pixmap>,
}

impl ServerState {
    fn new() -> ServerState {
        ServerState {
            st_root: Xid(1),
            st_geom: Rect::new(0, 0, 1920, 1080),
            st_monitors: vec![Rect::new(0, 0, 1920, 1080)],
            st_events: VecDeque::new(),
            st_wins: HashMap::new(),
            st_atoms: HashMap::new(),
            st_next_atom: 100,
            st_active: None,
            st_vblank_requests: 0,
            st_redirected: false,
            st_freed_pixmaps: Vec::new(),
        }
    }

    fn atom(&self, name: &str) -> Atom {
        *self
            .st_atoms
            .get(name)
            .expect("atom was never interned by the core")
    }
}

#[derive(Clone)]
struct MockServer {
    srv: Rc<RefCell<ServerState>>,
}

impl DisplayServer for MockServer {
    fn root(&self) -> Xid {
        self.srv.borrow().st_root
    }

    fn root_geometry(&self) -> Rect<i32> {
        self.srv.borrow().st_geom
    }

    fn monitors(&self) -> Vec<Rect<i32>> {
        self.srv.borrow().st_monitors.clone()
    }

    fn connection_fd(&self) -> RawFd {
        // negative fds are ignored by poll, the tests never sleep
        -1
    }

    fn poll_event(&mut self) -> Option<ServerEvent> {
        self.srv.borrow_mut().st_events.pop_front()
    }

    fn flush(&mut self) {}

    fn query_tree(&mut self, win: Xid) -> Result<Vec<Xid>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .map(|w| w.mw_children.clone())
            .unwrap_or_default())
    }

    fn request_win_attributes(&mut self, win: Xid) {
        let mut srv = self.srv.borrow_mut();
        let attrs = srv.st_wins.get(&win).map(|w| w.mw_attrs);
        srv.st_events
            .push_back(ServerEvent::AttrsReply { window: win, attrs });
    }

    fn intern_atom(&mut self, name: &str) -> Atom {
        let mut srv = self.srv.borrow_mut();
        if let Some(a) = srv.st_atoms.get(name) {
            return *a;
        }
        srv.st_next_atom += 1;
        let atom = Atom(srv.st_next_atom);
        srv.st_atoms.insert(name.to_string(), atom);
        return atom;
    }

    fn get_prop_cardinal(&mut self, win: Xid, prop: Atom) -> Result<Option<u32>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_cardinals.get(&prop))
            .and_then(|v| v.first().copied()))
    }

    fn get_prop_atom(&mut self, win: Xid, prop: Atom) -> Result<Option<Atom>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_atom_props.get(&prop))
            .and_then(|v| v.first().copied()))
    }

    fn get_prop_window(&mut self, win: Xid, prop: Atom) -> Result<Option<Xid>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_window_props.get(&prop).copied()))
    }

    fn get_prop_strings(&mut self, win: Xid, prop: Atom) -> Result<Vec<String>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_strings.get(&prop).cloned())
            .unwrap_or_default())
    }

    fn get_prop_atom_list(&mut self, win: Xid, prop: Atom) -> Result<Vec<Atom>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_atom_props.get(&prop).cloned())
            .unwrap_or_default())
    }

    fn get_prop_cardinal_list(&mut self, win: Xid, prop: Atom) -> Result<Vec<u32>> {
        Ok(self
            .srv
            .borrow()
            .st_wins
            .get(&win)
            .and_then(|w| w.mw_cardinals.get(&prop).cloned())
            .unwrap_or_default())
    }

    fn has_wm_state(&mut self, win: Xid) -> bool {
        self.srv
            .borrow()
            .st_wins
            .get(&win)
            .map(|w| w.mw_has_wm_state)
            .unwrap_or(false)
    }

    fn active_window(&mut self) -> Option<Xid> {
        self.srv.borrow().st_active
    }

    fn name_window_pixmap(&mut self, win: Xid) -> Result<Pixmap> {
        match self.srv.borrow().st_wins.contains_key(&win) {
            true => Ok(Pixmap(win.0)),
            false => Err(anyhow!("no such window")),
        }
    }

    fn free_pixmap(&mut self, pixmap: Pixmap) {
        self.srv.borrow_mut().st_freed_pixmaps.push(pixmap);
    }

    fn bounding_region(&mut self, win: Xid) -> Result<Region> {
        let srv = self.srv.borrow();
        let mock = srv.st_wins.get(&win).ok_or(anyhow!("no such window"))?;
        Ok(mock.mw_shape.clone().unwrap_or_else(|| {
            Region::from_rect(Rect::new(
                0,
                0,
                mock.mw_attrs.wa_geom.g_width,
                mock.mw_attrs.wa_geom.g_height,
            ))
        }))
    }

    fn subscribe_damage(&mut self, _win: Xid) -> Result<()> {
        Ok(())
    }

    fn subscribe_shape(&mut self, _win: Xid) {}

    fn acquire_compositor_selection(&mut self) -> Result<()> {
        Ok(())
    }

    fn redirect_subwindows(&mut self) -> Result<()> {
        self.srv.borrow_mut().st_redirected = true;
        Ok(())
    }

    fn unredirect_subwindows(&mut self) {
        self.srv.borrow_mut().st_redirected = false;
    }

    fn request_vblank_event(&mut self) {
        self.srv.borrow_mut().st_vblank_requests += 1;
    }
}

// ------------------------------
// Recording backend
// ------------------------------

struct BackendState {
    bk_next_aux: u64,
    bk_bound: Vec<BackendImage>,
    bk_released: Vec<BackendImage>,
    bk_frames: Vec<Frame>,
    bk_last_render: Option<u64>,
    bk_fail_bind: bool,
    bk_status: DeviceStatus,
}

impl BackendState {
    fn new() -> BackendState {
        BackendState {
            bk_next_aux: 10_000,
            bk_bound: Vec::new(),
            bk_released: Vec::new(),
            bk_frames: Vec::new(),
            bk_last_render: None,
            bk_fail_bind: false,
            bk_status: DeviceStatus::Ok,
        }
    }
}

#[derive(Clone)]
struct MockBackend {
    bk: Rc<RefCell<BackendState>>,
}

impl MockBackend {
    fn aux_image(&self) -> BackendImage {
        let mut bk = self.bk.borrow_mut();
        bk.bk_next_aux += 1;
        BackendImage(bk.bk_next_aux)
    }
}

impl Backend for MockBackend {
    fn bind_pixmap(&mut self, pixmap: Pixmap) -> Result<BackendImage> {
        let mut bk = self.bk.borrow_mut();
        if bk.bk_fail_bind {
            return Err(anyhow!("bind refused"));
        }
        // window images mirror the pixmap id so draw commands can
        // be traced back to windows in assertions
        let image = BackendImage(pixmap.0 as u64);
        bk.bk_bound.push(image);
        Ok(image)
    }

    fn release_image(&mut self, image: BackendImage) {
        self.bk.borrow_mut().bk_released.push(image);
    }

    fn clone_image(&mut self, _image: BackendImage, _region: &Region) -> Result<BackendImage> {
        Ok(self.aux_image())
    }

    fn make_mask(&mut self, _size: (u32, u32), _region: &Region) -> Result<BackendImage> {
        Ok(self.aux_image())
    }

    fn render_shadow(
        &mut self,
        _size: (u32, u32),
        _radius: i32,
        _color: (f64, f64, f64, f64),
    ) -> Result<BackendImage> {
        Ok(self.aux_image())
    }

    fn create_shader(&mut self, _source: &str) -> Result<ShaderHandle> {
        Ok(ShaderHandle(1))
    }

    fn set_image_property(&mut self, _image: BackendImage, _prop: ImageProperty) -> Result<()> {
        Ok(())
    }

    fn last_render_time(&mut self) -> Option<u64> {
        self.bk.borrow().bk_last_render
    }

    fn max_buffer_age(&self) -> usize {
        1
    }

    fn root_change(&mut self) {}

    fn device_status(&mut self) -> DeviceStatus {
        self.bk.borrow().bk_status
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.bk.borrow_mut().bk_frames.push(frame.clone());
        Ok(())
    }
}

// ------------------------------
// Test rig
// ------------------------------

struct Rig {
    r_comp: sq::Compositor,
    r_srv: Rc<RefCell<ServerState>>,
    r_bk: Rc<RefCell<BackendState>>,
    r_clock: Rc<Cell<u64>>,
}

impl Rig {
    fn new(mut cfg: Config) -> Rig {
        // the scenarios step time by hand, vblank pacing is
        // exercised by the scheduler unit tests
        cfg.c_frame_pacing = false;

        let srv = Rc::new(RefCell::new(ServerState::new()));
        let bk = Rc::new(RefCell::new(BackendState::new()));
        let clock = Rc::new(Cell::new(1_000_000u64));

        let comp = sq::Compositor::new(
            Box::new(MockServer { srv: srv.clone() }),
            Box::new(MockBackend { bk: bk.clone() }),
            Box::new(ManualClock {
                mc_now: clock.clone(),
            }),
            cfg,
        )
        .expect("compositor init failed");

        Rig {
            r_comp: comp,
            r_srv: srv,
            r_bk: bk,
            r_clock: clock,
        }
    }

    fn pump(&mut self) {
        self.r_comp
            .dispatch(Some(0))
            .expect("dispatch failed");
    }

    fn advance(&mut self, usec: u64) {
        self.r_clock.set(self.r_clock.get() + usec);
        self.pump();
    }

    fn push(&self, ev: ServerEvent) {
        self.r_srv.borrow_mut().st_events.push_back(ev);
    }

    fn atom(&self, name: &str) -> Atom {
        self.r_srv.borrow().atom(name)
    }

    /// Create a window on the server side and announce it
    fn add_window(&mut self, xid: u32, geom: WinGeometry) {
        self.r_srv
            .borrow_mut()
            .st_wins
            .insert(Xid(xid), MockWin::new(geom));
        self.push(ServerEvent::Create { window: Xid(xid) });
        self.pump();
    }

    fn set_cardinal(&self, xid: u32, atom: &str, vals: Vec<u32>) {
        let a = self.atom(atom);
        let mut srv = self.r_srv.borrow_mut();
        srv.st_wins
            .get_mut(&Xid(xid))
            .unwrap()
            .mw_cardinals
            .insert(a, vals);
    }

    fn set_strings(&self, xid: u32, atom: &str, vals: Vec<&str>) {
        let a = self.atom(atom);
        let mut srv = self.r_srv.borrow_mut();
        srv.st_wins.get_mut(&Xid(xid)).unwrap().mw_strings.insert(
            a,
            vals.into_iter().map(|s| s.to_string()).collect(),
        );
    }

    fn set_atom_prop(&self, xid: u32, atom: &str, vals: Vec<Atom>) {
        let a = self.atom(atom);
        let mut srv = self.r_srv.borrow_mut();
        srv.st_wins
            .get_mut(&Xid(xid))
            .unwrap()
            .mw_atom_props
            .insert(a, vals);
    }

    fn map(&mut self, xid: u32) {
        self.r_srv
            .borrow_mut()
            .st_wins
            .get_mut(&Xid(xid))
            .unwrap()
            .mw_attrs
            .wa_map_state = ServerMapState::Viewable;
        self.push(ServerEvent::Map { window: Xid(xid) });
        self.pump();
    }

    fn unmap(&mut self, xid: u32) {
        self.r_srv
            .borrow_mut()
            .st_wins
            .get_mut(&Xid(xid))
            .unwrap()
            .mw_attrs
            .wa_map_state = ServerMapState::Unmapped;
        self.push(ServerEvent::Unmap { window: Xid(xid) });
        self.pump();
    }

    fn damage(&mut self, xid: u32) {
        self.push(ServerEvent::Damaged {
            window: Xid(xid),
            region: Region::from_rect(Rect::new(0, 0, 1, 1)),
        });
        self.pump();
    }

    fn destroy(&mut self, xid: u32) {
        self.r_srv.borrow_mut().st_wins.remove(&Xid(xid));
        self.push(ServerEvent::Destroy { window: Xid(xid) });
        self.pump();
    }

    fn frames(&self) -> usize {
        self.r_bk.borrow().bk_frames.len()
    }

    fn last_frame(&self) -> Option<Frame> {
        self.r_bk.borrow().bk_frames.last().cloned()
    }

    /// dc_opacity of the only draw command in the latest frame
    fn last_opacity(&self) -> f64 {
        let frame = self.last_frame().expect("no frames presented");
        assert_eq!(frame.f_cmds.len(), 1);
        return frame.f_cmds[0].dc_opacity;
    }

    fn win_state(&self, xid: u32) -> Option<WinState> {
        self.r_comp
            .registry()
            .win_by_xid(Xid(xid))
            .map(|rec| rec.w_state)
    }
}

fn geom(x: i32, y: i32, w: i32, h: i32) -> WinGeometry {
    WinGeometry::new(x, y, w, h, 0)
}

fn opacity_cardinal(op: f64) -> u32 {
    (op * u32::MAX as f64) as u32
}

fn script(text: &str) -> Rc<KeyframeScript> {
    Rc::new(KeyframeScript::parse(text).expect("bad test script"))
}

// ------------------------------
// Scenarios
// ------------------------------

#[test]
fn fade_in_on_map() {
    let mut cfg = Config::new();
    cfg.set_animation(AnimTrigger::Open, script("opacity 0 target 200 linear"));
    let mut rig = Rig::new(cfg);

    rig.add_window(10, geom(100, 100, 400, 300));
    rig.set_cardinal(10, "_NET_WM_WINDOW_OPACITY", vec![opacity_cardinal(0.8)]);

    // t = 0: mapping starts the open animation at opacity 0
    rig.map(10);
    let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
    assert_eq!(rec.w_state, WinState::Mapped);
    assert!(rec.is_animating());

    // t = 100ms: half way up the ramp, and visible
    rig.advance(100_000);
    assert!(rig.r_bk.borrow().bk_bound.contains(&BackendImage(10)));
    assert!((rig.last_opacity() - 0.4).abs() < 0.01);
    assert!(rig
        .r_comp
        .registry()
        .win_by_xid(Xid(10))
        .unwrap()
        .w_to_paint);

    // t = 210ms: finished, exactly one completion callback
    rig.advance(110_000);
    let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
    assert!((rec.w_opacity - 0.8).abs() < 0.01);
    assert!(!rec.is_animating());

    let events = rig.r_comp.drain_animation_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ae_kind, AnimEndKind::Completed);
    assert_eq!(events[0].ae_trigger, AnimTrigger::Open);

    // nothing fires twice
    rig.advance(50_000);
    assert!(rig.r_comp.drain_animation_events().is_empty());
}

#[test]
fn interrupted_hide_resumes_smoothly() {
    let mut cfg = Config::new();
    cfg.set_animation(AnimTrigger::Hide, script("opacity current target 300 linear"));
    cfg.set_animation(AnimTrigger::Show, script("opacity current target 200 linear"));
    let mut rig = Rig::new(cfg);

    rig.add_window(10, geom(0, 0, 400, 300));
    rig.set_cardinal(10, "_NET_WM_WINDOW_OPACITY", vec![opacity_cardinal(0.8)]);

    // no open animation configured, the map lands at 0.8 directly
    rig.map(10);
    rig.damage(10);
    assert!((rig.last_opacity() - 0.8).abs() < 0.01);
    assert!(rig.r_comp.drain_animation_events().is_empty());

    // hide fades 0.8 -> 0 over 300ms
    rig.unmap(10);
    rig.advance(100_000);
    let mid = rig.last_opacity();
    assert!((mid - 0.5333).abs() < 0.01, "opacity {}", mid);

    // re-map mid-hide: the show resumes from the current value
    rig.map(10);
    let resumed = rig
        .r_comp
        .registry()
        .win_by_xid(Xid(10))
        .unwrap()
        .w_opacity;
    assert!(
        (resumed - mid).abs() < 1.0 / 255.0,
        "discontinuity {} -> {}",
        mid,
        resumed
    );

    let events = rig.r_comp.drain_animation_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ae_kind, AnimEndKind::Interrupted);
    assert_eq!(events[0].ae_trigger, AnimTrigger::Hide);

    // the replacement runs to the restored target
    rig.advance(250_000);
    let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
    assert!((rec.w_opacity - 0.8).abs() < 0.01);
    let events = rig.r_comp.drain_animation_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ae_kind, AnimEndKind::Completed);
}

#[test]
fn destroyed_waits_for_animation_and_references() {
    let mut cfg = Config::new();
    cfg.set_animation(AnimTrigger::Close, script("opacity current 0 300 linear"));
    let mut rig = Rig::new(cfg);

    rig.add_window(10, geom(0, 0, 100, 100));
    rig.add_window(20, geom(200, 0, 100, 100));
    rig.map(10);
    rig.map(20);
    rig.damage(10);
    rig.damage(20);

    // w20 renders a cross-fade out of w10's old contents
    rig.r_comp.window_set_prev_trans(Xid(20), Some(Xid(10)));

    rig.destroy(10);
    assert_eq!(rig.win_state(10), Some(WinState::Destroyed));
    assert_eq!(rig.r_comp.registry().len(), 2);

    rig.destroy(20);
    // both are destroyed, both animating their close
    assert_eq!(rig.r_comp.registry().len(), 2);

    // half way in, still alive
    rig.advance(150_000);
    assert_eq!(rig.r_comp.registry().len(), 2);

    // past the animations: the reference chain collapses in one
    // reap and both records are freed
    rig.advance(200_000);
    rig.advance(16_000);
    assert_eq!(rig.r_comp.registry().len(), 0);

    let events = rig.r_comp.drain_animation_events();
    let completed = events
        .iter()
        .filter(|e| e.ae_kind == AnimEndKind::Completed)
        .count();
    assert_eq!(completed, 2);
}

#[test]
fn property_drain_updates_derived_state() {
    let mut rig = Rig::new(Config::new());

    rig.add_window(10, geom(0, 0, 400, 300));
    rig.set_strings(10, "_NET_WM_NAME", vec!["before"]);
    rig.set_cardinal(10, "_NET_WM_WINDOW_OPACITY", vec![opacity_cardinal(0.5)]);
    rig.map(10);
    rig.damage(10);

    {
        let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
        assert_eq!(rec.w_name, "before");
        assert!((rec.w_opacity_target - 0.5).abs() < 0.01);
    }

    // three properties change server-side, three notifies arrive
    rig.set_strings(10, "_NET_WM_NAME", vec!["after"]);
    rig.set_cardinal(10, "_NET_WM_WINDOW_OPACITY", vec![opacity_cardinal(0.25)]);
    let dialog = rig.atom("_NET_WM_WINDOW_TYPE_DIALOG");
    rig.set_atom_prop(10, "_NET_WM_WINDOW_TYPE", vec![dialog]);

    for name in ["_NET_WM_NAME", "_NET_WM_WINDOW_OPACITY", "_NET_WM_WINDOW_TYPE"].iter() {
        let atom = rig.atom(name);
        rig.push(ServerEvent::Property {
            window: Xid(10),
            atom,
        });
    }
    rig.advance(16_000);

    let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
    assert_eq!(rec.w_name, "after");
    assert_eq!(rec.w_type, sq::server::WinType::Dialog);
    assert!((rec.w_opacity_target - 0.25).abs() < 0.01);

    // the whole stale set and both flags drained in one frame
    assert!(rec.w_stale_props.is_empty());
    assert!(!rec
        .w_flags
        .intersects(sq::window::WinFlags::PROPERTY_STALE | sq::window::WinFlags::FACTOR_CHANGED));
}

#[test]
fn restack_changes_render_order() {
    let mut rig = Rig::new(Config::new());

    // non-overlapping so occlusion culling stays out of the way
    for (xid, x) in [(10u32, 0), (20u32, 500), (30u32, 1000)].iter() {
        rig.add_window(*xid, geom(*x, 0, 200, 200));
        rig.map(*xid);
        rig.damage(*xid);
    }

    rig.advance(16_000);
    let order: Vec<u64> = rig
        .last_frame()
        .unwrap()
        .f_cmds
        .iter()
        .map(|c| c.dc_image.0)
        .collect();
    // windows stack in map order, newest on top; painted
    // back-to-front
    assert_eq!(order, vec![10, 20, 30]);

    // lift 10 above 30
    rig.r_comp.restack_above(Xid(10), Xid(30));
    rig.advance(16_000);
    let order: Vec<u64> = rig
        .last_frame()
        .unwrap()
        .f_cmds
        .iter()
        .map(|c| c.dc_image.0)
        .collect();
    assert_eq!(order, vec![20, 30, 10]);
}

#[test]
fn bind_failure_excludes_until_rebind() {
    let mut rig = Rig::new(Config::new());
    rig.add_window(10, geom(0, 0, 100, 100));

    rig.r_bk.borrow_mut().bk_fail_bind = true;
    rig.map(10);
    rig.damage(10);

    {
        let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
        assert!(rec.w_flags.contains(sq::window::WinFlags::IMAGE_ERROR));
        assert!(!rec.w_to_paint);
    }

    // binding works again; the next map retries and paints
    rig.r_bk.borrow_mut().bk_fail_bind = false;
    rig.unmap(10);
    rig.map(10);
    rig.advance(16_000);

    let rec = rig.r_comp.registry().win_by_xid(Xid(10)).unwrap();
    assert!(!rec.w_flags.contains(sq::window::WinFlags::IMAGE_ERROR));
    assert!(rec.w_to_paint);
}

#[test]
fn fullscreen_solid_window_unredirects() {
    let mut cfg = Config::new();
    cfg.c_unredir_if_possible = true;
    let mut rig = Rig::new(cfg);

    assert!(rig.r_comp.is_redirected());

    rig.add_window(10, geom(0, 0, 1920, 1080));
    rig.map(10);
    rig.damage(10);
    rig.advance(16_000);

    // a solid opaque window covering the monitor hands the screen
    // back to the server and drops our GPU resources
    assert!(!rig.r_comp.is_redirected());
    assert!(!rig.r_srv.borrow().st_redirected);
    assert!(rig
        .r_bk
        .borrow()
        .bk_released
        .contains(&BackendImage(10)));
    assert!(rig.r_srv.borrow().st_freed_pixmaps.contains(&Pixmap(10)));

    // once it goes away we take the screen over again
    rig.destroy(10);
    rig.advance(16_000);
    assert!(rig.r_comp.is_redirected());
    assert!(rig.r_srv.borrow().st_redirected);
}

#[test]
fn attr_reply_after_destroy_is_dropped() {
    let mut rig = Rig::new(Config::new());

    // create and destroy race: the destroy lands before the
    // attribute reply is handled, so the placeholder just drains
    // away without ever becoming managed
    rig.r_srv
        .borrow_mut()
        .st_wins
        .insert(Xid(10), MockWin::new(geom(0, 0, 50, 50)));
    rig.push(ServerEvent::Create { window: Xid(10) });
    rig.push(ServerEvent::Destroy { window: Xid(10) });
    rig.pump();
    rig.advance(16_000);

    assert_eq!(rig.r_comp.registry().len(), 0);
    assert!(rig.r_comp.registry().win_by_xid(Xid(10)).is_none());
}

#[test]
fn device_reset_requests_session_rebuild() {
    let mut rig = Rig::new(Config::new());
    rig.add_window(10, geom(0, 0, 100, 100));
    rig.map(10);

    rig.r_bk.borrow_mut().bk_status = DeviceStatus::ResetRequired;
    rig.push(ServerEvent::RootDamaged);

    let result = rig.r_comp.dispatch(Some(0)).unwrap();
    assert_eq!(result, sq::DispatchResult::Reset);
}

#[test]
fn quit_breaks_immediately() {
    let mut rig = Rig::new(Config::new());
    rig.r_comp.request_quit();
    assert_eq!(
        rig.r_comp.dispatch(Some(0)).unwrap(),
        sq::DispatchResult::Quit
    );
}

#[test]
fn shadow_policy_follows_hint_and_force() {
    let mut cfg = Config::new();
    cfg.c_shadow = true;
    let mut rig = Rig::new(cfg);

    rig.add_window(10, geom(0, 0, 100, 100));
    rig.map(10);
    rig.damage(10);
    assert!(rig.r_comp.registry().win_by_xid(Xid(10)).unwrap().w_shadow);

    // the client hint turns the shadow off
    rig.set_cardinal(10, "_COMPTON_SHADOW", vec![0]);
    let atom = rig.atom("_COMPTON_SHADOW");
    rig.push(ServerEvent::Property {
        window: Xid(10),
        atom,
    });
    rig.advance(16_000);
    assert!(!rig.r_comp.registry().win_by_xid(Xid(10)).unwrap().w_shadow);

    // the force override beats the hint
    rig.r_comp.window_set_shadow_force(Xid(10), Some(true));
    rig.advance(16_000);
    assert!(rig.r_comp.registry().win_by_xid(Xid(10)).unwrap().w_shadow);
}
