// Display server abstraction
//
// The core never speaks the X wire protocol itself. Everything it
// needs from the server comes through the `DisplayServer` trait:
// tree queries, attribute and property fetches, named pixmaps,
// damage/shape subscription and vblank notifications. The concrete
// client (xcb or otherwise) lives with the embedder.
//
// Austin Shafer - 2024
use utils::region::{Rect, Region};
use utils::Result;

use std::os::unix::io::RawFd;

/// A server-assigned window handle
///
/// The server can and will reuse these after a window dies, which
/// is why every pending request also carries a registry generation
/// (see `PendingFetch`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Xid(pub u32);

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// An interned property name
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Atom(pub u32);

/// A server pixmap handle, produced by `name_window_pixmap`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Pixmap(pub u32);

/// Server-side window class
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WinClass {
    /// Receives input but has no contents, never painted
    InputOnly,
    /// A renderable window
    InputOutput,
}

/// Window geometry as reported by configure events
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WinGeometry {
    pub g_x: i32,
    pub g_y: i32,
    pub g_width: i32,
    pub g_height: i32,
    pub g_border: i32,
}

impl WinGeometry {
    pub fn new(x: i32, y: i32, width: i32, height: i32, border: i32) -> Self {
        Self {
            g_x: x,
            g_y: y,
            g_width: width,
            g_height: height,
            g_border: border,
        }
    }

    /// The full on-screen rectangle including the server border
    pub fn to_rect(&self) -> Rect<i32> {
        Rect::new(
            self.g_x,
            self.g_y,
            self.g_width + self.g_border * 2,
            self.g_height + self.g_border * 2,
        )
    }

    pub fn size_eq(&self, other: &WinGeometry) -> bool {
        self.g_width == other.g_width
            && self.g_height == other.g_height
            && self.g_border == other.g_border
    }
}

impl Default for WinGeometry {
    fn default() -> Self {
        WinGeometry::new(0, 0, 0, 0, 0)
    }
}

/// The map state the server reports in an attribute reply
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerMapState {
    Unmapped,
    Unviewable,
    Viewable,
}

/// The result of an asynchronous attribute fetch
#[derive(Debug, Copy, Clone)]
pub struct WinAttrs {
    pub wa_class: WinClass,
    pub wa_map_state: ServerMapState,
    pub wa_geom: WinGeometry,
    pub wa_override_redirect: bool,
    /// whether the visual has an alpha channel
    pub wa_argb: bool,
}

/// EWMH window types
///
/// Only the types the paint policy distinguishes are broken out,
/// everything else lands in `Unknown`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WinType {
    Unknown,
    Desktop,
    Dock,
    Toolbar,
    Menu,
    Utility,
    Splash,
    Dialog,
    Normal,
    DropdownMenu,
    PopupMenu,
    Tooltip,
    Notification,
    Combo,
    Dnd,
}

impl WinType {
    pub fn all() -> &'static [WinType] {
        &[
            WinType::Unknown,
            WinType::Desktop,
            WinType::Dock,
            WinType::Toolbar,
            WinType::Menu,
            WinType::Utility,
            WinType::Splash,
            WinType::Dialog,
            WinType::Normal,
            WinType::DropdownMenu,
            WinType::PopupMenu,
            WinType::Tooltip,
            WinType::Notification,
            WinType::Combo,
            WinType::Dnd,
        ]
    }
}

/// The atoms the core tracks for property-stale processing
///
/// These are interned once at startup through the server and then
/// compared by value when PropertyNotify events come in.
#[derive(Debug, Clone)]
pub struct Atoms {
    pub a_wm_name: Atom,
    pub a_net_wm_name: Atom,
    pub a_wm_class: Atom,
    pub a_wm_role: Atom,
    pub a_wm_state: Atom,
    pub a_wm_client_leader: Atom,
    pub a_wm_transient_for: Atom,
    pub a_net_wm_type: Atom,
    pub a_net_wm_opacity: Atom,
    pub a_net_wm_state: Atom,
    pub a_net_wm_state_fullscreen: Atom,
    pub a_net_frame_extents: Atom,
    pub a_net_active_window: Atom,
    pub a_shadow_hint: Atom,
    /// _NET_WM_WINDOW_TYPE_* values mapped to their enum
    pub a_wintypes: Vec<(Atom, WinType)>,
}

impl Atoms {
    pub fn intern(server: &mut dyn DisplayServer) -> Atoms {
        Atoms {
            a_wm_name: server.intern_atom("WM_NAME"),
            a_net_wm_name: server.intern_atom("_NET_WM_NAME"),
            a_wm_class: server.intern_atom("WM_CLASS"),
            a_wm_role: server.intern_atom("WM_WINDOW_ROLE"),
            a_wm_state: server.intern_atom("WM_STATE"),
            a_wm_client_leader: server.intern_atom("WM_CLIENT_LEADER"),
            a_wm_transient_for: server.intern_atom("WM_TRANSIENT_FOR"),
            a_net_wm_type: server.intern_atom("_NET_WM_WINDOW_TYPE"),
            a_net_wm_opacity: server.intern_atom("_NET_WM_WINDOW_OPACITY"),
            a_net_wm_state: server.intern_atom("_NET_WM_STATE"),
            a_net_wm_state_fullscreen: server.intern_atom("_NET_WM_STATE_FULLSCREEN"),
            a_net_frame_extents: server.intern_atom("_NET_FRAME_EXTENTS"),
            a_net_active_window: server.intern_atom("_NET_ACTIVE_WINDOW"),
            a_shadow_hint: server.intern_atom("_COMPTON_SHADOW"),
            a_wintypes: [
                ("_NET_WM_WINDOW_TYPE_DESKTOP", WinType::Desktop),
                ("_NET_WM_WINDOW_TYPE_DOCK", WinType::Dock),
                ("_NET_WM_WINDOW_TYPE_TOOLBAR", WinType::Toolbar),
                ("_NET_WM_WINDOW_TYPE_MENU", WinType::Menu),
                ("_NET_WM_WINDOW_TYPE_UTILITY", WinType::Utility),
                ("_NET_WM_WINDOW_TYPE_SPLASH", WinType::Splash),
                ("_NET_WM_WINDOW_TYPE_DIALOG", WinType::Dialog),
                ("_NET_WM_WINDOW_TYPE_NORMAL", WinType::Normal),
                ("_NET_WM_WINDOW_TYPE_DROPDOWN_MENU", WinType::DropdownMenu),
                ("_NET_WM_WINDOW_TYPE_POPUP_MENU", WinType::PopupMenu),
                ("_NET_WM_WINDOW_TYPE_TOOLTIP", WinType::Tooltip),
                ("_NET_WM_WINDOW_TYPE_NOTIFICATION", WinType::Notification),
                ("_NET_WM_WINDOW_TYPE_COMBO", WinType::Combo),
                ("_NET_WM_WINDOW_TYPE_DND", WinType::Dnd),
            ]
            .iter()
            .map(|(name, ty)| (server.intern_atom(name), *ty))
            .collect(),
        }
    }

    /// Map a type atom back to its enum value
    pub fn wintype_of(&self, atom: Atom) -> Option<WinType> {
        self.a_wintypes
            .iter()
            .find(|(a, _)| *a == atom)
            .map(|(_, ty)| *ty)
    }
}

/// One decoded server notification
///
/// The registry consumes these in the order the server produced
/// them. Decoding from the wire happens inside the `DisplayServer`
/// implementation.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new child of the root appeared
    Create { window: Xid },
    /// A root child was destroyed
    Destroy { window: Xid },
    Map { window: Xid },
    Unmap { window: Xid },
    /// A window was reparented; `parent` is the new parent
    Reparent { window: Xid, parent: Xid },
    /// Geometry and/or stacking change. `above` names the new
    /// sibling directly underneath, None means bottom.
    Configure {
        window: Xid,
        geom: WinGeometry,
        above: Option<Xid>,
    },
    /// Window circulated to the top or bottom of the stack
    Circulate { window: Xid, place_on_top: bool },
    Property { window: Xid, atom: Atom },
    /// The bounding shape of the window changed
    Shape { window: Xid },
    /// Contents of the window changed
    Damaged { window: Xid, region: Region },
    /// Contents of the root (background) changed
    RootDamaged,
    /// Reply to `request_win_attributes`. None signals an error or
    /// an unviewable target, and drops the placeholder.
    AttrsReply {
        window: Xid,
        attrs: Option<WinAttrs>,
    },
    /// A vblank / present-complete notification. `msc` is the media
    /// stream counter, `ust` the timestamp in microseconds.
    Vblank { msc: u64, ust: u64 },
}

/// A handle on a running display server connection.
///
/// This is an abstraction layer for communication with the
/// underlying display system (assumed to be X) using whatever
/// mechanism the implementer wishes. X idioms (xids, atoms, named
/// pixmaps) are assumed. Tests drive the core through a scripted
/// implementation of this.
pub trait DisplayServer {
    /// The root window of the managed screen
    fn root(&self) -> Xid;
    /// Size of the root window
    fn root_geometry(&self) -> Rect<i32>;
    /// The monitor layout, used for fullscreen detection
    fn monitors(&self) -> Vec<Rect<i32>>;

    /// The connection fd, watched by the event loop
    fn connection_fd(&self) -> RawFd;
    /// Pull one decoded event off the queue, if any.
    ///
    /// This must also surface events the implementation has already
    /// read into userspace buffers, so the loop can fully drain
    /// before sleeping in poll.
    fn poll_event(&mut self) -> Option<ServerEvent>;
    /// Flush buffered requests out to the server
    fn flush(&mut self);

    /// Children of `win`, bottom-to-top stacking order
    fn query_tree(&mut self, win: Xid) -> Result<Vec<Xid>>;
    /// Issue an asynchronous attribute fetch. The reply arrives
    /// later as `ServerEvent::AttrsReply`.
    fn request_win_attributes(&mut self, win: Xid);

    fn intern_atom(&mut self, name: &str) -> Atom;
    fn get_prop_cardinal(&mut self, win: Xid, prop: Atom) -> Result<Option<u32>>;
    fn get_prop_atom(&mut self, win: Xid, prop: Atom) -> Result<Option<Atom>>;
    fn get_prop_window(&mut self, win: Xid, prop: Atom) -> Result<Option<Xid>>;
    fn get_prop_strings(&mut self, win: Xid, prop: Atom) -> Result<Vec<String>>;
    /// All atoms present in a multi-valued atom property, used for
    /// _NET_WM_STATE scanning
    fn get_prop_atom_list(&mut self, win: Xid, prop: Atom) -> Result<Vec<Atom>>;
    /// All values of a multi-valued cardinal property, used for
    /// _NET_FRAME_EXTENTS
    fn get_prop_cardinal_list(&mut self, win: Xid, prop: Atom) -> Result<Vec<u32>>;

    /// Does this window carry WM_STATE, i.e. is it a client window
    fn has_wm_state(&mut self, win: Xid) -> bool;
    /// The EWMH active window as published on the root
    fn active_window(&mut self) -> Option<Xid>;

    /// Acquire a named pixmap for the current window contents
    fn name_window_pixmap(&mut self, win: Xid) -> Result<Pixmap>;
    fn free_pixmap(&mut self, pixmap: Pixmap);
    /// The bounding shape of the window as a region in window space
    fn bounding_region(&mut self, win: Xid) -> Result<Region>;
    /// Subscribe to content damage for this window
    fn subscribe_damage(&mut self, win: Xid) -> Result<()>;
    /// Subscribe to shape change events for this window
    fn subscribe_shape(&mut self, win: Xid);

    /// Claim the compositor selection for this screen, announcing
    /// ourselves and fencing off other compositing managers
    fn acquire_compositor_selection(&mut self) -> Result<()>;
    /// Begin compositing: redirect all subwindows of the root
    fn redirect_subwindows(&mut self) -> Result<()>;
    /// Stop compositing, handing presentation back to the server
    fn unredirect_subwindows(&mut self);

    /// Ask for one vblank notification, delivered as
    /// `ServerEvent::Vblank`
    fn request_vblank_event(&mut self);
}

/// What a pending asynchronous request is for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FetchKind {
    /// Initial attribute query for a freshly seen toplevel
    NewWindowAttrs,
}

/// Identity-carrying record of one in-flight async request
///
/// The reply handler compares the stored generation against the
/// registry's current generation for the xid before mutating any
/// state. A mismatch means the handle was destroyed and reused while
/// the request was in flight, and the reply is dropped.
#[derive(Debug, Copy, Clone)]
pub struct PendingFetch {
    pub pf_target: Xid,
    pub pf_gen: u64,
    pub pf_kind: FetchKind,
}
