// Property refresh and the input-to-derived dependency table
//
// PropertyNotify events only record the changed atom in a sparse
// per-window bitset. During the primary drain each stale atom is
// re-read through the server and, when the cached value actually
// changed, the dependency table below says which derived attribute
// groups have to be recomputed.
//
// Austin Shafer - 2024
use crate::server::{Atom, Atoms, DisplayServer, WinType, Xid};
use crate::window::{WinFlags, WinRecord};

use utils::log;

use std::collections::HashMap;

bitflags::bitflags! {
    /// Derived attribute groups
    ///
    /// `FACTOR_CHANGED` on a record carries one of these masks; the
    /// recompute step only touches the groups named in it.
    pub struct FactorMask: u32 {
        const FOCUS      = 1 << 0;
        const OPACITY    = 1 << 1;
        const SHADOW     = 1 << 2;
        const BLUR       = 1 << 3;
        const CORNERS    = 1 << 4;
        const INVERT     = 1 << 5;
        const SHADER     = 1 << 6;
        const PAINT_MODE = 1 << 7;
        const FULLSCREEN = 1 << 8;
        const EXCLUDES   = 1 << 9;
    }
}

/// The groups that depend on the window rule inputs (name, class,
/// role, type)
const RULE_DEPENDENTS: FactorMask = FactorMask::from_bits_truncate(
    FactorMask::FOCUS.bits()
        | FactorMask::OPACITY.bits()
        | FactorMask::SHADOW.bits()
        | FactorMask::BLUR.bits()
        | FactorMask::CORNERS.bits()
        | FactorMask::INVERT.bits()
        | FactorMask::SHADER.bits()
        | FactorMask::EXCLUDES.bits(),
);

/// Derived groups recomputed when `atom` changes
pub fn dependents_of(atom: Atom, atoms: &Atoms) -> FactorMask {
    if atom == atoms.a_wm_name || atom == atoms.a_net_wm_name {
        return RULE_DEPENDENTS;
    }
    if atom == atoms.a_wm_class || atom == atoms.a_wm_role {
        return RULE_DEPENDENTS;
    }
    if atom == atoms.a_net_wm_type {
        return RULE_DEPENDENTS | FactorMask::PAINT_MODE;
    }
    if atom == atoms.a_net_wm_opacity {
        return FactorMask::OPACITY | FactorMask::PAINT_MODE;
    }
    if atom == atoms.a_shadow_hint {
        return FactorMask::SHADOW;
    }
    if atom == atoms.a_net_wm_state {
        return FactorMask::FULLSCREEN
            | FactorMask::SHADOW
            | FactorMask::OPACITY
            | FactorMask::EXCLUDES;
    }
    if atom == atoms.a_wm_client_leader || atom == atoms.a_wm_transient_for {
        return FactorMask::FOCUS;
    }
    // frame extents only produce damage
    return FactorMask::empty();
}

/// A sparse bitset over interned atoms
///
/// Atom values are small but unbounded, so the words are kept in a
/// map keyed by atom/64.
#[derive(Debug, Clone)]
pub struct PropertySet {
    ps_words: HashMap<u32, u64>,
}

impl PropertySet {
    pub fn new() -> PropertySet {
        PropertySet {
            ps_words: HashMap::new(),
        }
    }

    pub fn insert(&mut self, atom: Atom) {
        let word = self.ps_words.entry(atom.0 >> 6).or_insert(0);
        *word |= 1 << (atom.0 & 63);
    }

    pub fn contains(&self, atom: Atom) -> bool {
        match self.ps_words.get(&(atom.0 >> 6)) {
            Some(word) => word & (1 << (atom.0 & 63)) != 0,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ps_words.values().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.ps_words.clear();
    }

    /// All atoms currently in the set
    pub fn atoms(&self) -> Vec<Atom> {
        let mut ret = Vec::new();
        for (base, word) in self.ps_words.iter() {
            for bit in 0..64 {
                if word & (1u64 << bit) != 0 {
                    ret.push(Atom((base << 6) | bit));
                }
            }
        }
        return ret;
    }
}

/// The window properties are read from: the client window when one
/// was detected, the frame itself otherwise.
fn prop_win(rec: &WinRecord) -> Xid {
    rec.w_client.unwrap_or(rec.w_xid)
}

fn read_name(rec: &WinRecord, server: &mut dyn DisplayServer, atoms: &Atoms) -> String {
    let win = prop_win(rec);
    // EWMH name takes priority over the ICCCM one
    for prop in [atoms.a_net_wm_name, atoms.a_wm_name].iter() {
        match server.get_prop_strings(win, *prop) {
            Ok(mut strs) if !strs.is_empty() => return strs.remove(0),
            Ok(_) => {}
            Err(e) => log::debug!("name fetch failed on {}: {:?}", win, e),
        }
    }
    return String::new();
}

fn read_class(
    rec: &WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> (String, String) {
    match server.get_prop_strings(prop_win(rec), atoms.a_wm_class) {
        Ok(strs) => {
            let mut iter = strs.into_iter();
            let instance = iter.next().unwrap_or_default();
            let general = iter.next().unwrap_or_default();
            (instance, general)
        }
        Err(_) => (String::new(), String::new()),
    }
}

fn read_role(rec: &WinRecord, server: &mut dyn DisplayServer, atoms: &Atoms) -> String {
    server
        .get_prop_strings(prop_win(rec), atoms.a_wm_role)
        .ok()
        .and_then(|mut s| match s.is_empty() {
            true => None,
            false => Some(s.remove(0)),
        })
        .unwrap_or_default()
}

fn read_wintype(rec: &WinRecord, server: &mut dyn DisplayServer, atoms: &Atoms) -> WinType {
    if let Ok(list) = server.get_prop_atom_list(prop_win(rec), atoms.a_net_wm_type) {
        // the first recognized entry wins
        for a in list.iter() {
            if let Some(ty) = atoms.wintype_of(*a) {
                return ty;
            }
        }
    }
    return WinType::Unknown;
}

fn read_leader(rec: &WinRecord, server: &mut dyn DisplayServer, atoms: &Atoms) -> Option<Xid> {
    let win = prop_win(rec);
    if let Ok(Some(leader)) = server.get_prop_window(win, atoms.a_wm_client_leader) {
        return Some(leader);
    }
    if let Ok(Some(leader)) = server.get_prop_window(win, atoms.a_wm_transient_for) {
        return Some(leader);
    }
    return None;
}

fn read_opacity_prop(
    rec: &WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> Option<u32> {
    // the hint can sit on either the frame or the client
    if let Ok(Some(v)) = server.get_prop_cardinal(rec.w_xid, atoms.a_net_wm_opacity) {
        return Some(v);
    }
    if let Some(client) = rec.w_client {
        if let Ok(Some(v)) = server.get_prop_cardinal(client, atoms.a_net_wm_opacity) {
            return Some(v);
        }
    }
    return None;
}

fn read_frame_extents(
    rec: &WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> crate::window::FrameExtents {
    match server.get_prop_cardinal_list(prop_win(rec), atoms.a_net_frame_extents) {
        Ok(vals) if vals.len() >= 4 => crate::window::FrameExtents {
            fe_left: vals[0] as i32,
            fe_right: vals[1] as i32,
            fe_top: vals[2] as i32,
            fe_bottom: vals[3] as i32,
        },
        _ => Default::default(),
    }
}

fn read_fullscreen_hint(
    rec: &WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> bool {
    match server.get_prop_atom_list(prop_win(rec), atoms.a_net_wm_state) {
        Ok(list) => list.contains(&atoms.a_net_wm_state_fullscreen),
        Err(_) => false,
    }
}

fn read_shadow_hint(
    rec: &WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> Option<bool> {
    match server.get_prop_cardinal(prop_win(rec), atoms.a_shadow_hint) {
        Ok(Some(v)) => Some(v != 0),
        _ => None,
    }
}

/// Re-read everything that hangs off the client window. Called by
/// the primary drain after client re-detection.
pub fn refresh_client_props(
    rec: &mut WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) {
    rec.w_name = read_name(rec, server, atoms);
    let (instance, general) = read_class(rec, server, atoms);
    rec.w_class_instance = instance;
    rec.w_class_general = general;
    rec.w_role = read_role(rec, server, atoms);
    rec.w_type = read_wintype(rec, server, atoms);
    rec.w_frame_extents = read_frame_extents(rec, server, atoms);
    rec.w_leader = read_leader(rec, server, atoms);
    rec.w_opacity_prop = read_opacity_prop(rec, server, atoms);
    rec.w_fullscreen_hint = read_fullscreen_hint(rec, server, atoms);
    rec.w_shadow_hint = read_shadow_hint(rec, server, atoms);
}

/// Refresh every atom in the stale set, accumulating the factor
/// mask for the values that actually changed. Returns whether the
/// window area must be damaged (frame extent changes).
pub fn refresh_stale(
    rec: &mut WinRecord,
    server: &mut dyn DisplayServer,
    atoms: &Atoms,
) -> bool {
    let mut mask = FactorMask::empty();
    let mut damaged = false;

    for atom in rec.w_stale_props.atoms() {
        let mut changed = false;

        if atom == atoms.a_wm_name || atom == atoms.a_net_wm_name {
            let name = read_name(rec, server, atoms);
            changed = name != rec.w_name;
            rec.w_name = name;
        } else if atom == atoms.a_wm_class {
            let (instance, general) = read_class(rec, server, atoms);
            changed = instance != rec.w_class_instance || general != rec.w_class_general;
            rec.w_class_instance = instance;
            rec.w_class_general = general;
        } else if atom == atoms.a_wm_role {
            let role = read_role(rec, server, atoms);
            changed = role != rec.w_role;
            rec.w_role = role;
        } else if atom == atoms.a_net_wm_type {
            let ty = read_wintype(rec, server, atoms);
            changed = ty != rec.w_type;
            rec.w_type = ty;
        } else if atom == atoms.a_net_wm_opacity {
            let op = read_opacity_prop(rec, server, atoms);
            changed = op != rec.w_opacity_prop;
            rec.w_opacity_prop = op;
        } else if atom == atoms.a_net_frame_extents {
            let extents = read_frame_extents(rec, server, atoms);
            if extents != rec.w_frame_extents {
                rec.w_frame_extents = extents;
                damaged = true;
            }
        } else if atom == atoms.a_shadow_hint {
            let hint = read_shadow_hint(rec, server, atoms);
            changed = hint != rec.w_shadow_hint;
            rec.w_shadow_hint = hint;
        } else if atom == atoms.a_net_wm_state {
            let fs = read_fullscreen_hint(rec, server, atoms);
            changed = fs != rec.w_fullscreen_hint;
            rec.w_fullscreen_hint = fs;
        } else if atom == atoms.a_wm_client_leader || atom == atoms.a_wm_transient_for {
            let leader = read_leader(rec, server, atoms);
            changed = leader != rec.w_leader;
            rec.w_leader = leader;
        }

        if changed {
            mask |= dependents_of(atom, atoms);
        }
    }

    if !mask.is_empty() {
        rec.w_factor_mask |= mask;
        rec.w_flags |= WinFlags::FACTOR_CHANGED;
    }
    return damaged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_set_basics() {
        let mut set = PropertySet::new();
        assert!(set.is_empty());

        set.insert(Atom(3));
        set.insert(Atom(64));
        set.insert(Atom(64)); // duplicate
        set.insert(Atom(1000));

        assert!(set.contains(Atom(3)));
        assert!(set.contains(Atom(64)));
        assert!(set.contains(Atom(1000)));
        assert!(!set.contains(Atom(4)));

        let mut atoms = set.atoms();
        atoms.sort_by_key(|a| a.0);
        assert_eq!(atoms, vec![Atom(3), Atom(64), Atom(1000)]);

        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains(Atom(3)));
    }
}
