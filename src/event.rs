// Server event fan-in
//
// Decoded notifications land here and turn into registry mutations
// and per-record stale flags. Nothing here recomputes derived
// state; that happens in the flag drains on the next frame.
//
// Austin Shafer - 2024
use crate::paint::DamageRing;
use crate::registry::Registry;
use crate::server::{Atoms, DisplayServer, ServerEvent, ServerMapState, Xid};
use crate::window::props::FactorMask;
use crate::window::{WinFlags, WinState};

use utils::log;

/// Mark one record's focus factor stale, looked up by frame or
/// client handle
fn mark_focus_stale(registry: &mut Registry, xid: Xid) {
    let id = registry.lookup(xid).or_else(|| registry.lookup_client(xid));
    if let Some(id) = id {
        if let Some(rec) = registry.win_mut(id) {
            rec.w_flags |= WinFlags::FACTOR_CHANGED;
            rec.w_factor_mask |= FactorMask::FOCUS;
        }
    }
}

/// The EWMH active window changed. Both the window losing focus and
/// the one gaining it must recompute, and with leader tracking the
/// whole groups do.
pub fn refresh_active_win(
    registry: &mut Registry,
    server: &mut dyn DisplayServer,
    active_win: &mut Option<Xid>,
    active_leader: &mut Option<Xid>,
) {
    let new_active = server.active_window();
    if new_active == *active_win {
        return;
    }

    if let Some(old) = *active_win {
        mark_focus_stale(registry, old);
    }
    if let Some(new) = new_active {
        mark_focus_stale(registry, new);
    }

    // group focus follows the leader of the newly active window
    let new_leader = new_active
        .and_then(|xid| {
            registry
                .lookup(xid)
                .or_else(|| registry.lookup_client(xid))
        })
        .and_then(|id| registry.win(id))
        .and_then(|rec| rec.w_leader);
    if new_leader != *active_leader {
        // every member of either group changes focus potential
        let members: Vec<Xid> = registry
            .top_down()
            .iter()
            .filter_map(|id| registry.win(*id))
            .filter(|rec| {
                rec.w_leader.is_some()
                    && (rec.w_leader == *active_leader || rec.w_leader == new_leader)
            })
            .map(|rec| rec.w_xid)
            .collect();
        for xid in members {
            mark_focus_stale(registry, xid);
        }
        *active_leader = new_leader;
    }

    *active_win = new_active;
    log::debug!("active window is now {:?}", new_active);
}

/// Route one decoded event. Returns whether a redraw is warranted.
///
/// Vblank events are scheduler business and must be handled by the
/// caller before delegating here.
pub fn handle_event(
    registry: &mut Registry,
    server: &mut dyn DisplayServer,
    damage: &mut DamageRing,
    atoms: &Atoms,
    active_win: &mut Option<Xid>,
    active_leader: &mut Option<Xid>,
    ev: ServerEvent,
) -> bool {
    match ev {
        ServerEvent::Create { window } => {
            registry.note_new_toplevel(server, window);
            return false;
        }

        ServerEvent::Destroy { window } => {
            registry.destroy(window);
            registry.invalidate_reg_ignore_below(window);
            return true;
        }

        ServerEvent::Map { window } => {
            if let Some(rec) = registry.win_by_xid_mut(window) {
                rec.w_flags |= WinFlags::MAPPED | WinFlags::CLIENT_STALE;
                return true;
            }
            // a map for a window we never saw created
            registry.note_new_toplevel(server, window);
            return false;
        }

        ServerEvent::Unmap { window } => {
            if let Some(rec) = registry.win_by_xid_mut(window) {
                if rec.w_state == WinState::Mapped {
                    rec.unmap_start();
                }
            }
            registry.invalidate_reg_ignore_below(window);
            return true;
        }

        ServerEvent::Reparent { window, parent } => {
            if parent == server.root() {
                registry.note_new_toplevel(server, window);
                return false;
            }
            // reparented away from the root: it stops being a
            // toplevel, and the new parent may have gained a client
            if registry.lookup(window).is_some() {
                registry.destroy(window);
            }
            if registry.lookup(parent).is_some() {
                registry.change_client(parent, window);
            }
            return true;
        }

        ServerEvent::Configure {
            window,
            geom,
            above,
        } => {
            let known = match registry.win_by_xid_mut(window) {
                Some(rec) => {
                    let pos_changed =
                        geom.g_x != rec.w_pending_geom.g_x || geom.g_y != rec.w_pending_geom.g_y;
                    let size_changed = !geom.size_eq(&rec.w_pending_geom);
                    rec.w_pending_geom = geom;
                    if pos_changed {
                        rec.w_flags |= WinFlags::POSITION_STALE;
                    }
                    if size_changed {
                        rec.w_flags |= WinFlags::SIZE_STALE;
                    }
                    true
                }
                None => false,
            };
            if !known {
                return false;
            }

            match above {
                Some(sibling) => registry.restack_above(window, sibling),
                None => registry.restack_bottom(window),
            }
            return true;
        }

        ServerEvent::Circulate {
            window,
            place_on_top,
        } => {
            match place_on_top {
                true => registry.restack_top(window),
                false => registry.restack_bottom(window),
            }
            return true;
        }

        ServerEvent::Property { window, atom } => {
            if window == server.root() {
                if atom == atoms.a_net_active_window {
                    refresh_active_win(registry, server, active_win, active_leader);
                    return true;
                }
                return false;
            }

            // property events arrive for both frames and clients
            let id = registry
                .lookup(window)
                .or_else(|| registry.lookup_client(window));
            if let Some(id) = id {
                if let Some(rec) = registry.win_mut(id) {
                    rec.set_properties_stale(&[atom]);
                    return true;
                }
            }
            return false;
        }

        ServerEvent::Shape { window } => {
            let shape = server.bounding_region(window).ok();
            if let Some(rec) = registry.win_by_xid_mut(window) {
                rec.w_bounding_shape = shape;
                rec.w_flags |= WinFlags::FACTOR_CHANGED;
                rec.w_factor_mask |= FactorMask::SHADOW;
                damage.add_rect(rec.rect());
            }
            registry.invalidate_reg_ignore_below(window);
            return true;
        }

        ServerEvent::Damaged { window, region } => {
            if let Some(rec) = registry.win_by_xid_mut(window) {
                rec.w_ever_damaged = true;
                let mut reg = region;
                let rect = rec.rect();
                reg.translate(rect.r_pos.0, rect.r_pos.1);
                damage.add(&reg);
                return true;
            }
            return false;
        }

        ServerEvent::RootDamaged => {
            damage.reset_full();
            return true;
        }

        ServerEvent::AttrsReply { window, attrs } => {
            let viewable =
                attrs.map(|a| a.wa_map_state == ServerMapState::Viewable) == Some(true);
            registry.handle_attrs_reply(server, window, attrs);
            return viewable;
        }

        ServerEvent::Vblank { .. } => {
            // scheduler business, not ours
            return false;
        }
    }
}
