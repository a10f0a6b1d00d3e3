//! # Window registry
//!
//! Owns the set of known windows. All creation, destruction,
//! re-parenting and identity changes funnel through here, as do all
//! stacking mutations, which is what keeps the cached clip-ignore
//! regions consistent.
//!
//! Records live in a generational arena; the registry additionally
//! keeps a hash index from server handle to record (lookups are
//! hot) and threads a doubly linked stacking order through the
//! records. Lookups by client window are a linear scan, they are
//! rare.

// Austin Shafer - 2024
use crate::server::{
    DisplayServer, FetchKind, PendingFetch, ServerMapState, WinAttrs, Xid,
};
use crate::window::props::FactorMask;
use crate::window::{WinFlags, WinId, WinRecord, WinState};

use utils::arena::Arena;
use utils::log;

extern crate paste;
use paste::paste;

use std::collections::HashMap;

pub struct Registry {
    reg_wins: Arena<WinRecord>,
    /// server handle to record, hot path for event routing.
    /// Destroyed records are removed from here immediately even
    /// though they linger in the stacking order.
    reg_index: HashMap<Xid, WinId>,
    /// front of the stacking order
    reg_top: Option<WinId>,
    /// back of the stacking order
    reg_bottom: Option<WinId>,
    /// bumped every time a handle is taken into management,
    /// detects server-side handle reuse
    reg_gen: u64,
    /// in-flight async attribute fetches
    reg_pending: Vec<PendingFetch>,
}

// Force-override setters for the derived attributes callers may pin
macro_rules! define_force_setters {
    ($name:ident) => {
        paste! {
            pub fn [<window_set_ $name _force>](&mut self, xid: Xid, force: Option<bool>) -> bool {
                let id = match self.lookup(xid) {
                    Some(id) => id,
                    None => return false,
                };
                if let Some(rec) = self.reg_wins.get_mut(id) {
                    rec.[<w_ $name _force>] = force;
                    rec.w_flags |= WinFlags::FACTOR_CHANGED;
                    rec.w_factor_mask = FactorMask::all();
                    return true;
                }
                return false;
            }
        }
    };
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            reg_wins: Arena::new(),
            reg_index: HashMap::new(),
            reg_top: None,
            reg_bottom: None,
            reg_gen: 0,
            reg_pending: Vec::new(),
        }
    }

    define_force_setters!(focused);
    define_force_setters!(shadow);
    define_force_setters!(fade);
    define_force_setters!(invert_color);

    pub fn len(&self) -> usize {
        self.reg_wins.len()
    }

    pub fn lookup(&self, xid: Xid) -> Option<WinId> {
        self.reg_index.get(&xid).copied()
    }

    /// Find the record whose client window is `xid`. Linear scan.
    pub fn lookup_client(&self, xid: Xid) -> Option<WinId> {
        self.reg_wins
            .iter()
            .find(|(_, rec)| rec.w_client == Some(xid))
            .map(|(id, _)| id)
    }

    pub fn win(&self, id: WinId) -> Option<&WinRecord> {
        self.reg_wins.get(id)
    }

    pub fn win_mut(&mut self, id: WinId) -> Option<&mut WinRecord> {
        self.reg_wins.get_mut(id)
    }

    pub fn win_by_xid(&self, xid: Xid) -> Option<&WinRecord> {
        self.lookup(xid).and_then(move |id| self.reg_wins.get(id))
    }

    pub fn win_by_xid_mut(&mut self, xid: Xid) -> Option<&mut WinRecord> {
        let id = self.lookup(xid)?;
        self.reg_wins.get_mut(id)
    }

    // ------------------------------
    // Stacking order
    // ------------------------------

    /// Collect the stacking order front-to-back
    pub fn top_down(&self) -> Vec<WinId> {
        let mut ret = Vec::with_capacity(self.reg_wins.len());
        let mut cur = self.reg_top;
        while let Some(id) = cur {
            ret.push(id);
            cur = self.reg_wins.get(id).and_then(|r| r.w_next);
        }
        return ret;
    }

    /// Collect the stacking order back-to-front, the paint order
    pub fn bottom_up(&self) -> Vec<WinId> {
        let mut ret = self.top_down();
        ret.reverse();
        return ret;
    }

    fn unlink(&mut self, id: WinId) {
        let (prev, next) = match self.reg_wins.get(id) {
            Some(rec) => (rec.w_prev, rec.w_next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(rec) = self.reg_wins.get_mut(p) {
                    rec.w_next = next;
                }
            }
            None => self.reg_top = next,
        }
        match next {
            Some(n) => {
                if let Some(rec) = self.reg_wins.get_mut(n) {
                    rec.w_prev = prev;
                }
            }
            None => self.reg_bottom = prev,
        }
        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_prev = None;
            rec.w_next = None;
        }
    }

    fn link_top(&mut self, id: WinId) {
        let old_top = self.reg_top;
        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_prev = None;
            rec.w_next = old_top;
        }
        if let Some(t) = old_top {
            if let Some(rec) = self.reg_wins.get_mut(t) {
                rec.w_prev = Some(id);
            }
        } else {
            self.reg_bottom = Some(id);
        }
        self.reg_top = Some(id);
    }

    fn link_bottom(&mut self, id: WinId) {
        let old_bottom = self.reg_bottom;
        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_next = None;
            rec.w_prev = old_bottom;
        }
        if let Some(b) = old_bottom {
            if let Some(rec) = self.reg_wins.get_mut(b) {
                rec.w_next = Some(id);
            }
        } else {
            self.reg_top = Some(id);
        }
        self.reg_bottom = Some(id);
    }

    fn link_above(&mut self, id: WinId, target: WinId) {
        let target_prev = match self.reg_wins.get(target) {
            Some(rec) => rec.w_prev,
            None => return,
        };

        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_prev = target_prev;
            rec.w_next = Some(target);
        }
        match target_prev {
            Some(p) => {
                if let Some(rec) = self.reg_wins.get_mut(p) {
                    rec.w_next = Some(id);
                }
            }
            None => self.reg_top = Some(id),
        }
        if let Some(rec) = self.reg_wins.get_mut(target) {
            rec.w_prev = Some(id);
        }
    }

    /// Clear the cached clip-ignore region of `start` and every
    /// record beneath it
    fn invalidate_reg_ignore_from(&mut self, start: Option<WinId>) {
        let mut cur = start;
        while let Some(id) = cur {
            cur = match self.reg_wins.get_mut(id) {
                Some(rec) => {
                    rec.w_reg_ignore = None;
                    rec.w_next
                }
                None => None,
            };
        }
    }

    /// A window's coverage changed (shape, visibility): everything
    /// at and beneath it sees a different world
    pub fn invalidate_reg_ignore_below(&mut self, xid: Xid) {
        let id = self.lookup(xid);
        self.invalidate_reg_ignore_from(id);
    }

    /// Move `w` directly above `below` in the stacking order
    pub fn restack_above(&mut self, w: Xid, below: Xid) {
        let (w_id, below_id) = match (self.lookup(w), self.lookup(below)) {
            (Some(a), Some(b)) if a != b => (a, b),
            _ => return,
        };

        // the record that used to sit where w was loses its view
        // of the stack, as does everything under the new position
        let old_next = self.reg_wins.get(w_id).and_then(|r| r.w_next);

        self.unlink(w_id);
        self.link_above(w_id, below_id);

        self.invalidate_reg_ignore_from(Some(w_id));
        self.invalidate_reg_ignore_from(old_next);
    }

    pub fn restack_top(&mut self, w: Xid) {
        let w_id = match self.lookup(w) {
            Some(id) => id,
            None => return,
        };
        let old_next = self.reg_wins.get(w_id).and_then(|r| r.w_next);
        self.unlink(w_id);
        self.link_top(w_id);
        self.invalidate_reg_ignore_from(Some(w_id));
        self.invalidate_reg_ignore_from(old_next);
    }

    pub fn restack_bottom(&mut self, w: Xid) {
        let w_id = match self.lookup(w) {
            Some(id) => id,
            None => return,
        };
        let old_next = self.reg_wins.get(w_id).and_then(|r| r.w_next);
        self.unlink(w_id);
        self.link_bottom(w_id);
        self.invalidate_reg_ignore_from(Some(w_id));
        self.invalidate_reg_ignore_from(old_next);
    }

    // ------------------------------
    // Lifecycle
    // ------------------------------

    /// A new toplevel appeared. Allocates a placeholder at the top
    /// of the stacking order and issues the async attribute fetch
    /// that decides whether it becomes managed.
    pub fn note_new_toplevel(&mut self, server: &mut dyn DisplayServer, xid: Xid) {
        if self.reg_index.contains_key(&xid) {
            log::debug!("ignoring create for already known window {}", xid);
            return;
        }

        self.reg_gen += 1;
        let gen = self.reg_gen;

        // arena insert needs the id up front, reserve with a
        // placeholder and patch it in
        let id = self
            .reg_wins
            .insert(WinRecord::placeholder(utils::arena::Id::invalid(), xid, gen));
        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_id = id;
        }

        self.reg_index.insert(xid, id);
        self.link_top(id);
        self.invalidate_reg_ignore_from(Some(id));

        self.reg_pending.push(PendingFetch {
            pf_target: xid,
            pf_gen: gen,
            pf_kind: FetchKind::NewWindowAttrs,
        });
        server.request_win_attributes(xid);
        log::debug!("new toplevel {} (gen {})", xid, gen);
    }

    /// Completion handler for the attribute fetch. Verifies request
    /// identity before touching the record, then promotes it to a
    /// managed window or drops the placeholder.
    pub fn handle_attrs_reply(
        &mut self,
        server: &mut dyn DisplayServer,
        xid: Xid,
        attrs: Option<WinAttrs>,
    ) {
        let pending = match self
            .reg_pending
            .iter()
            .position(|p| p.pf_target == xid && p.pf_kind == FetchKind::NewWindowAttrs)
        {
            Some(i) => self.reg_pending.remove(i),
            None => {
                log::debug!("attribute reply for {} with no pending fetch", xid);
                return;
            }
        };

        let id = match self.lookup(xid) {
            Some(id) => id,
            None => return,
        };
        let gen = match self.reg_wins.get(id) {
            Some(rec) => rec.w_xid_gen,
            None => return,
        };
        if gen != pending.pf_gen {
            // the handle was destroyed and reused mid-flight,
            // expected under create/destroy churn
            log::debug!(
                "dropping stale attribute reply for {} (gen {} != {})",
                xid,
                pending.pf_gen,
                gen
            );
            return;
        }

        let attrs = match attrs {
            Some(a) => a,
            None => {
                // fetch error, drop the placeholder entirely
                log::debug!("attribute fetch failed for {}, dropping", xid);
                self.unlink(id);
                self.reg_index.remove(&xid);
                self.reg_wins.remove(id);
                return;
            }
        };

        let viewable = attrs.wa_map_state == ServerMapState::Viewable;
        let managed = {
            let rec = match self.reg_wins.get_mut(id) {
                Some(r) => r,
                None => return,
            };
            rec.promote(&attrs);
            if viewable {
                rec.w_flags |= WinFlags::MAPPED | WinFlags::CLIENT_STALE;
            }
            rec.w_managed
        };

        if managed {
            if let Err(e) = server.subscribe_damage(xid) {
                log::debug!("damage subscription failed for {}: {:?}", xid, e);
            }
            server.subscribe_shape(xid);
        }
        log::debug!("promoted {} managed={}", xid, managed);
    }

    /// The server handle died. The record is pulled out of the hash
    /// index immediately but stays in the stacking order so its
    /// tear-down animation can render; `finalize_destroyed` reaps it
    /// once the animation engine is done with it.
    pub fn destroy(&mut self, xid: Xid) {
        let id = match self.reg_index.remove(&xid) {
            Some(id) => id,
            None => return,
        };
        // the handle is gone, any reply still in flight is garbage
        self.reg_pending.retain(|p| p.pf_target != xid);

        if let Some(rec) = self.reg_wins.get_mut(id) {
            rec.w_state = WinState::Destroyed;
            rec.w_opacity_target = 0.0;
            rec.w_flags.remove(WinFlags::PIXMAP_STALE | WinFlags::MAPPED);
            log::debug!("window {} destroyed", xid);
        }
    }

    /// The client window under a frame changed. The actual re-scan
    /// happens during the primary flag drain.
    pub fn change_client(&mut self, frame: Xid, _new_client: Xid) {
        if let Some(rec) = self.win_by_xid_mut(frame) {
            rec.w_flags |= WinFlags::CLIENT_STALE;
        }
    }

    /// Record a cross-fade source: `w` renders using `from`'s last
    /// image, keeping `from` alive until `w` lets go.
    pub fn set_prev_trans(&mut self, w: WinId, from: Option<WinId>) {
        if let Some(rec) = self.reg_wins.get_mut(w) {
            rec.w_prev_trans = from;
        }
    }

    /// Reap destroyed records whose animations have finished and
    /// that nothing references anymore. Runs to a fixpoint so a
    /// chain of references collapses in a single pass. Returns what
    /// was freed; the caller must have released GPU resources via
    /// the teardown in `window::release_images` for each.
    pub fn finalize_destroyed<F>(&mut self, mut release: F) -> Vec<Xid>
    where
        F: FnMut(&mut WinRecord),
    {
        let mut freed = Vec::new();

        loop {
            let mut victim = None;
            for (id, rec) in self.reg_wins.iter() {
                if rec.w_state != WinState::Destroyed || rec.w_anim.is_some() {
                    continue;
                }
                // referenced records are still being rendered
                // through someone else's cross-fade
                let referenced = self
                    .reg_wins
                    .iter()
                    .any(|(_, other)| other.w_prev_trans == Some(id));
                if !referenced {
                    victim = Some(id);
                    break;
                }
            }

            let id = match victim {
                Some(id) => id,
                None => break,
            };

            if let Some(rec) = self.reg_wins.get_mut(id) {
                release(rec);
            }
            self.unlink(id);
            if let Some(rec) = self.reg_wins.remove(id) {
                log::debug!("finalized window {}", rec.w_xid);
                freed.push(rec.w_xid);
            }
        }
        return freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a tiny scripted server lives in crate::tests; the registry
    // tests only need stacking, which doesn't touch the server
    fn push_win(reg: &mut Registry, xid: u32) -> WinId {
        let id = reg
            .reg_wins
            .insert(WinRecord::placeholder(utils::arena::Id::invalid(), Xid(xid), 0));
        if let Some(rec) = reg.reg_wins.get_mut(id) {
            rec.w_id = id;
        }
        reg.reg_index.insert(Xid(xid), id);
        reg.link_top(id);
        return id;
    }

    #[test]
    fn restack_above_moves_and_invalidates() {
        let mut reg = Registry::new();
        // stacking after pushes: 3 (top), 2, 1 (bottom)
        let w1 = push_win(&mut reg, 1);
        let w2 = push_win(&mut reg, 2);
        let w3 = push_win(&mut reg, 3);
        assert_eq!(reg.top_down(), vec![w3, w2, w1]);

        // seed cached reg_ignore so invalidation is observable
        for id in [w1, w2, w3].iter() {
            reg.win_mut(*id).unwrap().w_reg_ignore =
                Some(utils::region::Region::new());
        }

        reg.restack_above(Xid(1), Xid(3));
        assert_eq!(reg.top_down(), vec![w1, w3, w2]);

        // w1 moved, everything beneath either endpoint is invalid
        assert!(reg.win(w1).unwrap().w_reg_ignore.is_none());
        assert!(reg.win(w2).unwrap().w_reg_ignore.is_none());
        assert!(reg.win(w3).unwrap().w_reg_ignore.is_none());
    }

    #[test]
    fn restack_top_bottom() {
        let mut reg = Registry::new();
        let w1 = push_win(&mut reg, 1);
        let w2 = push_win(&mut reg, 2);
        let w3 = push_win(&mut reg, 3);

        reg.restack_top(Xid(1));
        assert_eq!(reg.top_down(), vec![w1, w3, w2]);
        reg.restack_bottom(Xid(3));
        assert_eq!(reg.top_down(), vec![w1, w2, w3]);
        assert_eq!(reg.bottom_up(), vec![w3, w2, w1]);
    }

    #[test]
    fn destroyed_record_leaves_index_but_not_stack() {
        let mut reg = Registry::new();
        let w1 = push_win(&mut reg, 1);

        reg.destroy(Xid(1));
        assert!(reg.lookup(Xid(1)).is_none());
        assert_eq!(reg.top_down(), vec![w1]);
        assert_eq!(reg.win(w1).unwrap().w_state, WinState::Destroyed);

        let freed = reg.finalize_destroyed(|_| {});
        assert_eq!(freed, vec![Xid(1)]);
        assert!(reg.top_down().is_empty());
    }

    #[test]
    fn prev_trans_blocks_finalize() {
        let mut reg = Registry::new();
        let w1 = push_win(&mut reg, 1);
        let w2 = push_win(&mut reg, 2);

        reg.set_prev_trans(w2, Some(w1));
        reg.destroy(Xid(1));

        // w1 is referenced by w2, it must survive the reap
        assert!(reg.finalize_destroyed(|_| {}).is_empty());
        assert!(reg.win(w1).is_some());

        // once both are destroyed and unreferenced the chain
        // collapses in one pass
        reg.destroy(Xid(2));
        let mut freed = reg.finalize_destroyed(|_| {});
        freed.sort_by_key(|x| x.0);
        assert_eq!(freed, vec![Xid(1), Xid(2)]);
    }
}
