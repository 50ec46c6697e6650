//! Per-routine element sequences backed by one arena.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    happens_before, ChannelDir, CondKind, ElemId, Element, ElementKind, HbRelation, ObjectId,
    RoutineId, WaitGroupKind,
};

#[derive(Debug, Clone, Default)]
pub struct Trace {
    arena: Vec<Element>,
    routines: BTreeMap<RoutineId, Vec<ElemId>>,
    min_trace_id: u64,
    number_elems: BTreeMap<RoutineId, usize>,
    hb_was_calc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrentCondOps {
    pub signals: Vec<ElemId>,
    pub broadcasts: Vec<ElemId>,
}

fn relation(a: &Element, b: &Element) -> Option<HbRelation> {
    match (&a.vc, &b.vc) {
        (Some(x), Some(y)) => Some(happens_before(x, y)),
        _ => None,
    }
}

fn is_before(a: &Element, b: &Element) -> bool {
    relation(a, b) == Some(HbRelation::Before)
}

fn is_concurrent_elem(a: &Element, b: &Element) -> bool {
    relation(a, b) == Some(HbRelation::Concurrent)
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn add_routine(&mut self, routine: RoutineId) {
        self.routines.entry(routine).or_default();
        self.number_elems.entry(routine).or_insert(0);
    }

    /// Append an element to its routine, assigning the next trace id.
    pub fn push(&mut self, mut elem: Element) -> ElemId {
        self.min_trace_id += 1;
        elem.trace_id = self.min_trace_id;
        let id = ElemId(self.arena.len());
        let routine = elem.routine;
        self.arena.push(elem);
        self.routines.entry(routine).or_default().push(id);
        *self.number_elems.entry(routine).or_insert(0) += 1;
        id
    }

    pub fn elem(&self, id: ElemId) -> &Element {
        &self.arena[id.0]
    }

    pub fn elem_mut(&mut self, id: ElemId) -> &mut Element {
        &mut self.arena[id.0]
    }

    pub fn get(&self, id: ElemId) -> Option<&Element> {
        self.arena.get(id.0)
    }

    pub fn routine(&self, routine: RoutineId) -> &[ElemId] {
        self.routines.get(&routine).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn routine_ids(&self) -> impl Iterator<Item = RoutineId> + '_ {
        self.routines.keys().copied()
    }

    /// Highest routine id; clocks are sized with this.
    pub fn num_routines(&self) -> usize {
        self.routines.keys().next_back().copied().unwrap_or(0) as usize
    }

    pub fn number_elems_in_routine(&self, routine: RoutineId) -> usize {
        self.number_elems.get(&routine).copied().unwrap_or(0)
    }

    /// Number of elements currently linked into routines.
    pub fn len(&self) -> usize {
        self.routines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hb_was_calc(&self) -> bool {
        self.hb_was_calc
    }

    pub fn set_hb_was_calc(&mut self, calc: bool) {
        self.hb_was_calc = calc;
    }

    /// All linked elements in routine order.
    pub fn ids(&self) -> impl Iterator<Item = ElemId> + '_ {
        self.routines.values().flat_map(|ids| ids.iter().copied())
    }

    pub fn contains(&self, id: ElemId) -> bool {
        self.get(id)
            .map(|e| self.routine(e.routine).contains(&id))
            .unwrap_or(false)
    }

    pub fn index_in_routine(&self, id: ElemId) -> Option<usize> {
        let e = self.get(id)?;
        self.routine(e.routine).iter().position(|x| *x == id)
    }

    pub fn find_by_trace_id(&self, trace_id: u64) -> Option<ElemId> {
        self.ids().find(|id| self.elem(*id).trace_id == trace_id)
    }

    /// Resolve a `file:line@tPre` identifier.
    pub fn find_by_tid(&self, tid: &str) -> Option<ElemId> {
        self.ids().find(|id| self.elem(*id).tid() == tid)
    }

    pub fn sort(&mut self) {
        let routines: Vec<RoutineId> = self.routines.keys().copied().collect();
        self.sort_routines(&routines);
    }

    /// Stable sort by `tSort`, so equal times keep recorded order.
    pub fn sort_routines(&mut self, routines: &[RoutineId]) {
        for r in routines {
            if let Some(ids) = self.routines.get_mut(r) {
                let arena = &self.arena;
                ids.sort_by_key(|id| arena[id.0].t_sort());
            }
        }
    }

    pub fn iter(&self) -> TraceIterator {
        TraceIterator::new(self)
    }

    /// Merged order: executed elements by `(tPost, routine, index)`, then blocked ones.
    pub fn ordered_ids(&self) -> Vec<ElemId> {
        let mut it = self.iter();
        let mut out = Vec::with_capacity(self.len());
        while let Some(id) = it.next(self) {
            out.push(id);
        }
        out
    }

    pub fn last_elem_per_routine(&self) -> BTreeMap<RoutineId, ElemId> {
        self.routines
            .iter()
            .filter_map(|(r, ids)| ids.last().map(|id| (*r, *id)))
            .collect()
    }

    /// Match executed, non-closed sends and receives sharing `(channel, oID)`.
    pub fn link_partners(&mut self) {
        let mut open: BTreeMap<(ObjectId, u64, ChannelDir), ElemId> = BTreeMap::new();
        let ids: Vec<ElemId> = self.ids().collect();
        for id in ids {
            let (chan, oid, dir) = {
                let e = self.elem(id);
                if !e.is_executed() {
                    continue;
                }
                let Some(op) = e.effective_channel() else {
                    continue;
                };
                if op.closed || op.dir == ChannelDir::Close || op.partner.is_some() || op.id == -1 {
                    continue;
                }
                (op.id, op.oid, op.dir)
            };
            let other_dir = match dir {
                ChannelDir::Send => ChannelDir::Recv,
                _ => ChannelDir::Send,
            };
            if let Some(other) = open.remove(&(chan, oid, other_dir)) {
                if let Some(op) = self.elem_mut(id).effective_channel_mut() {
                    op.partner = Some(other);
                }
                if let Some(op) = self.elem_mut(other).effective_channel_mut() {
                    op.partner = Some(id);
                }
            } else {
                open.entry((chan, oid, dir)).or_insert(id);
            }
        }
    }

    // Rewrite primitives.

    /// Add `shift` to every element with `tPre >= start_t_pre`.
    pub fn shift_trace(&mut self, start_t_pre: u64, shift: u64) -> bool {
        if shift == 0 {
            return false;
        }
        let ids: Vec<ElemId> = self.ids().collect();
        for id in ids {
            let e = self.elem_mut(id);
            if e.t_pre >= start_t_pre {
                let base = if e.is_executed() { e.t_post } else { e.t_pre };
                e.set_t_without_not_executed(base.saturating_add(shift));
            }
        }
        true
    }

    pub fn shift_routine(&mut self, routine: RoutineId, start_t_pre: u64, shift: u64) -> bool {
        if shift == 0 {
            return false;
        }
        let ids: Vec<ElemId> = self.routine(routine).to_vec();
        for id in ids {
            let e = self.elem_mut(id);
            if e.t_pre >= start_t_pre {
                let base = if e.is_executed() { e.t_post } else { e.t_pre };
                e.set_t_without_not_executed(base.saturating_add(shift));
            }
        }
        true
    }

    /// Move everything not HB-before `anchor` to just after it, keeping relative order.
    pub fn shift_concurrent_or_after_to_after(&mut self, anchor: ElemId) {
        let anchor_elem = self.elem(anchor).clone();
        let to_shift: Vec<ElemId> = self
            .ids()
            .filter(|id| *id != anchor && !is_before(self.elem(*id), &anchor_elem))
            .collect();
        let Some(min_time) = to_shift.iter().map(|id| self.elem(*id).t_pre).min() else {
            return;
        };
        let distance = anchor_elem.t_pre as i128 - min_time as i128 + 1;
        for id in to_shift {
            let e = self.elem_mut(id);
            let t = (e.t_pre as i128 + distance).max(1) as u64;
            e.set_t_without_not_executed(t);
        }
    }

    /// As above, restricted to elements with `tPre > start`. A blocked anchor is
    /// first re-timed after every element that stays in place.
    pub fn shift_concurrent_or_after_to_after_starting_from(&mut self, anchor: ElemId, start: u64) {
        let anchor_elem = self.elem(anchor).clone();
        let mut to_shift = Vec::new();
        let mut max_not_moved = 0u64;
        for id in self.ids() {
            if id == anchor {
                continue;
            }
            let e = self.elem(id);
            if !is_before(e, &anchor_elem) {
                if e.t_pre <= start {
                    continue;
                }
                to_shift.push(id);
            } else {
                max_not_moved = max_not_moved.max(e.t_pre);
            }
        }
        if !anchor_elem.is_executed() {
            self.elem_mut(anchor).set_t(max_not_moved + 1);
        }
        let anchor_t_pre = self.elem(anchor).t_pre;
        let Some(min_time) = to_shift.iter().map(|id| self.elem(*id).t_pre).min() else {
            return;
        };
        let distance = anchor_t_pre as i128 - min_time as i128 + 1;
        for id in to_shift {
            let e = self.elem_mut(id);
            let t = (e.t_pre as i128 + distance).max(1) as u64;
            e.set_t_without_not_executed(t);
        }
    }

    pub fn shift_concurrent_to_before(&mut self, anchor: ElemId) {
        self.shift_concurrent_or_after_to_after_starting_from(anchor, 0);
    }

    fn retain_where(&mut self, keep: impl Fn(ElemId, &Element) -> bool) {
        let arena = &self.arena;
        for ids in self.routines.values_mut() {
            ids.retain(|id| keep(*id, &arena[id.0]));
        }
    }

    /// Drop elements with `tSort >= t_min` that are concurrent with `anchor`.
    pub fn remove_concurrent(&mut self, anchor: ElemId, t_min: u64) {
        let anchor_elem = self.elem(anchor).clone();
        self.retain_where(|id, e| e.t_sort() < t_min || id == anchor || !is_concurrent_elem(e, &anchor_elem));
    }

    /// Drop elements with `tSort >= t_min` that are not HB-before `anchor`.
    pub fn remove_concurrent_or_after(&mut self, anchor: ElemId, t_min: u64) {
        let anchor_elem = self.elem(anchor).clone();
        self.retain_where(|id, e| e.t_sort() < t_min || id == anchor || is_before(e, &anchor_elem));
    }

    /// Truncate every routine at the first element with `tSort > t`.
    pub fn remove_later(&mut self, t: u64) {
        self.shorten_trace(t, true);
    }

    /// Truncate at `tSort > time` (`incl`) or `tSort >= time`.
    pub fn shorten_trace(&mut self, time: u64, incl: bool) {
        let arena = &self.arena;
        for ids in self.routines.values_mut() {
            let cut = ids.iter().position(|id| {
                let t = arena[id.0].t_sort();
                if incl {
                    t > time
                } else {
                    t >= time
                }
            });
            if let Some(cut) = cut {
                ids.truncate(cut);
            }
        }
    }

    pub fn shorten_routine(&mut self, routine: RoutineId, time: u64) {
        let arena = &self.arena;
        if let Some(ids) = self.routines.get_mut(&routine) {
            if let Some(cut) = ids.iter().position(|id| arena[id.0].t_sort() >= time) {
                ids.truncate(cut);
            }
        }
    }

    pub fn shorten_routine_index(&mut self, routine: RoutineId, index: usize, incl: bool) {
        if let Some(ids) = self.routines.get_mut(&routine) {
            let len = if incl { index + 1 } else { index };
            ids.truncate(len.min(ids.len()));
        }
    }

    pub fn remove_element(&mut self, id: ElemId) {
        self.retain_where(|x, _| x != id);
    }

    /// Re-link an element that an earlier truncation removed and keep its routine sorted.
    pub fn reinsert(&mut self, id: ElemId) {
        if self.contains(id) {
            return;
        }
        let routine = self.elem(id).routine;
        self.routines.entry(routine).or_default().push(id);
        self.sort_routines(&[routine]);
    }

    pub fn append_replay_marker(&mut self, t: u64, exit_code: i32) -> ElemId {
        self.push(Element::replay_marker(t, exit_code))
    }

    /// For each other routine, its last element concurrent with `anchor`.
    pub fn concurrent_latest_per_routine(&self, anchor: ElemId) -> BTreeMap<RoutineId, ElemId> {
        let anchor_elem = self.elem(anchor);
        let mut out = BTreeMap::new();
        for id in self.ids() {
            if id == anchor {
                continue;
            }
            let e = self.elem(id);
            if is_concurrent_elem(anchor_elem, e) {
                out.insert(e.routine, id);
            }
        }
        out
    }

    /// Adds and dones on `wg` recorded before `time`.
    pub fn nr_add_done_before(&self, wg: ObjectId, time: u64) -> (usize, usize) {
        let mut adds = 0;
        let mut dones = 0;
        for id in self.ids() {
            let e = self.elem(id);
            if let ElementKind::WaitGroup(op) = &e.kind {
                if op.id == wg && op.kind == WaitGroupKind::Change && e.t_pre < time {
                    if op.delta > 0 {
                        adds += 1;
                    } else if op.delta < 0 {
                        dones += 1;
                    }
                }
            }
        }
        (adds, dones)
    }

    /// Signals and broadcasts concurrent with a cond wait.
    pub fn concurrent_cond_ops(&self, wait: ElemId) -> ConcurrentCondOps {
        let wait_elem = self.elem(wait);
        let mut out = ConcurrentCondOps::default();
        for id in self.ids() {
            if id == wait {
                continue;
            }
            let e = self.elem(id);
            if let ElementKind::Cond { op, .. } = &e.kind {
                if !is_concurrent_elem(wait_elem, e) {
                    continue;
                }
                match op {
                    CondKind::Signal => out.signals.push(id),
                    CondKind::Broadcast => out.broadcasts.push(id),
                    CondKind::Wait => {}
                }
            }
        }
        out
    }

    pub fn set_t_sort_at_index(&mut self, routine: RoutineId, index: usize, t: u64) {
        if let Some(id) = self.routines.get(&routine).and_then(|ids| ids.get(index)).copied() {
            self.elem_mut(id).set_t_sort(t);
        }
    }

    /// Copy of the elements with `start <= tSort <= end`, grouped by routine.
    pub fn partial(&self, start: u64, end: u64) -> BTreeMap<RoutineId, Vec<ElemId>> {
        let mut out: BTreeMap<RoutineId, Vec<ElemId>> = BTreeMap::new();
        for (r, ids) in &self.routines {
            for id in ids {
                let t = self.elem(*id).t_sort();
                if t >= start && t <= end {
                    out.entry(*r).or_default().push(*id);
                }
            }
        }
        out
    }

    pub fn max_t_sort_executed(&self) -> u64 {
        self.ids()
            .map(|id| self.elem(id))
            .filter(|e| e.is_executed())
            .map(|e| e.t_post)
            .max()
            .unwrap_or(0)
    }
}

/// Per-routine cursors over a sorted trace.
#[derive(Debug, Clone, Default)]
pub struct TraceIterator {
    cursor: BTreeMap<RoutineId, usize>,
}

impl TraceIterator {
    pub fn new(trace: &Trace) -> Self {
        Self {
            cursor: trace.routine_ids().map(|r| (r, 0)).collect(),
        }
    }

    pub fn reset(&mut self) {
        for v in self.cursor.values_mut() {
            *v = 0;
        }
    }

    pub fn next(&mut self, trace: &Trace) -> Option<ElemId> {
        self.next_where(trace, &BTreeSet::new())
    }

    /// Next element, ignoring routines in `paused`.
    pub fn next_where(&mut self, trace: &Trace, paused: &BTreeSet<RoutineId>) -> Option<ElemId> {
        let mut best: Option<(u64, RoutineId, ElemId)> = None;
        let mut first_blocked: Option<(RoutineId, ElemId)> = None;
        for (r, idx) in &self.cursor {
            if paused.contains(r) {
                continue;
            }
            let Some(id) = trace.routine(*r).get(*idx).copied() else {
                continue;
            };
            let e = trace.elem(id);
            if e.is_executed() {
                let key = (e.t_post, *r, id);
                if best.map(|b| (key.0, key.1) < (b.0, b.1)).unwrap_or(true) {
                    best = Some(key);
                }
            } else if first_blocked.is_none() {
                first_blocked = Some((*r, id));
            }
        }
        let (routine, id) = match best {
            Some((_, r, id)) => (r, id),
            None => first_blocked?,
        };
        self.increase_index(routine);
        Some(id)
    }

    pub fn increase_index(&mut self, routine: RoutineId) {
        *self.cursor.entry(routine).or_insert(0) += 1;
    }

    pub fn has_remaining(&self, trace: &Trace) -> bool {
        self.cursor
            .iter()
            .any(|(r, idx)| *idx < trace.routine(*r).len())
    }
}
