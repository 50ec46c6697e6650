//! Happens-before pass over a sorted trace and the detectors hooked into it.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::{
    is_concurrent, wall_time_iso_utc, AnalysisConfig, AnalysisSummary, AtomicKind, BugCode, CancelToken, ChannelDir,
    ChannelOp, CondKind, Config, DeadlockState, DetectorFlags, ElemId, ElementKind, Finding, HbResult, MutexKind, MutexOp,
    ObjectId, ReadOptions, ResultElem, ResultSet, RoutineId, RunInfo, SelectCaseRef, SeverityCounts, Trace, VectorClock,
    WaitGroupKind, WaitGroupOp,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Buffered operations of one routine are ordered FIFO.
    pub fifo: bool,
    /// Atomic loads do not sync with the last store.
    pub ignore_critical_sections: bool,
    /// Skip the HB pass: only exit-code bugs and stuck routines.
    pub only_actual: bool,
    pub detectors: DetectorFlags,
}

impl AnalysisOptions {
    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        Self {
            fifo: cfg.fifo,
            ignore_critical_sections: cfg.ignore_critical_sections,
            only_actual: false,
            detectors: cfg.detectors,
        }
    }
}

/// Where a flow mutation could delay an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Once,
    Mutex,
    Send,
    Recv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCandidate {
    pub kind: FlowKind,
    /// `file:line` of the operation.
    pub pos: String,
    /// Which execution of the operation at `pos` (1-based).
    pub counter: usize,
    #[serde(skip)]
    pub elem: Option<ElemId>,
}

/// Most recent send or receive of a routine on a channel. `case` is set for
/// the non-chosen cases of a select, which only could have communicated.
#[derive(Debug, Clone)]
pub(crate) struct LastOp {
    pub elem: ElemId,
    pub case: Option<usize>,
    pub vc: VectorClock,
}

#[derive(Debug, Clone)]
struct BufferSlot {
    oid: u64,
    vc: VectorClock,
}

/// `slots[..count]` are occupied in send order, the rest are free and carry
/// the clock of the receive that freed them.
#[derive(Debug, Clone, Default)]
struct BufferedChannel {
    slots: VecDeque<BufferSlot>,
    count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Weak,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Held,
}

/// Clocks and primitive tables of one pass.
#[derive(Debug, Default)]
struct PassState {
    width: usize,
    cvc: BTreeMap<RoutineId, VectorClock>,
    last_write: BTreeMap<ObjectId, VectorClock>,
    buffered: BTreeMap<ObjectId, BufferedChannel>,
    held: VecDeque<ElemId>,
    paused: BTreeSet<RoutineId>,
    visited: BTreeSet<ElemId>,
    rel_w: BTreeMap<ObjectId, VectorClock>,
    rel_r: BTreeMap<ObjectId, VectorClock>,
    last_change: BTreeMap<ObjectId, VectorClock>,
    waiting: BTreeMap<ObjectId, VecDeque<RoutineId>>,
    once_success: BTreeMap<ObjectId, VectorClock>,
    recv_last: BTreeMap<ObjectId, BTreeMap<RoutineId, VectorClock>>,
    send_last: BTreeMap<ObjectId, BTreeMap<RoutineId, VectorClock>>,
    close_vc: BTreeMap<ObjectId, VectorClock>,
}

impl PassState {
    /// Routines nobody forks start at one; forked ones inherit at the fork.
    fn new(trace: &Trace) -> Self {
        let width = trace.num_routines();
        let mut forked = BTreeSet::new();
        for id in trace.ids() {
            if let ElementKind::Fork { new_routine } = trace.elem(id).kind {
                forked.insert(new_routine);
            }
        }
        let mut cvc = BTreeMap::new();
        for r in trace.routine_ids() {
            let mut vc = VectorClock::new(width);
            if !forked.contains(&r) {
                vc.inc(r);
            }
            cvc.insert(r, vc);
        }
        Self {
            width,
            cvc,
            ..Self::default()
        }
    }
}

pub struct Analyzer {
    opts: AnalysisOptions,
    cancel: CancelToken,
    pass: Pass,
    state: PassState,

    // Strong-pass side tables read by the detectors.
    pub(crate) close_op: BTreeMap<ObjectId, ElemId>,
    pub(crate) closes: Vec<ElemId>,
    pub(crate) last_send: BTreeMap<ObjectId, BTreeMap<RoutineId, LastOp>>,
    pub(crate) last_recv: BTreeMap<ObjectId, BTreeMap<RoutineId, LastOp>>,
    pub(crate) last_acquire: BTreeMap<ObjectId, ElemId>,
    holder: BTreeMap<ObjectId, ElemId>,
    pub(crate) all_locks: BTreeMap<(ObjectId, bool), Vec<ElemId>>,
    pub(crate) all_unlocks: BTreeMap<(ObjectId, bool), Vec<ElemId>>,
    pub(crate) wg_adds: BTreeMap<ObjectId, Vec<ElemId>>,
    pub(crate) wg_dones: BTreeMap<ObjectId, Vec<ElemId>>,
    pub(crate) forks: BTreeMap<RoutineId, ElemId>,
    pub(crate) leaking: BTreeMap<ObjectId, Vec<crate::LeakEntry>>,
    pub(crate) select_cases: Vec<SelectCaseRef>,
    pub(crate) deadlock: DeadlockState,
    occurrences: BTreeMap<String, usize>,
    pub(crate) flow: Vec<FlowCandidate>,
    pub(crate) cases_with_partner: usize,

    pub(crate) results: ResultSet,
    pub(crate) diagnostics: Vec<String>,
}

impl Analyzer {
    pub fn new(opts: AnalysisOptions) -> Self {
        Self {
            opts,
            cancel: CancelToken::new(),
            pass: Pass::Strong,
            state: PassState::default(),
            close_op: BTreeMap::new(),
            closes: Vec::new(),
            last_send: BTreeMap::new(),
            last_recv: BTreeMap::new(),
            last_acquire: BTreeMap::new(),
            holder: BTreeMap::new(),
            all_locks: BTreeMap::new(),
            all_unlocks: BTreeMap::new(),
            wg_adds: BTreeMap::new(),
            wg_dones: BTreeMap::new(),
            forks: BTreeMap::new(),
            leaking: BTreeMap::new(),
            select_cases: Vec::new(),
            deadlock: DeadlockState::default(),
            occurrences: BTreeMap::new(),
            flow: Vec::new(),
            cases_with_partner: 0,
            results: ResultSet::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.opts
    }

    pub(crate) fn detectors(&self) -> DetectorFlags {
        self.opts.detectors
    }

    /// Drop every result and table of the previous run.
    pub fn clear(&mut self) {
        let opts = self.opts;
        let cancel = self.cancel.clone();
        *self = Self::new(opts);
        self.cancel = cancel;
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn take_results(&mut self) -> ResultSet {
        std::mem::take(&mut self.results)
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn flow_candidates(&self) -> &[FlowCandidate] {
        &self.flow
    }

    /// Distinct `(select position, case)` pairs with a feasible partner.
    pub fn cases_with_partner(&self) -> usize {
        self.cases_with_partner
    }

    /// Fill `vc`/`wvc` of every element and run the enabled detectors.
    pub fn run(&mut self, trace: &mut Trace, info: &RunInfo) -> HbResult<()> {
        self.clear();
        let out = self.run_inner(trace, info);
        if out.is_err() {
            self.clear();
        }
        out
    }

    fn run_inner(&mut self, trace: &mut Trace, info: &RunInfo) -> HbResult<()> {
        self.exit_code_findings(info, self.opts.only_actual);
        if self.opts.only_actual {
            self.check_stuck_routines(trace);
            return Ok(());
        }

        self.run_pass(trace, Pass::Weak)?;
        self.run_pass(trace, Pass::Strong)?;
        trace.set_hb_was_calc(true);
        tracing::debug!("hb pass finished over {} elements", trace.len());

        let det = self.detectors();
        if det.send_on_closed || det.recv_on_closed {
            self.recheck_closed_channels(trace);
        }
        self.check_select_partners(trace);
        self.cancel.check()?;

        if det.leak {
            self.check_pending_leaks(trace);
            self.check_stuck_routines(trace);
        }
        self.cancel.check()?;
        if det.negative_wait_group {
            self.check_done_before_add(trace);
        }
        self.cancel.check()?;
        if det.resource_deadlock {
            self.check_resource_deadlock(trace);
        }
        self.cancel.check()?;
        if det.unlock_before_lock {
            self.check_unlock_before_lock(trace);
        }
        Ok(())
    }

    fn run_pass(&mut self, trace: &mut Trace, pass: Pass) -> HbResult<()> {
        self.pass = pass;
        self.state = PassState::new(trace);
        let mut it = trace.iter();
        loop {
            self.cancel.check()?;
            let mut peek = it.clone();
            let next = peek.next_where(trace, &self.state.paused);
            let next_blocked = next.map(|id| !trace.elem(id).is_executed()).unwrap_or(true);
            if next_blocked && !self.state.held.is_empty() {
                self.force_held(trace);
                continue;
            }
            let Some(id) = next else {
                break;
            };
            it = peek;
            if self.state.visited.contains(&id) {
                continue;
            }
            self.visit(trace, id);
        }
        Ok(())
    }

    pub(crate) fn strong(&self) -> bool {
        self.pass == Pass::Strong
    }

    pub(crate) fn current(&self, routine: RoutineId) -> VectorClock {
        self.state
            .cvc
            .get(&routine)
            .cloned()
            .unwrap_or_else(|| VectorClock::new(self.state.width))
    }

    fn clock_mut(&mut self, routine: RoutineId) -> &mut VectorClock {
        let width = self.state.width;
        self.state.cvc.entry(routine).or_insert_with(|| VectorClock::new(width))
    }

    pub(crate) fn inc(&mut self, routine: RoutineId) {
        self.clock_mut(routine).inc(routine);
    }

    pub(crate) fn sync_with(&mut self, routine: RoutineId, other: &VectorClock) {
        self.clock_mut(routine).sync(other);
    }

    pub(crate) fn record_close_vc(&mut self, chan: ObjectId, vc: VectorClock) {
        self.state.close_vc.insert(chan, vc);
    }

    pub(crate) fn sync_with_close(&mut self, routine: RoutineId, chan: ObjectId) {
        if let Some(close) = self.state.close_vc.get(&chan).cloned() {
            self.sync_with(routine, &close);
        }
    }

    /// Store the routine's current clock on the element.
    pub(crate) fn stamp(&self, trace: &mut Trace, id: ElemId) {
        let routine = trace.elem(id).routine;
        let vc = self.current(routine);
        let e = trace.elem_mut(id);
        match self.pass {
            Pass::Weak => e.wvc = Some(vc),
            Pass::Strong => e.vc = Some(vc),
        }
    }

    pub(crate) fn elem_vc(trace: &Trace, id: ElemId) -> VectorClock {
        trace.elem(id).vc.clone().unwrap_or_default()
    }

    fn mark_visited(&mut self, trace: &Trace, id: ElemId) {
        self.state.visited.insert(id);
        if !self.strong() {
            return;
        }
        if let Some(pos) = &trace.elem(id).pos {
            *self.occurrences.entry(pos.to_string()).or_insert(0) += 1;
        }
    }

    pub(crate) fn report(&mut self, code: BugCode, arg1: Vec<ResultElem>, arg2: Vec<ResultElem>) {
        let finding = Finding::new(code, arg1, arg2);
        let key = finding.short_key();
        if self.results.push(finding) {
            tracing::debug!("found {code}: {key}");
        }
    }

    pub(crate) fn last_op_elem(trace: &Trace, last: &LastOp) -> ResultElem {
        let e = trace.elem(last.elem);
        match last.case {
            Some(case) => ResultElem::from_select_case(last.elem, e, case),
            None => ResultElem::from_element(last.elem, e),
        }
    }

    fn push_flow(&mut self, trace: &Trace, id: ElemId, kind: FlowKind) {
        let pos = trace.elem(id).pos_string();
        let counter = self.occurrences.get(&pos).copied().unwrap_or(1);
        self.flow.push(FlowCandidate {
            kind,
            pos,
            counter,
            elem: Some(id),
        });
    }

    fn visit(&mut self, trace: &mut Trace, id: ElemId) {
        self.mark_visited(trace, id);
        let kind = trace.elem(id).kind.clone();
        match &kind {
            ElementKind::Atomic { id: obj, op } => self.update_atomic(trace, id, *obj, *op),
            ElementKind::Channel(op) => {
                if self.update_channel(trace, id, op) == Step::Held {
                    self.hold(trace, id);
                }
            }
            ElementKind::Select(_) => self.update_select(trace, id),
            ElementKind::Mutex(op) => self.update_mutex(trace, id, op),
            ElementKind::WaitGroup(op) => self.update_wait_group(trace, id, op),
            ElementKind::Cond { id: obj, op } => self.update_cond(trace, id, *obj, *op),
            ElementKind::Once { id: obj, success } => self.update_once(trace, id, *obj, *success),
            ElementKind::Fork { new_routine } => self.update_fork(trace, id, *new_routine),
            ElementKind::RoutineEnd | ElementKind::New { .. } | ElementKind::ReplayMarker { .. } => {
                self.stamp(trace, id);
            }
        }

        if !self.strong() {
            return;
        }
        if matches!(kind, ElementKind::Mutex(_)) && self.detectors().resource_deadlock {
            self.deadlock_event(trace, id);
        }
        if !trace.elem(id).is_executed() {
            self.blocked_flow_candidate(trace, id);
            if self.detectors().leak {
                self.check_leak(trace, id);
            }
        }
    }

    fn update_atomic(&mut self, trace: &mut Trace, id: ElemId, obj: ObjectId, op: AtomicKind) {
        let routine = trace.elem(id).routine;
        if op.reads() && !self.opts.ignore_critical_sections {
            if let Some(lw) = self.state.last_write.get(&obj).cloned() {
                self.sync_with(routine, &lw);
            }
        }
        self.stamp(trace, id);
        if op.writes() {
            let vc = self.current(routine);
            self.state.last_write.insert(obj, vc);
        }
        self.inc(routine);
    }

    fn update_channel(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) -> Step {
        let routine = trace.elem(id).routine;
        if op.dir == ChannelDir::Close {
            self.update_close(trace, id, op);
            return Step::Done;
        }
        if !trace.elem(id).is_executed() || op.id == -1 {
            self.stamp(trace, id);
            self.inc(routine);
            return Step::Done;
        }
        if op.closed {
            match op.dir {
                ChannelDir::Send => self.send_on_closed(trace, id, op),
                _ => self.recv_on_closed(trace, id, op),
            }
            return Step::Done;
        }
        if op.is_buffered() {
            let done = match op.dir {
                ChannelDir::Send => self.buffered_send(trace, id, op),
                _ => self.buffered_recv(trace, id, op),
            };
            if !done {
                return Step::Held;
            }
            self.drain_held(trace, op.id);
            return Step::Done;
        }
        self.unbuffered(trace, id, op);
        Step::Done
    }

    fn record_last(&mut self, dir: ChannelDir, chan: ObjectId, routine: RoutineId, last: LastOp) {
        if !self.strong() {
            let table = match dir {
                ChannelDir::Send => &mut self.state.send_last,
                _ => &mut self.state.recv_last,
            };
            table.entry(chan).or_default().insert(routine, last.vc);
            return;
        }
        let table = match dir {
            ChannelDir::Send => &mut self.last_send,
            _ => &mut self.last_recv,
        };
        table.entry(chan).or_default().insert(routine, last);
    }

    fn last_vc(&self, dir: ChannelDir, chan: ObjectId, routine: RoutineId) -> Option<VectorClock> {
        if self.strong() {
            let table = match dir {
                ChannelDir::Send => &self.last_send,
                _ => &self.last_recv,
            };
            table.get(&chan)?.get(&routine).map(|l| l.vc.clone())
        } else {
            let table = match dir {
                ChannelDir::Send => &self.state.send_last,
                _ => &self.state.recv_last,
            };
            table.get(&chan)?.get(&routine).cloned()
        }
    }

    fn unbuffered(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) {
        let routine = trace.elem(id).routine;
        let partner = op
            .partner
            .filter(|p| trace.contains(*p) && !self.state.visited.contains(p))
            .filter(|p| trace.elem(*p).routine != routine);
        let Some(partner) = partner else {
            self.stamp(trace, id);
            self.inc(routine);
            return;
        };
        self.mark_visited(trace, partner);
        let partner_routine = trace.elem(partner).routine;
        let (send, recv, send_r, recv_r) = match op.dir {
            ChannelDir::Send => (id, partner, routine, partner_routine),
            _ => (partner, id, partner_routine, routine),
        };

        let send_vc = self.current(send_r);
        self.sync_with(recv_r, &send_vc);
        let merged = self.current(recv_r);
        self.state.cvc.insert(send_r, merged.clone());
        self.stamp(trace, send);
        self.stamp(trace, recv);

        if self.strong() {
            self.check_concurrent_recv(trace, recv, op.id);
        }
        self.record_last(
            ChannelDir::Send,
            op.id,
            send_r,
            LastOp {
                elem: send,
                case: None,
                vc: merged.clone(),
            },
        );
        self.record_last(
            ChannelDir::Recv,
            op.id,
            recv_r,
            LastOp {
                elem: recv,
                case: None,
                vc: merged,
            },
        );
        self.inc(send_r);
        self.inc(recv_r);

        if trace.elem(partner).select().is_some() {
            self.finish_select(trace, partner);
        }
    }

    fn buffered_send(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) -> bool {
        let routine = trace.elem(id).routine;
        let width = self.state.width;
        let capacity = op.q_size as usize;
        let buf = self.state.buffered.entry(op.id).or_default();
        if buf.count >= capacity {
            return false;
        }
        if buf.slots.len() <= buf.count {
            buf.slots.push_back(BufferSlot {
                oid: 0,
                vc: VectorClock::new(width),
            });
        }
        let freed_by = buf.slots[buf.count].vc.clone();
        self.sync_with(routine, &freed_by);
        if self.opts.fifo {
            if let Some(last) = self.last_vc(ChannelDir::Send, op.id, routine) {
                self.sync_with(routine, &last);
            }
        }
        self.stamp(trace, id);
        let vc = self.current(routine);
        self.record_last(ChannelDir::Send, op.id, routine, LastOp { elem: id, case: None, vc });
        self.inc(routine);

        let after = self.current(routine);
        let buf = self.state.buffered.entry(op.id).or_default();
        let count = buf.count;
        if let Some(slot) = buf.slots.get_mut(count) {
            *slot = BufferSlot { oid: op.oid, vc: after };
        }
        buf.count += 1;
        true
    }

    fn buffered_recv(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) -> bool {
        let routine = trace.elem(id).routine;
        let buf = self.state.buffered.entry(op.id).or_default();
        if buf.count == 0 {
            return false;
        }
        let Some(pos) = buf.slots.iter().take(buf.count).position(|s| s.oid == op.oid) else {
            return false;
        };
        if pos != 0 {
            if let Some(slot) = buf.slots.remove(pos) {
                buf.slots.push_front(slot);
            }
        }
        let Some(head) = buf.slots.pop_front() else {
            return false;
        };
        buf.count -= 1;

        self.sync_with(routine, &head.vc);
        if self.opts.fifo {
            if let Some(last) = self.last_vc(ChannelDir::Recv, op.id, routine) {
                self.sync_with(routine, &last);
            }
        }
        self.stamp(trace, id);
        if self.strong() {
            self.check_concurrent_recv(trace, id, op.id);
        }
        let vc = self.current(routine);
        self.record_last(
            ChannelDir::Recv,
            op.id,
            routine,
            LastOp {
                elem: id,
                case: None,
                vc: vc.clone(),
            },
        );
        self.inc(routine);
        let buf = self.state.buffered.entry(op.id).or_default();
        buf.slots.push_back(BufferSlot { oid: 0, vc });
        true
    }

    fn hold(&mut self, trace: &Trace, id: ElemId) {
        let routine = trace.elem(id).routine;
        tracing::debug!("holding buffered operation {} of routine {routine}", trace.elem(id).tid());
        self.state.held.push_back(id);
        self.state.paused.insert(routine);
    }

    fn release(&mut self, trace: &Trace, id: ElemId) {
        self.state.held.retain(|h| *h != id);
        self.state.paused.remove(&trace.elem(id).routine);
    }

    /// Retry held operations on `chan` until none of them can proceed.
    fn drain_held(&mut self, trace: &mut Trace, chan: ObjectId) {
        loop {
            let candidates: Vec<ElemId> = self
                .state
                .held
                .iter()
                .copied()
                .filter(|h| trace.elem(*h).effective_channel().map(|op| op.id) == Some(chan))
                .collect();
            let mut progressed = false;
            for h in candidates {
                let Some(op) = trace.elem(h).effective_channel().cloned() else {
                    continue;
                };
                let done = match op.dir {
                    ChannelDir::Send => self.buffered_send(trace, h, &op),
                    _ => self.buffered_recv(trace, h, &op),
                };
                if done {
                    self.release(trace, h);
                    if trace.elem(h).select().is_some() {
                        self.finish_select(trace, h);
                    }
                    progressed = true;
                    break;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// No progress is possible otherwise: process the oldest held element as stuck.
    fn force_held(&mut self, trace: &mut Trace) {
        let Some(id) = self.state.held.pop_front() else {
            return;
        };
        let routine = trace.elem(id).routine;
        self.state.paused.remove(&routine);
        tracing::debug!("buffered operation {} never found its counterpart", trace.elem(id).tid());
        self.stamp(trace, id);
        self.inc(routine);
        if trace.elem(id).select().is_some() {
            self.finish_select(trace, id);
        }
    }

    fn update_select(&mut self, trace: &mut Trace, id: ElemId) {
        let routine = trace.elem(id).routine;
        let executed = trace.elem(id).is_executed();
        let chosen = trace
            .elem(id)
            .select()
            .and_then(|s| s.chosen_case())
            .map(|c| c.op.clone());
        match chosen {
            Some(op) if executed => {
                if self.update_channel(trace, id, &op) == Step::Held {
                    self.hold(trace, id);
                    return;
                }
            }
            _ => {
                self.stamp(trace, id);
                self.inc(routine);
            }
        }
        self.finish_select(trace, id);
    }

    /// Case bookkeeping once the select's clock is known.
    fn finish_select(&mut self, trace: &mut Trace, sel_id: ElemId) {
        let e = trace.elem(sel_id);
        let Some(sel) = e.select().cloned() else {
            return;
        };
        let routine = e.routine;
        let executed = e.is_executed();
        let vc = match self.pass {
            Pass::Weak => e.wvc.clone(),
            Pass::Strong => e.vc.clone(),
        }
        .unwrap_or_default();

        for (i, case) in sel.cases.iter().enumerate() {
            let chosen = executed && !sel.chosen_default && i as i64 == sel.chosen_index;
            if self.strong() {
                self.select_cases.push(SelectCaseRef {
                    sel: sel_id,
                    case: i,
                    chan: case.op.id,
                    dir: case.op.dir,
                    buffered: case.op.is_buffered(),
                    vc: vc.clone(),
                    chosen,
                });
            }
            if chosen || !executed || case.op.id == -1 || case.op.dir == ChannelDir::Close {
                continue;
            }
            if self.strong() {
                self.check_select_case_on_closed(trace, sel_id, i, &case.op, &vc);
            }
            self.record_last(
                case.op.dir,
                case.op.id,
                routine,
                LastOp {
                    elem: sel_id,
                    case: Some(i),
                    vc: vc.clone(),
                },
            );
        }
    }

    fn update_mutex(&mut self, trace: &mut Trace, id: ElemId, op: &MutexOp) {
        let routine = trace.elem(id).routine;
        if !trace.elem(id).is_executed() {
            self.stamp(trace, id);
            self.inc(routine);
            return;
        }
        let read = op.kind.is_read();
        match op.kind {
            MutexKind::Lock | MutexKind::RLock | MutexKind::TryLock | MutexKind::TryRLock => {
                if op.kind.is_try() && !op.success {
                    self.stamp(trace, id);
                    if self.strong() {
                        self.failed_try_lock_candidate(trace, id, op.id);
                    }
                    self.inc(routine);
                    return;
                }
                if self.strong() {
                    if let Some(w) = self.state.rel_w.get(&op.id).cloned() {
                        self.sync_with(routine, &w);
                    }
                    if !read {
                        if let Some(r) = self.state.rel_r.get(&op.id).cloned() {
                            self.sync_with(routine, &r);
                        }
                    }
                }
                self.stamp(trace, id);
                self.inc(routine);
                if self.strong() {
                    self.last_acquire.insert(op.id, id);
                    if !read {
                        self.holder.insert(op.id, id);
                    }
                    self.all_locks.entry((op.id, read)).or_default().push(id);
                }
            }
            MutexKind::Unlock => {
                self.stamp(trace, id);
                let vc = self.current(routine);
                self.state.rel_w.insert(op.id, vc.clone());
                self.state.rel_r.insert(op.id, vc);
                self.inc(routine);
                if self.strong() {
                    self.holder.remove(&op.id);
                    self.all_unlocks.entry((op.id, false)).or_default().push(id);
                }
            }
            MutexKind::RUnlock => {
                self.stamp(trace, id);
                let vc = self.current(routine);
                let width = self.state.width;
                self.state
                    .rel_r
                    .entry(op.id)
                    .or_insert_with(|| VectorClock::new(width))
                    .sync(&vc);
                self.inc(routine);
                if self.strong() {
                    self.all_unlocks.entry((op.id, true)).or_default().push(id);
                }
            }
        }
    }

    fn failed_try_lock_candidate(&mut self, trace: &Trace, id: ElemId, mutex: ObjectId) {
        let Some(holder) = self.holder.get(&mutex).copied() else {
            return;
        };
        let vc = Self::elem_vc(trace, id);
        if is_concurrent(&vc, &Self::elem_vc(trace, holder)) {
            self.push_flow(trace, id, FlowKind::Mutex);
        }
    }

    fn update_wait_group(&mut self, trace: &mut Trace, id: ElemId, op: &WaitGroupOp) {
        let routine = trace.elem(id).routine;
        let executed = trace.elem(id).is_executed();
        match op.kind {
            WaitGroupKind::Change => {
                self.stamp(trace, id);
                if executed && op.delta != 0 {
                    let vc = self.current(routine);
                    let width = self.state.width;
                    self.state
                        .last_change
                        .entry(op.id)
                        .or_insert_with(|| VectorClock::new(width))
                        .sync(&vc);
                    if self.strong() {
                        let bucket = if op.delta > 0 { &mut self.wg_adds } else { &mut self.wg_dones };
                        bucket.entry(op.id).or_default().push(id);
                    }
                }
                self.inc(routine);
            }
            WaitGroupKind::Wait => {
                if executed {
                    if let Some(change) = self.state.last_change.get(&op.id).cloned() {
                        self.sync_with(routine, &change);
                    }
                }
                self.stamp(trace, id);
                self.inc(routine);
            }
        }
    }

    fn update_cond(&mut self, trace: &mut Trace, id: ElemId, obj: ObjectId, op: CondKind) {
        let routine = trace.elem(id).routine;
        match op {
            CondKind::Wait => {
                if trace.elem(id).is_executed() {
                    self.state.waiting.entry(obj).or_default().push_back(routine);
                }
            }
            CondKind::Signal => {
                let vc = self.current(routine);
                if let Some(w) = self.state.waiting.get_mut(&obj).and_then(|q| q.pop_front()) {
                    self.sync_with(w, &vc);
                }
            }
            CondKind::Broadcast => {
                let vc = self.current(routine);
                let waiters: Vec<RoutineId> = self
                    .state
                    .waiting
                    .remove(&obj)
                    .map(|q| q.into_iter().collect())
                    .unwrap_or_default();
                for w in waiters {
                    self.sync_with(w, &vc);
                }
            }
        }
        self.stamp(trace, id);
        self.inc(routine);
    }

    fn update_once(&mut self, trace: &mut Trace, id: ElemId, obj: ObjectId, success: bool) {
        let routine = trace.elem(id).routine;
        if success {
            self.stamp(trace, id);
            let vc = self.current(routine);
            self.state.once_success.insert(obj, vc);
        } else {
            if let Some(succ) = self.state.once_success.get(&obj).cloned() {
                let before = self.current(routine);
                self.sync_with(routine, &succ);
                self.stamp(trace, id);
                if self.strong() && is_concurrent(&before, &succ) {
                    self.push_flow(trace, id, FlowKind::Once);
                }
            } else {
                self.stamp(trace, id);
            }
        }
        self.inc(routine);
    }

    fn update_fork(&mut self, trace: &mut Trace, id: ElemId, new_routine: RoutineId) {
        let routine = trace.elem(id).routine;
        self.stamp(trace, id);
        let vc = self.current(routine);
        self.state.cvc.insert(new_routine, vc);
        self.inc(routine);
        self.inc(new_routine);
        if self.strong() {
            self.forks.insert(new_routine, id);
        }
    }

    fn blocked_flow_candidate(&mut self, trace: &Trace, id: ElemId) {
        let e = trace.elem(id);
        let Some(op) = e.channel() else {
            return;
        };
        let (table, kind) = match op.dir {
            ChannelDir::Send => (&self.last_send, FlowKind::Send),
            ChannelDir::Recv => (&self.last_recv, FlowKind::Recv),
            ChannelDir::Close => return,
        };
        let vc = Self::elem_vc(trace, id);
        let hit = table.get(&op.id).is_some_and(|per_routine| {
            per_routine
                .iter()
                .any(|(r, last)| *r != e.routine && last.case.is_none() && is_concurrent(&vc, &last.vc))
        });
        if hit {
            self.push_flow(trace, id, kind);
        }
    }
}

/// Outcome of analysing one trace directory.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub summary: AnalysisSummary,
    pub trace: Trace,
    pub info: RunInfo,
    pub results: ResultSet,
    pub flow: Vec<FlowCandidate>,
    pub cases_with_partner: usize,
    /// Machine and readable result files, when written.
    pub result_files: Option<(PathBuf, PathBuf)>,
}

/// Read `dir`, analyse it and, if `write_results`, drop the result files next to it.
pub fn analyze_trace_dir(
    dir: &Path,
    config: &Config,
    opts: AnalysisOptions,
    cancel: &CancelToken,
    write_results: bool,
) -> HbResult<AnalysisReport> {
    let started = Instant::now();
    let started_at = wall_time_iso_utc();
    let read = crate::read_trace_dir(
        dir,
        ReadOptions {
            ignore_atomics: config.analysis.ignore_atomics,
        },
    )?;
    let mut trace = read.trace;
    let info = read.info;

    let mut analyzer = Analyzer::new(opts).with_cancel(cancel.clone());
    analyzer.run(&mut trace, &info)?;
    let results = analyzer.take_results();

    let result_files = if write_results {
        Some(crate::write_results(&results, dir)?)
    } else {
        None
    };

    let mut diagnostics = analyzer.diagnostics().to_vec();
    if read.skipped > 0 {
        diagnostics.push(format!("skipped {} malformed records", read.skipped));
    }
    let summary = AnalysisSummary {
        run_id: uuid::Uuid::new_v4().to_string(),
        trace_dir: dir.display().to_string(),
        started_at,
        finished_at: wall_time_iso_utc(),
        duration_ms: started.elapsed().as_millis() as u64,
        elements: trace.len(),
        routines: trace.num_routines(),
        exit_code: (info.exit_code != 0).then_some(info.exit_code),
        counts: SeverityCounts::from_findings(results.findings()),
        findings: results.findings().to_vec(),
        diagnostics,
    };
    tracing::info!(
        "analysed {}: {} findings ({} critical)",
        dir.display(),
        results.len(),
        summary.counts.critical
    );
    Ok(AnalysisReport {
        summary,
        trace,
        info,
        results,
        flow: analyzer.flow_candidates().to_vec(),
        cases_with_partner: analyzer.cases_with_partner(),
        result_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{happens_before, read_routine, HbRelation};

    fn analyze_with(opts: AnalysisOptions, routines: &[&str]) -> (Trace, Analyzer) {
        let mut trace = Trace::new();
        for (i, content) in routines.iter().enumerate() {
            read_routine(&mut trace, i as u32 + 1, content, ReadOptions::default());
        }
        trace.sort();
        trace.link_partners();
        let mut analyzer = Analyzer::new(opts);
        analyzer.run(&mut trace, &RunInfo::default()).expect("analysis");
        (trace, analyzer)
    }

    fn analyze(routines: &[&str]) -> (Trace, Analyzer) {
        analyze_with(AnalysisOptions::default(), routines)
    }

    fn vc(trace: &Trace, routine: RoutineId, idx: usize) -> VectorClock {
        trace.elem(trace.routine(routine)[idx]).vc.clone().expect("strong clock")
    }

    fn wvc(trace: &Trace, routine: RoutineId, idx: usize) -> VectorClock {
        trace.elem(trace.routine(routine)[idx]).wvc.clone().expect("weak clock")
    }

    const FORK_SEND_LOCK: [&str; 2] = [
        "G,1,2,m.go:1\nC,2,3,4,S,f,1,0,0,m.go:2\nM,5,6,7,-,L,t,m.go:3\nM,7,8,7,-,U,t,m.go:4\nE,20",
        "C,2,3,4,R,f,1,0,0,w.go:1\nM,9,10,7,-,L,t,w.go:2\nM,11,12,7,-,U,t,w.go:3\nE,21",
    ];

    #[test]
    fn every_executed_element_counts_its_own_routine() {
        let (trace, _) = analyze(&FORK_SEND_LOCK);
        for id in trace.ids() {
            let e = trace.elem(id);
            assert!(e.is_executed());
            let strong = e.vc.as_ref().expect("strong clock");
            let weak = e.wvc.as_ref().expect("weak clock");
            assert!(strong.get(e.routine) > 0, "{} has {strong}", e.tid());
            assert!(weak.get(e.routine) > 0, "{} has {weak}", e.tid());
        }
    }

    #[test]
    fn forked_routine_starts_after_the_fork() {
        let (trace, _) = analyze(&FORK_SEND_LOCK);
        let fork = vc(&trace, 1, 0);
        let first = vc(&trace, 2, 0);
        assert!(first.ge(&fork));
        assert_eq!(happens_before(&fork, &first), HbRelation::Before);
    }

    #[test]
    fn unbuffered_pair_shares_one_clock() {
        let (trace, _) = analyze(&FORK_SEND_LOCK);
        assert_eq!(vc(&trace, 1, 1), vc(&trace, 2, 0));
        assert_eq!(wvc(&trace, 1, 1), wvc(&trace, 2, 0));
        assert_eq!(vc(&trace, 1, 1), VectorClock::from_values(vec![2, 1]));
    }

    #[test]
    fn mutex_orders_only_the_strong_pass() {
        let (trace, _) = analyze(&FORK_SEND_LOCK);
        let unlock = (vc(&trace, 1, 3), wvc(&trace, 1, 3));
        let lock = (vc(&trace, 2, 1), wvc(&trace, 2, 1));
        assert_eq!(happens_before(&unlock.0, &lock.0), HbRelation::Before);
        assert!(is_concurrent(&unlock.1, &lock.1));
    }

    #[test]
    fn buffered_sends_precede_their_receives() {
        let (trace, _) = analyze(&[
            "C,1,2,4,S,f,1,2,1,m.go:1\nC,3,4,4,S,f,2,2,2,m.go:2\nE,10",
            "C,5,6,4,R,f,1,2,1,w.go:1\nC,7,8,4,R,f,2,2,0,w.go:2\nE,11",
        ]);
        for i in 0..2 {
            let send = vc(&trace, 1, i);
            let recv = vc(&trace, 2, i);
            assert_eq!(happens_before(&send, &recv), HbRelation::Before, "message {i}");
        }
        assert_eq!(vc(&trace, 2, 1), VectorClock::from_values(vec![3, 2]));
    }

    #[test]
    fn held_receive_drains_after_its_send() {
        let (trace, _) = analyze(&["C,5,6,4,S,f,1,1,1,m.go:1\nE,10", "C,1,2,4,R,f,1,1,0,w.go:1\nE,11"]);
        let send = vc(&trace, 1, 0);
        let recv = vc(&trace, 2, 0);
        assert_eq!(happens_before(&send, &recv), HbRelation::Before);
        assert_eq!(recv, VectorClock::from_values(vec![2, 1]));
        assert_eq!(happens_before(&wvc(&trace, 1, 0), &wvc(&trace, 2, 0)), HbRelation::Before);
        assert!(vc(&trace, 2, 1).ge(&recv));
    }

    #[test]
    fn read_locks_sync_with_writers_not_each_other() {
        let (trace, _) = analyze(&[
            "M,1,2,3,R,L,t,a.go:1\nM,3,4,3,R,U,t,a.go:2\nM,13,14,3,R,L,t,a.go:3\nM,15,16,3,R,U,t,a.go:4\nE,30",
            "M,5,6,3,R,R,t,b.go:1\nM,9,10,3,R,N,t,b.go:2\nE,31",
            "M,7,8,3,R,R,t,c.go:1\nM,11,12,3,R,N,t,c.go:2\nE,32",
        ]);
        let unlock = vc(&trace, 1, 1);
        let relock = vc(&trace, 1, 2);
        let (rlock2, runlock2) = (vc(&trace, 2, 0), vc(&trace, 2, 1));
        let (rlock3, runlock3) = (vc(&trace, 3, 0), vc(&trace, 3, 1));

        assert_eq!(happens_before(&unlock, &rlock2), HbRelation::Before);
        assert_eq!(happens_before(&unlock, &rlock3), HbRelation::Before);
        assert!(is_concurrent(&rlock2, &rlock3));
        assert_eq!(happens_before(&runlock2, &relock), HbRelation::Before);
        assert_eq!(happens_before(&runlock3, &relock), HbRelation::Before);
        assert_eq!(relock, VectorClock::from_values(vec![3, 2, 2]));
    }

    #[test]
    fn failed_once_syncs_with_the_successful_call() {
        let (trace, a) = analyze(&["O,1,2,6,t,a.go:1\nE,20", "O,3,4,6,f,b.go:1\nE,21"]);
        let success = vc(&trace, 1, 0);
        let failed = vc(&trace, 2, 0);
        assert_eq!(happens_before(&success, &failed), HbRelation::Before);
        assert_eq!(failed, VectorClock::from_values(vec![1, 1]));
        let flow = a.flow_candidates();
        assert_eq!(flow.len(), 1);
        assert_eq!(flow[0].kind, FlowKind::Once);
        assert_eq!(flow[0].pos, "b.go:1");
    }

    #[test]
    fn signal_wakes_only_the_oldest_waiter() {
        let (trace, _) = analyze(&[
            "D,1,2,8,W,a.go:1\nE,30",
            "D,3,4,8,W,b.go:1\nE,31",
            "D,5,6,8,S,c.go:1\nE,32",
        ]);
        let signal = vc(&trace, 3, 0);
        assert_eq!(happens_before(&signal, &vc(&trace, 1, 1)), HbRelation::Before);
        assert!(is_concurrent(&signal, &vc(&trace, 2, 1)));
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let (trace, _) = analyze(&[
            "D,1,2,8,W,a.go:1\nE,30",
            "D,3,4,8,W,b.go:1\nE,31",
            "D,5,6,8,B,c.go:1\nE,32",
        ]);
        let broadcast = vc(&trace, 3, 0);
        assert_eq!(happens_before(&broadcast, &vc(&trace, 1, 1)), HbRelation::Before);
        assert_eq!(happens_before(&broadcast, &vc(&trace, 2, 1)), HbRelation::Before);
    }

    #[test]
    fn atomic_load_syncs_with_the_last_store() {
        let routines = ["A,1,9,S,a.go:1\nE,20", "A,2,9,L,b.go:1\nE,21"];
        let (trace, _) = analyze(&routines);
        assert_eq!(happens_before(&vc(&trace, 1, 0), &vc(&trace, 2, 0)), HbRelation::Before);

        let opts = AnalysisOptions {
            ignore_critical_sections: true,
            ..AnalysisOptions::default()
        };
        let (trace, _) = analyze_with(opts, &routines);
        assert!(is_concurrent(&vc(&trace, 1, 0), &vc(&trace, 2, 0)));
    }
}
