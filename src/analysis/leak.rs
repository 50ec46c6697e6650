//! Blocked operations at the end of the run, with a possible partner where
//! one existed.

use std::collections::BTreeMap;

use crate::{
    happens_before, is_concurrent, Analyzer, BugCode, ChannelDir, ChannelOp, CondKind, ElemId, ElementKind,
    HbRelation, ObjectId, ResultElem, RoutineId, SelectCaseRef, SelectOp, Trace, VectorClock, WaitGroupKind,
};

/// A blocked channel operation (or one case of a blocked select) still
/// waiting for a partner.
#[derive(Debug, Clone)]
pub(crate) struct LeakEntry {
    pub elem: ElemId,
    pub case: Option<usize>,
    pub dir: ChannelDir,
    pub buffered: bool,
    pub vc: VectorClock,
}

fn opposite(dir: ChannelDir) -> ChannelDir {
    match dir {
        ChannelDir::Send => ChannelDir::Recv,
        _ => ChannelDir::Send,
    }
}

/// Could the select case `c` have unblocked `entry`?
fn case_accepts(entry: &LeakEntry, c: &SelectCaseRef) -> bool {
    match happens_before(&entry.vc, &c.vc) {
        HbRelation::Concurrent => true,
        HbRelation::Before => entry.buffered && entry.dir == ChannelDir::Send,
        HbRelation::After => entry.buffered && entry.dir == ChannelDir::Recv,
    }
}

fn plain_codes(buffered: bool) -> (BugCode, BugCode) {
    if buffered {
        (BugCode::L03, BugCode::L04)
    } else {
        (BugCode::L01, BugCode::L02)
    }
}

impl Analyzer {
    /// Called for every element that never finished.
    pub(crate) fn check_leak(&mut self, trace: &Trace, id: ElemId) {
        let e = trace.elem(id);
        let stuck = ResultElem::from_element(id, e);
        match &e.kind {
            ElementKind::Channel(op) if op.dir != ChannelDir::Close => {
                if op.id == -1 {
                    self.report(BugCode::L05, vec![stuck], vec![]);
                } else {
                    let op = op.clone();
                    self.leak_channel(trace, id, &op);
                }
            }
            ElementKind::Select(sel) => {
                let sel = sel.clone();
                self.leak_select(trace, id, &sel);
            }
            ElementKind::Mutex(op) if op.kind.is_acquire() => {
                let last = self
                    .last_acquire
                    .get(&op.id)
                    .map(|l| vec![ResultElem::from_element(*l, trace.elem(*l))])
                    .unwrap_or_default();
                self.report(BugCode::L08, vec![stuck], last);
            }
            ElementKind::WaitGroup(op) if op.kind == WaitGroupKind::Wait => {
                self.report(BugCode::L09, vec![stuck], vec![]);
            }
            ElementKind::Cond { op: CondKind::Wait, .. } => {
                self.report(BugCode::L10, vec![stuck], vec![]);
            }
            ElementKind::Once { .. } => {
                self.report(BugCode::L00, vec![stuck], vec![]);
            }
            _ => {}
        }
    }

    /// Last operation of another routine that could have completed a blocked
    /// operation in direction `dir`.
    fn concurrent_partner(
        &self,
        trace: &Trace,
        chan: ObjectId,
        dir: ChannelDir,
        routine: RoutineId,
        vc: &VectorClock,
    ) -> Option<ResultElem> {
        let table = match dir {
            ChannelDir::Send => &self.last_recv,
            ChannelDir::Recv => &self.last_send,
            ChannelDir::Close => return None,
        };
        let found = table
            .get(&chan)
            .and_then(|m| m.iter().find(|(r, last)| **r != routine && is_concurrent(vc, &last.vc)))
            .map(|(_, last)| Self::last_op_elem(trace, last));
        if found.is_some() {
            return found;
        }
        if dir == ChannelDir::Recv {
            let close = self.close_op.get(&chan).copied()?;
            if is_concurrent(vc, &Self::elem_vc(trace, close)) {
                return Some(ResultElem::from_element(close, trace.elem(close)));
            }
        }
        None
    }

    /// Remove and return a pending leak that could pair with the operation.
    /// A select is retired with all of its cases.
    fn take_pending_partner(
        &mut self,
        trace: &Trace,
        chan: ObjectId,
        dir: ChannelDir,
        routine: RoutineId,
        vc: &VectorClock,
    ) -> Option<LeakEntry> {
        let entries = self.leaking.get_mut(&chan)?;
        let pos = entries.iter().position(|p| {
            p.dir == opposite(dir) && trace.elem(p.elem).routine != routine && is_concurrent(vc, &p.vc)
        })?;
        let entry = entries.remove(pos);
        if entry.case.is_some() {
            for list in self.leaking.values_mut() {
                list.retain(|p| p.elem != entry.elem);
            }
        }
        Some(entry)
    }

    fn pending_elem(trace: &Trace, entry: &LeakEntry) -> ResultElem {
        let e = trace.elem(entry.elem);
        match entry.case {
            Some(case) => ResultElem::from_select_case(entry.elem, e, case),
            None => ResultElem::from_element(entry.elem, e),
        }
    }

    fn leak_channel(&mut self, trace: &Trace, id: ElemId, op: &ChannelOp) {
        let e = trace.elem(id);
        let routine = e.routine;
        let vc = Self::elem_vc(trace, id);
        let stuck = ResultElem::from_element(id, e);
        let (_, with_partner) = plain_codes(op.is_buffered());

        if let Some(partner) = self.concurrent_partner(trace, op.id, op.dir, routine, &vc) {
            self.report(with_partner, vec![stuck], vec![partner]);
            return;
        }
        if let Some(entry) = self.take_pending_partner(trace, op.id, op.dir, routine, &vc) {
            let pending = Self::pending_elem(trace, &entry);
            if entry.case.is_some() {
                self.report(BugCode::L06, vec![pending], vec![stuck]);
            } else {
                self.report(with_partner, vec![stuck], vec![pending]);
            }
            return;
        }
        self.leaking.entry(op.id).or_default().push(LeakEntry {
            elem: id,
            case: None,
            dir: op.dir,
            buffered: op.is_buffered(),
            vc,
        });
    }

    fn leak_select(&mut self, trace: &Trace, id: ElemId, sel: &SelectOp) {
        let e = trace.elem(id);
        let routine = e.routine;
        let vc = Self::elem_vc(trace, id);
        let live: Vec<(usize, &ChannelOp)> = sel
            .cases
            .iter()
            .enumerate()
            .filter(|(_, c)| c.op.id != -1 && c.op.dir != ChannelDir::Close)
            .map(|(i, c)| (i, &c.op))
            .collect();
        if live.is_empty() {
            self.report(BugCode::L07, vec![ResultElem::from_element(id, e)], vec![]);
            return;
        }

        for (i, op) in &live {
            if let Some(partner) = self.concurrent_partner(trace, op.id, op.dir, routine, &vc) {
                self.report(BugCode::L06, vec![ResultElem::from_select_case(id, e, *i)], vec![partner]);
                return;
            }
        }
        for (i, op) in &live {
            if let Some(entry) = self.take_pending_partner(trace, op.id, op.dir, routine, &vc) {
                let pending = Self::pending_elem(trace, &entry);
                self.report(BugCode::L06, vec![ResultElem::from_select_case(id, e, *i)], vec![pending]);
                return;
            }
        }
        for (i, op) in live {
            self.leaking.entry(op.id).or_default().push(LeakEntry {
                elem: id,
                case: Some(i),
                dir: op.dir,
                buffered: op.is_buffered(),
                vc: vc.clone(),
            });
        }
    }

    /// Leaks still pending after the pass, checked against every select case.
    pub(crate) fn check_pending_leaks(&mut self, trace: &Trace) {
        let leaking = std::mem::take(&mut self.leaking);
        let mut selects: BTreeMap<ElemId, Option<(usize, ResultElem)>> = BTreeMap::new();

        for (chan, entries) in &leaking {
            for entry in entries {
                let partner = self
                    .select_cases
                    .iter()
                    .find(|c| {
                        c.chan == *chan && c.sel != entry.elem && c.dir == opposite(entry.dir) && case_accepts(entry, c)
                    })
                    .map(|c| ResultElem::from_select_case(c.sel, trace.elem(c.sel), c.case));
                match entry.case {
                    None => {
                        let stuck = ResultElem::from_element(entry.elem, trace.elem(entry.elem));
                        let (without, with) = plain_codes(entry.buffered);
                        match partner {
                            Some(p) => self.report(with, vec![stuck], vec![p]),
                            None => self.report(without, vec![stuck], vec![]),
                        }
                    }
                    Some(case) => {
                        let slot = selects.entry(entry.elem).or_insert(None);
                        if slot.is_none() {
                            *slot = partner.map(|p| (case, p));
                        }
                    }
                }
            }
        }

        for (sel, found) in selects {
            let e = trace.elem(sel);
            match found {
                Some((case, partner)) => {
                    self.report(BugCode::L06, vec![ResultElem::from_select_case(sel, e, case)], vec![partner])
                }
                None => self.report(BugCode::L07, vec![ResultElem::from_element(sel, e)], vec![]),
            }
        }
    }

    /// Routines that neither finished nor ended blocked: the program exited
    /// while they were still running.
    pub(crate) fn check_stuck_routines(&mut self, trace: &Trace) {
        for routine in trace.routine_ids().collect::<Vec<_>>() {
            let ids = trace.routine(routine);
            let Some(last) = ids.last().copied() else {
                continue;
            };
            let e = trace.elem(last);
            if matches!(e.kind, ElementKind::RoutineEnd) {
                continue;
            }
            if ids.iter().any(|id| !trace.elem(*id).is_executed()) {
                continue;
            }
            let mut stuck = ResultElem::from_element(last, e).with_obj_type("RE");
            stuck.obj_id = -1;
            self.report(BugCode::L00, vec![stuck], vec![]);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{read_routine, AnalysisOptions, Analyzer, BugCode, ReadOptions, RunInfo, Trace};

    fn analyze(routines: &[&str]) -> Analyzer {
        let mut trace = Trace::new();
        for (i, content) in routines.iter().enumerate() {
            read_routine(&mut trace, i as u32 + 1, content, ReadOptions::default());
        }
        trace.sort();
        trace.link_partners();
        let mut analyzer = Analyzer::new(AnalysisOptions::default());
        analyzer.run(&mut trace, &RunInfo::default()).expect("analysis");
        analyzer
    }

    #[test]
    fn blocked_send_with_concurrent_receive_elsewhere() {
        let a = analyze(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nC,10,0,4,S,f,0,0,0,m.go:3\nE,20",
            "C,3,6,4,R,f,1,0,0,a.go:1\nE,21",
            "C,4,6,4,S,f,1,0,0,b.go:1\nE,22",
        ]);
        let f = a.results().findings().iter().find(|f| f.code == BugCode::L02).expect("L02");
        assert_eq!(f.arg1[0].file, "m.go");
        assert_eq!(f.arg2[0].file, "a.go");
    }

    #[test]
    fn blocked_receive_without_partner() {
        let a = analyze(&["C,1,0,4,R,f,0,0,0,m.go:3"]);
        assert_eq!(a.results().count(BugCode::L01), 1);
        assert_eq!(a.results().count(BugCode::L00), 0);
    }

    #[test]
    fn nil_channel_and_blocked_primitives() {
        let a = analyze(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nG,3,4,m.go:3\nC,5,0,*,R,f,0,0,0,m.go:4",
            "M,6,7,9,-,L,t,a.go:1\nW,8,0,3,W,0,1,a.go:2",
            "M,9,0,9,-,L,t,b.go:1",
            "D,10,0,2,W,c.go:1",
        ]);
        assert_eq!(a.results().count(BugCode::L05), 1);
        assert_eq!(a.results().count(BugCode::L09), 1);
        assert_eq!(a.results().count(BugCode::L10), 1);
        let lock = a.results().findings().iter().find(|f| f.code == BugCode::L08).expect("L08");
        assert_eq!(lock.arg2[0].file, "a.go");
    }

    #[test]
    fn routine_without_end_is_stuck() {
        let a = analyze(&["G,1,2,m.go:1\nE,5", "C,2,3,8,C,f,0,0,0,w.go:9"]);
        let f = a.results().findings().iter().find(|f| f.code == BugCode::L00).expect("L00");
        assert_eq!((f.arg1[0].obj_type.as_str(), f.arg1[0].obj_id), ("RE", -1));
        assert_eq!(f.arg1[0].routine, 2);
    }

    #[test]
    fn blocked_select_without_any_partner() {
        let a = analyze(&["S,1,0,3,C.1.0.4.R.f.0.0.0~C.1.0.5.S.f.0.0.0,-1,m.go:4"]);
        assert_eq!(a.results().count(BugCode::L07), 1);
    }
}
