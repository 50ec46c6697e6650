//! Which select cases could have communicated with some other operation.

use std::collections::BTreeMap;

use crate::{happens_before, Analyzer, BugCode, ChannelDir, ElemId, HbRelation, ObjectId, ResultElem, Trace, VectorClock};

/// One case of a select, with the clock of the select.
#[derive(Debug, Clone)]
pub(crate) struct SelectCaseRef {
    pub sel: ElemId,
    pub case: usize,
    pub chan: ObjectId,
    pub dir: ChannelDir,
    pub buffered: bool,
    pub vc: VectorClock,
    /// The case was chosen and completed.
    pub chosen: bool,
}

/// Could the plain channel operation with clock `vc` pair with case `c`?
fn op_pairs_with_case(dir: ChannelDir, vc: &VectorClock, c: &SelectCaseRef) -> bool {
    let rel = happens_before(vc, &c.vc);
    match (dir, c.dir) {
        (ChannelDir::Send, ChannelDir::Recv) => {
            rel == HbRelation::Concurrent || (c.buffered && rel == HbRelation::Before)
        }
        (ChannelDir::Recv, ChannelDir::Send) => {
            rel == HbRelation::Concurrent || (c.buffered && rel == HbRelation::After)
        }
        (ChannelDir::Close, ChannelDir::Recv) => matches!(rel, HbRelation::Concurrent | HbRelation::Before),
        _ => false,
    }
}

fn cases_pair(send: &SelectCaseRef, recv: &SelectCaseRef) -> bool {
    let rel = happens_before(&send.vc, &recv.vc);
    rel == HbRelation::Concurrent || (send.buffered && rel == HbRelation::After)
}

impl Analyzer {
    pub(crate) fn check_select_partners(&mut self, trace: &mut Trace) {
        if self.select_cases.is_empty() {
            return;
        }
        let cases = &self.select_cases;
        let mut found: Vec<bool> = cases.iter().map(|c| c.chosen).collect();

        for id in trace.ids().collect::<Vec<_>>() {
            let e = trace.elem(id);
            let Some(op) = e.channel() else {
                continue;
            };
            let Some(vc) = e.vc.as_ref() else {
                continue;
            };
            if op.closed || op.id == -1 {
                continue;
            }
            for (k, c) in cases.iter().enumerate() {
                if found[k] || c.chan != op.id || c.sel == id {
                    continue;
                }
                if op_pairs_with_case(op.dir, vc, c) {
                    found[k] = true;
                }
            }
        }

        for (a, send) in cases.iter().enumerate() {
            if send.dir != ChannelDir::Send || send.chan == -1 {
                continue;
            }
            for (b, recv) in cases.iter().enumerate() {
                if recv.dir != ChannelDir::Recv || recv.chan != send.chan || recv.sel == send.sel {
                    continue;
                }
                if cases_pair(send, recv) {
                    found[a] = true;
                    found[b] = true;
                }
            }
        }

        // Aggregated over every execution of the same select.
        let mut per_pos: BTreeMap<(String, usize), (bool, ElemId)> = BTreeMap::new();
        let mut marks: Vec<(ElemId, usize)> = Vec::new();
        for (k, c) in cases.iter().enumerate() {
            if c.chan == -1 {
                continue;
            }
            let key = (trace.elem(c.sel).pos_string(), c.case);
            let slot = per_pos.entry(key).or_insert((false, c.sel));
            slot.0 |= found[k];
            if found[k] && !c.chosen {
                marks.push((c.sel, c.case));
            }
        }
        for (sel, case) in marks {
            if let Some(s) = trace.elem_mut(sel).select_mut() {
                s.add_case_with_partner(case);
            }
        }
        self.cases_with_partner = per_pos.values().filter(|(f, _)| *f).count();

        if !self.detectors().select_without_partner {
            return;
        }
        for ((_, case), (any, sel)) in per_pos {
            if any {
                continue;
            }
            let e = trace.elem(sel);
            self.report(
                BugCode::A08,
                vec![ResultElem::from_element(sel, e)],
                vec![ResultElem::from_select_case(sel, e, case)],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{read_routine, AnalysisOptions, Analyzer, BugCode, ReadOptions, RunInfo, Trace};

    fn analyze(routines: &[&str]) -> (Analyzer, Trace) {
        let mut trace = Trace::new();
        for (i, content) in routines.iter().enumerate() {
            read_routine(&mut trace, i as u32 + 1, content, ReadOptions::default());
        }
        trace.sort();
        trace.link_partners();
        let mut analyzer = Analyzer::new(AnalysisOptions::default());
        analyzer.run(&mut trace, &RunInfo::default()).expect("analysis");
        (analyzer, trace)
    }

    #[test]
    fn never_chosen_case_without_partner_is_reported_once() {
        let (a, _) = analyze(&[
            "G,1,2,m.go:1\nS,3,6,9,C.3.6.4.R.f.1.0.0~C.3.0.5.R.f.0.0.0,0,m.go:5\nE,20",
            "C,4,6,4,S,f,1,0,0,w.go:1\nE,21",
        ]);
        let a08: Vec<_> = a.results().findings().iter().filter(|f| f.code == BugCode::A08).collect();
        assert_eq!(a08.len(), 1);
        assert_eq!(a08[0].arg2[0].select_case, Some(1));
        assert_eq!(a08[0].arg2[0].obj_id, 5);
        assert_eq!(a.cases_with_partner(), 1);
    }

    #[test]
    fn concurrent_send_gives_the_other_case_a_partner() {
        let (a, trace) = analyze(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nS,4,8,9,C.4.8.4.R.f.1.0.0~C.4.0.5.R.f.0.0.0,0,m.go:5\nE,20",
            "C,5,8,4,S,f,1,0,0,w.go:1\nE,21",
            "C,6,0,5,S,f,0,0,0,x.go:1",
        ]);
        assert_eq!(a.results().count(BugCode::A08), 0);
        let sel = trace
            .ids()
            .find(|id| trace.elem(*id).select().is_some())
            .expect("select");
        assert_eq!(trace.elem(sel).select().expect("select").cases_with_partner, vec![1]);
    }
}
