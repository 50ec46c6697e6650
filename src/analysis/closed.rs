//! Closed-channel detectors: actual and possible send/receive on a closed
//! channel, double close, close of nil and concurrent receives.

use crate::{
    happens_before, is_concurrent, Analyzer, BugCode, ChannelDir, ChannelOp, ElemId, HbRelation, ResultElem, Trace,
    VectorClock,
};

impl Analyzer {
    pub(crate) fn update_close(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) {
        let routine = trace.elem(id).routine;
        self.stamp(trace, id);
        if op.id == -1 {
            self.inc(routine);
            if self.strong() && self.detectors().close_on_closed {
                self.report(BugCode::A04, vec![ResultElem::from_element(id, trace.elem(id))], vec![]);
            }
            return;
        }
        let vc = self.current(routine);
        self.record_close_vc(op.id, vc);
        self.inc(routine);
        if !self.strong() {
            return;
        }

        if let Some(first) = self.close_op.get(&op.id).copied() {
            if self.detectors().close_on_closed {
                self.report(
                    BugCode::A03,
                    vec![ResultElem::from_element(id, trace.elem(id))],
                    vec![ResultElem::from_element(first, trace.elem(first))],
                );
            }
        } else {
            self.close_op.insert(op.id, id);
        }
        self.closes.push(id);
        self.check_close(trace, id);
    }

    pub(crate) fn send_on_closed(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) {
        let routine = trace.elem(id).routine;
        self.stamp(trace, id);
        self.inc(routine);
        if self.strong() && self.detectors().send_on_closed {
            let close = self.close_elem(trace, op.id);
            self.report(BugCode::A01, vec![ResultElem::from_element(id, trace.elem(id))], close);
        }
    }

    pub(crate) fn recv_on_closed(&mut self, trace: &mut Trace, id: ElemId, op: &ChannelOp) {
        let routine = trace.elem(id).routine;
        self.sync_with_close(routine, op.id);
        self.stamp(trace, id);
        self.inc(routine);
        if self.strong() && self.detectors().recv_on_closed {
            let close = self.close_elem(trace, op.id);
            self.report(BugCode::A02, vec![ResultElem::from_element(id, trace.elem(id))], close);
        }
    }

    fn close_elem(&self, trace: &Trace, chan: crate::ObjectId) -> Vec<ResultElem> {
        self.close_op
            .get(&chan)
            .map(|c| vec![ResultElem::from_element(*c, trace.elem(*c))])
            .unwrap_or_default()
    }

    /// Sends not before the close and receives concurrent with or after it.
    fn check_close(&mut self, trace: &Trace, close: ElemId) {
        let Some(chan) = trace.elem(close).channel().map(|op| op.id) else {
            return;
        };
        let close_vc = Self::elem_vc(trace, close);
        let close_elem = ResultElem::from_element(close, trace.elem(close));
        let det = self.detectors();

        if det.send_on_closed {
            let sends: Vec<ResultElem> = self
                .last_send
                .get(&chan)
                .into_iter()
                .flat_map(|m| m.values())
                .filter(|last| happens_before(&last.vc, &close_vc) != HbRelation::Before)
                .map(|last| Self::last_op_elem(trace, last))
                .collect();
            for send in sends {
                self.report(BugCode::P01, vec![send], vec![close_elem.clone()]);
            }
        }
        if det.recv_on_closed {
            let recvs: Vec<ResultElem> = self
                .last_recv
                .get(&chan)
                .into_iter()
                .flat_map(|m| m.values())
                .filter(|last| {
                    matches!(
                        happens_before(&close_vc, &last.vc),
                        HbRelation::Concurrent | HbRelation::Before
                    )
                })
                .map(|last| Self::last_op_elem(trace, last))
                .collect();
            for recv in recvs {
                self.report(BugCode::P02, vec![recv], vec![close_elem.clone()]);
            }
        }
    }

    /// Operations recorded after a close also count against it.
    pub(crate) fn recheck_closed_channels(&mut self, trace: &Trace) {
        for close in self.closes.clone() {
            self.check_close(trace, close);
        }
    }

    /// A non-chosen case of a select on a channel that is already closed.
    pub(crate) fn check_select_case_on_closed(
        &mut self,
        trace: &Trace,
        sel: ElemId,
        case: usize,
        op: &ChannelOp,
        sel_vc: &VectorClock,
    ) {
        let Some(close) = self.close_op.get(&op.id).copied() else {
            return;
        };
        let close_vc = Self::elem_vc(trace, close);
        let det = self.detectors();
        let code = match op.dir {
            ChannelDir::Send if det.send_on_closed && happens_before(sel_vc, &close_vc) != HbRelation::Before => {
                BugCode::P01
            }
            ChannelDir::Recv
                if det.recv_on_closed
                    && matches!(happens_before(&close_vc, sel_vc), HbRelation::Concurrent | HbRelation::Before) =>
            {
                BugCode::P02
            }
            _ => return,
        };
        self.report(
            code,
            vec![ResultElem::from_select_case(sel, trace.elem(sel), case)],
            vec![ResultElem::from_element(close, trace.elem(close))],
        );
    }

    /// Receives on one channel by different routines that are unordered.
    pub(crate) fn check_concurrent_recv(&mut self, trace: &Trace, recv: ElemId, chan: crate::ObjectId) {
        if !self.detectors().concurrent_recv {
            return;
        }
        let routine = trace.elem(recv).routine;
        let vc = Self::elem_vc(trace, recv);
        let others: Vec<ResultElem> = self
            .last_recv
            .get(&chan)
            .into_iter()
            .flat_map(|m| m.iter())
            .filter(|(r, last)| **r != routine && last.case.is_none() && is_concurrent(&vc, &last.vc))
            .map(|(_, last)| Self::last_op_elem(trace, last))
            .collect();
        let me = match trace.elem(recv).select() {
            Some(sel) if sel.chosen_index >= 0 => {
                ResultElem::from_select_case(recv, trace.elem(recv), sel.chosen_index as usize)
            }
            _ => ResultElem::from_element(recv, trace.elem(recv)),
        };
        for other in others {
            self.report(BugCode::A07, vec![me.clone()], vec![other]);
        }
    }
}
