//! Done-before-add and unlock-before-lock via maximum bipartite matching.

use std::collections::{BTreeSet, VecDeque};

use crate::{happens_before, is_concurrent, Analyzer, BugCode, ElemId, HbRelation, ResultElem, Trace, VectorClock};

#[derive(Debug, Clone, Copy)]
struct FlowEdge {
    to: usize,
    cap: u32,
}

/// Residual graph for Edmonds-Karp. Edge `e ^ 1` is the reverse of `e`.
#[derive(Debug, Default)]
struct FlowGraph {
    adj: Vec<Vec<usize>>,
    edges: Vec<FlowEdge>,
}

impl FlowGraph {
    fn new(nodes: usize) -> Self {
        Self {
            adj: vec![Vec::new(); nodes],
            edges: Vec::new(),
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, cap: u32) -> usize {
        let idx = self.edges.len();
        self.edges.push(FlowEdge { to, cap });
        self.edges.push(FlowEdge { to: from, cap: 0 });
        self.adj[from].push(idx);
        self.adj[to].push(idx + 1);
        idx
    }

    fn max_flow(&mut self, source: usize, sink: usize) -> u32 {
        let mut flow = 0;
        loop {
            let mut via: Vec<Option<usize>> = vec![None; self.adj.len()];
            let mut seen = vec![false; self.adj.len()];
            seen[source] = true;
            let mut queue = VecDeque::from([source]);
            while let Some(u) = queue.pop_front() {
                if u == sink {
                    break;
                }
                for &e in &self.adj[u] {
                    let edge = self.edges[e];
                    if edge.cap > 0 && !seen[edge.to] {
                        seen[edge.to] = true;
                        via[edge.to] = Some(e);
                        queue.push_back(edge.to);
                    }
                }
            }
            if !seen[sink] {
                return flow;
            }

            let mut bottleneck = u32::MAX;
            let mut v = sink;
            while let Some(e) = via[v] {
                bottleneck = bottleneck.min(self.edges[e].cap);
                v = self.edges[e ^ 1].to;
            }
            let mut v = sink;
            while let Some(e) = via[v] {
                self.edges[e].cap -= bottleneck;
                self.edges[e ^ 1].cap += bottleneck;
                v = self.edges[e ^ 1].to;
            }
            flow += bottleneck;
        }
    }
}

/// Result of matching releases onto the acquisitions that precede them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matching {
    pub flow: usize,
    pub unmatched_adds: Vec<usize>,
    pub unmatched_dones: Vec<usize>,
}

/// Match every done to a distinct add that happens before it.
pub fn match_before(adds: &[VectorClock], dones: &[VectorClock]) -> Matching {
    let source = 0;
    let sink = 1;
    let done_base = 2;
    let add_base = done_base + dones.len();
    let mut g = FlowGraph::new(add_base + adds.len());

    let done_edges: Vec<usize> = (0..dones.len()).map(|j| g.add_edge(source, done_base + j, 1)).collect();
    let add_edges: Vec<usize> = (0..adds.len()).map(|i| g.add_edge(add_base + i, sink, 1)).collect();
    for (j, done) in dones.iter().enumerate() {
        for (i, add) in adds.iter().enumerate() {
            if happens_before(add, done) == HbRelation::Before {
                g.add_edge(done_base + j, add_base + i, 1);
            }
        }
    }
    let flow = g.max_flow(source, sink) as usize;
    Matching {
        flow,
        unmatched_adds: add_edges
            .iter()
            .enumerate()
            .filter(|(_, e)| g.edges[**e].cap > 0)
            .map(|(i, _)| i)
            .collect(),
        unmatched_dones: done_edges
            .iter()
            .enumerate()
            .filter(|(_, e)| g.edges[**e].cap > 0)
            .map(|(j, _)| j)
            .collect(),
    }
}

/// Pair unmatched dones with concurrent unmatched adds, first fit.
fn pair_concurrent(
    adds: &[VectorClock],
    dones: &[VectorClock],
    matching: &Matching,
) -> Vec<(usize, usize)> {
    let mut free: BTreeSet<usize> = matching.unmatched_dones.iter().copied().collect();
    let mut pairs = Vec::new();
    for &i in &matching.unmatched_adds {
        let hit = free.iter().copied().find(|j| is_concurrent(&adds[i], &dones[*j]));
        if let Some(j) = hit {
            free.remove(&j);
            pairs.push((j, i));
        }
    }
    pairs
}

impl Analyzer {
    /// Emit `code` with (release, acquire) pairs that could be reordered so a
    /// release runs first.
    fn check_release_before_acquire(&mut self, trace: &Trace, code: BugCode, acquires: &[ElemId], releases: &[ElemId]) {
        if releases.is_empty() {
            return;
        }
        let routines: BTreeSet<u32> = acquires
            .iter()
            .chain(releases)
            .map(|id| trace.elem(*id).routine)
            .collect();
        if routines.len() <= 1 {
            return;
        }
        let acq_vcs: Vec<VectorClock> = acquires.iter().map(|id| Self::elem_vc(trace, *id)).collect();
        let rel_vcs: Vec<VectorClock> = releases.iter().map(|id| Self::elem_vc(trace, *id)).collect();
        let m = match_before(&acq_vcs, &rel_vcs);
        if m.flow >= releases.len() {
            return;
        }
        let pairs = pair_concurrent(&acq_vcs, &rel_vcs, &m);
        if pairs.is_empty() {
            tracing::debug!("{code}: {} releases unmatched but none is concurrent to a free acquire", m.unmatched_dones.len());
            return;
        }
        let arg1 = pairs
            .iter()
            .map(|(j, _)| ResultElem::from_element(releases[*j], trace.elem(releases[*j])))
            .collect();
        let arg2 = pairs
            .iter()
            .map(|(_, i)| ResultElem::from_element(acquires[*i], trace.elem(acquires[*i])))
            .collect();
        self.report(code, arg1, arg2);
    }

    pub(crate) fn check_done_before_add(&mut self, trace: &Trace) {
        let groups: Vec<(Vec<ElemId>, Vec<ElemId>)> = self
            .wg_dones
            .iter()
            .map(|(wg, dones)| (self.wg_adds.get(wg).cloned().unwrap_or_default(), dones.clone()))
            .collect();
        for (adds, dones) in groups {
            self.check_release_before_acquire(trace, BugCode::P03, &adds, &dones);
        }
    }

    pub(crate) fn check_unlock_before_lock(&mut self, trace: &Trace) {
        let groups: Vec<(Vec<ElemId>, Vec<ElemId>)> = self
            .all_unlocks
            .iter()
            .map(|(key, unlocks)| (self.all_locks.get(key).cloned().unwrap_or_default(), unlocks.clone()))
            .collect();
        for (locks, unlocks) in groups {
            self.check_release_before_acquire(trace, BugCode::P04, &locks, &unlocks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_routine, AnalysisOptions, ReadOptions, RunInfo};

    fn vc(values: &[u64]) -> VectorClock {
        VectorClock::from_values(values.to_vec())
    }

    #[test]
    fn matching_counts_every_done_preceded_by_an_add() {
        let adds = [vc(&[1, 0]), vc(&[2, 0])];
        let dones = [vc(&[2, 1]), vc(&[2, 2])];
        let m = match_before(&adds, &dones);
        assert_eq!(m.flow, 2);
        assert!(m.unmatched_dones.is_empty());
    }

    #[test]
    fn matching_never_exceeds_either_side() {
        let adds = [vc(&[1, 0, 0])];
        let dones = [vc(&[1, 1, 0]), vc(&[1, 0, 1]), vc(&[0, 0, 1])];
        let m = match_before(&adds, &dones);
        assert_eq!(m.flow, 1);
        assert_eq!(m.unmatched_dones.len(), 2);
        assert!(m.unmatched_adds.is_empty());
    }

    #[test]
    fn augmenting_path_reassigns_earlier_choice() {
        // done0 fits both adds, done1 only add0.
        let adds = [vc(&[1, 0, 0]), vc(&[0, 1, 0])];
        let dones = [vc(&[1, 1, 1]), vc(&[1, 0, 1])];
        assert_eq!(match_before(&adds, &dones).flow, 2);
    }

    #[test]
    fn concurrent_done_and_add_are_reported() {
        let mut trace = Trace::new();
        read_routine(
            &mut trace,
            1,
            "G,1,2,m.go:1\nW,3,4,7,A,1,1,m.go:2\nW,5,6,7,W,0,0,m.go:3\nE,20",
            ReadOptions::default(),
        );
        read_routine(&mut trace, 2, "W,2,3,7,A,-1,0,w.go:1\nE,21", ReadOptions::default());
        trace.sort();
        let mut a = Analyzer::new(AnalysisOptions::default());
        a.run(&mut trace, &RunInfo::default()).expect("run");
        let f = a.results().findings().iter().find(|f| f.code == BugCode::P03).expect("P03");
        assert_eq!(f.arg1[0].obj_type, "WD");
        assert_eq!(f.arg2[0].obj_type, "WA");
    }
}
