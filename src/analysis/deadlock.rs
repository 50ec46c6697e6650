//! Resource deadlocks from lock dependencies (UNDEAD style): per routine,
//! which locks were held while another was requested, then cycles among
//! those dependencies whose requests could run concurrently.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    is_concurrent, Analyzer, BugCode, ElemId, ElementKind, MutexKind, ObjectId, ResultElem, RoutineId, Trace,
    VectorClock,
};

const MAX_CYCLES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct LockId {
    pub id: ObjectId,
    pub read: bool,
}

impl LockId {
    /// Two acquisitions of these locks exclude each other.
    fn could_block(self, other: LockId) -> bool {
        self.id == other.id && !(self.read && other.read)
    }
}

fn disjoint_could_block(a: &BTreeSet<LockId>, b: &BTreeSet<LockId>) -> bool {
    a.iter().all(|x| b.iter().all(|y| !x.could_block(*y)))
}

#[derive(Debug, Clone)]
pub(crate) struct LockEvent {
    pub elem: ElemId,
    pub t_pre: u64,
    pub vc: VectorClock,
}

/// `lock` was requested while holding `lockset`.
#[derive(Debug, Clone)]
struct Dependency {
    lockset: BTreeSet<LockId>,
    requests: Vec<LockEvent>,
}

#[derive(Debug, Clone, Default)]
struct LockThread {
    lockset: BTreeSet<LockId>,
    deps: BTreeMap<LockId, Vec<Dependency>>,
    readers: BTreeMap<ObjectId, usize>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DeadlockState {
    threads: BTreeMap<RoutineId, LockThread>,
    failed: bool,
}

#[derive(Debug, Clone)]
struct ChainEntry {
    thread: RoutineId,
    lock: LockId,
    lockset: BTreeSet<LockId>,
    requests: Vec<LockEvent>,
}

impl DeadlockState {
    fn insert_dependency(&mut self, thread: RoutineId, lock: LockId, event: LockEvent) {
        let t = self.threads.entry(thread).or_default();
        if t.lockset.is_empty() {
            return;
        }
        let deps = t.deps.entry(lock).or_default();
        match deps.iter_mut().find(|d| d.lockset == t.lockset) {
            Some(dep) => dep.requests.push(event),
            None => deps.push(Dependency {
                lockset: t.lockset.clone(),
                requests: vec![event],
            }),
        }
    }

    fn acquire(&mut self, thread: RoutineId, lock: LockId, event: LockEvent) {
        self.insert_dependency(thread, lock, event);
        let t = self.threads.entry(thread).or_default();
        if lock.read {
            *t.readers.entry(lock.id).or_insert(0) += 1;
        }
        t.lockset.insert(lock);
    }

    /// False if the routine did not hold the lock.
    fn release(&mut self, thread: RoutineId, lock: LockId) -> bool {
        let Some(t) = self.threads.get_mut(&thread) else {
            return false;
        };
        if lock.read {
            let Some(readers) = t.readers.get_mut(&lock.id).filter(|r| **r > 0) else {
                return false;
            };
            *readers -= 1;
            if *readers == 0 {
                t.lockset.remove(&lock);
            }
            return true;
        }
        t.lockset.remove(&lock)
    }

    fn entry(thread: RoutineId, lock: LockId, dep: &Dependency) -> ChainEntry {
        ChainEntry {
            thread,
            lock,
            lockset: dep.lockset.clone(),
            requests: dep.requests.clone(),
        }
    }

    fn find_cycles(&self) -> Vec<Vec<ChainEntry>> {
        let mut traversed: BTreeMap<RoutineId, bool> = self.threads.keys().map(|t| (*t, false)).collect();
        let mut cycles = Vec::new();
        let mut chain = Vec::new();
        for (tid, thread) in &self.threads {
            traversed.insert(*tid, true);
            for (lock, deps) in &thread.deps {
                for dep in deps {
                    chain.push(Self::entry(*tid, *lock, dep));
                    self.dfs(&mut chain, &mut traversed, &mut cycles);
                    chain.pop();
                }
            }
        }
        cycles
    }

    fn dfs(&self, chain: &mut Vec<ChainEntry>, traversed: &mut BTreeMap<RoutineId, bool>, cycles: &mut Vec<Vec<ChainEntry>>) {
        if cycles.len() >= MAX_CYCLES {
            return;
        }
        for (tid, thread) in &self.threads {
            if traversed.get(tid).copied().unwrap_or(true) {
                continue;
            }
            for (lock, deps) in &thread.deps {
                for dep in deps {
                    if !is_chain(chain, *lock, &dep.lockset) {
                        continue;
                    }
                    if is_cycle_chain(chain, *lock) {
                        let mut cycle = chain.clone();
                        cycle.push(Self::entry(*tid, *lock, dep));
                        if filter_concurrent_requests(&mut cycle) {
                            cycles.push(cycle);
                        }
                    } else {
                        traversed.insert(*tid, true);
                        chain.push(Self::entry(*tid, *lock, dep));
                        self.dfs(chain, traversed, cycles);
                        chain.pop();
                        traversed.insert(*tid, false);
                    }
                }
            }
        }
    }
}

/// Can a dependency on `lock` under `lockset` extend `chain`?
fn is_chain(chain: &[ChainEntry], lock: LockId, lockset: &BTreeSet<LockId>) -> bool {
    let Some(last) = chain.last() else {
        return false;
    };
    if !lock.read && chain.iter().any(|c| c.lock.id == lock.id) {
        return false;
    }
    if !chain.iter().all(|c| disjoint_could_block(&c.lockset, lockset)) {
        return false;
    }
    lockset.iter().any(|l| last.lock.could_block(*l))
}

/// The new dependency's lock is held by the first chain entry.
fn is_cycle_chain(chain: &[ChainEntry], lock: LockId) -> bool {
    chain
        .first()
        .is_some_and(|first| first.lockset.iter().any(|l| l.could_block(lock)))
}

/// Keep only requests concurrent with some request of both neighbours.
/// False once any entry is left without requests.
fn filter_concurrent_requests(cycle: &mut [ChainEntry]) -> bool {
    let n = cycle.len();
    loop {
        let mut changed = false;
        for i in 0..n {
            let prev = cycle[(i + n - 1) % n].requests.clone();
            let next = cycle[(i + 1) % n].requests.clone();
            let before = cycle[i].requests.len();
            cycle[i].requests.retain(|r| {
                prev.iter().any(|p| is_concurrent(&p.vc, &r.vc)) && next.iter().any(|q| is_concurrent(&q.vc, &r.vc))
            });
            if cycle[i].requests.is_empty() {
                return false;
            }
            changed |= cycle[i].requests.len() != before;
        }
        if !changed {
            return true;
        }
    }
}

impl Analyzer {
    /// Feed one mutex operation into the lock graph, using the weak clock.
    pub(crate) fn deadlock_event(&mut self, trace: &Trace, id: ElemId) {
        if self.deadlock.failed {
            return;
        }
        let e = trace.elem(id);
        let ElementKind::Mutex(op) = &e.kind else {
            return;
        };
        let event = LockEvent {
            elem: id,
            t_pre: e.t_pre,
            vc: e.wvc.clone().or_else(|| e.vc.clone()).unwrap_or_default(),
        };
        let lock = LockId {
            id: op.id,
            read: op.kind.is_read(),
        };
        match op.kind {
            MutexKind::Lock | MutexKind::RLock => self.deadlock.acquire(e.routine, lock, event),
            MutexKind::TryLock | MutexKind::TryRLock if op.success => self.deadlock.acquire(e.routine, lock, event),
            MutexKind::TryLock | MutexKind::TryRLock => self.deadlock.insert_dependency(e.routine, lock, event),
            MutexKind::Unlock | MutexKind::RUnlock => {
                if !self.deadlock.release(e.routine, lock) {
                    self.deadlock.failed = true;
                    let msg = format!(
                        "DeadlockAnalysisFailure: routine {} released lock {} at {} without holding it",
                        e.routine,
                        op.id,
                        e.tid()
                    );
                    tracing::warn!("{msg}");
                    self.diagnostics.push(msg);
                }
            }
        }
    }

    pub(crate) fn check_resource_deadlock(&mut self, trace: &Trace) {
        if self.deadlock.failed {
            return;
        }
        let cycles = self.deadlock.find_cycles();
        tracing::debug!("{} lock cycles with concurrent requests", cycles.len());
        for cycle in cycles {
            let mut chosen: Vec<&LockEvent> = cycle
                .iter()
                .filter_map(|entry| entry.requests.iter().min_by_key(|r| r.t_pre))
                .collect();
            if chosen.len() != cycle.len() {
                continue;
            }
            let latest = chosen
                .iter()
                .enumerate()
                .max_by_key(|(_, r)| r.t_pre)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let n = chosen.len();
            chosen.rotate_left((latest + 1) % n);

            let elems: Vec<ResultElem> = chosen
                .iter()
                .map(|r| ResultElem::from_element(r.elem, trace.elem(r.elem)).with_obj_type("DC"))
                .collect();
            let Some(holder) = elems.last().cloned() else {
                continue;
            };
            let threads: Vec<RoutineId> = cycle.iter().map(|c| c.thread).collect();
            tracing::debug!("cyclic deadlock between routines {threads:?}");
            self.report(BugCode::P05, vec![holder.with_obj_type("DH")], elems);
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
        let mut analyzer = Analyzer::new(AnalysisOptions::default());
        analyzer.run(&mut trace, &RunInfo::default()).expect("analysis");
        analyzer
    }

    #[test]
    fn lock_order_inversion_is_a_cycle() {
        let a = analyze(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nE,30",
            "M,3,4,1,-,L,t,a.go:1\nM,5,6,2,-,L,t,a.go:2\nM,7,8,2,-,U,t,a.go:3\nM,9,10,1,-,U,t,a.go:4\nE,31",
            "M,11,12,2,-,L,t,b.go:1\nM,13,14,1,-,L,t,b.go:2\nM,15,16,1,-,U,t,b.go:3\nM,17,18,2,-,U,t,b.go:4\nE,32",
        ]);
        let f = a.results().findings().iter().find(|f| f.code == BugCode::P05).expect("P05");
        assert_eq!(f.arg2.len(), 2);
        assert_eq!(f.arg1[0].obj_type, "DH");
        assert!(f.arg2.iter().all(|e| e.obj_type == "DC"));
        assert_eq!(f.arg1[0].t_pre, 13);
    }

    #[test]
    fn common_guard_lock_prevents_the_cycle() {
        let a = analyze(&[
            "G,1,2,m.go:1\nG,2,3,m.go:2\nE,40",
            "M,3,4,9,-,L,t,a.go:0\nM,5,6,1,-,L,t,a.go:1\nM,7,8,2,-,L,t,a.go:2\nM,9,10,2,-,U,t,a.go:3\nM,11,12,1,-,U,t,a.go:4\nM,13,14,9,-,U,t,a.go:5\nE,41",
            "M,15,16,9,-,L,t,b.go:0\nM,17,18,2,-,L,t,b.go:1\nM,19,20,1,-,L,t,b.go:2\nM,21,22,1,-,U,t,b.go:3\nM,23,24,2,-,U,t,b.go:4\nM,25,26,9,-,U,t,b.go:5\nE,42",
        ]);
        assert_eq!(a.results().count(BugCode::P05), 0);
    }

    #[test]
    fn unlock_without_lock_disables_the_check() {
        let a = analyze(&["M,1,2,1,-,U,t,a.go:1\nE,3"]);
        assert_eq!(a.results().count(BugCode::P05), 0);
        assert!(a.diagnostics()[0].starts_with("DeadlockAnalysisFailure"));
    }

    #[test]
    fn read_unlock_without_read_lock_disables_the_check() {
        let a = analyze(&["M,1,2,5,-,L,t,a.go:1\nM,3,4,5,-,U,t,a.go:2\nM,5,6,1,R,N,t,a.go:3\nE,7"]);
        assert_eq!(a.diagnostics().len(), 1);
        assert!(a.diagnostics()[0].starts_with("DeadlockAnalysisFailure"));
    }

    #[test]
    fn matched_read_locks_release_cleanly() {
        let a = analyze(&["M,1,2,1,R,R,t,a.go:1\nM,3,4,1,R,R,t,a.go:2\nM,5,6,1,R,N,t,a.go:3\nM,7,8,1,R,N,t,a.go:4\nE,9"]);
        assert!(a.diagnostics().is_empty());
    }
}
