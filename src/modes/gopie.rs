//! Scheduling-chain mutations: relations between operations, chain mutation,
//! and writing each chain as a partial-order replay trace.

use rand_chacha::ChaCha20Rng;
use rand_core::RngCore as _;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::{
    happens_before, next_below, CancelToken, ElemId, Element, ElementKind, FuzzMode, HbRelation, HbResult,
    ObjectId, RoutineId, Trace, Tuning, WriteOptions, EXIT_CODE_NONE,
};

pub const FUZZING_TRACES_DIR: &str = "fuzzingTraces";
pub const FUZZING_TRACE_PREFIX: &str = "fuzzingTrace_";
pub const REPLAY_ACTIVE_FILE: &str = "replay_active.log";

/// Rounds without a new chain before mutation stops.
const MAX_NO_NEW: usize = 5;

fn eligible(e: &Element, mode: FuzzMode) -> bool {
    if !e.is_executed() {
        return false;
    }
    match &e.kind {
        ElementKind::New { .. } | ElementKind::RoutineEnd | ElementKind::ReplayMarker { .. } => false,
        ElementKind::Mutex(_) | ElementKind::Channel(_) | ElementKind::Select(_) => true,
        _ => mode != FuzzMode::GoPie,
    }
}

/// `rel1`: next eligible element of the same routine.
/// `rel2`: later operation on the same primitive in another routine, closed
/// under `rel1 . rel2` and `rel2 . rel2`.
#[derive(Debug, Clone, Default)]
pub struct Relations {
    pub rel1: BTreeMap<ElemId, BTreeSet<ElemId>>,
    pub rel2: BTreeMap<ElemId, BTreeSet<ElemId>>,
}

impl Relations {
    pub fn build(trace: &Trace, mode: FuzzMode, cancel: &CancelToken) -> HbResult<Self> {
        let mut rels = Self::default();
        let mut by_object: BTreeMap<(char, ObjectId), Vec<ElemId>> = BTreeMap::new();

        for r in trace.routine_ids().collect::<Vec<_>>() {
            let ids: Vec<ElemId> = trace
                .routine(r)
                .iter()
                .copied()
                .filter(|id| eligible(trace.elem(*id), mode))
                .collect();
            for pair in ids.windows(2) {
                rels.rel1.entry(pair[0]).or_default().insert(pair[1]);
            }
            for id in ids {
                let e = trace.elem(id);
                if let Some(obj) = e.object_id() {
                    by_object.entry((e.tag(), obj)).or_default().push(id);
                }
            }
        }

        for ids in by_object.values_mut() {
            ids.sort_by_key(|id| (trace.elem(*id).t_sort(), trace.elem(*id).routine));
            for (i, a) in ids.iter().enumerate() {
                let routine = trace.elem(*a).routine;
                if let Some(b) = ids[i + 1..].iter().find(|b| trace.elem(**b).routine != routine) {
                    rels.rel2.entry(*a).or_default().insert(*b);
                }
            }
        }
        cancel.check()?;
        rels.close(cancel)?;
        Ok(rels)
    }

    fn close(&mut self, cancel: &CancelToken) -> HbResult<()> {
        loop {
            let mut added: Vec<(ElemId, ElemId)> = Vec::new();
            for (c, succ) in self.rel1.iter().chain(self.rel2.iter()) {
                for c1 in succ {
                    let Some(next) = self.rel2.get(c1) else {
                        continue;
                    };
                    for c2 in next {
                        if c2 != c && !self.rel2.get(c).is_some_and(|s| s.contains(c2)) {
                            added.push((*c, *c2));
                        }
                    }
                }
            }
            cancel.check()?;
            if added.is_empty() {
                return Ok(());
            }
            for (c, c2) in added {
                self.rel2.entry(c).or_default().insert(c2);
            }
        }
    }

    pub fn rel1_len(&self) -> usize {
        self.rel1.values().map(BTreeSet::len).sum()
    }

    pub fn rel2_len(&self) -> usize {
        self.rel2.values().map(BTreeSet::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub elems: Vec<ElemId>,
}

impl Chain {
    pub fn new(elems: Vec<ElemId>) -> Self {
        Self { elems }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// `routine:file:line&...`, stable across runs.
    pub fn canonical(&self, trace: &Trace) -> String {
        self.elems
            .iter()
            .map(|id| {
                let e = trace.elem(*id);
                format!("{}:{}&", e.routine, e.pos_string())
            })
            .collect()
    }

    pub fn key(&self, trace: &Trace) -> String {
        blake3::hash(self.canonical(trace).as_bytes()).to_hex().to_string()
    }

    /// Neighbours run in different routines and, with HB, the weak clocks
    /// do not already force the reverse order.
    pub fn is_valid(&self, trace: &Trace, use_hb: bool) -> bool {
        self.elems.windows(2).all(|w| {
            let (a, b) = (trace.elem(w[0]), trace.elem(w[1]));
            if a.routine == b.routine {
                return false;
            }
            if !use_hb || !trace.hb_was_calc() {
                return true;
            }
            match (&a.wvc, &b.wvc) {
                (Some(x), Some(y)) => happens_before(x, y) != HbRelation::After,
                _ => true,
            }
        })
    }

    fn abridge(&self) -> [Chain; 2] {
        [
            Chain::new(self.elems[1..].to_vec()),
            Chain::new(self.elems[..self.elems.len() - 1].to_vec()),
        ]
    }

    fn flip(&self) -> Vec<Chain> {
        (0..self.elems.len() - 1)
            .map(|i| {
                let mut c = self.clone();
                c.elems.swap(i, i + 1);
                c
            })
            .collect()
    }

    fn substitute(&self, rels: &Relations) -> Vec<Chain> {
        let mut out = Vec::new();
        for (i, e) in self.elems.iter().enumerate() {
            for succ in rels.rel1.get(e).into_iter().flatten() {
                if !self.elems.contains(succ) {
                    let mut c = self.clone();
                    c.elems[i] = *succ;
                    out.push(c);
                }
            }
        }
        out
    }

    fn augment(&self, rels: &Relations) -> Vec<Chain> {
        let Some(last) = self.elems.last() else {
            return Vec::new();
        };
        rels.rel2
            .get(last)
            .into_iter()
            .flatten()
            .filter(|e| !self.elems.contains(e))
            .map(|e| {
                let mut c = self.clone();
                c.elems.push(*e);
                c
            })
            .collect()
    }
}

/// A random size-2 seed drawn from `rel2`.
pub fn random_chain(rels: &Relations, rng: &mut ChaCha20Rng) -> Option<Chain> {
    let firsts: Vec<(&ElemId, &BTreeSet<ElemId>)> = rels.rel2.iter().filter(|(_, s)| !s.is_empty()).collect();
    if firsts.is_empty() {
        return None;
    }
    let (a, succ) = firsts[next_below(rng, firsts.len())];
    let b = succ.iter().nth(next_below(rng, succ.len()))?;
    Some(Chain::new(vec![*a, *b]))
}

/// Grow a set of chains from `seed` until it stagnates, exceeds the bound,
/// or a low energy ends it early. Keys are canonical chain strings.
pub fn mutate(
    seed: &Chain,
    trace: &Trace,
    rels: &Relations,
    energy: u32,
    tuning: &Tuning,
    rng: &mut ChaCha20Rng,
) -> BTreeMap<String, Chain> {
    let mut res = BTreeMap::new();
    if energy == 0 || seed.is_empty() {
        return res;
    }
    let energy = energy.min(100);
    res.insert(seed.canonical(trace), seed.clone());

    let mut no_new = 0;
    loop {
        let before = res.len();
        let current: Vec<Chain> = res.values().cloned().collect();
        for ch in current {
            let mut next = Vec::new();
            if ch.len() >= 2 {
                next.extend(ch.abridge());
                next.extend(ch.flip());
            }
            if rng.next_u32() % 2 == 1 {
                next.extend(ch.substitute(rels));
            }
            if ch.len() <= tuning.gopie_bound && rng.next_u32() % 2 == 1 {
                next.extend(ch.augment(rels));
            }
            for c in next.into_iter().filter(|c| !c.is_empty()) {
                res.entry(c.canonical(trace)).or_insert(c);
            }
        }

        if res.len() == before {
            no_new += 1;
            if no_new >= MAX_NO_NEW {
                break;
            }
        } else {
            no_new = 0;
        }
        if res.len() > tuning.gopie_mutabound {
            break;
        }
        if rng.next_u32() % 200 < 100 - energy {
            break;
        }
    }
    res
}

/// Chain elements by `(routine, pos, occurrence in routine)` so a chain
/// survives into the trace recorded from its replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecord {
    entries: Vec<(RoutineId, String, usize)>,
}

impl ChainRecord {
    pub fn of(chain: &Chain, trace: &Trace) -> Self {
        let entries = chain
            .elems
            .iter()
            .map(|id| {
                let e = trace.elem(*id);
                let pos = e.pos_string();
                let nth = trace
                    .routine(e.routine)
                    .iter()
                    .take_while(|x| *x != id)
                    .filter(|x| trace.elem(**x).pos_string() == pos)
                    .count();
                (e.routine, pos, nth)
            })
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, trace: &Trace) -> Option<Chain> {
        let mut elems = Vec::with_capacity(self.entries.len());
        for (routine, pos, nth) in &self.entries {
            let id = trace
                .routine(*routine)
                .iter()
                .filter(|x| trace.elem(**x).pos_string() == *pos)
                .nth(*nth)?;
            elems.push(*id);
        }
        Some(Chain::new(elems))
    }
}

/// State of the chain family across one fuzzing session.
#[derive(Debug, Clone, Default)]
pub struct GoPieState {
    seen: BTreeSet<String>,
    chains: BTreeMap<usize, ChainRecord>,
    written: usize,
    max_score: f64,
}

impl GoPieState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `w1*|rel1| + w2*ln|rel2|` normalised to the best run so far, in `0..=100`.
    pub fn energy(&mut self, rels: &Relations, tuning: &Tuning, timed_out: bool) -> u32 {
        if timed_out {
            return 0;
        }
        let rel2 = rels.rel2_len();
        let mut score = tuning.gopie_w1 * rels.rel1_len() as f64;
        if rel2 > 0 {
            score += tuning.gopie_w2 * (rel2 as f64).ln();
        }
        self.max_score = self.max_score.max(score);
        if self.max_score <= 0.0 {
            return 100;
        }
        (100.0 * (score + 1.0) / self.max_score).clamp(0.0, 100.0) as u32
    }

    /// Build chains for `trace`, write up to `room` of them under `base`, and
    /// return their indices.
    #[allow(clippy::too_many_arguments)]
    pub fn create_mutations(
        &mut self,
        trace: &Trace,
        mode: FuzzMode,
        tuning: &Tuning,
        timed_out: bool,
        previous: Option<usize>,
        base: &Path,
        room: usize,
        rng: &mut ChaCha20Rng,
        cancel: &CancelToken,
    ) -> HbResult<Vec<usize>> {
        let rels = Relations::build(trace, mode, cancel)?;

        let mut seeds = Vec::new();
        if mode == FuzzMode::GoPie {
            if let Some(chain) = previous.and_then(|n| self.chains.get(&n)).and_then(|r| r.resolve(trace)) {
                seeds.push(chain);
            }
        }
        if seeds.is_empty() {
            for _ in 0..tuning.gopie_sc_start {
                if let Some(c) = random_chain(&rels, rng) {
                    seeds.push(c);
                }
            }
        }

        let energy = self.energy(&rels, tuning, timed_out);
        tracing::debug!("mutating {} scheduling chains with energy {energy}", seeds.len());

        let mut keep: BTreeMap<String, Chain> = BTreeMap::new();
        for seed in &seeds {
            for (_, chain) in mutate(seed, trace, &rels, energy, tuning, rng) {
                if mode != FuzzMode::GoPie && chain.len() <= 1 {
                    continue;
                }
                let key = chain.key(trace);
                if mode == FuzzMode::GoPie || !self.seen.contains(&key) {
                    if chain.is_valid(trace, mode.uses_hb()) {
                        keep.insert(key.clone(), chain);
                    }
                    self.seen.insert(key);
                }
            }
        }
        cancel.check()?;

        let mut written = Vec::new();
        for chain in keep.values() {
            if written.len() >= room {
                break;
            }
            self.written += 1;
            let dir = fuzzing_trace_dir(base, self.written);
            let partial_start = mode != FuzzMode::GoPie;
            if let Err(err) = materialize(trace, chain, &dir, partial_start) {
                tracing::warn!("could not write chain mutation {}: {err}", self.written);
                continue;
            }
            self.chains.insert(self.written, ChainRecord::of(chain, trace));
            written.push(self.written);
        }
        Ok(written)
    }
}

pub fn fuzzing_trace_dir(base: &Path, n: usize) -> PathBuf {
    base.join(FUZZING_TRACES_DIR).join(format!("{FUZZING_TRACE_PREFIX}{n}"))
}

/// Give the chain elements their own `tPost`s in chain order, cut the trace
/// after the chain, and write it with its `replay_active.log`.
pub fn materialize(trace: &Trace, chain: &Chain, dir: &Path, partial_start: bool) -> HbResult<Trace> {
    let mut copy = trace.clone();
    let mut times: Vec<u64> = chain.elems.iter().map(|id| trace.elem(*id).t_post).collect();
    times.sort_unstable();
    let mut routines: BTreeSet<RoutineId> = BTreeSet::new();
    for (id, t) in chain.elems.iter().zip(&times) {
        copy.elem_mut(*id).set_t_sort(*t);
        routines.insert(copy.elem(*id).routine);
    }
    copy.sort_routines(&routines.into_iter().collect::<Vec<_>>());

    let last = times.last().copied().unwrap_or(0);
    copy.remove_later(last);
    copy.append_replay_marker(last + 1, EXIT_CODE_NONE);
    copy.sort();

    crate::write_trace(&copy, dir, WriteOptions { replay: true })?;
    crate::write_atomic(&dir.join(REPLAY_ACTIVE_FILE), active_set(&copy, chain, partial_start).as_bytes())?;
    Ok(copy)
}

/// First line: replay start time (`0` is the beginning). Then one
/// `routine:file:line,tSort,occurrence` line per chain element.
pub fn active_set(trace: &Trace, chain: &Chain, partial_start: bool) -> String {
    let mut counter: BTreeMap<ElemId, usize> = BTreeMap::new();
    let mut per_pos: BTreeMap<String, usize> = BTreeMap::new();
    for id in trace.ordered_ids() {
        let n = per_pos.entry(trace.elem(id).pos_string()).or_insert(0);
        *n += 1;
        if chain.elems.contains(&id) {
            counter.insert(id, *n);
        }
    }

    let start = match chain.elems.first() {
        Some(first) if partial_start => trace.elem(*first).t_sort(),
        _ => 0,
    };
    let mut out = format!("{start}\n");
    for id in &chain.elems {
        let e = trace.elem(*id);
        out.push_str(&format!(
            "{}:{},{},{}\n",
            e.routine,
            e.pos_string(),
            e.t_sort(),
            counter.get(id).copied().unwrap_or(0)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_routine, seeded_rng, ReadOptions};

    /// Two routines alternating on one mutex.
    fn mutex_trace() -> Trace {
        let mut trace = Trace::new();
        read_routine(
            &mut trace,
            1,
            "G,1,2,m.go:1\nM,3,3,5,-,L,t,m.go:4\nM,4,4,5,-,U,t,m.go:5\nM,9,9,5,-,L,t,m.go:6\nM,10,10,5,-,U,t,m.go:7\nE,20",
            ReadOptions::default(),
        );
        read_routine(
            &mut trace,
            2,
            "M,5,5,5,-,L,t,w.go:2\nM,6,6,5,-,U,t,w.go:3\nE,21",
            ReadOptions::default(),
        );
        trace.sort();
        trace
    }

    fn id_at(trace: &Trace, routine: RoutineId, pos: &str) -> ElemId {
        *trace
            .routine(routine)
            .iter()
            .find(|id| trace.elem(**id).pos_string() == pos)
            .expect("element")
    }

    #[test]
    fn relations_follow_routines_and_primitives() {
        let trace = mutex_trace();
        let rels = Relations::build(&trace, FuzzMode::GoPiePlus, &CancelToken::new()).expect("relations");
        let lock1 = id_at(&trace, 1, "m.go:4");
        let unlock1 = id_at(&trace, 1, "m.go:5");
        let lock2 = id_at(&trace, 2, "w.go:2");
        let relock1 = id_at(&trace, 1, "m.go:6");

        assert!(rels.rel1[&lock1].contains(&unlock1));
        assert!(rels.rel2[&unlock1].contains(&lock2));
        assert!(rels.rel2[&lock2].contains(&relock1));
        // closure: lock1 -> lock2 -> relock1
        assert!(rels.rel2[&lock1].contains(&relock1));
        // closure through rel1: fork -> lock1 -> lock2
        let fork = id_at(&trace, 1, "m.go:1");
        assert!(rels.rel2[&fork].contains(&lock2));
        assert!(!rels.rel2.get(&lock2).is_some_and(|s| s.contains(&lock2)));
    }

    #[test]
    fn forks_are_only_chain_elements_outside_plain_gopie() {
        let trace = mutex_trace();
        let fork = id_at(&trace, 1, "m.go:1");
        let plain = Relations::build(&trace, FuzzMode::GoPie, &CancelToken::new()).expect("relations");
        let plus = Relations::build(&trace, FuzzMode::GoPiePlus, &CancelToken::new()).expect("relations");
        assert!(!plain.rel1.contains_key(&fork));
        assert!(plus.rel1.contains_key(&fork));
    }

    #[test]
    fn chains_from_one_routine_are_invalid() {
        let trace = mutex_trace();
        let a = id_at(&trace, 1, "m.go:4");
        let b = id_at(&trace, 2, "w.go:2");
        let c = id_at(&trace, 1, "m.go:5");
        assert!(Chain::new(vec![a, b]).is_valid(&trace, false));
        assert!(!Chain::new(vec![a, c]).is_valid(&trace, false));
    }

    #[test]
    fn mutation_keeps_the_seed_and_respects_energy() {
        let trace = mutex_trace();
        let rels = Relations::build(&trace, FuzzMode::GoPiePlus, &CancelToken::new()).expect("relations");
        let seed = Chain::new(vec![id_at(&trace, 1, "m.go:5"), id_at(&trace, 2, "w.go:2")]);
        let (mut rng, _) = seeded_rng(Some(3));
        let tuning = Tuning::default();
        assert!(mutate(&seed, &trace, &rels, 0, &tuning, &mut rng).is_empty());
        let out = mutate(&seed, &trace, &rels, 100, &tuning, &mut rng);
        assert!(out.contains_key(&seed.canonical(&trace)));
        // flip of the seed
        assert!(out.contains_key("2:w.go:2&1:m.go:5&"));
        assert!(out.values().all(|c| !c.is_empty() && c.len() <= tuning.gopie_bound + 1));
    }

    #[test]
    fn materialized_chain_swaps_times_and_lists_active_set() {
        let trace = mutex_trace();
        let lock2 = id_at(&trace, 2, "w.go:2");
        let unlock1 = id_at(&trace, 1, "m.go:5");
        // lock2 (t=5) before unlock1 (t=4): they exchange times.
        let chain = Chain::new(vec![lock2, unlock1]);
        let dir = std::env::temp_dir().join(format!("hbtrace-gopie-{}", uuid::Uuid::new_v4()));
        let copy = materialize(&trace, &chain, &dir, true).expect("materialize");
        assert_eq!(copy.elem(lock2).t_post, 4);
        assert_eq!(copy.elem(unlock1).t_post, 5);
        assert!(copy.ids().all(|id| copy.elem(id).t_sort() <= 6));

        let active = std::fs::read_to_string(dir.join(REPLAY_ACTIVE_FILE)).expect("active set");
        assert_eq!(active, "4\n2:w.go:2,4,1\n1:m.go:5,5,1\n");
        let marker = std::fs::read_to_string(dir.join("trace_1.log")).expect("trace");
        assert!(marker.ends_with("X,6,0\n"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn chain_record_resolves_in_a_new_recording() {
        let trace = mutex_trace();
        let chain = Chain::new(vec![id_at(&trace, 1, "m.go:6"), id_at(&trace, 2, "w.go:3")]);
        let record = ChainRecord::of(&chain, &trace);
        let again = mutex_trace();
        assert_eq!(record.resolve(&again), Some(chain));
    }

    #[test]
    fn energy_is_zero_after_timeout_and_bounded() {
        let trace = mutex_trace();
        let rels = Relations::build(&trace, FuzzMode::GoPiePlus, &CancelToken::new()).expect("relations");
        let mut state = GoPieState::new();
        assert_eq!(state.energy(&rels, &Tuning::default(), true), 0);
        assert_eq!(state.energy(&rels, &Tuning::default(), false), 100);
    }
}
