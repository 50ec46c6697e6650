//! Select-choice mutations: interestingness, score, flips, and flow delays.

use rand_chacha::ChaCha20Rng;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::{next_below, next_unit, ElementKind, FlowCandidate, HbResult, ObjectId, Trace, Tuning};

pub const FUZZING_DATA_FILE: &str = "fuzzingData.log";

/// Identical select mutations are run at most this often.
pub const MAX_RUNS_PER_MUTATION: usize = 2;
/// Cases with a feasible partner are this much more likely to be chosen.
pub const CASE_WITH_PARTNER_WEIGHT: u32 = 3;
pub const MAX_FLOW_MUTATIONS: usize = 10;

/// Select replay id -> chosen case per execution, in execution order. `-1` is default.
pub type SelectChoices = BTreeMap<String, Vec<i64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseInfo {
    Always,
    Never,
    Sometimes,
}

impl CloseInfo {
    fn merge(self, other: CloseInfo) -> CloseInfo {
        if self == other {
            self
        } else {
            CloseInfo::Sometimes
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelStats {
    global_id: String,
    close: CloseInfo,
    max_q_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectRecord {
    pub t: u64,
    pub chosen: i64,
    pub cases: usize,
    pub contains_default: bool,
    pub with_partner: Vec<usize>,
}

/// What one recorded run did with its channels and selects.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    channels: BTreeMap<ObjectId, ChannelStats>,
    /// `sendPos-recvPos` -> communications.
    pairs: BTreeMap<String, f64>,
    selects: BTreeMap<String, Vec<SelectRecord>>,
    number_selects: usize,
    number_closes: usize,
    cases_with_partner: usize,
}

impl RunStats {
    pub fn collect(trace: &Trace, cases_with_partner: usize) -> Self {
        let mut out = Self {
            cases_with_partner,
            ..Self::default()
        };
        for r in trace.routine_ids().collect::<Vec<_>>() {
            for id in trace.routine(r) {
                let e = trace.elem(*id);
                if !e.is_executed() {
                    continue;
                }
                match &e.kind {
                    ElementKind::New { id, object, .. } if object == "C" => {
                        // Operations of lower routines may already have opened the entry.
                        let global_id = e.pos_string();
                        out.channels
                            .entry(*id)
                            .and_modify(|c| c.global_id = global_id.clone())
                            .or_insert_with(|| ChannelStats {
                                global_id,
                                close: CloseInfo::Never,
                                max_q_count: 0,
                            });
                    }
                    ElementKind::Select(sel) => {
                        out.number_selects += 1;
                        let mut with_partner = sel.cases_with_partner.clone();
                        with_partner.sort_unstable();
                        out.selects.entry(e.replay_id()).or_default().push(SelectRecord {
                            t: e.t_post,
                            chosen: if sel.chosen_default { -1 } else { sel.chosen_index },
                            cases: sel.cases.len(),
                            contains_default: sel.contains_default,
                            with_partner,
                        });
                        out.channel_op(trace, *id);
                    }
                    ElementKind::Channel(_) => out.channel_op(trace, *id),
                    _ => {}
                }
            }
        }
        for records in out.selects.values_mut() {
            records.sort_by_key(|r| r.t);
        }
        out
    }

    fn channel_op(&mut self, trace: &Trace, id: crate::ElemId) {
        let e = trace.elem(id);
        let Some(op) = e.effective_channel() else {
            return;
        };
        let chan = self.channels.entry(op.id).or_insert_with(|| ChannelStats {
            global_id: format!("chan:{}", op.id),
            close: CloseInfo::Never,
            max_q_count: 0,
        });
        match op.dir {
            crate::ChannelDir::Close => {
                chan.close = CloseInfo::Always;
                self.number_closes += 1;
            }
            crate::ChannelDir::Send => {
                chan.max_q_count = chan.max_q_count.max(op.q_count);
                if let Some(recv) = op.partner.and_then(|p| trace.get(p)) {
                    let key = format!("{}-{}", e.pos_string(), recv.pos_string());
                    *self.pairs.entry(key).or_insert(0.0) += 1.0;
                }
            }
            crate::ChannelDir::Recv => {}
        }
    }

    pub fn number_selects(&self) -> usize {
        self.number_selects
    }

    /// The choices this run made.
    pub fn observed_choices(&self) -> SelectChoices {
        self.selects
            .iter()
            .map(|(id, recs)| (id.clone(), recs.iter().map(|r| r.chosen).collect()))
            .collect()
    }
}

/// Flip chance per select so that at least one of `n` flips with probability `flip_p`.
pub fn flip_probability(tuning: &Tuning, number_selects: usize) -> f64 {
    if number_selects == 0 {
        return tuning.flip_p_min;
    }
    let p = 1.0 - (1.0 - tuning.flip_p).powf(1.0 / number_selects as f64);
    p.max(tuning.flip_p_min)
}

/// Weighted pick among the cases that were not chosen; `None` if there is none.
fn choose_other_case(rec: &SelectRecord, rng: &mut ChaCha20Rng) -> Option<i64> {
    let start = if rec.contains_default { -1 } else { 0 };
    let weighted: Vec<(i64, u32)> = (start..rec.cases as i64)
        .filter(|c| *c != rec.chosen)
        .map(|c| {
            let partner = c >= 0 && rec.with_partner.contains(&(c as usize));
            (c, if partner { CASE_WITH_PARTNER_WEIGHT } else { 1 })
        })
        .collect();
    let total: u32 = weighted.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }
    let mut r = next_below(rng, total as usize) as u32;
    for (case, w) in weighted {
        if r < w {
            return Some(case);
        }
        r -= w;
    }
    None
}

fn choices_key(choices: &SelectChoices) -> String {
    let canonical: Vec<String> = choices
        .iter()
        .map(|(id, cases)| {
            let cases: Vec<String> = cases.iter().map(i64::to_string).collect();
            format!("{id}-{}", cases.join(","))
        })
        .collect();
    blake3::hash(canonical.join(";").as_bytes()).to_hex().to_string()
}

/// Everything learned from earlier runs of one session.
#[derive(Debug, Clone, Default)]
pub struct GFuzzHistory {
    channels: BTreeMap<String, ChannelStats>,
    pairs: BTreeMap<String, f64>,
    selects: BTreeMap<String, BTreeSet<i64>>,
    runs: usize,
    max_score: f64,
    mutations: BTreeMap<String, usize>,
    delayed: BTreeSet<(String, usize)>,
}

impl GFuzzHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_interesting(&self, run: &RunStats, use_hb: bool) -> bool {
        for (key, com) in &run.pairs {
            match self.pairs.get(key) {
                None => return true,
                Some(mean) if *mean > 0.0 && ((com - mean) / mean).abs() > 0.5 => return true,
                Some(_) => {}
            }
        }
        for chan in run.channels.values() {
            let Some(known) = self.channels.get(&chan.global_id) else {
                return true;
            };
            let flipped = matches!(
                (chan.close, known.close),
                (CloseInfo::Always, CloseInfo::Never) | (CloseInfo::Never, CloseInfo::Always)
            );
            if flipped || chan.max_q_count > known.max_q_count {
                return true;
            }
        }
        if use_hb {
            for (id, recs) in &run.selects {
                let Some(seen) = self.selects.get(id) else {
                    return true;
                };
                if recs.iter().any(|r| !seen.contains(&r.chosen)) {
                    return true;
                }
            }
        }
        false
    }

    pub fn score(&self, run: &RunStats, tuning: &Tuning, use_hb: bool) -> f64 {
        let mut s: f64 = run.pairs.values().map(|com| com.log2()).sum();
        s += tuning.gfuzz_w1 * run.channels.len() as f64;
        s += tuning.gfuzz_w2 * run.number_closes as f64;
        s += tuning.gfuzz_w3 * run.channels.values().map(|c| c.max_q_count as f64).sum::<f64>();
        if use_hb {
            s += tuning.gfuzz_w4 * run.cases_with_partner as f64;
        }
        s
    }

    /// `ceil(5 * score / max score so far)`.
    pub fn number_of_mutations(&mut self, score: f64) -> usize {
        self.max_score = self.max_score.max(score);
        if self.max_score <= 0.0 {
            return 1;
        }
        (5.0 * score / self.max_score).ceil().max(0.0) as usize
    }

    /// Up to `count` fresh select mutations of `run`'s choices.
    pub fn select_mutations(
        &mut self,
        run: &RunStats,
        tuning: &Tuning,
        count: usize,
        rng: &mut ChaCha20Rng,
    ) -> Vec<SelectChoices> {
        if run.selects.is_empty() {
            return Vec::new();
        }
        let flip = flip_probability(tuning, run.number_selects);
        let mut out = Vec::new();
        for _ in 0..count {
            let choices: SelectChoices = run
                .selects
                .iter()
                .map(|(id, recs)| {
                    let cases = recs
                        .iter()
                        .map(|rec| {
                            if next_unit(rng) >= flip {
                                return rec.chosen;
                            }
                            choose_other_case(rec, rng).unwrap_or(rec.chosen)
                        })
                        .collect();
                    (id.clone(), cases)
                })
                .collect();
            let seen = self.mutations.entry(choices_key(&choices)).or_insert(0);
            if *seen < MAX_RUNS_PER_MUTATION {
                *seen += 1;
                out.push(choices);
            }
        }
        out
    }

    /// `(replay id, occurrence)` delays, at most [`MAX_FLOW_MUTATIONS`] per run.
    pub fn flow_mutations(&mut self, trace: &Trace, candidates: &[FlowCandidate]) -> Vec<(String, usize)> {
        let mut ordered: Vec<&FlowCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.kind);
        let mut out = Vec::new();
        for cand in ordered {
            if out.len() >= MAX_FLOW_MUTATIONS {
                break;
            }
            let Some(e) = cand.elem.and_then(|id| trace.get(id)) else {
                continue;
            };
            let key = (e.replay_id(), cand.counter);
            if self.delayed.insert(key.clone()) {
                out.push(key);
            }
        }
        out
    }

    /// Fold a finished run into the history.
    pub fn merge(&mut self, run: &RunStats) {
        for chan in run.channels.values() {
            match self.channels.get_mut(&chan.global_id) {
                None => {
                    self.channels.insert(chan.global_id.clone(), chan.clone());
                }
                Some(known) => {
                    known.close = known.close.merge(chan.close);
                    known.max_q_count = known.max_q_count.max(chan.max_q_count);
                }
            }
        }
        let n = self.runs as f64;
        for (key, com) in &run.pairs {
            self.pairs
                .entry(key.clone())
                .and_modify(|mean| *mean = (n * *mean + com) / (n + 1.0))
                .or_insert(*com);
        }
        for (id, recs) in &run.selects {
            self.selects.entry(id.clone()).or_default().extend(recs.iter().map(|r| r.chosen));
        }
        self.runs += 1;
    }
}

/// `selectId;case,...` per select, `#`, then `elemId;counter` per delay.
pub fn write_fuzzing_data(path: &Path, selects: &SelectChoices, delay: Option<&(String, usize)>) -> HbResult<()> {
    let mut out = String::new();
    for (id, cases) in selects {
        let cases: Vec<String> = cases.iter().map(i64::to_string).collect();
        out.push_str(&format!("{id};{}\n", cases.join(",")));
    }
    out.push_str("#\n");
    if let Some((id, counter)) = delay {
        out.push_str(&format!("{id};{counter}\n"));
    }
    crate::write_atomic(path, out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_routine, seeded_rng, FlowKind, ReadOptions};

    fn trace_of(routines: &[&str]) -> Trace {
        let mut trace = Trace::new();
        for (i, content) in routines.iter().enumerate() {
            read_routine(&mut trace, i as u32 + 1, content, ReadOptions::default());
        }
        trace.sort();
        trace.link_partners();
        trace
    }

    fn ping() -> Trace {
        trace_of(&[
            "N,1,4,C,2,m.go:3\nG,2,2,m.go:4\nS,5,8,9,C.5.8.4.R.f.1.2.0~C.5.0.6.R.f.0.0.0~d,0,m.go:9\nE,20",
            "C,6,8,4,S,f,1,2,1,w.go:7\nE,21",
        ])
    }

    #[test]
    fn first_run_is_interesting_and_repeat_is_not() {
        let trace = ping();
        let run = RunStats::collect(&trace, 1);
        let mut history = GFuzzHistory::new();
        assert!(history.is_interesting(&run, true));
        history.merge(&run);
        assert!(!history.is_interesting(&run, true));
        assert_eq!(run.observed_choices().get("1:m.go:9"), Some(&vec![0]));
    }

    #[test]
    fn creation_in_a_later_routine_keeps_earlier_stats() {
        let trace = trace_of(&[
            "C,1,2,4,S,f,1,2,1,m.go:7\nC,5,6,4,C,f,0,0,0,m.go:8\nE,10",
            "N,3,4,C,2,w.go:3\nE,11",
        ]);
        let run = RunStats::collect(&trace, 0);
        let chan = run.channels.get(&4).expect("channel 4");
        assert_eq!(chan.global_id, "w.go:3");
        assert_eq!(chan.close, CloseInfo::Always);
        assert_eq!(chan.max_q_count, 1);
        assert_eq!(run.number_closes, 1);
    }

    #[test]
    fn new_select_case_is_interesting_only_with_hb() {
        let trace = ping();
        let run = RunStats::collect(&trace, 0);
        let mut history = GFuzzHistory::new();
        history.merge(&run);

        let mut flipped = run.clone();
        for recs in flipped.selects.values_mut() {
            recs[0].chosen = 1;
        }
        assert!(history.is_interesting(&flipped, true));
        assert!(!history.is_interesting(&flipped, false));
    }

    #[test]
    fn score_and_mutation_count() {
        let trace = ping();
        let run = RunStats::collect(&trace, 1);
        let tuning = Tuning::default();
        let mut history = GFuzzHistory::new();
        let s = history.score(&run, &tuning, true);
        // one channel, no close, peak 1, one case with partner
        assert_eq!(s, 10.0 + 10.0 + 10.0);
        assert_eq!(history.number_of_mutations(s), 5);
        assert_eq!(history.number_of_mutations(s / 2.0), 3);
    }

    #[test]
    fn flip_probability_is_floored() {
        let t = Tuning::default();
        assert!((flip_probability(&t, 1) - 0.99).abs() < 1e-9);
        assert_eq!(flip_probability(&t, 1000), 0.1);
    }

    #[test]
    fn identical_mutations_are_capped() {
        let trace = ping();
        let run = RunStats::collect(&trace, 1);
        let mut tuning = Tuning::default();
        tuning.flip_p_min = 1.0;
        let mut history = GFuzzHistory::new();
        let (mut rng, _) = seeded_rng(Some(1));
        let muts = history.select_mutations(&run, &tuning, 20, &mut rng);
        // Two alternatives to case 0 (case 1 and default), each at most twice.
        assert!(muts.len() <= 4);
        assert!(muts.iter().all(|m| m["1:m.go:9"][0] != 0));
    }

    #[test]
    fn flow_delays_are_not_repeated() {
        let trace = ping();
        let elem = trace.ids().find(|id| trace.elem(*id).channel().is_some());
        let cand = FlowCandidate {
            kind: FlowKind::Send,
            pos: "w.go:7".to_string(),
            counter: 1,
            elem,
        };
        let mut history = GFuzzHistory::new();
        assert_eq!(
            history.flow_mutations(&trace, std::slice::from_ref(&cand)),
            vec![("2:w.go:7".to_string(), 1)]
        );
        assert!(history.flow_mutations(&trace, &[cand]).is_empty());
    }

    #[test]
    fn fuzzing_data_layout() {
        let dir = std::env::temp_dir().join(format!("hbtrace-gfuzz-{}", uuid::Uuid::new_v4()));
        let path = dir.join(FUZZING_DATA_FILE);
        let selects = SelectChoices::from([("1:m.go:9".to_string(), vec![1, -1])]);
        write_fuzzing_data(&path, &selects, Some(&("2:w.go:7".to_string(), 3))).expect("write");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "1:m.go:9;1,-1\n#\n2:w.go:7;3\n"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
