//! Trace directory ingestion.

use serde::{Deserialize, Serialize};

use std::path::Path;

use crate::{
    AtomicKind, ChannelDir, ChannelOp, CondKind, Element, ElementKind, HbError, HbResult, MutexKind, MutexOp,
    ObjectId, Position, RoutineId, SelectCase, SelectOp, Trace, WaitGroupKind, WaitGroupOp,
};

pub const TRACE_INFO_FILE: &str = "trace_info.log";

/// Facts about the recorded run from `trace_info.log`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "exitPosition", skip_serializing_if = "Option::is_none")]
    pub exit_position: Option<Position>,
    #[serde(rename = "runtimeSecs")]
    pub runtime_secs: f64,
    #[serde(rename = "replayTimeout")]
    pub replay_timeout: bool,
    #[serde(rename = "replayDisabled")]
    pub replay_disabled: bool,
    #[serde(rename = "replayAck")]
    pub replay_ack: bool,
}

impl RunInfo {
    pub fn any_timeout(&self) -> bool {
        self.replay_timeout || self.replay_disabled || self.replay_ack
    }

    pub fn parse(content: &str) -> Self {
        let mut out = Self::default();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('!') else {
                tracing::warn!("ignoring trace info line {line:?}");
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "ExitCode" => out.exit_code = value.parse().unwrap_or(0),
                "ExitPosition" => out.exit_position = Position::parse(value).ok(),
                "Runtime" => out.runtime_secs = value.parse().unwrap_or(0.0),
                "ReplayTimeout" => out.replay_timeout = parse_flag(value),
                "ReplayDisabled" => out.replay_disabled = parse_flag(value),
                "ReplayAck" => out.replay_ack = parse_flag(value),
                other => tracing::debug!("unknown trace info key {other}"),
            }
        }
        out
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("ExitCode!{}\n", self.exit_code);
        if let Some(pos) = &self.exit_position {
            out.push_str(&format!("ExitPosition!{pos}\n"));
        }
        out.push_str(&format!("Runtime!{}\n", self.runtime_secs));
        out.push_str(&format!("ReplayTimeout!{}\n", self.replay_timeout));
        out.push_str(&format!("ReplayDisabled!{}\n", self.replay_disabled));
        out.push_str(&format!("ReplayAck!{}\n", self.replay_ack));
        out
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "true" | "t" | "1")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub ignore_atomics: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub trace: Trace,
    pub info: RunInfo,
    /// Records that failed to parse and were skipped.
    pub skipped: usize,
}

/// Read every `trace_<r>.log` in `dir`, sort, and link channel partners.
pub fn read_trace_dir(dir: &Path, opts: ReadOptions) -> HbResult<ReadOutcome> {
    let files = crate::find_trace_files(dir)?;
    let mut trace = Trace::new();
    let mut skipped = 0usize;
    let max_routine = files.iter().map(|(r, _)| *r).max().unwrap_or(0);
    for r in 1..=max_routine {
        trace.add_routine(r);
    }
    for (routine, path) in &files {
        let content = std::fs::read_to_string(path)?;
        skipped += read_routine(&mut trace, *routine, &content, opts);
    }
    trace.sort();
    trace.link_partners();

    let info_path = dir.join(TRACE_INFO_FILE);
    let info = match std::fs::read_to_string(&info_path) {
        Ok(content) => RunInfo::parse(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => RunInfo::default(),
        Err(err) => return Err(err.into()),
    };
    tracing::debug!(
        "read {} elements in {} routines from {}",
        trace.len(),
        max_routine,
        dir.display()
    );
    Ok(ReadOutcome { trace, info, skipped })
}

/// Parse one routine's records into `trace`. Returns how many were skipped.
pub fn read_routine(trace: &mut Trace, routine: RoutineId, content: &str, opts: ReadOptions) -> usize {
    trace.add_routine(routine);
    let mut skipped = 0;
    for (idx, line) in content.lines().enumerate() {
        for record in line.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            match parse_element(record, routine, idx + 1) {
                Ok(elem) => {
                    if opts.ignore_atomics && matches!(elem.kind, ElementKind::Atomic { .. }) {
                        continue;
                    }
                    trace.push(elem);
                }
                Err(err) => {
                    tracing::warn!("routine {routine}: skipping record {record:?}: {err}");
                    skipped += 1;
                }
            }
        }
    }
    skipped
}

fn num<T: std::str::FromStr>(field: Option<&&str>, name: &str, line: usize) -> HbResult<T> {
    let raw = field.ok_or_else(|| HbError::parse(line, format!("missing {name}")))?;
    raw.trim()
        .parse::<T>()
        .map_err(|_| HbError::parse(line, format!("invalid {name} {raw:?}")))
}

fn object_id(field: Option<&&str>, line: usize) -> HbResult<ObjectId> {
    match field {
        Some(raw) if raw.trim() == "*" => Ok(-1),
        other => num(other, "id", line),
    }
}

fn flag(field: Option<&&str>, name: &str, line: usize) -> HbResult<bool> {
    match field.map(|f| f.trim()) {
        Some("t") => Ok(true),
        Some("f") => Ok(false),
        other => Err(HbError::parse(line, format!("invalid {name} {other:?}"))),
    }
}

fn position(fields: &[&str], from: usize, line: usize) -> HbResult<Option<Position>> {
    if fields.len() <= from {
        return Ok(None);
    }
    let raw = fields[from..].join(",");
    Position::parse(raw.trim())
        .map(Some)
        .map_err(|e| HbError::parse(line, e.to_string()))
}

fn expect_len(fields: &[&str], min: usize, tag: &str, line: usize) -> HbResult<()> {
    if fields.len() < min {
        return Err(HbError::parse(
            line,
            format!("{tag} record needs {min} fields, got {}", fields.len()),
        ));
    }
    Ok(())
}

/// Parse `C.tPre.tPost.id.op.closed.oID.qSize[.qCount]` (or the `C,...` form).
fn channel_fields(fields: &[&str], line: usize) -> HbResult<(u64, u64, ChannelOp)> {
    expect_len(fields, 8, "channel", line)?;
    let t_pre = num(fields.get(1), "tPre", line)?;
    let t_post = num(fields.get(2), "tPost", line)?;
    let id = object_id(fields.get(3), line)?;
    let dir = fields
        .get(4)
        .and_then(|f| ChannelDir::from_code(f.trim()))
        .ok_or_else(|| HbError::parse(line, "invalid channel op"))?;
    let closed = flag(fields.get(5), "closed", line)?;
    let oid = num(fields.get(6), "oID", line)?;
    let q_size = num(fields.get(7), "qSize", line)?;
    let q_count = match fields.get(8) {
        Some(f) if !f.trim().is_empty() => num(Some(f), "qCount", line)?,
        _ => 0,
    };
    Ok((
        t_pre,
        t_post,
        ChannelOp {
            id,
            dir,
            closed,
            oid,
            q_size,
            q_count,
            partner: None,
        },
    ))
}

pub fn parse_element(record: &str, routine: RoutineId, line: usize) -> HbResult<Element> {
    let fields: Vec<&str> = record.split(',').collect();
    let tag = fields.first().map(|f| f.trim()).unwrap_or("");
    let elem = match tag {
        "A" => {
            expect_len(&fields, 4, "A", line)?;
            let t_post: u64 = num(fields.get(1), "tPost", line)?;
            let id = object_id(fields.get(2), line)?;
            let op = fields
                .get(3)
                .and_then(|f| AtomicKind::from_code(f.trim()))
                .ok_or_else(|| HbError::parse(line, "invalid atomic op"))?;
            Element::new(routine, t_post, t_post, position(&fields, 4, line)?, ElementKind::Atomic { id, op })
        }
        "C" => {
            expect_len(&fields, 9, "C", line)?;
            // qCount is optional; the position follows the last numeric field.
            let has_count = fields.len() >= 10 && fields[8].trim().parse::<u64>().is_ok();
            let end = if has_count { 9 } else { 8 };
            let (t_pre, t_post, op) = channel_fields(&fields[..end], line)?;
            Element::new(routine, t_pre, t_post, position(&fields, end, line)?, ElementKind::Channel(op))
        }
        "S" => {
            expect_len(&fields, 6, "S", line)?;
            let t_pre: u64 = num(fields.get(1), "tPre", line)?;
            let t_post: u64 = num(fields.get(2), "tPost", line)?;
            let id = object_id(fields.get(3), line)?;
            let mut cases = Vec::new();
            let mut contains_default = false;
            let mut chosen_default = false;
            for raw in fields[4].split('~').map(str::trim).filter(|c| !c.is_empty()) {
                match raw {
                    "d" => contains_default = true,
                    "D" => {
                        contains_default = true;
                        chosen_default = true;
                    }
                    _ => {
                        let parts: Vec<&str> = raw.split('.').collect();
                        let (ct_pre, ct_post, op) = channel_fields(&parts, line)?;
                        cases.push(SelectCase {
                            t_pre: ct_pre,
                            t_post: ct_post,
                            op,
                        });
                    }
                }
            }
            let chosen_index: i64 = num(fields.get(5), "chosenIndex", line)?;
            let chosen_default = chosen_default || (chosen_index < 0 && contains_default && t_post != 0);
            if chosen_index >= cases.len() as i64 {
                return Err(HbError::parse(line, format!("chosen case {chosen_index} out of range")));
            }
            Element::new(
                routine,
                t_pre,
                t_post,
                position(&fields, 6, line)?,
                ElementKind::Select(SelectOp {
                    id,
                    cases,
                    contains_default,
                    chosen_default,
                    chosen_index,
                    cases_with_partner: Vec::new(),
                }),
            )
        }
        "M" => {
            expect_len(&fields, 7, "M", line)?;
            let kind = fields
                .get(5)
                .and_then(|f| MutexKind::from_code(f.trim()))
                .ok_or_else(|| HbError::parse(line, "invalid mutex op"))?;
            Element::new(
                routine,
                num(fields.get(1), "tPre", line)?,
                num(fields.get(2), "tPost", line)?,
                position(&fields, 7, line)?,
                ElementKind::Mutex(MutexOp {
                    id: object_id(fields.get(3), line)?,
                    rw: fields.get(4).map(|f| f.trim() == "R").unwrap_or(false),
                    kind,
                    success: flag(fields.get(6), "suc", line)?,
                }),
            )
        }
        "W" => {
            expect_len(&fields, 7, "W", line)?;
            let kind = match fields.get(4).map(|f| f.trim()) {
                Some("A") => WaitGroupKind::Change,
                Some("W") => WaitGroupKind::Wait,
                other => return Err(HbError::parse(line, format!("invalid wait group op {other:?}"))),
            };
            Element::new(
                routine,
                num(fields.get(1), "tPre", line)?,
                num(fields.get(2), "tPost", line)?,
                position(&fields, 7, line)?,
                ElementKind::WaitGroup(WaitGroupOp {
                    id: object_id(fields.get(3), line)?,
                    kind,
                    delta: num(fields.get(5), "delta", line)?,
                    value: num(fields.get(6), "val", line)?,
                }),
            )
        }
        "O" => {
            expect_len(&fields, 5, "O", line)?;
            Element::new(
                routine,
                num(fields.get(1), "tPre", line)?,
                num(fields.get(2), "tPost", line)?,
                position(&fields, 5, line)?,
                ElementKind::Once {
                    id: object_id(fields.get(3), line)?,
                    success: flag(fields.get(4), "suc", line)?,
                },
            )
        }
        "D" => {
            expect_len(&fields, 5, "D", line)?;
            let op = match fields.get(4).map(|f| f.trim()) {
                Some("W") => CondKind::Wait,
                Some("S") => CondKind::Signal,
                Some("B") => CondKind::Broadcast,
                other => return Err(HbError::parse(line, format!("invalid cond op {other:?}"))),
            };
            Element::new(
                routine,
                num(fields.get(1), "tPre", line)?,
                num(fields.get(2), "tPost", line)?,
                position(&fields, 5, line)?,
                ElementKind::Cond {
                    id: object_id(fields.get(3), line)?,
                    op,
                },
            )
        }
        "N" => {
            expect_len(&fields, 5, "N", line)?;
            let t_post: u64 = num(fields.get(1), "tPost", line)?;
            let object = fields
                .get(3)
                .map(|f| f.trim().to_string())
                .ok_or_else(|| HbError::parse(line, "missing elemType"))?;
            Element::new(
                routine,
                t_post,
                t_post,
                position(&fields, 5, line)?,
                ElementKind::New {
                    id: object_id(fields.get(2), line)?,
                    object,
                    num: num(fields.get(4), "num", line)?,
                },
            )
        }
        "G" => {
            expect_len(&fields, 3, "G", line)?;
            let t_post: u64 = num(fields.get(1), "tPost", line)?;
            Element::new(
                routine,
                t_post,
                t_post,
                position(&fields, 3, line)?,
                ElementKind::Fork {
                    new_routine: num(fields.get(2), "newRoutine", line)?,
                },
            )
        }
        "E" => {
            let t_post: u64 = num(fields.get(1), "tPost", line)?;
            Element::new(routine, t_post, t_post, None, ElementKind::RoutineEnd)
        }
        "X" => {
            let t_post: u64 = num(fields.get(1), "tPost", line)?;
            Element::new(
                routine,
                t_post,
                t_post,
                None,
                ElementKind::ReplayMarker {
                    exit_code: num(fields.get(2), "exitCode", line)?,
                },
            )
        }
        other => return Err(HbError::parse(line, format!("unknown record tag {other:?}"))),
    };
    if elem.t_post != 0 && elem.t_pre > elem.t_post {
        return Err(HbError::parse(line, "tPre is after tPost"));
    }
    Ok(elem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDS: &[&str] = &[
        "A,4,9,S,a.go:1",
        "C,2,3,1,C,f,0,0,0,f.go:2",
        "C,4,0,*,R,f,0,0,0,f.go:9",
        "S,5,7,3,C.5.7.1.R.f.2.0.0~C.5.0.2.S.f.0.1.0~d,0,s.go:4",
        "S,8,9,4,C.8.0.1.R.f.0.0.0~D,-1,s.go:8",
        "M,10,11,2,R,N,t,m.go:3",
        "W,12,13,7,A,-1,0,w.go:5",
        "O,14,15,5,t,o.go:1",
        "D,16,0,6,W,c.go:2",
        "N,1,1,C,2,f.go:1",
        "G,17,3,g.go:7",
        "E,18",
        "X,19,30",
    ];

    #[test]
    fn records_survive_a_parse_and_serialise_cycle() {
        for record in RECORDS {
            let elem = parse_element(record, 1, 1).expect("valid record");
            assert_eq!(&elem.to_record(), record);
        }
    }

    #[test]
    fn short_channel_records_and_defaults() {
        let e = parse_element("C,2,3,4,S,f,1,2,f.go:7", 1, 1).expect("valid");
        let op = e.channel().expect("channel");
        assert_eq!((op.q_size, op.q_count), (2, 0));
        assert_eq!(e.pos_string(), "f.go:7");

        let sel = parse_element("S,8,9,4,C.8.0.1.R.f.0.0~D,-1,s.go:8", 1, 1).expect("valid");
        let sel = sel.select().expect("select");
        assert!(sel.chosen_default && sel.contains_default);
        assert!(sel.chosen_case().is_none());
    }

    #[test]
    fn malformed_records_are_rejected() {
        for bad in [
            "Q,1,2",
            "C,2,3,1,Z,f,0,0,0,f.go:2",
            "M,1,2,3,-,L,x,m.go:1",
            "C,5,3,1,S,f,0,0,0,f.go:2",
            "S,1,2,3,C.1.2.1.R.f.0.0.0,4,s.go:1",
            "A,1",
        ] {
            assert!(parse_element(bad, 1, 1).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn read_routine_skips_bad_records_and_atomics_on_request() {
        let mut trace = Trace::new();
        let skipped = read_routine(
            &mut trace,
            1,
            "A,1,1,L,a.go:1\nbogus\nC,2,3,1,C,f,0,0,0,f.go:2; E,4\n",
            ReadOptions { ignore_atomics: true },
        );
        assert_eq!(skipped, 1);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn trace_info_lines() {
        let info = RunInfo::parse("ExitCode!30\nExitPosition!f.go:3\nRuntime!1.5\nReplayTimeout!true\nnoise\n");
        assert_eq!(info.exit_code, 30);
        assert_eq!(info.exit_position, Some(Position::new("f.go", 3)));
        assert!(info.replay_timeout && info.any_timeout());
        assert_eq!(RunInfo::parse(&info.to_text()), info);
    }

    #[test]
    fn directory_read_links_partners() {
        let dir = std::env::temp_dir().join(format!("hbtrace-reader-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join("trace_1.log"), "C,1,3,1,S,f,1,0,0,a.go:1\n").expect("write");
        std::fs::write(dir.join("trace_3.log"), "C,2,3,1,R,f,1,0,0,a.go:2\n").expect("write");
        std::fs::write(dir.join(TRACE_INFO_FILE), "ExitCode!0\n").expect("write");
        let out = read_trace_dir(&dir, ReadOptions::default()).expect("read");
        assert_eq!(out.trace.num_routines(), 3);
        assert!(out.trace.routine(2).is_empty());
        let send = out.trace.routine(1)[0];
        let recv = out.trace.routine(3)[0];
        assert_eq!(out.trace.elem(send).partner(), Some(recv));
        assert_eq!(out.info.exit_code, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
