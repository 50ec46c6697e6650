//! Trace elements: one recorded primitive operation each.

use serde::{Deserialize, Serialize};

use crate::{HbError, HbResult, RoutineId, VectorClock};

/// Index of an element in its trace's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElemId(pub usize);

/// Object id as recorded; `-1` stands for an anonymous or nil channel (`*`).
pub type ObjectId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    pub line: u32,
}

impl Position {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    pub fn parse(raw: &str) -> HbResult<Self> {
        let (file, line) = raw
            .rsplit_once(':')
            .ok_or_else(|| HbError::InvalidArgument(format!("position {raw:?} is not file:line")))?;
        let line = line
            .trim()
            .parse::<u32>()
            .map_err(|_| HbError::InvalidArgument(format!("position {raw:?} has a non-numeric line")))?;
        Ok(Self::new(file, line))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicKind {
    Load,
    Store,
    Add,
    Swap,
    CompSwap,
    And,
    Or,
}

impl AtomicKind {
    pub fn code(self) -> char {
        match self {
            Self::Load => 'L',
            Self::Store => 'S',
            Self::Add => 'A',
            Self::Swap => 'W',
            Self::CompSwap => 'C',
            Self::And => 'N',
            Self::Or => 'O',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "L" => Self::Load,
            "S" => Self::Store,
            "A" => Self::Add,
            "W" => Self::Swap,
            "C" => Self::CompSwap,
            "N" => Self::And,
            "O" => Self::Or,
            _ => return None,
        })
    }

    pub fn reads(self) -> bool {
        matches!(self, Self::Load | Self::Swap | Self::CompSwap)
    }

    pub fn writes(self) -> bool {
        !matches!(self, Self::Load)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDir {
    Send,
    Recv,
    Close,
}

impl ChannelDir {
    pub fn code(self) -> char {
        match self {
            Self::Send => 'S',
            Self::Recv => 'R',
            Self::Close => 'C',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "S" => Self::Send,
            "R" => Self::Recv,
            "C" => Self::Close,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOp {
    pub id: ObjectId,
    pub dir: ChannelDir,
    pub closed: bool,
    pub oid: u64,
    pub q_size: u64,
    pub q_count: u64,
    /// Set at most once, on both sides of a matched send/recv.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<ElemId>,
}

impl ChannelOp {
    pub fn is_buffered(&self) -> bool {
        self.q_size != 0
    }

    pub fn obj_type(&self) -> &'static str {
        match self.dir {
            ChannelDir::Send => "CS",
            ChannelDir::Recv => "CR",
            ChannelDir::Close => "CC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectCase {
    pub t_pre: u64,
    pub t_post: u64,
    pub op: ChannelOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOp {
    pub id: ObjectId,
    pub cases: Vec<SelectCase>,
    pub contains_default: bool,
    pub chosen_default: bool,
    /// `-1` when the default case (or nothing) was chosen.
    pub chosen_index: i64,
    /// Cases for which a VC-feasible partner exists somewhere in the trace.
    #[serde(default)]
    pub cases_with_partner: Vec<usize>,
}

impl SelectOp {
    pub fn chosen_case(&self) -> Option<&SelectCase> {
        if self.chosen_default || self.chosen_index < 0 {
            return None;
        }
        self.cases.get(self.chosen_index as usize)
    }

    pub fn chosen_case_mut(&mut self) -> Option<&mut SelectCase> {
        if self.chosen_default || self.chosen_index < 0 {
            return None;
        }
        self.cases.get_mut(self.chosen_index as usize)
    }

    pub fn partner(&self) -> Option<ElemId> {
        self.chosen_case().and_then(|c| c.op.partner)
    }

    pub fn add_case_with_partner(&mut self, case: usize) {
        if !self.cases_with_partner.contains(&case) {
            self.cases_with_partner.push(case);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexKind {
    Lock,
    RLock,
    TryLock,
    TryRLock,
    Unlock,
    RUnlock,
}

impl MutexKind {
    pub fn code(self) -> char {
        match self {
            Self::Lock => 'L',
            Self::RLock => 'R',
            Self::TryLock => 'T',
            Self::TryRLock => 'Y',
            Self::Unlock => 'U',
            Self::RUnlock => 'N',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "L" => Self::Lock,
            "R" => Self::RLock,
            "T" => Self::TryLock,
            "Y" => Self::TryRLock,
            "U" => Self::Unlock,
            "N" => Self::RUnlock,
            _ => return None,
        })
    }

    pub fn is_acquire(self) -> bool {
        matches!(self, Self::Lock | Self::RLock | Self::TryLock | Self::TryRLock)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::RLock | Self::TryRLock | Self::RUnlock)
    }

    pub fn is_try(self) -> bool {
        matches!(self, Self::TryLock | Self::TryRLock)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexOp {
    pub id: ObjectId,
    pub rw: bool,
    pub kind: MutexKind,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitGroupKind {
    Change,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitGroupOp {
    pub id: ObjectId,
    pub kind: WaitGroupKind,
    pub delta: i64,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondKind {
    Wait,
    Signal,
    Broadcast,
}

impl CondKind {
    pub fn code(self) -> char {
        match self {
            Self::Wait => 'W',
            Self::Signal => 'S',
            Self::Broadcast => 'B',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    Atomic { id: ObjectId, op: AtomicKind },
    Channel(ChannelOp),
    Select(SelectOp),
    Mutex(MutexOp),
    WaitGroup(WaitGroupOp),
    Cond { id: ObjectId, op: CondKind },
    Once { id: ObjectId, success: bool },
    Fork { new_routine: RoutineId },
    RoutineEnd,
    New { id: ObjectId, object: String, num: i64 },
    ReplayMarker { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub trace_id: u64,
    pub routine: RoutineId,
    pub t_pre: u64,
    pub t_post: u64,
    /// Not applicable for routine ends and replay markers.
    pub pos: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vc: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wvc: Option<VectorClock>,
    pub kind: ElementKind,
}

impl Element {
    pub fn new(routine: RoutineId, t_pre: u64, t_post: u64, pos: Option<Position>, kind: ElementKind) -> Self {
        Self {
            trace_id: 0,
            routine,
            t_pre,
            t_post,
            pos,
            vc: None,
            wvc: None,
            kind,
        }
    }

    pub fn replay_marker(t: u64, exit_code: i32) -> Self {
        Self::new(1, t, t, None, ElementKind::ReplayMarker { exit_code })
    }

    /// `tPost`, or `u64::MAX` for blocked elements so they sort last.
    pub fn t_sort(&self) -> u64 {
        if self.t_post == 0 {
            u64::MAX
        } else {
            self.t_post
        }
    }

    pub fn is_executed(&self) -> bool {
        self.t_post != 0
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.kind {
            ElementKind::Atomic { id, .. }
            | ElementKind::Cond { id, .. }
            | ElementKind::Once { id, .. }
            | ElementKind::New { id, .. } => Some(*id),
            ElementKind::Channel(op) => Some(op.id),
            ElementKind::Select(sel) => Some(sel.id),
            ElementKind::Mutex(op) => Some(op.id),
            ElementKind::WaitGroup(op) => Some(op.id),
            ElementKind::Fork { new_routine } => Some(i64::from(*new_routine)),
            ElementKind::RoutineEnd | ElementKind::ReplayMarker { .. } => None,
        }
    }

    /// One-letter record tag.
    pub fn tag(&self) -> char {
        match &self.kind {
            ElementKind::Atomic { .. } => 'A',
            ElementKind::Channel(_) => 'C',
            ElementKind::Cond { .. } => 'D',
            ElementKind::RoutineEnd => 'E',
            ElementKind::Fork { .. } => 'G',
            ElementKind::Mutex(_) => 'M',
            ElementKind::New { .. } => 'N',
            ElementKind::Once { .. } => 'O',
            ElementKind::Select(_) => 'S',
            ElementKind::WaitGroup(_) => 'W',
            ElementKind::ReplayMarker { .. } => 'X',
        }
    }

    /// Two-letter object type used in result files.
    pub fn obj_type(&self) -> String {
        match &self.kind {
            ElementKind::Atomic { op, .. } => format!("A{}", op.code()),
            ElementKind::Channel(op) => op.obj_type().to_string(),
            ElementKind::Select(_) => "SS".to_string(),
            ElementKind::Mutex(op) => format!("M{}", op.kind.code()),
            ElementKind::WaitGroup(op) => match op.kind {
                WaitGroupKind::Wait => "WW".to_string(),
                WaitGroupKind::Change if op.delta < 0 => "WD".to_string(),
                WaitGroupKind::Change => "WA".to_string(),
            },
            ElementKind::Cond { op, .. } => format!("D{}", op.code()),
            ElementKind::Once { success, .. } => if *success { "OE" } else { "ON" }.to_string(),
            ElementKind::Fork { .. } => "GF".to_string(),
            ElementKind::RoutineEnd => "RE".to_string(),
            ElementKind::New { object, .. } => format!("N{object}"),
            ElementKind::ReplayMarker { .. } => "XR".to_string(),
        }
    }

    /// `file:line@tPre`; elements without a position use `-`.
    pub fn tid(&self) -> String {
        match &self.pos {
            Some(pos) => format!("{pos}@{}", self.t_pre),
            None => format!("-@{}", self.t_pre),
        }
    }

    /// Stable across runs: `routine:file:line`.
    pub fn replay_id(&self) -> String {
        match &self.pos {
            Some(pos) => format!("{}:{}:{}", self.routine, pos.file, pos.line),
            None => format!("{}:-:0", self.routine),
        }
    }

    pub fn pos_string(&self) -> String {
        self.pos.as_ref().map(|p| p.to_string()).unwrap_or_default()
    }

    pub fn channel(&self) -> Option<&ChannelOp> {
        match &self.kind {
            ElementKind::Channel(op) => Some(op),
            _ => None,
        }
    }

    pub fn select(&self) -> Option<&SelectOp> {
        match &self.kind {
            ElementKind::Select(sel) => Some(sel),
            _ => None,
        }
    }

    pub fn select_mut(&mut self) -> Option<&mut SelectOp> {
        match &mut self.kind {
            ElementKind::Select(sel) => Some(sel),
            _ => None,
        }
    }

    pub fn mutex(&self) -> Option<&MutexOp> {
        match &self.kind {
            ElementKind::Mutex(op) => Some(op),
            _ => None,
        }
    }

    pub fn wait_group(&self) -> Option<&WaitGroupOp> {
        match &self.kind {
            ElementKind::WaitGroup(op) => Some(op),
            _ => None,
        }
    }

    /// The channel operation behind this element: itself, or a select's chosen case.
    pub fn effective_channel(&self) -> Option<&ChannelOp> {
        match &self.kind {
            ElementKind::Channel(op) => Some(op),
            ElementKind::Select(sel) => sel.chosen_case().map(|c| &c.op),
            _ => None,
        }
    }

    pub fn effective_channel_mut(&mut self) -> Option<&mut ChannelOp> {
        match &mut self.kind {
            ElementKind::Channel(op) => Some(op),
            ElementKind::Select(sel) => sel.chosen_case_mut().map(|c| &mut c.op),
            _ => None,
        }
    }

    pub fn partner(&self) -> Option<ElemId> {
        self.effective_channel().and_then(|op| op.partner)
    }

    pub fn set_t_pre(&mut self, t_pre: u64) {
        self.t_pre = t_pre;
        if self.t_post != 0 && self.t_post < t_pre {
            self.t_post = t_pre;
        }
        if let ElementKind::Select(sel) = &mut self.kind {
            for case in &mut sel.cases {
                case.t_pre = t_pre;
                if case.t_post != 0 && case.t_post < t_pre {
                    case.t_post = t_pre;
                }
            }
        }
    }

    /// Sets both timestamps.
    pub fn set_t(&mut self, t: u64) {
        self.t_pre = t;
        self.t_post = t;
        if let ElementKind::Select(sel) = &mut self.kind {
            let chosen = sel.chosen_index;
            let chosen_default = sel.chosen_default;
            for (i, case) in sel.cases.iter_mut().enumerate() {
                case.t_pre = t;
                if !chosen_default && i as i64 == chosen {
                    case.t_post = t;
                }
            }
        }
    }

    pub fn set_t_sort(&mut self, t: u64) {
        self.set_t_pre(t);
        self.t_post = t;
        if let Some(case) = self.select_mut().and_then(|s| s.chosen_case_mut()) {
            case.t_post = t;
        }
    }

    /// Like `set_t_sort`, but blocked elements stay blocked.
    pub fn set_t_without_not_executed(&mut self, t: u64) {
        let executed = self.t_post != 0;
        self.set_t_pre(t);
        if executed {
            self.t_post = t;
            if let Some(case) = self.select_mut().and_then(|s| s.chosen_case_mut()) {
                case.t_post = t;
            }
        }
    }

    /// Switch a select to the case on `chan_id` with direction `dir`; `chan_id == -1` picks default.
    pub fn set_select_case(&mut self, chan_id: ObjectId, dir: ChannelDir) -> HbResult<()> {
        let t_post = self.t_post;
        let sel = self
            .select_mut()
            .ok_or_else(|| HbError::Rewrite("set_select_case on a non-select element".to_string()))?;
        if chan_id == -1 {
            if !sel.contains_default {
                return Err(HbError::Rewrite("select has no default case".to_string()));
            }
            sel.chosen_default = true;
            sel.chosen_index = -1;
            for case in &mut sel.cases {
                case.t_post = 0;
            }
            return Ok(());
        }
        let idx = sel
            .cases
            .iter()
            .position(|c| c.op.id == chan_id && c.op.dir == dir)
            .ok_or_else(|| HbError::Rewrite(format!("select has no case on channel {chan_id}")))?;
        for case in &mut sel.cases {
            case.t_post = 0;
        }
        sel.cases[idx].t_post = t_post;
        sel.chosen_index = idx as i64;
        sel.chosen_default = false;
        Ok(())
    }

    /// Serialise as one trace record (the inverse of the reader).
    pub fn to_record(&self) -> String {
        let pos = self.pos_string();
        match &self.kind {
            ElementKind::Atomic { id, op } => format!("A,{},{},{},{pos}", self.t_post, id, op.code()),
            ElementKind::Channel(op) => format!("{},{pos}", channel_fields(self.t_pre, self.t_post, op, ",")),
            ElementKind::Select(sel) => {
                let mut cases: Vec<String> = sel
                    .cases
                    .iter()
                    .map(|c| channel_fields(c.t_pre, c.t_post, &c.op, "."))
                    .collect();
                if sel.contains_default {
                    cases.push(if sel.chosen_default { "D" } else { "d" }.to_string());
                }
                format!(
                    "S,{},{},{},{},{},{pos}",
                    self.t_pre,
                    self.t_post,
                    sel.id,
                    cases.join("~"),
                    sel.chosen_index
                )
            }
            ElementKind::Mutex(op) => format!(
                "M,{},{},{},{},{},{},{pos}",
                self.t_pre,
                self.t_post,
                op.id,
                if op.rw { "R" } else { "-" },
                op.kind.code(),
                bool_code(op.success)
            ),
            ElementKind::WaitGroup(op) => format!(
                "W,{},{},{},{},{},{},{pos}",
                self.t_pre,
                self.t_post,
                op.id,
                match op.kind {
                    WaitGroupKind::Change => 'A',
                    WaitGroupKind::Wait => 'W',
                },
                op.delta,
                op.value
            ),
            ElementKind::Cond { id, op } => format!("D,{},{},{},{},{pos}", self.t_pre, self.t_post, id, op.code()),
            ElementKind::Once { id, success } => {
                format!("O,{},{},{},{},{pos}", self.t_pre, self.t_post, id, bool_code(*success))
            }
            ElementKind::Fork { new_routine } => format!("G,{},{},{pos}", self.t_post, new_routine),
            ElementKind::RoutineEnd => format!("E,{}", self.t_post),
            ElementKind::New { id, object, num } => format!("N,{},{},{},{},{pos}", self.t_post, id, object, num),
            ElementKind::ReplayMarker { exit_code } => format!("X,{},{}", self.t_post, exit_code),
        }
    }
}

fn bool_code(b: bool) -> char {
    if b {
        't'
    } else {
        'f'
    }
}

fn channel_id_string(id: ObjectId) -> String {
    if id == -1 {
        "*".to_string()
    } else {
        id.to_string()
    }
}

fn channel_fields(t_pre: u64, t_post: u64, op: &ChannelOp, sep: &str) -> String {
    [
        "C".to_string(),
        t_pre.to_string(),
        t_post.to_string(),
        channel_id_string(op.id),
        op.dir.code().to_string(),
        bool_code(op.closed).to_string(),
        op.oid.to_string(),
        op.q_size.to_string(),
        op.q_count.to_string(),
    ]
    .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_elem() -> Element {
        let case = |id, dir, t_post| SelectCase {
            t_pre: 5,
            t_post,
            op: ChannelOp {
                id,
                dir,
                closed: false,
                oid: 1,
                q_size: 0,
                q_count: 0,
                partner: None,
            },
        };
        Element::new(
            2,
            5,
            9,
            Some(Position::new("s.go", 3)),
            ElementKind::Select(SelectOp {
                id: 4,
                cases: vec![case(1, ChannelDir::Recv, 9), case(2, ChannelDir::Send, 0)],
                contains_default: true,
                chosen_default: false,
                chosen_index: 0,
                cases_with_partner: Vec::new(),
            }),
        )
    }

    #[test]
    fn blocked_elements_sort_last() {
        let mut e = Element::new(1, 3, 0, None, ElementKind::RoutineEnd);
        assert_eq!(e.t_sort(), u64::MAX);
        e.set_t_without_not_executed(10);
        assert_eq!((e.t_pre, e.t_post), (10, 0));
        e.set_t_sort(11);
        assert_eq!((e.t_pre, e.t_post, e.t_sort()), (11, 11, 11));
    }

    #[test]
    fn set_select_case_moves_the_chosen_post_time() {
        let mut e = select_elem();
        e.set_select_case(2, ChannelDir::Send).expect("case exists");
        let sel = e.select().expect("select");
        assert_eq!(sel.chosen_index, 1);
        assert_eq!(sel.cases[0].t_post, 0);
        assert_eq!(sel.cases[1].t_post, 9);

        e.set_select_case(-1, ChannelDir::Recv).expect("default exists");
        let sel = e.select().expect("select");
        assert!(sel.chosen_default);
        assert!(sel.chosen_case().is_none());
        assert!(e.set_select_case(7, ChannelDir::Send).is_err());
    }

    #[test]
    fn object_types_and_ids() {
        let e = select_elem();
        assert_eq!(e.obj_type(), "SS");
        assert_eq!(e.tid(), "s.go:3@5");
        assert_eq!(e.replay_id(), "2:s.go:3");
        let wg = Element::new(
            1,
            1,
            2,
            Some(Position::new("w.go", 1)),
            ElementKind::WaitGroup(WaitGroupOp {
                id: 7,
                kind: WaitGroupKind::Change,
                delta: -1,
                value: 0,
            }),
        );
        assert_eq!(wg.obj_type(), "WD");
        assert_eq!(wg.object_id(), Some(7));
        assert_eq!(Element::replay_marker(4, 30).object_id(), None);
    }

    #[test]
    fn position_parse_keeps_colons_in_file() {
        let pos = Position::parse("C:/src/a.go:12").expect("valid");
        assert_eq!(pos.file, "C:/src/a.go");
        assert_eq!(pos.line, 12);
        assert!(Position::parse("nofile").is_err());
    }
}
