//! Findings, result files and run summaries.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;

use crate::{ElemId, Element, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Warning,
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BugCode {
    A01,
    A02,
    A03,
    A04,
    A05,
    A06,
    A07,
    A08,
    P01,
    P02,
    P03,
    P04,
    P05,
    L00,
    L01,
    L02,
    L03,
    L04,
    L05,
    L06,
    L07,
    L08,
    L09,
    L10,
    R01,
    R02,
}

impl BugCode {
    pub const ALL: [BugCode; 26] = [
        Self::A01,
        Self::A02,
        Self::A03,
        Self::A04,
        Self::A05,
        Self::A06,
        Self::A07,
        Self::A08,
        Self::P01,
        Self::P02,
        Self::P03,
        Self::P04,
        Self::P05,
        Self::L00,
        Self::L01,
        Self::L02,
        Self::L03,
        Self::L04,
        Self::L05,
        Self::L06,
        Self::L07,
        Self::L08,
        Self::L09,
        Self::L10,
        Self::R01,
        Self::R02,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A01 => "A01",
            Self::A02 => "A02",
            Self::A03 => "A03",
            Self::A04 => "A04",
            Self::A05 => "A05",
            Self::A06 => "A06",
            Self::A07 => "A07",
            Self::A08 => "A08",
            Self::P01 => "P01",
            Self::P02 => "P02",
            Self::P03 => "P03",
            Self::P04 => "P04",
            Self::P05 => "P05",
            Self::L00 => "L00",
            Self::L01 => "L01",
            Self::L02 => "L02",
            Self::L03 => "L03",
            Self::L04 => "L04",
            Self::L05 => "L05",
            Self::L06 => "L06",
            Self::L07 => "L07",
            Self::L08 => "L08",
            Self::L09 => "L09",
            Self::L10 => "L10",
            Self::R01 => "R01",
            Self::R02 => "R02",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::P02 => Severity::Warning,
            Self::A07 | Self::A08 => Severity::Diagnostic,
            _ => Severity::Critical,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::A01 => "Actual send on closed channel",
            Self::A02 => "Actual receive on closed channel",
            Self::A03 => "Actual close on closed channel",
            Self::A04 => "Actual close on nil channel",
            Self::A05 => "Actual negative wait group",
            Self::A06 => "Actual unlock of not locked mutex",
            Self::A07 => "Concurrent receive",
            Self::A08 => "Select case without partner",
            Self::P01 => "Possible send on closed channel",
            Self::P02 => "Possible receive on closed channel",
            Self::P03 => "Possible negative wait group",
            Self::P04 => "Possible unlock of not locked mutex",
            Self::P05 => "Possible cyclic deadlock",
            Self::L00 => "Leak of routine with unknown cause",
            Self::L01 => "Leak on unbuffered channel without possible partner",
            Self::L02 => "Leak on unbuffered channel with possible partner",
            Self::L03 => "Leak on buffered channel without possible partner",
            Self::L04 => "Leak on buffered channel with possible partner",
            Self::L05 => "Leak on nil channel",
            Self::L06 => "Leak on select with possible partner",
            Self::L07 => "Leak on select without possible partner",
            Self::L08 => "Leak on mutex",
            Self::L09 => "Leak on wait group",
            Self::L10 => "Leak on conditional variable",
            Self::R01 => "Unknown panic",
            Self::R02 => "Timeout",
        }
    }

    /// Labels of the two argument groups.
    pub fn labels(self) -> (&'static str, &'static str) {
        match self {
            Self::A01 | Self::P01 => ("send", "close"),
            Self::A02 | Self::P02 => ("recv", "close"),
            Self::A03 => ("close", "close"),
            Self::A04 => ("close", ""),
            Self::A05 | Self::P03 => ("done", "add"),
            Self::A06 | Self::P04 => ("unlock", "lock"),
            Self::A07 => ("recv", "recv"),
            Self::A08 => ("select", "case"),
            Self::P05 => ("stuck", "cycle"),
            Self::L00 | Self::L01 | Self::L03 | Self::L05 | Self::L07 | Self::L09 => ("stuck", ""),
            Self::L02 | Self::L04 | Self::L06 => ("stuck", "partner"),
            Self::L08 => ("stuck", "last"),
            Self::L10 => ("stuck", ""),
            Self::R01 | Self::R02 => ("position", ""),
        }
    }

    pub fn is_actual(self) -> bool {
        matches!(self.as_str().as_bytes()[0], b'A')
    }

    pub fn is_possible(self) -> bool {
        matches!(self.as_str().as_bytes()[0], b'P')
    }

    pub fn is_leak(self) -> bool {
        matches!(self.as_str().as_bytes()[0], b'L')
    }

    /// Codes the rewriter has a strategy for.
    pub fn is_rewritable(self) -> bool {
        matches!(
            self,
            Self::P01
                | Self::P02
                | Self::P03
                | Self::P04
                | Self::P05
                | Self::L02
                | Self::L04
                | Self::L06
                | Self::L08
                | Self::L09
                | Self::L10
        )
    }
}

impl std::fmt::Display for BugCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element cited by a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultElem {
    pub routine: u32,
    #[serde(rename = "objId")]
    pub obj_id: i64,
    #[serde(rename = "tPre")]
    pub t_pre: u64,
    #[serde(rename = "objType")]
    pub obj_type: String,
    pub file: String,
    pub line: u32,
    /// Select case index when the element stands for one case of a select.
    #[serde(rename = "selectCase", default, skip_serializing_if = "Option::is_none")]
    pub select_case: Option<usize>,
    #[serde(skip)]
    pub elem: Option<ElemId>,
}

impl ResultElem {
    pub fn from_element(id: ElemId, e: &Element) -> Self {
        Self {
            routine: e.routine,
            obj_id: e.object_id().unwrap_or(0),
            t_pre: e.t_pre,
            obj_type: e.obj_type(),
            file: e.pos.as_ref().map(|p| p.file.clone()).unwrap_or_default(),
            line: e.pos.as_ref().map(|p| p.line).unwrap_or(0),
            select_case: None,
            elem: Some(id),
        }
    }

    /// Stand-in for case `case` of the select `id`.
    pub fn from_select_case(id: ElemId, e: &Element, case: usize) -> Self {
        let mut out = Self::from_element(id, e);
        if let Some(c) = e.select().and_then(|s| s.cases.get(case)) {
            out.obj_id = c.op.id;
            out.obj_type = c.op.obj_type().to_string();
        }
        out.select_case = Some(case);
        out
    }

    /// Element known only by its source position, e.g. from the exit record.
    pub fn at_position(obj_type: impl Into<String>, pos: Option<&Position>) -> Self {
        Self {
            routine: 0,
            obj_id: 0,
            t_pre: 0,
            obj_type: obj_type.into(),
            file: pos.map(|p| p.file.clone()).unwrap_or_default(),
            line: pos.map(|p| p.line).unwrap_or(0),
            select_case: None,
            elem: None,
        }
    }

    pub fn with_obj_type(mut self, obj_type: impl Into<String>) -> Self {
        self.obj_type = obj_type.into();
        self
    }

    pub fn machine(&self) -> String {
        format!(
            "T:{}:{}:{}:{}:{}:{}",
            self.routine, self.obj_id, self.t_pre, self.obj_type, self.file, self.line
        )
    }

    pub fn readable(&self) -> String {
        format!("{}:{}@{}", self.file, self.line, self.t_pre)
    }

    fn short_key(&self) -> String {
        format!(
            "T:{}:{}:{}:{}:{}",
            self.obj_id,
            self.obj_type,
            self.file,
            self.line,
            self.select_case.map(|c| c as i64).unwrap_or(-1)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub code: BugCode,
    pub severity: Severity,
    pub title: String,
    pub arg1: Vec<ResultElem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arg2: Vec<ResultElem>,
    pub rewritable: bool,
}

impl Finding {
    pub fn new(code: BugCode, arg1: Vec<ResultElem>, arg2: Vec<ResultElem>) -> Self {
        Self {
            code,
            severity: code.severity(),
            title: code.title().to_string(),
            arg1,
            arg2,
            rewritable: code.is_rewritable(),
        }
    }

    pub fn machine_line(&self) -> String {
        let mut out = self.code.to_string();
        for group in [&self.arg1, &self.arg2] {
            if group.is_empty() {
                continue;
            }
            out.push(',');
            let parts: Vec<String> = group.iter().map(ResultElem::machine).collect();
            out.push_str(&parts.join(";"));
        }
        out
    }

    pub fn readable_block(&self) -> String {
        let (l1, l2) = self.code.labels();
        let mut out = format!("{}:\n", self.title);
        for (label, group) in [(l1, &self.arg1), (l2, &self.arg2)] {
            if group.is_empty() {
                continue;
            }
            let parts: Vec<String> = group.iter().map(ResultElem::readable).collect();
            out.push_str(&format!("\t{label}: {}\n", parts.join(";")));
        }
        out
    }

    /// Ignores routine and time so repeated observations collapse.
    pub fn short_key(&self) -> String {
        let mut out = self.code.to_string();
        for group in [&self.arg1, &self.arg2] {
            out.push(',');
            let parts: Vec<String> = group.iter().map(ResultElem::short_key).collect();
            out.push_str(&parts.join(";"));
        }
        out
    }

    pub fn elems1(&self) -> Vec<ElemId> {
        self.arg1.iter().filter_map(|r| r.elem).collect()
    }

    pub fn elems2(&self) -> Vec<ElemId> {
        self.arg2.iter().filter_map(|r| r.elem).collect()
    }
}

/// Findings in report order, de-duplicated by short key.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    findings: Vec<Finding>,
    seen: BTreeSet<String>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when an equivalent finding is already recorded.
    pub fn push(&mut self, finding: Finding) -> bool {
        let key = finding.short_key();
        if !self.seen.insert(key) {
            return false;
        }
        tracing::debug!("finding {}", finding.machine_line());
        self.findings.push(finding);
        true
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn into_findings(self) -> Vec<Finding> {
        self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, code: BugCode) -> usize {
        self.findings.iter().filter(|f| f.code == code).count()
    }

    pub fn clear(&mut self) {
        self.findings.clear();
        self.seen.clear();
    }

    pub fn machine_text(&self) -> String {
        let mut out = String::new();
        for f in &self.findings {
            out.push_str(&f.machine_line());
            out.push('\n');
        }
        out
    }

    pub fn readable_text(&self) -> String {
        self.findings.iter().map(Finding::readable_block).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub warning: usize,
    pub diagnostic: usize,
}

impl SeverityCounts {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut out = Self::default();
        for f in findings {
            match f.severity {
                Severity::Critical => out.critical += 1,
                Severity::Warning => out.warning += 1,
                Severity::Diagnostic => out.diagnostic += 1,
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "traceDir")]
    pub trace_dir: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub elements: usize,
    pub routines: usize,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub counts: SeverityCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    /// Analysis problems worth surfacing that are not bugs themselves.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl AnalysisSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "runId={} trace={} routines={} elements={}\n",
            self.run_id, self.trace_dir, self.routines, self.elements
        ));
        if let Some(code) = self.exit_code {
            out.push_str(&format!("exitCode={code}\n"));
        }
        out.push_str(&format!(
            "findings: critical={} warning={} diagnostic={}\n",
            self.counts.critical, self.counts.warning, self.counts.diagnostic
        ));
        for f in &self.findings {
            out.push_str(&format!("- {} [{:?}] {}\n", f.code, f.severity, f.title));
        }
        for d in &self.diagnostics {
            out.push_str(&format!("! {d}\n"));
        }
        out.trim_end().to_string()
    }
}
