use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for record timestamps.
pub type Ms = i64;

/// A UTC calendar day. Every window comparison is done on this type.
pub type Day = NaiveDate;

/// Percent of one full-time headcount.
pub type Percent = u32;

pub const DEFAULT_MAX_CAPACITY: Percent = 100;

/// Closed interval `[start, end]` of days. Both ends are inclusive, so two
/// spans sharing a boundary day overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: Day,
    pub end: Day,
}

impl DateSpan {
    /// No ordering check here; the engine rejects `start > end` at its boundary.
    pub fn new(start: Day, end: Day) -> Self {
        Self { start, end }
    }

    /// Zero-width window for point-in-time queries.
    pub fn day(day: Day) -> Self {
        Self { start: day, end: day }
    }

    pub fn is_ordered(&self) -> bool {
        self.start <= self.end
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_day(&self, day: Day) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// `[a_start, a_end]` and `[b_start, b_end]` intersect (inclusive on both ends).
pub fn overlaps(a_start: Day, a_end: Day, b_start: Day, b_end: Day) -> bool {
    a_start <= b_end && a_end >= b_start
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Junior,
    Mid,
    Senior,
}

impl Seniority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Seniority::Junior => "junior",
            Seniority::Mid => "mid",
            Seniority::Senior => "senior",
        }
    }
}

impl FromStr for Seniority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "junior" => Ok(Seniority::Junior),
            "mid" => Ok(Seniority::Mid),
            "senior" => Ok(Seniority::Senior),
            other => Err(format!("unknown seniority: {other}")),
        }
    }
}

/// Project lifecycle. Transitions are free-form: any status may follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Planning,
    Active,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Planning => "planning",
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "planning" => Ok(ProjectStatus::Planning),
            "active" => Ok(ProjectStatus::Active),
            "completed" => Ok(ProjectStatus::Completed),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engineer {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    /// 100 = full time, 50 = half time.
    pub max_capacity: Percent,
    pub skills: BTreeSet<String>,
    pub seniority: Option<Seniority>,
    pub department: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Engineer {
    pub fn new(id: Ulid, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            max_capacity: DEFAULT_MAX_CAPACITY,
            skills: BTreeSet::new(),
            seniority: None,
            department: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_capacity(mut self, max_capacity: Percent) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seniority(mut self, seniority: Seniority) -> Self {
        self.seniority = Some(seniority);
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub span: DateSpan,
    pub required_skills: BTreeSet<String>,
    pub team_size: u32,
    pub status: ProjectStatus,
    pub manager_id: Ulid,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Project {
    pub fn new(
        id: Ulid,
        name: impl Into<String>,
        description: impl Into<String>,
        span: DateSpan,
        manager_id: Ulid,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            span,
            required_skills: BTreeSet::new(),
            team_size: 1,
            status: ProjectStatus::default(),
            manager_id,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_required_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_team_size(mut self, team_size: u32) -> Self {
        self.team_size = team_size;
        self
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }
}

/// One engineer committed to one project for a window at a fixed percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub engineer_id: Ulid,
    pub project_id: Ulid,
    pub allocation: Percent,
    pub span: DateSpan,
    pub role: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Input for creating an assignment. The engine mints the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub engineer_id: Ulid,
    pub project_id: Ulid,
    pub allocation: Percent,
    pub span: DateSpan,
    pub role: String,
}

// ── Patches ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineerPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub max_capacity: Option<Percent>,
    pub skills: Option<BTreeSet<String>>,
    /// `Some(None)` clears the field.
    pub seniority: Option<Option<Seniority>>,
    pub department: Option<Option<String>>,
}

impl EngineerPatch {
    pub fn apply(&self, base: &Engineer) -> Engineer {
        let mut next = base.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(email) = &self.email {
            next.email = email.clone();
        }
        if let Some(cap) = self.max_capacity {
            next.max_capacity = cap;
        }
        if let Some(skills) = &self.skills {
            next.skills = skills.clone();
        }
        if let Some(seniority) = self.seniority {
            next.seniority = seniority;
        }
        if let Some(department) = &self.department {
            next.department = department.clone();
        }
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub start: Option<Day>,
    pub end: Option<Day>,
    pub required_skills: Option<BTreeSet<String>>,
    pub team_size: Option<u32>,
    pub status: Option<ProjectStatus>,
    pub manager_id: Option<Ulid>,
}

impl ProjectPatch {
    pub fn apply(&self, base: &Project) -> Project {
        let mut next = base.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(start) = self.start {
            next.span.start = start;
        }
        if let Some(end) = self.end {
            next.span.end = end;
        }
        if let Some(skills) = &self.required_skills {
            next.required_skills = skills.clone();
        }
        if let Some(team_size) = self.team_size {
            next.team_size = team_size;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(manager_id) = self.manager_id {
            next.manager_id = manager_id;
        }
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentPatch {
    pub engineer_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub allocation: Option<Percent>,
    pub start: Option<Day>,
    pub end: Option<Day>,
    pub role: Option<String>,
}

impl AssignmentPatch {
    /// True when the patch can change how much capacity the assignment consumes,
    /// or whose capacity it consumes.
    pub fn touches_capacity(&self) -> bool {
        self.engineer_id.is_some()
            || self.allocation.is_some()
            || self.start.is_some()
            || self.end.is_some()
    }

    pub fn apply(&self, base: &Assignment) -> Assignment {
        let mut next = base.clone();
        if let Some(engineer_id) = self.engineer_id {
            next.engineer_id = engineer_id;
        }
        if let Some(project_id) = self.project_id {
            next.project_id = project_id;
        }
        if let Some(allocation) = self.allocation {
            next.allocation = allocation;
        }
        if let Some(start) = self.start {
            next.span.start = start;
        }
        if let Some(end) = self.end {
            next.span.end = end;
        }
        if let Some(role) = &self.role {
            next.role = role.clone();
        }
        next
    }
}

// ── Per-engineer state ───────────────────────────────────────────

/// An engineer together with every assignment that references them.
/// The assignment list is the derived engineer → assignments view; it is never
/// stored on the `Engineer` record itself.
#[derive(Debug, Clone)]
pub struct EngineerLedger {
    pub engineer: Engineer,
    /// Sorted by `span.start`.
    pub assignments: Vec<Assignment>,
}

impl EngineerLedger {
    pub fn new(engineer: Engineer) -> Self {
        Self {
            engineer,
            assignments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `span.start`.
    pub fn insert_assignment(&mut self, assignment: Assignment) {
        let pos = self
            .assignments
            .binary_search_by_key(&assignment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.assignments.insert(pos, assignment);
    }

    pub fn remove_assignment(&mut self, id: Ulid) -> Option<Assignment> {
        let pos = self.assignments.iter().position(|a| a.id == id)?;
        Some(self.assignments.remove(pos))
    }

    pub fn get_assignment(&self, id: Ulid) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    /// Assignments whose window intersects `query` (inclusive).
    /// Everything at or after the first assignment starting past `query.end`
    /// is skipped by binary search.
    pub fn overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &Assignment> {
        let right_bound = self
            .assignments
            .partition_point(|a| a.span.start <= query.end);
        self.assignments[..right_bound]
            .iter()
            .filter(move |a| a.span.end >= query.start)
    }
}

// ── WAL record format ────────────────────────────────────────────

/// Every committed change. Records carry the full post-change state so replay
/// is a plain upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EngineerCreated { engineer: Engineer },
    EngineerUpdated { engineer: Engineer },
    EngineerDeleted { id: Ulid },
    ProjectCreated { project: Project },
    ProjectUpdated { project: Project },
    ProjectDeleted { id: Ulid },
    AssignmentCreated { assignment: Assignment },
    /// `previous_engineer_id` differs from `assignment.engineer_id` when the
    /// assignment moved to another engineer.
    AssignmentUpdated {
        previous_engineer_id: Ulid,
        assignment: Assignment,
    },
    AssignmentDeleted { id: Ulid, engineer_id: Ulid },
}

impl Event {
    /// Engineers whose ledger (or record) this event touches.
    pub fn engineer_ids(&self) -> Vec<Ulid> {
        match self {
            Event::EngineerCreated { engineer } | Event::EngineerUpdated { engineer } => {
                vec![engineer.id]
            }
            Event::EngineerDeleted { id } => vec![*id],
            Event::AssignmentCreated { assignment } => vec![assignment.engineer_id],
            Event::AssignmentUpdated {
                previous_engineer_id,
                assignment,
            } => {
                if *previous_engineer_id == assignment.engineer_id {
                    vec![assignment.engineer_id]
                } else {
                    vec![*previous_engineer_id, assignment.engineer_id]
                }
            }
            Event::AssignmentDeleted { engineer_id, .. } => vec![*engineer_id],
            Event::ProjectCreated { .. }
            | Event::ProjectUpdated { .. }
            | Event::ProjectDeleted { .. } => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// An assignment joined with display fields of its engineer and project.
/// Built at read time; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentView {
    pub assignment: Assignment,
    pub engineer_name: String,
    pub engineer_email: String,
    pub engineer_skills: BTreeSet<String>,
    pub project_name: String,
    pub project_description: String,
}

/// Outcome of checking a proposed allocation against an engineer's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    /// `max_capacity - total_allocated`. Negative when the engineer is already over.
    pub available: i64,
    pub requested: Percent,
    pub total_allocated: Percent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    pub engineer_id: Ulid,
    pub name: String,
    pub max_capacity: Percent,
    pub total_allocated: Percent,
    pub available_capacity: i64,
    pub as_of: Day,
    pub active_assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentFilter {
    All,
    Engineer(Ulid),
    Project(Ulid),
}
