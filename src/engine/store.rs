use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedLedger;

/// In-memory indexes behind the engine.
///
/// Relationships are derived, never stored on the parent records:
/// - engineer → assignments: the engineer's ledger
/// - assignment → engineer: `assignment_owner`
/// - project → assignments: `project_assignments`
pub struct Store {
    ledgers: DashMap<Ulid, SharedLedger>,
    projects: DashMap<Ulid, Project>,
    assignment_owner: DashMap<Ulid, Ulid>,
    project_assignments: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            ledgers: DashMap::new(),
            projects: DashMap::new(),
            assignment_owner: DashMap::new(),
            project_assignments: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty() && self.projects.is_empty()
    }

    // ── Engineers ────────────────────────────────────────────

    pub fn engineer_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn contains_engineer(&self, id: &Ulid) -> bool {
        self.ledgers.contains_key(id)
    }

    pub fn get_ledger(&self, id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(id).map(|e| e.value().clone())
    }

    pub fn insert_ledger(&self, ledger: EngineerLedger) -> SharedLedger {
        let id = ledger.engineer.id;
        let shared = Arc::new(RwLock::new(ledger));
        self.ledgers.insert(id, shared.clone());
        shared
    }

    pub fn remove_ledger(&self, id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.remove(id).map(|(_, ledger)| ledger)
    }

    /// Snapshot of all ledger handles. Collected up front so no map shard
    /// stays locked while callers await on the ledgers.
    pub fn ledgers(&self) -> Vec<SharedLedger> {
        self.ledgers.iter().map(|e| e.value().clone()).collect()
    }

    // ── Projects ─────────────────────────────────────────────

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn contains_project(&self, id: &Ulid) -> bool {
        self.projects.contains_key(id)
    }

    pub fn get_project(&self, id: &Ulid) -> Option<Project> {
        self.projects.get(id).map(|e| e.value().clone())
    }

    pub fn put_project(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn remove_project(&self, id: &Ulid) -> Option<Project> {
        self.project_assignments.remove(id);
        self.projects.remove(id).map(|(_, p)| p)
    }

    pub fn projects(&self) -> Vec<Project> {
        self.projects.iter().map(|e| e.value().clone()).collect()
    }

    // ── Assignment indexes ───────────────────────────────────

    pub fn owner_of(&self, assignment_id: &Ulid) -> Option<Ulid> {
        self.assignment_owner.get(assignment_id).map(|e| *e.value())
    }

    pub fn project_assignment_ids(&self, project_id: &Ulid) -> Vec<Ulid> {
        self.project_assignments
            .get(project_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn project_assignment_count(&self, project_id: &Ulid) -> usize {
        self.project_assignments
            .get(project_id)
            .map_or(0, |e| e.value().len())
    }

    /// Put an assignment into a ledger and index it. Caller holds the ledger's write lock.
    pub fn attach(&self, ledger: &mut EngineerLedger, assignment: Assignment) {
        self.assignment_owner
            .insert(assignment.id, ledger.engineer.id);
        self.project_assignments
            .entry(assignment.project_id)
            .or_default()
            .push(assignment.id);
        ledger.insert_assignment(assignment);
    }

    /// Remove an assignment from a ledger and drop its index entries.
    pub fn detach(&self, ledger: &mut EngineerLedger, id: Ulid) -> Option<Assignment> {
        let removed = ledger.remove_assignment(id)?;
        self.assignment_owner.remove(&id);
        if let Some(mut ids) = self.project_assignments.get_mut(&removed.project_id) {
            ids.retain(|a| *a != id);
        }
        Some(removed)
    }

    // ── Event application ────────────────────────────────────

    /// Apply a single-ledger event. Catalog events (engineer create/delete,
    /// project changes) and cross-ledger moves are handled by the engine.
    pub fn apply_event(&self, ledger: &mut EngineerLedger, event: &Event) {
        match event {
            Event::EngineerUpdated { engineer } => {
                ledger.engineer = engineer.clone();
            }
            Event::AssignmentCreated { assignment } => {
                self.attach(ledger, assignment.clone());
            }
            Event::AssignmentUpdated { assignment, .. } => {
                self.detach(ledger, assignment.id);
                self.attach(ledger, assignment.clone());
            }
            Event::AssignmentDeleted { id, .. } => {
                self.detach(ledger, *id);
            }
            Event::EngineerCreated { .. }
            | Event::EngineerDeleted { .. }
            | Event::ProjectCreated { .. }
            | Event::ProjectUpdated { .. }
            | Event::ProjectDeleted { .. } => {}
        }
    }

    /// Apply a catalog-level event.
    pub fn apply_catalog_event(&self, event: &Event) {
        match event {
            Event::EngineerCreated { engineer } => {
                self.insert_ledger(EngineerLedger::new(engineer.clone()));
            }
            Event::EngineerDeleted { id } => {
                self.remove_ledger(id);
            }
            Event::ProjectCreated { project } | Event::ProjectUpdated { project } => {
                self.put_project(project.clone());
            }
            Event::ProjectDeleted { id } => {
                self.remove_project(id);
            }
            Event::EngineerUpdated { .. }
            | Event::AssignmentCreated { .. }
            | Event::AssignmentUpdated { .. }
            | Event::AssignmentDeleted { .. } => {}
        }
    }
}
