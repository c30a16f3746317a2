use ulid::Ulid;

use crate::model::*;

use super::capacity;
use super::validate::{validate_percent, validate_span};
use super::{join, Engine, EngineError, Entity};

impl Engine {
    // ── Catalog reads ────────────────────────────────────────

    pub async fn get_engineer(&self, id: &Ulid) -> Result<Engineer, EngineError> {
        let ledger = self
            .store
            .get_ledger(id)
            .ok_or(EngineError::not_found(Entity::Engineer, *id))?;
        let guard = ledger.read().await;
        Ok(guard.engineer.clone())
    }

    /// All engineers, ordered by id (creation order for minted ids).
    pub async fn list_engineers(&self) -> Vec<Engineer> {
        let mut out = Vec::new();
        for ledger in self.store.ledgers() {
            out.push(ledger.read().await.engineer.clone());
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn get_project(&self, id: &Ulid) -> Result<Project, EngineError> {
        self.store
            .get_project(id)
            .ok_or(EngineError::not_found(Entity::Project, *id))
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects = self.store.projects();
        projects.sort_by_key(|p| p.id);
        projects
    }

    // ── Assignment reads ─────────────────────────────────────

    pub async fn get_assignment(&self, id: &Ulid) -> Result<AssignmentView, EngineError> {
        let missing = || EngineError::not_found(Entity::Assignment, *id);
        let owner = self.store.owner_of(id).ok_or_else(missing)?;
        let ledger = self.store.get_ledger(&owner).ok_or_else(missing)?;
        let guard = ledger.read().await;
        let assignment = guard.get_assignment(*id).cloned().ok_or_else(missing)?;
        let project = self.get_project(&assignment.project_id)?;
        Ok(join(&guard.engineer, &project, assignment))
    }

    /// Joined assignment views, ordered by start day then id. Filtering by an
    /// unknown engineer or project is `NotFound`, not an empty list.
    pub async fn list_assignments(&self, filter: AssignmentFilter) -> Result<Vec<AssignmentView>, EngineError> {
        let ledgers = match filter {
            AssignmentFilter::All => self.store.ledgers(),
            AssignmentFilter::Engineer(id) => vec![self
                .store
                .get_ledger(&id)
                .ok_or(EngineError::not_found(Entity::Engineer, id))?],
            AssignmentFilter::Project(id) => {
                if !self.store.contains_project(&id) {
                    return Err(EngineError::not_found(Entity::Project, id));
                }
                let mut owners: Vec<Ulid> = self
                    .store
                    .project_assignment_ids(&id)
                    .iter()
                    .filter_map(|a| self.store.owner_of(a))
                    .collect();
                owners.sort();
                owners.dedup();
                owners
                    .iter()
                    .filter_map(|e| self.store.get_ledger(e))
                    .collect()
            }
        };

        let mut views = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            for assignment in &guard.assignments {
                if let AssignmentFilter::Project(pid) = filter
                    && assignment.project_id != pid
                {
                    continue;
                }
                let Some(project) = self.store.get_project(&assignment.project_id) else {
                    continue;
                };
                views.push(join(&guard.engineer, &project, assignment.clone()));
            }
        }
        views.sort_by_key(|v| (v.assignment.span.start, v.assignment.id));
        Ok(views)
    }

    /// Storage-level overlap lookup: the engineer's assignments whose window
    /// intersects `window`, minus `exclude`. Unknown engineer is `NotFound`;
    /// an engineer with nothing overlapping yields an empty list.
    pub async fn overlapping_assignments(
        &self,
        engineer_id: &Ulid,
        window: &DateSpan,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Assignment>, EngineError> {
        validate_span(window)?;
        let ledger = self
            .store
            .get_ledger(engineer_id)
            .ok_or(EngineError::not_found(Entity::Engineer, *engineer_id))?;
        let guard = ledger.read().await;
        Ok(guard
            .overlapping(window)
            .filter(|a| Some(a.id) != exclude)
            .cloned()
            .collect())
    }

    pub async fn total_allocated(
        &self,
        engineer_id: &Ulid,
        window: &DateSpan,
        exclude: Option<Ulid>,
    ) -> Result<Percent, EngineError> {
        validate_span(window)?;
        let ledger = self
            .store
            .get_ledger(engineer_id)
            .ok_or(EngineError::not_found(Entity::Engineer, *engineer_id))?;
        let guard = ledger.read().await;
        Ok(capacity::total_allocated(&guard, window, exclude))
    }

    /// Dry-run admission check. Nothing is written and no lock is held past
    /// the return, so a later create may still be rejected.
    pub async fn check_allocation(
        &self,
        engineer_id: &Ulid,
        requested: Percent,
        window: &DateSpan,
        exclude: Option<Ulid>,
    ) -> Result<Admission, EngineError> {
        validate_percent("allocation", requested)?;
        validate_span(window)?;
        let ledger = self
            .store
            .get_ledger(engineer_id)
            .ok_or(EngineError::not_found(Entity::Engineer, *engineer_id))?;
        let guard = ledger.read().await;
        Ok(capacity::check(&guard, window, requested, exclude))
    }

    /// Point-in-time capacity: assignments active on `as_of` and the headroom left.
    pub async fn capacity_report(&self, engineer_id: &Ulid, as_of: Day) -> Result<CapacityReport, EngineError> {
        let ledger = self
            .store
            .get_ledger(engineer_id)
            .ok_or(EngineError::not_found(Entity::Engineer, *engineer_id))?;
        let guard = ledger.read().await;
        let window = DateSpan::day(as_of);
        let active: Vec<Assignment> = guard.overlapping(&window).cloned().collect();
        let total = capacity::sum_overlapping(&active, &window, None);
        Ok(CapacityReport {
            engineer_id: *engineer_id,
            name: guard.engineer.name.clone(),
            max_capacity: guard.engineer.max_capacity,
            total_allocated: total,
            available_capacity: i64::from(guard.engineer.max_capacity) - i64::from(total),
            as_of,
            active_assignments: active,
        })
    }
}
