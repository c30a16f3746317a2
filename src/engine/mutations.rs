use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::ADMISSIONS_TOTAL;

use super::capacity;
use super::validate::{
    now_ms, validate_assignment, validate_engineer, validate_percent, validate_project,
};
use super::{join, Engine, EngineError, Entity, LedgerGuard, WalCommand};

impl Engine {
    // ── Engineers ────────────────────────────────────────────

    pub async fn create_engineer(&self, mut engineer: Engineer) -> Result<Engineer, EngineError> {
        validate_engineer(&engineer)?;
        let _gate = self.write_gate.write().await;
        if self.store.engineer_count() >= MAX_ENGINEERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many engineers"));
        }
        if self.store.contains_engineer(&engineer.id) {
            return Err(EngineError::AlreadyExists {
                entity: Entity::Engineer,
                id: engineer.id,
            });
        }

        let now = now_ms();
        engineer.created_at = now;
        engineer.updated_at = now;
        let event = Event::EngineerCreated {
            engineer: engineer.clone(),
        };
        self.persist_catalog(&event).await?;
        info!("engineer {} created ({})", engineer.id, engineer.name);
        Ok(engineer)
    }

    /// Patch an engineer's profile. Lowering `max_capacity` below what is already
    /// committed is allowed; headroom simply goes negative until assignments shrink.
    pub async fn update_engineer(&self, id: Ulid, patch: EngineerPatch) -> Result<Engineer, EngineError> {
        if let Some(cap) = patch.max_capacity {
            validate_percent("max_capacity", cap)?;
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_ledger(&id).await?;

        let mut next = patch.apply(&guard.engineer);
        validate_engineer(&next)?;
        next.updated_at = now_ms();

        let today = super::today();
        let committed = capacity::total_allocated(&guard, &DateSpan::day(today), None);
        if committed > next.max_capacity {
            warn!(
                "engineer {id} capacity lowered to {} below {committed} committed today",
                next.max_capacity
            );
        }

        let event = Event::EngineerUpdated {
            engineer: next.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(next)
    }

    /// Refused while any assignment still references the engineer.
    pub async fn delete_engineer(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let guard = self.lock_ledger(&id).await?;
        if !guard.assignments.is_empty() {
            return Err(EngineError::HasAssignments {
                entity: Entity::Engineer,
                id,
                count: guard.assignments.len(),
            });
        }

        let event = Event::EngineerDeleted { id };
        self.persist_catalog(&event).await?;
        drop(guard);
        info!("engineer {id} deleted");
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────

    pub async fn create_project(&self, mut project: Project) -> Result<Project, EngineError> {
        validate_project(&project)?;
        let _gate = self.write_gate.write().await;
        if self.store.project_count() >= MAX_PROJECTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many projects"));
        }
        if self.store.contains_project(&project.id) {
            return Err(EngineError::AlreadyExists {
                entity: Entity::Project,
                id: project.id,
            });
        }

        let now = now_ms();
        project.created_at = now;
        project.updated_at = now;
        let event = Event::ProjectCreated {
            project: project.clone(),
        };
        self.persist_catalog(&event).await?;
        info!("project {} created ({})", project.id, project.name);
        Ok(project)
    }

    /// Status changes are free-form. Changing the project window does not touch
    /// existing assignments; they keep their own windows.
    pub async fn update_project(&self, id: Ulid, patch: ProjectPatch) -> Result<Project, EngineError> {
        let _gate = self.write_gate.write().await;
        let current = self
            .store
            .get_project(&id)
            .ok_or(EngineError::not_found(Entity::Project, id))?;
        let mut next = patch.apply(&current);
        validate_project(&next)?;
        next.updated_at = now_ms();

        let event = Event::ProjectUpdated {
            project: next.clone(),
        };
        self.persist_catalog(&event).await?;
        Ok(next)
    }

    pub async fn delete_project(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        if !self.store.contains_project(&id) {
            return Err(EngineError::not_found(Entity::Project, id));
        }
        let count = self.store.project_assignment_count(&id);
        if count > 0 {
            return Err(EngineError::HasAssignments {
                entity: Entity::Project,
                id,
                count,
            });
        }

        self.persist_catalog(&Event::ProjectDeleted { id }).await?;
        info!("project {id} deleted");
        Ok(())
    }

    // ── Assignments ──────────────────────────────────────────

    /// Create an assignment if the engineer has headroom for it over the whole
    /// proposed window. The check and the write happen under the engineer's
    /// ledger lock, so concurrent creates for one engineer cannot jointly
    /// overshoot `max_capacity`.
    pub async fn create_assignment(&self, new: NewAssignment) -> Result<AssignmentView, EngineError> {
        validate_assignment(new.allocation, &new.span, &new.role)?;
        let _gate = self.write_gate.read().await;
        let project = self
            .store
            .get_project(&new.project_id)
            .ok_or(EngineError::not_found(Entity::Project, new.project_id))?;
        let mut guard = self.lock_ledger(&new.engineer_id).await?;
        if guard.assignments.len() >= MAX_ASSIGNMENTS_PER_ENGINEER {
            return Err(EngineError::LimitExceeded("too many assignments for engineer"));
        }

        let admission = capacity::check(&guard, &new.span, new.allocation, None);
        enforce(&guard.engineer, admission)?;

        let now = now_ms();
        let assignment = Assignment {
            id: Ulid::new(),
            engineer_id: new.engineer_id,
            project_id: new.project_id,
            allocation: new.allocation,
            span: new.span,
            role: new.role,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AssignmentCreated {
            assignment: assignment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "assignment {} created: engineer {} on project {} at {}% for {}",
            assignment.id, assignment.engineer_id, assignment.project_id, assignment.allocation, assignment.span
        );
        Ok(join(&guard.engineer, &project, assignment))
    }

    /// Patch an assignment. Any change to allocation, window or engineer is
    /// re-checked against capacity with the assignment itself excluded from the
    /// committed total. Role-only and project-only patches skip the check.
    pub async fn update_assignment(
        &self,
        id: Ulid,
        patch: AssignmentPatch,
    ) -> Result<AssignmentView, EngineError> {
        if let Some(allocation) = patch.allocation {
            validate_percent("allocation", allocation)?;
        }
        let _gate = self.write_gate.read().await;
        // The owner is read unlocked. If a concurrent move commits between the
        // read and the lock, the attempt fails without side effects and the
        // new owner is tried. Each retry means another move made progress.
        loop {
            let owner = self
                .store
                .owner_of(&id)
                .ok_or(EngineError::not_found(Entity::Assignment, id))?;
            let outcome = match patch.engineer_id {
                Some(target) if target != owner => self.move_assignment(id, owner, target, &patch).await,
                _ => self.patch_in_place(id, owner, &patch).await,
            };
            match outcome {
                Err(EngineError::NotFound {
                    entity: Entity::Assignment,
                    ..
                }) if self.store.owner_of(&id).is_some_and(|now| now != owner) => {
                    debug!("assignment {id} moved away from {owner} during update, retrying");
                }
                other => return other,
            }
        }
    }

    /// Patch an assignment that stays with `owner`.
    async fn patch_in_place(
        &self,
        id: Ulid,
        owner: Ulid,
        patch: &AssignmentPatch,
    ) -> Result<AssignmentView, EngineError> {
        let mut guard = self
            .lock_ledger(&owner)
            .await
            .map_err(|_| EngineError::not_found(Entity::Assignment, id))?;
        let (next, project) = self.prepare_update(&guard, id, patch)?;
        if patch.touches_capacity() {
            let admission = capacity::check(&guard, &next.span, next.allocation, Some(id));
            enforce(&guard.engineer, admission)?;
        }

        let event = Event::AssignmentUpdated {
            previous_engineer_id: owner,
            assignment: next.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(join(&guard.engineer, &project, next))
    }

    /// Reassign to another engineer. Both ledgers are locked (in id order) so
    /// the target's capacity check and the move are one step.
    async fn move_assignment(
        &self,
        id: Ulid,
        owner: Ulid,
        target: Ulid,
        patch: &AssignmentPatch,
    ) -> Result<AssignmentView, EngineError> {
        let (mut from, mut to) = self.lock_pair(owner, target).await?;
        let (next, project) = self.prepare_update(&from, id, patch)?;

        let admission = capacity::check(&to, &next.span, next.allocation, Some(id));
        enforce(&to.engineer, admission)?;
        if to.assignments.len() >= MAX_ASSIGNMENTS_PER_ENGINEER {
            return Err(EngineError::LimitExceeded("too many assignments for engineer"));
        }

        let event = Event::AssignmentUpdated {
            previous_engineer_id: owner,
            assignment: next.clone(),
        };
        self.wal_append(&event).await?;
        self.store.detach(&mut from, id);
        self.store.attach(&mut to, next.clone());
        info!("assignment {id} moved from engineer {owner} to {target}");
        Ok(join(&to.engineer, &project, next))
    }

    /// Merge the patch over the locked current record and validate the result.
    fn prepare_update(
        &self,
        ledger: &LedgerGuard,
        id: Ulid,
        patch: &AssignmentPatch,
    ) -> Result<(Assignment, Project), EngineError> {
        let current = ledger
            .get_assignment(id)
            .ok_or(EngineError::not_found(Entity::Assignment, id))?;
        let mut next = patch.apply(current);
        validate_assignment(next.allocation, &next.span, &next.role)?;
        next.updated_at = now_ms();
        let project = self
            .store
            .get_project(&next.project_id)
            .ok_or(EngineError::not_found(Entity::Project, next.project_id))?;
        Ok((next, project))
    }

    /// Remove an assignment. Engineers and projects are untouched.
    pub async fn delete_assignment(&self, id: Ulid) -> Result<AssignmentView, EngineError> {
        let _gate = self.write_gate.read().await;
        let (owner, mut guard) = self.resolve_assignment_write(&id).await?;
        let removed = guard
            .get_assignment(id)
            .cloned()
            .ok_or(EngineError::not_found(Entity::Assignment, id))?;
        let project = self
            .store
            .get_project(&removed.project_id)
            .ok_or(EngineError::not_found(Entity::Project, removed.project_id))?;

        let event = Event::AssignmentDeleted {
            id,
            engineer_id: owner,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("assignment {id} deleted");
        Ok(join(&guard.engineer, &project, removed))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds the write gate exclusively, so no mutation can append between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;

        let mut ledgers = Vec::new();
        for shared in self.store.ledgers() {
            ledgers.push(shared.read_owned().await);
        }
        ledgers.sort_by_key(|l| l.engineer.id);
        let mut projects = self.store.projects();
        projects.sort_by_key(|p| p.id);

        let mut events = Vec::new();
        events.extend(ledgers.iter().map(|l| Event::EngineerCreated {
            engineer: l.engineer.clone(),
        }));
        events.extend(projects.into_iter().map(|project| Event::ProjectCreated { project }));
        for ledger in &ledgers {
            events.extend(ledger.assignments.iter().map(|a| Event::AssignmentCreated {
                assignment: a.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Turn a rejected admission into `CapacityExceeded`, counting both outcomes.
fn enforce(engineer: &Engineer, admission: Admission) -> Result<(), EngineError> {
    if admission.admitted {
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "admitted").increment(1);
        return Ok(());
    }
    metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "rejected").increment(1);
    warn!(
        "capacity exceeded for engineer {}: {} of {} committed, requested {}",
        engineer.id, admission.total_allocated, engineer.max_capacity, admission.requested
    );
    Err(EngineError::CapacityExceeded {
        engineer_id: engineer.id,
        available: admission.available,
        requested: admission.requested,
    })
}
