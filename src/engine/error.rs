use std::fmt;

use thiserror::Error;
use ulid::Ulid;

/// Which kind of record an id failed to resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Engineer,
    Project,
    Assignment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Engineer => "engineer",
            Entity::Project => "project",
            Entity::Assignment => "assignment",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: Ulid },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: Entity, id: Ulid },

    #[error(
        "engineer {engineer_id} does not have enough available capacity: available {available}, requested {requested}"
    )]
    CapacityExceeded {
        engineer_id: Ulid,
        available: i64,
        requested: u32,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{entity} {id} is still referenced by {count} assignment(s)")]
    HasAssignments { entity: Entity, id: Ulid, count: usize },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// The persistence layer failed. Never folded into one of the above.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
