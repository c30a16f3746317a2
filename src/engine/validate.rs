use std::collections::BTreeSet;

use chrono::Utc;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Today's UTC calendar day, the default "now" for point-in-time reports.
pub fn today() -> Day {
    Utc::now().date_naive()
}

pub(crate) fn validate_span(span: &DateSpan) -> Result<(), EngineError> {
    if !span.is_ordered() {
        return Err(EngineError::invalid(format!(
            "start date {} is after end date {}",
            span.start, span.end
        )));
    }
    Ok(())
}

pub(crate) fn validate_percent(field: &str, value: Percent) -> Result<(), EngineError> {
    if value > MAX_PERCENT {
        return Err(EngineError::invalid(format!(
            "{field} must be between 0 and {MAX_PERCENT}, got {value}"
        )));
    }
    Ok(())
}

fn validate_text(field: &str, value: &str, max_len: usize, required: bool) -> Result<(), EngineError> {
    if required && value.trim().is_empty() {
        return Err(EngineError::invalid(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(match field {
            "name" => "name too long",
            "email" => "email too long",
            "description" => "description too long",
            "role" => "role too long",
            "department" => "department too long",
            _ => "text field too long",
        }));
    }
    Ok(())
}

fn validate_skills(skills: &BTreeSet<String>) -> Result<(), EngineError> {
    if skills.len() > MAX_SKILLS {
        return Err(EngineError::LimitExceeded("too many skills"));
    }
    if skills.iter().any(|s| s.len() > MAX_SKILL_LEN) {
        return Err(EngineError::LimitExceeded("skill name too long"));
    }
    Ok(())
}

pub(crate) fn validate_engineer(engineer: &Engineer) -> Result<(), EngineError> {
    validate_text("name", &engineer.name, MAX_NAME_LEN, true)?;
    validate_text("email", &engineer.email, MAX_EMAIL_LEN, true)?;
    if !engineer.email.contains('@') {
        return Err(EngineError::invalid(format!("malformed email: {}", engineer.email)));
    }
    if let Some(dept) = &engineer.department {
        validate_text("department", dept, MAX_NAME_LEN, false)?;
    }
    validate_percent("max_capacity", engineer.max_capacity)?;
    validate_skills(&engineer.skills)
}

pub(crate) fn validate_project(project: &Project) -> Result<(), EngineError> {
    validate_text("name", &project.name, MAX_NAME_LEN, true)?;
    validate_text("description", &project.description, MAX_DESCRIPTION_LEN, true)?;
    validate_span(&project.span)?;
    if project.team_size > MAX_TEAM_SIZE {
        return Err(EngineError::LimitExceeded("team size too large"));
    }
    validate_skills(&project.required_skills)
}

pub(crate) fn validate_assignment(allocation: Percent, span: &DateSpan, role: &str) -> Result<(), EngineError> {
    validate_percent("allocation", allocation)?;
    validate_span(span)?;
    validate_text("role", role, MAX_ROLE_LEN, false)
}
