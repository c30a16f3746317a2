//! Hard caps. Every user-controlled collection or string is bounded here.

pub const MAX_ENGINEERS_PER_TENANT: usize = 100_000;
pub const MAX_PROJECTS_PER_TENANT: usize = 100_000;
pub const MAX_ASSIGNMENTS_PER_ENGINEER: usize = 10_000;

/// Upper bound for both `allocation` and `max_capacity` (percent of one headcount).
pub const MAX_PERCENT: u32 = 100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_ROLE_LEN: usize = 256;
pub const MAX_SKILL_LEN: usize = 64;
pub const MAX_SKILLS: usize = 64;
pub const MAX_TEAM_SIZE: u32 = 10_000;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
