use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

struct DemoEngineer {
    name: &'static str,
    email: &'static str,
    seniority: Seniority,
    department: &'static str,
    max_capacity: Percent,
    skills: &'static [&'static str],
}

struct DemoProject {
    name: &'static str,
    description: &'static str,
    start: (i32, u32, u32),
    end: (i32, u32, u32),
    status: ProjectStatus,
    team_size: u32,
    required_skills: &'static [&'static str],
}

/// (engineer index, project index, allocation, role). Windows follow the project.
type DemoAssignment = (usize, usize, Percent, &'static str);

const ENGINEERS: &[DemoEngineer] = &[
    DemoEngineer {
        name: "John Doe",
        email: "john.doe@company.com",
        seniority: Seniority::Senior,
        department: "Frontend",
        max_capacity: 100,
        skills: &["React", "Node.js", "MongoDB", "TypeScript"],
    },
    DemoEngineer {
        name: "Jane Smith",
        email: "jane.smith@company.com",
        seniority: Seniority::Mid,
        department: "Backend",
        max_capacity: 100,
        skills: &["Python", "Django", "PostgreSQL", "AWS"],
    },
    DemoEngineer {
        name: "Mike Wilson",
        email: "mike.wilson@company.com",
        seniority: Seniority::Junior,
        department: "Frontend",
        max_capacity: 50,
        skills: &["React", "Vue.js", "CSS", "JavaScript"],
    },
    DemoEngineer {
        name: "Lisa Brown",
        email: "lisa.brown@company.com",
        seniority: Seniority::Senior,
        department: "DevOps",
        max_capacity: 100,
        skills: &["Node.js", "Express", "MongoDB", "Docker"],
    },
];

const PROJECTS: &[DemoProject] = &[
    DemoProject {
        name: "E-commerce Platform Redesign",
        description: "Complete redesign of the company e-commerce platform with modern UI/UX",
        start: (2024, 1, 15),
        end: (2024, 6, 15),
        status: ProjectStatus::Active,
        team_size: 3,
        required_skills: &["React", "Node.js", "MongoDB", "TypeScript"],
    },
    DemoProject {
        name: "Mobile App Development",
        description: "Native mobile application for iOS and Android platforms",
        start: (2024, 2, 1),
        end: (2024, 8, 1),
        status: ProjectStatus::Planning,
        team_size: 2,
        required_skills: &["React Native", "JavaScript", "API Integration"],
    },
    DemoProject {
        name: "Data Analytics Dashboard",
        description: "Internal dashboard for business analytics and reporting",
        start: (2024, 3, 1),
        end: (2024, 7, 1),
        status: ProjectStatus::Active,
        team_size: 2,
        required_skills: &["Python", "Django", "PostgreSQL", "Data Visualization"],
    },
    DemoProject {
        name: "DevOps Infrastructure Setup",
        description: "Setting up CI/CD pipelines and cloud infrastructure",
        start: (2024, 1, 1),
        end: (2024, 4, 1),
        status: ProjectStatus::Completed,
        team_size: 1,
        required_skills: &["Docker", "AWS", "Kubernetes", "CI/CD"],
    },
];

const ASSIGNMENTS: &[DemoAssignment] = &[
    (0, 0, 60, "Tech Lead"),
    (0, 2, 40, "Senior Developer"),
    (1, 2, 80, "Backend Developer"),
    (1, 3, 20, "Developer"),
    (2, 0, 30, "Frontend Developer"),
    (2, 1, 20, "UI Developer"),
    (3, 3, 70, "DevOps Engineer"),
    (3, 0, 30, "DevOps Support"),
];

fn date((y, m, d): (i32, u32, u32)) -> Result<Day, EngineError> {
    NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| EngineError::invalid(format!("bad demo date {y}-{m}-{d}")))
}

/// Populate an empty engine with a small demo organisation: four engineers
/// (one half-time), four projects and eight assignments, all created through
/// the normal lifecycle so every assignment passes the capacity check.
///
/// Returns `false` without touching anything if the engine already holds any
/// engineer or project. The manager referenced by the projects is not an
/// engineer; it gets a fresh id.
pub async fn seed_if_empty(engine: &Engine) -> Result<bool, EngineError> {
    if !engine.is_empty() {
        info!("seed skipped: engine already has data");
        return Ok(false);
    }

    let manager_id = Ulid::new();

    let mut engineers = Vec::with_capacity(ENGINEERS.len());
    for demo in ENGINEERS {
        let engineer = Engineer::new(Ulid::new(), demo.name, demo.email)
            .with_capacity(demo.max_capacity)
            .with_skills(demo.skills.iter().copied())
            .with_seniority(demo.seniority)
            .with_department(demo.department);
        engineers.push(engine.create_engineer(engineer).await?);
    }

    let mut projects = Vec::with_capacity(PROJECTS.len());
    for demo in PROJECTS {
        let project = Project::new(
            Ulid::new(),
            demo.name,
            demo.description,
            DateSpan::new(date(demo.start)?, date(demo.end)?),
            manager_id,
        )
        .with_required_skills(demo.required_skills.iter().copied())
        .with_team_size(demo.team_size)
        .with_status(demo.status);
        projects.push(engine.create_project(project).await?);
    }

    for &(e, p, allocation, role) in ASSIGNMENTS {
        engine
            .create_assignment(NewAssignment {
                engineer_id: engineers[e].id,
                project_id: projects[p].id,
                allocation,
                span: projects[p].span,
                role: role.to_string(),
            })
            .await?;
    }

    info!(
        "seeded {} engineers, {} projects, {} assignments",
        engineers.len(),
        projects.len(),
        ASSIGNMENTS.len()
    );
    Ok(true)
}
