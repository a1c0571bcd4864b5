//! The built-in virtual company generation pipeline.

use super::{Executable, StageDefinition, StageLimits, StageRegistry};
use crate::errors::RegistryError;
use std::path::Path;

/// Id of the fast status synchronization stage run after every success.
pub const FOLLOW_UP_STAGE: &str = "status_sync";

// (id, script, dependencies, description)
const PIPELINE: &[(&str, &str, &[&str], &str)] = &[
    (
        "company_foundation",
        "00_generate_company_foundation.js",
        &[],
        "Company foundation and organizational structure",
    ),
    (
        "personas",
        "01_create_personas_from_structure.js",
        &["company_foundation"],
        "Personas derived from the org structure",
    ),
    (
        "biografias",
        "02_generate_biografias_COMPLETO.js",
        &["personas"],
        "Persona biographies",
    ),
    (
        "atribuicoes",
        "03_generate_atribuicoes_contextualizadas.js",
        &["biografias"],
        "Contextualized role assignments",
    ),
    (
        "competencias",
        "04_generate_competencias_grok.js",
        &["atribuicoes"],
        "Competencies and task catalogue",
    ),
    (
        "avatares",
        "05a_generate_avatar_prompts.js",
        &["biografias"],
        "Avatar prompts",
    ),
    (
        "automation_analysis",
        "06_analyze_tasks_for_automation.js",
        &["atribuicoes"],
        "Automation potential of tasks",
    ),
    (
        "workflows",
        "07_generate_n8n_workflows.js",
        &["automation_analysis"],
        "Automation workflows",
    ),
    (
        "supervision",
        "07.5_generate_supervision_chains.js",
        &["workflows"],
        "Supervision chains",
    ),
    (
        "machine_learning",
        "08_generate_machine_learning.js",
        &["competencias"],
        "Machine learning profiles",
    ),
    (
        "auditoria",
        "09_generate_auditoria.js",
        &["personas"],
        "Audit trail",
    ),
    (
        "knowledge_base",
        "10_generate_knowledge_base.js",
        &["biografias"],
        "Knowledge base",
    ),
];

fn node_script(scripts_dir: &Path, script: &str) -> Executable {
    Executable::new("node")
        .arg(scripts_dir.join(script).to_string_lossy())
        .in_dir(scripts_dir)
}

/// Builds the default registry with scripts resolved under `scripts_dir`.
pub fn default_registry(scripts_dir: &Path) -> Result<StageRegistry, RegistryError> {
    let mut builder = StageRegistry::builder();

    for (id, script, deps, description) in PIPELINE {
        builder = builder.stage(
            StageDefinition::new(*id, node_script(scripts_dir, script))
                .depends_on(deps)
                .with_description(*description),
        );
    }

    builder
        .stage(
            StageDefinition::new(
                FOLLOW_UP_STAGE,
                node_script(scripts_dir, "sync_scripts_status.js"),
            )
            .with_limits(StageLimits::light())
            .with_description("Synchronize stage completion flags"),
        )
        .follow_up(FOLLOW_UP_STAGE)
        .build()
}
