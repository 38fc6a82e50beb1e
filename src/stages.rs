//! Known workflow stages.
//!
//! Stage names select which instruction files a run uses. The catalog is only
//! used for listing and for showing which known stages a pattern selects;
//! unknown stage names are still accepted.

use glob::Pattern;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub description: &'static str,
    pub optional: bool,
}

const fn required(name: &'static str, description: &'static str) -> Stage {
    Stage {
        name,
        description,
        optional: false,
    }
}

const fn optional(name: &'static str, description: &'static str) -> Stage {
    Stage {
        name,
        description,
        optional: true,
    }
}

pub const CATALOG: &[Stage] = &[
    required(
        "planning_design_gitsetup",
        "Initial planning, design, and Git setup",
    ),
    required("scaffolding_mvp", "Build MVP structure with TDD"),
    required("database_design", "Design and implement database layer"),
    required("code_debug", "Debug, optimize, and improve code quality"),
    required(
        "addchange_check",
        "Pull request workflow and change management",
    ),
    required("deploy_test", "Set up deployment and production testing"),
    required("document", "Create comprehensive documentation"),
    required("upgrade", "Upgrade dependencies and add enhancements"),
    optional("opt_api_design", "API-first design and contract definition"),
    optional("opt_integration_test", "End-to-end and integration testing"),
    optional(
        "opt_performance_baseline",
        "Establish performance metrics and optimize",
    ),
    optional("opt_security_audit", "Security assessment and remediation"),
    optional(
        "opt_monitoring_observability",
        "Implement monitoring and observability",
    ),
    optional(
        "opt_release_management",
        "Version control and release automation",
    ),
];

/// Compile a stage pattern (`scaffolding_mvp`, `planning*`, `*mvp`).
pub fn compile(pattern: &str) -> Result<Pattern, ConfigError> {
    Pattern::new(pattern).map_err(|source| ConfigError::InvalidStage {
        pattern: pattern.to_string(),
        source,
    })
}

/// Catalog stages selected by `pattern`, in catalog order.
pub fn matching(pattern: &Pattern) -> Vec<&'static Stage> {
    CATALOG.iter().filter(|s| pattern.matches(s.name)).collect()
}

/// Render the catalog for `coderun stages`.
pub fn render_catalog() -> String {
    let mut out = String::from("Required stages\n");
    for stage in CATALOG.iter().filter(|s| !s.optional) {
        out.push_str(&format!("  {:<30} {}\n", stage.name, stage.description));
    }
    out.push_str("\nOptional stages\n");
    for stage in CATALOG.iter().filter(|s| s.optional) {
        out.push_str(&format!("  {:<30} {}\n", stage.name, stage.description));
    }
    out.push_str("\nRun a stage with: coderun run <base_dir> --stage <name>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_eight_required_and_six_optional() {
        assert_eq!(CATALOG.iter().filter(|s| !s.optional).count(), 8);
        assert_eq!(CATALOG.iter().filter(|s| s.optional).count(), 6);
    }

    #[test]
    fn wildcard_patterns_select_stages() {
        let p = compile("planning*").unwrap();
        let names: Vec<_> = matching(&p).iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["planning_design_gitsetup"]);

        let p = compile("opt_*").unwrap();
        assert_eq!(matching(&p).len(), 6);

        let p = compile("*mvp").unwrap();
        assert_eq!(matching(&p)[0].name, "scaffolding_mvp");
    }

    #[test]
    fn unknown_stage_matches_nothing() {
        let p = compile("custom_stage").unwrap();
        assert!(matching(&p).is_empty());
    }

    #[test]
    fn render_lists_both_sections() {
        let out = render_catalog();
        assert!(out.contains("Required stages"));
        assert!(out.contains("Optional stages"));
        assert!(out.contains("opt_security_audit"));
    }
}
