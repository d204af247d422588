//! Storage-key grammar.
//!
//! Every (profile, unit)-scoped key in the metadata table is produced here
//! and nowhere else; ad-hoc concatenation at call sites is how experiments
//! cross-contaminate.

/// Record type for a global experience.
pub const TYPE_EXPERIENCE: &str = "llm_experience";
/// Record type for a unit-scoped experience copy.
pub const TYPE_UNIT_EXPERIENCE: &str = "unit_experience";
/// Record type for a few-shot bundle.
pub const TYPE_FEWSHOTS: &str = "fewshot_examples";
/// Record type for a learning unit.
pub const TYPE_LEARNING_UNIT: &str = "learning_unit";
/// Record type for an abstraction hierarchy.
pub const TYPE_HIERARCHY: &str = "abstraction_hierarchy";

/// Key of a global experience: the bare experience id.
pub fn experience(id: &str) -> String {
    id.to_string()
}

/// Key of a unit-scoped experience copy.
pub fn unit_experience(unit: &str, id: &str) -> String {
    format!("unit_exp:{unit}:{id}")
}

/// SQL LIKE prefix matching every unit-scoped copy of `unit`.
pub fn unit_experience_prefix(unit: &str) -> String {
    format!("unit_exp:{unit}:%")
}

/// Key of the active few-shot bundle for (profile, unit).
pub fn few_shots(profile: &str, unit: &str) -> String {
    format!("llm_fewshots:{profile}:{unit}")
}

/// Key of the learning-unit record for (profile, unit).
pub fn learning_unit(profile: &str, unit: &str) -> String {
    format!("llm_learning_unit:{profile}:{unit}")
}

/// Key of the abstraction hierarchy for (profile, unit).
pub fn hierarchy(profile: &str, unit: &str) -> String {
    format!("llm_hierarchy:{profile}:{unit}")
}
