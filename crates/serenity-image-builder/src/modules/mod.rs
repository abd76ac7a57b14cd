use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod core;
pub mod serenity;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

/// Per-step overrides, read from `[<module>.steps.<step>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepConfig {
    pub label: Option<String>,
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(serenity::SerenityModule),
    ]
}

/// Plan every detected module for `doc`.
pub fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    Ok(plan)
}
