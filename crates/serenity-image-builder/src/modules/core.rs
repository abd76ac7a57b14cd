use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::WorkspaceConfig;

const KNOWN_TABLES: &[&str] = &["workspace", "serenity"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.root_keys() {
            if !KNOWN_TABLES.contains(&key) {
                return Err(Error::msg(format!(
                    "unknown config table '{key}' (supported: {})",
                    KNOWN_TABLES.join(", ")
                )));
            }
        }
        let _ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();

        plan.add(Task {
            id: "core.init".into(),
            label: "Prepare workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}
