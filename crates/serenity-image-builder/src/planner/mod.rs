use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// One planned pipeline stage.
///
/// `after` entries name either a task id or a token another task `provides`;
/// a trailing `?` marks the dependency optional.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn providers(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out = BTreeMap::new();
        for (id, task) in &self.tasks {
            for token in &task.provides {
                if let Some(existing) = out.insert(token.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{token}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    // Resolved edges as (dependency, dependent).
    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let providers = self.providers()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let (name, optional) = match dep.strip_suffix('?') {
                    Some(d) => (d, true),
                    None => (dep.as_str(), false),
                };
                let resolved = if let Some((known, _)) = self.tasks.get_key_value(name) {
                    Some(known.as_str())
                } else {
                    providers.get(name).copied()
                };
                match resolved {
                    Some(dep_id) => out.push((dep_id, id.as_str())),
                    None if optional => {}
                    None => {
                        return Err(Error::msg(format!(
                            "task '{id}' has unknown dependency '{dep}'"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Deterministic topological order (Kahn, ties broken by task id).
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (dep, dependent) in self.edges()? {
            if outgoing.entry(dep).or_default().insert(dependent) {
                *incoming.entry(dependent).or_default() += 1;
            }
        }

        let mut ready: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, n)| (*n == 0).then_some(*k))
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());

        while let Some(id) = ready.pop_front() {
            if let Some(task) = self.tasks.get(id) {
                out.push(task);
            }
            for &child in outgoing.get(id).into_iter().flatten() {
                if let Some(n) = incoming.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let stuck: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, n)| (*n > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                stuck.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (dep, dependent) in self.edges()? {
            out.push_str(&format!("  \"{dep}\" -> \"{dependent}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_tokens_not_ids() {
        let mut plan = Plan::default();
        plan.add(task("a.pack", &["tree:ready"], &[])).unwrap();
        plan.add(task("z.build", &[], &["tree:ready"])).unwrap();
        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["z.build", "a.pack"]);
    }

    #[test]
    fn optional_missing_dep_is_ignored() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope?"], &[])).unwrap();
        assert_eq!(plan.ordered().unwrap().len(), 1);
    }

    #[test]
    fn unknown_dep_and_cycles_fail() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("nope"));

        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], &[])).unwrap();
        assert!(plan.add(task("a", &[], &[])).is_err());
    }
}
