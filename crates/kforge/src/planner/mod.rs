use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens this task runs after. A trailing `?` marks the
    /// dependency optional: it is dropped when nothing in the plan satisfies it.
    pub after: Vec<String>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Resolved edges as `(dependency, dependent)` pairs.
    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let mut provides: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for token in &task.provides {
                if let Some(existing) = provides.insert(token.as_str(), id.as_str()) {
                    return Err(Error::config(format!(
                        "provide token '{token}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }

        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let (name, optional) = match dep.strip_suffix('?') {
                    Some(d) => (d, true),
                    None => (dep.as_str(), false),
                };
                let resolved = if let Some((key, _)) = self.tasks.get_key_value(name) {
                    Some(key.as_str())
                } else {
                    provides.get(name).copied()
                };
                match resolved {
                    Some(dep_id) => out.push((dep_id, id.as_str())),
                    None if optional => {}
                    None => {
                        return Err(Error::config(format!(
                            "task '{id}' has unknown dependency '{dep}'"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Topological order; ties are broken by task id so plans are deterministic.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (dep, dependent) in self.edges()? {
            if outgoing.entry(dep).or_default().insert(dependent)
                && let Some(n) = incoming.get_mut(dependent)
            {
                *n += 1;
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
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, n)| (*n > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
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
    fn orders_by_tokens_and_drops_missing_optional_deps() {
        let mut plan = Plan::default();
        plan.add(task("b", &["tok:a", "kernel:built?"], &[]))
            .expect("add b");
        plan.add(task("a", &[], &["tok:a"])).expect("add a");

        let ids: Vec<_> = plan
            .ordered()
            .expect("ordered")
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_unknown_required_dep_and_cycles() {
        let mut plan = Plan::default();
        plan.add(task("a", &["missing"], &[])).expect("add");
        assert!(plan.ordered().is_err());

        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).expect("add a");
        plan.add(task("b", &["a"], &[])).expect("add b");
        let err = plan.ordered().expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }
}
