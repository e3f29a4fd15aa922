use std::fmt::Write;

use petgraph::visit::EdgeRef;

use crate::backend::{DependencyKind, GraphBackend, UseStatus};

impl GraphBackend {
    /// Renders the task graph as a Mermaid diagram, color-coded by status.
    ///
    /// * **Blue**: every captured use released
    /// * **Green**: ready to run
    /// * **Yellow**: waiting on a dependency
    /// * **Grey**: skipped with its branch
    ///
    /// Anti-dependencies are drawn as dotted edges.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");

            let statuses: Vec<_> = task
                .captured
                .iter()
                .filter_map(|&id| self.use_node(id))
                .map(|node| node.status)
                .collect();

            let (label, color) = if statuses.contains(&UseStatus::Abandoned) {
                ("skipped", "#D3D3D3")
            } else if !statuses.is_empty() && statuses.iter().all(|&s| s == UseStatus::Released) {
                ("done", "#ADD8E6")
            } else if self.is_task_ready(task.id) {
                ("ready", "#90EE90")
            } else {
                ("waiting", "#FFFF99")
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in self.graph.edge_references() {
            let arrow = match edge.weight() {
                DependencyKind::AntiDependency => "-.->",
                _ => "-->",
            };
            let _ = writeln!(
                f,
                "    {} {} |{:?}| {}",
                edge.source().index(),
                arrow,
                edge.weight(),
                edge.target().index()
            );
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{Backend, GraphBackend, UseDescriptor, UseRole};
    use crate::core::TaskId;
    use crate::key;
    use crate::permission::Permissions;

    #[test]
    fn test_render_mermaid() {
        let mut backend = GraphBackend::default();
        let f0 = backend.make_null_flow(&key!("x"));
        let f1 = backend.make_next_flow(&key!("x"), f0);

        let mut register = |task: u32, name: &str, permissions, out_flow| {
            backend.register_use(UseDescriptor {
                key: key!("x"),
                task: TaskId(task),
                task_name: name.into(),
                permissions,
                in_flow: f0,
                out_flow,
                role: UseRole::Captured,
                guard: None,
            })
        };

        register(1, "reader", Permissions::READ_READ, f0);
        register(2, "writer", Permissions::MODIFY_MODIFY, f1);

        let chart = backend.render_mermaid();
        assert!(chart.starts_with("graph LR\n"));
        assert!(chart.contains("0[\"reader\\nready\"]"));
        assert!(chart.contains("1[\"writer\\nwaiting\"]"));
        assert!(chart.contains("0 -.-> |AntiDependency| 1"));
    }
}
