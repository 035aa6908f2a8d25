//! Graph introspection: render a workflow's task graph as Graphviz DOT or
//! as a `make`-compatible rule list, for inspection without running it.

use crate::workflow::Workflow;
use std::fmt::Write as _;
use taskgraph_uri::Uri;

fn label(uri: &Uri) -> String {
    uri.as_str().to_owned()
}

/// Renders every registered task and its prereq edges as a `digraph`.
/// Edges point from prereq to dependent, matching execution order.
pub fn to_dot(workflow: &Workflow) -> String {
    let mut out = String::new();
    out.push_str("digraph workflow {\n");
    out.push_str("  rankdir=LR;\n");
    for (uri, _) in workflow.tasks() {
        let _ = writeln!(out, "  {:?};", label(uri));
    }
    for (uri, _) in workflow.tasks() {
        if let Ok(preds) = workflow.dag().transitive_prereqs(uri) {
            for pred in preds.iter().filter(|p| *p != uri) {
                // Only direct edges, not the full transitive closure: keep
                // only prereqs that are not themselves prereqs of another
                // prereq of this node.
                let is_direct = !preds.iter().any(|other| {
                    other != pred
                        && other != uri
                        && workflow
                            .dag()
                            .transitive_prereqs(other)
                            .map(|o| o.contains(pred))
                            .unwrap_or(false)
                });
                if is_direct {
                    let _ = writeln!(out, "  {:?} -> {:?};", label(pred), label(uri));
                }
            }
        }
    }
    out.push_str("}\n");
    out
}

/// Renders the workflow as a sequence of `make`-style rules: each task
/// becomes a target depending on its declared inputs, recipe left as a
/// `#` comment since task bodies are closures or shell commands that may
/// not map onto a single portable command line.
pub fn to_makefile(workflow: &Workflow) -> String {
    let mut out = String::new();
    for (uri, task) in workflow.tasks() {
        let deps: Vec<String> = task.inputs().iter().map(|u| u.as_str().to_owned()).collect();
        let _ = writeln!(out, "{}: {}", uri.as_str(), deps.join(" "));
        if let Some(command) = task.command_body() {
            let _ = writeln!(out, "\t{}", command);
        } else {
            let _ = writeln!(out, "\t# {}", uri.as_str());
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn dot_includes_every_task_and_direct_edge() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_| true)
                    .outputs(vec![Uri::file("/a.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), |_| true)
                    .inputs(vec![Uri::file("/a.out")])
                    .build(),
            )
            .unwrap();
        workflow.build().unwrap();

        let dot = to_dot(&workflow);
        assert!(dot.contains("\"task://a\""));
        assert!(dot.contains("\"task://b\""));
        assert!(dot.contains("\"task://a\" -> \"task://b\""));
    }

    #[test]
    fn makefile_lists_command_recipes() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(Task::command(Uri::task("a"), "echo hi").build())
            .unwrap();
        workflow.build().unwrap();

        let makefile = to_makefile(&workflow);
        assert!(makefile.contains("task://a:"));
        assert!(makefile.contains("\techo hi"));
    }

    #[test]
    fn dot_chain_keeps_only_direct_edges() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_| true)
                    .outputs(vec![Uri::file("/a.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), |_| true)
                    .inputs(vec![Uri::file("/a.out")])
                    .outputs(vec![Uri::file("/b.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("c"), |_| true)
                    .inputs(vec![Uri::file("/b.out")])
                    .build(),
            )
            .unwrap();
        workflow.build().unwrap();

        insta::assert_snapshot!(to_dot(&workflow), @r###"
        digraph workflow {
          rankdir=LR;
          "task://a";
          "task://b";
          "task://c";
          "task://a" -> "task://b";
          "task://b" -> "task://c";
        }
        "###);
    }

    #[test]
    fn makefile_falls_back_to_a_comment_for_thread_tasks() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("build"), |_| true)
                    .inputs(vec![Uri::file("/x"), Uri::file("/y")])
                    .build(),
            )
            .unwrap();
        workflow.build().unwrap();

        insta::assert_snapshot!(to_makefile(&workflow), @r###"
        task://build: file:///x file:///y
        	# task://build

        "###);
    }
}
