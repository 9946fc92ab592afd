//! Graph command - inspect the instrument part graph

use crate::cli::args::{GraphArgs, OutputFormat};
use crate::error::{ForgeError, ForgeResult};
use crate::graph::{instrument_graph, BuildNode, DependencyGraph};
use crate::params::catalog;
use crate::ui::{self, UiContext};
use console::style;

/// Execute the graph command
pub async fn execute(args: GraphArgs) -> ForgeResult<()> {
    let graph = instrument_graph()?;

    if let Some(root) = args.order {
        let order = graph.topological_order(&root)?;
        return print_ids(&format!("Build order of {}", root), &order, args.format, true);
    }

    if let Some(param) = args.affected_by {
        let affected: Vec<String> = graph.affected_by(&param).into_iter().collect();
        if affected.is_empty() && catalog::lookup(&param).is_none() {
            return Err(ForgeError::UnknownParameter(param));
        }
        return print_ids(
            &format!("Parts rebuilt after editing {}", param),
            &affected,
            args.format,
            false,
        );
    }

    print_nodes(&graph, args.format)
}

fn print_ids(title: &str, ids: &[String], format: OutputFormat, numbered: bool) -> ForgeResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ids)?),
        OutputFormat::Plain => {
            for id in ids {
                println!("{}", id);
            }
        }
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::intro(&ctx, title);
            if ids.is_empty() {
                ui::step_info(&ctx, "No parts");
            }
            for (index, id) in ids.iter().enumerate() {
                if numbered {
                    println!("  {:>2}. {}", index + 1, id);
                } else {
                    println!("  {}", id);
                }
            }
        }
    }
    Ok(())
}

fn print_nodes(graph: &DependencyGraph, format: OutputFormat) -> ForgeResult<()> {
    let nodes: Vec<&BuildNode> = graph
        .node_ids()
        .iter()
        .filter_map(|id| graph.get(id))
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
        OutputFormat::Plain => {
            for node in &nodes {
                println!("{}", node.id);
            }
        }
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::intro(&ctx, "Parts");

            println!(
                "{:<16} {:<16} {:<8} {}",
                style("NODE").bold(),
                style("KIND").bold(),
                style("PARAMS").bold(),
                style("DEPENDS ON").bold()
            );
            println!("{}", "-".repeat(72));

            for node in &nodes {
                let deps = if node.node_deps.is_empty() {
                    "-".to_string()
                } else {
                    node.node_deps.join(", ")
                };
                println!(
                    "{:<16} {:<16} {:<8} {}",
                    node.id,
                    node.kind.to_string(),
                    node.param_deps.len(),
                    deps
                );
            }

            println!();
            println!("{} part(s)", nodes.len());
        }
    }
    Ok(())
}
