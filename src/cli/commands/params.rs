//! Params command - list the instrument parameter catalogue

use crate::cli::args::{OutputFormat, ParamsArgs};
use crate::config::Config;
use crate::error::ForgeResult;
use crate::params::{load_parameter_file, ParamValue, ParameterStore, CATALOG};
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ParamRow {
    name: &'static str,
    value: ParamValue,
    default: ParamValue,
    description: &'static str,
    choices: &'static [&'static str],
}

impl ParamRow {
    fn is_default(&self) -> bool {
        self.value == self.default
    }
}

/// Execute the params command
pub async fn execute(args: ParamsArgs, config: &Config) -> ForgeResult<()> {
    let mut store = ParameterStore::with_catalog();
    if let Some(path) = &config.instrument.parameters {
        store.apply(load_parameter_file(path).await?)?;
    }

    let prefix = args.prefix.as_deref().unwrap_or("");
    let rows: Vec<ParamRow> = CATALOG
        .iter()
        .filter(|spec| spec.name.starts_with(prefix))
        .map(|spec| ParamRow {
            name: spec.name,
            value: store
                .get(spec.name)
                .map_or_else(|| spec.default_value(), |p| p.value.clone()),
            default: spec.default_value(),
            description: spec.description,
            choices: spec.choices,
        })
        .collect();

    if rows.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, &format!("No parameters match '{}'", prefix));
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}={}", row.name, row.value);
            }
        }
    }

    Ok(())
}

fn print_table(rows: &[ParamRow]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Parameters");

    println!(
        "{:<32} {:<24} {}",
        style("NAME").bold(),
        style("VALUE").bold(),
        style("DESCRIPTION").bold()
    );
    println!("{}", "-".repeat(90));

    for row in rows {
        let value = row.value.to_string();
        let value = if row.is_default() {
            style(value)
        } else {
            style(value).yellow()
        };
        println!("{:<32} {:<24} {}", row.name, value, row.description);
        if !row.choices.is_empty() {
            ui::remark(&ctx, &format!("one of: {}", row.choices.join(", ")));
        }
    }

    println!();
    println!("{} parameter(s)", rows.len());
}
