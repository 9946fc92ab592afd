//! Parameter files
//!
//! A parameter file is plain TOML. Nested tables and dotted keys both map to
//! dotted parameter names:
//!
//! ```toml
//! [scale]
//! bass = 650.0
//! "headStock.angle" = 12.0
//! ```

use super::ParamValue;
use crate::error::{ForgeError, ForgeResult};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Read a parameter file into a batch of edits
pub async fn load_parameter_file(path: &Path) -> ForgeResult<Vec<(String, ParamValue)>> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| ForgeError::io(format!("reading parameter file {}", path.display()), e))?;

    let edits = parse_parameters(&content).map_err(|e| match e {
        ForgeError::TomlParse(reason) => ForgeError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    })?;

    debug!("Loaded {} parameters from {}", edits.len(), path.display());
    Ok(edits)
}

/// Parse TOML text into a batch of edits, in key order
pub fn parse_parameters(content: &str) -> ForgeResult<Vec<(String, ParamValue)>> {
    let table: toml::Table = toml::from_str(content)?;
    let mut edits = Vec::new();
    flatten("", &toml::Value::Table(table), &mut edits)?;
    Ok(edits)
}

fn flatten(
    prefix: &str,
    value: &toml::Value,
    out: &mut Vec<(String, ParamValue)>,
) -> ForgeResult<()> {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&name, child, out)?;
            }
            Ok(())
        }
        toml::Value::Boolean(b) => {
            out.push((prefix.to_string(), ParamValue::Bool(*b)));
            Ok(())
        }
        toml::Value::Integer(i) => {
            out.push((prefix.to_string(), ParamValue::Int(*i)));
            Ok(())
        }
        toml::Value::Float(f) => {
            out.push((prefix.to_string(), ParamValue::Float(*f)));
            Ok(())
        }
        toml::Value::String(s) => {
            out.push((prefix.to_string(), ParamValue::Text(s.clone())));
            Ok(())
        }
        toml::Value::Array(items) => {
            let numbers: Option<Vec<f64>> = items
                .iter()
                .map(|item| match item {
                    toml::Value::Float(f) => Some(*f),
                    toml::Value::Integer(i) => Some(*i as f64),
                    _ => None,
                })
                .collect();
            match numbers {
                Some(list) => {
                    out.push((prefix.to_string(), ParamValue::FloatList(list)));
                    Ok(())
                }
                None => Err(ForgeError::InvalidParameter {
                    name: prefix.to_string(),
                    reason: "arrays must contain only numbers".to_string(),
                }),
            }
        }
        toml::Value::Datetime(_) => Err(ForgeError::InvalidParameter {
            name: prefix.to_string(),
            reason: "datetime values are not supported".to_string(),
        }),
    }
}
