//! `conductor patterns`: list the workflow templates in the data directory.

use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conductor_infra::pattern::fs::FilePatternRegistry;

pub fn list_patterns(data_dir: &Path, json: bool) -> Result<()> {
    let registry = FilePatternRegistry::in_data_dir(data_dir);
    let definitions = registry
        .definitions()
        .map_err(|e| anyhow::anyhow!("Failed to read patterns: {e}"))?;

    if json {
        let out: Vec<_> = definitions
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "name": def.name,
                    "description": def.description,
                    "mode": def.mode,
                    "nodes": def.nodes.len(),
                    "path": path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!();
        println!(
            "  No patterns found in {}",
            style(registry.dir().display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Pattern").fg(Color::Cyan),
            Cell::new("Mode"),
            Cell::new("Nodes"),
            Cell::new("Description"),
        ]);

    for (_, def) in &definitions {
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(def.mode),
            Cell::new(def.nodes.len()),
            Cell::new(def.description.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    Ok(())
}
