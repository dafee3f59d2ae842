//! Inspect module discovery without building
use anyhow::Result;
use pybundler_core::{NodeKind, Pipeline, TracingReporter};
use std::path::Path;

use super::{absolute, load_config};
use crate::Format;

pub fn graph(config: Option<&Path>, interpreter: Option<&Path>, format: Format) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(interp) = interpreter {
        config.interpreter = Some(absolute(interp)?);
    }
    let discovery = Pipeline::new(&config, &TracingReporter).discover()?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&discovery)?);
        return Ok(());
    }

    for node in discovery.graph.nodes() {
        let location = node
            .filename
            .as_ref()
            .or_else(|| node.package_path.first())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let marker = if node.whole_package { " [whole]" } else { "" };
        println!("{:<12} {}{marker}  {location}", kind_label(node.kind), node.name);
    }
    println!();
    println!("{} module(s)", discovery.graph.len());
    if !discovery.verdict.prescripts.is_empty() {
        let names: Vec<&str> = discovery.verdict.prescripts.keys().map(String::as_str).collect();
        println!("prescripts: {}", names.join(", "));
    }
    if discovery.report.is_clean() {
        println!("No missing modules");
    } else {
        print!("{}", discovery.report.render());
    }
    Ok(())
}

fn kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::SourceModule => "module",
        NodeKind::SourcePackage => "package",
        NodeKind::NamespacePackage => "namespace",
        NodeKind::NativeExtension => "extension",
        NodeKind::Builtin => "builtin",
        NodeKind::Frozen => "frozen",
        NodeKind::Missing => "missing",
        NodeKind::Excluded => "excluded",
        NodeKind::Alias => "alias",
    }
}
