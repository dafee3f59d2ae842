//! Audit a built bundle
use anyhow::{Context, Result, bail};
use pybundler_core::BundleLayout;
use std::path::{Path, PathBuf};

use super::absolute;
use crate::Format;

/// Recover the layout of an existing bundle from its `Info.plist`.
fn layout_for(bundle: &Path) -> Result<BundleLayout> {
    let info = bundle.join("Contents/Info.plist");
    let value = plist::Value::from_file(&info).with_context(|| format!("Failed to read {}", info.display()))?;
    let Some(dict) = value.as_dictionary() else {
        bail!("{} is not a dictionary", info.display());
    };
    let name = dict
        .get("CFBundleExecutable")
        .and_then(plist::Value::as_string)
        .with_context(|| format!("{} has no CFBundleExecutable", info.display()))?;
    let version = dict
        .get("PythonInfoDict")
        .and_then(plist::Value::as_dictionary)
        .and_then(|d| d.get("PythonShortVersion"))
        .and_then(plist::Value::as_string)
        .and_then(|v| v.split_once('.'))
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
        .unwrap_or((3, 0));
    Ok(BundleLayout::new(bundle, name, version))
}

pub fn audit(bundle: &Path, allow: &[PathBuf], format: Format) -> Result<()> {
    let bundle = absolute(bundle)?;
    let layout = layout_for(&bundle)?;
    let report = pybundler_core::audit::audit(&layout, allow)?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for binary in &report.binaries {
            let archs: Vec<&str> = binary.archs.iter().map(String::as_str).collect();
            println!(
                "{}  [{}]  macOS {}",
                binary.path.display(),
                archs.join(", "),
                binary.min_os.as_deref().unwrap_or("?")
            );
        }
        println!();
        let common: Vec<&str> = report.common_archs.iter().map(String::as_str).collect();
        println!("{} binaries, common architectures: {}", report.binaries.len(), common.join(", "));
        if let Some(min_os) = &report.min_os {
            println!("Requires macOS {min_os}");
        }
        for line in &report.external {
            println!("external: {line}");
        }
        for line in &report.unresolved {
            println!("unresolved: {line}");
        }
    }

    if !report.is_clean() {
        bail!(
            "{} reference(s) outside the bundle, {} unresolved",
            report.external.len(),
            report.unresolved.len()
        );
    }
    Ok(())
}
