use std::path::Path;

use anyhow::{Context, Result};

use harvester_types::spec::Specification;

/// Execute the `spec` command: parse a specification and print it in
/// canonical form.
pub fn execute(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read specification: {}", path.display()))?;
    let spec = Specification::parse(&text)
        .with_context(|| format!("Invalid specification: {}", path.display()))?;
    println!("{}", spec.serialize_pretty());
    Ok(())
}
