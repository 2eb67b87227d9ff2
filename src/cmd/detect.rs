//! Project inspection command (`dockhand detect`).

use std::path::Path;

use anyhow::{Context, Result};

use dockhand::deploy::planner::{PolicyTable, detect_project_type, find_dockerfile};

pub fn cmd_detect(path: &Path, show_dockerfile: bool) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("Not a directory: {}", path.display());
    }

    let existing = find_dockerfile(path);
    let detected = detect_project_type(path);

    println!("Path:        {}", path.display());
    match &detected {
        Ok(project_type) => println!("Type:        {}", project_type),
        Err(e) => println!("Type:        {}", e),
    }
    match existing {
        Some(name) => println!("Dockerfile:  present ({})", name),
        None => println!("Dockerfile:  would be generated"),
    }

    if show_dockerfile && existing.is_none() {
        let project_type = detected.context("Cannot render a Dockerfile")?;
        let rendered = PolicyTable::standard().render(project_type, path)?;
        println!();
        print!("{}", rendered);
    }

    Ok(())
}
