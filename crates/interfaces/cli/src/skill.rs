//! `skill search|install|uninstall|list|update|info` (§6 CLI surface).
//!
//! Skills here are in-process `Tool` implementations registered at startup,
//! not a package format with a remote registry — there is no marketplace
//! backend in this build to search or install from, so those subcommands
//! report that plainly rather than pretending to reach one.

use anyhow::{bail, Result};
use vesper_tools::builtins::{ReadFileTool, RunShellTool, WriteFileTool};
use vesper_tools::{Tool, ToolRegistry};

use crate::SkillCommands;

fn built_in_registry() -> ToolRegistry {
    let workspace_root = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(WriteFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(RunShellTool { workspace_root }));
    registry
}

pub fn run(command: SkillCommands) -> Result<()> {
    match command {
        SkillCommands::List => {
            for spec in built_in_registry().list_specs() {
                println!("{}\t{}", spec.name, spec.description);
            }
            Ok(())
        }
        SkillCommands::Info { name } => {
            let registry = built_in_registry();
            let tool = registry.get(&name).ok_or_else(|| anyhow::anyhow!("unknown skill: {name}"))?;
            println!("{}", serde_json::to_string_pretty(&tool_contract(tool))?);
            Ok(())
        }
        SkillCommands::Search { query } => {
            bail!("skill search for \"{query}\" requires a marketplace backend, which this build does not include");
        }
        SkillCommands::Install { name } => {
            bail!("installing \"{name}\" requires a marketplace backend, which this build does not include");
        }
        SkillCommands::Uninstall { name } => {
            bail!("\"{name}\" is a built-in skill compiled into this binary and cannot be uninstalled");
        }
        SkillCommands::Update { name } => {
            bail!("updating \"{name}\" requires a marketplace backend, which this build does not include");
        }
    }
}

fn tool_contract(tool: &dyn Tool) -> serde_json::Value {
    let spec = tool.spec();
    serde_json::json!({
        "name": spec.name,
        "description": spec.description,
        "params": spec.params,
    })
}
