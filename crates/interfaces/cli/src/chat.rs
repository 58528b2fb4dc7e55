//! `chat [--session <id>]` — the REPL (§6 CLI surface).

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use vesper_agent::{process_message, AgentDeps, ProgressEvent};
use vesper_config::AppConfig;
use vesper_exec::{ExecutionPolicy, ToolExecutor};
use vesper_prompt::ContextManagerConfig;
use vesper_tools::ToolRegistry;
use vesper_tools::builtins::{ReadFileTool, RunShellTool, WriteFileTool};

pub async fn run_repl(config: Arc<AppConfig>, session: Option<Uuid>) -> Result<()> {
    let store = vesper_memory::MemoryStore::new(vesper_memory::Store::open(&config.persistence).await?);
    let router = crate::build_router(&config);
    let embeddings = vesper_runtime::OllamaEmbeddingProvider::new(config.llm.ollama_base_url.clone(), config.llm.ollama_model.clone());

    let workspace_root = PathBuf::from(&config.agent.workspace_path);
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(WriteFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(RunShellTool { workspace_root: workspace_root.clone() }));

    let policy = ExecutionPolicy { approval_mode: config.safety.approval_mode, allow_shell: config.safety.allow_shell, workspace_root, ..ExecutionPolicy::default() };
    let tool_executor = ToolExecutor::new(policy);
    let context_config = ContextManagerConfig::default();
    let extraction_config = vesper_thinker::ExtractionConfig::from_config(&config.extraction, &config.scheduler.timezone);

    let session_id = match session {
        Some(id) => {
            store.persistence().get_session(id)?.ok_or_else(|| anyhow::anyhow!("no session with id {id}"))?;
            id
        }
        None => store.persistence().create_session()?.id,
    };
    println!("session {session_id} — type 'exit' to quit");

    let deps = AgentDeps {
        router: &router,
        store: &store,
        embeddings: &embeddings,
        tool_registry: &registry,
        tool_executor: &tool_executor,
        config: &config.agent,
        extraction_config: &extraction_config,
        context_config: &context_config,
    };

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let on_progress = |event: ProgressEvent| match event {
            ProgressEvent::ToolStart { name, .. } => println!("  [running {name}]"),
            ProgressEvent::ToolComplete { name, success, .. } => println!("  [{name} {}]", if success { "done" } else { "failed" }),
            ProgressEvent::Status(text) if !text.is_empty() => println!("  {text}"),
            _ => {}
        };

        match process_message(&deps, session_id, line, &[], on_progress, &|| false).await {
            Ok(output) => println!("{}\n", output.response),
            Err(error) => eprintln!("error: {error}\n"),
        }
    }

    Ok(())
}
