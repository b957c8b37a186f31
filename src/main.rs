use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};

use forkchat::plugins::tree::{
    ConversationSession, ConversationTree, NodeType, delete_conversation, format_relative_time,
    list_conversations,
};
use forkchat::services::{ai::CompletionBackend, paths, prompts};
use forkchat::{ConversationId, KvStore, LibsqlKvStore, OpenAiCompletionClient, TreeError};

#[derive(Parser)]
#[command(name = "forkchat")]
#[command(about = "Branching conversations with chat-completion models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved conversations, most recent first
    List,
    /// Start a new conversation
    New {
        /// Handle to use instead of a fresh one
        #[arg(long)]
        id: Option<String>,
        /// Text of the root system node
        #[arg(long)]
        system: Option<String>,
    },
    /// Print a conversation as a tree
    Show { id: String },
    /// Add a node under `parent`
    Add {
        id: String,
        parent: String,
        /// user | llm
        node_type: NodeType,
        #[arg(long)]
        text: Option<String>,
    },
    /// Overwrite a node's text
    Edit { id: String, node: String, text: String },
    /// Ask a user prompt under `parent` and generate the answer
    Ask {
        id: String,
        parent: String,
        prompt: String,
    },
    /// (Re)generate an llm node
    Generate { id: String, node: String },
    /// Delete a node and its subtree
    Rm { id: String, node: String },
    /// Name the conversation if it has no generated title yet
    Title { id: String },
    /// Delete a whole conversation
    Delete { id: String },
    /// Print the completion settings (without the key)
    Config,
}

struct App {
    store: Arc<dyn KvStore>,
    completions: Arc<OpenAiCompletionClient>,
}

impl App {
    async fn init() -> anyhow::Result<Self> {
        let db_path = paths::local_db_path().map_err(|e| anyhow!(e))?;
        let store = LibsqlKvStore::from_env(&db_path)
            .await
            .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
        Ok(Self {
            store: Arc::new(store),
            completions: Arc::new(OpenAiCompletionClient::from_env()),
        })
    }

    fn backend(&self) -> Arc<dyn CompletionBackend> {
        self.completions.clone()
    }

    async fn open(&self, raw_id: &str) -> anyhow::Result<ConversationSession> {
        let id = parse_id(raw_id)?;
        ConversationSession::load(id, self.store.clone(), self.backend())
            .await
            .with_context(|| format!("Failed to load conversation {raw_id}"))?
            .ok_or_else(|| anyhow!("Conversation {raw_id} not found"))
    }
}

fn parse_id(raw: &str) -> anyhow::Result<ConversationId> {
    ConversationId::parse(raw).ok_or_else(|| anyhow!("Invalid conversation id: {raw:?}"))
}

/// Rejected tree operations (bad node id, illegal child type, ...) are usage errors.
fn is_usage_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TreeError>()
        .is_some_and(TreeError::is_structural)
}

fn render_tree(tree: &ConversationTree) -> String {
    let mut out = String::new();
    let Some(root) = tree.root() else {
        return out;
    };
    let mut stack = vec![(root.id.as_str(), 0usize)];
    while let Some((id, depth)) = stack.pop() {
        let Some(node) = tree.node(id) else {
            continue;
        };
        let marker = if tree.is_generating(id) { " (generating)" } else { "" };
        let first_line = node.text.lines().next().unwrap_or("");
        out.push_str(&format!(
            "{}[{}] {}{}: {}\n",
            "  ".repeat(depth),
            node.id,
            node.node_type.label(),
            marker,
            first_line
        ));
        for child in node.children.iter().rev() {
            stack.push((child.as_str(), depth + 1));
        }
    }
    out
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Config = cli.command {
        let public = OpenAiCompletionClient::from_env().config().public();
        println!("{}", serde_json::to_string_pretty(&public)?);
        return Ok(());
    }

    let app = App::init().await?;

    match cli.command {
        Commands::List => {
            let now = Utc::now();
            let list = list_conversations(app.store.as_ref()).await?;
            if list.is_empty() {
                println!("No conversations yet.");
            }
            for entry in list {
                println!(
                    "{}  {}  ({} nodes, {})",
                    entry.id,
                    entry.title,
                    entry.node_count,
                    format_relative_time(entry.updated_at, now)
                );
            }
        }
        Commands::New { id, system } => {
            let id = forkchat::ensure_conversation_id(id.as_deref());
            let session =
                ConversationSession::load_or_initialize(id.clone(), app.store.clone(), app.backend())
                    .await?;
            if let Some(system) = system {
                let root = session
                    .with_tree(|t| t.root().map(|n| n.id.clone()))?
                    .ok_or_else(|| anyhow!("Conversation {id} has no root"))?;
                session.update_text(&root, &system).await?;
            }
            println!("{id}");
        }
        Commands::Show { id } => {
            let tree = app.open(&id).await?.snapshot()?;
            let title = if tree.title().is_empty() {
                prompts::UNTITLED
            } else {
                tree.title()
            };
            println!("{title}");
            print!("{}", render_tree(&tree));
        }
        Commands::Add {
            id,
            parent,
            node_type,
            text,
        } => {
            let session = app.open(&id).await?;
            let node = session.add_child(&parent, node_type).await?;
            if let Some(text) = text {
                session.update_text(&node, &text).await?;
            }
            println!("{node}");
        }
        Commands::Edit { id, node, text } => {
            app.open(&id).await?.update_text(&node, &text).await?;
        }
        Commands::Ask { id, parent, prompt } => {
            let session = app.open(&id).await?;
            let user = session.add_child(&parent, NodeType::User).await?;
            session.update_text(&user, &prompt).await?;
            let llm = session.add_child(&user, NodeType::Llm).await?;
            let answer = session
                .generate_llm_response(&llm)
                .await
                .with_context(|| format!("Generation for {llm} failed"))?;
            session.wait_for_title().await;
            println!("[{llm}] {answer}");
        }
        Commands::Generate { id, node } => {
            let session = app.open(&id).await?;
            let answer = session
                .generate_llm_response(&node)
                .await
                .with_context(|| format!("Generation for {node} failed"))?;
            session.wait_for_title().await;
            println!("{answer}");
        }
        Commands::Rm { id, node } => {
            let removed = app.open(&id).await?.delete_node(&node).await?;
            println!("Removed {} node(s)", removed.len());
        }
        Commands::Title { id } => {
            let session = app.open(&id).await?;
            let title = match session.generate_conversation_title().await {
                Some(title) => title,
                None => session.with_tree(|t| t.title().to_string())?,
            };
            println!("{title}");
        }
        Commands::Delete { id } => {
            let id = parse_id(&id)?;
            if !delete_conversation(app.store.as_ref(), &id).await? {
                return Err(anyhow!("Conversation {id} not found"));
            }
        }
        Commands::Config => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            if is_usage_error(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_are_structural_tree_errors() {
        let err = anyhow::Error::from(TreeError::protected_root("root"))
            .context("Failed to delete node");
        assert!(is_usage_error(&err));

        let err = anyhow::Error::from(TreeError::storage("disk full"));
        assert!(!is_usage_error(&err));
        assert!(!is_usage_error(&anyhow!("Conversation x not found")));
    }

    #[test]
    fn test_render_tree_indents_children() {
        let mut tree = ConversationTree::initialize(None);
        let root = tree.root().unwrap().id.clone();
        let user = tree.add_child(&root, NodeType::User).unwrap().value;
        let _ = tree.update_text(&user, "Hi\nsecond line").unwrap();
        let _ = tree.add_child(&user, NodeType::Llm).unwrap();

        let lines: Vec<String> = render_tree(&tree).lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[n0] System: "));
        assert_eq!(lines[1], "  [n1] User Prompt: Hi");
        assert!(lines[2].starts_with("    [n2] LLM Response: "));
    }

    #[test]
    fn test_parse_id_rejects_bad_handles() {
        assert!(parse_id("abc-123").is_ok());
        assert!(parse_id("../etc").is_err());
    }
}
