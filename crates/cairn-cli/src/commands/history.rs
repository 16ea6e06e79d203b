//! `cairn history`: inspect and repair the task history index

use cairn_agent::{MessageStore, TaskHistoryStore};
use clap::Subcommand;
use std::sync::Arc;

use crate::utils::{format_ts, kind_label, preview};

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List saved tasks, newest first
    List,
    /// Show one task's messages
    Show {
        /// Task id
        id: String,
    },
    /// Rebuild the index from backups and task directories
    Recover,
    /// Remove a task from the index (its files are kept)
    Delete {
        id: String,
    },
}

pub fn run(store: Arc<TaskHistoryStore>, command: HistoryCommand) -> anyhow::Result<()> {
    match command {
        HistoryCommand::List => list(&store),
        HistoryCommand::Show { id } => show(store, &id),
        HistoryCommand::Recover => recover(&store),
        HistoryCommand::Delete { id } => {
            let before = store.read()?.len();
            let items = store.delete(&id)?;
            if items.len() == before {
                println!("No task {} in the index.", id);
            } else {
                println!("Removed {} ({} tasks remain).", id, items.len());
            }
            Ok(())
        }
    }
}

fn list(store: &TaskHistoryStore) -> anyhow::Result<()> {
    let mut items = store.read()?;
    if items.is_empty() {
        println!("No saved tasks found.");
        println!("Task history is stored in: {}", store.path().display());
        return Ok(());
    }
    items.sort_by(|a, b| b.ts.cmp(&a.ts));

    println!("{:<38} {:<20} {:>10} {:>9}  Task", "ID", "Last active", "Tokens", "Cost");
    println!("{}", "-".repeat(100));
    for item in items {
        println!(
            "{:<38} {:<20} {:>10} {:>9}  {}{}",
            item.id,
            format_ts(item.ts),
            item.tokens_in + item.tokens_out,
            format!("${:.4}", item.total_cost),
            if item.is_favorited { "* " } else { "" },
            preview(Some(&item.task), 40)
        );
    }
    println!("\nResume with: cairn replay <chunks.json> --resume <id>");
    Ok(())
}

fn show(store: Arc<TaskHistoryStore>, id: &str) -> anyhow::Result<()> {
    if let Some(item) = store.read()?.into_iter().find(|item| item.id == id) {
        println!("Task:      {}", item.task);
        println!("Created:   {}", item.created_at.map(format_ts).unwrap_or_default());
        println!("Active:    {}", format_ts(item.ts));
        println!(
            "Tokens:    {} in, {} out ({} cache writes, {} cache reads)",
            item.tokens_in, item.tokens_out, item.cache_writes, item.cache_reads
        );
        println!("Cost:      ${:.4}", item.total_cost);
        if !item.workspace_paths.is_empty() {
            println!("Workspace: {}", item.workspace_paths.join(", "));
        }
        println!();
    }

    let messages = MessageStore::load(id, store)?;
    for message in messages.ui_messages() {
        println!(
            "{} {:<28} {}",
            format_ts(message.ts),
            kind_label(message),
            preview(message.text.as_deref(), 80)
        );
    }
    println!(
        "\n{} UI messages, {} conversation entries",
        messages.ui_messages().len(),
        messages.api_history().len()
    );
    Ok(())
}

fn recover(store: &TaskHistoryStore) -> anyhow::Result<()> {
    let items = store.rebuild_from_tasks()?;
    println!("Task history has {} tasks.", items.len());
    let backups = store.backups();
    if !backups.is_empty() {
        println!("Backups:");
        for backup in backups {
            println!("  {}", backup.display());
        }
    }
    Ok(())
}
