//! `cairn hooks`: find and try out lifecycle hook scripts

use cairn_agent::message::SayKind;
use cairn_agent::{HookData, HookEvent, HookExecutor, MessageStore, TaskHandle, TaskHistoryStore, Ui};
use clap::Subcommand;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::host::TerminalHost;

#[derive(Subcommand, Debug, Clone)]
pub enum HooksCommand {
    /// Show which script handles each event
    List,
    /// Run the hook for an event once and print its outcome
    Run {
        /// TaskStart, TaskResume, UserPromptSubmit or TaskCancel
        event: String,
        /// Saved task to run against (a scratch task otherwise)
        #[arg(long)]
        task: Option<String>,
        /// Prompt passed to TaskStart and UserPromptSubmit
        #[arg(long, default_value = "")]
        prompt: String,
    },
}

pub async fn run(cfg: &Config, cwd: &Path, command: HooksCommand) -> anyhow::Result<()> {
    let mut settings = cfg.task_config(cwd)?.hooks;
    match command {
        HooksCommand::List => {
            let executor = HookExecutor::new(settings);
            if !executor.settings().enabled {
                println!("Hooks are disabled in {}", Config::config_path().display());
            }
            for event in HookEvent::ALL {
                match executor.find_script(event) {
                    Some(script) => println!("{:<18} {}", event.name(), script.display()),
                    None => println!("{:<18} (none)", event.name()),
                }
            }
            println!("\nSearched:");
            for dir in &executor.settings().dirs {
                println!("  {}", dir.display());
            }
            Ok(())
        }
        HooksCommand::Run { event, task, prompt } => {
            let event = HookEvent::parse(&event)
                .ok_or_else(|| anyhow::anyhow!("unknown hook event '{}'", event))?;
            // Trying a hook out should not depend on the enabled switch.
            settings.enabled = true;
            let executor = HookExecutor::new(settings);
            if executor.find_script(event).is_none() {
                anyhow::bail!("no {} script in any hook directory", event);
            }

            let scratch = std::env::temp_dir().join(format!(
                "cairn-hooks-{}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            ));
            let store = MessageStore::new("hooks-run", Arc::new(TaskHistoryStore::new(&scratch)));
            // A saved task only feeds the payload; the run records into the scratch store.
            let data = match &task {
                Some(id) => {
                    let saved = MessageStore::load(id, Arc::new(TaskHistoryStore::new(cfg.data_dir())))?;
                    hook_data(event, &saved, prompt)
                }
                None => hook_data(event, &store, prompt),
            };
            let mut ui = Ui::new(store, Arc::new(TerminalHost::new(true)), TaskHandle::new(), None);

            let roots = vec![cwd.display().to_string()];
            let outcome = executor.run(data, &roots, &mut ui).await;
            drop(ui);
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                tracing::debug!(path = %scratch.display(), error = %e, "could not remove scratch hook store");
            }

            println!("status:  {:?}", outcome.status);
            println!("cancel:  {}", outcome.cancel);
            if let Some(block) = outcome.context_block(event) {
                println!("context:\n{}", block);
            }
            if let Some(message) = outcome.error_message {
                println!("message: {}", message);
            }
            Ok(())
        }
    }
}

/// Payload for `event`, filled from the task's saved messages where possible
fn hook_data(event: HookEvent, store: &MessageStore, prompt: String) -> HookData {
    let task_text = || {
        store
            .ui_messages()
            .iter()
            .find(|m| m.say_kind() == Some(SayKind::Task))
            .and_then(|m| m.text.clone())
            .unwrap_or_default()
    };
    let prompt = if prompt.is_empty() { task_text() } else { prompt };
    match event {
        HookEvent::TaskStart => HookData::TaskStart { task: prompt },
        HookEvent::UserPromptSubmit => HookData::UserPromptSubmit { prompt },
        HookEvent::TaskResume => HookData::TaskResume {
            message_count: store.ui_messages().len(),
            last_message_ts: store.last_ui_message().map(|m| m.ts),
        },
        HookEvent::TaskCancel => HookData::TaskCancel {
            completion_status: "cancelled".to_string(),
        },
    }
}
