//! `cairn replay`: run a task end to end against a recorded chunk stream

use cairn_agent::{
    Error as TaskError, RateLimiter, Task, TaskEvent, TaskHistoryStore, TaskOutcome, TaskServices,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::host::TerminalHost;
use crate::replay::{ReplayApi, ReplayScript};
use crate::tools;

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub chunks: PathBuf,
    /// Prompt for a new task; `None` resumes `resume`
    pub task: Option<String>,
    pub resume: Option<String>,
    pub yes: bool,
}

/// A finished replay: the task (for inspection) and how its loop ended
pub struct ReplayRun {
    pub task: Task,
    pub result: cairn_agent::Result<TaskOutcome>,
    pub unused_turns: usize,
}

pub async fn run(cfg: &Config, cwd: &Path, opts: ReplayOptions) -> anyhow::Result<()> {
    let run = execute(cfg, cwd, opts).await?;

    println!("Task {}", run.task.id());
    if run.unused_turns > 0 {
        tracing::warn!(remaining = run.unused_turns, "replay script has unused turns");
    }
    match run.result {
        Ok(outcome) => {
            println!(
                "[{} turns | {} in, {} out | ${:.4}]",
                outcome.turns, outcome.usage.input_tokens, outcome.usage.output_tokens, outcome.cost
            );
            Ok(())
        }
        Err(e) if e.is_aborted() => {
            eprintln!("Task aborted.");
            Ok(())
        }
        Err(TaskError::Halted(reason)) => {
            eprintln!("Task halted: {}", reason);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Build the services, start or resume the task and drive it to the end
pub async fn execute(cfg: &Config, cwd: &Path, opts: ReplayOptions) -> anyhow::Result<ReplayRun> {
    let script = ReplayScript::load(&opts.chunks)?;
    let api = Arc::new(ReplayApi::new(script));
    let services = TaskServices {
        api: api.clone(),
        tools: Arc::new(tools::registry()),
        host: Arc::new(TerminalHost::new(opts.yes)),
        history: Arc::new(TaskHistoryStore::new(cfg.data_dir())),
        rate_limiter: Arc::new(RateLimiter::new()),
    };
    let task_config = cfg.task_config(cwd)?;

    let mut task = match &opts.resume {
        Some(id) => Task::load(task_config, services, id)?,
        None => Task::new(task_config, services),
    };

    // Ctrl-C aborts the task; a second one kills the process as usual.
    let handle = task.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting task");
            handle.abort();
        }
    });

    let mut events = task.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                TaskEvent::Error { message } => tracing::error!(%message, "task error"),
                TaskEvent::TaskEnded { turns, completed } => {
                    tracing::info!(turns, completed, "task ended");
                }
                other => tracing::debug!(event = ?other, "task event"),
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let result = match (&opts.task, &opts.resume) {
        (Some(prompt), None) => task.start(prompt).await,
        (None, Some(_)) => task.resume().await,
        _ => anyhow::bail!("pass exactly one of --task or --resume"),
    };

    interrupt.abort();
    tokio::task::yield_now().await;
    logger.abort();

    Ok(ReplayRun {
        task,
        result,
        unused_turns: api.remaining(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_agent::SayKind;

    fn write_script(dir: &Path, turns: serde_json::Value) -> PathBuf {
        let path = dir.join("chunks.json");
        std::fs::write(&path, serde_json::to_vec(&turns).unwrap()).unwrap();
        path
    }

    fn config(data: &Path) -> Config {
        Config {
            data_dir: Some(data.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replay_writes_file_and_completes() {
        let workspace = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let chunks = write_script(
            data.path(),
            serde_json::json!([
                [
                    {"type": "text", "text": "Creating the file.\n<write><path>out.txt</path>"},
                    {"type": "text", "text": "<content>hello</content></write>"},
                    {"type": "usage", "input_tokens": 100, "output_tokens": 20}
                ],
                [
                    {"type": "text", "text": "<attempt_completion><result>Wrote out.txt</result></attempt_completion>"},
                    {"type": "usage", "input_tokens": 130, "output_tokens": 10}
                ]
            ]),
        );

        let run = execute(
            &config(data.path()),
            workspace.path(),
            ReplayOptions {
                chunks,
                task: Some("create out.txt".into()),
                resume: None,
                yes: true,
            },
        )
        .await
        .unwrap();

        let outcome = run.result.unwrap();
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.usage.input_tokens, 230);
        assert_eq!(run.unused_turns, 0);
        assert_eq!(std::fs::read_to_string(workspace.path().join("out.txt")).unwrap(), "hello");
        assert!(
            run.task
                .ui_messages()
                .iter()
                .any(|m| m.say_kind() == Some(SayKind::CompletionResult))
        );

        let items = TaskHistoryStore::new(data.path()).read().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, run.task.id());
        assert_eq!(items[0].task, "create out.txt");
        assert_eq!(items[0].tokens_in, 230);
    }

    #[tokio::test]
    async fn test_exhausted_script_halts_unattended_run() {
        let workspace = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let chunks = write_script(data.path(), serde_json::json!([]));

        let run = execute(
            &config(data.path()),
            workspace.path(),
            ReplayOptions {
                chunks,
                task: Some("anything".into()),
                resume: None,
                yes: true,
            },
        )
        .await
        .unwrap();
        assert!(matches!(run.result, Err(TaskError::Halted(_))));
    }
}
