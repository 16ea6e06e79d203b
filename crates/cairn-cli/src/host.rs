//! Terminal host: renders task messages on stdout and answers asks from stdin

use async_trait::async_trait;
use cairn_agent::message::ApiReqInfo;
use cairn_agent::{AskKind, AskResponse, Host, SayKind, UiMessage};
use parking_lot::Mutex;
use std::io::{self, IsTerminal, Write};

/// Streaming position of the message currently being printed
#[derive(Default)]
struct Cursor {
    ts: i64,
    printed: usize,
}

pub struct TerminalHost {
    /// Answer every ask without reading stdin
    auto_approve: bool,
    cursor: Mutex<Cursor>,
}

impl TerminalHost {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Print the unseen tail of a streaming text message
    fn stream_text(&self, message: &UiMessage) {
        let text = message.text.as_deref().unwrap_or_default();
        let mut cursor = self.cursor.lock();
        if cursor.ts != message.ts {
            *cursor = Cursor {
                ts: message.ts,
                printed: 0,
            };
        }
        let chars: Vec<char> = text.chars().collect();
        if chars.len() > cursor.printed {
            let new_text: String = chars[cursor.printed..].iter().collect();
            print!("{}", new_text);
            cursor.printed = chars.len();
        }
        if !message.partial {
            println!();
        }
        io::stdout().flush().ok();
    }

    async fn read_answer(&self) -> Option<String> {
        print!("> ");
        io::stdout().flush().ok();
        tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            match io::stdin().read_line(&mut input) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(input.trim().to_string()),
            }
        })
        .await
        .ok()
        .flatten()
    }
}

/// What `--yes` answers for each kind of ask. Asks that would need real
/// input are declined so an unattended run cannot loop forever.
pub fn auto_answer(kind: AskKind) -> AskResponse {
    match kind {
        AskKind::Tool
        | AskKind::Command
        | AskKind::CompletionResult
        | AskKind::ResumeTask
        | AskKind::ResumeCompletedTask
        | AskKind::AutoApprovalMaxReqReached => AskResponse::yes(),
        AskKind::Followup
        | AskKind::ApiReqFailed
        | AskKind::MistakeLimitReached
        | AskKind::NewTask => AskResponse::no(),
    }
}

/// Interpret a typed answer. A blank line accepts.
pub fn parse_answer(input: &str) -> AskResponse {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => AskResponse::yes(),
        "n" | "no" => AskResponse::no(),
        _ => AskResponse::message(input.trim()),
    }
}

fn prompt_for(kind: AskKind, text: &str) -> String {
    match kind {
        AskKind::Tool => format!("Allow tool use? {}", text),
        AskKind::Command => format!("Run command: {}", text),
        AskKind::CompletionResult => "Accept this result? (or type feedback)".to_string(),
        AskKind::ApiReqFailed => format!("API request failed: {}\nRetry?", text),
        AskKind::MistakeLimitReached => format!("{}\nContinue? (or type guidance)", text),
        AskKind::AutoApprovalMaxReqReached => format!("{}\nReset the auto-approval counters?", text),
        AskKind::ResumeTask | AskKind::ResumeCompletedTask => "Resume this task?".to_string(),
        AskKind::Followup | AskKind::NewTask => text.to_string(),
    }
}

#[async_trait]
impl Host for TerminalHost {
    fn message_changed(&self, message: &UiMessage) {
        let Some(kind) = message.say_kind() else {
            return;
        };
        if kind == SayKind::Text {
            self.stream_text(message);
            return;
        }
        if message.partial {
            return;
        }
        let text = message.text.as_deref().unwrap_or_default();
        match kind {
            SayKind::Task => println!("cairn> {}\n", text),
            SayKind::Error | SayKind::DiffError => eprintln!("Error: {}", text),
            SayKind::ApiReqStarted => {
                if let Some(ApiReqInfo {
                    tokens_in,
                    tokens_out,
                    cost: Some(cost),
                    ..
                }) = message.api_req_info()
                {
                    if io::stdout().is_terminal() {
                        println!("[{} in, {} out | ${:.4}]", tokens_in, tokens_out, cost);
                    }
                }
            }
            SayKind::Reasoning => println!("[thinking] {}", text),
            SayKind::Tool | SayKind::Command => println!("[{}]", text),
            SayKind::CommandOutput => println!("{}", text),
            SayKind::CompletionResult => println!("\n{}\n", text),
            SayKind::UserFeedback => println!("> {}", text),
            SayKind::ApiReqRetried => println!("[retrying request]"),
            SayKind::HookStatus => println!("[hook {}]", text),
            SayKind::Info => println!("{}", text),
            SayKind::Text => {}
        }
    }

    async fn ask(&self, message: &UiMessage) -> AskResponse {
        let Some(kind) = message.ask_kind() else {
            return AskResponse::no();
        };
        let prompt = prompt_for(kind, message.text.as_deref().unwrap_or_default());
        println!("{}", prompt);

        if self.auto_approve {
            let answer = auto_answer(kind);
            println!("(auto: {})", if answer.is_yes() { "yes" } else { "no" });
            return answer;
        }
        match self.read_answer().await {
            Some(input) => parse_answer(&input),
            None => AskResponse::no(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_agent::message::AskResponseKind;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("").is_yes());
        assert!(parse_answer(" Yes ").is_yes());
        assert_eq!(parse_answer("n").response, AskResponseKind::NoButtonClicked);
        let feedback = parse_answer("use the other file");
        assert_eq!(feedback.response, AskResponseKind::MessageResponse);
        assert_eq!(feedback.feedback(), Some("use the other file"));
    }

    #[test]
    fn test_auto_answer_never_retries_forever() {
        assert!(auto_answer(AskKind::Tool).is_yes());
        assert!(auto_answer(AskKind::CompletionResult).is_yes());
        assert!(!auto_answer(AskKind::ApiReqFailed).is_yes());
        assert!(!auto_answer(AskKind::MistakeLimitReached).is_yes());
    }

    #[tokio::test]
    async fn test_auto_approve_skips_stdin() {
        let host = TerminalHost::new(true);
        let answer = host
            .ask(&UiMessage::ask(1, AskKind::Command, Some("ls".into()), false))
            .await;
        assert!(answer.is_yes());
    }
}
