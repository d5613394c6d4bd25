//! Terminal rendering of backend notifications

use maestro_core::orchestration::OutputBlock;
use maestro_core::{LogArea, Notification, Severity};

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Turn `<strong>` emphasis into ANSI bold, or drop it
fn emphasize(text: &str, color: bool) -> String {
    let (on, off) = if color { (BOLD, RESET) } else { ("", "") };
    text.replace("<strong>", on).replace("</strong>", off)
}

fn render_blocks(blocks: &[OutputBlock]) -> String {
    let mut lines = Vec::new();
    for block in blocks {
        match block {
            OutputBlock::Paragraph(text) => lines.push(text.clone()),
            OutputBlock::List(items) => lines.extend(items.iter().map(|i| format!("  • {}", i))),
        }
    }
    lines.join("\n")
}

/// Text to print for a notification; `None` for ones the terminal ignores
pub fn render(notification: &Notification, color: bool) -> Option<String> {
    match notification {
        Notification::Log {
            area: LogArea::Run,
            source,
            text,
            rich,
        } => {
            let text = if *rich {
                emphasize(text, color)
            } else {
                text.clone()
            };
            Some(format!("[{}] {}", source, text))
        }
        Notification::Log { text, .. } => Some(text.clone()),
        Notification::UserNotice { message, severity } => {
            let label = match severity {
                Severity::Info => "info",
                Severity::Success => "ok",
                Severity::Warning => "warning",
                Severity::Error => "error",
            };
            Some(format!("({}) {}", label, message))
        }
        Notification::FinalOutput { text, blocks } => {
            let body = match blocks {
                Some(blocks) => render_blocks(blocks),
                None => text.clone(),
            };
            Some(format!(
                "\n{}\n{}\n",
                emphasize("<strong>Final Output</strong>", color),
                body
            ))
        }
        Notification::RunFinished { status, iterations } => {
            Some(format!("Run {} after {} iteration(s).", status, iterations))
        }
        Notification::AgentsChanged
        | Notification::RunStarted { .. }
        | Notification::KeyRotated { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::RunStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rich_log_emphasis() {
        let notif = Notification::rich_log("Orchestrator", "<strong>Stop</strong> requested");
        assert_eq!(
            render(&notif, false).unwrap(),
            "[Orchestrator] Stop requested"
        );
        assert_eq!(
            render(&notif, true).unwrap(),
            "[Orchestrator] \x1b[1mStop\x1b[0m requested"
        );
    }

    #[test]
    fn test_plain_log_is_not_rewritten() {
        let notif = Notification::log("Writer", "Output: <strong>raw</strong>");
        assert_eq!(
            render(&notif, true).unwrap(),
            "[Writer] Output: <strong>raw</strong>"
        );
    }

    #[test]
    fn test_final_output_with_list() {
        let notif = Notification::final_output(
            "Plan:\n* one\n* two",
            Some(vec![
                OutputBlock::Paragraph("Plan:".to_string()),
                OutputBlock::List(vec!["one".to_string(), "two".to_string()]),
            ]),
        );
        assert_eq!(
            render(&notif, false).unwrap(),
            "\nFinal Output\nPlan:\n  • one\n  • two\n"
        );
    }

    #[test]
    fn test_quiet_notifications() {
        assert_eq!(render(&Notification::AgentsChanged, false), None);
        assert_eq!(
            render(
                &Notification::RunFinished {
                    status: RunStatus::MaxIterationsReached,
                    iterations: 3
                },
                false
            )
            .unwrap(),
            "Run max iterations reached after 3 iteration(s)."
        );
    }
}
