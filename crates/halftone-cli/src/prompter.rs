//! Terminal implementation of the provisioning dialogs

use colored::Colorize;
use halftone_bridge::Prompter;
use halftone_logger as logger;
use std::io::{self, BufRead, IsTerminal, Write};

/// Asks on stdin/stderr. With `--yes`, or when stdin is not a terminal,
/// `confirm` does not block and answers `assume_yes`.
#[derive(Debug, Clone, Copy)]
pub struct TerminalPrompter {
    pub assume_yes: bool,
}

impl TerminalPrompter {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Prompter for TerminalPrompter {
    fn inform(&self, title: &str, message: &str) {
        logger::spinner_stop();
        logger::warn(&format!("{}: {}", title, message));
    }

    fn confirm(&self, title: &str, message: &str) -> bool {
        logger::spinner_stop();
        if self.assume_yes || !io::stdin().is_terminal() {
            logger::info(&format!(
                "{}: {} ({})",
                title,
                message,
                if self.assume_yes { "yes" } else { "no, not a terminal" }
            ));
            return self.assume_yes;
        }

        eprint!("{}\n{} [y/N] ", title.bold(), message);
        let _ = io::stderr().flush();
        answer_with(read_answer)
    }

    fn fatal(&self, title: &str, message: &str) {
        logger::spinner_stop();
        logger::error(&format!("{}\n{}", title, message));
    }
}

/// Runs `read` on the current runtime worker after handing that worker's
/// other tasks to another thread
fn answer_with(read: impl FnOnce() -> Option<String>) -> bool {
    tokio::task::block_in_place(read).is_some_and(|answer| parse_answer(&answer))
}

fn read_answer() -> Option<String> {
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer).ok()?;
    Some(answer)
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
