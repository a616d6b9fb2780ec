//! Dialog interface used during provisioning
//!
//! The desktop shell owns the actual dialogs; the bridge only needs to show
//! a message, ask a yes/no question, or report a fatal startup error.

use halftone_logger as logger;

pub trait Prompter: Send + Sync {
    /// Non-blocking informational message
    fn inform(&self, title: &str, message: &str);

    /// Ask for consent; `false` means the user declined
    fn confirm(&self, title: &str, message: &str) -> bool;

    /// Startup cannot continue; the host exits after this returns
    fn fatal(&self, title: &str, message: &str);
}

/// Prompter for unattended runs: logs everything and answers `confirm`
/// with a fixed value
#[derive(Debug, Clone, Copy)]
pub struct NonInteractive {
    pub assume_yes: bool,
}

impl Prompter for NonInteractive {
    fn inform(&self, title: &str, message: &str) {
        logger::warn(&format!("{}: {}", title, message));
    }

    fn confirm(&self, title: &str, message: &str) -> bool {
        logger::info(&format!(
            "{}: {} ({})",
            title,
            message,
            if self.assume_yes { "yes" } else { "no" }
        ));
        self.assume_yes
    }

    fn fatal(&self, title: &str, message: &str) {
        logger::error(&format!("{}: {}", title, message));
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::Prompter;
    use parking_lot::Mutex;

    /// Records every dialog and answers `confirm` with `answer`
    #[derive(Default)]
    pub(crate) struct RecordingPrompter {
        pub(crate) answer: bool,
        pub(crate) shown: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPrompter {
        pub(crate) fn answering(answer: bool) -> Self {
            Self {
                answer,
                shown: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn kinds(&self) -> Vec<String> {
            self.shown.lock().iter().map(|(kind, _)| kind.clone()).collect()
        }

        pub(crate) fn messages(&self) -> Vec<String> {
            self.shown.lock().iter().map(|(_, msg)| msg.clone()).collect()
        }
    }

    impl Prompter for RecordingPrompter {
        fn inform(&self, _title: &str, message: &str) {
            self.shown.lock().push(("inform".to_string(), message.to_string()));
        }

        fn confirm(&self, _title: &str, message: &str) -> bool {
            self.shown.lock().push(("confirm".to_string(), message.to_string()));
            self.answer
        }

        fn fatal(&self, _title: &str, message: &str) {
            self.shown.lock().push(("fatal".to_string(), message.to_string()));
        }
    }
}
