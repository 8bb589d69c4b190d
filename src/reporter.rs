//! Human-readable narration of a run.
//!
//! Control flow never depends on what a reporter does with an event.

use color_eyre::owo_colors::OwoColorize;
use std::sync::Mutex;

/// Severity of a narrated step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// Receives step events from a verification run
pub trait Reporter: Send + Sync {
    /// A status line
    fn report(&self, level: Level, message: &str);

    /// A banner opening a part of the run
    fn section(&self, title: &str);

    /// Verbatim text, e.g. tool output or log lines
    fn raw(&self, text: &str);

    fn blank(&self) {
        self.raw("");
    }

    fn info(&self, message: &str) {
        self.report(Level::Info, message);
    }

    fn success(&self, message: &str) {
        self.report(Level::Success, message);
    }

    fn warning(&self, message: &str) {
        self.report(Level::Warning, message);
    }

    fn error(&self, message: &str) {
        self.report(Level::Error, message);
    }
}

/// Colored `[i]`/`[✓]`/`[!]`/`[✗]` lines on stdout
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, level: Level, message: &str) {
        match level {
            Level::Info => println!("{}", format!("[i] {}", message).blue()),
            Level::Success => println!("{}", format!("[✓] {}", message).green()),
            Level::Warning => println!("{}", format!("[!] {}", message).yellow().bold()),
            Level::Error => println!("{}", format!("[✗] {}", message).red()),
        }
    }

    fn section(&self, title: &str) {
        println!("{}", format!("=== {} ===", title).blue());
    }

    fn raw(&self, text: &str) {
        println!("{}", text);
    }
}

/// One recorded narration event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Report(Level, String),
    Section(String),
    Raw(String),
}

/// Collects events in memory, for tests and embedding
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<Event>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Messages reported at `level`, in order
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Report(l, message) if l == level => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, level: Level, message: &str) {
        self.push(Event::Report(level, message.to_string()));
    }

    fn section(&self, title: &str) {
        self.push(Event::Section(title.to_string()));
    }

    fn raw(&self, text: &str) {
        self.push(Event::Raw(text.to_string()));
    }
}
