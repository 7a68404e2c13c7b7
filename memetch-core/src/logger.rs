//! The logging and progress capability consumed by the engine and codecs.

use console::Term;
use std::fmt;
use std::sync::Mutex;

/// Receives informational lines and page-count progress ticks.
///
/// Implementations are shared between the engine and the caller, so every
/// method takes `&self`.
pub trait Logger: Send + Sync {
    fn info(&self, message: fmt::Arguments<'_>);

    fn debug(&self, message: fmt::Arguments<'_>);

    /// Reports that `pages` more pages were produced.
    fn progress(&self, pages: u64);

    /// Sets how many pages make up one visible progress tick. Zero disables
    /// progress output.
    fn set_progress_granularity(&self, pages_per_tick: u64);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentLogger;

impl Logger for SilentLogger {
    fn info(&self, _message: fmt::Arguments<'_>) {}
    fn debug(&self, _message: fmt::Arguments<'_>) {}
    fn progress(&self, _pages: u64) {}
    fn set_progress_granularity(&self, _pages_per_tick: u64) {}
}

const DOTS_PER_LINE: usize = 80;

#[derive(Default)]
struct DotState {
    pages_per_tick: u64,
    pending_pages: u64,
    col: usize,
}

impl DotState {
    /// Adds `pages` and returns the dots (and line breaks) to draw. Pages
    /// short of a full tick carry over to the next call.
    fn advance(&mut self, pages: u64) -> String {
        let mut dots = String::new();
        if self.pages_per_tick == 0 {
            return dots;
        }

        self.pending_pages += pages;
        while self.pending_pages >= self.pages_per_tick {
            self.pending_pages -= self.pages_per_tick;
            dots.push('.');
            self.col += 1;
            if self.col >= DOTS_PER_LINE {
                dots.push('\n');
                self.col = 0;
            }
        }
        dots
    }

    /// Returns `true` if a dot line was open and must be ended before a
    /// message is printed.
    fn end_line(&mut self) -> bool {
        std::mem::take(&mut self.col) > 0
    }
}

/// Line-oriented terminal output with a row of dots for progress.
pub struct ConsoleLogger {
    term: Term,
    verbose: bool,
    state: Mutex<DotState>,
}

impl ConsoleLogger {
    pub fn new(verbose: bool) -> Self {
        Self::with_term(Term::stdout(), verbose)
    }

    pub fn with_term(term: Term, verbose: bool) -> Self {
        Self {
            term,
            verbose,
            state: Mutex::new(DotState::default()),
        }
    }

    fn line(&self, message: fmt::Arguments<'_>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.end_line() {
            self.term.write_line("").ok();
        }
        self.term.write_line(&message.to_string()).ok();
    }
}

impl Logger for ConsoleLogger {
    fn info(&self, message: fmt::Arguments<'_>) {
        self.line(message);
    }

    fn debug(&self, message: fmt::Arguments<'_>) {
        if self.verbose {
            self.line(message);
        }
    }

    fn progress(&self, pages: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let dots = state.advance(pages);
        if !dots.is_empty() {
            self.term.write_str(&dots).ok();
        }
    }

    fn set_progress_granularity(&self, pages_per_tick: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pages_per_tick = pages_per_tick;
        state.pending_pages = 0;
    }
}
