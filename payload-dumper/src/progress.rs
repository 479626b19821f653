// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashMap,
    fmt::Write as _,
    io::{self, Write},
    sync::Mutex,
};

/// Callback interface for extraction progress. Implementations must be
/// internally synchronized; workers call into this concurrently.
pub trait Progress: Sync {
    /// Announce the set of partitions about to be extracted and their
    /// operation counts, in extraction order.
    fn init(&self, names: &[String], op_counts: &[usize]);

    /// Report that `completed` of `total` operations have finished for the
    /// named partition.
    fn update(&self, name: &str, completed: usize, total: usize);

    /// Report a failure without interrupting other partitions.
    fn error(&self, msg: &str);

    /// Extraction is over; release the terminal.
    fn finish(&self);
}

/// Progress sink that discards all notifications.
pub struct NullProgress;

impl Progress for NullProgress {
    fn init(&self, _names: &[String], _op_counts: &[usize]) {}

    fn update(&self, _name: &str, _completed: usize, _total: usize) {}

    fn error(&self, _msg: &str) {}

    fn finish(&self) {}
}

const BAR_WIDTH: usize = 30;

struct Entry {
    completed: usize,
    total: usize,
}

#[derive(Default)]
struct State {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    active: bool,
}

/// Multi-line terminal renderer: one bar per partition, redrawn in place
/// with ANSI cursor movement. All output goes to stderr.
#[derive(Default)]
pub struct TerminalProgress {
    state: Mutex<State>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn render_bar(name: &str, completed: usize, total: usize) -> String {
        let percentage = if total > 0 { completed * 100 / total } else { 0 };
        let filled = BAR_WIDTH * percentage / 100;

        let mut line = format!("[{name:<15}] ");

        for i in 0..BAR_WIDTH {
            if i < filled {
                line.push('=');
            } else if i == filled && percentage < 100 {
                line.push('>');
            } else {
                line.push(' ');
            }
        }

        let _ = write!(line, " {percentage:>3}% ({completed}/{total})");

        line
    }

    fn redraw(state: &State) {
        if !state.active {
            return;
        }

        // Move back to the top of the reserved section and repaint.
        eprint!("\x1b[{}A", state.order.len());

        for name in &state.order {
            let entry = &state.entries[name];
            let line = Self::render_bar(name, entry.completed, entry.total);
            eprint!("\r{line}\x1b[K\n");
        }

        let _ = io::stderr().flush();
    }
}

impl Progress for TerminalProgress {
    fn init(&self, names: &[String], op_counts: &[usize]) {
        let mut state = self.state.lock().unwrap();

        state.order = names.to_vec();
        state.entries = names
            .iter()
            .zip(op_counts)
            .map(|(name, &total)| (name.clone(), Entry { completed: 0, total }))
            .collect();
        state.active = true;

        // Reserve one line per bar.
        for _ in names {
            eprintln!();
        }

        Self::redraw(&state);
    }

    fn update(&self, name: &str, completed: usize, total: usize) {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.get_mut(name) {
            entry.completed = completed;
            entry.total = total;
        }

        Self::redraw(&state);
    }

    fn error(&self, msg: &str) {
        let state = self.state.lock().unwrap();

        eprintln!("{msg}");

        // The message shifted the reserved section up by one line; repaint
        // below it.
        if state.active {
            for _ in &state.order {
                eprintln!();
            }
            Self::redraw(&state);
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap();

        if state.active {
            state.active = false;
            eprintln!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TerminalProgress;

    #[test]
    fn bar_rendering() {
        let line = TerminalProgress::render_bar("system", 0, 4);
        assert!(line.starts_with("[system         ] "));
        assert!(line.ends_with("   0% (0/4)"));

        let line = TerminalProgress::render_bar("system", 2, 4);
        assert!(line.contains("===============>"));
        assert!(line.ends_with("  50% (2/4)"));

        let line = TerminalProgress::render_bar("system", 4, 4);
        assert!(line.contains("=".repeat(30).as_str()));
        assert!(line.ends_with(" 100% (4/4)"));

        // Zero-operation partitions must not divide by zero.
        let line = TerminalProgress::render_bar("empty", 0, 0);
        assert!(line.ends_with("   0% (0/0)"));
    }
}
