use std::collections::VecDeque;

// In-memory log for the expression subsystem. The surrounding debugger decides what to do
// with the lines (show in UI, append to the log file). Bounded so a long session can't
// accumulate unbounded strings.
pub struct Log {
    pub lines: VecDeque<String>,
    // Entity dumps read inferior memory, so they're opt-in.
    pub verbose: bool,
}

const MAX_LINES: usize = 200;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new(), verbose: false}
    }

    pub fn verbose() -> Log {
        Log {lines: VecDeque::new(), verbose: true}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}
