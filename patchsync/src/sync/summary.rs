//! Folding bundle failures into one bounded error message.

use std::collections::HashMap;

/// Failure messages deduplicated by text, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct ErrorSummary {
    messages: Vec<(String, usize)>,
    index: HashMap<String, usize>,
}

impl ErrorSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: impl Into<String>) {
        let message = message.into();
        if let Some(&i) = self.index.get(&message) {
            self.messages[i].1 += 1;
            return;
        }
        self.index.insert(message.clone(), self.messages.len());
        self.messages.push((message, 1));
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Distinct messages.
    pub fn distinct(&self) -> usize {
        self.messages.len()
    }

    /// Failures including duplicates.
    pub fn total(&self) -> usize {
        self.messages.iter().map(|(_, n)| n).sum()
    }

    /// Render at most `budget` characters of messages, one per line.
    ///
    /// Repeated messages get an occurrence count. Messages past the budget
    /// are folded into a final `N other errors` line, which is not counted
    /// against the budget.
    pub fn render(&self, budget: usize) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut used = 0;
        let mut omitted = 0;

        for (message, count) in &self.messages {
            if omitted > 0 {
                omitted += count;
                continue;
            }
            let line = if *count > 1 {
                format!("{} (x{})", message, count)
            } else {
                message.clone()
            };
            let len = line.chars().count() + usize::from(!lines.is_empty());
            if used + len <= budget {
                used += len;
                lines.push(line);
            } else if lines.is_empty() && budget > 3 {
                // Keep a truncated first message rather than nothing.
                let cut: String = line.chars().take(budget - 3).collect();
                lines.push(format!("{}...", cut));
                used = budget;
            } else {
                omitted += count;
            }
        }

        if omitted > 0 {
            let noun = if omitted == 1 { "error" } else { "errors" };
            lines.push(format!("{} other {}", omitted, noun));
        }
        lines.join("\n")
    }
}
