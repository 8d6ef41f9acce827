//! Token Counter - context window estimation
//!
//! Estimates transcript size before a turn is sent to the model so the
//! session can:
//! - report context exhaustion instead of sending a doomed request
//! - tell the supervisor it needs a fresh process to continue

/// Character-based token estimate.
///
/// Close enough to a BPE tokenizer for budget checks without pulling one in.
pub struct TokenCounter {
    /// Average characters per token (~4 for English prose)
    chars_per_token: f32,
}

/// Result of checking a transcript against the context window
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    /// Comfortably within the window
    Ok { estimated_tokens: usize },
    /// Past the warning threshold, still sendable
    Warning {
        estimated_tokens: usize,
        limit: usize,
    },
    /// Would overflow the window
    Exceeded {
        estimated_tokens: usize,
        limit: usize,
    },
}

impl BudgetCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, BudgetCheck::Ok { .. })
    }

    pub fn should_warn(&self) -> bool {
        matches!(self, BudgetCheck::Warning { .. } | BudgetCheck::Exceeded { .. })
    }

    pub fn should_block(&self) -> bool {
        matches!(self, BudgetCheck::Exceeded { .. })
    }

    pub fn estimated_tokens(&self) -> usize {
        match self {
            BudgetCheck::Ok { estimated_tokens } => *estimated_tokens,
            BudgetCheck::Warning { estimated_tokens, .. } => *estimated_tokens,
            BudgetCheck::Exceeded { estimated_tokens, .. } => *estimated_tokens,
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            // Code runs closer to 3.5 chars/token, prose closer to 4
            chars_per_token: 3.8,
        }
    }

    /// Approximate tokens in text. ±10% for prose, ±15% for code.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count();
        let base_tokens = (char_count as f32 / self.chars_per_token).ceil() as usize;

        (base_tokens as f32 * self.calculate_adjustments(text)).ceil() as usize
    }

    /// Adjustment factor based on content type
    fn calculate_adjustments(&self, text: &str) -> f32 {
        let mut factor = 1.0f32;

        let code_indicators = ["{", "}", "(", ")", ";", "=>", "->", "::"];
        let code_density: f32 = code_indicators
            .iter()
            .map(|p| text.matches(p).count() as f32)
            .sum::<f32>()
            / text.len().max(1) as f32;

        if code_density > 0.01 {
            factor *= 1.15;
        }

        if text.contains("http://") || text.contains("https://") || text.contains("file://") {
            factor *= 1.1;
        }

        // Serialized goal/world state shows up a lot in supervisor turns
        if text.starts_with('{') || text.starts_with('[') {
            factor *= 1.2;
        }

        let digit_ratio = text.chars().filter(|c| c.is_ascii_digit()).count() as f32
            / text.len().max(1) as f32;
        if digit_ratio > 0.3 {
            factor *= 0.9;
        }

        factor
    }

    /// Tokens for one transcript entry including role overhead
    pub fn count_message(&self, _role: &str, content: &str) -> usize {
        4 + self.count(content)
    }

    /// Check a transcript plus expected reply against a context window.
    ///
    /// Warns past 80% of the window.
    pub fn check_context<'a, I>(&self, messages: I, reserve_output: usize, limit: usize) -> BudgetCheck
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let estimated_tokens = messages
            .into_iter()
            .map(|(role, content)| self.count_message(role, content))
            .sum::<usize>()
            + reserve_output;

        if estimated_tokens > limit {
            BudgetCheck::Exceeded {
                estimated_tokens,
                limit,
            }
        } else if estimated_tokens * 5 > limit * 4 {
            BudgetCheck::Warning {
                estimated_tokens,
                limit,
            }
        } else {
            BudgetCheck::Ok { estimated_tokens }
        }
    }

    /// Format token count for display
    pub fn format_tokens(tokens: usize) -> String {
        if tokens >= 1_000_000 {
            format!("{:.1}M", tokens as f64 / 1_000_000.0)
        } else if tokens >= 1_000 {
            format!("{:.1}K", tokens as f64 / 1_000.0)
        } else {
            tokens.to_string()
        }
    }
}
