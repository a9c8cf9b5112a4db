use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token accounting for one provider response, or a sum over several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u32,
    /// Total number of tokens used
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Keep whichever of the two usages reports more total tokens.
    ///
    /// Streaming providers may repeat cumulative usage in several frames, so
    /// frames within one response are merged by maximum instead of summed.
    pub fn merge_max(current: Option<Usage>, incoming: Usage) -> Usage {
        match current {
            Some(current) if current.total_tokens >= incoming.total_tokens => current,
            _ => incoming,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        iter.fold(Usage::default(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn total(n: u32) -> Usage {
        Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: n,
        }
    }

    #[test]
    fn frames_merge_by_maximum() {
        let merged = [50, 120, 90]
            .into_iter()
            .map(total)
            .fold(None, |acc, u| Some(Usage::merge_max(acc, u)));

        assert_eq!(merged.map(|u| u.total_tokens), Some(120));
    }

    #[test]
    fn responses_sum_across_rounds() {
        let summed: Usage = [50, 120, 90].into_iter().map(total).sum();
        assert_eq!(summed.total_tokens, 260);
    }

    #[test]
    fn deserializes_input_output_aliases() {
        let usage: Usage =
            serde_json::from_str(r#"{"input_tokens":3,"output_tokens":4,"total_tokens":7}"#)
                .unwrap();
        assert_eq!(usage, Usage::new(3, 4));
    }

    proptest! {
        #[test]
        fn sum_is_order_independent(a in 0u32..1_000_000, b in 0u32..1_000_000, c in 0u32..1_000_000) {
            let (a, b, c) = (Usage::new(a, 1), Usage::new(b, 2), Usage::new(c, 3));
            prop_assert_eq!(a + b, b + a);
            prop_assert_eq!((a + b) + c, a + (b + c));
        }

        #[test]
        fn merge_never_decreases_total(a in 0u32..1_000_000, b in 0u32..1_000_000) {
            let merged = Usage::merge_max(Some(total(a)), total(b));
            prop_assert_eq!(merged.total_tokens, a.max(b));
        }
    }
}
