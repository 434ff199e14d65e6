// Model routing
//
// Picks which model a new process runs on when the spawn request does not
// name one. The heuristic is keyword-based: clearly mechanical goals go to
// the cheap tier, everything else to the default tier. The cheap tier is
// also what compaction summaries use.

/// Routes (role, goal) pairs to a model identifier
#[derive(Debug, Clone)]
pub struct ModelRouter {
    default_model: String,
    cheap_model: String,
    /// Extra keyword -> model overrides, checked first
    overrides: Vec<(String, String)>,
}

const CHEAP_HINTS: &[&str] = &[
    "summarize",
    "summarise",
    "format",
    "rename",
    "cleanup",
    "greet",
    "simple",
];

impl ModelRouter {
    pub fn new(default_model: impl Into<String>, cheap_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            cheap_model: cheap_model.into(),
            overrides: Vec::new(),
        }
    }

    /// Add a keyword override; matched case-insensitively against role + goal
    pub fn with_override(mut self, keyword: impl Into<String>, model: impl Into<String>) -> Self {
        self.overrides.push((keyword.into().to_lowercase(), model.into()));
        self
    }

    /// Model for a new process
    pub fn route(&self, role: &str, goal: &str) -> String {
        let haystack = format!("{} {}", role, goal).to_lowercase();
        for (keyword, model) in &self.overrides {
            if haystack.contains(keyword) {
                return model.clone();
            }
        }
        if CHEAP_HINTS.iter().any(|hint| haystack.contains(hint)) {
            return self.cheap_model.clone();
        }
        self.default_model.clone()
    }

    /// Model used for compaction summaries
    pub fn cheap_model(&self) -> &str {
        &self.cheap_model
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new("gpt-4o", "gpt-4o-mini")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanical_goals_route_to_cheap_tier() {
        let router = ModelRouter::default();
        assert_eq!(router.route("Clerk", "summarize the meeting notes"), "gpt-4o-mini");
        assert_eq!(router.route("Greeter", "say hello"), "gpt-4o-mini");
    }

    #[test]
    fn substantial_goals_route_to_default_tier() {
        let router = ModelRouter::default();
        assert_eq!(
            router.route("Architect", "design the new storage engine"),
            "gpt-4o"
        );
    }

    #[test]
    fn overrides_win_over_heuristics() {
        let router = ModelRouter::default().with_override("security", "o3");
        assert_eq!(router.route("Security Auditor", "summarize findings"), "o3");
    }
}
