use std::fmt;
use std::sync::Arc;

type SourcePredicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// One provenance rule: when `predicate(name, id)` holds, the item is
/// tagged with `label`.
#[derive(Clone)]
pub struct SourceRule {
    label: String,
    predicate: SourcePredicate,
}

impl SourceRule {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Case-insensitive substring match of any keyword against name or id.
    pub fn keywords(label: impl Into<String>, keywords: &[&str]) -> Self {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|keyword| keyword.trim().to_ascii_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();
        Self::new(label, move |name, id| {
            let name = name.to_ascii_lowercase();
            let id = id.to_ascii_lowercase();
            keywords
                .iter()
                .any(|keyword| name.contains(keyword.as_str()) || id.contains(keyword.as_str()))
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn matches(&self, name: &str, id: &str) -> bool {
        (self.predicate)(name, id)
    }
}

impl fmt::Debug for SourceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRule")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Ordered provenance rules; the first matching rule wins.
#[derive(Clone, Debug)]
pub struct SourceClassifier {
    rules: Vec<SourceRule>,
}

impl SourceClassifier {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: SourceRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Inserts `rule` ahead of every existing rule.
    pub fn with_priority_rule(mut self, rule: SourceRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn classify(&self, name: &str, id: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|rule| rule.matches(name, id))
            .map(|rule| rule.label().to_string())
    }
}

impl Default for SourceClassifier {
    fn default() -> Self {
        Self::empty()
            .with_rule(SourceRule::keywords("workshop", &["workshop"]))
            .with_rule(SourceRule::keywords("steam", &["steam"]))
            .with_rule(SourceRule::keywords("p2p", &["peer", "p2p"]))
            .with_rule(SourceRule::keywords("patch", &["xdelta", "patch", "delta"]))
            .with_rule(SourceRule::keywords(
                "repair",
                &["self_heal", "selfheal", "repair", "verify"],
            ))
            .with_rule(SourceRule::keywords("cdn", &["cdn", "chunk"]))
    }
}
