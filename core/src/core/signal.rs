//! Evidence produced by checks, and the per-phase collection holding it.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

/// One piece of evidence from a check.
///
/// Two signals are equal when their slug, tags and originating check match;
/// text, strength and data are ignored.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    /// Stable uppercase identifier, e.g. `HTTP_STATUS_CODE_5XX_500`.
    pub slug: String,
    pub text: String,
    /// 0.0 means the check ran and found nothing.
    pub strength: f64,
    pub tags: BTreeSet<String>,
    pub check_name: String,
    pub data: Map<String, Value>,
}

impl Signal {
    pub fn new(check_name: &str, slug: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            text: text.into(),
            strength: 1.0,
            tags: BTreeSet::new(),
            check_name: check_name.to_string(),
            data: Map::new(),
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn is_dead(&self) -> bool {
        self.strength == 0.0
    }

    fn matches_slug(&self, query: &str) -> bool {
        self.slug.contains(query)
    }

    fn matches_tag(&self, query: &str) -> bool {
        self.tags.iter().any(|tag| tag.contains(query))
    }
}

impl PartialEq for Signal {
    fn eq(&self, other: &Self) -> bool {
        self.tags == other.tags && self.slug == other.slug && self.check_name == other.check_name
    }
}

impl Eq for Signal {}

/// Ordered set of signals for one observation phase. Slugs are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SignalHolder {
    signals: Vec<Signal>,
}

/// Result of `SignalHolder::compare`.
#[derive(Debug, Clone, Serialize)]
pub struct SignalDiff {
    pub is_diff: bool,
    pub sh1_len: usize,
    pub sh2_len: usize,
    pub sh1_not_in_sh2: SignalHolder,
    pub sh2_not_in_sh1: SignalHolder,
}

impl SignalHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `signal` unless it is dead or its slug is already held.
    /// Returns whether it was added.
    pub fn register(&mut self, signal: Signal) -> bool {
        if signal.is_dead() || self.has_slug(&signal.slug) {
            return false;
        }
        self.signals.push(signal);
        true
    }

    /// Registers everything from `signals`: a `Vec`, an `Option` returned by
    /// a check, another holder, ...
    pub fn register_all<I>(&mut self, signals: I) -> usize
    where
        I: IntoIterator<Item = Signal>,
    {
        signals.into_iter().filter(|s| self.register(s.clone())).count()
    }

    /// Signals whose slug contains any of `slugs` or whose tags contain any
    /// of `tags`, in holder order.
    pub fn find(&self, slugs: &[&str], tags: &[&str]) -> SignalHolder {
        SignalHolder {
            signals: self
                .signals
                .iter()
                .filter(|s| {
                    slugs.iter().any(|q| s.matches_slug(q)) || tags.iter().any(|q| s.matches_tag(q))
                })
                .cloned()
                .collect(),
        }
    }

    /// Exact slug lookup.
    pub fn contains_signal(&self, signal: &Signal) -> bool {
        self.has_slug(&signal.slug)
    }

    /// Fuzzy probe: true if `query` is part of any held slug or tag.
    pub fn contains(&self, query: &str) -> bool {
        self.signals
            .iter()
            .any(|s| s.matches_slug(query) || s.matches_tag(query))
    }

    /// True if any held signal came from the check called `name`.
    pub fn ran_check(&self, name: &str) -> bool {
        self.signals.iter().any(|s| s.check_name == name)
    }

    pub fn get(&self, slug: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.slug == slug)
    }

    /// Symmetric difference by slug.
    pub fn compare(&self, other: &SignalHolder) -> SignalDiff {
        let sh1_not_in_sh2 = self.without_slugs_of(other);
        let sh2_not_in_sh1 = other.without_slugs_of(self);
        SignalDiff {
            is_diff: self != other,
            sh1_len: self.len(),
            sh2_len: other.len(),
            sh1_not_in_sh2,
            sh2_not_in_sh1,
        }
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.signals.iter().map(|s| s.slug.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Signal> {
        self.signals.iter()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    fn has_slug(&self, slug: &str) -> bool {
        self.signals.iter().any(|s| s.slug == slug)
    }

    fn without_slugs_of(&self, other: &SignalHolder) -> SignalHolder {
        SignalHolder {
            signals: self
                .signals
                .iter()
                .filter(|s| !other.has_slug(&s.slug))
                .cloned()
                .collect(),
        }
    }
}

impl IntoIterator for SignalHolder {
    type Item = Signal;
    type IntoIter = std::vec::IntoIter<Signal>;

    fn into_iter(self) -> Self::IntoIter {
        self.signals.into_iter()
    }
}

impl<'a> IntoIterator for &'a SignalHolder {
    type Item = &'a Signal;
    type IntoIter = std::slice::Iter<'a, Signal>;

    fn into_iter(self) -> Self::IntoIter {
        self.signals.iter()
    }
}

impl Extend<Signal> for SignalHolder {
    fn extend<I: IntoIterator<Item = Signal>>(&mut self, iter: I) {
        self.register_all(iter);
    }
}

impl FromIterator<Signal> for SignalHolder {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut holder = SignalHolder::new();
        holder.register_all(iter);
        holder
    }
}
