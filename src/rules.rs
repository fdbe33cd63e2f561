//! Filter-rule text format.
//!
//! Arms are pattern strings; a rule is the domain-anchored rendering of a
//! pattern (`||pattern^`, or `||pattern` once the pattern carries a path).
//! One arm may bundle several patterns joined by `;;`, emitted as separate
//! rule lines. Lists are written ABP-style: a fixed comment preamble, one
//! rule per line, whitelist lines last.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde_json::json;

use crate::error::PersistError;
use crate::grain::{UrlVariants, strip_www};

/// Joins multiple patterns inside one arm name.
pub const ARM_DELIMITER: &str = ";;";

pub const LIST_HEADER: [&str; 6] = [
    "[Adblock Plus 2.0]",
    "! Title: rulewright synthesized rules",
    "! Expires: 1 hours (update frequency)",
    "! Homepage: https://github.com/rulewright/rulewright",
    "!",
    "! Per-site rules discovered by bandit exploration",
];

/// The individual patterns bundled in an arm name.
pub fn arm_patterns(arm: &str) -> impl Iterator<Item = &str> {
    arm.split(ARM_DELIMITER).filter(|p| !p.is_empty())
}

/// Renders a pattern as a blocking rule. Bare domains get the terminator
/// caret; patterns with a path anchor on their prefix instead.
pub fn block_rule(pattern: &str) -> String {
    if pattern.contains('/') {
        format!("||{pattern}")
    } else {
        format!("||{pattern}^")
    }
}

/// Iframe-scoped variant of [`block_rule`].
pub fn subdocument_rule(pattern: &str) -> String {
    format!("{}$subdocument", block_rule(pattern))
}

/// Renders a whitelist rule for a domain or URL, or `None` when no host can
/// be derived.
pub fn whitelist_rule(pattern: &str) -> Option<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    let variants = UrlVariants::of(pattern)?;
    let host = strip_www(variants.fqdn.as_deref()?);
    let path = variants.path.as_deref().unwrap_or("");
    Some(format!("@@||{host}{path}"))
}

/// All rule lines for one arm.
pub fn rules_for_arm(arm: &str) -> Vec<String> {
    arm_patterns(arm).map(block_rule).collect()
}

/// The canonical key for a rule set: sorted, deduplicated, comma-joined.
/// Matcher and pull caches are keyed by this string.
pub fn canonical_rules<S: AsRef<str>>(rules: &[S]) -> String {
    let mut sorted: Vec<&str> = rules.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// Extracts the rule lines back out of a filter-list text, skipping `!`
/// comments and `[...]` headers.
pub fn parse_filter_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!') && !line.starts_with('['))
        .map(str::to_owned)
        .collect()
}

/// Diagnostic values attached to an arm when its rules are written out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmValues {
    pub q_value: f64,
    pub reward: f64,
    pub ad_removed: f64,
    pub image_missing: f64,
    pub textnode_missing: f64,
    pub ad_count: f64,
    pub image_count: f64,
    pub textnode_count: f64,
}

/// Writes a filter list annotated with each arm's learned values, ordered
/// by descending Q, then name.
pub fn write_filter_list_with_values(
    path: &Utf8Path,
    arms_and_values: &BTreeMap<String, ArmValues>,
    whitelist: &[String],
) -> Result<(), PersistError> {
    let mut ordered: Vec<(&String, &ArmValues)> = arms_and_values.iter().collect();
    ordered.sort_by(|a, b| {
        b.1.q_value
            .total_cmp(&a.1.q_value)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut out = String::new();
    for line in LIST_HEADER {
        out.push_str(line);
        out.push('\n');
    }
    for (arm, values) in ordered {
        let annotation = json!({
            "q_value": values.q_value,
            "reward": values.reward,
            "ad_removed": values.ad_removed,
            "image_missing": values.image_missing,
            "textnode_missing": values.textnode_missing,
            "ad_count": values.ad_count,
            "image_count": values.image_count,
            "textnode_count": values.textnode_count,
        });
        out.push_str(&format!("! {annotation}\n"));
        for rule in rules_for_arm(arm) {
            out.push_str(&rule);
            out.push('\n');
        }
    }
    for entry in whitelist {
        for pattern in arm_patterns(entry) {
            if let Some(rule) = whitelist_rule(pattern) {
                out.push_str(&rule);
                out.push('\n');
            }
        }
    }

    std::fs::write(path, out).map_err(|e| PersistError::FileWrite(path.to_owned(), e))
}

/// Writes a plain filter list from arm names.
pub fn write_filter_list<S: AsRef<str>>(path: &Utf8Path, arms: &[S]) -> Result<(), PersistError> {
    let mut out = String::new();
    for line in LIST_HEADER {
        out.push_str(line);
        out.push('\n');
    }
    for arm in arms {
        for rule in rules_for_arm(arm.as_ref()) {
            out.push_str(&rule);
            out.push('\n');
        }
    }
    std::fs::write(path, out).map_err(|e| PersistError::FileWrite(path.to_owned(), e))
}

/// Writes already-rendered rule lines (used for the `$subdocument` lists).
pub fn write_raw_rules<S: AsRef<str>>(path: &Utf8Path, rules: &[S]) -> Result<(), PersistError> {
    let mut out = String::new();
    for line in LIST_HEADER {
        out.push_str(line);
        out.push('\n');
    }
    for rule in rules {
        out.push_str(rule.as_ref());
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|e| PersistError::FileWrite(path.to_owned(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_domains_get_the_terminator() {
        assert_eq!(block_rule("tracker.com"), "||tracker.com^");
        assert_eq!(block_rule("cdn.com/ads/serve.js"), "||cdn.com/ads/serve.js");
        assert_eq!(subdocument_rule("adframe.net"), "||adframe.net^$subdocument");
    }

    #[test]
    fn arms_split_into_individual_rules() {
        let rules = rules_for_arm("a.com;;b.com/x.js");
        assert_eq!(rules, vec!["||a.com^".to_owned(), "||b.com/x.js".to_owned()]);
    }

    #[test]
    fn whitelist_rules_strip_www_and_scheme() {
        assert_eq!(
            whitelist_rule("https://www.example.com/assets/app.js").as_deref(),
            Some("@@||example.com/assets/app.js"),
        );
        assert_eq!(whitelist_rule("  "), None);
    }

    #[test]
    fn canonicalization_is_idempotent_through_emission() {
        let rules = vec!["||b.com^".to_owned(), "||a.com^".to_owned(), "||b.com^".to_owned()];
        let canonical = canonical_rules(&rules);
        assert_eq!(canonical, "||a.com^,||b.com^");

        let dir = std::env::temp_dir().join("rulewright-rules-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("list.txt");
        let path = Utf8Path::from_path(&path).unwrap();
        write_filter_list(path, &["b.com", "a.com"]).unwrap();

        let reparsed = parse_filter_list(&std::fs::read_to_string(path).unwrap());
        assert_eq!(canonical_rules(&reparsed), canonical);
        assert_eq!(canonical_rules(&reparsed), canonical_rules(&[canonical_rules(&reparsed)]));
    }

    #[test]
    fn list_with_values_orders_by_q_descending() {
        let dir = std::env::temp_dir().join("rulewright-rules-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("final.txt");
        let path = Utf8Path::from_path(&path).unwrap();

        let mut arms = BTreeMap::new();
        arms.insert("low.com".to_owned(), ArmValues { q_value: 0.1, ..Default::default() });
        arms.insert("high.com".to_owned(), ArmValues { q_value: 0.9, ..Default::default() });
        write_filter_list_with_values(path, &arms, &[]).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let rules = parse_filter_list(&content);
        assert_eq!(rules, vec!["||high.com^".to_owned(), "||low.com^".to_owned()]);
        // annotations survive as comments
        assert!(content.contains("\"q_value\":0.9"));
    }
}
