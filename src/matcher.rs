//! Rule matching.
//!
//! Implements the domain-anchored subset of the filter syntax the synthesis
//! loop emits: `||host^`, `||host/path`, optional `@@` whitelisting and a
//! `$subdocument` option. Whitelist rules are consulted first; a whitelist
//! hit vetoes every blacklist rule. Compiled rule sets are cached under
//! their canonical string because the same arm is pulled many times per
//! round.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use url::Url;

use crate::error::MatcherError;
use crate::rules::canonical_rules;

#[derive(Debug, Clone)]
struct CompiledRule {
    raw: String,
    host: String,
    path: Option<String>,
    whitelist: bool,
    #[allow(dead_code)]
    subdocument: bool,
}

impl CompiledRule {
    fn compile(raw: &str) -> Result<CompiledRule, MatcherError> {
        let mut rest = raw.trim();
        let whitelist = rest.starts_with("@@");
        if whitelist {
            rest = &rest[2..];
        }

        let mut subdocument = false;
        if let Some((body, options)) = rest.split_once('$') {
            for option in options.split(',') {
                match option {
                    "subdocument" => subdocument = true,
                    other => {
                        return Err(MatcherError::BadRule(
                            raw.to_owned(),
                            format!("unsupported option `{other}`"),
                        ));
                    }
                }
            }
            rest = body;
        }

        let Some(body) = rest.strip_prefix("||") else {
            return Err(MatcherError::BadRule(
                raw.to_owned(),
                "only domain-anchored rules are supported".to_owned(),
            ));
        };
        let body = body.strip_suffix('^').unwrap_or(body);
        if body.is_empty() {
            return Err(MatcherError::BadRule(raw.to_owned(), "empty pattern".to_owned()));
        }

        let (host, path) = match body.find('/') {
            Some(at) => (body[..at].to_ascii_lowercase(), Some(body[at..].to_owned())),
            None => (body.to_ascii_lowercase(), None),
        };

        Ok(CompiledRule { raw: raw.to_owned(), host, path, whitelist, subdocument })
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        let host_hit = host == self.host
            || (host.len() > self.host.len()
                && host.ends_with(&self.host)
                && host.as_bytes()[host.len() - self.host.len() - 1] == b'.');
        if !host_hit {
            return false;
        }

        match &self.path {
            None => true,
            Some(rule_path) => {
                if !path.starts_with(rule_path.as_str()) {
                    return false;
                }
                // anchored prefix: the match must end at a separator
                match path.as_bytes().get(rule_path.len()) {
                    None => true,
                    Some(next) => !next.is_ascii_alphanumeric() && !matches!(next, b'_' | b'-' | b'.' | b'%'),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub blocked: bool,
    /// Raw texts of the rules that decided the outcome: whitelist matches
    /// when not blocked by veto, blacklist matches when blocked.
    pub matched: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CompiledRules {
    blacklist: Vec<CompiledRule>,
    whitelist: Vec<CompiledRule>,
}

impl CompiledRules {
    pub fn compile<S: AsRef<str>>(rules: &[S]) -> Result<CompiledRules, MatcherError> {
        let mut set = CompiledRules::default();
        for rule in rules {
            let compiled = CompiledRule::compile(rule.as_ref())?;
            if compiled.whitelist {
                set.whitelist.push(compiled);
            } else {
                set.blacklist.push(compiled);
            }
        }
        Ok(set)
    }

    /// Whitelist first: any whitelist hit returns `blocked = false` with
    /// the whitelist matches; otherwise the blacklist decides.
    pub fn should_block(&self, url: &str) -> MatchOutcome {
        let Some((host, path)) = split_url(url) else {
            return MatchOutcome::default();
        };

        let hits = |rules: &[CompiledRule]| -> Vec<String> {
            rules
                .iter()
                .filter(|r| r.matches(&host, &path))
                .map(|r| r.raw.clone())
                .collect()
        };

        let whitelisted = hits(&self.whitelist);
        if !whitelisted.is_empty() {
            return MatchOutcome { blocked: false, matched: whitelisted };
        }

        let blacklisted = hits(&self.blacklist);
        MatchOutcome { blocked: !blacklisted.is_empty(), matched: blacklisted }
    }
}

fn split_url(url: &str) -> Option<(String, String)> {
    let normalized;
    let url = if url.contains("://") {
        url
    } else {
        normalized = format!("https://{url}");
        &normalized
    };
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    Some((host, parsed.path().to_owned()))
}

/// Bounded cache of compiled rule sets, keyed by the canonical rule string.
/// Read-mostly; insertion serializes on the write lock and evicts in FIFO
/// order at capacity.
#[derive(Debug)]
pub struct MatcherCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<String, Arc<CompiledRules>>,
    order: VecDeque<String>,
}

impl MatcherCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: RwLock::new(CacheInner::default()) }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|c| c.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_compile<S: AsRef<str>>(
        &self,
        rules: &[S],
    ) -> Result<Arc<CompiledRules>, MatcherError> {
        let key = canonical_rules(rules);

        if let Ok(cache) = self.inner.read()
            && let Some(found) = cache.map.get(&key)
        {
            return Ok(found.clone());
        }

        let compiled = Arc::new(CompiledRules::compile(rules)?);
        if let Ok(mut cache) = self.inner.write() {
            if !cache.map.contains_key(&key) {
                while cache.map.len() >= self.capacity {
                    match cache.order.pop_front() {
                        Some(oldest) => {
                            cache.map.remove(&oldest);
                        }
                        None => break,
                    }
                }
                cache.order.push_back(key.clone());
                cache.map.insert(key, compiled.clone());
            }
        }
        Ok(compiled)
    }
}
