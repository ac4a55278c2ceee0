//! Per-domain TTL policy. Rules come from the `cache.control` config
//! list plus the catch-alls synthesized from `override_ttl` and
//! `multiple_ttl`; the catch-alls sit last so explicit entries win.

use relaydns_core::config::{CacheConfig, CacheControlEntry, Infection, TtlState};
use relaydns_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct TtlRule {
    pub pattern: String,
    pub state: TtlState,
    pub coefficient: u32,
    pub increment: u32,
    pub infection: Infection,
}

impl TtlRule {
    fn from_entry(e: &CacheControlEntry) -> Self {
        Self {
            pattern: e.pattern.to_lowercase(),
            state: e.state,
            coefficient: e.coefficient,
            increment: e.increment,
            infection: e.infection,
        }
    }
}

#[derive(Debug, Default)]
pub struct TtlPolicy {
    rules: Vec<TtlRule>,
}

impl TtlPolicy {
    pub fn from_config(cfg: &CacheConfig) -> Result<Self> {
        let mut rules: Vec<TtlRule> = cfg.control.iter().map(TtlRule::from_entry).collect();

        if cfg.override_ttl > -1 {
            rules.push(TtlRule {
                pattern: "*".into(),
                state: TtlState::Fixed,
                coefficient: 1,
                increment: cfg.override_ttl as u32,
                infection: Infection::Aggressive,
            });
        } else if cfg.multiple_ttl < 1 {
            return Err(Error::Config("multiple_ttl must be at least 1".into()));
        } else if cfg.multiple_ttl > 1 {
            rules.push(TtlRule {
                pattern: "*".into(),
                state: TtlState::Variable,
                coefficient: cfg.multiple_ttl as u32,
                increment: 0,
                infection: Infection::Aggressive,
            });
        }

        Ok(Self { rules })
    }

    /// First matching rule in configured order.
    pub fn lookup(&self, domain: &str) -> Option<&TtlRule> {
        self.rules.iter().find(|r| wildcard_match(&r.pattern, domain))
    }

    /// The TTL a record gets cached with; 0 means do not cache.
    pub fn apply(rule: Option<&TtlRule>, record_ttl: u32) -> u32 {
        match rule {
            None => record_ttl,
            Some(r) => match r.state {
                TtlState::NoCache => 0,
                TtlState::Original => record_ttl,
                TtlState::Variable => r
                    .coefficient
                    .saturating_mul(record_ttl)
                    .saturating_add(r.increment),
                TtlState::Fixed => r.increment,
            },
        }
    }
}

/// `*` spans any run of characters, `?` exactly one; ASCII
/// case-insensitive.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything.example.com"));
        assert!(wildcard_match("example.com", "example.com"));
        assert!(wildcard_match("Example.COM", "example.com"));
        assert!(wildcard_match("*.example.com", "a.example.com"));
        assert!(wildcard_match("*.example.com", "a.b.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(wildcard_match("a?.test", "ab.test"));
        assert!(!wildcard_match("a?.test", "a.test"));
        assert!(!wildcard_match("example.com", "example.org"));
    }

    #[test]
    fn test_apply_states() {
        let rule = |state, coefficient, increment| TtlRule {
            pattern: "*".into(),
            state,
            coefficient,
            increment,
            infection: Infection::None,
        };
        assert_eq!(TtlPolicy::apply(None, 300), 300);
        assert_eq!(TtlPolicy::apply(Some(&rule(TtlState::NoCache, 1, 0)), 300), 0);
        assert_eq!(TtlPolicy::apply(Some(&rule(TtlState::Original, 9, 9)), 300), 300);
        assert_eq!(TtlPolicy::apply(Some(&rule(TtlState::Variable, 2, 60)), 300), 660);
        assert_eq!(TtlPolicy::apply(Some(&rule(TtlState::Fixed, 1, 86400)), 300), 86400);
    }

    #[test]
    fn test_override_ttl_builds_catch_all() {
        let cfg = CacheConfig {
            override_ttl: 3600,
            ..Default::default()
        };
        let policy = TtlPolicy::from_config(&cfg).unwrap();
        let rule = policy.lookup("any.example.com").unwrap();
        assert_eq!(rule.state, TtlState::Fixed);
        assert_eq!(rule.increment, 3600);
        assert_eq!(rule.infection, Infection::Aggressive);
    }

    #[test]
    fn test_multiple_ttl_builds_catch_all() {
        let cfg = CacheConfig {
            multiple_ttl: 4,
            ..Default::default()
        };
        let policy = TtlPolicy::from_config(&cfg).unwrap();
        let rule = policy.lookup("any.example.com").unwrap();
        assert_eq!(rule.state, TtlState::Variable);
        assert_eq!(rule.coefficient, 4);
        assert_eq!(TtlPolicy::apply(Some(rule), 100), 400);
    }

    #[test]
    fn test_invalid_multiple_ttl() {
        let cfg = CacheConfig {
            multiple_ttl: 0,
            ..Default::default()
        };
        assert!(TtlPolicy::from_config(&cfg).is_err());
    }

    #[test]
    fn test_explicit_rules_win_over_catch_all() {
        let cfg = CacheConfig {
            override_ttl: 3600,
            control: vec![CacheControlEntry {
                pattern: "*.internal".into(),
                state: TtlState::NoCache,
                coefficient: 1,
                increment: 0,
                infection: Infection::None,
            }],
            ..Default::default()
        };
        let policy = TtlPolicy::from_config(&cfg).unwrap();
        assert_eq!(
            policy.lookup("db.internal").unwrap().state,
            TtlState::NoCache
        );
        assert_eq!(
            policy.lookup("www.example.com").unwrap().state,
            TtlState::Fixed
        );
    }
}
