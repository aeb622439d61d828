//! Glob pattern matching over resource/action strings.
//!
//! `*` matches any substring (including empty); every other character is
//! taken literally. A single `*` compiles to a cheap prefix/suffix check;
//! multiple wildcards fall back to an anchored regex with all other
//! metacharacters escaped, following the approach in
//! `ccos::capability_marketplace::marketplace::matches_pattern` (pattern
//! containing `*` compiles to a regex) generalised per spec to avoid regex
//! metacharacter leakage from literal segments.

use regex::Regex;

/// A compiled glob pattern. Cheap to construct; construction never fails.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    strategy: Strategy,
}

#[derive(Debug, Clone)]
enum Strategy {
    /// Matches everything.
    Any,
    /// No wildcard at all: exact string comparison.
    Literal(String),
    /// Exactly one `*`: split into (prefix, suffix).
    PrefixSuffix(String, String),
    /// Two or more `*`: anchored regex with literal segments escaped.
    Regex(Regex),
}

impl Pattern {
    pub fn new(pattern: &str) -> Self {
        let strategy = if pattern == "*" {
            Strategy::Any
        } else if !pattern.contains('*') {
            Strategy::Literal(pattern.to_string())
        } else if pattern.matches('*').count() == 1 {
            let mut parts = pattern.splitn(2, '*');
            let prefix = parts.next().unwrap_or_default().to_string();
            let suffix = parts.next().unwrap_or_default().to_string();
            Strategy::PrefixSuffix(prefix, suffix)
        } else {
            let escaped_segments: Vec<String> = pattern
                .split('*')
                .map(regex::escape)
                .collect();
            let regex_src = format!("^{}$", escaped_segments.join(".*"));
            match Regex::new(&regex_src) {
                Ok(re) => Strategy::Regex(re),
                Err(_) => Strategy::Literal(pattern.to_string()),
            }
        };

        Self {
            raw: pattern.to_string(),
            strategy,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match &self.strategy {
            Strategy::Any => true,
            Strategy::Literal(lit) => lit == candidate,
            Strategy::PrefixSuffix(prefix, suffix) => {
                candidate.len() >= prefix.len() + suffix.len()
                    && candidate.starts_with(prefix.as_str())
                    && candidate.ends_with(suffix.as_str())
            }
            Strategy::Regex(re) => re.is_match(candidate),
        }
    }
}

/// Convenience free function for one-off matches.
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    Pattern::new(pattern).matches(candidate)
}

/// True if `narrower` could only ever match a subset of what `broader`
/// matches — used by delegation scope-coverage checks (§3, §4.3). This is a
/// conservative, purely syntactic check: a pattern covers another when the
/// broader pattern is `*`, the patterns are textually identical, or the
/// broader pattern is a single-wildcard prefix/suffix pattern whose fixed
/// parts are a prefix/suffix of the narrower pattern's fixed parts.
pub fn pattern_covers(broader: &str, narrower: &str) -> bool {
    if broader == "*" || broader == narrower {
        return true;
    }
    if !broader.contains('*') {
        // Broader has no wildcard: only identical patterns can be covered,
        // already handled above.
        return false;
    }
    if broader.matches('*').count() == 1 {
        let mut parts = broader.splitn(2, '*');
        let prefix = parts.next().unwrap_or_default();
        let suffix = parts.next().unwrap_or_default();
        if !narrower.contains('*') {
            return narrower.len() >= prefix.len() + suffix.len()
                && narrower.starts_with(prefix)
                && narrower.ends_with(suffix);
        }
        // Narrower also has wildcards: require its literal prefix/suffix to
        // be at least as specific as the broader pattern's.
        let mut nparts = narrower.splitn(2, '*');
        let nprefix = nparts.next().unwrap_or_default();
        let nsuffix = nparts.next().unwrap_or_default();
        return nprefix.starts_with(prefix) && nsuffix.ends_with(suffix);
    }
    // Multiple wildcards in the broader pattern: fall back to requiring
    // every concrete string matched by `narrower`'s own widest expansion to
    // be structurally compatible. We approximate by checking the narrower
    // pattern's fixed segments each satisfy the broader regex.
    let broader_pat = Pattern::new(broader);
    if !narrower.contains('*') {
        return broader_pat.matches(narrower);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_anything() {
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*", "service:prod-api"));
    }

    #[test]
    fn literal_requires_exact_match() {
        assert!(glob_matches("deploy", "deploy"));
        assert!(!glob_matches("deploy", "deploy-now"));
    }

    #[test]
    fn single_wildcard_prefix_suffix() {
        assert!(glob_matches("service:prod-*", "service:prod-api"));
        assert!(!glob_matches("service:prod-*", "service:staging-api"));
        assert!(glob_matches("a*b", "ab"));
        assert!(glob_matches("a*b", "aXXXb"));
        assert!(!glob_matches("a*b", "aXXXc"));
    }

    #[test]
    fn multi_wildcard_regex_fallback() {
        assert!(glob_matches("repo:*/secret*", "repo:team-a/secrets"));
        assert!(!glob_matches("repo:*/secret*", "repo:team-a/public"));
    }

    #[test]
    fn metacharacters_in_literal_segments_are_escaped() {
        assert!(glob_matches("a.b*", "a.b-suffix"));
        assert!(!glob_matches("a.b*", "axbsuffix"));
    }

    #[test]
    fn coverage_checks() {
        assert!(pattern_covers("*", "anything"));
        assert!(pattern_covers("repo:team-a/*", "repo:team-a/readme"));
        assert!(!pattern_covers("repo:team-a/*", "repo:team-b/readme"));
        assert!(pattern_covers("repo:team-a/*", "repo:team-a/*"));
        assert!(!pattern_covers("repo:team-a/secret", "repo:team-a/*"));
    }
}
