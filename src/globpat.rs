//! Anchored shell-style patterns for principal filtering.
//!
//! Supports `*`, `?`, `[set]` via `glob::Pattern` and adds `{a,b}` alternation
//! by expanding braces into a pattern list before compilation. Matches are
//! always against the whole principal string.

use glob::Pattern;

#[derive(Debug, Clone)]
pub struct PrincipalPattern {
    source: String,
    alternatives: Vec<Pattern>,
}

impl PrincipalPattern {
    pub fn new(pattern: &str) -> Result<Self, String> {
        let mut alternatives = Vec::new();
        for expanded in expand_braces(pattern)? {
            let p = Pattern::new(&expanded)
                .map_err(|e| format!("bad pattern {:?}: {}", pattern, e))?;
            alternatives.push(p);
        }
        Ok(Self { source: pattern.to_string(), alternatives })
    }

    pub fn matches(&self, principal: &str) -> bool {
        self.alternatives.iter().any(|p| p.matches(principal))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Expand the first `{a,b,...}` group and recurse; a pattern without braces
/// expands to itself. Nested groups are handled by the recursion. Commas
/// inside `[...]` sets are not treated as separators.
fn expand_braces(pattern: &str) -> Result<Vec<String>, String> {
    let bytes = pattern.as_bytes();
    let mut depth = 0usize;
    let mut in_set = false;
    let mut open = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'[' if depth == 0 => in_set = true,
            b']' if depth == 0 => in_set = false,
            b'{' if !in_set => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            b'}' if !in_set => {
                if depth == 0 {
                    return Err(format!("unbalanced '}}' in pattern {:?}", pattern));
                }
                depth -= 1;
                if depth == 0 {
                    let start = open.unwrap();
                    let head = &pattern[..start];
                    let body = &pattern[start + 1..i];
                    let tail = &pattern[i + 1..];
                    let mut out = Vec::new();
                    for alt in split_alternatives(body) {
                        for rest in expand_braces(&format!("{}{}{}", head, alt, tail))? {
                            out.push(rest);
                        }
                    }
                    return Ok(out);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(format!("unbalanced '{{' in pattern {:?}", pattern));
    }
    Ok(vec![pattern.to_string()])
}

/// Split a brace body on top-level commas only.
fn split_alternatives(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in body.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_globs_are_anchored() {
        let p = PrincipalPattern::new("d*").unwrap();
        assert!(p.matches("dev"));
        assert!(p.matches("d"));
        assert!(!p.matches("adev"));
        let q = PrincipalPattern::new("ops").unwrap();
        assert!(q.matches("ops"));
        assert!(!q.matches("ops2"));
    }

    #[test]
    fn question_mark_and_sets() {
        let p = PrincipalPattern::new("user?").unwrap();
        assert!(p.matches("user1"));
        assert!(!p.matches("user"));
        let s = PrincipalPattern::new("user[12]").unwrap();
        assert!(s.matches("user1"));
        assert!(s.matches("user2"));
        assert!(!s.matches("user3"));
    }

    #[test]
    fn brace_alternation() {
        let p = PrincipalPattern::new("{alice,bob}").unwrap();
        assert!(p.matches("alice"));
        assert!(p.matches("bob"));
        assert!(!p.matches("carol"));
        let q = PrincipalPattern::new("{dev,ops}-*").unwrap();
        assert!(q.matches("dev-eu"));
        assert!(q.matches("ops-us"));
        assert!(!q.matches("sec-eu"));
    }

    #[test]
    fn nested_braces() {
        let p = PrincipalPattern::new("{a{1,2},b}").unwrap();
        assert!(p.matches("a1"));
        assert!(p.matches("a2"));
        assert!(p.matches("b"));
        assert!(!p.matches("a"));
    }

    #[test]
    fn unbalanced_braces_rejected() {
        assert!(PrincipalPattern::new("{a,b").is_err());
        assert!(PrincipalPattern::new("a}b").is_err());
    }
}
