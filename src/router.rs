//! Route selection over the enabled rule snapshot
//! First match in list order wins, not the longest prefix

use crate::rules::ProxyRule;

/// A rule selected for a request, together with the prefix it matched on
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch<'a> {
    pub rule: &'a ProxyRule,
    pub prefix: String,
}

/// Ensure a configured mount path begins with `/`
pub fn normalize_prefix(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Return the first rule whose prefix `P` satisfies `path == P` or
/// `path` starting with `P/`.
///
/// Rules are tried in the order supplied. Overlapping prefixes such as `/a`
/// and `/a/b` resolve to whichever comes first.
pub fn match_route<'a>(path: &str, rules: &'a [ProxyRule]) -> Option<RouteMatch<'a>> {
    rules.iter().find_map(|rule| {
        let prefix = normalize_prefix(&rule.path);
        let matched = path == prefix
            || path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'));

        matched.then(|| RouteMatch { rule, prefix })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str, target: &str) -> ProxyRule {
        ProxyRule::new(path, path, target, true)
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("docs"), "/docs");
        assert_eq!(normalize_prefix("/docs"), "/docs");
        assert_eq!(normalize_prefix(""), "/");
    }

    #[test]
    fn test_exact_and_nested_paths_match() {
        let rules = vec![rule("/ex", "https://example.com")];

        let m = match_route("/ex", &rules).unwrap();
        assert_eq!(m.prefix, "/ex");
        assert_eq!(m.rule.target, "https://example.com");

        assert!(match_route("/ex/", &rules).is_some());
        assert!(match_route("/ex/page/deep", &rules).is_some());
    }

    #[test]
    fn test_sibling_paths_do_not_match() {
        let rules = vec![rule("/ex", "https://example.com")];

        assert!(match_route("/example", &rules).is_none());
        assert!(match_route("/e", &rules).is_none());
        assert!(match_route("/", &rules).is_none());
        assert!(match_route("/other/ex", &rules).is_none());
    }

    #[test]
    fn test_prefix_without_leading_slash() {
        let rules = vec![rule("ex", "https://example.com")];

        let m = match_route("/ex/page", &rules).unwrap();
        assert_eq!(m.prefix, "/ex");
    }

    #[test]
    fn test_first_match_wins_over_longest() {
        let short = rule("/a", "https://short.example.com");
        let long = rule("/a/b", "https://long.example.com");

        let rules = vec![short.clone(), long.clone()];
        let m = match_route("/a/b/x", &rules).unwrap();
        assert_eq!(m.rule.target, "https://short.example.com");
        assert_eq!(m.prefix, "/a");

        let rules = vec![long, short];
        let m = match_route("/a/b/x", &rules).unwrap();
        assert_eq!(m.rule.target, "https://long.example.com");
        assert_eq!(m.prefix, "/a/b");
    }

    #[test]
    fn test_empty_rule_list() {
        assert!(match_route("/anything", &[]).is_none());
    }
}
