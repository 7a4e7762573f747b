//! Mirror-list template substitution.
//!
//! A mirror list is an ordered list of base URLs per upstream family. Some
//! route adapters substitute tokens like `{version}` or `{name}` into each
//! entry before handing the resulting URLs to the `LoadBalancer`.

use std::collections::HashMap;

/// Substitutes `{token}` placeholders in `template` with values from
/// `tokens`. Unknown placeholders are left untouched rather than erroring —
/// route adapters validate their inputs before calling this, so an unknown
/// token indicates a static `{` in the mirror URL itself (none of the
/// configured mirror families use literal braces).
pub fn substitute(template: &str, tokens: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        if let Some(end) = rest.find('}') {
            let key = &rest[1..end];
            match tokens.get(key) {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[..=end]),
            }
            rest = &rest[end + 1..];
        } else {
            out.push_str(rest);
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

/// Applies [`substitute`] to every mirror in `mirrors`, returning the
/// expanded URL strings in the same (insertion) order — load-balancer
/// tie-breaking depends on this order being preserved.
pub fn expand_all<'a>(mirrors: impl IntoIterator<Item = &'a str>, tokens: &HashMap<&str, &str>) -> Vec<String> {
    mirrors.into_iter().map(|m| substitute(m, tokens)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_tokens() {
        let mut tokens = HashMap::new();
        tokens.insert("version", "3.11.0");
        tokens.insert("name", "python-3.11.0-embed-amd64.zip");
        let result = substitute("https://example.org/{version}/{name}", &tokens);
        assert_eq!(result, "https://example.org/3.11.0/python-3.11.0-embed-amd64.zip");
    }

    #[test]
    fn leaves_unknown_tokens_untouched() {
        let tokens = HashMap::new();
        let result = substitute("https://example.org/{unknown}/x", &tokens);
        assert_eq!(result, "https://example.org/{unknown}/x");
    }

    #[test]
    fn preserves_order_across_mirrors() {
        let mut tokens = HashMap::new();
        tokens.insert("name", "pkg");
        let mirrors = vec!["https://a/{name}", "https://b/{name}", "https://c/{name}"];
        let expanded = expand_all(mirrors, &tokens);
        assert_eq!(
            expanded,
            vec!["https://a/pkg", "https://b/pkg", "https://c/pkg"]
        );
    }

    #[test]
    fn handles_unterminated_brace() {
        let tokens = HashMap::new();
        assert_eq!(substitute("https://example.org/{name", &tokens), "https://example.org/{name");
    }
}
