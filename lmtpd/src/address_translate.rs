//! Address translation template (§4.2): a `literal%u…%d…` pattern rewriting
//! a resolved `username`/`domain` pair into a new address. The parser/matcher
//! lives here rather than in `lmtp-message`, since unlike the wire grammar
//! this template is an operator-configured rewrite rule, not part of the
//! protocol proper.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Capture {
    Username,
    Domain,
}

enum Token<'a> {
    Literal(&'a str),
    Capture(Capture),
}

fn tokenize(template: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut literal_start = 0usize;
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() {
            let cap = match bytes[i + 1] {
                b'u' | b'n' => Some(Capture::Username),
                b'd' => Some(Capture::Domain),
                _ => None,
            };
            if let Some(cap) = cap {
                if literal_start < i {
                    tokens.push(Token::Literal(&template[literal_start..i]));
                }
                tokens.push(Token::Capture(cap));
                i += 2;
                literal_start = i;
                continue;
            }
        }
        i += 1;
    }
    if literal_start < bytes.len() {
        tokens.push(Token::Literal(&template[literal_start..]));
    }
    tokens
}

/// Matches `template` against `username`/`domain`, returning the rewritten
/// `(username, domain)` pair on success. A template with no `%d` capture
/// still matches, with an empty resulting domain (Open Question §9: decided
/// to produce `"<username>@"` rather than refuse the template outright).
pub fn translate(template: &str, username: &str, domain: &str) -> Option<(String, String)> {
    let input = format!("{}@{}", username, domain);
    let tokens = tokenize(template);

    let mut pos = 0usize;
    let mut captured: Vec<(Capture, String)> = Vec::new();

    let mut idx = 0;
    while idx < tokens.len() {
        match &tokens[idx] {
            Token::Literal(lit) => {
                if !input[pos..].starts_with(lit) {
                    return None;
                }
                pos += lit.len();
                idx += 1;
            }
            Token::Capture(cap) => {
                // Greedy: find the furthest point at which the remainder
                // (starting with the next literal, if any) still matches.
                let next_literal = tokens[idx + 1..].iter().find_map(|t| match t {
                    Token::Literal(l) => Some(*l),
                    Token::Capture(_) => None,
                });
                let captured_str = match next_literal {
                    Some(lit) if !lit.is_empty() => match input[pos..].rfind(lit) {
                        Some(rel) => {
                            let end = pos + rel;
                            let s = input[pos..end].to_owned();
                            pos = end;
                            s
                        }
                        None => return None,
                    },
                    _ => {
                        // No following literal to anchor on: the last
                        // unbound capture extends to end-of-string; an
                        // earlier capture with no literal separating it
                        // from the next one captures nothing.
                        let is_last_capture = tokens[idx + 1..]
                            .iter()
                            .all(|t| matches!(t, Token::Capture(_)));
                        if is_last_capture {
                            let s = input[pos..].to_owned();
                            pos = input.len();
                            s
                        } else {
                            String::new()
                        }
                    }
                };
                captured.push((*cap, captured_str));
                idx += 1;
            }
        }
    }

    let username = captured
        .iter()
        .find(|(c, _)| *c == Capture::Username)
        .map(|(_, s)| s.clone())
        .unwrap_or_default();
    let domain = captured
        .iter()
        .find(|(c, _)| *c == Capture::Domain)
        .map(|(_, s)| s.clone())
        .unwrap_or_default();
    Some((username, domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_template() {
        let (u, d) = translate("%u@%d", "alice", "example.org").unwrap();
        assert_eq!(u, "alice");
        assert_eq!(d, "example.org");
    }

    #[test]
    fn literal_prefix() {
        let (u, d) = translate("proxy-%u@%d", "proxy-alice", "example.org").unwrap();
        assert_eq!(u, "alice");
        assert_eq!(d, "example.org");
    }

    #[test]
    fn mismatched_literal_prefix_fails() {
        assert!(translate("proxy-%u@%d", "alice", "example.org").is_none());
    }

    #[test]
    fn missing_domain_capture_yields_empty_domain() {
        let (u, d) = translate("%u", "alice", "example.org").unwrap();
        assert_eq!(u, "alice@example.org");
        assert_eq!(d, "");
    }

    #[test]
    fn domain_only_capture() {
        let (u, d) = translate("postmaster@%d", "postmaster", "example.org").unwrap();
        assert_eq!(u, "");
        assert_eq!(d, "example.org");
    }
}
