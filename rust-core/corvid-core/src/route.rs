//! # Route Metadata
//!
//! A [`Route`] is one registered `(method, pattern, handler, middleware, name)`
//! entry. Its pattern is compiled once, at registration, into an anchored
//! regular expression:
//!
//! - `{name}` captures one non-empty segment of `[A-Za-z0-9_-]`
//! - `{name?}` captures an optional segment; when it follows a `/` the slash
//!   is optional too, so `/posts/{category?}` matches `/posts`
//! - every other character is matched literally

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::middleware::Middleware;
use crate::router::Method;
use crate::types::{parse_placeholder, Params, Placeholder};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const SEGMENT_CLASS: &str = "[A-Za-z0-9_-]";

/// Normalize a path: leading slash, no duplicate slashes, no trailing slash
///
/// The root path stays `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{joined}")
}

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    Param(Placeholder),
}

/// Compiled path pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    tokens: Vec<Token>,
    regex: Regex,
}

impl PathPattern {
    /// Compile a pattern such as `/users/{id:int}/posts/{slug?}`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` for unbalanced braces, invalid
    /// placeholder names or duplicate placeholder names.
    pub fn compile(pattern: &str) -> Result<Self> {
        let source = normalize_path(pattern);
        let tokens = tokenize(&source)?;

        let mut expr = String::from("^");
        let mut seen: Vec<&str> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::Literal(text) => {
                    let followed_by_optional = matches!(
                        tokens.get(i + 1),
                        Some(Token::Param(p)) if p.optional
                    );
                    let text = if followed_by_optional {
                        text.strip_suffix('/').unwrap_or(text)
                    } else {
                        text
                    };
                    expr.push_str(&regex::escape(text));
                }
                Token::Param(p) => {
                    if seen.contains(&p.name.as_str()) {
                        return Err(Error::InvalidRoutePattern {
                            pattern: pattern.to_string(),
                            reason: format!("duplicate parameter '{}'", p.name),
                        });
                    }
                    seen.push(&p.name);

                    let after_slash = i > 0
                        && matches!(&tokens[i - 1], Token::Literal(t) if t.ends_with('/'));
                    if p.optional && after_slash {
                        expr.push_str(&format!("(?:/(?P<{}>{SEGMENT_CLASS}+))?", p.name));
                    } else if p.optional {
                        expr.push_str(&format!("(?P<{}>{SEGMENT_CLASS}*)", p.name));
                    } else {
                        expr.push_str(&format!("(?P<{}>{SEGMENT_CLASS}+)", p.name));
                    }
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| Error::InvalidRoutePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source,
            tokens,
            regex,
        })
    }

    /// Normalized pattern text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholders in declaration order
    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Param(p) => Some(p),
            Token::Literal(_) => None,
        })
    }

    /// Match a normalized request path, returning captured parameters
    #[must_use]
    pub fn captures(&self, path: &str) -> Option<Params> {
        // `/{lang?}` compiles to an expression that matches the empty string
        let caps = self.regex.captures(path).or_else(|| {
            if path == "/" {
                self.regex.captures("")
            } else {
                None
            }
        })?;
        let mut params = Params::new();
        for p in self.placeholders() {
            if let Some(m) = caps.name(&p.name) {
                if !m.as_str().is_empty() {
                    params.insert(p.name.clone(), m.as_str(), p.param_type);
                }
            }
        }
        Some(params)
    }

    /// Render a URL by substituting placeholder values
    ///
    /// Optional placeholders without a value render empty; the result has
    /// duplicate slashes collapsed and no trailing slash.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingRouteParameter` when a required placeholder has
    /// no value.
    pub fn render(&self, route_name: &str, values: &HashMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Param(p) => match values.get(&p.name) {
                    Some(value) => out.push_str(value),
                    None if p.optional => {}
                    None => {
                        return Err(Error::MissingRouteParameter {
                            route: route_name.to_string(),
                            parameter: p.name.clone(),
                        })
                    }
                },
            }
        }
        Ok(normalize_path(&out))
    }
}

fn tokenize(pattern: &str) -> Result<Vec<Token>> {
    let invalid = |reason: String| Error::InvalidRoutePattern {
        pattern: pattern.to_string(),
        reason,
    };

    let mut tokens = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        if rest[..open].contains('}') {
            return Err(invalid("unmatched '}'".to_string()));
        }
        if open > 0 {
            tokens.push(Token::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| invalid("unclosed '{'".to_string()))?;
        let inner = &after[..close];
        let placeholder =
            parse_placeholder(inner).ok_or_else(|| invalid(format!("invalid placeholder '{{{inner}}}'")))?;
        tokens.push(Token::Param(placeholder));
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(invalid("unmatched '}'".to_string()));
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

/// A registered route
#[derive(Clone)]
pub struct Route {
    /// HTTP method
    pub method: Method,
    /// Compiled path pattern
    pub pattern: PathPattern,
    /// Optional route name used for URL generation
    pub name: Option<String>,
    /// Group and call-site middleware names, outermost group first
    pub middleware: Vec<String>,
    /// Handler label for listings (registry key or `closure`)
    pub handler_name: String,
    pub(crate) resolved_middleware: Vec<(String, Arc<dyn Middleware>)>,
    pub(crate) handler: Handler,
}

impl Route {
    /// Normalized path pattern as registered
    #[must_use]
    pub fn path(&self) -> &str {
        self.pattern.as_str()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.pattern.as_str())
            .field("name", &self.name)
            .field("middleware", &self.middleware)
            .field("handler", &self.handler_name)
            .finish()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<7} {:<32} {:<20} {}",
            self.method.to_string(),
            self.pattern.as_str(),
            self.name.as_deref().unwrap_or("-"),
            self.handler_name
        )?;
        if !self.middleware.is_empty() {
            write!(f, " [{}]", self.middleware.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamType;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("users/"), "/users");
        assert_eq!(normalize_path("//admin//users/"), "/admin/users");
    }

    #[test]
    fn test_static_pattern() {
        let p = PathPattern::compile("/users").unwrap();
        assert!(p.captures("/users").is_some());
        assert!(p.captures("/users/1").is_none());
        assert!(p.captures("/user").is_none());
    }

    #[test]
    fn test_required_parameters() {
        let p = PathPattern::compile("/users/{user_id}/posts/{post_id:int}").unwrap();
        let params = p.captures("/users/abc-1/posts/789").unwrap();
        assert_eq!(params.get("user_id"), Some("abc-1"));
        assert_eq!(params.get_int("post_id"), Some(789));
        assert!(p.captures("/users//posts/1").is_none());
    }

    #[test]
    fn test_segment_class_rejects_dots() {
        let p = PathPattern::compile("/files/{name}").unwrap();
        assert!(p.captures("/files/report.pdf").is_none());
        assert!(p.captures("/files/report_v2-final").is_some());
    }

    #[test]
    fn test_optional_parameter() {
        let p = PathPattern::compile("/posts/{category?}").unwrap();

        let params = p.captures("/posts").unwrap();
        assert!(!params.contains("category"));

        let params = p.captures("/posts/tech").unwrap();
        assert_eq!(params.get("category"), Some("tech"));
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        let p = PathPattern::compile("/v1.0/items").unwrap();
        assert!(p.captures("/v1.0/items").is_some());
        assert!(p.captures("/v1x0/items").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::compile("/users/{id").is_err());
        assert!(PathPattern::compile("/users/id}").is_err());
        assert!(PathPattern::compile("/users/{}").is_err());
        assert!(PathPattern::compile("/a/{id}/b/{id}").is_err());
    }

    #[test]
    fn test_placeholder_types_recorded() {
        let p = PathPattern::compile("/orders/{id:int}/{active?:bool}").unwrap();
        let kinds: Vec<_> = p.placeholders().map(|p| p.param_type).collect();
        assert_eq!(kinds, vec![ParamType::Int, ParamType::Bool]);
    }

    #[test]
    fn test_render() {
        let p = PathPattern::compile("/user/{id}").unwrap();
        assert_eq!(p.render("user.show", &values(&[("id", "42")])).unwrap(), "/user/42");

        let err = p.render("user.show", &values(&[])).unwrap_err();
        assert!(matches!(err, Error::MissingRouteParameter { ref parameter, .. } if parameter == "id"));
    }

    #[test]
    fn test_render_optional_and_root() {
        let p = PathPattern::compile("/posts/{category?}").unwrap();
        assert_eq!(p.render("posts", &values(&[])).unwrap(), "/posts");
        assert_eq!(
            p.render("posts", &values(&[("category", "rust")])).unwrap(),
            "/posts/rust"
        );

        let lang = PathPattern::compile("/{lang?}").unwrap();
        assert!(lang.captures("/").is_some());
        assert_eq!(lang.captures("/en").unwrap().get("lang"), Some("en"));

        let root = PathPattern::compile("/").unwrap();
        assert_eq!(root.render("home", &values(&[])).unwrap(), "/");
    }
}
