//! Path templates and the route entries they compile into.

use crate::filter::{Filter, FilterId};
use http::Method;
use sprout_http::handler::{HandlerError, RequestHandler};
use sprout_http::protocol::{PathParams, Request, Response};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The accept type a route answers when registered without one.
pub const ANY_ACCEPT_TYPE: &str = "*/*";

/// Rewrites a template into the key the trie is built on.
///
/// A leading `/` is added when missing, every `:name` segment becomes `*` and runs of `*`
/// collapse into one: `user/:id/**` turns into `/user/*/*`.
pub fn normalize(template: &str) -> String {
    let mut normalized = String::with_capacity(template.len() + 1);
    if !template.starts_with('/') {
        normalized.push('/');
    }

    for token in tokenize(template) {
        match token {
            Token::Literal(literal) => normalized.push_str(literal),
            Token::Param(_) | Token::Wildcard => {
                if !normalized.ends_with('*') {
                    normalized.push('*');
                }
            }
        }
    }
    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    /// `:name`, one or more bytes other than `/`.
    Param(&'a str),
    /// `*`, lazily any bytes including `/`.
    Wildcard,
}

/// Splits a template into tokens. A `:name` only counts as a param when it ends at a `/`
/// or at the end of the template; anything else stays literal.
fn tokenize(template: &str) -> Vec<Token<'_>> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                push_literal(&mut tokens, &template[literal_start..i]);
                while i < bytes.len() && bytes[i] == b'*' {
                    i += 1;
                }
                tokens.push(Token::Wildcard);
                literal_start = i;
            }
            b':' => {
                let name_end = bytes[i + 1..]
                    .iter()
                    .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                    .map_or(bytes.len(), |n| i + 1 + n);

                let terminated = name_end == bytes.len() || bytes[name_end] == b'/';
                if name_end > i + 1 && terminated {
                    push_literal(&mut tokens, &template[literal_start..i]);
                    tokens.push(Token::Param(&template[i + 1..name_end]));
                    i = name_end;
                    literal_start = i;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    push_literal(&mut tokens, &template[literal_start..]);
    tokens
}

fn push_literal<'a>(tokens: &mut Vec<Token<'a>>, literal: &'a str) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// A compiled template, matched against whole paths.
///
/// Params take the shortest run of non-`/` bytes that lets the rest of the template match,
/// wildcards the shortest run of any bytes. Every wildcard capture lands in the splat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    template: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn compile(template: &str) -> Self {
        let mut segments = Vec::new();
        if !template.starts_with('/') {
            segments.push(Segment::Literal("/".into()));
        }

        for token in tokenize(template) {
            let segment = match token {
                Token::Literal(literal) => Segment::Literal(literal.to_owned()),
                Token::Param(name) => Segment::Param(name.to_owned()),
                Token::Wildcard => Segment::Wildcard,
            };
            match (segments.last_mut(), segment) {
                (Some(Segment::Literal(previous)), Segment::Literal(literal)) => previous.push_str(&literal),
                (_, segment) => segments.push(segment),
            }
        }

        Self { template: template.to_owned(), segments }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The param names in template order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        let mut captures = Vec::new();
        self.match_from(path.as_bytes(), 0, 0, &mut captures)
    }

    /// Matches `path` and recovers the params and the splat.
    pub fn captures(&self, path: &str) -> Option<PathParams> {
        let mut captures = Vec::new();
        if !self.match_from(path.as_bytes(), 0, 0, &mut captures) {
            return None;
        }

        let mut params = HashMap::new();
        let mut splat = Vec::new();
        let capturing = self.segments.iter().filter(|segment| !matches!(segment, Segment::Literal(_)));
        for (segment, (start, end)) in capturing.zip(captures) {
            let value = path[start..end].to_owned();
            match segment {
                Segment::Param(name) => {
                    params.insert(name.clone(), value);
                }
                _ => splat.push(value),
            }
        }
        Some(PathParams::new(params, splat))
    }

    /// Backtracking matcher; `captures` holds one `(start, end)` per param or wildcard
    /// matched so far.
    fn match_from(&self, path: &[u8], segment: usize, pos: usize, captures: &mut Vec<(usize, usize)>) -> bool {
        let Some(current) = self.segments.get(segment) else {
            return pos == path.len();
        };

        match current {
            Segment::Literal(literal) => {
                path[pos..].starts_with(literal.as_bytes()) && self.match_from(path, segment + 1, pos + literal.len(), captures)
            }
            Segment::Param(_) => {
                let segment_end = path[pos..].iter().position(|b| *b == b'/').map_or(path.len(), |n| pos + n);
                (pos + 1..=segment_end).any(|end| self.try_capture(path, segment, pos, end, captures))
            }
            Segment::Wildcard => (pos..=path.len()).any(|end| self.try_capture(path, segment, pos, end, captures)),
        }
    }

    fn try_capture(&self, path: &[u8], segment: usize, start: usize, end: usize, captures: &mut Vec<(usize, usize)>) -> bool {
        captures.push((start, end));
        if self.match_from(path, segment + 1, end, captures) {
            return true;
        }
        captures.pop();
        false
    }
}

/// One registered route: a handler for a normalized path, a method and an accept type,
/// plus the filters that apply to it.
pub struct RouteEntry {
    pattern: PathPattern,
    normalized: String,
    method: Method,
    accept_type: String,
    handler: Arc<dyn RequestHandler>,
    before: Vec<(FilterId, Arc<dyn Filter>)>,
    after: Vec<(FilterId, Arc<dyn Filter>)>,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("template", &self.pattern.template())
            .field("normalized", &self.normalized)
            .field("method", &self.method)
            .field("accept_type", &self.accept_type)
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish_non_exhaustive()
    }
}

impl RouteEntry {
    pub(crate) fn new(template: &str, method: Method, accept_type: &str, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            pattern: PathPattern::compile(template),
            normalized: normalize(template),
            method,
            accept_type: accept_type.to_owned(),
            handler,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn template(&self) -> &str {
        self.pattern.template()
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn accept_type(&self) -> &str {
        &self.accept_type
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn before_filters(&self) -> impl Iterator<Item = FilterId> + '_ {
        self.before.iter().map(|(id, _)| *id)
    }

    pub fn after_filters(&self) -> impl Iterator<Item = FilterId> + '_ {
        self.after.iter().map(|(id, _)| *id)
    }

    /// Appends a before-filter unless it is already attached.
    pub(crate) fn add_before(&mut self, id: FilterId, filter: &Arc<dyn Filter>) {
        if !self.before.iter().any(|(attached, _)| *attached == id) {
            self.before.push((id, Arc::clone(filter)));
        }
    }

    /// Appends an after-filter unless it is already attached.
    pub(crate) fn add_after(&mut self, id: FilterId, filter: &Arc<dyn Filter>) {
        if !self.after.iter().any(|(attached, _)| *attached == id) {
            self.after.push((id, Arc::clone(filter)));
        }
    }

    /// Runs the before-filters in order, stopping at the first failure.
    pub fn run_before(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        self.before.iter().try_for_each(|(_, filter)| filter.filter(request, response))
    }

    pub fn run_handler(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        self.handler.handle(request, response)
    }

    /// Runs every after-filter in order, even when one fails; the first failure is returned.
    pub fn run_after(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        let mut first_error = None;
        for (_, filter) in &self.after {
            if let Err(e) = filter.filter(request, response) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_params_and_wildcards() {
        assert_eq!(normalize("/user/:id"), "/user/*");
        assert_eq!(normalize("user/:id/orders/:order"), "/user/*/orders/*");
        assert_eq!(normalize("/static/**"), "/static/*");
        assert_eq!(normalize("/a/:b/*"), "/a/*/*");
        assert_eq!(normalize("/files/:name.txt"), "/files/:name.txt");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn captures_named_params() {
        let pattern = PathPattern::compile("/user/:id/orders/:order");
        let params = pattern.captures("/user/42/orders/7").unwrap();

        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("order"), Some("7"));
        assert!(params.splat().is_empty());
        assert_eq!(pattern.param_names().collect::<Vec<_>>(), ["id", "order"]);
    }

    #[test]
    fn param_does_not_cross_slash() {
        let pattern = PathPattern::compile("/user/:id");

        assert!(pattern.captures("/user/1/2").is_none());
        assert!(pattern.captures("/user/").is_none());
    }

    #[test]
    fn wildcard_captures_rest_of_path() {
        let pattern = PathPattern::compile("/static/*");
        let params = pattern.captures("/static/a/b/c").unwrap();

        assert_eq!(params.splat(), ["a/b/c"]);
    }

    #[test]
    fn wildcard_is_lazy_between_literals() {
        let pattern = PathPattern::compile("/*/x/*");
        let params = pattern.captures("/a/x/b/x/c").unwrap();

        assert_eq!(params.splat(), ["a", "b/x/c"]);
    }

    #[test]
    fn matches_normalized_paths_for_filters() {
        assert!(PathPattern::compile("/user/*").is_match("/user/*"));
        assert!(PathPattern::compile("/user/:id").is_match("/user/*"));
        assert!(PathPattern::compile("*").is_match("/anything/at/all"));
        assert!(!PathPattern::compile("/admin/*").is_match("/user/*"));
    }

    #[test]
    fn template_without_leading_slash_matches() {
        let pattern = PathPattern::compile("hello/:name");

        assert_eq!(pattern.captures("/hello/bob").unwrap().get("name"), Some("bob"));
    }
}
