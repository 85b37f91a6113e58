use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while1},
    character::complete::{char, digit1, hex_digit1, multispace0, multispace1},
    combinator::{all_consuming, map, opt, recognize, value},
    error::{Error, ErrorKind},
    multi::{many0, many0_count, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};
use serde_json::{Number, Value};

use super::{Call, Expr, Node, PathExpr, TemplateError};

type Res<'a, O> = IResult<&'a str, O>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Value,
    Open,
    Close,
    Else,
    Partial,
    Comment,
}

#[derive(Debug)]
enum Token<'a> {
    Text(String),
    Tag {
        kind: TagKind,
        body: &'a str,
        line: usize,
        strip_before: bool,
        strip_after: bool,
    },
}

fn syntax(template: &str, line: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        template: template.to_string(),
        line,
        message: message.into(),
    }
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

/// Splits a tag off the front of `input`, which starts with `{{`.
///
/// Returns the text between the delimiters, whether the tag was a
/// triple-stash and the remaining input.
fn split_tag(input: &str) -> Option<(&str, bool, &str)> {
    if let Some(inner) = input.strip_prefix("{{{") {
        let end = inner.find("}}}")?;
        return Some((&inner[..end], true, &inner[end + 3..]));
    }

    let inner = &input[2..];
    let open = inner.strip_prefix('~').unwrap_or(inner);
    if open.starts_with("!--") {
        // Long comments may contain `}}`, so they end at the first `--}}`
        let mut from = 0;
        while let Some(found) = inner[from..].find("--") {
            let at = from + found;
            let after = &inner[at + 2..];
            if let Some(rest) = after.strip_prefix("}}") {
                return Some((&inner[..at + 2], false, rest));
            }
            if let Some(rest) = after.strip_prefix("~}}") {
                return Some((&inner[..at + 3], false, rest));
            }
            from = at + 1;
        }
        return None;
    }

    let end = inner.find("}}")?;
    Some((&inner[..end], false, &inner[end + 2..]))
}

fn classify<'a>(inner: &'a str, triple: bool, line: usize) -> Token<'a> {
    if triple {
        return Token::Tag {
            kind: TagKind::Value,
            body: inner,
            line,
            strip_before: false,
            strip_after: false,
        };
    }

    let (strip_before, inner) = match inner.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let (strip_after, inner) = match inner.strip_suffix('~') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };

    let trimmed = inner.trim_start();
    let (kind, body) = if let Some(rest) = trimmed.strip_prefix('#') {
        (TagKind::Open, rest)
    } else if let Some(rest) = trimmed.strip_prefix('/') {
        (TagKind::Close, rest)
    } else if let Some(rest) = trimmed.strip_prefix('>') {
        (TagKind::Partial, rest)
    } else if trimmed.starts_with('!') {
        (TagKind::Comment, "")
    } else if trimmed.trim_end() == "^" {
        (TagKind::Else, "")
    } else if trimmed.trim_end() == "else" {
        (TagKind::Else, "")
    } else if let Some(rest) = trimmed.strip_prefix("else ") {
        (TagKind::Else, rest)
    } else {
        (TagKind::Value, inner)
    };

    Token::Tag {
        kind,
        body,
        line,
        strip_before,
        strip_after,
    }
}

fn tokenize<'a>(name: &str, source: &'a str) -> Result<Vec<Token<'a>>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while !rest.is_empty() {
        let Some(start) = rest.find("{{") else {
            tokens.push(Token::Text(rest.to_string()));
            break;
        };
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let line = line_of(source, source.len() - rest.len() + start);
        let (inner, triple, remaining) =
            split_tag(&rest[start..]).ok_or_else(|| syntax(name, line, "unterminated tag"))?;
        tokens.push(classify(inner, triple, line));
        rest = remaining;
    }
    Ok(tokens)
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn line_tail_blank(text: &str, at_start: bool) -> bool {
    match text.rfind('\n') {
        Some(p) => text[p + 1..].chars().all(is_blank),
        None => at_start && text.chars().all(is_blank),
    }
}

fn line_head_blank(text: &str, at_end: bool) -> bool {
    match text.find('\n') {
        Some(p) => text[..p].trim_end_matches('\r').chars().all(is_blank),
        None => at_end && text.chars().all(is_blank),
    }
}

fn strip_first_line(text: &str) -> String {
    let trimmed = text.trim_start_matches(is_blank);
    trimmed
        .strip_prefix("\r\n")
        .or_else(|| trimmed.strip_prefix('\n'))
        .unwrap_or(trimmed)
        .to_string()
}

/// Removes the line of a block, else, comment or partial tag that stands
/// alone on its line, then applies `~` whitespace control.
fn trim_whitespace(tokens: &mut [Token<'_>]) {
    let n = tokens.len();
    let standalone: Vec<bool> = (0..n)
        .map(|i| match &tokens[i] {
            Token::Tag { kind, .. } if *kind != TagKind::Value => {
                let before = i == 0
                    || matches!(&tokens[i - 1], Token::Text(t) if line_tail_blank(t, i == 1));
                let after = i + 1 == n
                    || matches!(&tokens[i + 1], Token::Text(t) if line_head_blank(t, i + 2 == n));
                before && after
            }
            _ => false,
        })
        .collect();

    for i in 0..n {
        if !standalone[i] {
            continue;
        }
        if i > 0 {
            if let Token::Text(t) = &mut tokens[i - 1] {
                let keep = t.trim_end_matches(is_blank).len();
                t.truncate(keep);
            }
        }
        if i + 1 < n {
            if let Token::Text(t) = &mut tokens[i + 1] {
                *t = strip_first_line(t);
            }
        }
    }

    for i in 0..n {
        let (before, after) = match &tokens[i] {
            Token::Tag {
                strip_before,
                strip_after,
                ..
            } => (*strip_before, *strip_after),
            Token::Text(_) => continue,
        };
        if before && i > 0 {
            if let Token::Text(t) = &mut tokens[i - 1] {
                let keep = t.trim_end().len();
                t.truncate(keep);
            }
        }
        if after && i + 1 < n {
            if let Token::Text(t) = &mut tokens[i + 1] {
                *t = t.trim_start().to_string();
            }
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '-' | '?')
}

fn identifier(i: &str) -> Res<&str> {
    take_while1(is_ident_char)(i)
}

fn segments(i: &str) -> Res<Vec<String>> {
    map(
        separated_list1(alt((char('.'), char('/'))), identifier),
        |segments| segments.into_iter().map(String::from).collect(),
    )(i)
}

fn data_path(i: &str) -> Res<PathExpr> {
    map(preceded(char('@'), segments), |segments| PathExpr {
        data: true,
        parents: 0,
        segments,
    })(i)
}

fn context_path(i: &str) -> Res<PathExpr> {
    let (i, parents) = many0_count(tag("../"))(i)?;
    let (i, mut segments) = alt((segments, value(Vec::new(), char('.'))))(i)?;
    if segments.first().is_some_and(|s| s == "this") {
        segments.remove(0);
    }
    Ok((
        i,
        PathExpr {
            data: false,
            parents,
            segments,
        },
    ))
}

fn path(i: &str) -> Res<PathExpr> {
    alt((data_path, context_path))(i)
}

fn quoted(i: &str) -> Res<&str> {
    map(
        alt((
            delimited(char('"'), opt(is_not("\"")), char('"')),
            delimited(char('\''), opt(is_not("'")), char('\'')),
        )),
        |s| s.unwrap_or(""),
    )(i)
}

fn number(i: &str) -> Res<Value> {
    let hex = map(
        preceded(tag_no_case("0x"), hex_digit1),
        |digits: &str| i64::from_str_radix(digits, 16).ok().map(Value::from),
    );
    let decimal = map(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |text: &str| {
            if text.contains('.') {
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            } else {
                text.parse::<i64>().ok().map(Value::from)
            }
        },
    );
    let (rest, parsed) = alt((hex, decimal))(i)?;
    match parsed {
        Some(v) if !rest.starts_with(is_ident_char) => Ok((rest, v)),
        _ => Err(nom::Err::Error(Error::new(i, ErrorKind::Digit))),
    }
}

fn keyword_or_path(path: PathExpr) -> Expr {
    let literal = match path.helper_name() {
        Some("true") => Some(Value::Bool(true)),
        Some("false") => Some(Value::Bool(false)),
        Some("null") | Some("undefined") => Some(Value::Null),
        _ => None,
    };
    match literal {
        Some(v) => Expr::Literal(v),
        None => Expr::Path(path),
    }
}

fn param(i: &str) -> Res<Expr> {
    alt((
        map(sub_expr, |call| Expr::SubExpr(Box::new(call))),
        map(quoted, |s| Expr::Literal(Value::String(s.to_string()))),
        map(number, Expr::Literal),
        map(path, keyword_or_path),
    ))(i)
}

enum Arg {
    Positional(Expr),
    Named(String, Expr),
}

fn argument(i: &str) -> Res<Arg> {
    alt((
        map(separated_pair(identifier, char('='), param), |(k, v)| {
            Arg::Named(k.to_string(), v)
        }),
        map(param, Arg::Positional),
    ))(i)
}

fn call(i: &str) -> Res<Call> {
    let (i, head) = param(i)?;
    let (i, args) = many0(preceded(multispace1, argument))(i)?;
    let mut call = Call {
        head,
        params: Vec::new(),
        hash: Vec::new(),
    };
    for arg in args {
        match arg {
            Arg::Positional(expr) => call.params.push(expr),
            Arg::Named(key, expr) => call.hash.push((key, expr)),
        }
    }
    Ok((i, call))
}

fn sub_expr(i: &str) -> Res<Call> {
    delimited(
        pair(char('('), multispace0),
        call,
        pair(multispace0, char(')')),
    )(i)
}

fn partial(i: &str) -> Res<(String, Option<Expr>)> {
    tuple((
        preceded(
            multispace0,
            alt((
                map(quoted, String::from),
                map(take_while1(|c: char| !c.is_whitespace()), String::from),
            )),
        ),
        terminated(opt(preceded(multispace1, param)), multispace0),
    ))(i)
}

fn parse_call(template: &str, body: &str, line: usize) -> Result<Call, TemplateError> {
    all_consuming(delimited(multispace0, call, multispace0))(body)
        .map(|(_, call)| call)
        .map_err(|_| syntax(template, line, format!("invalid expression '{}'", body.trim())))
}

fn block_name(template: &str, call: &Call, line: usize) -> Result<String, TemplateError> {
    match &call.head {
        Expr::Path(path) if !path.data && path.parents == 0 && !path.segments.is_empty() => {
            Ok(path.segments.join("."))
        }
        _ => Err(syntax(template, line, "block name must be a plain path")),
    }
}

struct Frame {
    call: Call,
    name: String,
    line: usize,
    body: Vec<Node>,
    inverse: Vec<Node>,
    in_inverse: bool,
    /// Opened by `{{else name ...}}`, closed together with its parent
    chained: bool,
}

impl Frame {
    fn new(call: Call, name: String, line: usize, chained: bool) -> Self {
        Self {
            call,
            name,
            line,
            body: Vec::new(),
            inverse: Vec::new(),
            in_inverse: false,
            chained,
        }
    }
}

fn current<'r>(root: &'r mut Vec<Node>, stack: &'r mut [Frame]) -> &'r mut Vec<Node> {
    match stack.last_mut() {
        Some(frame) if frame.in_inverse => &mut frame.inverse,
        Some(frame) => &mut frame.body,
        None => root,
    }
}

pub(super) fn parse_nodes(template: &str, source: &str) -> Result<Vec<Node>, TemplateError> {
    let mut tokens = tokenize(template, source)?;
    trim_whitespace(&mut tokens);

    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    for token in tokens {
        let (kind, body, line) = match token {
            Token::Text(text) => {
                if !text.is_empty() {
                    current(&mut root, &mut stack).push(Node::Text(text));
                }
                continue;
            }
            Token::Tag {
                kind, body, line, ..
            } => (kind, body, line),
        };

        match kind {
            TagKind::Comment => {}
            TagKind::Value => {
                let call = parse_call(template, body, line)?;
                current(&mut root, &mut stack).push(Node::Value { call, line });
            }
            TagKind::Partial => {
                let (name, context) = all_consuming(partial)(body)
                    .map(|(_, parsed)| parsed)
                    .map_err(|_| syntax(template, line, "invalid partial reference"))?;
                current(&mut root, &mut stack).push(Node::Partial {
                    name,
                    context,
                    line,
                });
            }
            TagKind::Open => {
                let call = parse_call(template, body, line)?;
                let name = block_name(template, &call, line)?;
                stack.push(Frame::new(call, name, line, false));
            }
            TagKind::Else => {
                let frame = stack
                    .last_mut()
                    .ok_or_else(|| syntax(template, line, "'else' outside of a block"))?;
                if frame.in_inverse {
                    return Err(syntax(template, line, "block already has an 'else'"));
                }
                frame.in_inverse = true;
                if !body.trim().is_empty() {
                    let call = parse_call(template, body, line)?;
                    block_name(template, &call, line)?;
                    let name = frame.name.clone();
                    stack.push(Frame::new(call, name, line, true));
                }
            }
            TagKind::Close => {
                let closing = body.trim();
                loop {
                    let frame = stack.pop().ok_or_else(|| {
                        syntax(template, line, format!("unexpected '{{{{/{}}}}}'", closing))
                    })?;
                    if frame.name != closing {
                        return Err(syntax(
                            template,
                            line,
                            format!(
                                "'{}' opened on line {} is closed by '{}'",
                                frame.name, frame.line, closing
                            ),
                        ));
                    }
                    let chained = frame.chained;
                    current(&mut root, &mut stack).push(Node::Block {
                        call: frame.call,
                        body: frame.body,
                        inverse: frame.inverse,
                        line: frame.line,
                    });
                    if !chained {
                        break;
                    }
                }
            }
        }
    }

    if let Some(frame) = stack.last() {
        return Err(syntax(
            template,
            frame.line,
            format!("'{}' is never closed", frame.name),
        ));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn path_expr(parents: usize, segments: &[&str]) -> Expr {
        Expr::Path(PathExpr {
            data: false,
            parents,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn text(s: &str) -> Node {
        Node::Text(s.into())
    }

    #[rstest]
    #[case("name", path_expr(0, &["name"]))]
    #[case("this", path_expr(0, &[]))]
    #[case(".", path_expr(0, &[]))]
    #[case("this.name", path_expr(0, &["name"]))]
    #[case("../../a/b", path_expr(2, &["a", "b"]))]
    #[case("\"quoted text\"", Expr::Literal(json!("quoted text")))]
    #[case("'single'", Expr::Literal(json!("single")))]
    #[case("-12", Expr::Literal(json!(-12)))]
    #[case("0x1F", Expr::Literal(json!(31)))]
    #[case("1.5", Expr::Literal(json!(1.5)))]
    #[case("true", Expr::Literal(json!(true)))]
    #[case("null", Expr::Literal(Value::Null))]
    fn params(#[case] input: &str, #[case] expected: Expr) {
        assert_eq!(all_consuming(param)(input).map(|(_, e)| e), Ok(expected));
    }

    #[test]
    fn data_paths() {
        let (_, parsed) = all_consuming(param)("@root.items").unwrap();
        assert_eq!(
            parsed,
            Expr::Path(PathExpr {
                data: true,
                parents: 0,
                segments: vec!["root".into(), "items".into()],
            })
        );
    }

    #[test]
    fn calls_with_hash_and_sub_expressions() {
        let call = parse_call("t", " pad (concat a \"-\") width=4 ", 1).unwrap();
        assert_eq!(call.helper_name(), Some("pad"));
        assert_eq!(call.params.len(), 1);
        assert_eq!(
            call.params[0],
            Expr::SubExpr(Box::new(Call {
                head: path_expr(0, &["concat"]),
                params: vec![path_expr(0, &["a"]), Expr::Literal(json!("-"))],
                hash: vec![],
            }))
        );
        assert_eq!(call.hash, vec![("width".into(), Expr::Literal(json!(4)))]);
    }

    #[test]
    fn identifiers_starting_with_digits_are_paths() {
        let call = parse_call("t", "2x", 1).unwrap();
        assert_eq!(call.head, path_expr(0, &["2x"]));
    }

    #[test]
    fn standalone_block_lines_disappear() {
        let nodes = parse_nodes("t", "a\n  {{#if x}}\n  b\n  {{/if}}\nc\n").unwrap();
        assert_eq!(
            nodes,
            vec![
                text("a\n"),
                Node::Block {
                    call: Call {
                        head: path_expr(0, &["if"]),
                        params: vec![path_expr(0, &["x"])],
                        hash: vec![],
                    },
                    body: vec![text("  b\n")],
                    inverse: vec![],
                    line: 2,
                },
                text("c\n"),
            ]
        );
    }

    #[test]
    fn inline_blocks_keep_whitespace() {
        let nodes = parse_nodes("t", "a {{#if x}} b {{/if}} c").unwrap();
        assert_eq!(nodes.first(), Some(&text("a ")));
        assert_eq!(nodes.last(), Some(&text(" c")));
    }

    #[test]
    fn tilde_strips_surrounding_whitespace() {
        let nodes = parse_nodes("t", "a  \n {{~v~}} \n b").unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], text("a"));
        assert_eq!(nodes[2], text("b"));
    }

    #[test]
    fn comments_may_contain_braces() {
        let nodes = parse_nodes("t", "x{{!-- {{nothing}} --}}y{{! short }}z").unwrap();
        assert_eq!(nodes, vec![text("x"), text("y"), text("z")]);
    }

    #[test]
    fn else_if_chains_close_together() {
        let nodes = parse_nodes("t", "{{#if a}}1{{else if b}}2{{else}}3{{/if}}").unwrap();
        let [Node::Block { inverse, .. }] = nodes.as_slice() else {
            panic!("expected a single block: {:?}", nodes);
        };
        let [Node::Block { body, inverse, .. }] = inverse.as_slice() else {
            panic!("expected a chained block: {:?}", inverse);
        };
        assert_eq!(body, &vec![text("2")]);
        assert_eq!(inverse, &vec![text("3")]);
    }

    #[test]
    fn partials() {
        let nodes = parse_nodes("t", "{{> header}}{{> \"a b\" this.x}}").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Partial {
                    name: "header".into(),
                    context: None,
                    line: 1,
                },
                Node::Partial {
                    name: "a b".into(),
                    context: Some(path_expr(0, &["x"])),
                    line: 1,
                },
            ]
        );
    }

    #[rstest]
    #[case("{{#if a}}", "'if' is never closed")]
    #[case("{{#if a}}{{/each}}", "'if' opened on line 1 is closed by 'each'")]
    #[case("{{/if}}", "unexpected '{{/if}}'")]
    #[case("{{else}}", "'else' outside of a block")]
    #[case("{{#if a}}{{else}}{{else}}{{/if}}", "block already has an 'else'")]
    #[case("{{name", "unterminated tag")]
    #[case("{{a b=}}", "invalid expression 'a b='")]
    fn syntax_errors(#[case] source: &str, #[case] message: &str) {
        match parse_nodes("t", source) {
            Err(TemplateError::Syntax { message: m, .. }) => assert_eq!(m, message),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn errors_carry_the_line() {
        let err = parse_nodes("file.zapt", "one\ntwo\n{{#each x}}").unwrap_err();
        assert_eq!(err.to_string(), "file.zapt:3: 'each' is never closed");
    }
}
