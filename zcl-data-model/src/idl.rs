use std::collections::HashSet;

use miette::{Diagnostic, NamedSource, SourceSpan};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while, take_while1},
    character::complete::{digit1, hex_digit1, multispace1, one_of, space1},
    combinator::{map, opt, recognize, value, verify},
    error::ErrorKind,
    multi::{many0, separated_list0},
    sequence::{delimited, preceded, tuple},
    IResult, Parser,
};
use nom_greedyerror::GreedyError;
use nom_locate::LocatedSpan;
use nom_supreme::ParserExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    AccessPrivilege, ApiMaturity, Attribute, AttributeRequirement, Bitmap, Cluster,
    ClusterExtension, ClusterRequirement, Command, ConstantEntry, DataType, DefaultAttributeValue,
    Definition, DeviceType, Enum, Event, EventPriority, Feature, FeatureRequirement, Field, Side,
    Struct, StructField, StructType,
};

// easier to type and not move str around
pub type Span<'a> = LocatedSpan<&'a str>;
pub type ParseError<'a> = GreedyError<Span<'a>, ErrorKind>;

/// Fetch the deepest location of an error within an error type
pub trait DeepestIndex {
    fn depest_index(&self) -> Option<usize>;
}

impl<E> DeepestIndex for nom::Err<E>
where
    E: DeepestIndex,
{
    fn depest_index(&self) -> Option<usize> {
        match self {
            nom::Err::Error(e) => e.depest_index(),
            nom::Err::Failure(e) => e.depest_index(),
            nom::Err::Incomplete(_) => None,
        }
    }
}

impl DeepestIndex for GreedyError<Span<'_>, ErrorKind> {
    fn depest_index(&self) -> Option<usize> {
        self.errors.iter().map(|(p, _k)| p.location_offset()).max()
    }
}

/// Keep track of the deepest error encoutered
#[derive(Debug, PartialEq, Clone)]
struct DeepestError<E> {
    deepest: Option<(usize, E)>,
}

impl<E> DeepestError<E>
where
    E: DeepestIndex + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self { deepest: None }
    }

    pub fn or(self, e: E) -> E {
        match self.deepest {
            Some((_, myerror)) => myerror,
            None => e,
        }
    }

    pub fn intercept<O>(&mut self, data: Result<O, E>) -> Result<O, E> {
        if let Err(ref e) = data {
            if let Some(depth) = e.depest_index() {
                let current_depth = self.deepest.as_ref().map(|(d, _)| *d).unwrap_or(0);
                if current_depth < depth {
                    self.deepest = Some((depth, e.clone()));
                }
            };
        }
        data
    }
}

/// A parser that CANNOT fail
///
/// Note that it will consume no input if no maturity is specified
/// in which case it returns 'STABLE'
///
/// Examples:
///
/// ```
/// use zcl_data_model::ApiMaturity;
/// use zcl_data_model::idl::api_maturity;
///
/// assert_eq!(
///    api_maturity("123".into()),
///    Ok(("123".into(), ApiMaturity::Stable))
/// );
///
/// let result = api_maturity("provisional 123".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), " 123");
/// assert_eq!(result.1, ApiMaturity::Provisional);
/// ```
pub fn api_maturity(span: Span) -> IResult<Span, ApiMaturity, ParseError> {
    for (keyword, maturity) in [
        ("stable", ApiMaturity::Stable),
        ("provisional", ApiMaturity::Provisional),
        ("internal", ApiMaturity::Internal),
        ("deprecated", ApiMaturity::Deprecated),
    ] {
        if let Ok((rest, _)) = tag_no_case::<_, _, ()>(keyword).parse(span) {
            return Ok((rest, maturity));
        }
    }

    Ok((span, ApiMaturity::Stable))
}

/// Parses a hex-formated integer
///
/// Examples:
///
/// ```
/// use zcl_data_model::idl::hex_integer;
///
/// let result = hex_integer("0x12 abc".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), " abc");
/// assert_eq!(result.1, 0x12);
///
/// let result = hex_integer("0X12abctest".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), "test");
/// assert_eq!(result.1, 0x12abc);
/// ```
pub fn hex_integer(span: Span) -> IResult<Span, u64, ParseError> {
    verify(hex_digit1::<Span, ParseError>, |r: &Span| {
        u64::from_str_radix(r.fragment(), 16).is_ok()
    })
    .preceded_by(tag_no_case("0x"))
    .map(|r| u64::from_str_radix(r.fragment(), 16).unwrap_or_default())
    .parse(span)
}

/// Parses a decimal-formated integer
///
/// Examples:
///
/// ```
/// use zcl_data_model::idl::decimal_integer;
///
/// let result = decimal_integer("12 abc".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), " abc");
/// assert_eq!(result.1, 12);
///
/// assert!(decimal_integer("99999999999999999999999".into()).is_err());
/// ```
pub fn decimal_integer(span: Span) -> IResult<Span, u64, ParseError> {
    verify(digit1::<Span, ParseError>, |s: &Span| {
        s.fragment().parse::<u64>().is_ok()
    })
    .map(|s| s.fragment().parse::<u64>().unwrap_or_default())
    .parse(span)
}

/// Parses a positive integer (hex or decimal)
///
/// Examples:
///
/// ```
/// use zcl_data_model::idl::positive_integer;
///
/// let result = positive_integer("12abctest".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), "abctest");
/// assert_eq!(result.1, 12);
///
/// let result = positive_integer("0x12abctest".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), "test");
/// assert_eq!(result.1, 0x12abc);
/// ```
pub fn positive_integer(span: Span) -> IResult<Span, u64, ParseError> {
    // hex first, so that 0x123 is not 0 followed by "x123"
    if let Ok(r) = hex_integer.parse(span) {
        return Ok(r);
    }
    decimal_integer.parse(span)
}

/// Parses a possibly negative integer. Positive values may be hex.
///
/// ```
/// use zcl_data_model::idl::signed_integer;
///
/// assert_eq!(signed_integer("-12".into()).expect("Valid").1, -12);
/// assert_eq!(signed_integer("0x10".into()).expect("Valid").1, 16);
/// ```
pub fn signed_integer(span: Span) -> IResult<Span, i64, ParseError> {
    if let Ok((rest, n)) = positive_integer.parse(span) {
        if let Ok(n) = i64::try_from(n) {
            return Ok((rest, n));
        }
    }
    nom::character::complete::i64.parse(span)
}

/// Represents a comment (i.e. something between `/** ... */`)
///
/// Typically placed before some element (e.g. cluster or command) to serve
/// as documentation for it.
///
/// Parsing whitespace yields doc-comments if the last comment in a whitespace
/// sequence is a doc comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocComment<'a>(pub &'a str);

/// Information returned while parsing whitespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Whitespace<'a> {
    DocComment(&'a str), // /** ... */
    CppComment(&'a str), // /* ... */ (and NOT a doc comment)
    CComment(&'a str),   // // ....
    Whitespace(&'a str), // general newline/space/tab
}

/// Parses whitespace (space/tab/newline and comments).
///
/// returns the content of the comment
pub fn whitespace_group(span: Span) -> IResult<Span, Whitespace<'_>, ParseError> {
    // NOTE: split into cases intentional. Whitespace is parsed very often
    // and an `alt` here is measurably slower.

    if let Ok((span, c)) = preceded(tag::<_, _, ()>("//"), is_not("\n\r")).parse(span) {
        return Ok((span, Whitespace::CComment(c.fragment())));
    }

    // an empty `//` line comment
    if let Ok((span, _)) = tag::<_, _, ()>("//").parse(span) {
        return Ok((span, Whitespace::CComment("")));
    }

    if let Ok((span, cpp)) =
        delimited(tag::<_, _, ()>("/*"), take_until("*/"), tag("*/")).parse(span)
    {
        return Ok((
            span,
            if cpp.starts_with('*') {
                Whitespace::DocComment(&cpp.fragment()[1..])
            } else {
                Whitespace::CppComment(cpp.fragment())
            },
        ));
    }

    multispace1
        .map(|c: Span| Whitespace::Whitespace(c.fragment()))
        .parse(span)
}

/// Parses 0 or more whitespaces.
/// It can NEVER fail.
///
/// If the last comment whitespace is a doc-comment, returns
/// that doc-comment.
///
/// Examples:
///
/// ```
/// use zcl_data_model::idl::{whitespace0, DocComment};
///
/// let result = whitespace0(" /*comment*/\n12 abc".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), "12 abc");
/// assert_eq!(result.1, None);
///
/// let result = whitespace0(" /**doc comment*/\n abc".into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), "abc");
/// assert_eq!(result.1, Some(DocComment("doc comment")));
/// ```
pub fn whitespace0(span: Span) -> IResult<Span, Option<DocComment>, ParseError> {
    // early bail out if it cannot be whitespace
    match span.chars().next() {
        Some('\r' | '\n' | '\t' | ' ' | '/') => (),
        _ => return Ok((span, None)),
    }

    let mut rest = span;
    let mut doc = None;
    while let Ok((tail, whitespace)) = whitespace_group(rest) {
        rest = tail;
        match whitespace {
            Whitespace::DocComment(comment) => doc = Some(DocComment(comment)),
            Whitespace::CComment(_) | Whitespace::CppComment(_) => doc = None,
            Whitespace::Whitespace(_) => {}
        }
    }
    Ok((rest, doc))
}

/// Parses at least one whitespace
/// If the last comment whitespace is a doccomment, then
/// It returns that doc comment.
///
/// ```
/// use zcl_data_model::idl::whitespace1;
///
/// assert!(whitespace1("abc".into()).is_err());
/// assert_eq!(whitespace1(" // c\n abc".into()).expect("Valid").0.fragment().to_string(), "abc");
/// ```
pub fn whitespace1(span: Span) -> IResult<Span, Option<DocComment>, ParseError> {
    let parsed = whitespace0(span)?;

    if span == parsed.0 {
        // this WILL fail, using it as such just to get a proper error
        space1::<_, ParseError>(span)?;
    }

    Ok(parsed)
}

/// Parses a name id, of the form /[a-zA-Z_][a-zA-Z0-9_]*/
pub fn parse_id(span: Span) -> IResult<Span, &str, ParseError> {
    let valid_first = |c: char| c.is_ascii_alphabetic() || c == '_';
    let valid_second = |c: char| c.is_ascii_alphanumeric() || c == '_';
    map(
        recognize(tuple((take_while1(valid_first), take_while(valid_second)))),
        |data: Span| *data.fragment(),
    )(span)
}

/// Parses a double-quoted string, unescaping `\"`, `\\`, `\n`, `\r` and `\t`.
///
/// ```
/// use zcl_data_model::idl::quoted_string;
///
/// let result = quoted_string(r#""a \"b\"" rest"#.into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), " rest");
/// assert_eq!(result.1, "a \"b\"");
/// ```
pub fn quoted_string(span: Span) -> IResult<Span, String, ParseError> {
    let (mut span, _) = tag("\"").parse(span)?;
    let mut result = String::new();

    loop {
        let (rest, data) = take_while(|c| c != '\"' && c != '\\').parse(span)?;
        result.push_str(data.fragment());

        let (rest, ch) = one_of("\"\\").parse(rest)?;
        if ch == '"' {
            return Ok((rest, result));
        }

        let (rest, escaped) = one_of(r#""\nrt"#)
            .map(|c| match c {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            })
            .parse(rest)?;

        result.push(escaped);
        span = rest;
    }
}

/// Parses a `conformance "<expr>"` clause. Does NOT consume leading whitespace.
///
/// ```
/// use zcl_data_model::idl::conformance_clause;
///
/// let result = conformance_clause(r#"conformance "LT & !DF";"#.into()).expect("Valid");
/// assert_eq!(result.0.fragment().to_string(), ";");
/// assert_eq!(result.1, "LT & !DF");
/// ```
pub fn conformance_clause(span: Span) -> IResult<Span, String, ParseError> {
    quoted_string
        .preceded_by(tuple((tag_no_case("conformance"), whitespace0)))
        .parse(span)
}

fn optional_conformance(span: Span) -> IResult<Span, Option<String>, ParseError> {
    opt(conformance_clause.preceded_by(whitespace1)).parse(span)
}

/// Parses a IDL representation of a constant entry.
///
/// Consumes any whitespace BEFORE the entry.
///
/// Examples:
///
/// ```
/// use zcl_data_model::{ConstantEntry, ApiMaturity};
/// use zcl_data_model::idl::constant_entry;
///
/// let parsed = constant_entry("provisional kConstant = 0x123 ;".into()).expect("valid");
/// assert_eq!(parsed.0.fragment().to_string(), "");
/// assert_eq!(
///         parsed.1,
///         ConstantEntry {
///             id: "kConstant".into(),
///             code: 0x123,
///             maturity: ApiMaturity::Provisional
///         }
/// );
/// ```
pub fn constant_entry(span: Span) -> IResult<Span, ConstantEntry, ParseError> {
    tuple((
        whitespace0,
        api_maturity,
        whitespace0,
        parse_id,
        whitespace0,
        tag("="),
        whitespace0,
        positive_integer,
        whitespace0,
        tag(";"),
    ))
    .map(|(_, maturity, _, id, _, _, _, code, _, _)| ConstantEntry {
        maturity,
        id: id.into(),
        code,
    })
    .parse(span)
}

/// Parses a list of constant entries, delimeted by "{" "}".
fn constant_entries_list(span: Span) -> IResult<Span, Vec<ConstantEntry>, ParseError> {
    delimited(
        tag("{"),
        many0(constant_entry),
        tuple((whitespace0, tag("}"))),
    )
    .parse(span)
}

/// `<keyword> Name : base { entries }` shared by enums and bitmaps
fn constant_declaration<'a>(
    keyword: &'static str,
    span: Span<'a>,
) -> IResult<Span<'a>, (&'a str, &'a str, Vec<ConstantEntry>), ParseError<'a>> {
    tuple((
        tag_no_case(keyword),
        whitespace1,
        parse_id,
        whitespace0,
        tag(":"),
        whitespace0,
        parse_id,
        whitespace0,
        constant_entries_list,
    ))
    .map(|(_, _, id, _, _, _, base_type, _, entries)| (id, base_type, entries))
    .parse(span)
}

pub fn parse_enum(span: Span) -> IResult<Span, Enum, ParseError> {
    let (span, comment) = whitespace0(span)?;
    let doc_comment = comment.map(|DocComment(comment)| comment);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_enum_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_enum_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Enum, ParseError<'a>> {
    let (span, (id, base_type, entries)) = constant_declaration("enum", span)?;
    Ok((
        span,
        Enum {
            doc_comment: doc_comment.map(|x| x.into()),
            maturity,
            id: id.into(),
            base_type: base_type.into(),
            entries,
        },
    ))
}

pub fn parse_bitmap(span: Span) -> IResult<Span, Bitmap, ParseError> {
    let (span, comment) = whitespace0(span)?;
    let doc_comment = comment.map(|DocComment(comment)| comment);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_bitmap_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_bitmap_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Bitmap, ParseError<'a>> {
    let (span, (id, base_type, entries)) = constant_declaration("bitmap", span)?;
    Ok((
        span,
        Bitmap {
            doc_comment: doc_comment.map(|c| c.into()),
            maturity,
            id: id.into(),
            base_type: base_type.into(),
            entries,
        },
    ))
}

/// Parses `type<len> name[] = code`
pub fn parse_field(span: Span) -> IResult<Span, Field, ParseError> {
    tuple((
        whitespace0,
        parse_id,
        opt(delimited(
            tuple((whitespace0, tag("<"), whitespace0)),
            positive_integer,
            tuple((whitespace0, tag(">"))),
        )),
        whitespace1,
        parse_id,
        whitespace0,
        opt(tuple((tag("["), whitespace0, tag("]"), whitespace0))),
        tag("="),
        whitespace0,
        positive_integer,
    ))
    .map(
        |(_, type_name, max_length, _, id, _, list_marker, _, _, code)| Field {
            data_type: DataType {
                name: type_name.into(),
                is_list: list_marker.is_some(),
                max_length,
            },
            id: id.into(),
            code,
        },
    )
    .parse(span)
}

/// Grabs a tag set which are whitespace-separated list of items
///
/// Evaluates to the remaining span and the (lowercased) set of tags found.
macro_rules! tags_set {
    ($span:ident, $($tags:expr),+) => {{
        let mut result: HashSet<String> = HashSet::new();
        let mut rest = $span;
        loop {
           let mut element_start = rest;
           if !result.is_empty() {
               match whitespace1.parse(element_start) {
                   Ok((p, _)) => element_start = p,
                   Err(_) => break,
               }
           }

           $(
           if let Ok((tail, tag)) = tuple((
                   nom::bytes::complete::tag_no_case::<_, _, ()>($tags),
                   nom::combinator::not(nom::character::complete::satisfy(|c: char| c.is_ascii_alphanumeric() || c == '_')),
               )).parse(element_start) {
               rest = tail;
               result.insert(tag.0.fragment().to_ascii_lowercase());
               continue;
           } else
           )+
           {
              break;
           }
        }
        (rest, result)
    }
    };
}

pub fn parse_struct_field(span: Span) -> IResult<Span, StructField, ParseError> {
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;
    let (span, attributes) = tags_set!(span, "optional", "nullable", "fabric_sensitive");

    let (span, field) = parse_field(span)?;

    Ok((
        span,
        StructField {
            field,
            maturity,
            is_optional: attributes.contains("optional"),
            is_nullable: attributes.contains("nullable"),
            is_fabric_sensitive: attributes.contains("fabric_sensitive"),
        },
    ))
}

fn struct_fields(span: Span) -> IResult<Span, Vec<StructField>, ParseError> {
    delimited(
        tag("{"),
        many0(delimited(
            whitespace0,
            parse_struct_field,
            tuple((whitespace0, tag(";"))),
        )),
        tuple((whitespace0, tag("}"))),
    )
    .parse(span)
}

pub fn parse_struct(span: Span) -> IResult<Span, Struct, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_struct_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_struct_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Struct, ParseError<'a>> {
    let (span, kind) = tags_set!(span, "request", "response", "fabric_scoped");

    let (span, id) = delimited(
        tuple((whitespace0, tag_no_case("struct"), whitespace1)),
        parse_id,
        whitespace0,
    )
    .parse(span)?;

    let (span, struct_type) = if kind.contains("response") {
        tuple((tag("="), whitespace0, positive_integer, whitespace0))
            .map(|(_, _, code, _)| StructType::Response(code))
            .parse(span)?
    } else if kind.contains("request") {
        (span, StructType::Request)
    } else {
        (span, StructType::Regular)
    };

    let (span, fields) = struct_fields(span)?;

    Ok((
        span,
        Struct {
            doc_comment: doc_comment.map(|c| c.into()),
            maturity,
            struct_type,
            id: id.into(),
            fields,
            is_fabric_scoped: kind.contains("fabric_scoped"),
        },
    ))
}

pub fn access_privilege(span: Span) -> IResult<Span, AccessPrivilege, ParseError> {
    if let Ok((span, _)) = tag_no_case::<_, _, ()>("view").parse(span) {
        return Ok((span, AccessPrivilege::View));
    }
    if let Ok((span, _)) = tag_no_case::<_, _, ()>("operate").parse(span) {
        return Ok((span, AccessPrivilege::Operate));
    }
    if let Ok((span, _)) = tag_no_case::<_, _, ()>("manage").parse(span) {
        return Ok((span, AccessPrivilege::Manage));
    }

    value(AccessPrivilege::Administer, tag_no_case("administer")).parse(span)
}

pub fn event_priority(span: Span) -> IResult<Span, EventPriority, ParseError> {
    if let Ok((span, _)) = tag_no_case::<_, _, ()>("info").parse(span) {
        return Ok((span, EventPriority::Info));
    }

    if let Ok((span, _)) = tag_no_case::<_, _, ()>("critical").parse(span) {
        return Ok((span, EventPriority::Critical));
    }

    value(EventPriority::Debug, tag_no_case("debug")).parse(span)
}

/// `access(<kind>: <privilege>)` with a single privilege kind
fn single_access<'a>(
    kind: &'static str,
    default: AccessPrivilege,
    span: Span<'a>,
) -> IResult<Span<'a>, AccessPrivilege, ParseError<'a>> {
    opt(delimited(
        tuple((
            whitespace0,
            tag_no_case("access"),
            whitespace0,
            tag("("),
            whitespace0,
            tag_no_case(kind),
            tag(":"),
            whitespace0,
        )),
        access_privilege,
        tuple((whitespace0, tag(")"))),
    ))
    .map(|p| p.unwrap_or(default))
    .parse(span)
}

pub fn parse_event(span: Span) -> IResult<Span, Event, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_event_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_event_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Event, ParseError<'a>> {
    let (span, qualities) = tags_set!(span, "fabric_sensitive", "optional", "client");

    tuple((
        preceded(whitespace0, event_priority),
        whitespace1,
        tag_no_case("event"),
        |s: Span<'a>| single_access("read", AccessPrivilege::View, s),
        preceded(whitespace0, parse_id),
        preceded(
            tuple((whitespace0, tag("="), whitespace0)),
            positive_integer,
        ),
        preceded(whitespace0, struct_fields),
        optional_conformance,
        opt(tuple((whitespace0, tag(";")))),
    ))
    .map(
        |(priority, _, _, access, id, code, fields, conformance, _)| Event {
            doc_comment: doc_comment.map(|c| c.into()),
            maturity,
            priority,
            access,
            id: id.into(),
            code,
            fields,
            side: if qualities.contains("client") {
                Side::Client
            } else {
                Side::Server
            },
            is_optional: qualities.contains("optional"),
            is_fabric_sensitive: qualities.contains("fabric_sensitive"),
            conformance,
        },
    )
    .parse(span)
}

pub fn parse_command(span: Span) -> IResult<Span, Command, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_command_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_command_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Command, ParseError<'a>> {
    let (span, qualities) = tags_set!(span, "timed", "fabric", "client", "server", "optional");

    tuple((
        tuple((whitespace0, tag_no_case("command"))),
        |s: Span<'a>| single_access("invoke", AccessPrivilege::Operate, s),
        whitespace0,
        parse_id,
        tuple((whitespace0, tag("("), whitespace0)),
        opt(parse_id),
        tuple((whitespace0, tag(")"), whitespace0, tag(":"), whitespace0)),
        parse_id,
        tuple((whitespace0, tag("="), whitespace0)),
        positive_integer,
        optional_conformance,
        tuple((whitespace0, tag(";"))),
    ))
    .map(
        |(_, access, _, id, _, input, _, output, _, code, conformance, _)| Command {
            doc_comment: doc_comment.map(|c| c.into()),
            maturity,
            access,
            id: id.into(),
            input: input.map(|i| i.into()),
            output: output.into(),
            code,
            source: if qualities.contains("server") {
                Side::Server
            } else {
                Side::Client
            },
            is_optional: qualities.contains("optional"),
            is_timed: qualities.contains("timed"),
            is_fabric_scoped: qualities.contains("fabric"),
            conformance,
        },
    )
    .parse(span)
}

// Returns read & write access,
// CANNOT fail (returns defaults if it fails)
fn attribute_access(span: Span) -> IResult<Span, (AccessPrivilege, AccessPrivilege), ParseError> {
    let (span, tags) = opt(delimited(
        tuple((
            whitespace0,
            tag_no_case("access"),
            whitespace0,
            tag("("),
            whitespace0,
        )),
        separated_list0(
            tuple((whitespace0, tag(","), whitespace0)),
            tuple((
                whitespace0,
                alt((
                    value(true, tag_no_case("read")),
                    value(false, tag_no_case("write")),
                )),
                whitespace0,
                tag(":"),
                whitespace0,
                access_privilege,
                whitespace0,
            ))
            .map(|(_, is_read, _, _, _, v, _)| (is_read, v)),
        ),
        tuple((whitespace0, tag(")"))),
    ))
    .parse(span)?;

    let mut read_acl = AccessPrivilege::View;
    let mut write_acl = AccessPrivilege::Operate;

    for (is_read, privilege) in tags.unwrap_or_default() {
        if is_read {
            read_acl = privilege;
        } else {
            write_acl = privilege;
        }
    }

    Ok((span, (read_acl, write_acl)))
}

/// Parses a default attribute value.
///
/// Does NOT consume leading spaces or spaces after the value
pub fn default_attribute_value(span: Span) -> IResult<Span, DefaultAttributeValue, ParseError> {
    let mut deepest_error = DeepestError::new();

    // make sure we have some default before trying to parse
    let (span, _) = deepest_error.intercept(
        tuple((tag_no_case("default"), whitespace0, tag("="), whitespace0)).parse(span),
    )?;

    if let Ok((rest, n)) = deepest_error.intercept(positive_integer.parse(span)) {
        return Ok((rest, DefaultAttributeValue::Number(n)));
    }

    if let Ok((rest, n)) = deepest_error.intercept(nom::character::complete::i64.parse(span)) {
        return Ok((rest, DefaultAttributeValue::Signed(n)));
    }

    if let Ok((rest, _)) = deepest_error.intercept(tag_no_case("true").parse(span)) {
        return Ok((rest, DefaultAttributeValue::Bool(true)));
    }

    if let Ok((rest, _)) = deepest_error.intercept(tag_no_case("false").parse(span)) {
        return Ok((rest, DefaultAttributeValue::Bool(false)));
    }

    match quoted_string.parse(span) {
        Ok((rest, s)) => Ok((rest, DefaultAttributeValue::String(s))),
        Err(e) => Err(deepest_error.or(e)),
    }
}

pub fn parse_attribute(span: Span) -> IResult<Span, Attribute, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_attribute_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_attribute_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Attribute, ParseError<'a>> {
    let (span, qualities) = tags_set!(
        span,
        "readonly",
        "nosubscribe",
        "timedwrite",
        "client",
        "reportable"
    );

    let (mut span, (_, (read_acl, write_acl), _, field)) = tuple((
        tuple((whitespace0, tag_no_case("attribute"), whitespace1)),
        attribute_access,
        whitespace0,
        parse_struct_field,
    ))
    .parse(span)?;

    let mut attribute = Attribute {
        doc_comment: doc_comment.map(|c| c.into()),
        maturity,
        field,
        read_acl,
        write_acl,
        side: if qualities.contains("client") {
            Side::Client
        } else {
            Side::Server
        },
        is_read_only: qualities.contains("readonly"),
        is_no_subscribe: qualities.contains("nosubscribe"),
        is_timed_write: qualities.contains("timedwrite"),
        is_reportable: qualities.contains("reportable"),
        ..Default::default()
    };

    // trailing clauses, in any order
    let mut deepest_error = DeepestError::new();
    loop {
        let Ok((rest, _)) = whitespace1.parse(span) else {
            break;
        };

        if let Ok((tail, v)) = deepest_error.intercept(default_attribute_value(rest)) {
            attribute.default = Some(v);
            span = tail;
        } else if let Ok((tail, n)) = deepest_error.intercept(
            signed_integer
                .preceded_by(tuple((tag_no_case("min"), whitespace1)))
                .parse(rest),
        ) {
            attribute.min = Some(n);
            span = tail;
        } else if let Ok((tail, n)) = deepest_error.intercept(
            signed_integer
                .preceded_by(tuple((tag_no_case("max"), whitespace1)))
                .parse(rest),
        ) {
            attribute.max = Some(n);
            span = tail;
        } else if let Ok((tail, c)) = deepest_error.intercept(conformance_clause(rest)) {
            attribute.conformance = Some(c);
            span = tail;
        } else {
            break;
        }
    }

    match value(attribute, tuple((whitespace0, tag(";")))).parse(span) {
        Ok(r) => Ok(r),
        Err(e) => Err(deepest_error.or(e)),
    }
}

/// Parses `feature <Name> <CODE> = <bit> [conformance "<expr>"];`
pub fn parse_feature(span: Span) -> IResult<Span, Feature, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);
    let (span, maturity) = delimited(whitespace0, api_maturity, whitespace0).parse(span)?;

    parse_feature_after_doc_maturity(doc_comment, maturity, span)
}

fn parse_feature_after_doc_maturity<'a>(
    doc_comment: Option<&str>,
    maturity: ApiMaturity,
    span: Span<'a>,
) -> IResult<Span<'a>, Feature, ParseError<'a>> {
    tuple((
        tag_no_case("feature"),
        preceded(whitespace1, parse_id),
        preceded(whitespace1, parse_id),
        preceded(
            tuple((whitespace0, tag("="), whitespace0)),
            verify(positive_integer, |bit: &u64| *bit < 64),
        ),
        optional_conformance,
        tuple((whitespace0, tag(";"))),
    ))
    .map(|(_, name, code, bit, conformance, _)| Feature {
        doc_comment: doc_comment.map(|c| c.into()),
        maturity,
        name: name.into(),
        code: code.into(),
        bit: bit as u8,
        conformance,
    })
    .parse(span)
}

/// `<keyword> <value>;` statements inside a cluster or device type body
fn statement<'a, O>(
    keyword: &'static str,
    parser: impl Parser<Span<'a>, O, ParseError<'a>>,
) -> impl Parser<Span<'a>, O, ParseError<'a>> {
    parser
        .preceded_by(tuple((tag_no_case(keyword), whitespace1)))
        .terminated(tuple((whitespace0, tag(";"))))
}

/// Turns a `response struct` into the server sourced command it describes.
fn response_command(s: &Struct, conformance: Option<String>) -> Option<Command> {
    let StructType::Response(code) = s.struct_type else {
        return None;
    };
    Some(Command {
        doc_comment: s.doc_comment.clone(),
        maturity: s.maturity,
        id: s.id.clone(),
        output: "DefaultSuccess".into(),
        code,
        source: Side::Server,
        is_fabric_scoped: s.is_fabric_scoped,
        conformance,
        ..Default::default()
    })
}

fn parse_cluster_member<'a>(c: &mut Cluster, span: Span<'a>) -> Option<Span<'a>> {
    let (span, (doc_comment, maturity, _)) = tuple((
        whitespace0.map(|o| o.map(|DocComment(s)| s)),
        api_maturity,
        whitespace0,
    ))
    .parse(span)
    .ok()?;

    if let Ok((rest, revision)) = statement("revision", positive_integer).parse(span) {
        c.revision = revision;
        return Some(rest);
    }
    if let Ok((rest, domain)) = statement("domain", quoted_string).parse(span) {
        c.domain = Some(domain);
        return Some(rest);
    }
    if let Ok((rest, code)) = statement("manufacturer", positive_integer).parse(span) {
        c.manufacturer_code = Some(code);
        return Some(rest);
    }
    if let Ok((rest, define)) = statement("define", parse_id).parse(span) {
        c.define = Some(define.into());
        return Some(rest);
    }
    if let Ok((rest, b)) = parse_bitmap_after_doc_maturity(doc_comment, maturity, span) {
        c.bitmaps.push(b);
        return Some(rest);
    }
    if let Ok((rest, e)) = parse_enum_after_doc_maturity(doc_comment, maturity, span) {
        c.enums.push(e);
        return Some(rest);
    }
    if let Ok((rest, f)) = parse_feature_after_doc_maturity(doc_comment, maturity, span) {
        c.features.push(f);
        return Some(rest);
    }
    if let Ok((rest, s)) = parse_struct_after_doc_maturity(doc_comment, maturity, span) {
        let (rest, conformance) = optional_conformance(rest).ok()?;
        if let Some(cmd) = response_command(&s, conformance) {
            c.commands.push(cmd);
        }
        c.structs.push(s);
        return Some(rest);
    }
    if let Ok((rest, a)) = parse_attribute_after_doc_maturity(doc_comment, maturity, span) {
        c.attributes.push(a);
        return Some(rest);
    }
    if let Ok((rest, cmd)) = parse_command_after_doc_maturity(doc_comment, maturity, span) {
        c.commands.push(cmd);
        return Some(rest);
    }
    if let Ok((rest, e)) = parse_event_after_doc_maturity(doc_comment, maturity, span) {
        c.events.push(e);
        return Some(rest);
    }
    None
}

/// Parses cluster members up to (and including) the closing `}`
fn cluster_body<'a>(cluster: &mut Cluster, span: Span<'a>) -> IResult<Span<'a>, (), ParseError<'a>> {
    let (mut span, _) = tag("{").parse(span)?;
    while let Some(rest) = parse_cluster_member(cluster, span) {
        span = rest;
    }
    value((), tuple((whitespace0, tag("}")))).parse(span)
}

pub fn parse_cluster(span: Span) -> IResult<Span, Cluster, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;
    let doc_comment = doc_comment.map(|DocComment(s)| s);

    let (span, maturity) = tuple((api_maturity, whitespace0))
        .map(|(m, _)| m)
        .parse(span)?;

    let (span, mut cluster) = delimited(
        tuple((tag_no_case("cluster"), whitespace1)),
        tuple((
            parse_id,
            whitespace0,
            tag("="),
            whitespace0,
            positive_integer,
        )),
        whitespace0,
    )
    .map(|(id, _, _, _, code)| Cluster {
        doc_comment: doc_comment.map(|c| c.into()),
        maturity,
        id: id.into(),
        code,
        ..Default::default()
    })
    .parse(span)?;

    let (span, _) = cluster_body(&mut cluster, span)?;
    Ok((span, cluster))
}

/// Parses `extend cluster <Name> { members }`
pub fn parse_cluster_extension(span: Span) -> IResult<Span, ClusterExtension, ParseError> {
    let (span, name) = parse_id
        .preceded_by(tuple((
            whitespace0,
            tag_no_case("extend"),
            whitespace1,
            tag_no_case("cluster"),
            whitespace1,
        )))
        .terminated(whitespace0)
        .parse(span)?;

    let mut members = Cluster::default();
    let (span, _) = cluster_body(&mut members, span)?;

    Ok((
        span,
        ClusterExtension {
            cluster: name.into(),
            structs: members.structs,
            attributes: members.attributes,
            commands: members.commands,
            events: members.events,
        },
    ))
}

enum Requirement {
    Attribute(AttributeRequirement),
    Command(String),
    Feature(FeatureRequirement),
}

fn requirement(span: Span) -> IResult<Span, Requirement, ParseError> {
    let (span, _) = tuple((tag_no_case("requires"), whitespace1)).parse(span)?;

    alt((
        tuple((
            parse_id.preceded_by(tuple((tag_no_case("attribute"), whitespace1))),
            opt(tag_no_case("reportable").preceded_by(whitespace1)),
        ))
        .map(|(name, reportable)| {
            Requirement::Attribute(AttributeRequirement {
                name: name.into(),
                is_reportable: reportable.is_some(),
            })
        }),
        parse_id
            .preceded_by(tuple((tag_no_case("command"), whitespace1)))
            .map(|name| Requirement::Command(name.into())),
        tuple((
            parse_id.preceded_by(tuple((tag_no_case("feature"), whitespace1))),
            optional_conformance,
        ))
        .map(|(code, conformance)| {
            Requirement::Feature(FeatureRequirement {
                code: code.into(),
                conformance,
            })
        }),
    ))
    .terminated(tuple((whitespace0, tag(";"))))
    .parse(span)
}

/// Parses `cluster <Name> [client] [server] [locked] { requires ...; }`
///
/// A requirement naming neither side requires the server side.
/// The body may be replaced by `;` when there is nothing else to require.
pub fn cluster_requirement(span: Span) -> IResult<Span, ClusterRequirement, ParseError> {
    let (span, name) = parse_id
        .preceded_by(tuple((tag_no_case("cluster"), whitespace1)))
        .parse(span)?;

    let (span, sides) = match whitespace1.parse(span) {
        Ok((rest, _)) => {
            let (tail, sides) = tags_set!(rest, "client", "server", "locked");
            if sides.is_empty() {
                (span, sides)
            } else {
                (tail, sides)
            }
        }
        Err(_) => (span, HashSet::new()),
    };

    let include_client = sides.contains("client");
    let include_server = sides.contains("server") || !include_client;
    let locked = sides.contains("locked");

    let mut result = ClusterRequirement {
        cluster: name.into(),
        include_client,
        include_server,
        lock_client: locked && include_client,
        lock_server: locked && include_server,
        ..Default::default()
    };

    if let Ok((rest, _)) = tuple((whitespace0, tag::<_, _, ParseError>(";"))).parse(span) {
        return Ok((rest, result));
    }

    let (mut span, _) = tuple((whitespace0, tag("{"))).parse(span)?;
    let mut deepest_error = DeepestError::new();

    loop {
        let (rest, _) = whitespace0.parse(span)?;
        match deepest_error.intercept(requirement(rest)) {
            Ok((tail, r)) => {
                match r {
                    Requirement::Attribute(a) => result.attributes.push(a),
                    Requirement::Command(c) => result.commands.push(c),
                    Requirement::Feature(f) => result.features.push(f),
                }
                span = tail;
            }
            Err(_) => {
                span = rest;
                break;
            }
        }
    }

    match value(result, tag("}")).parse(span) {
        Ok(x) => Ok(x),
        Err(e) => Err(deepest_error.or(e)),
    }
}

/// Parses a device type declaration, including any preceeding whitespace.
pub fn device_type(span: Span) -> IResult<Span, DeviceType, ParseError> {
    let (span, doc_comment) = whitespace0.parse(span)?;

    let (span, (name, code, version)) = tuple((
        parse_id.preceded_by(tuple((
            tag_no_case("device"),
            whitespace1,
            tag_no_case("type"),
            whitespace1,
        ))),
        positive_integer.preceded_by(tuple((whitespace0, tag("="), whitespace0))),
        positive_integer.preceded_by(tuple((
            whitespace0,
            tag(","),
            whitespace0,
            tag_no_case("version"),
            whitespace0,
        ))),
    ))
    .parse(span)?;

    let mut device_type = DeviceType {
        doc_comment: doc_comment.map(|DocComment(c)| c.into()),
        name: name.into(),
        code,
        version,
        ..Default::default()
    };

    let (mut span, _) = tuple((whitespace0, tag("{"))).parse(span)?;
    let mut deepest_error = DeepestError::new();

    loop {
        let (rest, _) = whitespace0.parse(span)?;

        if let Ok((tail, domain)) =
            deepest_error.intercept(statement("domain", quoted_string).parse(rest))
        {
            device_type.domain = Some(domain);
            span = tail;
        } else if let Ok((tail, c)) = deepest_error.intercept(cluster_requirement(rest)) {
            device_type.clusters.push(c);
            span = tail;
        } else {
            span = rest;
            break;
        }
    }

    match value(device_type, tag("}")).parse(span) {
        Ok(x) => Ok(x),
        Err(e) => Err(deepest_error.or(e)),
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd)]
enum InternalParsedData {
    Cluster(Cluster),
    Extension(ClusterExtension),
    DeviceType(DeviceType),
    Enum(Enum),
    Bitmap(Bitmap),
    Struct(Struct),
    Whitespace,
}

#[derive(Error, Debug, Diagnostic)]
#[error("Failed to parse capability definition {name}.")]
#[diagnostic(
    code("zcl::idl::parse::failure"),
    help("Check the definition syntax near the reported location")
)]
pub struct IdlParsingError {
    pub name: String,

    #[source_code]
    pub src: NamedSource,

    #[label("Parse error location")]
    pub error_location: SourceSpan,

    /// 1-based line of the error location
    pub line: usize,
}

impl IdlParsingError {
    fn from<'a>(name: &str, input: Span<'a>, span: Span<'a>, error: nom::Err<ParseError<'a>>) -> Self {
        let pos = match error.depest_index() {
            None => input.len() - span.len(),
            Some(error_pos) => error_pos,
        };

        debug!("definition parse error: {:?}", error);

        let line = input.fragment()[..pos.min(input.len())]
            .chars()
            .filter(|c| *c == '\n')
            .count()
            + 1;

        IdlParsingError {
            name: name.into(),
            src: NamedSource::new(name, input.fragment().to_string()),
            error_location: (pos, 1).into(),
            line,
        }
    }
}

impl Definition {
    /// Parses the content of a capability-library file.
    pub fn parse(input: Span) -> Result<Definition, IdlParsingError> {
        Self::parse_named("input definition", input)
    }

    /// Like [`Definition::parse`], naming the source in errors (typically a file path).
    pub fn parse_named(name: &str, input: Span) -> Result<Definition, IdlParsingError> {
        let mut definition = Definition::default();

        let mut span = input;
        while !span.is_empty() {
            let (rest, r) = alt((
                parse_cluster.map(InternalParsedData::Cluster),
                parse_cluster_extension.map(InternalParsedData::Extension),
                device_type.map(InternalParsedData::DeviceType),
                parse_enum.map(InternalParsedData::Enum),
                parse_bitmap.map(InternalParsedData::Bitmap),
                parse_struct.map(InternalParsedData::Struct),
                value(InternalParsedData::Whitespace, whitespace1),
            ))
            .parse(span)
            .map_err(|e| IdlParsingError::from(name, input, span, e))?;

            match r {
                InternalParsedData::Cluster(c) => definition.clusters.push(c),
                InternalParsedData::Extension(e) => definition.extensions.push(e),
                InternalParsedData::DeviceType(d) => definition.device_types.push(d),
                InternalParsedData::Enum(e) => definition.enums.push(e),
                InternalParsedData::Bitmap(b) => definition.bitmaps.push(b),
                InternalParsedData::Struct(s) => definition.structs.push(s),
                InternalParsedData::Whitespace => (),
            }
            span = rest;
        }

        if definition.clusters.is_empty()
            && definition.device_types.is_empty()
            && definition.extensions.is_empty()
        {
            warn!("{}: definition declares no clusters or device types", name);
        }

        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn remove_loc<'a, O>(
        src: IResult<Span<'a>, O, ParseError<'a>>,
    ) -> IResult<Span<'a>, O, ParseError<'a>> {
        src.map(|(span, o)| ((*span.fragment()).into(), o))
    }

    fn assert_parse_ok<R: PartialEq + std::fmt::Debug>(
        parsed: IResult<Span, R, ParseError>,
        expected: R,
    ) {
        let actual = parsed.expect("Parse should have succeeded").1;
        assert_eq!(actual, expected);
    }

    #[test]
    fn parse_definition_error() {
        let err = Definition::parse_named(
            "broken.zcl",
            "/* Invalid */\ncluster X = 1 {\n  invalid\n}".into(),
        )
        .expect_err("invalid member");
        assert_eq!(err.name, "broken.zcl");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn parse_definition_success() {
        let definition =
            Definition::parse(include_str!("./test_definition.zcl").into()).expect("valid");

        assert_eq!(definition.clusters.len(), 2);
        let on_off = &definition.clusters[0];
        assert_eq!(on_off.id, "OnOff");
        assert_eq!(on_off.features.len(), 3);
        assert_eq!(on_off.domain.as_deref(), Some("General"));

        assert_eq!(definition.device_types.len(), 1);
        let light = &definition.device_types[0];
        assert_eq!(light.name, "OnOffLight");
        assert_eq!(light.domain.as_deref(), Some("Lighting"));
        assert_eq!(light.clusters.len(), 2);

        assert_eq!(definition.extensions.len(), 1);
        let vendor_level = &definition.extensions[0].attributes[0];
        assert_eq!(vendor_level.field.field.id, "vendorLevel");
        assert!(vendor_level.field.is_optional);
        assert_eq!(definition.enums.len(), 1);
    }

    #[rstest]
    #[case("default = 1", DefaultAttributeValue::Number(1))]
    #[case("default = 0x1234abcd", DefaultAttributeValue::Number(0x1234abcd))]
    #[case(r#"default = """#, DefaultAttributeValue::String(String::new()))]
    #[case("default = \"B3\"", DefaultAttributeValue::String("B3".into()))]
    #[case(r#"default = "test\\test""#, DefaultAttributeValue::String("test\\test".into()))]
    #[case("default = \"escaped\\\\and quote\\\"\"", DefaultAttributeValue::String("escaped\\and quote\"".into()))]
    #[case("default = -100", DefaultAttributeValue::Signed(-100))]
    #[case("default = true", DefaultAttributeValue::Bool(true))]
    #[case("default = FALSE", DefaultAttributeValue::Bool(false))]
    fn test_parse_default_attribute_value(
        #[case] input: &str,
        #[case] expected: DefaultAttributeValue,
    ) {
        assert_parse_ok(default_attribute_value(input.into()), expected);
    }

    #[rstest]
    #[case("requires attribute onTime;", true)]
    #[case("requires attribute onTime reportable ;", true)]
    #[case("requires command Toggle;", true)]
    #[case("requires feature LT conformance \"M\";", true)]
    #[case("requires cluster OnOff;", false)]
    #[case("requires attribute;", false)]
    fn test_requirement(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(requirement(input.into()).is_ok(), ok);
    }

    #[test]
    fn test_cluster_requirement() {
        assert_parse_ok(
            cluster_requirement("cluster Identify;".into()),
            ClusterRequirement {
                cluster: "Identify".into(),
                include_server: true,
                ..Default::default()
            },
        );

        assert_parse_ok(
            cluster_requirement(
                "cluster OnOff client server locked {
                    requires attribute onOff reportable;
                    // comment between requirements
                    requires command Toggle;
                    requires feature LT;
                    requires feature DF conformance \"LT, O\";
                }"
                .into(),
            ),
            ClusterRequirement {
                cluster: "OnOff".into(),
                include_client: true,
                include_server: true,
                lock_client: true,
                lock_server: true,
                attributes: vec![AttributeRequirement {
                    name: "onOff".into(),
                    is_reportable: true,
                }],
                commands: vec!["Toggle".into()],
                features: vec![
                    FeatureRequirement {
                        code: "LT".into(),
                        conformance: None,
                    },
                    FeatureRequirement {
                        code: "DF".into(),
                        conformance: Some("LT, O".into()),
                    },
                ],
            },
        );

        assert_parse_ok(
            cluster_requirement("cluster Scenes client { }".into()),
            ClusterRequirement {
                cluster: "Scenes".into(),
                include_client: true,
                ..Default::default()
            },
        );
    }

    #[rstest]
    #[case(
        "device type ma_rootdevice = 22, version 1 { }",
        DeviceType {name: "ma_rootdevice".into(), code: 22, version: 1, ..Default::default()}
    )]
    #[case(
        "dEVICe tYPe
           ma_secondary_network_commissioning = //large number on next line
           0xFFF10002, version 0x123  /*test*/
        { domain \"CHIP\"; }
        ",
        DeviceType {
            name: "ma_secondary_network_commissioning".into(),
            code: 0xfff10002,
            version: 0x123,
            domain: Some("CHIP".into()),
            ..Default::default()
        }
    )]
    fn test_parse_device_type(#[case] input: &str, #[case] expected: DeviceType) {
        assert_parse_ok(device_type(input.into()), expected);
    }

    #[test]
    fn test_device_type_error_location() {
        let input = "device type x = 1, version 1 { cluster A { requires nothing; } }";
        let err = device_type(input.into()).expect_err("invalid requirement");
        let index = err.depest_index().expect("has index");
        assert!(index >= input.find("requires").expect("present"));
    }

    #[test]
    fn test_parse_feature() {
        assert_parse_ok(
            parse_feature("/** Lighting */ feature Lighting LT = 0 conformance \"O\";".into()),
            Feature {
                doc_comment: Some(" Lighting ".into()),
                maturity: ApiMaturity::Stable,
                name: "Lighting".into(),
                code: "LT".into(),
                bit: 0,
                conformance: Some("O".into()),
            },
        );
        assert_parse_ok(
            parse_feature("provisional feature DeadFrontBehavior DF = 0x2;".into()),
            Feature {
                maturity: ApiMaturity::Provisional,
                name: "DeadFrontBehavior".into(),
                code: "DF".into(),
                bit: 2,
                ..Default::default()
            },
        );
        assert!(parse_feature("feature Foo FO = 64;".into()).is_err());
    }

    #[test]
    fn test_parse_cluster() {
        assert_parse_ok(parse_cluster("
          /** This is totally made up */
          provisional cluster MyTestCluster = 0x123 {
             revision 22; // just for testing
             domain \"General\";
             manufacturer 0x1002;
             define MY_TEST_CLUSTER;

             feature Lighting LT = 0;

             info event StateChanged = 0 {
               int16u actionID = 0;
             }

             enum ApplyUpdateActionEnum : enum8 {
               kProceed = 0;
             }

             response struct CommissioningCompleteResponse = 5 {
               char_string debugText = 1;
             } conformance \"LT\"

             readonly attribute attrib_id attributeList[] = 65531;
             fabric command access(invoke: administer) CommissioningComplete(): CommissioningCompleteResponse = 4;
          }
        ".into()), Cluster {
            doc_comment: Some(" This is totally made up ".into()),
            maturity: ApiMaturity::Provisional,
            id: "MyTestCluster".into(),
            code: 0x123,
            revision: 22,
            domain: Some("General".into()),
            manufacturer_code: Some(0x1002),
            define: Some("MY_TEST_CLUSTER".into()),
            features: vec![Feature {
                name: "Lighting".into(),
                code: "LT".into(),
                ..Default::default()
            }],
            enums: vec![
                Enum {
                    doc_comment: None,
                    maturity: ApiMaturity::Stable,
                    id: "ApplyUpdateActionEnum".into(),
                    base_type: "enum8".into(),
                    entries: vec![
                        ConstantEntry { maturity: ApiMaturity::Stable, id: "kProceed".into(), code: 0 },
                    ]
               },
            ],
            attributes: vec![Attribute {
                field: StructField {
                    field: Field { data_type: DataType::list_of("attrib_id"), id: "attributeList".into(), code: 65531 },
                    ..Default::default()
                },
                read_acl: AccessPrivilege::View,
                write_acl: AccessPrivilege::Operate,
                is_read_only: true,
                ..Default::default()
            }],
            commands: vec![
                Command {
                    id: "CommissioningCompleteResponse".into(),
                    output: "DefaultSuccess".into(),
                    code: 5,
                    source: Side::Server,
                    conformance: Some("LT".into()),
                    ..Default::default()
                },
                Command {
                    access: AccessPrivilege::Administer,
                    id: "CommissioningComplete".into(),
                    output: "CommissioningCompleteResponse".into(),
                    code: 4,
                    source: Side::Client,
                    is_fabric_scoped: true,
                    ..Default::default()
                },
            ],
            structs: vec![
                Struct {
                    doc_comment: None,
                    maturity: ApiMaturity::Stable,
                    struct_type: StructType::Response(5),
                    id: "CommissioningCompleteResponse".into(),
                    fields: vec![StructField {
                        field: Field {
                            data_type: DataType::scalar("char_string"),
                            id: "debugText".into(),
                            code: 1
                        },
                        ..Default::default()
                    }],
                    is_fabric_scoped: false,
                }
            ],
            events: vec![Event {
                priority: EventPriority::Info,
                access: AccessPrivilege::View,
                id: "StateChanged".into(),
                code: 0,
                fields: vec![
                    StructField {
                        field: Field { data_type: DataType::scalar("int16u") , id: "actionID".into(), code: 0 },
                        ..Default::default()
                    }
                ],
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    #[test]
    fn test_parse_cluster_extension() {
        assert_parse_ok(
            parse_cluster_extension(
                "extend cluster OnOff {
                    attribute int8u customLevel = 0xFFF10000 default = 3;
                    optional command CustomCommand(): DefaultSuccess = 0xFFF10001;
                }"
                .into(),
            ),
            ClusterExtension {
                cluster: "OnOff".into(),
                attributes: vec![Attribute {
                    field: StructField {
                        field: Field {
                            data_type: DataType::scalar("int8u"),
                            id: "customLevel".into(),
                            code: 0xFFF10000,
                        },
                        ..Default::default()
                    },
                    write_acl: AccessPrivilege::Operate,
                    default: Some(DefaultAttributeValue::Number(3)),
                    ..Default::default()
                }],
                commands: vec![Command {
                    access: AccessPrivilege::Operate,
                    id: "CustomCommand".into(),
                    output: "DefaultSuccess".into(),
                    code: 0xFFF10001,
                    source: Side::Client,
                    is_optional: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_parse_attribute() {
        assert_parse_ok(
            parse_attribute("attribute int16u identifyTime = 123;".into()),
            Attribute {
                field: StructField {
                    field: Field {
                        data_type: DataType::scalar("int16u"),
                        id: "identifyTime".into(),
                        code: 123,
                    },
                    ..Default::default()
                },
                write_acl: AccessPrivilege::Operate,
                ..Default::default()
            },
        );
        assert_parse_ok(
            parse_attribute(
                "
            /**mix of tests*/
            internal timedwrite reportable client
               attribute
               access(read: manage, write: administer)
               optional nullable int16s x = 0x123 max 100 default = -5 min -10
               conformance \"LT | [DF]\"
            ;"
                .into(),
            ),
            Attribute {
                doc_comment: Some("mix of tests".into()),
                maturity: ApiMaturity::Internal,
                field: StructField {
                    field: Field {
                        data_type: DataType::scalar("int16s"),
                        id: "x".into(),
                        code: 0x123,
                    },
                    maturity: ApiMaturity::Stable,
                    is_optional: true,
                    is_nullable: true,
                    is_fabric_sensitive: false,
                },
                read_acl: AccessPrivilege::Manage,
                write_acl: AccessPrivilege::Administer,
                side: Side::Client,
                is_timed_write: true,
                is_reportable: true,
                default: Some(DefaultAttributeValue::Signed(-5)),
                min: Some(-10),
                max: Some(100),
                conformance: Some("LT | [DF]".into()),
                ..Default::default()
            },
        );
    }

    #[rstest]
    #[case("attribute int16u x = 1 default = ;")]
    #[case("attribute int16u x = 1 min;")]
    #[case("attribute int16u x = 1 conformance LT;")]
    #[case("attribute int16u x = 1")]
    fn test_parse_attribute_errors(#[case] input: &str) {
        assert!(parse_attribute(input.into()).is_err());
    }

    #[test]
    fn test_parse_command() {
        assert_parse_ok(
            parse_command("
            /** Test with many options. */
            internal fabric timed optional command access(invoke: administer) GetSetupPIN(GetSetupPINRequest): GetSetupPINResponse = 0 conformance \"[LT]\";
            ".into()),
            Command {
                doc_comment: Some(" Test with many options. ".into()),
                maturity: ApiMaturity::Internal,
                access: AccessPrivilege::Administer,
                id: "GetSetupPIN".into(),
                input: Some("GetSetupPINRequest".into()),
                output: "GetSetupPINResponse".into(),
                code: 0,
                source: Side::Client,
                is_optional: true,
                is_timed: true,
                is_fabric_scoped: true,
                conformance: Some("[LT]".into()),
            });

        assert_parse_ok(
            parse_command("server command TestVeryBasic(): DefaultSuccess = 0x123;".into()),
            Command {
                doc_comment: None,
                maturity: ApiMaturity::Stable,
                access: AccessPrivilege::Operate,
                id: "TestVeryBasic".into(),
                input: None,
                output: "DefaultSuccess".into(),
                code: 0x123,
                source: Side::Server,
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_parse_event() {
        assert_parse_ok(
            parse_event(
                "
              /** this is a catch-all */
              fabric_sensitive optional info event access(read: administer) AccessControlEntryChanged = 0 {
                nullable node_id adminNodeID = 1;
                // !! NOTE More things excluded from the real bits, just to have some test
                fabric_idx fabricIndex = 254;
              } conformance \"desc\";"
                    .into(),
            ),
            Event {
                doc_comment: Some(" this is a catch-all ".into()),
                maturity: ApiMaturity::Stable,
                priority: EventPriority::Info,
                access: AccessPrivilege::Administer,
                id: "AccessControlEntryChanged".into(),
                code: 0,
                side: Side::Server,
                is_optional: true,
                is_fabric_sensitive: true,
                conformance: Some("desc".into()),
                fields: vec![
                    StructField {
                        field: Field {
                            data_type: DataType::scalar("node_id"),
                            id: "adminNodeID".into(),
                            code: 1,
                        },
                        is_nullable: true,
                        ..Default::default()
                    },
                    StructField {
                        field: Field {
                            data_type: DataType::scalar("fabric_idx"),
                            id: "fabricIndex".into(),
                            code: 254,
                        },
                        ..Default::default()
                    },
                ],
            },
        );
    }

    #[test]
    fn test_parse_struct() {
        assert_parse_ok(
            parse_struct(
                "
                /** A request */
                request struct SetupRequest {
                    octet_string<32> name = 0;
                    optional int32u values[] = 1;
                }"
                .into(),
            ),
            Struct {
                doc_comment: Some(" A request ".into()),
                maturity: ApiMaturity::Stable,
                struct_type: StructType::Request,
                id: "SetupRequest".into(),
                fields: vec![
                    StructField {
                        field: Field {
                            data_type: DataType::scalar_of_size("octet_string", 32),
                            id: "name".into(),
                            code: 0,
                        },
                        ..Default::default()
                    },
                    StructField {
                        field: Field {
                            data_type: DataType::list_of("int32u"),
                            id: "values".into(),
                            code: 1,
                        },
                        is_optional: true,
                        ..Default::default()
                    },
                ],
                is_fabric_scoped: false,
            },
        );

        assert_parse_ok(
            parse_struct("fabric_scoped struct Entry { fabric_idx fabricIndex = 254; }".into()),
            Struct {
                doc_comment: None,
                maturity: ApiMaturity::Stable,
                struct_type: StructType::Regular,
                id: "Entry".into(),
                fields: vec![StructField {
                    field: Field {
                        data_type: DataType::scalar("fabric_idx"),
                        id: "fabricIndex".into(),
                        code: 254,
                    },
                    ..Default::default()
                }],
                is_fabric_scoped: true,
            },
        );
    }

    #[test]
    fn test_parse_bitmap_and_enum() {
        assert_parse_ok(
            parse_bitmap(
                "bitmap Feature : bitmap32 {
                    kLighting = 0x1;
                    provisional kDeadFront = 0x4;
                }"
                .into(),
            ),
            Bitmap {
                doc_comment: None,
                maturity: ApiMaturity::Stable,
                id: "Feature".into(),
                base_type: "bitmap32".into(),
                entries: vec![
                    ConstantEntry {
                        maturity: ApiMaturity::Stable,
                        id: "kLighting".into(),
                        code: 1,
                    },
                    ConstantEntry {
                        maturity: ApiMaturity::Provisional,
                        id: "kDeadFront".into(),
                        code: 4,
                    },
                ],
            },
        );
        assert!(parse_enum("enum X : enum8 { kA = 0 }".into()).is_err());
        assert!(parse_enum("enum X : enum8 {}".into()).is_ok());
    }

    #[test]
    fn test_tags_are_whole_words() {
        // `fabric` must not match the start of `fabric_sensitive`
        assert!(parse_command("fabric_sensitive command X(): DefaultSuccess = 1;".into()).is_err());
        let (_, tags) = {
            let span: Span = "CLIENT  server rest".into();
            tags_set!(span, "client", "server")
        };
        assert!(tags.contains("client"));
        assert!(tags.contains("server"));
    }

    #[rstest]
    #[case("-", None)]
    #[case("18446744073709551616", None)]
    #[case("18446744073709551615", Some(u64::MAX))]
    #[case("0xFFFFFFFFFFFFFFFF", Some(u64::MAX))]
    #[case("0x", Some(0))]
    fn test_positive_integer_bounds(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(positive_integer(input.into()).ok().map(|(_, v)| v), expected);
    }

    #[test]
    fn test_whitespace_group() {
        assert_eq!(
            remove_loc(whitespace_group("//test\nabc".into())),
            Ok(("\nabc".into(), Whitespace::CComment("test")))
        );
        assert_eq!(
            remove_loc(whitespace_group("/**doc*/abc".into())),
            Ok(("abc".into(), Whitespace::DocComment("doc")))
        );
        assert_eq!(
            remove_loc(whitespace_group("/*c*/abc".into())),
            Ok(("abc".into(), Whitespace::CppComment("c")))
        );
        assert_eq!(
            remove_loc(whitespace_group("//\nabc".into())),
            Ok(("\nabc".into(), Whitespace::CComment("")))
        );
        assert!(whitespace_group("abc".into()).is_err());
    }

    #[test]
    fn test_whitespace0_doc_comment_reset() {
        assert_eq!(
            remove_loc(whitespace0("/** doc */ // plain\n x".into())),
            Ok(("x".into(), None))
        );
        assert_eq!(
            remove_loc(whitespace0("/* a */ /** doc */\n x".into())),
            Ok(("x".into(), Some(DocComment(" doc "))))
        );
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(
            remove_loc(parse_id("abc123 other".into())),
            Ok((" other".into(), "abc123"))
        );
        assert_eq!(remove_loc(parse_id("_x;".into())), Ok((";".into(), "_x")));
        assert!(parse_id("1abc".into()).is_err());
    }

    #[test]
    fn test_quoted_string() {
        assert_eq!(
            remove_loc(quoted_string(r#""line\nnext\ttab" x"#.into())),
            Ok((" x".into(), "line\nnext\ttab".to_string()))
        );
        assert!(quoted_string(r#""unterminated"#.into()).is_err());
        assert!(quoted_string(r#""bad \q escape""#.into()).is_err());
    }
}
