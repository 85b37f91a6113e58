use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::trace;

use super::{Call, Expr, Node, PathExpr, Template, TemplateError};
use crate::helpers::{Helper, HelperArgs, HelperEnv, HelperRegistry};

const MAX_DEPTH: usize = 64;

static NULL: Value = Value::Null;

/// Handlebars truthiness: `null`, `false`, `0`, `""` and `[]` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// The text a value renders as.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Rendered text plus the deprecated helpers it used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub text: String,
    pub deprecated: BTreeSet<String>,
}

/// Renders templates with a fixed set of helpers and partials.
///
/// A renderer holds no per-render state, so one instance can be shared by
/// renders running on different threads.
pub struct Renderer<'a> {
    helpers: &'a HelperRegistry,
    partials: &'a BTreeMap<String, Template>,
    env: &'a HelperEnv,
}

struct Frame {
    this: Value,
    data: Map<String, Value>,
}

impl Frame {
    fn new(this: Value) -> Self {
        Self {
            this,
            data: Map::new(),
        }
    }
}

struct Run<'r, 'a> {
    renderer: &'r Renderer<'a>,
    template: String,
    stack: Vec<Frame>,
    deprecated: BTreeSet<String>,
    depth: usize,
}

impl<'a> Renderer<'a> {
    pub fn new(
        helpers: &'a HelperRegistry,
        partials: &'a BTreeMap<String, Template>,
        env: &'a HelperEnv,
    ) -> Self {
        Self {
            helpers,
            partials,
            env,
        }
    }

    pub fn render(&self, template: &Template, context: &Value) -> Result<Output, TemplateError> {
        self.render_in(template, context, None)
    }

    /// Renders with `this` bound to `scope` while `@root` stays `root`.
    pub fn render_in(
        &self,
        template: &Template,
        root: &Value,
        scope: Option<&Value>,
    ) -> Result<Output, TemplateError> {
        let mut run = Run {
            renderer: self,
            template: template.name.clone(),
            stack: vec![Frame::new(root.clone())],
            deprecated: BTreeSet::new(),
            depth: 0,
        };
        if let Some(scope) = scope {
            run.stack.push(Frame::new(scope.clone()));
        }

        let mut text = String::new();
        run.nodes(&template.nodes, &mut text)?;
        trace!(template = %template.name, bytes = text.len(), "rendered");
        Ok(Output {
            text,
            deprecated: run.deprecated,
        })
    }
}

fn walk(mut value: &Value, segments: &[String]) -> Value {
    for segment in segments {
        value = match value {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) if segment == "length" => return Value::from(items.len()),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    value.clone()
}

impl Run<'_, '_> {
    fn error(&self, line: usize, message: impl Into<String>) -> TemplateError {
        TemplateError::Render {
            template: self.template.clone(),
            line,
            message: message.into(),
        }
    }

    fn this(&self) -> Value {
        self.stack
            .last()
            .map(|f| f.this.clone())
            .unwrap_or(Value::Null)
    }

    fn lookup(&self, path: &PathExpr) -> Value {
        if path.data {
            let Some((first, rest)) = path.segments.split_first() else {
                return Value::Null;
            };
            if first == "root" {
                return self
                    .stack
                    .first()
                    .map(|f| walk(&f.this, rest))
                    .unwrap_or(Value::Null);
            }
            return self
                .stack
                .iter()
                .rev()
                .find_map(|f| f.data.get(first))
                .map(|v| walk(v, rest))
                .unwrap_or(Value::Null);
        }

        let index = self.stack.len().saturating_sub(path.parents + 1);
        self.stack
            .get(index)
            .map(|f| walk(&f.this, &path.segments))
            .unwrap_or(Value::Null)
    }

    fn eval(&mut self, expr: &Expr, line: usize) -> Result<Value, TemplateError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(self.lookup(path)),
            Expr::SubExpr(call) => self.call(call, line),
        }
    }

    /// Evaluates a mustache: a helper invocation when the head names a
    /// helper, a context lookup otherwise.
    fn call(&mut self, call: &Call, line: usize) -> Result<Value, TemplateError> {
        let helpers = self.renderer.helpers;
        if let Some(name) = call.helper_name() {
            if let Some(helper) = helpers.get(name) {
                return self.invoke(name, helper, call, line);
            }
            if call.has_arguments() {
                return Err(self.error(line, format!("unknown helper '{}'", name)));
            }
        }
        self.eval(&call.head, line)
    }

    fn invoke(
        &mut self,
        name: &str,
        helper: &Helper,
        call: &Call,
        line: usize,
    ) -> Result<Value, TemplateError> {
        let params = call
            .params
            .iter()
            .map(|p| self.eval(p, line))
            .collect::<Result<Vec<_>, _>>()?;
        let mut hash = Map::new();
        for (key, expr) in &call.hash {
            let value = self.eval(expr, line)?;
            hash.insert(key.clone(), value);
        }

        match helper {
            Helper::Native { func, deprecated } => {
                if deprecated.is_some() {
                    self.deprecated.insert(name.to_string());
                }
                let root = self.stack.first().map_or(&NULL, |f| &f.this);
                let args = HelperArgs {
                    params: &params,
                    hash: &hash,
                    root,
                    env: self.renderer.env,
                };
                func(&args).map_err(|message| {
                    self.error(line, format!("helper '{}': {}", name, message))
                })
            }
            Helper::Template { params: names, body } => {
                let mut scope = hash;
                for (i, param) in names.iter().enumerate() {
                    scope.insert(
                        param.clone(),
                        params.get(i).cloned().unwrap_or(Value::Null),
                    );
                }
                let mut out = String::new();
                self.scoped(Frame::new(Value::Object(scope)), line, |run| {
                    run.nodes(body, &mut out)
                })?;
                Ok(Value::String(out))
            }
        }
    }

    fn scoped(
        &mut self,
        frame: Frame,
        line: usize,
        f: impl FnOnce(&mut Self) -> Result<(), TemplateError>,
    ) -> Result<(), TemplateError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(line, format!("nesting deeper than {}", MAX_DEPTH)));
        }
        self.depth += 1;
        self.stack.push(frame);
        let result = f(self);
        self.stack.pop();
        self.depth -= 1;
        result
    }

    fn nodes(&mut self, nodes: &[Node], out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Value { call, line } => {
                    let value = self.call(call, *line)?;
                    out.push_str(&display(&value));
                }
                Node::Block {
                    call,
                    body,
                    inverse,
                    line,
                } => self.block(call, body, inverse, *line, out)?,
                Node::Partial {
                    name,
                    context,
                    line,
                } => self.partial(name, context.as_ref(), *line, out)?,
            }
        }
        Ok(())
    }

    fn single_param(&mut self, call: &Call, name: &str, line: usize) -> Result<Value, TemplateError> {
        match call.params.as_slice() {
            [param] => self.eval(param, line),
            _ => Err(self.error(line, format!("'{}' takes exactly one argument", name))),
        }
    }

    fn block(
        &mut self,
        call: &Call,
        body: &[Node],
        inverse: &[Node],
        line: usize,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        match call.helper_name() {
            Some("if") => {
                let value = self.single_param(call, "if", line)?;
                let branch = if is_truthy(&value) { body } else { inverse };
                self.nodes(branch, out)
            }
            Some("unless") => {
                let value = self.single_param(call, "unless", line)?;
                let branch = if is_truthy(&value) { inverse } else { body };
                self.nodes(branch, out)
            }
            Some("each") => {
                let value = self.single_param(call, "each", line)?;
                self.each(value, body, inverse, line, out)
            }
            Some("with") => {
                let value = self.single_param(call, "with", line)?;
                if is_truthy(&value) {
                    self.scoped(Frame::new(value), line, |run| run.nodes(body, out))
                } else {
                    self.nodes(inverse, out)
                }
            }
            Some("define") => Err(self.error(
                line,
                "'define' blocks are only allowed in helper files",
            )),
            _ => {
                let value = self.call(call, line)?;
                self.section(value, body, inverse, line, out)
            }
        }
    }

    fn each(
        &mut self,
        value: Value,
        body: &[Node],
        inverse: &[Node],
        line: usize,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        let entries: Vec<(Option<String>, Value)> = match value {
            Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            _ => Vec::new(),
        };
        if entries.is_empty() {
            return self.nodes(inverse, out);
        }

        let last = entries.len() - 1;
        for (index, (key, item)) in entries.into_iter().enumerate() {
            let mut frame = Frame::new(item);
            frame.data.insert("index".into(), Value::from(index));
            frame.data.insert("first".into(), Value::Bool(index == 0));
            frame.data.insert("last".into(), Value::Bool(index == last));
            if let Some(key) = key {
                frame.data.insert("key".into(), Value::String(key));
            }
            self.scoped(frame, line, |run| run.nodes(body, out))?;
        }
        Ok(())
    }

    /// Block semantics for a plain value or a value-returning helper.
    fn section(
        &mut self,
        value: Value,
        body: &[Node],
        inverse: &[Node],
        line: usize,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        match value {
            Value::Array(_) => self.each(value, body, inverse, line, out),
            Value::Object(_) => self.scoped(Frame::new(value), line, |run| run.nodes(body, out)),
            v if is_truthy(&v) => self.nodes(body, out),
            _ => self.nodes(inverse, out),
        }
    }

    fn partial(
        &mut self,
        name: &str,
        context: Option<&Expr>,
        line: usize,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        let partials = self.renderer.partials;
        let template = partials
            .get(name)
            .ok_or_else(|| self.error(line, format!("unknown partial '{}'", name)))?;
        let this = match context {
            Some(expr) => self.eval(expr, line)?,
            None => self.this(),
        };
        self.scoped(Frame::new(this), line, |run| run.nodes(&template.nodes, out))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn render_with(
        source: &str,
        context: Value,
        partials: &[(&str, &str)],
        helper_file: Option<&str>,
    ) -> Result<String, TemplateError> {
        let mut helpers = HelperRegistry::with_builtins();
        if let Some(file) = helper_file {
            helpers.load_helper_file("helpers.zapt", file)?;
        }
        let partials: BTreeMap<String, Template> = partials
            .iter()
            .map(|(name, src)| (name.to_string(), Template::parse(*name, src).unwrap()))
            .collect();
        let env = HelperEnv::default();
        let renderer = Renderer::new(&helpers, &partials, &env);
        let template = Template::parse("test", source)?;
        renderer.render(&template, &context).map(|o| o.text)
    }

    fn render(source: &str, context: Value) -> String {
        render_with(source, context, &[], None).unwrap()
    }

    #[rstest]
    #[case(json!(null), false)]
    #[case(json!(0), false)]
    #[case(json!(0.0), false)]
    #[case(json!(""), false)]
    #[case(json!([]), false)]
    #[case(json!({}), true)]
    #[case(json!("0"), true)]
    #[case(json!(-1), true)]
    fn truthiness(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(is_truthy(&value), expected);
    }

    #[test]
    fn values_and_paths() {
        let context = json!({"a": {"b": [10, 20]}, "n": null, "flag": true});
        assert_eq!(
            render("{{a.b.1}} {{a.b.length}} [{{n}}] {{flag}} {{missing.x}}", context),
            "20 2 [] true "
        );
    }

    #[test]
    fn each_over_arrays_and_objects() {
        let context = json!({"list": ["x", "y", "z"], "map": {"k1": 1, "k2": 2}});
        assert_eq!(
            render(
                "{{#each list}}{{#if @first}}[{{/if}}{{@index}}:{{this}}{{#unless @last}},{{/unless}}{{/each}}]",
                context.clone()
            ),
            "[0:x,1:y,2:z]"
        );
        assert_eq!(
            render("{{#each map}}{{@key}}={{this}};{{/each}}", context),
            "k1=1;k2=2;"
        );
    }

    #[test]
    fn each_else_on_empty() {
        assert_eq!(
            render("{{#each list}}x{{else}}none{{/each}}", json!({"list": []})),
            "none"
        );
    }

    #[test]
    fn parent_and_root_access() {
        let context = json!({"prefix": "P", "items": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(
            render(
                "{{#each items}}{{../prefix}}{{name}}{{@root.prefix}} {{/each}}",
                context
            ),
            "PaP PbP "
        );
    }

    #[test]
    fn with_changes_scope() {
        let context = json!({"cluster": {"name": "OnOff"}});
        assert_eq!(
            render("{{#with cluster}}{{name}}{{else}}-{{/with}}", context),
            "OnOff"
        );
        assert_eq!(
            render("{{#with cluster}}{{name}}{{else}}-{{/with}}", json!({})),
            "-"
        );
    }

    #[test]
    fn else_if_chains() {
        let source = "{{#if a}}A{{else if b}}B{{else}}C{{/if}}";
        assert_eq!(render(source, json!({"a": true})), "A");
        assert_eq!(render(source, json!({"b": 1})), "B");
        assert_eq!(render(source, json!({})), "C");
    }

    #[test]
    fn helpers_and_sub_expressions() {
        let context = json!({"name": "on off", "code": 6});
        assert_eq!(
            render(
                "{{as_upper_camel_case name}} {{as_hex code 4}} {{#if (eq code 6)}}six{{/if}}",
                context
            ),
            "OnOff 0x0006 six"
        );
    }

    #[test]
    fn value_sections() {
        let context = json!({"clusters": [{"name": "a"}], "enabled": true, "obj": {"v": 1}});
        assert_eq!(
            render(
                "{{#clusters}}{{name}}{{/clusters}}{{#enabled}}!{{/enabled}}{{#obj}}{{v}}{{/obj}}",
                context
            ),
            "a!1"
        );
    }

    #[test]
    fn partials_see_the_current_scope() {
        let out = render_with(
            "{{#each items}}{{> item}}{{/each}}{{> item first}}",
            json!({"items": [{"name": "a"}], "first": {"name": "f"}}),
            &[("item", "<{{name}}>")],
            None,
        )
        .unwrap();
        assert_eq!(out, "<a><f>");
    }

    #[test]
    fn recursive_partials_are_bounded() {
        let err = render_with("{{> loop}}", json!({}), &[("loop", "{{> loop}}")], None).unwrap_err();
        assert!(err.to_string().contains("nesting deeper than"), "{}", err);
    }

    #[test]
    fn defined_helpers() {
        let helpers = r#"
{{#define "field" name type}}{{type}} {{name}};{{/define}}
{{#define "greet" who}}hello {{who}}{{#if excited}}!{{/if}}{{/define}}
"#;
        let out = render_with(
            "{{field \"x\" \"int\"}} {{greet \"you\" excited=true}}",
            json!({}),
            &[],
            Some(helpers),
        )
        .unwrap();
        assert_eq!(out, "int x; hello you!");
    }

    #[rstest]
    #[case("{{nope 1}}", "test:1: unknown helper 'nope'")]
    #[case("\n{{> nope}}", "test:2: unknown partial 'nope'")]
    #[case("{{#if a b}}{{/if}}", "test:1: 'if' takes exactly one argument")]
    #[case("{{#define \"x\"}}{{/define}}", "test:1: 'define' blocks are only allowed in helper files")]
    fn render_errors(#[case] source: &str, #[case] message: &str) {
        let err = render_with(source, json!({}), &[], None).unwrap_err();
        assert_eq!(err.to_string(), message);
    }
}
