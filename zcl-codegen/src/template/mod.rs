//! A small handlebars-style template language.
//!
//! Templates are parsed once into a tree of [`Node`]s and rendered against a
//! `serde_json` value. Output is never escaped: everything rendered is source
//! code, not markup.
//!
//! ```
//! use serde_json::json;
//! use zcl_codegen::helpers::{HelperEnv, HelperRegistry};
//! use zcl_codegen::template::{Renderer, Template};
//!
//! let template = Template::parse("t", "{{#each items}}{{@index}}={{this}} {{/each}}").unwrap();
//! let helpers = HelperRegistry::with_builtins();
//! let env = HelperEnv::default();
//! let partials = Default::default();
//! let renderer = Renderer::new(&helpers, &partials, &env);
//! let out = renderer.render(&template, &json!({"items": ["a", "b"]})).unwrap();
//! assert_eq!(out.text, "0=a 1=b ");
//! ```

mod parser;
mod render;

use serde_json::Value;
use thiserror::Error;

pub use render::{display, is_truthy, Output, Renderer};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("{template}:{line}: {message}")]
    Syntax {
        template: String,
        line: usize,
        message: String,
    },

    #[error("{template}:{line}: {message}")]
    Render {
        template: String,
        line: usize,
        message: String,
    },
}

/// A path into the render context: `name.sub`, `../name`, `this`, `@index`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathExpr {
    /// Refers to block data (`@index`, `@root`) rather than the context
    pub data: bool,
    /// Number of `../` prefixes
    pub parents: usize,
    pub segments: Vec<String>,
}

impl PathExpr {
    /// The name this path would have if it were used as a helper call.
    pub fn helper_name(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [name] if !self.data && self.parents == 0 => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(PathExpr),
    Literal(Value),
    SubExpr(Box<Call>),
}

/// A mustache body: a head followed by positional and `key=value` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub head: Expr,
    pub params: Vec<Expr>,
    pub hash: Vec<(String, Expr)>,
}

impl Call {
    pub fn helper_name(&self) -> Option<&str> {
        match &self.head {
            Expr::Path(path) => path.helper_name(),
            _ => None,
        }
    }

    pub fn has_arguments(&self) -> bool {
        !self.params.is_empty() || !self.hash.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Value {
        call: Call,
        line: usize,
    },
    Block {
        call: Call,
        body: Vec<Node>,
        inverse: Vec<Node>,
        line: usize,
    },
    Partial {
        name: String,
        context: Option<Expr>,
        line: usize,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Template {
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, TemplateError> {
        let name = name.into();
        let nodes = parser::parse_nodes(&name, source)?;
        Ok(Self { name, nodes })
    }
}
