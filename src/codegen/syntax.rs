//! Statement nodes for generated device source and their rendering to text.
//!
//! Kernels are assembled from [`Stmt`] nodes collected in [`Block`]s and only turned into text
//! at the very end, so that the structure of a kernel can be inspected before rendering.
use itertools::Itertools;
use std::fmt;
use std::fmt::{Display, Formatter, Write};

const INDENT: &str = "  ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Blank,
    Comment(String),
    /// `#include <path>`
    Include(String),
    /// `#include "path"`
    IncludeLocal(String),
    Undef(String),
    Define(String, String),
    Pragma(String),
    /// `const CeedInt name = value;`, possibly several on one line.
    Constants(Vec<(String, String)>),
    /// `[__shared__ ]CeedScalar name[len][ = {init}];`
    Array {
        name: String,
        len: String,
        shared: bool,
        init: Option<String>,
    },
    /// `[const ]CeedScalar *[__restrict__ ]name = target;`
    Pointer {
        name: String,
        target: String,
        is_const: bool,
        restrict: bool,
    },
    /// `function<template...>(args...);`
    Call {
        function: String,
        template: Vec<String>,
        args: Vec<String>,
    },
    Assign { target: String, value: String },
    /// A statement written out verbatim, followed by `;`.
    Raw(String),
    /// `for (CeedInt var = start; var < bound; step) { body }`
    For {
        var: String,
        start: String,
        bound: String,
        step: Option<String>,
        body: Block,
    },
    If { condition: String, body: Block },
    Scope(Block),
}

/// An ordered list of statements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    stmts: Vec<Stmt>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn push(&mut self, stmt: Stmt) -> &mut Self {
        self.stmts.push(stmt);
        self
    }

    pub fn append(&mut self, other: Block) -> &mut Self {
        self.stmts.extend(other.stmts);
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.push(Stmt::Blank)
    }

    pub fn comment(&mut self, text: impl Into<String>) -> &mut Self {
        self.push(Stmt::Comment(text.into()))
    }

    pub fn constant(&mut self, name: impl Into<String>, value: impl Display) -> &mut Self {
        self.push(Stmt::Constants(vec![(name.into(), value.to_string())]))
    }

    pub fn array(&mut self, name: impl Into<String>, len: impl Into<String>) -> &mut Self {
        self.push(Stmt::Array {
            name: name.into(),
            len: len.into(),
            shared: false,
            init: None,
        })
    }

    pub fn zeroed_array(&mut self, name: impl Into<String>, len: impl Into<String>, zero: &str) -> &mut Self {
        self.push(Stmt::Array {
            name: name.into(),
            len: len.into(),
            shared: false,
            init: Some(zero.to_string()),
        })
    }

    pub fn shared_array(&mut self, name: impl Into<String>, len: impl Into<String>) -> &mut Self {
        self.push(Stmt::Array {
            name: name.into(),
            len: len.into(),
            shared: true,
            init: None,
        })
    }

    pub fn alias(&mut self, name: impl Into<String>, target: impl Into<String>) -> &mut Self {
        self.push(Stmt::Pointer {
            name: name.into(),
            target: target.into(),
            is_const: false,
            restrict: false,
        })
    }

    /// `function<template...>(args...);`
    pub fn call(&mut self, function: impl Into<String>, template: &[&str], args: &[&str]) -> &mut Self {
        self.push(Stmt::Call {
            function: function.into(),
            template: template.iter().map(|t| t.to_string()).collect(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
    }

    /// Call without template arguments.
    pub fn invoke(&mut self, function: impl Into<String>, args: &[&str]) -> &mut Self {
        self.call(function, &[], args)
    }

    pub fn assign(&mut self, target: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Stmt::Assign {
            target: target.into(),
            value: value.into(),
        })
    }

    pub fn raw(&mut self, text: impl Into<String>) -> &mut Self {
        self.push(Stmt::Raw(text.into()))
    }

    /// Loop `var` over `0..bound` with unit step.
    pub fn range_loop(&mut self, var: &str, bound: impl Into<String>, body: Block) -> &mut Self {
        self.push(Stmt::For {
            var: var.to_string(),
            start: "0".to_string(),
            bound: bound.into(),
            step: None,
            body,
        })
    }

    pub fn scope(&mut self, body: Block) -> &mut Self {
        self.push(Stmt::Scope(body))
    }

    /// Visits every statement, including those nested in loops and scopes.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Stmt)) {
        for stmt in &self.stmts {
            visit(stmt);
            match stmt {
                Stmt::For { body, .. } | Stmt::If { body, .. } | Stmt::Scope(body) => body.walk(visit),
                _ => {}
            }
        }
    }

    fn render_into(&self, out: &mut String, depth: usize) -> fmt::Result {
        let indent = INDENT.repeat(depth);
        for stmt in &self.stmts {
            match stmt {
                Stmt::Blank => writeln!(out)?,
                Stmt::Comment(text) => writeln!(out, "{indent}// {text}")?,
                Stmt::Include(path) => writeln!(out, "#include <{path}>")?,
                Stmt::IncludeLocal(path) => writeln!(out, "#include \"{path}\"")?,
                Stmt::Undef(name) => writeln!(out, "#undef {name}")?,
                Stmt::Define(name, value) => writeln!(out, "#define {name} {value}")?,
                Stmt::Pragma(text) => writeln!(out, "{indent}#pragma {text}")?,
                Stmt::Constants(constants) => {
                    let list = constants
                        .iter()
                        .map(|(name, value)| format!("{name} = {value}"))
                        .join(", ");
                    writeln!(out, "{indent}const CeedInt {list};")?
                }
                Stmt::Array {
                    name,
                    len,
                    shared,
                    init,
                } => {
                    let shared = if *shared { "__shared__ " } else { "" };
                    match init {
                        Some(init) => writeln!(out, "{indent}{shared}CeedScalar {name}[{len}] = {{{init}}};")?,
                        None => writeln!(out, "{indent}{shared}CeedScalar {name}[{len}];")?,
                    }
                }
                Stmt::Pointer {
                    name,
                    target,
                    is_const,
                    restrict,
                } => {
                    let is_const = if *is_const { "const " } else { "" };
                    let restrict = if *restrict { "__restrict__ " } else { "" };
                    writeln!(out, "{indent}{is_const}CeedScalar *{restrict}{name} = {target};")?
                }
                Stmt::Call {
                    function,
                    template,
                    args,
                } => {
                    let args = args.iter().join(", ");
                    if template.is_empty() {
                        writeln!(out, "{indent}{function}({args});")?
                    } else {
                        let template = template.iter().join(", ");
                        writeln!(out, "{indent}{function}<{template}>({args});")?
                    }
                }
                Stmt::Assign { target, value } => writeln!(out, "{indent}{target} = {value};")?,
                Stmt::Raw(text) => writeln!(out, "{indent}{text};")?,
                Stmt::For {
                    var,
                    start,
                    bound,
                    step,
                    body,
                } => {
                    let step = match step {
                        Some(step) => format!("{var} += {step}"),
                        None => format!("{var}++"),
                    };
                    writeln!(out, "{indent}for (CeedInt {var} = {start}; {var} < {bound}; {step}) {{")?;
                    body.render_into(out, depth + 1)?;
                    writeln!(out, "{indent}}}")?
                }
                Stmt::If { condition, body } => {
                    writeln!(out, "{indent}if ({condition}) {{")?;
                    body.render_into(out, depth + 1)?;
                    writeln!(out, "{indent}}}")?
                }
                Stmt::Scope(body) => {
                    writeln!(out, "{indent}{{")?;
                    body.render_into(out, depth + 1)?;
                    writeln!(out, "{indent}}}")?
                }
            }
        }
        Ok(())
    }
}

/// A `__global__` device function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFunction {
    pub name: String,
    /// Annotate with `__launch_bounds__(BLOCK_SIZE)`.
    pub launch_bounds: bool,
    pub params: Vec<String>,
    pub body: Block,
}

/// A complete translation unit holding a single kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub preamble: Block,
    /// Title of the banner comment preceding the kernel.
    pub title: String,
    pub kernel: KernelFunction,
}

const RULE: &str = "// -----------------------------------------------------------------------------";

const BANNER_LEGEND: [&str; 8] = [
    "d_[in,out]_i:   CeedVector device array",
    "r_[in,out]_e_i: Element vector register",
    "r_[in,out]_q_i: Quadrature space vector register",
    "r_[in,out]_c_i: AtPoints Chebyshev coefficients register",
    "r_[in,out]_s_i: Quadrature space slice vector register",
    "",
    "s_B_[in,out]_i: Interpolation matrix, shared memory",
    "s_G_[in,out]_i: Gradient matrix, shared memory",
];

impl SourceFile {
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> fmt::Result {
        self.preamble.render_into(out, 0)?;
        writeln!(out)?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "// {}", self.title)?;
        writeln!(out, "//")?;
        for line in BANNER_LEGEND {
            if line.is_empty() {
                writeln!(out, "//")?;
            } else {
                writeln!(out, "// {line}")?;
            }
        }
        writeln!(out, "{RULE}")?;

        let kernel = &self.kernel;
        let params = kernel.params.iter().join(", ");
        if kernel.launch_bounds {
            writeln!(out, "extern \"C\" __launch_bounds__(BLOCK_SIZE)")?;
            writeln!(out, "__global__ void {}({params}) {{", kernel.name)?;
        } else {
            writeln!(out, "extern \"C\" __global__ void {}({params}) {{", kernel.name)?;
        }
        kernel.body.render_into(out, 1)?;
        writeln!(out, "}}")?;
        writeln!(out, "{RULE}")
    }
}

impl Display for SourceFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
