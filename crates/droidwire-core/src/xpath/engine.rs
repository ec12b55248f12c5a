//! XPath 1.0 evaluation over a [`HierarchySnapshot`].
//!
//! Hierarchy dumps are attribute-only element trees, so the evaluator models
//! two node kinds: elements and attributes. Supported:
//!
//! - absolute, relative and `//` location paths, `.` and `..`
//! - every XPath 1.0 axis except `namespace`
//! - name, `*`, `node()` and `text()` node tests (dumps have no text nodes)
//! - predicates, including numeric position predicates, on steps and on
//!   parenthesized expressions
//! - `or`, `and`, comparisons, arithmetic, unary minus and `|`
//! - the XPath 1.0 core string, number and boolean functions, plus
//!   EXSLT `re:match` and `re:test`
//!
//! Invalid regular expressions passed to `re:*` evaluate to false instead of
//! failing the whole query.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::error::DeviceError;
use crate::hierarchy::{HierarchySnapshot, NodeId};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Str(String),
    Num(f64),
    Slash,
    DSlash,
    Dot,
    DDot,
    At,
    Star,
    Mul,
    Pipe,
    LBrack,
    RBrack,
    LParen,
    RParen,
    Comma,
    DColon,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    And,
    Or,
    Div,
    Mod,
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Whether the previous token ends an operand, which makes a following `*`
/// or operator name an operator.
fn ends_operand(prev: Option<&Tok>) -> bool {
    matches!(
        prev,
        Some(
            Tok::RBrack
                | Tok::RParen
                | Tok::Str(_)
                | Tok::Num(_)
                | Tok::Name(_)
                | Tok::Star
                | Tok::Dot
                | Tok::DDot
        )
    )
}

fn tokenize(input: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = input.chars().collect();
    let at = |i: usize| chars.get(i).copied();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '/' if at(i + 1) == Some('/') => {
                toks.push(Tok::DSlash);
                i += 2;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '.' if at(i + 1) == Some('.') => {
                toks.push(Tok::DDot);
                i += 2;
            }
            '.' if at(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                let start = i;
                i += 1;
                while at(i).is_some_and(|d| d.is_ascii_digit()) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Num(text.parse().map_err(|_| format!("bad number {text}"))?));
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '@' => {
                toks.push(Tok::At);
                i += 1;
            }
            '*' => {
                let tok = if ends_operand(toks.last()) { Tok::Mul } else { Tok::Star };
                toks.push(tok);
                i += 1;
            }
            '|' => {
                toks.push(Tok::Pipe);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBrack);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBrack);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '!' if at(i + 1) == Some('=') => {
                toks.push(Tok::Ne);
                i += 2;
            }
            '<' if at(i + 1) == Some('=') => {
                toks.push(Tok::Le);
                i += 2;
            }
            '<' => {
                toks.push(Tok::Lt);
                i += 1;
            }
            '>' if at(i + 1) == Some('=') => {
                toks.push(Tok::Ge);
                i += 2;
            }
            '>' => {
                toks.push(Tok::Gt);
                i += 1;
            }
            q @ ('\'' | '"') => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == q)
                    .map(|p| start + p)
                    .ok_or("unterminated string literal")?;
                toks.push(Tok::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            d if d.is_ascii_digit() => {
                let start = i;
                while at(i).is_some_and(|d| d.is_ascii_digit() || d == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Num(text.parse().map_err(|_| format!("bad number {text}"))?));
            }
            n if is_name_start(n) => {
                let start = i;
                while at(i).is_some_and(is_name_char) {
                    i += 1;
                }
                let mut name: String = chars[start..i].iter().collect();
                if at(i) == Some(':') && at(i + 1) == Some(':') {
                    toks.push(Tok::Name(name));
                    toks.push(Tok::DColon);
                    i += 2;
                    continue;
                }
                if at(i) == Some(':') && at(i + 1).is_some_and(is_name_start) {
                    // prefixed name, e.g. re:match
                    i += 1;
                    let local = i;
                    while at(i).is_some_and(is_name_char) {
                        i += 1;
                    }
                    name.push(':');
                    name.extend(&chars[local..i]);
                }
                let tok = if ends_operand(toks.last()) {
                    match name.as_str() {
                        "and" => Tok::And,
                        "or" => Tok::Or,
                        "div" => Tok::Div,
                        "mod" => Tok::Mod,
                        _ => Tok::Name(name),
                    }
                } else {
                    Tok::Name(name)
                };
                toks.push(tok);
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path { start: PathStart, steps: Vec<Step> },
    Filter(Box<Expr>, Vec<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Vec<Expr>),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
enum PathStart {
    Root,
    Context,
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    preds: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            preds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
    SelfAxis,
    Attribute,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            "following" => Axis::Following,
            "preceding" => Axis::Preceding,
            "self" => Axis::SelfAxis,
            "attribute" => Axis::Attribute,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Wildcard,
    Node,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

const NODE_TYPES: [&str; 4] = ["node", "text", "comment", "processing-instruction"];

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.toks.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), String> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(format!("expected {tok:?}, found {:?}", self.peek()))
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        if self.toks.is_empty() {
            return Err("empty expression".into());
        }
        let expr = self.parse_or()?;
        match self.peek() {
            None => Ok(expr),
            Some(tok) => Err(format!("unexpected trailing {tok:?}")),
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(Tok, Op)],
        next: fn(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut left = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.eat(tok) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Tok::Or, Op::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Tok::And, Op::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Tok::Eq, Op::Eq), (Tok::Ne, Op::Ne)], Self::parse_relational)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Tok::Le, Op::Le),
                (Tok::Ge, Op::Ge),
                (Tok::Lt, Op::Lt),
                (Tok::Gt, Op::Gt),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Tok::Plus, Op::Add), (Tok::Minus, Op::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Tok::Mul, Op::Mul), (Tok::Div, Op::Div), (Tok::Mod, Op::Mod)],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Tok::Minus) {
            Ok(Expr::Neg(Box::new(self.parse_unary()?)))
        } else {
            self.parse_union()
        }
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_path()?;
        while self.eat(&Tok::Pipe) {
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn is_function_call(&self) -> bool {
        match (self.peek(), self.peek_at(1)) {
            (Some(Tok::Name(name)), Some(Tok::LParen)) => !NODE_TYPES.contains(&name.as_str()),
            _ => false,
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        let starts_filter = matches!(
            self.peek(),
            Some(Tok::LParen) | Some(Tok::Str(_)) | Some(Tok::Num(_))
        ) || self.is_function_call();
        if !starts_filter {
            return self.parse_location_path();
        }

        let primary = self.parse_primary()?;
        let preds = self.parse_predicates()?;
        let base = if preds.is_empty() {
            primary
        } else {
            Expr::Filter(Box::new(primary), preds)
        };

        let mut steps = Vec::new();
        self.parse_relative_steps(&mut steps)?;
        if steps.is_empty() {
            Ok(base)
        } else {
            Ok(Expr::Path {
                start: PathStart::Expr(Box::new(base)),
                steps,
            })
        }
    }

    fn can_start_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Tok::Name(_)) | Some(Tok::Star) | Some(Tok::At) | Some(Tok::Dot) | Some(Tok::DDot)
        )
    }

    fn parse_location_path(&mut self) -> Result<Expr, String> {
        let mut steps = Vec::new();
        let start = if self.eat(&Tok::DSlash) {
            steps.push(Step::descendant_or_self());
            steps.push(self.parse_step()?);
            PathStart::Root
        } else if self.eat(&Tok::Slash) {
            if self.can_start_step() {
                steps.push(self.parse_step()?);
            }
            PathStart::Root
        } else {
            steps.push(self.parse_step()?);
            PathStart::Context
        };
        self.parse_relative_steps(&mut steps)?;
        Ok(Expr::Path { start, steps })
    }

    fn parse_relative_steps(&mut self, steps: &mut Vec<Step>) -> Result<(), String> {
        loop {
            if self.eat(&Tok::DSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
            } else if self.eat(&Tok::Slash) {
                steps.push(self.parse_step()?);
            } else {
                return Ok(());
            }
        }
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, String> {
        let mut preds = Vec::new();
        while self.eat(&Tok::LBrack) {
            preds.push(self.parse_or()?);
            self.expect(&Tok::RBrack)?;
        }
        Ok(preds)
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        if self.eat(&Tok::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                preds: Vec::new(),
            });
        }
        if self.eat(&Tok::DDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                preds: Vec::new(),
            });
        }

        let axis = if self.eat(&Tok::At) {
            Axis::Attribute
        } else if self.peek_at(1) == Some(&Tok::DColon) {
            let name = match self.advance() {
                Some(Tok::Name(n)) => n,
                other => return Err(format!("expected axis name, found {other:?}")),
            };
            self.expect(&Tok::DColon)?;
            Axis::from_name(&name).ok_or_else(|| format!("unsupported axis {name}"))?
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Some(Tok::Star) => NodeTest::Wildcard,
            Some(Tok::Name(name)) if self.peek() == Some(&Tok::LParen) => {
                self.expect(&Tok::LParen)?;
                self.expect(&Tok::RParen)?;
                match name.as_str() {
                    "node" => NodeTest::Node,
                    "text" => NodeTest::Text,
                    other => return Err(format!("unsupported node test {other}()")),
                }
            }
            Some(Tok::Name(name)) => NodeTest::Name(name),
            other => return Err(format!("expected node test, found {other:?}")),
        };

        let preds = self.parse_predicates()?;
        Ok(Step { axis, test, preds })
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Tok::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Tok::RParen)?;
                Ok(expr)
            }
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Name(name)) => {
                self.expect(&Tok::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    args.push(self.parse_or()?);
                    while self.eat(&Tok::Comma) {
                        args.push(self.parse_or()?);
                    }
                    self.expect(&Tok::RParen)?;
                }
                Ok(Expr::Call(name, args))
            }
            other => Err(format!("unexpected {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A node in the XPath data model. Attributes are addressed by their index
/// in the owning element's attribute list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XNode {
    Elem(NodeId),
    Attr(NodeId, usize),
}

impl XNode {
    fn order_key(self) -> (NodeId, usize) {
        match self {
            XNode::Elem(id) => (id, 0),
            XNode::Attr(id, k) => (id, k + 1),
        }
    }

    fn element(self) -> NodeId {
        match self {
            XNode::Elem(id) | XNode::Attr(id, _) => id,
        }
    }
}

fn document_order(nodes: &mut Vec<XNode>) {
    nodes.sort_by_key(|n| n.order_key());
    nodes.dedup();
}

#[derive(Debug, Clone)]
enum XValue {
    Nodes(Vec<XNode>),
    Str(String),
    Num(f64),
    Bool(bool),
}

fn xpath_round(n: f64) -> f64 {
    if n.is_finite() {
        (n + 0.5).floor()
    } else {
        n
    }
}

fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn string_to_number(s: &str) -> f64 {
    s.trim().parse().unwrap_or(f64::NAN)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Ctx {
    node: XNode,
    position: usize,
    size: usize,
}

struct Evaluator<'a> {
    snap: &'a HierarchySnapshot,
    regexes: RefCell<HashMap<(String, String), Option<Regex>>>,
}

impl<'a> Evaluator<'a> {
    fn new(snap: &'a HierarchySnapshot) -> Self {
        Self {
            snap,
            regexes: RefCell::new(HashMap::new()),
        }
    }

    fn string_of(&self, node: XNode) -> String {
        match node {
            // Dumps carry no text content, so an element's string value is empty.
            XNode::Elem(_) => String::new(),
            XNode::Attr(id, k) => self.snap.node(id).attributes[k].1.clone(),
        }
    }

    fn to_string(&self, value: &XValue) -> String {
        match value {
            XValue::Str(s) => s.clone(),
            XValue::Num(n) => number_to_string(*n),
            XValue::Bool(b) => b.to_string(),
            XValue::Nodes(ns) => ns.first().map(|n| self.string_of(*n)).unwrap_or_default(),
        }
    }

    fn to_number(&self, value: &XValue) -> f64 {
        match value {
            XValue::Num(n) => *n,
            XValue::Bool(b) => f64::from(u8::from(*b)),
            other => string_to_number(&self.to_string(other)),
        }
    }

    fn to_bool(value: &XValue) -> bool {
        match value {
            XValue::Bool(b) => *b,
            XValue::Num(n) => *n != 0.0 && !n.is_nan(),
            XValue::Str(s) => !s.is_empty(),
            XValue::Nodes(ns) => !ns.is_empty(),
        }
    }

    fn eval(&self, expr: &Expr, ctx: Ctx) -> Result<XValue, String> {
        match expr {
            Expr::Str(s) => Ok(XValue::Str(s.clone())),
            Expr::Num(n) => Ok(XValue::Num(*n)),
            Expr::Neg(inner) => Ok(XValue::Num(-self.to_number(&self.eval(inner, ctx)?))),
            Expr::Path { start, steps } => {
                let start_nodes = match start {
                    PathStart::Root => vec![XNode::Elem(self.snap.document())],
                    PathStart::Context => vec![ctx.node],
                    PathStart::Expr(base) => self.node_set(base, ctx)?,
                };
                Ok(XValue::Nodes(self.eval_steps(start_nodes, steps)?))
            }
            Expr::Filter(base, preds) => {
                let mut nodes = self.node_set(base, ctx)?;
                for pred in preds {
                    nodes = self.apply_predicate(nodes, pred)?;
                }
                Ok(XValue::Nodes(nodes))
            }
            Expr::Union(left, right) => {
                let mut nodes = self.node_set(left, ctx)?;
                nodes.extend(self.node_set(right, ctx)?);
                document_order(&mut nodes);
                Ok(XValue::Nodes(nodes))
            }
            Expr::Binary(Op::Or, left, right) => Ok(XValue::Bool(
                Self::to_bool(&self.eval(left, ctx)?) || Self::to_bool(&self.eval(right, ctx)?),
            )),
            Expr::Binary(Op::And, left, right) => Ok(XValue::Bool(
                Self::to_bool(&self.eval(left, ctx)?) && Self::to_bool(&self.eval(right, ctx)?),
            )),
            Expr::Binary(op, left, right) => {
                let l = self.eval(left, ctx)?;
                let r = self.eval(right, ctx)?;
                match op {
                    Op::Add => Ok(XValue::Num(self.to_number(&l) + self.to_number(&r))),
                    Op::Sub => Ok(XValue::Num(self.to_number(&l) - self.to_number(&r))),
                    Op::Mul => Ok(XValue::Num(self.to_number(&l) * self.to_number(&r))),
                    Op::Div => Ok(XValue::Num(self.to_number(&l) / self.to_number(&r))),
                    Op::Mod => Ok(XValue::Num(self.to_number(&l) % self.to_number(&r))),
                    _ => Ok(XValue::Bool(self.compare(*op, &l, &r))),
                }
            }
            Expr::Call(name, args) => self.call(name, args, ctx),
        }
    }

    fn node_set(&self, expr: &Expr, ctx: Ctx) -> Result<Vec<XNode>, String> {
        match self.eval(expr, ctx)? {
            XValue::Nodes(ns) => Ok(ns),
            other => Err(format!("expected a node-set, found {other:?}")),
        }
    }

    fn eval_steps(&self, start: Vec<XNode>, steps: &[Step]) -> Result<Vec<XNode>, String> {
        let mut current = start;
        for step in steps {
            let mut next = Vec::new();
            for node in &current {
                let mut matched: Vec<XNode> = self
                    .axis(*node, step.axis)
                    .into_iter()
                    .filter(|cand| self.node_test(*cand, &step.test))
                    .collect();
                for pred in &step.preds {
                    matched = self.apply_predicate(matched, pred)?;
                }
                next.extend(matched);
            }
            document_order(&mut next);
            current = next;
        }
        Ok(current)
    }

    /// Filters `nodes` (in axis order) by one predicate.
    fn apply_predicate(&self, nodes: Vec<XNode>, pred: &Expr) -> Result<Vec<XNode>, String> {
        let size = nodes.len();
        let mut kept = Vec::with_capacity(size);
        for (i, node) in nodes.into_iter().enumerate() {
            let ctx = Ctx {
                node,
                position: i + 1,
                size,
            };
            let keep = match self.eval(pred, ctx)? {
                XValue::Num(n) => (i + 1) as f64 == n,
                other => Self::to_bool(&other),
            };
            if keep {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    /// Nodes on `axis` from `node`, in axis order (reverse axes nearest first).
    fn axis(&self, node: XNode, axis: Axis) -> Vec<XNode> {
        let snap = self.snap;
        let id = match node {
            XNode::Elem(id) => id,
            XNode::Attr(owner, _) => {
                return match axis {
                    Axis::SelfAxis => vec![node],
                    Axis::Parent => vec![XNode::Elem(owner)],
                    Axis::Ancestor | Axis::AncestorOrSelf => {
                        let mut out = Vec::new();
                        if axis == Axis::AncestorOrSelf {
                            out.push(node);
                        }
                        out.push(XNode::Elem(owner));
                        out.extend(self.ancestors(owner));
                        out
                    }
                    _ => Vec::new(),
                };
            }
        };

        let elems = |ids: Vec<NodeId>| ids.into_iter().map(XNode::Elem).collect::<Vec<_>>();
        match axis {
            Axis::Child => elems(snap.children(id).to_vec()),
            Axis::Descendant => elems(snap.descendants(id)),
            Axis::DescendantOrSelf => {
                let mut out = vec![node];
                out.extend(elems(snap.descendants(id)));
                out
            }
            Axis::SelfAxis => vec![node],
            Axis::Parent => snap.parent(id).map(XNode::Elem).into_iter().collect(),
            Axis::Ancestor => self.ancestors(id),
            Axis::AncestorOrSelf => {
                let mut out = vec![node];
                out.extend(self.ancestors(id));
                out
            }
            Axis::FollowingSibling => match self.sibling_split(id) {
                Some((siblings, pos)) => elems(siblings[pos + 1..].to_vec()),
                None => Vec::new(),
            },
            Axis::PrecedingSibling => match self.sibling_split(id) {
                Some((siblings, pos)) => siblings[..pos].iter().rev().map(|&s| XNode::Elem(s)).collect(),
                None => Vec::new(),
            },
            Axis::Following => {
                // everything after this subtree, in document order
                let last = snap.descendants(id).last().copied().unwrap_or(id);
                elems(((last + 1)..=snap.len()).collect())
            }
            Axis::Preceding => {
                let ancestors: Vec<NodeId> = self.ancestors(id).iter().map(|n| n.element()).collect();
                (1..id)
                    .rev()
                    .filter(|n| !ancestors.contains(n))
                    .map(XNode::Elem)
                    .collect()
            }
            Axis::Attribute => (0..snap.node(id).attributes.len())
                .map(|k| XNode::Attr(id, k))
                .collect(),
        }
    }

    fn ancestors(&self, id: NodeId) -> Vec<XNode> {
        let mut out = Vec::new();
        let mut cur = self.snap.parent(id);
        while let Some(p) = cur {
            out.push(XNode::Elem(p));
            cur = self.snap.parent(p);
        }
        out
    }

    fn sibling_split(&self, id: NodeId) -> Option<(&'a [NodeId], usize)> {
        let snap: &'a HierarchySnapshot = self.snap;
        let parent = snap.parent(id)?;
        let siblings = snap.children(parent);
        let pos = siblings.iter().position(|&s| s == id)?;
        Some((siblings, pos))
    }

    fn node_test(&self, node: XNode, test: &NodeTest) -> bool {
        match node {
            XNode::Elem(id) if id == self.snap.document() => matches!(test, NodeTest::Node),
            XNode::Elem(id) => match test {
                NodeTest::Name(name) => self.snap.node(id).tag == *name,
                NodeTest::Wildcard | NodeTest::Node => true,
                NodeTest::Text => false,
            },
            XNode::Attr(id, k) => match test {
                NodeTest::Name(name) => self.snap.node(id).attributes[k].0 == *name,
                NodeTest::Wildcard | NodeTest::Node => true,
                NodeTest::Text => false,
            },
        }
    }

    fn compare(&self, op: Op, l: &XValue, r: &XValue) -> bool {
        match (l, r) {
            (XValue::Nodes(a), XValue::Nodes(b)) => a.iter().any(|x| {
                let xs = XValue::Str(self.string_of(*x));
                b.iter()
                    .any(|y| self.compare_atomic(op, &xs, &XValue::Str(self.string_of(*y))))
            }),
            (XValue::Nodes(a), XValue::Bool(_)) => {
                self.compare_atomic(op, &XValue::Bool(!a.is_empty()), r)
            }
            (XValue::Bool(_), XValue::Nodes(b)) => {
                self.compare_atomic(op, l, &XValue::Bool(!b.is_empty()))
            }
            (XValue::Nodes(a), _) => a
                .iter()
                .any(|x| self.compare_atomic(op, &XValue::Str(self.string_of(*x)), r)),
            (_, XValue::Nodes(b)) => b
                .iter()
                .any(|y| self.compare_atomic(op, l, &XValue::Str(self.string_of(*y)))),
            _ => self.compare_atomic(op, l, r),
        }
    }

    fn compare_atomic(&self, op: Op, l: &XValue, r: &XValue) -> bool {
        match op {
            Op::Eq | Op::Ne => {
                let equal = if matches!(l, XValue::Bool(_)) || matches!(r, XValue::Bool(_)) {
                    Self::to_bool(l) == Self::to_bool(r)
                } else if matches!(l, XValue::Num(_)) || matches!(r, XValue::Num(_)) {
                    self.to_number(l) == self.to_number(r)
                } else {
                    self.to_string(l) == self.to_string(r)
                };
                equal == (op == Op::Eq)
            }
            _ => {
                let (a, b) = (self.to_number(l), self.to_number(r));
                match a.partial_cmp(&b) {
                    None => false,
                    Some(ord) => match op {
                        Op::Lt => ord == Ordering::Less,
                        Op::Gt => ord == Ordering::Greater,
                        Op::Le => ord != Ordering::Greater,
                        Op::Ge => ord != Ordering::Less,
                        _ => false,
                    },
                }
            }
        }
    }

    fn regex(&self, pattern: &str, flags: &str) -> Option<Regex> {
        let key = (pattern.to_string(), flags.to_string());
        self.regexes
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| {
                RegexBuilder::new(pattern)
                    .case_insensitive(flags.contains('i'))
                    .build()
                    .ok()
            })
            .clone()
    }

    fn call(&self, name: &str, args: &[Expr], ctx: Ctx) -> Result<XValue, String> {
        let arity = |min: usize, max: usize| {
            if args.len() < min || args.len() > max {
                Err(format!("{name}() takes {min}..={max} arguments, got {}", args.len()))
            } else {
                Ok(())
            }
        };
        let string_arg = |i: usize| -> Result<String, String> {
            match args.get(i) {
                Some(expr) => Ok(self.to_string(&self.eval(expr, ctx)?)),
                None => Ok(self.string_of(ctx.node)),
            }
        };
        let number_arg = |i: usize| -> Result<f64, String> {
            Ok(self.to_number(&self.eval(&args[i], ctx)?))
        };

        let value = match name {
            "true" => {
                arity(0, 0)?;
                XValue::Bool(true)
            }
            "false" => {
                arity(0, 0)?;
                XValue::Bool(false)
            }
            "not" => {
                arity(1, 1)?;
                XValue::Bool(!Self::to_bool(&self.eval(&args[0], ctx)?))
            }
            "boolean" => {
                arity(1, 1)?;
                XValue::Bool(Self::to_bool(&self.eval(&args[0], ctx)?))
            }
            "position" => {
                arity(0, 0)?;
                XValue::Num(ctx.position as f64)
            }
            "last" => {
                arity(0, 0)?;
                XValue::Num(ctx.size as f64)
            }
            "count" => {
                arity(1, 1)?;
                XValue::Num(self.node_set(&args[0], ctx)?.len() as f64)
            }
            "name" | "local-name" => {
                arity(0, 1)?;
                let node = match args.first() {
                    Some(expr) => self.node_set(expr, ctx)?.first().copied(),
                    None => Some(ctx.node),
                };
                XValue::Str(match node {
                    Some(XNode::Elem(id)) => self.snap.node(id).tag.clone(),
                    Some(XNode::Attr(id, k)) => self.snap.node(id).attributes[k].0.clone(),
                    None => String::new(),
                })
            }
            "string" => {
                arity(0, 1)?;
                XValue::Str(string_arg(0)?)
            }
            "number" => {
                arity(0, 1)?;
                match args.first() {
                    Some(expr) => XValue::Num(self.to_number(&self.eval(expr, ctx)?)),
                    None => XValue::Num(string_to_number(&self.string_of(ctx.node))),
                }
            }
            "concat" => {
                if args.len() < 2 {
                    return Err("concat() takes at least 2 arguments".into());
                }
                let mut out = String::new();
                for i in 0..args.len() {
                    out.push_str(&string_arg(i)?);
                }
                XValue::Str(out)
            }
            "contains" => {
                arity(2, 2)?;
                XValue::Bool(string_arg(0)?.contains(string_arg(1)?.as_str()))
            }
            "starts-with" => {
                arity(2, 2)?;
                XValue::Bool(string_arg(0)?.starts_with(string_arg(1)?.as_str()))
            }
            "ends-with" => {
                arity(2, 2)?;
                XValue::Bool(string_arg(0)?.ends_with(string_arg(1)?.as_str()))
            }
            "substring-before" => {
                arity(2, 2)?;
                let (s, sep) = (string_arg(0)?, string_arg(1)?);
                XValue::Str(s.find(&sep).map(|i| s[..i].to_string()).unwrap_or_default())
            }
            "substring-after" => {
                arity(2, 2)?;
                let (s, sep) = (string_arg(0)?, string_arg(1)?);
                XValue::Str(
                    s.find(&sep)
                        .map(|i| s[i + sep.len()..].to_string())
                        .unwrap_or_default(),
                )
            }
            "substring" => {
                arity(2, 3)?;
                let s = string_arg(0)?;
                let start = xpath_round(number_arg(1)?);
                let end = match args.len() {
                    3 => start + xpath_round(number_arg(2)?),
                    _ => f64::INFINITY,
                };
                XValue::Str(
                    s.chars()
                        .enumerate()
                        .filter(|(i, _)| {
                            let p = (*i + 1) as f64;
                            p >= start && p < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            "string-length" => {
                arity(0, 1)?;
                XValue::Num(string_arg(0)?.chars().count() as f64)
            }
            "normalize-space" => {
                arity(0, 1)?;
                XValue::Str(string_arg(0)?.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            "translate" => {
                arity(3, 3)?;
                let (s, from, to) = (string_arg(0)?, string_arg(1)?, string_arg(2)?);
                let from: Vec<char> = from.chars().collect();
                let to: Vec<char> = to.chars().collect();
                XValue::Str(
                    s.chars()
                        .filter_map(|c| match from.iter().position(|&f| f == c) {
                            Some(i) => to.get(i).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            "sum" => {
                arity(1, 1)?;
                let nodes = self.node_set(&args[0], ctx)?;
                XValue::Num(nodes.iter().map(|n| string_to_number(&self.string_of(*n))).sum())
            }
            "floor" => {
                arity(1, 1)?;
                XValue::Num(number_arg(0)?.floor())
            }
            "ceiling" => {
                arity(1, 1)?;
                XValue::Num(number_arg(0)?.ceil())
            }
            "round" => {
                arity(1, 1)?;
                XValue::Num(xpath_round(number_arg(0)?))
            }
            "re:match" | "re:test" => {
                arity(2, 3)?;
                let input = string_arg(0)?;
                let pattern = string_arg(1)?;
                let flags = if args.len() == 3 { string_arg(2)? } else { String::new() };
                let matched = self
                    .regex(&pattern, &flags)
                    .is_some_and(|re| re.is_match(&input));
                XValue::Bool(matched)
            }
            other => return Err(format!("unknown function {other}()")),
        };
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A parsed XPath expression, reusable across snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct XPathExpr {
    source: String,
    expr: Expr,
}

impl XPathExpr {
    /// Parses `source`. Syntax errors surface as [`DeviceError::XPath`].
    pub fn parse(source: &str) -> Result<Self, DeviceError> {
        let expr = tokenize(source)
            .and_then(|toks| Parser { toks, pos: 0 }.parse())
            .map_err(|e| DeviceError::XPath(format!("{source}: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Elements selected with `context` as the context node, in document
    /// order. Attribute nodes in the result are dropped.
    pub fn select(
        &self,
        snap: &HierarchySnapshot,
        context: NodeId,
    ) -> Result<Vec<NodeId>, DeviceError> {
        let evaluator = Evaluator::new(snap);
        let ctx = Ctx {
            node: XNode::Elem(context),
            position: 1,
            size: 1,
        };
        let nodes = evaluator
            .node_set(&self.expr, ctx)
            .map_err(|e| DeviceError::XPath(format!("{}: {e}", self.source)))?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| match n {
                XNode::Elem(id) if id != snap.document() => Some(id),
                _ => None,
            })
            .collect())
    }
}
