//! AST nodes and the tree-rewrite helpers invoked from rule actions.
//!
//! [`build`] walks a match tree post-order, creating a [`Node`] per match
//! and running the match's action on it (or [`skip_node`] when there is
//! none). Actions then call the helpers here to collapse redundant grammar
//! structure into a compact tree. Children own their subtrees while parent
//! links are weak back-references; every helper rewrites the links in place.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{self, Write};
use std::rc::{Rc, Weak};

use crate::parser::Match;
use crate::TokenKind;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Invalid,
    Value,
    Assignment,
    Expression,
    StringExpression,
}

/// Opaque handle to a scope owned by the consumer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ScopeId(pub u32);

/// A node's semantic value.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Uint(u64),
    Float(f64),
    Scope(ScopeId),
    Str(String),
}

impl Default for Value {
    fn default() -> Value {
        Value::Uint(0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Scope(s) => write!(f, "scope#{}", s.0),
            Value::Str(s) => f.write_str(s),
        }
    }
}

pub struct NodeData {
    pub kind: NodeKind,
    pub name: String,
    pub text: String,
    pub value: Value,
    pub parent: Weak<RefCell<NodeData>>,
    pub children: Vec<Node>,
}

/// A cheap-clone handle to a tree node. Children are owned through the
/// handle, the parent link never owns.
#[derive(Clone)]
pub struct Node(Rc<RefCell<NodeData>>);

impl Node {
    pub fn new() -> Node {
        Node(Rc::new(RefCell::new(NodeData {
            kind: NodeKind::Invalid,
            name: String::new(),
            text: String::new(),
            value: Value::default(),
            parent: Weak::new(),
            children: Vec::new(),
        })))
    }

    pub fn with_name(name: &str) -> Node {
        let node = Node::new();
        node.data_mut().name = name.to_string();
        node
    }

    pub fn data(&self) -> Ref<'_, NodeData> {
        self.0.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, NodeData> {
        self.0.borrow_mut()
    }

    pub fn parent(&self) -> Option<Node> {
        self.data().parent.upgrade().map(Node)
    }

    /// Handles to the node's children, in source order.
    pub fn children(&self) -> Vec<Node> {
        self.data().children.clone()
    }

    pub fn push_child(&self, child: Node) {
        child.data_mut().parent = self.downgrade();
        self.data_mut().children.push(child);
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn downgrade(&self) -> Weak<RefCell<NodeData>> {
        Rc::downgrade(&self.0)
    }
}

impl Default for Node {
    fn default() -> Node {
        Node::new()
    }
}

/// Splices `node`'s children into its parent at `node`'s slot and removes
/// `node`. Childless nodes are left alone, and skipping an already skipped
/// node is a no-op.
pub fn skip_node(node: &Node) {
    let Some(parent) = node.parent() else { return };
    let slot = parent.data().children.iter().position(|c| c.ptr_eq(node));
    let Some(slot) = slot else {
        debug_assert!(node.data().children.is_empty());
        return;
    };
    if node.data().children.is_empty() {
        return;
    }
    let children = std::mem::take(&mut node.data_mut().children);
    for child in &children {
        child.data_mut().parent = parent.downgrade();
    }
    parent.data_mut().children.splice(slot..=slot, children);
}

/// Keeps only the middle of exactly three children (dropping, say, the
/// parentheses around an expression), then splices like [`skip_node`].
pub fn use_middle(node: &Node) {
    {
        let mut data = node.data_mut();
        assert!(
            data.children.len() == 3,
            "use_middle requires exactly three children, got {}",
            data.children.len()
        );
        let middle = data.children.remove(1);
        data.children.clear();
        data.children.push(middle);
    }
    skip_node(node);
}

/// Removes `node` from its parent, discarding its subtree.
pub fn remove_node(node: &Node) {
    let Some(parent) = node.parent() else { return };
    let slot = parent.data().children.iter().position(|c| c.ptr_eq(node));
    if let Some(slot) = slot {
        parent.data_mut().children.remove(slot);
    }
}

/// Drops every child that has no children of its own.
pub fn remove_terminals(node: &Node) {
    node.data_mut()
        .children
        .retain(|child| !child.data().children.is_empty());
}

/// Drops every child whose text matches the pattern in full, e.g. to strip
/// separator punctuation.
pub fn remove_terminals_match(node: &Node, pattern: &str) {
    let regex = anchored(pattern);
    node.data_mut()
        .children
        .retain(|child| !regex.is_match(&child.data().text));
}

/// Partitions the children around the first one whose text matches the
/// pattern, returning the prefix and the suffix. Without a match the whole
/// child list is the prefix.
pub fn split_match(node: &Node, pattern: &str) -> (Vec<Node>, Vec<Node>) {
    let regex = anchored(pattern);
    let data = node.data();
    match data
        .children
        .iter()
        .position(|child| regex.is_match(&child.data().text))
    {
        Some(at) => (
            data.children[..at].to_vec(),
            data.children[at + 1..].to_vec(),
        ),
        None => (data.children.clone(), Vec::new()),
    }
}

fn anchored(pattern: &str) -> regex::Regex {
    regex::Regex::new(&format!("^(?:{pattern})$")).expect("invalid pattern")
}

/// Turns a node holding raw token text into a value node: identifiers keep
/// their text, numbers go through [`to_number`], string literals are
/// unescaped.
pub fn literal(kind: TokenKind, node: &Node) {
    let mut data = node.data_mut();
    data.kind = NodeKind::Value;
    match kind {
        TokenKind::Identifier => {
            data.name = "IDENTIFIER".to_string();
            data.value = Value::Str(data.text.clone());
        }
        TokenKind::NumberLiteral => {
            data.name = "NUMBER".to_string();
            match to_number(&data.text) {
                Some(value) => data.value = value,
                None => log::warn!("bad number literal {:?}", data.text),
            }
        }
        TokenKind::StringLiteral => {
            data.name = "STRING".to_string();
            data.value = Value::Str(unescape(&data.text));
            data.children.clear();
        }
        other => panic!("not a literal token kind: {other:?}"),
    }
    debug_assert!(data.children.is_empty());
}

/// Parses a number literal: decimal by default, hexadecimal after `0x`,
/// floating point when a `.` is present. Trailing garbage fails.
pub fn to_number(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    if let Some(hex) = text.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok().map(Value::Uint);
    }
    if text.contains('.') {
        return text.parse::<f64>().ok().map(Value::Float);
    }
    text.parse::<u64>().ok().map(Value::Uint)
}

/// Strips the delimiter quotes and resolves `\"`, `\n` and `\r`. Other
/// escape pairs, `\\` included, are kept verbatim.
fn unescape(text: &str) -> String {
    let inner = text.strip_prefix('"').unwrap_or(text);
    let inner = inner.strip_suffix('"').unwrap_or(inner);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Maps an operator lexeme to a readable name.
pub fn op_to_name(op: &str) -> String {
    let name = match op {
        "+" => "plus",
        "-" => "minus",
        "*" => "mul",
        "/" => "div",
        "%" => "mod",
        "&" => "bin_and",
        "|" => "bin_or",
        "<<" => "left shift",
        ">>" => "right shift",
        "==" => "equals",
        "!=" => "not equals",
        "<" => "less than",
        ">" => "greater than",
        "<=" => "lte",
        ">=" => "gte",
        "&&" => "logical_and",
        "||" => "logical_or",
        "++" => "unary_plus",
        "--" => "unary_minus",
        _ => return format!("I DONT KNOW {op}"),
    };
    name.to_string()
}

/// Collapses a unary operator node: the first child names the operation and
/// is removed. Single-child nodes pass through.
pub fn unary_operator(node: &Node) {
    if node.data().children.len() <= 1 {
        skip_node(node);
        return;
    }
    let name = {
        let data = node.data();
        let child_data = data.children[0].data();
        op_to_name(&child_data.text)
    };
    let mut data = node.data_mut();
    data.name = name;
    data.children.remove(0);
}

/// Collapses a binary operator node: the second child names the operation
/// and every operator child is removed, leaving the operands. Single-child
/// nodes pass through.
pub fn binary_operator(node: &Node) {
    let len = node.data().children.len();
    if len <= 1 {
        skip_node(node);
        return;
    }
    assert!(len >= 3, "binary operator node needs operands around the operator");
    let name = {
        let data = node.data();
        let child_data = data.children[1].data();
        op_to_name(&child_data.text)
    };
    let mut data = node.data_mut();
    data.name = name;
    let mut index = 1;
    while index < data.children.len() {
        data.children.remove(index);
        index += 1;
    }
}

/// Post-order walk of a match tree that builds the AST. Each non-empty
/// match becomes a node under `parent`; after its children are built, the
/// match's action runs on it, or the node is spliced away by [`skip_node`]
/// when the rule carries no action. With `keep_failures` set, empty matches
/// produce nodes too, which keeps failed parses inspectable.
pub fn build(m: &Match<'_, Node>, parent: &Node, keep_failures: bool) {
    let text = m.text();
    if text.is_empty() && !keep_failures {
        return;
    }
    let node = Node::new();
    {
        let mut data = node.data_mut();
        data.name = m.name.to_string();
        data.text = text;
    }
    parent.push_child(node.clone());
    for child in &m.children {
        build(child, &node, keep_failures);
    }
    match &m.action {
        Some(action) => action(&node),
        None => skip_node(&node),
    }
}

/// Mirrors a match tree into nodes verbatim, one node per match, actions
/// ignored. Useful for visualizing the raw parse.
pub fn parse_tree<A>(m: &Match<'_, A>, parent: &Node) {
    let node = Node::new();
    {
        let mut data = node.data_mut();
        data.name = m.name.to_string();
        data.text = m.text();
    }
    parent.push_child(node.clone());
    for child in &m.children {
        parse_tree(child, &node);
    }
}

/// Writes the tree rooted at `node` as a DOT digraph.
pub fn write_dot(node: &Node, out: &mut dyn Write) -> fmt::Result {
    writeln!(out, "digraph ast {{")?;
    let mut counter = 0u64;
    dot_node(node, out, &mut counter)?;
    writeln!(out, "}}")
}

fn dot_node(node: &Node, out: &mut dyn Write, counter: &mut u64) -> Result<String, fmt::Error> {
    let data = node.data();
    let id = format!("{}{}", dot_ident(&data.name), counter);
    *counter += 1;

    let label = match data.kind {
        NodeKind::Value => data.value.to_string(),
        _ => data.text.clone(),
    };
    writeln!(
        out,
        "{} [label=\"{} - {}\"];",
        id,
        dot_label(&data.name),
        dot_label(&label)
    )?;

    let mut child_ids = Vec::new();
    for child in &data.children {
        child_ids.push(dot_node(child, out, counter)?);
    }
    for child_id in &child_ids {
        writeln!(out, "{} -> {};", id, child_id)?;
    }
    Ok(id)
}

fn dot_ident(name: &str) -> String {
    let mut id: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if id.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}

fn dot_label(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' | '\r' => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
fn leaf(text: &str) -> Node {
    let node = Node::new();
    node.data_mut().text = text.to_string();
    node
}

#[cfg(test)]
fn texts(node: &Node) -> Vec<String> {
    node.children()
        .iter()
        .map(|c| c.data().text.clone())
        .collect()
}

#[test]
fn skip_node_splices_children_into_parent() {
    let root = Node::with_name("root");
    let middle = Node::with_name("middle");
    root.push_child(leaf("before"));
    root.push_child(middle.clone());
    root.push_child(leaf("after"));
    middle.push_child(leaf("a"));
    middle.push_child(leaf("b"));

    skip_node(&middle);
    assert_eq!(texts(&root), vec!["before", "a", "b", "after"]);
    assert!(root.children()[1].parent().unwrap().ptr_eq(&root));

    // skipping again is a no-op
    skip_node(&middle);
    assert_eq!(texts(&root), vec!["before", "a", "b", "after"]);
}

#[test]
fn skip_node_leaves_terminals_alone() {
    let root = Node::with_name("root");
    let terminal = leaf("t");
    root.push_child(terminal.clone());
    skip_node(&terminal);
    assert_eq!(texts(&root), vec!["t"]);
}

#[test]
fn use_middle_drops_the_delimiters() {
    let root = Node::with_name("root");
    let parens = Node::with_name("parens");
    root.push_child(parens.clone());
    parens.push_child(leaf("("));
    parens.push_child(leaf("x"));
    parens.push_child(leaf(")"));

    use_middle(&parens);
    assert_eq!(texts(&root), vec!["x"]);
    assert!(root.children()[0].parent().unwrap().ptr_eq(&root));
}

#[test]
#[should_panic(expected = "three children")]
fn use_middle_checks_arity() {
    let root = Node::with_name("root");
    let node = Node::with_name("pair");
    root.push_child(node.clone());
    node.push_child(leaf("a"));
    node.push_child(leaf("b"));
    use_middle(&node);
}

#[test]
fn remove_node_discards_the_subtree() {
    let root = Node::with_name("root");
    let doomed = Node::with_name("doomed");
    root.push_child(leaf("keep"));
    root.push_child(doomed.clone());
    doomed.push_child(leaf("child"));

    remove_node(&doomed);
    assert_eq!(texts(&root), vec!["keep"]);
}

#[test]
fn remove_terminals_drops_childless_children() {
    let root = Node::with_name("root");
    let nested = Node::with_name("nested");
    nested.push_child(leaf("grandchild"));
    root.push_child(leaf(";"));
    root.push_child(nested);
    root.push_child(leaf(","));

    remove_terminals(&root);
    let names: Vec<String> = root
        .children()
        .iter()
        .map(|c| c.data().name.clone())
        .collect();
    assert_eq!(names, vec!["nested"]);
}

#[test]
fn remove_terminals_match_strips_separators() {
    let root = Node::with_name("root");
    for text in ["a", ",", "b", ",", "c"] {
        root.push_child(leaf(text));
    }
    remove_terminals_match(&root, ",");
    assert_eq!(texts(&root), vec!["a", "b", "c"]);
}

#[test]
fn split_match_partitions_around_the_separator() {
    let root = Node::with_name("root");
    for text in ["a", "b", "=", "c"] {
        root.push_child(leaf(text));
    }

    let (before, after) = split_match(&root, "=");
    let before: Vec<String> = before.iter().map(|n| n.data().text.clone()).collect();
    let after: Vec<String> = after.iter().map(|n| n.data().text.clone()).collect();
    assert_eq!(before, vec!["a", "b"]);
    assert_eq!(after, vec!["c"]);

    let (before, after) = split_match(&root, ";");
    assert_eq!(before.len(), 4);
    assert!(after.is_empty());
}

#[rustfmt::skip]
#[test]
fn to_number_cases() {
    assert_eq!(to_number("0xFF"),  Some(Value::Uint(255)));
    assert_eq!(to_number("10"),    Some(Value::Uint(10)));
    assert_eq!(to_number("3.14"),  Some(Value::Float(3.14)));
    assert_eq!(to_number(""),      None);
    assert_eq!(to_number("12abc"), None);
    assert_eq!(to_number("0x"),    None);
    assert_eq!(to_number("1.2.3"), None);
}

#[test]
fn literal_identifier_keeps_text() {
    let node = leaf("foo");
    literal(TokenKind::Identifier, &node);
    let data = node.data();
    assert_eq!(data.kind, NodeKind::Value);
    assert_eq!(data.name, "IDENTIFIER");
    assert_eq!(data.value, Value::Str("foo".to_string()));
}

#[test]
fn literal_number_converts() {
    let node = leaf("0x10");
    literal(TokenKind::NumberLiteral, &node);
    assert_eq!(node.data().value, Value::Uint(16));
}

#[test]
fn literal_string_unescapes() {
    let node = leaf(r#""a\nb""#);
    literal(TokenKind::StringLiteral, &node);
    assert_eq!(node.data().value, Value::Str("a\nb".to_string()));

    let node = leaf(r#""he said \"hi\"""#);
    literal(TokenKind::StringLiteral, &node);
    assert_eq!(node.data().value, Value::Str(r#"he said "hi""#.to_string()));

    // an escaped backslash stays verbatim and stops the escape
    let node = leaf(r#""a\\nb""#);
    literal(TokenKind::StringLiteral, &node);
    assert_eq!(node.data().value, Value::Str(r"a\\nb".to_string()));
}

#[rustfmt::skip]
#[test]
fn op_to_name_table() {
    assert_eq!(op_to_name("+"),  "plus");
    assert_eq!(op_to_name(">>"), "right shift");
    assert_eq!(op_to_name("<="), "lte");
    assert_eq!(op_to_name("&&"), "logical_and");
    assert_eq!(op_to_name("--"), "unary_minus");
    assert_eq!(op_to_name("@"),  "I DONT KNOW @");
}

#[test]
fn unary_operator_names_the_node() {
    let root = Node::with_name("root");
    let node = Node::with_name("unary");
    root.push_child(node.clone());
    node.push_child(leaf("-"));
    node.push_child(leaf("x"));

    unary_operator(&node);
    assert_eq!(node.data().name, "minus");
    assert_eq!(texts(&node), vec!["x"]);
}

#[test]
fn binary_operator_keeps_operands() {
    let root = Node::with_name("root");
    let node = Node::with_name("binary");
    root.push_child(node.clone());
    for text in ["a", "+", "b", "+", "c"] {
        node.push_child(leaf(text));
    }

    binary_operator(&node);
    assert_eq!(node.data().name, "plus");
    assert_eq!(texts(&node), vec!["a", "b", "c"]);
}

#[test]
fn operator_helpers_pass_single_children_through() {
    let root = Node::with_name("root");
    let node = Node::with_name("unary");
    root.push_child(node.clone());
    node.push_child(leaf("x"));

    unary_operator(&node);
    assert_eq!(texts(&root), vec!["x"]);
}

#[test]
fn build_runs_actions_post_order() {
    use crate::lexer::Lexer;
    use crate::parser::Grammar;

    let g = Grammar::<Node>::new();
    let number = g
        .terminal(TokenKind::NumberLiteral)
        .action(|n| literal(TokenKind::NumberLiteral, n));
    let list = number.plus().named("list").action(|_| {});

    let lexer = Lexer::new("0xFF 10 3.14");
    let m = list.get_match(lexer.begin().unwrap());
    assert!(m.matched && m.end.is_eof());

    let root = Node::with_name("root");
    build(&m, &root, false);

    let list_node = &root.children()[0];
    assert_eq!(list_node.data().name, "list");
    let values: Vec<Value> = list_node
        .children()
        .iter()
        .map(|c| c.data().value.clone())
        .collect();
    assert_eq!(
        values,
        vec![Value::Uint(255), Value::Uint(10), Value::Float(3.14)]
    );
}

#[test]
fn build_collapses_actionless_rules() {
    use crate::lexer::Lexer;
    use crate::parser::Grammar;

    let g = Grammar::<Node>::new();
    let expr = g.forward("expression");
    let sub = (g.regex(r"\(") >> expr >> g.regex(r"\)")).action(use_middle);
    let ident = g
        .terminal(TokenKind::Identifier)
        .action(|n| literal(TokenKind::Identifier, n));
    expr.define(ident | sub);

    let lexer = Lexer::new("((x))");
    let m = expr.get_match(lexer.begin().unwrap());
    assert!(m.matched && m.end.is_eof());

    let root = Node::with_name("root");
    build(&m, &root, false);

    // all the grammar scaffolding collapsed away
    assert_eq!(root.children().len(), 1);
    let value = &root.children()[0];
    assert_eq!(value.data().name, "IDENTIFIER");
    assert_eq!(value.data().value, Value::Str("x".to_string()));
}

#[test]
fn parse_tree_mirrors_matches() {
    use crate::lexer::Lexer;
    use crate::parser::Grammar;

    let g = Grammar::<()>::new();
    let pair = g.terminal(TokenKind::Identifier) >> g.terminal(TokenKind::NumberLiteral);

    let lexer = Lexer::new("x 1");
    let m = pair.get_match(lexer.begin().unwrap());

    let root = Node::with_name("root");
    parse_tree(&m, &root);
    let order = &root.children()[0];
    assert_eq!(order.data().name, "order");
    assert_eq!(order.data().text, "x1");
    assert_eq!(order.children().len(), 2);
}

#[test]
fn dot_output_is_well_formed() {
    let root = Node::with_name("root");
    let child = leaf("say \"hi\"\n");
    child.data_mut().name = "kleene->x".to_string();
    root.push_child(child);

    let mut out = String::new();
    write_dot(&root, &mut out).unwrap();
    assert!(out.starts_with("digraph ast {"));
    assert!(out.ends_with("}\n"));
    assert!(out.contains("root0 [label=\"root - \"];"));
    assert!(out.contains("kleene__x1 [label=\"kleene->x - say \\\"hi\\\"_\"];"));
    assert!(out.contains("root0 -> kleene__x1;"));
}
