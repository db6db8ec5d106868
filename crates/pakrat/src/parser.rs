//! The grammar-combinator engine.
//!
//! Rules live in an arena owned by a [`Grammar`] and reference each other by
//! [`RuleId`], so recursive grammars form no ownership cycles; dropping the
//! grammar frees the whole graph. A [`Rule`] is a copyable handle used to
//! compose rules with operators and to attach names, actions and semantic
//! predicates. Evaluation is packrat: results are memoized per rule and
//! input position, which keeps recursive descent linear for typical
//! grammars.
//!
//! The type parameter `A` is the consumer's action argument, in practice the
//! AST node type (see [`crate::ast`]). Actions are not run during matching;
//! they ride along on the produced [`Match`] records and fire when a
//! consumer walks the tree post-order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{BitOr, Div, Neg, Not, Shr};
use std::rc::Rc;

use cranelift_entity::{entity_impl, PrimaryMap};

use crate::lexer::Cursor;
use crate::TokenKind;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RuleId(u32);

entity_impl! { RuleId }

pub type ActionFn<A> = Rc<dyn Fn(&A)>;
pub type CheckFn<A> = Rc<dyn for<'a> Fn(&Match<'a, A>) -> bool>;

/// The result of applying a rule at a token position, a node in the parse
/// tree.
///
/// Children are retained on failure too; walking a failed match to its
/// farthest-reaching descendant is how consumers report where a parse went
/// wrong.
pub struct Match<'a, A> {
    pub matched: bool,
    pub name: Rc<str>,
    pub begin: Cursor<'a>,
    pub end: Cursor<'a>,
    pub action: Option<ActionFn<A>>,
    pub children: Vec<Rc<Match<'a, A>>>,
}

impl<'a, A> Match<'a, A> {
    /// Reconstructs the matched text by concatenating the token texts over
    /// `[begin, end)`. Failed matches reconstruct as empty.
    ///
    /// The walk recurses through the children so that spans consumed under a
    /// toggled newline flag (inside a `newline(..)` wrapper) are replayed
    /// with the flag that was in effect when they were scanned; a flat
    /// replay from `begin` would re-suppress the surfaced whitespace.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if !self.matched {
            return;
        }
        let end = self.end.span().start;
        if self.children.is_empty() {
            replay_tokens(self.begin, end, out);
            return;
        }
        let mut cursor = self.begin;
        for child in &self.children {
            if cursor.span().start < child.begin.span().start {
                cursor = replay_tokens(cursor, child.begin.span().start, out);
            }
            child.collect_text(out);
            if child.end.span().start > cursor.span().start {
                cursor = child.end;
            }
        }
        // tokens consumed by the rule itself rather than a child, like the
        // one a negation eats
        if cursor.span().start < end {
            replay_tokens(cursor, end, out);
        }
    }

    /// The rightmost position reached by any successful match in this
    /// subtree. For a failed top-level match this is the best guess at
    /// where the input stopped making sense.
    pub fn farthest_end(&self) -> Cursor<'a> {
        let mut best = if self.matched { self.end } else { self.begin };
        for child in &self.children {
            let end = child.farthest_end();
            if end.span().start > best.span().start {
                best = end;
            }
        }
        best
    }
}

impl<A> std::fmt::Display for Match<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text())
    }
}

/// Pushes token texts from `cursor` up to the `until` byte offset, returning
/// the cursor left at the boundary.
fn replay_tokens<'a>(mut cursor: Cursor<'a>, until: u32, out: &mut String) -> Cursor<'a> {
    while !cursor.is_eof() && cursor.span().start < until {
        out.push_str(cursor.text());
        match cursor.advance() {
            Ok(next) => cursor = next,
            Err(_) => break,
        }
    }
    cursor
}

/// How a rule matches. Composite variants refer to other rules in the same
/// grammar by id.
#[derive(Clone)]
enum Matcher {
    /// Forward-declared and not yet defined. Applying it is a programming
    /// error.
    Undefined,
    Terminal(TokenKind),
    Regex(Rc<regex::Regex>),
    Seq(RuleId, RuleId),
    Choice(RuleId, RuleId),
    Star(RuleId),
    Plus(RuleId),
    Until(RuleId, RuleId),
    Opt(RuleId),
    Not(RuleId),
    Newline(RuleId),
}

struct RuleData<A> {
    name: Rc<str>,
    matcher: Matcher,
    /// True iff the rule cannot match without consuming at least one token,
    /// used to short-circuit at end of stream.
    must_consume: bool,
    action: Option<ActionFn<A>>,
    check: Option<CheckFn<A>>,
}

impl<A> Clone for RuleData<A> {
    fn clone(&self) -> Self {
        RuleData {
            name: self.name.clone(),
            matcher: self.matcher.clone(),
            must_consume: self.must_consume,
            action: self.action.clone(),
            check: self.check.clone(),
        }
    }
}

/// The rule arena. Construction flows through copyable [`Rule`] handles, so
/// the arena is behind a `RefCell`; nothing mutates it while a match is in
/// progress.
pub struct Grammar<A = ()> {
    rules: RefCell<PrimaryMap<RuleId, RuleData<A>>>,
}

impl<A> Default for Grammar<A> {
    fn default() -> Self {
        Grammar::new()
    }
}

impl<A> Grammar<A> {
    pub fn new() -> Grammar<A> {
        Grammar {
            rules: RefCell::new(PrimaryMap::new()),
        }
    }

    fn alloc(&self, name: &str, matcher: Matcher, must_consume: bool) -> Rule<'_, A> {
        let id = self.rules.borrow_mut().push(RuleData {
            name: Rc::from(name),
            matcher,
            must_consume,
            action: None,
            check: None,
        });
        Rule { grammar: self, id }
    }

    /// Matches exactly one token of the given kind.
    pub fn terminal(&self, kind: TokenKind) -> Rule<'_, A> {
        self.alloc("terminal", Matcher::Terminal(kind), true)
    }

    /// Matches one token whose text matches the pattern in full.
    ///
    /// An invalid pattern is a programming error.
    pub fn regex(&self, pattern: &str) -> Rule<'_, A> {
        let anchored = format!("^(?:{pattern})$");
        let regex = regex::Regex::new(&anchored).expect("invalid rule pattern");
        self.alloc("regex", Matcher::Regex(Rc::new(regex)), true)
    }

    /// An empty rule to be filled in later with [`Rule::define`], enabling
    /// recursive grammars.
    pub fn forward(&self, name: &str) -> Rule<'_, A> {
        self.alloc(name, Matcher::Undefined, false)
    }

    /// Makes whitespace runs containing a newline significant while `rule`
    /// is matching, restoring suppression afterwards.
    pub fn newline(&self, rule: Rule<'_, A>) -> Rule<'_, A> {
        let must_consume = rule.must_consume();
        self.alloc("newline", Matcher::Newline(rule.id), must_consume)
    }
}

/// A copyable handle to a rule in a [`Grammar`].
pub struct Rule<'g, A> {
    grammar: &'g Grammar<A>,
    pub id: RuleId,
}

impl<'g, A> Clone for Rule<'g, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, A> Copy for Rule<'g, A> {}

impl<'g, A> Rule<'g, A> {
    pub fn name(&self) -> Rc<str> {
        self.grammar.rules.borrow()[self.id].name.clone()
    }

    pub fn named(self, name: &str) -> Self {
        self.grammar.rules.borrow_mut()[self.id].name = Rc::from(name);
        self
    }

    fn must_consume(&self) -> bool {
        self.grammar.rules.borrow()[self.id].must_consume
    }

    /// Attaches an action. On a successful match it is carried on the
    /// resulting [`Match`] and invoked when a consumer walks the tree.
    pub fn action(self, action: impl Fn(&A) + 'static) -> Self {
        self.grammar.rules.borrow_mut()[self.id].action = Some(Rc::new(action));
        self
    }

    /// Attaches a semantic predicate. It runs right after the rule matches;
    /// returning false downgrades the match to a failure at the original
    /// position.
    pub fn check(self, check: impl for<'a> Fn(&Match<'a, A>) -> bool + 'static) -> Self {
        self.grammar.rules.borrow_mut()[self.id].check = Some(Rc::new(check));
        self
    }

    /// Replaces this rule's contents with `source`'s, keeping the handle
    /// stable. Handles captured before the call see the new definition,
    /// which is what makes forward declarations work.
    pub fn define(self, source: Rule<'g, A>) {
        debug_assert!(std::ptr::eq(self.grammar, source.grammar));
        let mut rules = self.grammar.rules.borrow_mut();
        let data = rules[source.id].clone();
        rules[self.id] = data;
    }

    /// Clears the rule back to the undefined state, dropping its action and
    /// predicate.
    pub fn reset(self) {
        let mut rules = self.grammar.rules.borrow_mut();
        let rule = &mut rules[self.id];
        rule.matcher = Matcher::Undefined;
        rule.must_consume = false;
        rule.action = None;
        rule.check = None;
    }

    /// Greedy repetition, zero or more. Always matches.
    pub fn star(self) -> Self {
        let name = format!("kleene->{}", self.name());
        self.grammar.alloc(&name, Matcher::Star(self.id), false)
    }

    /// One or more, `a` then `a.star()`.
    pub fn plus(self) -> Self {
        let must_consume = self.must_consume();
        self.grammar.alloc("plus", Matcher::Plus(self.id), must_consume)
    }

    /// Applies the rule at `at`, memoizing every rule application for the
    /// duration of the call.
    pub fn get_match<'a>(&self, at: Cursor<'a>) -> Rc<Match<'a, A>> {
        let mut memo = Memo::default();
        self.grammar.eval(&mut memo, self.id, at)
    }
}

/// Sequence: `a >> b`.
impl<'g, A> Shr for Rule<'g, A> {
    type Output = Rule<'g, A>;

    fn shr(self, rhs: Self) -> Self::Output {
        debug_assert!(std::ptr::eq(self.grammar, rhs.grammar));
        let must_consume = self.must_consume() || rhs.must_consume();
        self.grammar
            .alloc("order", Matcher::Seq(self.id, rhs.id), must_consume)
    }
}

/// Ordered choice: `a | b`, left-biased.
impl<'g, A> BitOr for Rule<'g, A> {
    type Output = Rule<'g, A>;

    fn bitor(self, rhs: Self) -> Self::Output {
        debug_assert!(std::ptr::eq(self.grammar, rhs.grammar));
        let must_consume = self.must_consume() || rhs.must_consume();
        self.grammar
            .alloc("or", Matcher::Choice(self.id, rhs.id), must_consume)
    }
}

/// Non-greedy until: `a / b` repeats `a` until `b` matches, requiring `b`.
impl<'g, A> Div for Rule<'g, A> {
    type Output = Rule<'g, A>;

    fn div(self, rhs: Self) -> Self::Output {
        debug_assert!(std::ptr::eq(self.grammar, rhs.grammar));
        let must_consume = self.must_consume() || rhs.must_consume();
        self.grammar
            .alloc("until", Matcher::Until(self.id, rhs.id), must_consume)
    }
}

/// Optional: `-a`. Always matches.
impl<'g, A> Neg for Rule<'g, A> {
    type Output = Rule<'g, A>;

    fn neg(self) -> Self::Output {
        self.grammar.alloc("optional", Matcher::Opt(self.id), false)
    }
}

/// Negation: `!a` matches iff `a` fails, consuming one token.
impl<'g, A> Not for Rule<'g, A> {
    type Output = Rule<'g, A>;

    fn not(self) -> Self::Output {
        self.grammar.alloc("not", Matcher::Not(self.id), true)
    }
}

/// Packrat table for one evaluation, keyed by rule and input position (the
/// newline flag is part of the position, a toggled cursor reads a different
/// token stream).
struct Memo<'a, A> {
    table: HashMap<(RuleId, u32, bool), Rc<Match<'a, A>>>,
}

impl<'a, A> Default for Memo<'a, A> {
    fn default() -> Self {
        Memo {
            table: HashMap::new(),
        }
    }
}

impl<A> Grammar<A> {
    fn eval<'a>(&self, memo: &mut Memo<'a, A>, id: RuleId, at: Cursor<'a>) -> Rc<Match<'a, A>> {
        let key = (id, at.span().start, at.newlines_significant());
        if let Some(hit) = memo.table.get(&key) {
            return hit.clone();
        }

        // snapshot the rule so no arena borrow lives across the recursion
        let (name, matcher, must_consume, action, check) = {
            let rules = self.rules.borrow();
            let rule = &rules[id];
            (
                rule.name.clone(),
                rule.matcher.clone(),
                rule.must_consume,
                rule.action.clone(),
                rule.check.clone(),
            )
        };

        if must_consume && at.is_eof() {
            let fail = Rc::new(Match {
                matched: false,
                name,
                begin: at,
                end: at,
                action: None,
                children: Vec::new(),
            });
            memo.table.insert(key, fail.clone());
            return fail;
        }

        let (matched, end, children) = match matcher {
            Matcher::Undefined => panic!("rule {name:?} applied before being defined"),

            Matcher::Terminal(kind) => {
                if at.kind() == kind {
                    self.consume_one(at)
                } else {
                    (false, at, Vec::new())
                }
            }

            Matcher::Regex(regex) => {
                if regex.is_match(at.text()) {
                    self.consume_one(at)
                } else {
                    (false, at, Vec::new())
                }
            }

            Matcher::Seq(left, right) => {
                let first = self.eval(memo, left, at);
                if !first.matched {
                    (false, at, vec![first])
                } else {
                    let second = self.eval(memo, right, first.end);
                    let matched = second.matched;
                    let end = if matched { second.end } else { at };
                    (matched, end, vec![first, second])
                }
            }

            Matcher::Choice(left, right) => {
                let first = self.eval(memo, left, at);
                if first.matched {
                    (true, first.end, vec![first])
                } else {
                    let second = self.eval(memo, right, at);
                    if second.matched {
                        (true, second.end, vec![second])
                    } else {
                        // both failed, keep the alternative whose partial
                        // parse reached farthest
                        let first_reach = first.farthest_end().span().start;
                        let second_reach = second.farthest_end().span().start;
                        let best = if second_reach > first_reach {
                            second
                        } else {
                            first
                        };
                        (false, at, vec![best])
                    }
                }
            }

            Matcher::Star(inner) => {
                let mut children = Vec::new();
                let mut cursor = at;
                while !cursor.is_eof() {
                    let attempt = self.eval(memo, inner, cursor);
                    let matched = attempt.matched;
                    let end = attempt.end;
                    children.push(attempt);
                    if !matched || end.span().start == cursor.span().start {
                        break;
                    }
                    cursor = end;
                }
                (true, cursor, children)
            }

            Matcher::Plus(inner) => {
                let first = self.eval(memo, inner, at);
                if !first.matched {
                    (false, at, vec![first])
                } else {
                    let mut cursor = first.end;
                    let mut stalled = cursor.span().start == at.span().start;
                    let mut children = vec![first];
                    while !stalled && !cursor.is_eof() {
                        let attempt = self.eval(memo, inner, cursor);
                        let matched = attempt.matched;
                        let end = attempt.end;
                        stalled = end.span().start == cursor.span().start;
                        children.push(attempt);
                        if !matched {
                            break;
                        }
                        cursor = end;
                    }
                    (true, cursor, children)
                }
            }

            Matcher::Until(body, stop) => {
                let mut children = Vec::new();
                let mut cursor = at;
                let mut stopped = false;
                while !cursor.is_eof() {
                    let stop_match = self.eval(memo, stop, cursor);
                    if stop_match.matched {
                        cursor = stop_match.end;
                        children.push(stop_match);
                        stopped = true;
                        break;
                    }
                    let body_match = self.eval(memo, body, cursor);
                    let matched = body_match.matched;
                    let end = body_match.end;
                    children.push(body_match);
                    if !matched || end.span().start == cursor.span().start {
                        break;
                    }
                    cursor = end;
                }
                if stopped {
                    (true, cursor, children)
                } else {
                    (false, at, children)
                }
            }

            Matcher::Opt(inner) => {
                let attempt = self.eval(memo, inner, at);
                let end = if attempt.matched { attempt.end } else { at };
                (true, end, vec![attempt])
            }

            Matcher::Not(inner) => {
                let attempt = self.eval(memo, inner, at);
                if attempt.matched {
                    (false, at, vec![attempt])
                } else {
                    let (ok, end, _) = self.consume_one(at);
                    (ok, end, vec![attempt])
                }
            }

            Matcher::Newline(inner) => {
                let attempt = self.eval(memo, inner, at.start_newline());
                let matched = attempt.matched;
                let end = if matched {
                    attempt.end.stop_newline()
                } else {
                    at
                };
                (matched, end, vec![attempt])
            }
        };

        let mut result = Match {
            matched,
            name,
            begin: at,
            end,
            // the action is only attached to successful matches
            action: if matched { action } else { None },
            children,
        };
        debug_assert!(result.matched || result.end.span().start == at.span().start);

        if result.matched {
            if let Some(check) = check {
                if !check(&result) {
                    result.matched = false;
                    result.end = at;
                    result.action = None;
                }
            }
        }

        let result = Rc::new(result);
        memo.table.insert(key, result.clone());
        result
    }

    /// Consumes the current token. A lexing error while producing the next
    /// token is reported to the diagnostic sink and becomes a failure at the
    /// starting position.
    fn consume_one<'a>(&self, at: Cursor<'a>) -> (bool, Cursor<'a>, Vec<Rc<Match<'a, A>>>) {
        match at.advance() {
            Ok(next) => (true, next, Vec::new()),
            Err(err) => {
                log::error!("{err}");
                (false, at, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::TokenKind::*;
    use std::cell::Cell;

    fn count_named<A>(m: &Match<'_, A>, name: &str) -> usize {
        let here = (&*m.name == name && m.matched) as usize;
        here + m
            .children
            .iter()
            .map(|c| count_named(c, name))
            .sum::<usize>()
    }

    #[test]
    fn terminal_consumes_one_token() {
        let lexer = Lexer::new("abc 42");
        let g = Grammar::<()>::new();
        let ident = g.terminal(Identifier);

        let m = ident.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end - m.begin, 1);
        assert_eq!(m.text(), "abc");

        let number = g.terminal(NumberLiteral);
        let m = number.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn regex_is_anchored() {
        let lexer = Lexer::new("abc");
        let g = Grammar::<()>::new();
        assert!(g.regex("abc").get_match(lexer.begin().unwrap()).matched);
        assert!(!g.regex("ab").get_match(lexer.begin().unwrap()).matched);
        assert!(g.regex("[a-z]+").get_match(lexer.begin().unwrap()).matched);
    }

    #[test]
    fn sequence_consumes_both_or_nothing() {
        let g = Grammar::<()>::new();
        let pair = g.terminal(Identifier) >> g.terminal(NumberLiteral);

        let lexer = Lexer::new("x 1");
        let m = pair.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end - m.begin, 2);
        assert_eq!(m.children.len(), 2);
        assert_eq!(m.to_string(), "x1");

        let lexer = Lexer::new("x y");
        let m = pair.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
        assert_eq!(m.children.len(), 2);
        assert!(m.children[0].matched);
        assert!(!m.children[1].matched);
    }

    #[test]
    fn choice_is_left_biased() {
        let g = Grammar::<()>::new();
        let rule = g.regex("[a-z]+").named("lower") | g.terminal(Identifier);

        let lexer = Lexer::new("abc");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.children.len(), 1);
        assert_eq!(&*m.children[0].name, "lower");
    }

    #[test]
    fn choice_keeps_farthest_failure() {
        let g = Grammar::<()>::new();
        let semi = g.regex(";");
        let short = g.terminal(Identifier) >> semi;
        let long = g.terminal(Identifier) >> g.terminal(NumberLiteral) >> g.terminal(NumberLiteral);
        let rule = short | long;

        // `short` dies at offset 2, `long` gets to offset 5
        let lexer = Lexer::new("x 42 ;");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.children.len(), 1);
        assert_eq!(m.children[0].farthest_end().span().start, 5);
        assert_eq!(m.farthest_end().span().start, 5);
    }

    #[test]
    fn star_always_matches() {
        let g = Grammar::<()>::new();
        let idents = g.terminal(Identifier).star();

        let lexer = Lexer::new("a b c");
        let m = idents.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.end.is_eof());
        assert_eq!(m.children.iter().filter(|c| c.matched).count(), 3);

        let lexer = Lexer::new("42");
        let m = idents.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end, m.begin);

        let lexer = Lexer::new("");
        let m = idents.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.end.is_eof());
    }

    #[test]
    fn star_terminates_on_nullable_rule() {
        let g = Grammar::<()>::new();
        let rule = (-g.terminal(NumberLiteral)).star();

        let lexer = Lexer::new("x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn plus_children_are_the_iterations() {
        let g = Grammar::<()>::new();
        let rule = (g.terminal(Identifier) | g.terminal(NumberLiteral)).plus();

        let lexer = Lexer::new("foo 42 bar");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.end.is_eof());
        assert_eq!(m.children.len(), 3);
        assert!(m.children.iter().all(|c| c.matched));

        let lexer = Lexer::new("; x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn until_stops_at_the_terminator() {
        let g = Grammar::<()>::new();
        let anything = g.regex(".*");
        let semi = g.regex(";");
        let rule = anything / semi;

        let lexer = Lexer::new("x y ; z");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.text(), "xy;");
        assert!(!m.end.is_eof());
        assert_eq!(m.end.text(), "z");

        // terminator never found
        let lexer = Lexer::new("x y z");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn until_terminates_on_nullable_body() {
        let g = Grammar::<()>::new();
        let rule = (-g.terminal(Identifier)) / g.regex(";");

        let lexer = Lexer::new("42 x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn optional_always_matches() {
        let g = Grammar::<()>::new();
        let rule = -g.terminal(Identifier);

        let lexer = Lexer::new("x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end - m.begin, 1);

        let lexer = Lexer::new("42");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end, m.begin);

        // the attempt is kept as a child at end of input too
        let lexer = Lexer::new("");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.end.is_eof());
        assert_eq!(m.children.len(), 1);
        assert!(!m.children[0].matched);

        // a nullable inner rule still matches, and its match is retained
        let nullable = -g.terminal(Identifier).star();
        let m = nullable.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.children.len(), 1);
        assert!(m.children[0].matched);
    }

    #[test]
    fn negation_consumes_one_token_on_success() {
        let g = Grammar::<()>::new();
        let rule = !g.terminal(Identifier);

        let lexer = Lexer::new("42 x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert_eq!(m.end - m.begin, 1);
        // the consumed token is covered by no child, reconstruction picks
        // it up anyway
        assert_eq!(m.text(), "42");

        let lexer = Lexer::new("x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);

        let lexer = Lexer::new("");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
    }

    #[test]
    fn rules_fail_fast_at_end_of_stream() {
        let g = Grammar::<()>::new();
        let lexer = Lexer::new("");
        let m = g.terminal(Identifier).get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert!(m.children.is_empty());
    }

    #[test]
    fn forward_declared_rule_recurses() {
        let g = Grammar::<()>::new();
        let expr = g.forward("expression");
        let sub = g.regex(r"\(") >> expr >> g.regex(r"\)");
        expr.define(g.terminal(Identifier) | sub);
        let expr = expr.named("expression");

        let lexer = Lexer::new("((x))");
        let m = expr.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.end.is_eof());
        assert_eq!(count_named(&m, "expression"), 3);

        let lexer = Lexer::new("((x)");
        let m = expr.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
    }

    #[test]
    #[should_panic(expected = "applied before being defined")]
    fn undefined_forward_rule_panics() {
        let g = Grammar::<()>::new();
        let lexer = Lexer::new("x");
        let _ = g.forward("later").get_match(lexer.begin().unwrap());
    }

    #[test]
    fn reset_then_redefine() {
        let g = Grammar::<()>::new();
        let rule = g.forward("rule");
        rule.define(g.terminal(Identifier));

        let lexer = Lexer::new("x");
        assert!(rule.get_match(lexer.begin().unwrap()).matched);

        rule.reset();
        rule.define(g.terminal(NumberLiteral));
        assert!(!rule.get_match(lexer.begin().unwrap()).matched);
        let lexer = Lexer::new("42");
        assert!(rule.get_match(lexer.begin().unwrap()).matched);
    }

    #[test]
    fn get_match_is_consistent() {
        let g = Grammar::<()>::new();
        let rule = (g.terminal(Identifier) >> g.regex("=") >> g.terminal(NumberLiteral)).star();

        let lexer = Lexer::new("a = 1 b = 2");
        let first = rule.get_match(lexer.begin().unwrap());
        let second = rule.get_match(lexer.begin().unwrap());
        assert_eq!(first.matched, second.matched);
        assert_eq!(first.end, second.end);
        assert_eq!(first.text(), second.text());
    }

    #[test]
    fn memoization_reuses_results_across_alternatives() {
        let g = Grammar::<()>::new();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let ident = g.terminal(Identifier).check(move |_| {
            seen.set(seen.get() + 1);
            true
        });
        let rule = (ident >> g.terminal(NumberLiteral)) | (ident >> g.terminal(StringLiteral));

        let lexer = Lexer::new("x \"s\"");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        // the second alternative hit the memo instead of re-running the
        // predicate
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn predicate_downgrades_match() {
        let g = Grammar::<()>::new();
        let keyword = g.terminal(Identifier).check(|m| m.text() == "if");

        let lexer = Lexer::new("if");
        assert!(keyword.get_match(lexer.begin().unwrap()).matched);

        let lexer = Lexer::new("x");
        let m = keyword.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }

    #[test]
    fn action_rides_on_the_match() {
        let g = Grammar::<()>::new();
        let rule = g.terminal(Identifier).action(|_| {});

        let lexer = Lexer::new("x");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(m.action.is_some());

        let bare = g.terminal(NumberLiteral);
        let lexer = Lexer::new("1");
        assert!(bare.get_match(lexer.begin().unwrap()).action.is_none());

        // failed matches carry no action
        let lexer = Lexer::new("42");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert!(m.action.is_none());
    }

    #[test]
    fn newline_wrapper_toggles_significance() {
        let g = Grammar::<()>::new();
        let ident = g.terminal(Identifier);
        let line_break = g.terminal(Whitespace);
        let pair = g.newline(ident >> line_break >> ident);

        let lexer = Lexer::new("x\ny");
        let m = pair.get_match(lexer.begin().unwrap());
        assert!(m.matched);
        assert!(!m.end.newlines_significant());
        // reconstruction replays the span with newlines significant, so the
        // surfaced whitespace token is not lost
        assert_eq!(m.text(), "x\ny");

        // without the wrapper the newline run stays suppressed
        let bare = g.terminal(Identifier) >> g.terminal(Whitespace) >> g.terminal(Identifier);
        let m = bare.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
    }

    #[test]
    fn lexing_error_becomes_a_failed_match() {
        let g = Grammar::<()>::new();
        let rule = g.terminal(Identifier).plus();

        let lexer = Lexer::new("x \"unterminated");
        let m = rule.get_match(lexer.begin().unwrap());
        assert!(!m.matched);
        assert_eq!(m.end, m.begin);
    }
}
