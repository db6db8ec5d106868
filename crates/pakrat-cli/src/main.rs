//! Demonstration driver: lexes a file, parses it with a small C-like
//! grammar and writes DOT graphs of the parse tree and the collapsed AST.

use std::env::args;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pakrat::ast::{self, Node};
use pakrat::{Cursor, Grammar, Lexer, Rule, TokenKind};

fn main() {
    init_logger();
    if run().is_err() {
        std::process::exit(1);
    }
}

fn init_logger() {
    let level = std::env::var("PAKRAT_LOG").unwrap_or_else(|_| "info".to_string());
    let level = log::LevelFilter::from_str(&level).unwrap_or(log::LevelFilter::Info);
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Never,
    );
}

fn run() -> Result<(), ()> {
    let args = args().skip(1).collect::<Vec<_>>();

    let mut do_tokens = false;
    let mut do_parse_dot = false;
    let mut do_ast_dot = false;
    let mut files = Vec::new();

    for arg in args.iter().map(String::as_str) {
        match arg {
            "--tokens" => do_tokens = true,
            "--parse-dot" => do_parse_dot = true,
            "--ast-dot" => do_ast_dot = true,
            "--help" => {
                eprintln!("USAGE: pakrat-cli [--tokens] [--parse-dot] [--ast-dot] input_file");
                return Ok(());
            }
            _ => files.push(arg),
        }
    }

    match files.len() {
        0 => {
            eprintln!("No file provided");
            return Err(());
        }
        1 => {}
        _ => {
            eprintln!("Only one file may be provided");
            return Err(());
        }
    }

    let path: PathBuf = files.pop().unwrap().into();
    let src = std::fs::read_to_string(&path).map_err(|e| {
        eprintln!("Failed to read `{}`\n  {e}", path.display());
    })?;

    let lexer = Lexer::new(&src);

    if do_tokens {
        for token in lexer.iter() {
            match token {
                Ok(token) => println!("{:>13}: {}", format!("{:?}", token.kind()), token.text()),
                Err(err) => {
                    eprintln!("ERROR: {err}");
                    break;
                }
            }
        }
    }

    let grammar = Grammar::<Node>::new();
    let start = demo_grammar(&grammar);

    let begin = lexer.begin().map_err(|err| {
        eprintln!("ERROR: {err}");
    })?;
    let m = start.get_match(begin);
    let failed = !m.matched || !m.end.is_eof();

    if failed {
        report_failure(&src, &path, m.farthest_end());
    }

    if do_parse_dot {
        let root = Node::with_name("root");
        ast::parse_tree(&m, &root);
        write_dot_file(Path::new("parse.dot"), &root)?;
    }

    if do_ast_dot {
        let root = Node::with_name("root");
        for child in &m.children {
            ast::build(child, &root, failed);
        }
        write_dot_file(Path::new("ast.dot"), &root)?;
    }

    if failed {
        return Err(());
    }
    Ok(())
}

/// A small C-like demonstration grammar: comments, include directives,
/// simple declarations and parenthesized expressions.
fn demo_grammar(g: &Grammar<Node>) -> Rule<'_, Node> {
    let open_comment = g.regex(r"/\*.*");
    let close_comment = g.regex(r"[^\\]*\*/");
    let anything = g.regex(".*");

    let comment = (g.terminal(TokenKind::Comment) | (open_comment >> (anything / close_comment)))
        .named("comment")
        .action(|_| {});

    let ident = g
        .terminal(TokenKind::Identifier)
        .named("id")
        .action(|n| ast::literal(TokenKind::Identifier, n));

    let string = g
        .terminal(TokenKind::StringLiteral)
        .action(|n| ast::literal(TokenKind::StringLiteral, n));
    let include = (g.regex("#")
        >> g.regex("include")
        >> (string | (g.regex("<") >> g.terminal(TokenKind::Identifier) >> g.regex(">"))))
    .named("include")
    .action(|_| {});

    let keyword = g.regex("int") | g.regex("float") | g.regex("double");
    let semi = g.regex(";").named("semi");
    let declaration = (keyword >> ident >> (anything / semi))
        .named("declaration")
        .action(|_| {});

    let expression = g.forward("expression");
    let subexpression = (g.regex(r"\(") >> expression >> g.regex(r"\)")).action(ast::use_middle);
    expression.define(subexpression | anything);
    let expression = expression.named("expression");

    (comment | include | declaration | expression)
        .plus()
        .named("unit")
}

fn report_failure(src: &str, path: &Path, at: Cursor) {
    let offset = at.span().start as usize;
    let line_number = src[..offset].bytes().filter(|&b| b == b'\n').count() + 1;
    let line_start = src[..offset].rfind('\n').map_or(0, |i| i + 1);
    let line_end = src[offset..].find('\n').map_or(src.len(), |i| offset + i);
    eprintln!("ERROR: failed to parse");
    eprintln!(
        "{}:{}: {}",
        path.display(),
        line_number,
        &src[line_start..line_end]
    );
}

fn write_dot_file(path: &Path, root: &Node) -> Result<(), ()> {
    let mut out = String::new();
    ast::write_dot(root, &mut out).expect("writing to a string cannot fail");
    std::fs::write(path, out).map_err(|e| {
        eprintln!("Failed to write `{}`\n  {e}", path.display());
    })
}
