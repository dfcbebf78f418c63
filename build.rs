//! Source lint gate.
//!
//! Every build scans the crate's own Rust sources line by line and stops when a
//! line breaks one of the house rules in [`RULES`]. All offending lines are
//! reported together, grouped by rule.

use grep::matcher::Matcher;
use grep::regex::RegexMatcher;
use grep::searcher::Searcher;
use grep::searcher::sinks::UTF8;
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's Rust sources. Everything else in the
// checkout (reference material, target/) is left alone.
const SOURCE_ROOTS: [&str; 4] = ["stat", "cli", "tests", "benches"];

/// The part of a line a rule is applied to.
#[derive(Clone, Copy)]
enum Scope {
    /// Code with comments removed and string literal contents blanked.
    Code,
    /// The text of any comment, doc comments included.
    Comment,
    /// The text of a plain `//` comment.
    PlainComment,
}

#[derive(Clone, Copy)]
enum Test {
    /// The scoped text matches the rule's pattern.
    Matches,
    /// The scoped text has letters and every one of them is uppercase.
    Shouting,
}

struct Rule {
    name: &'static str,
    pattern: &'static str,
    scope: Scope,
    test: Test,
    hint: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed binding",
        pattern: r"\b_[a-zA-Z0-9_]+\b",
        scope: Scope::Code,
        test: Test::Matches,
        hint: "use the binding under its real name or remove it",
    },
    Rule {
        name: "dead code allowance",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        scope: Scope::Code,
        test: Test::Matches,
        hint: "delete code that nothing calls",
    },
    Rule {
        name: "revision note in comment",
        pattern: r"\b(FIX|FIXED|FIXES|CORRECTED|NEW|CHANGE|CHANGED|CHANGES|MODIFY|MODIFIED|MODIFIES|UPDATE|UPDATED|UPDATES)\b",
        scope: Scope::Comment,
        test: Test::Matches,
        hint: "comments describe the code as it is, not its history",
    },
    Rule {
        name: "emphasis in plain comment",
        pattern: r"\*\*",
        scope: Scope::PlainComment,
        test: Test::Matches,
        hint: "`**` is only allowed in doc comments",
    },
    Rule {
        name: "all-caps comment",
        pattern: r"//|/\*",
        scope: Scope::Comment,
        test: Test::Shouting,
        hint: "write comments in sentence case",
    },
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    match lint_sources(&rust_sources()) {
        Ok(report) if report.is_empty() => {}
        Ok(report) => {
            eprintln!("{report}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Source lint could not run: {e}");
            std::process::exit(1);
        }
    }
}

// All .rs files under the source roots. Missing roots are skipped.
fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .map(Path::new)
        .filter(|root| root.is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Runs every rule over every file. An empty report means the sources are clean.
fn lint_sources(paths: &[PathBuf]) -> Result<String, Box<dyn Error>> {
    let mut searcher = Searcher::new();
    let mut report = String::new();

    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        let mut offending = Vec::new();

        for path in paths {
            searcher.search_path(
                &matcher,
                path,
                UTF8(|line_number, line| {
                    if breaks(rule, &matcher, line) {
                        offending.push(format!(
                            "   {}:{line_number}: {}",
                            path.display(),
                            line.trim_end()
                        ));
                    }
                    Ok(true)
                }),
            )?;
        }

        if !offending.is_empty() {
            report.push_str(&format!(
                "\n❌ {} line(s) with a {}:\n{}\n   {}\n",
                offending.len(),
                rule.name,
                offending.join("\n"),
                rule.hint
            ));
        }
    }

    Ok(report)
}

/// The searcher only preselects lines; this decides on the scoped text.
fn breaks(rule: &Rule, matcher: &RegexMatcher, line: &str) -> bool {
    let (code, comment) = split_line(line);
    let scoped = match rule.scope {
        Scope::Code => Some(code),
        Scope::Comment => comment.map(comment_text),
        Scope::PlainComment => comment
            .filter(|c| !c.starts_with("///") && !c.starts_with("//!"))
            .map(comment_text),
    };
    let Some(text) = scoped else {
        return false;
    };
    match rule.test {
        Test::Matches => matcher.is_match(text.as_bytes()).unwrap_or(false),
        Test::Shouting => {
            let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
            letters.peek().is_some() && letters.all(char::is_uppercase)
        }
    }
}

/// Splits a line into its code, with string literal contents blanked, and the
/// comment that follows the code, if any.
fn split_line(line: &str) -> (String, Option<&str>) {
    let mut code = String::with_capacity(line.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                code.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                code.push(c);
            }
            '/' if matches!(chars.peek(), Some(&(_, '/' | '*'))) => {
                return (code, Some(&line[i..]));
            }
            _ => code.push(c),
        }
    }
    (code, None)
}

fn comment_text(comment: &str) -> String {
    comment
        .trim_start_matches(['/', '*', '!'])
        .trim_end()
        .trim_end_matches("*/")
        .trim()
        .to_string()
}
