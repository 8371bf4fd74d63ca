//! Every SQL literal handed to sqlx must be Postgres: `$n` placeholders and
//! no SQLite-only statements.

use std::fs;
use std::path::{Path, PathBuf};

const FORBIDDEN: &[(&str, &str)] = &[
    ("insert or ignore", "use ON CONFLICT DO NOTHING"),
    ("insert or replace", "use ON CONFLICT DO UPDATE"),
    ("strftime(", "use to_char or date_trunc"),
    ("datetime(", "use NOW() or timestamptz arithmetic"),
    ("autoincrement", "use gen_random_uuid() defaults"),
];

/// Markers followed by a SQL string: query calls, `format!` templates and
/// `&str` constants. The char ends the marker.
const SQL_SITES: &[(&str, char)] = &[("sqlx::query", '('), ("format!", '('), (": &str", '=')];

struct SqlLiteral {
    file: PathBuf,
    line: usize,
    text: String,
}

fn rust_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if path.is_dir() {
            rust_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

fn crumb_sources() -> Vec<PathBuf> {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    for dir in ["src", "../../libs/crumb-db/src", "../../libs/crumb-db/tests"] {
        rust_sources(&manifest.join(dir), &mut files);
    }
    files
}

/// The string literal opening right after `(` at `from`, raw or plain.
fn literal_after(content: &str, from: usize) -> Option<String> {
    let rest = content[from..].trim_start();
    if let Some(raw) = rest.strip_prefix('r') {
        let hashes = raw.len() - raw.trim_start_matches('#').len();
        let body = raw[hashes..].strip_prefix('"')?;
        let close = format!("\"{}", "#".repeat(hashes));
        return body.find(&close).map(|end| body[..end].to_string());
    }
    let body = rest.strip_prefix('"')?;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(body[..i].to_string()),
            _ => {}
        }
    }
    None
}

/// Drops `{name}` / `{:?}` interpolations so format specs are not read as SQL.
fn without_interpolations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) if !rest[open..open + close].contains(char::is_whitespace) => {
                rest = &rest[open + close + 1..];
            }
            _ => {
                out.push('{');
                rest = &rest[open + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn sql_literals() -> Vec<SqlLiteral> {
    let mut found = Vec::new();
    for file in crumb_sources() {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        for (marker, opener) in SQL_SITES {
            for (idx, _) in content.match_indices(marker) {
                let Some(open) = content[idx..].find(*opener) else {
                    continue;
                };
                if let Some(text) = literal_after(&content, idx + open + 1) {
                    found.push(SqlLiteral {
                        file: file.clone(),
                        line: content[..idx].matches('\n').count() + 1,
                        text: without_interpolations(&text),
                    });
                }
            }
        }
    }
    found
}

/// SQL here is written with upper-case keywords; prose is not.
fn looks_like_sql(text: &str) -> bool {
    ["SELECT ", "INSERT ", "UPDATE ", "DELETE ", "WHERE "]
        .iter()
        .any(|kw| text.contains(kw))
}

#[test]
fn sql_uses_postgres_placeholders_and_syntax() {
    let mut violations = Vec::new();
    for lit in sql_literals().iter().filter(|l| looks_like_sql(&l.text)) {
        let at = format!("{}:{}", lit.file.display(), lit.line);
        if lit.text.contains('?') {
            violations.push(format!("{at}: '?' placeholder, use $n"));
        }
        let lower = lit.text.to_lowercase();
        for (pattern, hint) in FORBIDDEN {
            if lower.contains(pattern) {
                violations.push(format!("{at}: '{pattern}' is SQLite-only, {hint}"));
            }
        }
    }
    assert!(violations.is_empty(), "Non-Postgres SQL found:\n{}", violations.join("\n"));
}

#[test]
fn guard_scans_both_crates() {
    let literals = sql_literals();
    for crate_file in ["api/mod.rs", "user_service_repo.rs", "pool_accounting.rs"] {
        assert!(
            literals.iter().any(|l| l.file.ends_with(crate_file)),
            "no SQL seen in {crate_file}"
        );
    }
}

#[test]
fn literal_reader_handles_raw_and_escaped_strings() {
    assert_eq!(literal_after(r##" r#"SELECT "x""#)"##, 0).as_deref(), Some(r#"SELECT "x""#));
    assert_eq!(literal_after(r#" "SELECT \"a\" WHERE id = $1")"#, 0).as_deref(), Some(r#"SELECT \"a\" WHERE id = $1"#));
    assert_eq!(literal_after("&sql)", 0), None);
}

#[test]
fn format_specs_are_not_mistaken_for_placeholders() {
    assert_eq!(without_interpolations("{ASSIGNMENT_SELECT} WHERE id = $1"), " WHERE id = $1");
    assert_eq!(without_interpolations("failed: {e:?}"), "failed: ");
    assert_eq!(without_interpolations("DEFAULT '{}'::jsonb"), "DEFAULT '::jsonb");
    assert_eq!(without_interpolations("{ a }"), "{ a }");
}
