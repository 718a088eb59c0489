//! Turns raw extracted text into a predictable lightweight markup.
//!
//! Every rule works on a single whitespace-collapsed line and produces a line
//! the same rule maps onto itself, which keeps `normalize` idempotent.

use regex::Regex;
use std::sync::LazyLock;

static PAGE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:-{2,}\s*page\s+(\d+)\s*-{2,}|\[page\s+(\d+)\])$").expect("valid regex")
});
static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[•◦▪●‣·]\s*|[*\-–—]\s+)(\S.*)$").expect("valid regex")
});
static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3})[.)]\s+(\S.*)$").expect("valid regex"));

const MAX_HEADING_CHARS: usize = 80;

pub fn normalize(raw: &str) -> String {
    let unified = raw
        .replace("\r\n", "\n")
        .replace(['\r', '\u{000c}'], "\n")
        .replace(['\u{200b}', '\u{feff}'], "");

    let mut lines: Vec<String> = Vec::new();
    for line in unified.split('\n') {
        let collapsed = collapse_whitespace(line);
        if collapsed.is_empty() {
            if lines.last().is_some_and(|last| !last.is_empty()) {
                lines.push(String::new());
            }
            continue;
        }
        lines.push(normalize_line(&collapsed));
    }

    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines.join("\n")
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_line(line: &str) -> String {
    if let Some(captures) = PAGE_SEPARATOR.captures(line) {
        let number = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().trim_start_matches('0'))
            .filter(|digits| !digits.is_empty())
            .unwrap_or("0");
        return format!("[page {number}]");
    }

    if line.starts_with('#') {
        return line.to_string();
    }

    if let Some(captures) = BULLET.captures(line) {
        return format!("- {}", &captures[1]);
    }

    if let Some(captures) = NUMBERED.captures(line) {
        return format!("{}. {}", &captures[1], &captures[2]);
    }

    if line.matches('|').count() >= 2 {
        return normalize_table_row(line);
    }

    if is_shouted_heading(line) {
        return format!("## {line}");
    }

    line.to_string()
}

fn normalize_table_row(line: &str) -> String {
    let mut cells: Vec<&str> = line.split('|').map(str::trim).collect();
    if cells.first().is_some_and(|cell| cell.is_empty()) {
        cells.remove(0);
    }
    if cells.len() > 1 && cells.last().is_some_and(|cell| cell.is_empty()) {
        cells.pop();
    }
    collapse_whitespace(&format!("| {} |", cells.join(" | ")))
}

fn is_shouted_heading(line: &str) -> bool {
    if line.chars().count() > MAX_HEADING_CHARS || line.ends_with('.') {
        return false;
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase())
}
