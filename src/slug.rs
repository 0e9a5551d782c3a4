//! 标题 → URL slug
//!
//! slug 不落库，每次查找时由标题现算。

use regex::Regex;
use std::sync::LazyLock;

static RE_DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static RE_MULTI_HYPHEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--+").unwrap());

/// `"Hello, World!"` → `"hello-world"`
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped = RE_DISALLOWED.replace_all(&lowered, "");
    let hyphenated = RE_WHITESPACE.replace_all(&stripped, "-");
    let collapsed = RE_MULTI_HYPHEN.replace_all(&hyphenated, "-");
    collapsed.trim().trim_matches('-').to_string()
}
