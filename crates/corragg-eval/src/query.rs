//! Query-string helpers for replaying the records behind an event.

/// Characters with a special meaning in Lucene query syntax.
const LUCENE_SPECIAL: &[char] = &[
    '\\', '+', '-', '!', '(', ')', ':', '^', '[', ']', '"', '{', '}', '~', '*', '?', '|', '&', '/',
];

/// Backslash-escape every Lucene special character in `value`.
pub fn lucene_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if LUCENE_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_match_all(query: &str) -> bool {
    let q = query.trim();
    q.is_empty() || q == "*"
}

/// `(left) AND (right)`; an empty or match-all side yields the other side.
pub fn concat_queries(left: &str, right: &str) -> String {
    match (is_match_all(left), is_match_all(right)) {
        (true, true) => String::new(),
        (true, false) => right.trim().to_string(),
        (false, true) => left.trim().to_string(),
        (false, false) => format!("({}) AND ({})", left.trim(), right.trim()),
    }
}

/// `field:"value"` terms for each pair, joined with [`concat_queries`].
pub fn group_by_query<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs.into_iter().fold(String::new(), |acc, (field, value)| {
        concat_queries(&acc, &format!("{field}:\"{}\"", lucene_escape(value)))
    })
}
