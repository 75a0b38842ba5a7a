use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Raw grammar definition as read from a `.tmLanguage` (XML plist) or
/// `.tmLanguage.json` document.
pub struct GrammarDefinition {
    #[serde(default)]
    /// Optional human-readable name (e.g. `"Python"`).
    pub name: Option<String>,

    #[serde(default)]
    /// Root scope of the grammar (e.g. `source.python`). Required; loading
    /// fails when it is missing or empty.
    pub scope_name: String,

    #[serde(default)]
    /// File extensions associated with this grammar.
    pub file_types: Vec<String>,

    #[serde(default)]
    /// Optional regex matched against the first line of a file to detect the
    /// grammar (e.g. a shebang).
    pub first_line_match: Option<String>,

    #[serde(default)]
    /// Optional regex marking where a folding region stops.
    pub folding_stop_marker: Option<String>,

    #[serde(default)]
    /// Per-line token budget; the remainder of a line past this budget is
    /// absorbed into a single filler token.
    pub max_tokens_per_line: Option<usize>,

    #[serde(default)]
    /// Maximum line length in bytes; longer lines are truncated before
    /// tokenization and patched back afterwards.
    pub max_line_length: Option<usize>,

    #[serde(default)]
    /// Top-level pattern list.
    pub patterns: Vec<RawPattern>,

    #[serde(default)]
    /// Named sub-rules referenced with `include: "#name"`.
    pub repository: HashMap<String, RawPattern>,

    #[serde(default)]
    /// Injection patterns keyed by scope selector. Parsed and carried, but
    /// selector matching is not implemented; the map is never scanned.
    pub injections: HashMap<String, RawPattern>,

    #[serde(default)]
    /// Scope selector controlling where this grammar injects itself.
    /// Not supported; a grammar carrying this fails to load.
    pub injection_selector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A single pattern description: one of `match`, `begin`+`end`, or `include`.
pub struct RawPattern {
    #[serde(default)]
    /// Scope applied to the matched text.
    pub name: Option<String>,

    #[serde(default)]
    /// Scope applied to the text between `begin` and `end` (exclusive).
    pub content_name: Option<String>,

    #[serde(default, rename = "match")]
    /// Regex producing a single token.
    pub match_source: Option<String>,

    #[serde(default)]
    /// Regex opening a nested begin/end span.
    pub begin: Option<String>,

    #[serde(default)]
    /// Regex closing a begin/end span. May contain `\N` back-references into
    /// the begin match's capture groups.
    pub end: Option<String>,

    #[serde(default)]
    /// Reference to another rule: `#name`, `$self`, `$base`, `scope.name`, or
    /// `scope.name#rule`.
    pub include: Option<String>,

    #[serde(default)]
    /// Nested patterns active inside a begin/end span.
    pub patterns: Vec<RawPattern>,

    #[serde(default)]
    /// Per-capture-group scopes for `match` patterns (and the fallback for
    /// `begin`/`end` when the specific maps are absent).
    pub captures: BTreeMap<String, RawCapture>,

    #[serde(default)]
    /// Per-capture-group scopes for the `begin` match.
    pub begin_captures: BTreeMap<String, RawCapture>,

    #[serde(default)]
    /// Per-capture-group scopes for the `end` match.
    pub end_captures: BTreeMap<String, RawCapture>,

    #[serde(default)]
    /// Disabled patterns are skipped at rule compilation.
    pub disabled: Option<FlagValue>,

    #[serde(default)]
    /// When set, the end pattern is tried after the nested patterns instead
    /// of before them.
    pub apply_end_pattern_last: Option<FlagValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Scope specification for one capture group.
pub struct RawCapture {
    #[serde(default)]
    /// Scope applied to the capture group's span.
    pub name: Option<String>,

    #[serde(default)]
    /// Nested patterns re-tokenizing the capture's text. Not supported;
    /// using such a capture fails at match time.
    pub patterns: Vec<RawPattern>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
/// A boolean flag that `.tmLanguage` files encode as either a real boolean or
/// an integer (`<true/>` vs `<integer>1</integer>`).
pub enum FlagValue {
    /// A plist/JSON boolean.
    Bool(bool),
    /// A plist/JSON integer; non-zero means set.
    Number(i64),
}

impl FlagValue {
    /// Whether the flag is set.
    pub fn is_set(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::Number(value) => value != 0,
        }
    }
}

/// Whether an optional flag field is set.
pub(crate) fn flag_set(flag: Option<FlagValue>) -> bool {
    flag.is_some_and(FlagValue::is_set)
}
