use crate::definition::{RawCapture, RawPattern, flag_set};
use crate::error::GrammarError;
use crate::grammar::Grammar;
use crate::registry::GrammarRegistry;
use crate::rule::{Rule, RuleStack, StackEntry};
use crate::scanner::CaptureIndex;
use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::LazyLock;

/// `\N` back-references inside an end pattern's source.
static BACK_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(\d+)").expect("valid back-reference regex"));

/// `$1` / `${1:/downcase}` capture substitutions inside a scope name.
static CAPTURE_TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+)|\$\{(\d+):/(downcase|upcase)\}").expect("valid capture-template regex")
});

/// Replaces anchors that are dead at the current scan position. U+FFFF is a
/// noncharacter and cannot occur in scanned text.
const UNMATCHABLE: char = '\u{FFFF}';

/// Scope specification for one capture group, compiled from the raw map.
#[derive(Debug, Clone)]
pub(crate) struct CaptureSpec {
    name: Option<String>,
    has_patterns: bool,
}

/// A single lexical rule: either a plain `match` producing a token, or the
/// `begin` side of a begin/end pair that pushes a sub-rule onto the stack.
/// The paired end pattern is itself a `Pattern` with `pop_rule` set.
#[derive(Debug)]
pub(crate) struct Pattern {
    grammar_scope: Rc<str>,
    pub(crate) scope_name: Option<String>,
    pub(crate) include: Option<String>,
    pop_rule: bool,
    has_back_references: bool,
    /// Matchable regex source. `None` for include patterns and for end
    /// patterns whose back-references are still unresolved.
    regex_source: Option<String>,
    /// Raw `match` source held until `resolve_back_references`.
    back_reference_source: Option<String>,
    captures: Option<BTreeMap<u32, CaptureSpec>>,
    pub(crate) push_rule: Option<Rc<Rule>>,
    anchored: bool,
}

impl Pattern {
    /// Compile a raw pattern description into a `Pattern`.
    pub(crate) fn compile(grammar: &Grammar, raw: &RawPattern) -> Result<Rc<Self>, GrammarError> {
        if let Some(include) = &raw.include {
            return Ok(Rc::new(Self {
                grammar_scope: grammar.scope_rc(),
                scope_name: raw.name.clone(),
                include: Some(include.clone()),
                pop_rule: false,
                has_back_references: false,
                regex_source: None,
                back_reference_source: None,
                captures: None,
                push_rule: None,
                anchored: false,
            }));
        }

        if let Some(begin) = &raw.begin {
            // A begin pattern with no end never closes; compile the end side
            // as unmatchable so the span runs to the end of input.
            let end_source = raw.end.as_deref().unwrap_or("\u{FFFF}");
            let begin_captures = pick_captures(&raw.begin_captures, &raw.captures);
            let end_captures = pick_captures(&raw.end_captures, &raw.captures);

            let end_pattern = Rc::new(Self::match_pattern(
                grammar.scope_rc(),
                end_source,
                None,
                compile_captures(end_captures),
                true,
                None,
            ));
            let push_rule = Rc::new(Rule::compile(
                grammar,
                raw.name.clone(),
                raw.content_name.clone(),
                &raw.patterns,
                Some(end_pattern),
                flag_set(raw.apply_end_pattern_last),
            )?);

            return Ok(Rc::new(Self {
                grammar_scope: grammar.scope_rc(),
                scope_name: raw.name.clone(),
                include: None,
                pop_rule: false,
                has_back_references: false,
                regex_source: Some(begin.clone()),
                back_reference_source: None,
                captures: compile_captures(begin_captures),
                push_rule: Some(push_rule),
                anchored: has_anchor(begin),
            }));
        }

        let source = raw.match_source.as_deref().unwrap_or(UNMATCHABLE_STR);
        Ok(Rc::new(Self::match_pattern(
            grammar.scope_rc(),
            source,
            raw.name.clone(),
            compile_captures(&raw.captures),
            false,
            None,
        )))
    }

    /// Build a plain `match` pattern. When the pattern pops a rule and its
    /// source carries back-references, the source is held unresolved until a
    /// begin match supplies the captured text.
    fn match_pattern(
        grammar_scope: Rc<str>,
        source: &str,
        scope_name: Option<String>,
        captures: Option<BTreeMap<u32, CaptureSpec>>,
        pop_rule: bool,
        has_back_references: Option<bool>,
    ) -> Self {
        let has_back_references =
            has_back_references.unwrap_or_else(|| BACK_REFERENCE.is_match(source));
        let (regex_source, back_reference_source) = if pop_rule && has_back_references {
            (None, Some(source.to_string()))
        } else {
            (Some(source.to_string()), None)
        };
        let anchored = regex_source.as_deref().is_some_and(has_anchor);
        Self {
            grammar_scope,
            scope_name,
            include: None,
            pop_rule,
            has_back_references,
            regex_source,
            back_reference_source,
            captures,
            push_rule: None,
            anchored,
        }
    }

    pub(crate) fn is_anchored(&self) -> bool {
        self.anchored
    }

    pub(crate) fn has_back_references(&self) -> bool {
        self.has_back_references
    }

    /// The regex source to compile for the given scan context. Anchored
    /// patterns are rewritten per position, so compiled regexes may only be
    /// cached keyed by the two booleans.
    pub(crate) fn regex_source(&self, first_line: bool, at_anchor: bool) -> Cow<'_, str> {
        let Some(source) = self.regex_source.as_deref() else {
            return Cow::Borrowed(UNMATCHABLE_STR);
        };
        if self.anchored {
            Cow::Owned(replace_anchor(source, first_line, at_anchor))
        } else {
            Cow::Borrowed(source)
        }
    }

    /// Substitute the text captured by the begin match into this end
    /// pattern's `\N` back-references, producing a fresh pattern specialized
    /// to one begin/end span. The shared pattern is never mutated: the same
    /// begin pattern may open many spans with different captured text.
    pub(crate) fn resolve_back_references(
        &self,
        line: &str,
        begin_capture_indices: &[CaptureIndex],
    ) -> Rc<Self> {
        let captured: Vec<&str> = begin_capture_indices
            .iter()
            .map(|capture| line.get(capture.start..capture.end).unwrap_or(""))
            .collect();

        let source = self.back_reference_source.as_deref().unwrap_or_default();
        let mut resolved = String::with_capacity(source.len());
        let mut last = 0usize;
        for groups in BACK_REFERENCE.captures_iter(source) {
            let (Some(whole), Some(digits)) = (groups.get(0), groups.get(1)) else {
                continue;
            };
            resolved.push_str(&source[last..whole.start()]);
            let replacement = digits
                .as_str()
                .parse::<usize>()
                .ok()
                .and_then(|group| captured.get(group).copied())
                .filter(|text| !text.is_empty())
                .map(regex::escape);
            match replacement {
                Some(escaped) => resolved.push_str(&escaped),
                None => resolved.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        resolved.push_str(&source[last..]);

        Rc::new(Self::match_pattern(
            self.grammar_scope.clone(),
            &resolved,
            None,
            self.captures.clone(),
            self.pop_rule,
            Some(false),
        ))
    }

    /// Resolve an `include` reference to the rule it names.
    pub(crate) fn rule_for_include(
        &self,
        base_grammar: &Rc<Grammar>,
        name: &str,
        registry: &GrammarRegistry,
    ) -> Result<Option<Rc<Rule>>, GrammarError> {
        let own_grammar = registry.grammar_for_scope_name(&self.grammar_scope);

        if let Some(rule_name) = name.strip_prefix('#') {
            let Some(grammar) = own_grammar else {
                return Ok(None);
            };
            return grammar.repository_rule(rule_name);
        }

        if let Some(hash) = name.find('#') {
            let grammar_scope = &name[..hash];
            let rule_name = &name[hash + 1..];
            if let Some(grammar) = &own_grammar {
                grammar.add_included_grammar_scope(grammar_scope);
            }
            return match registry.grammar_for_scope_name(grammar_scope) {
                Some(grammar) => grammar.repository_rule(rule_name),
                None => Ok(None),
            };
        }

        match name {
            "$self" => match own_grammar {
                Some(grammar) => Ok(Some(grammar.get_initial_rule()?)),
                None => Ok(None),
            },
            "$base" => Ok(Some(base_grammar.get_initial_rule()?)),
            _ => {
                if let Some(grammar) = &own_grammar {
                    grammar.add_included_grammar_scope(name);
                }
                match registry.grammar_for_scope_name(name) {
                    Some(grammar) => Ok(Some(grammar.get_initial_rule()?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Flatten this pattern into the concrete patterns it contributes to a
    /// scanner: itself, or the expansion of the rule it includes.
    pub(crate) fn included_patterns(
        self: &Rc<Self>,
        base_grammar: &Rc<Grammar>,
        included: &mut Vec<Rc<Rule>>,
        registry: &GrammarRegistry,
    ) -> Result<Vec<Rc<Self>>, GrammarError> {
        let Some(include) = &self.include else {
            return Ok(vec![self.clone()]);
        };
        match self.rule_for_include(base_grammar, include, registry)? {
            Some(rule) => rule.included_patterns(base_grammar, included, registry),
            None => Ok(Vec::new()),
        }
    }

    /// Emit the tags for a match of this pattern and update the rule stack.
    ///
    /// Returns `Ok(None)` when a zero-width pop would ping-pong with the
    /// zero-width push that opened the span; the caller must treat this as
    /// "no progress" and stop scanning the line.
    pub(crate) fn handle_match(
        &self,
        stack: &mut RuleStack,
        line: &str,
        capture_indices: &[CaptureIndex],
        registry: &GrammarRegistry,
    ) -> Result<Option<Vec<i32>>, GrammarError> {
        let Some(first) = capture_indices.first().copied() else {
            return Ok(None);
        };
        let zero_width_match = first.start == first.end;

        let mut tags = Vec::new();
        let mut scope_name: Option<String> = None;

        if self.pop_rule {
            let Some(top) = stack.entries.last() else {
                return Ok(None);
            };
            if zero_width_match
                && top.zero_width_match
                && top.rule.anchor_position() == first.end as isize
            {
                return Ok(None);
            }
            if let Some(content) = top.content_scope_name.clone() {
                tags.push(registry.end_id_for_scope(&content));
            }
        } else if let Some(name) = &self.scope_name {
            let resolved = resolve_scope_name(name)?;
            tags.push(registry.start_id_for_scope(&resolved));
            scope_name = Some(resolved);
        }

        if let Some(captures) = &self.captures {
            let mut cursor = CaptureCursor::new(capture_indices);
            tags.extend(tags_for_capture_indices(
                captures,
                &mut cursor,
                registry,
            )?);
        } else if first.end != first.start {
            tags.push((first.end - first.start) as i32);
        }

        if let Some(push_rule) = &self.push_rule {
            let rule_to_push = push_rule.get_rule_to_push(line, capture_indices);
            rule_to_push.set_anchor_position(first.end as isize);
            let content_scope_name = match rule_to_push.content_scope_name() {
                Some(content) => {
                    let resolved = resolve_scope_name(content)?;
                    tags.push(registry.start_id_for_scope(&resolved));
                    Some(resolved)
                }
                None => None,
            };
            stack.entries.push(StackEntry {
                rule: rule_to_push,
                scope_name,
                content_scope_name,
                zero_width_match,
            });
        } else {
            if self.pop_rule {
                scope_name = stack.entries.pop().and_then(|entry| entry.scope_name);
            }
            if let Some(name) = scope_name {
                tags.push(registry.end_id_for_scope(&name));
            }
        }

        Ok(Some(tags))
    }
}

const UNMATCHABLE_STR: &str = "\u{FFFF}";

fn pick_captures<'a>(
    specific: &'a BTreeMap<String, RawCapture>,
    fallback: &'a BTreeMap<String, RawCapture>,
) -> &'a BTreeMap<String, RawCapture> {
    if specific.is_empty() { fallback } else { specific }
}

fn compile_captures(raw: &BTreeMap<String, RawCapture>) -> Option<BTreeMap<u32, CaptureSpec>> {
    if raw.is_empty() {
        return None;
    }
    let mut compiled = BTreeMap::new();
    for (key, capture) in raw {
        let Ok(index) = key.parse::<u32>() else {
            continue;
        };
        compiled.insert(
            index,
            CaptureSpec {
                name: capture.name.clone(),
                has_patterns: !capture.patterns.is_empty(),
            },
        );
    }
    Some(compiled)
}

/// Capture-index scope-name substitution is deliberately not implemented;
/// reject it rather than guessing its semantics.
fn resolve_scope_name(scope_name: &str) -> Result<String, GrammarError> {
    if CAPTURE_TEMPLATE.is_match(scope_name) {
        return Err(GrammarError::Unsupported(
            "capture-index substitution in scope names",
        ));
    }
    Ok(scope_name.to_string())
}

/// Partition a match span into nested scoped sub-spans, one recursion level
/// per parent capture. Empty captures and captures without a spec contribute
/// no scope; gaps between child captures fall through to the parent.
fn tags_for_capture_indices(
    captures: &BTreeMap<u32, CaptureSpec>,
    cursor: &mut CaptureCursor<'_>,
    registry: &GrammarRegistry,
) -> Result<Vec<i32>, GrammarError> {
    let Some(parent) = cursor.next() else {
        return Ok(Vec::new());
    };

    let mut tags = Vec::new();
    let mut parent_scope: Option<String> = None;
    if let Some(spec) = captures.get(&parent.index) {
        if let Some(name) = &spec.name {
            let resolved = resolve_scope_name(name)?;
            tags.push(registry.start_id_for_scope(&resolved));
            parent_scope = Some(resolved);
        }
        if spec.has_patterns {
            return Err(GrammarError::Unsupported(
                "capture groups with nested patterns",
            ));
        }
    }

    let mut previous_child_end = parent.start;
    while let Some(child) = cursor.peek() {
        if child.start >= parent.end {
            break;
        }
        let empty_capture = child.end == child.start;
        if empty_capture || !captures.contains_key(&child.index) {
            cursor.next();
            continue;
        }

        let child_start = child.start;
        let child_end = child.end;
        if child_start > previous_child_end {
            tags.push((child_start - previous_child_end) as i32);
        }
        tags.extend(tags_for_capture_indices(captures, cursor, registry)?);
        previous_child_end = child_end;
    }
    if parent.end > previous_child_end {
        tags.push((parent.end - previous_child_end) as i32);
    }

    if let Some(name) = parent_scope {
        if tags.len() > 1 {
            tags.push(registry.end_id_for_scope(&name));
        } else {
            // The scope covered nothing; retract its start tag.
            tags.pop();
        }
    }

    Ok(tags)
}

struct CaptureCursor<'a> {
    items: &'a [CaptureIndex],
    position: usize,
}

impl<'a> CaptureCursor<'a> {
    fn new(items: &'a [CaptureIndex]) -> Self {
        Self { items, position: 0 }
    }

    fn peek(&self) -> Option<CaptureIndex> {
        self.items.get(self.position).copied()
    }

    fn next(&mut self) -> Option<CaptureIndex> {
        let item = self.items.get(self.position).copied();
        if item.is_some() {
            self.position += 1;
        }
        item
    }
}

/// Escape-aware scan for an unescaped `\A`, `\G`, or `\z`.
fn has_anchor(source: &str) -> bool {
    let mut escape = false;
    for character in source.chars() {
        if escape && matches!(character, 'A' | 'G' | 'z') {
            return true;
        }
        escape = !escape && character == '\\';
    }
    false
}

/// Rewrite position-dependent anchors for one scan context: `\A` survives
/// only on the first line, `\G` only when scanning exactly at the anchor
/// position, and `\z` becomes an end-of-string assertion that does not match
/// before an embedded newline.
fn replace_anchor(source: &str, first_line: bool, at_anchor: bool) -> String {
    let mut rewritten = String::with_capacity(source.len());
    let mut escape = false;
    for character in source.chars() {
        if escape {
            match character {
                'A' => {
                    if first_line {
                        rewritten.push('\\');
                        rewritten.push('A');
                    } else {
                        rewritten.push(UNMATCHABLE);
                    }
                }
                'G' => {
                    if at_anchor {
                        rewritten.push('\\');
                        rewritten.push('G');
                    } else {
                        rewritten.push(UNMATCHABLE);
                    }
                }
                'z' => rewritten.push_str("$(?!\n)(?<!\n)"),
                other => {
                    rewritten.push('\\');
                    rewritten.push(other);
                }
            }
            escape = false;
        } else if character == '\\' {
            escape = true;
        } else {
            rewritten.push(character);
        }
    }
    if escape {
        rewritten.push('\\');
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_unescaped_anchors_only() {
        assert!(has_anchor("\\Afoo"));
        assert!(has_anchor("foo\\G"));
        assert!(has_anchor("foo\\z"));
        assert!(!has_anchor("\\\\Afoo"));
        assert!(!has_anchor("plain"));
        assert!(!has_anchor("\\d+"));
    }

    #[test]
    fn replace_anchor_keeps_live_anchors() {
        assert_eq!(replace_anchor("\\Ax", true, false), "\\Ax");
        assert_eq!(replace_anchor("\\Ax", false, false), "\u{FFFF}x");
        assert_eq!(replace_anchor("\\Gx", false, true), "\\Gx");
        assert_eq!(replace_anchor("\\Gx", false, false), "\u{FFFF}x");
        assert_eq!(replace_anchor("x\\z", false, false), "x$(?!\n)(?<!\n)");
    }

    #[test]
    fn replace_anchor_preserves_other_escapes() {
        assert_eq!(replace_anchor("\\d\\A", true, false), "\\d\\A");
        assert_eq!(replace_anchor("\\\\A", true, false), "\\\\A");
    }
}
