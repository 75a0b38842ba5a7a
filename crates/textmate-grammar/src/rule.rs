use crate::definition::{RawPattern, flag_set};
use crate::error::GrammarError;
use crate::grammar::Grammar;
use crate::pattern::Pattern;
use crate::registry::GrammarRegistry;
use crate::scanner::{CaptureIndex, ScanMatch, Scanner};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// An ordered list of patterns forming one grammar context (the root rule, or
/// the inside of a begin/end span).
///
/// Scanners are cached per base grammar because `$base` includes expand
/// differently depending on which top-level grammar drives the tokenization.
/// `anchor_position` is line-scoped scratch state for `\G` matching and is
/// cleared after every tokenized line.
#[derive(Debug)]
pub(crate) struct Rule {
    grammar_scope: Rc<str>,
    scope_name: Option<String>,
    content_scope_name: Option<String>,
    patterns: Vec<Rc<Pattern>>,
    end_pattern: Option<Rc<Pattern>>,
    scanners_by_base_grammar: RefCell<HashMap<String, Rc<Scanner>>>,
    anchor_position: Cell<isize>,
}

impl Rule {
    /// Compile a rule from raw pattern descriptions. The end pattern joins
    /// the pattern list now unless it still carries unresolved
    /// back-references, in which case `get_rule_to_push` resolves it per
    /// begin match.
    pub(crate) fn compile(
        grammar: &Grammar,
        scope_name: Option<String>,
        content_scope_name: Option<String>,
        raw_patterns: &[RawPattern],
        end_pattern: Option<Rc<Pattern>>,
        apply_end_pattern_last: bool,
    ) -> Result<Self, GrammarError> {
        let mut patterns = Vec::with_capacity(raw_patterns.len() + 1);
        for raw in raw_patterns {
            if flag_set(raw.disabled) {
                continue;
            }
            patterns.push(Pattern::compile(grammar, raw)?);
        }

        if let Some(end) = &end_pattern
            && !end.has_back_references()
        {
            if apply_end_pattern_last {
                patterns.push(end.clone());
            } else {
                patterns.insert(0, end.clone());
            }
        }

        Ok(Self {
            grammar_scope: grammar.scope_rc(),
            scope_name,
            content_scope_name,
            patterns,
            end_pattern,
            scanners_by_base_grammar: RefCell::new(HashMap::new()),
            anchor_position: Cell::new(-1),
        })
    }

    pub(crate) fn scope_name(&self) -> Option<&str> {
        self.scope_name.as_deref()
    }

    pub(crate) fn content_scope_name(&self) -> Option<&str> {
        self.content_scope_name.as_deref()
    }

    pub(crate) fn grammar_scope(&self) -> &str {
        &self.grammar_scope
    }

    pub(crate) fn anchor_position(&self) -> isize {
        self.anchor_position.get()
    }

    pub(crate) fn set_anchor_position(&self, position: isize) {
        self.anchor_position.set(position);
    }

    pub(crate) fn clear_anchor_position(&self) {
        self.anchor_position.set(-1);
    }

    /// Flatten this rule's patterns, expanding `include` references.
    /// `included` tracks the rules on the current expansion path so
    /// self-referential includes terminate.
    pub(crate) fn included_patterns(
        self: &Rc<Self>,
        base_grammar: &Rc<Grammar>,
        included: &mut Vec<Rc<Rule>>,
        registry: &GrammarRegistry,
    ) -> Result<Vec<Rc<Pattern>>, GrammarError> {
        if included.iter().any(|rule| Rc::ptr_eq(rule, self)) {
            return Ok(Vec::new());
        }
        included.push(self.clone());
        let mut all_patterns = Vec::new();
        for pattern in &self.patterns {
            all_patterns.extend(pattern.included_patterns(base_grammar, included, registry)?);
        }
        included.pop();
        Ok(all_patterns)
    }

    fn get_scanner(
        self: &Rc<Self>,
        base_grammar: &Rc<Grammar>,
        registry: &GrammarRegistry,
    ) -> Result<Rc<Scanner>, GrammarError> {
        let key = base_grammar.scope_name().to_string();
        if let Some(scanner) = self.scanners_by_base_grammar.borrow().get(&key) {
            return Ok(scanner.clone());
        }

        let mut included = Vec::new();
        let patterns = self.included_patterns(base_grammar, &mut included, registry)?;
        let scanner = Rc::new(Scanner::new(patterns));
        self.scanners_by_base_grammar
            .borrow_mut()
            .insert(key, scanner.clone());
        Ok(scanner)
    }

    fn find_next_match(
        self: &Rc<Self>,
        line_with_newline: &str,
        line_length: usize,
        position: usize,
        first_line: bool,
        base_grammar: &Rc<Grammar>,
        registry: &GrammarRegistry,
    ) -> Result<Option<ScanMatch>, GrammarError> {
        let scanner = self.get_scanner(base_grammar, registry)?;
        let result = scanner.find_next_match(
            line_with_newline,
            first_line,
            position,
            self.anchor_position.get(),
        )?;
        Ok(result.map(|mut found| {
            normalize_capture_indices(&mut found.capture_indices, line_length);
            found
        }))
    }

    /// Scan for the next match at `position` and convert it into tags.
    /// Returns `None` when nothing matches, or when the match handler
    /// detected a zero-width ping-pong and bailed.
    pub(crate) fn get_next_tags(
        self: &Rc<Self>,
        stack: &mut RuleStack,
        line: &str,
        line_with_newline: &str,
        position: usize,
        first_line: bool,
        base_grammar: &Rc<Grammar>,
        registry: &GrammarRegistry,
    ) -> Result<Option<NextTags>, GrammarError> {
        let found = self.find_next_match(
            line_with_newline,
            line.len(),
            position,
            first_line,
            base_grammar,
            registry,
        )?;
        let Some(found) = found else {
            return Ok(None);
        };
        let Some(first_capture) = found.capture_indices.first().copied() else {
            return Ok(None);
        };
        let Some(pattern) = found.scanner.pattern(found.pattern_index).cloned() else {
            return Ok(None);
        };

        match pattern.handle_match(stack, line, &found.capture_indices, registry)? {
            Some(tags) => Ok(Some(NextTags {
                tags,
                start: first_capture.start,
                end: first_capture.end,
            })),
            None => Ok(None),
        }
    }

    /// The rule pushed when this rule's begin pattern matches: the rule
    /// itself, or a derived rule whose end pattern has the begin captures
    /// substituted into its back-references.
    pub(crate) fn get_rule_to_push(
        self: &Rc<Self>,
        line: &str,
        begin_capture_indices: &[CaptureIndex],
    ) -> Rc<Rule> {
        let Some(end) = &self.end_pattern else {
            return self.clone();
        };
        if !end.has_back_references() {
            return self.clone();
        }

        let resolved_end = end.resolve_back_references(line, begin_capture_indices);
        let mut patterns = Vec::with_capacity(self.patterns.len() + 1);
        patterns.push(resolved_end.clone());
        patterns.extend(self.patterns.iter().cloned());
        Rc::new(Rule {
            grammar_scope: self.grammar_scope.clone(),
            scope_name: self.scope_name.clone(),
            content_scope_name: self.content_scope_name.clone(),
            patterns,
            end_pattern: Some(resolved_end),
            scanners_by_base_grammar: RefCell::new(HashMap::new()),
            anchor_position: Cell::new(-1),
        })
    }
}

/// Tags emitted for one match, plus the span the match covered.
#[derive(Debug)]
pub(crate) struct NextTags {
    pub tags: Vec<i32>,
    pub start: usize,
    pub end: usize,
}

/// Matches are found against the line with its newline appended so
/// end-of-line patterns behave, but emitted spans are clamped to the
/// newline-less length to keep tag sums equal to the line length.
fn normalize_capture_indices(capture_indices: &mut [CaptureIndex], line_length: usize) {
    for capture in capture_indices {
        capture.start = capture.start.min(line_length);
        capture.end = capture.end.min(line_length);
    }
}

/// One active grammar context: the rule being scanned plus the scopes opened
/// when it was pushed.
#[derive(Debug, Clone)]
pub(crate) struct StackEntry {
    pub rule: Rc<Rule>,
    pub scope_name: Option<String>,
    pub content_scope_name: Option<String>,
    pub zero_width_match: bool,
}

/// The ordered list of grammar contexts currently open.
///
/// The bottom entry is always the grammar's root rule. The stack returned by
/// one line's tokenization is the incremental state for the next line; thread
/// it back in verbatim.
#[derive(Debug, Clone)]
pub struct RuleStack {
    pub(crate) entries: Vec<StackEntry>,
}

impl RuleStack {
    /// Number of open contexts, the root rule included.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// The scope names currently open, outermost first. Each context
    /// contributes its scope name and then its content scope name, when set.
    pub fn scope_names(&self) -> Vec<String> {
        let mut scopes = Vec::new();
        for entry in &self.entries {
            if let Some(name) = &entry.scope_name {
                scopes.push(name.clone());
            }
            if let Some(name) = &entry.content_scope_name {
                scopes.push(name.clone());
            }
        }
        scopes
    }
}
