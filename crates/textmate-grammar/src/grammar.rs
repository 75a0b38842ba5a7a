use crate::definition::{GrammarDefinition, RawPattern};
use crate::error::GrammarError;
use crate::registry::{GrammarRegistry, RegistryOptions};
use crate::rule::{Rule, RuleStack, StackEntry};
use onig::{Regex, SearchOptions};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

/// One decoded token: a substring of the line and the scopes covering it,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The substring of the line this token covers.
    pub value: String,
    /// Scope names covering the token, most specific last.
    pub scopes: Vec<String>,
}

/// The result of tokenizing one line.
#[derive(Debug, Clone)]
pub struct TokenizeLineResult {
    /// The input line, untruncated.
    pub line: String,
    /// Start IDs of the scopes that were already open when the line began.
    pub open_scope_tags: Vec<i32>,
    /// The raw tag stream: non-negative values are byte lengths of text runs,
    /// negative values push (odd) or pop (even) a scope.
    pub tags: Vec<i32>,
    /// The tag stream decoded against the line text.
    pub tokens: Vec<Token>,
    /// Incremental state to pass into the next line's tokenization.
    pub rule_stack: RuleStack,
}

/// A compiled grammar for one language.
///
/// Created by a [`GrammarRegistry`](crate::GrammarRegistry) and shared
/// read-only across all lines tokenized with it; rule compilation is lazy and
/// memoized. Not thread-safe by design: tokenization interns scope IDs
/// through the owning registry, which is single-threaded state.
#[derive(Debug)]
pub struct Grammar {
    name: Option<String>,
    scope_name: Rc<str>,
    file_types: Vec<String>,
    folding_stop_marker: Option<String>,
    first_line_regex: Option<Regex>,
    max_tokens_per_line: usize,
    max_line_length: usize,
    raw_patterns: Vec<RawPattern>,
    raw_repository: HashMap<String, RawPattern>,
    injections: HashMap<String, RawPattern>,
    initial_rule: RefCell<Option<Rc<Rule>>>,
    repository: RefCell<Option<HashMap<String, Rc<Rule>>>>,
    included_grammar_scopes: RefCell<Vec<String>>,
}

impl Grammar {
    pub(crate) fn from_definition(
        definition: GrammarDefinition,
        defaults: &RegistryOptions,
    ) -> Result<Self, GrammarError> {
        if definition.scope_name.is_empty() {
            return Err(GrammarError::MissingScopeName(
                definition.name.unwrap_or_else(|| String::from("<unnamed>")),
            ));
        }
        if definition.injection_selector.is_some() {
            return Err(GrammarError::Unsupported("injectionSelector"));
        }

        let first_line_regex = match &definition.first_line_match {
            Some(source) => Some(Regex::new(source).map_err(|e| GrammarError::RegexCompile {
                pattern: source.clone(),
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            name: definition.name,
            scope_name: Rc::from(definition.scope_name.as_str()),
            file_types: definition.file_types,
            folding_stop_marker: definition.folding_stop_marker,
            first_line_regex,
            max_tokens_per_line: definition
                .max_tokens_per_line
                .unwrap_or(defaults.max_tokens_per_line),
            max_line_length: definition
                .max_line_length
                .unwrap_or(defaults.max_line_length),
            raw_patterns: definition.patterns,
            raw_repository: definition.repository,
            injections: definition.injections,
            initial_rule: RefCell::new(None),
            repository: RefCell::new(None),
            included_grammar_scopes: RefCell::new(Vec::new()),
        })
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Root scope of the grammar (e.g. `source.python`).
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// File extensions associated with this grammar.
    pub fn file_types(&self) -> &[String] {
        &self.file_types
    }

    /// Regex marking where a folding region stops, when declared.
    pub fn folding_stop_marker(&self) -> Option<&str> {
        self.folding_stop_marker.as_deref()
    }

    /// Injection patterns as declared in the grammar file. Selector matching
    /// is not implemented; the map is data only.
    pub fn injections(&self) -> &HashMap<String, RawPattern> {
        &self.injections
    }

    /// Whether this grammar's `firstLineMatch` regex matches the given line.
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_regex.as_ref().is_some_and(|regex| {
            regex
                .search_with_options(line, 0, line.len(), SearchOptions::SEARCH_OPTION_NONE, None)
                .is_some()
        })
    }

    pub(crate) fn scope_rc(&self) -> Rc<str> {
        self.scope_name.clone()
    }

    /// Drop the compiled rules so the next use recompiles from the raw
    /// definition. Rules held by outstanding rule stacks stay valid.
    pub fn clear_rules(&self) {
        *self.initial_rule.borrow_mut() = None;
        *self.repository.borrow_mut() = None;
    }

    pub(crate) fn add_included_grammar_scope(&self, scope: &str) {
        let mut scopes = self.included_grammar_scopes.borrow_mut();
        if !scopes.iter().any(|existing| existing == scope) {
            scopes.push(scope.to_string());
        }
    }

    pub(crate) fn includes_grammar_scope(&self, scope: &str) -> bool {
        self.included_grammar_scopes
            .borrow()
            .iter()
            .any(|existing| existing == scope)
    }

    pub(crate) fn get_initial_rule(self: &Rc<Self>) -> Result<Rc<Rule>, GrammarError> {
        if let Some(rule) = self.initial_rule.borrow().as_ref() {
            return Ok(rule.clone());
        }
        let rule = Rc::new(Rule::compile(
            self,
            Some(self.scope_name.to_string()),
            None,
            &self.raw_patterns,
            None,
            false,
        )?);
        *self.initial_rule.borrow_mut() = Some(rule.clone());
        Ok(rule)
    }

    pub(crate) fn repository_rule(
        self: &Rc<Self>,
        name: &str,
    ) -> Result<Option<Rc<Rule>>, GrammarError> {
        self.ensure_repository()?;
        Ok(self
            .repository
            .borrow()
            .as_ref()
            .and_then(|repository| repository.get(name).cloned()))
    }

    fn ensure_repository(self: &Rc<Self>) -> Result<(), GrammarError> {
        if self.repository.borrow().is_some() {
            return Ok(());
        }
        let mut repository = HashMap::with_capacity(self.raw_repository.len());
        for (name, raw) in &self.raw_repository {
            // A repository entry is either a pattern itself or a bare
            // `{patterns: [...]}` rule.
            let rule = if raw.match_source.is_some() || raw.begin.is_some() {
                Rule::compile(self, None, None, std::slice::from_ref(raw), None, false)?
            } else {
                Rule::compile(self, None, None, &raw.patterns, None, false)?
            };
            repository.insert(name.clone(), Rc::new(rule));
        }
        *self.repository.borrow_mut() = Some(repository);
        Ok(())
    }

    /// Tokenize a whole document, threading the rule stack from each line
    /// into the next. Lines are split with universal newline semantics.
    pub fn tokenize_lines(
        self: &Rc<Self>,
        text: &str,
        registry: &GrammarRegistry,
    ) -> Result<Vec<TokenizeLineResult>, GrammarError> {
        let lines = split_lines(text);
        let last_line = lines.len().saturating_sub(1);
        let mut rule_stack: Option<RuleStack> = None;
        let mut results = Vec::with_capacity(lines.len());
        for (line_number, line) in lines.iter().enumerate() {
            let result = self.tokenize_line(
                line,
                rule_stack.as_ref(),
                line_number == 0,
                line_number != last_line,
                registry,
            )?;
            rule_stack = Some(result.rule_stack.clone());
            results.push(result);
        }
        Ok(results)
    }

    /// Tokenize one line.
    ///
    /// `rule_stack` is the previous line's outgoing stack (`None` for the
    /// first call), `first_line` enables `\A` anchors, and `append_newline`
    /// appends `\n` to the scanned text so end-of-line patterns can match
    /// (pass `false` only for the last line of a document).
    pub fn tokenize_line(
        self: &Rc<Self>,
        input_line: &str,
        rule_stack: Option<&RuleStack>,
        first_line: bool,
        append_newline: bool,
        registry: &GrammarRegistry,
    ) -> Result<TokenizeLineResult, GrammarError> {
        let mut tags: Vec<i32> = Vec::new();

        let mut truncated_line = false;
        let line: &str = if input_line.len() > self.max_line_length {
            truncated_line = true;
            &input_line[..floor_char_boundary(input_line, self.max_line_length)]
        } else {
            input_line
        };

        let line_with_newline: String = if append_newline {
            let mut with_newline = String::with_capacity(line.len() + 1);
            with_newline.push_str(line);
            with_newline.push('\n');
            with_newline
        } else {
            line.to_string()
        };

        let mut open_scope_tags: Vec<i32> = Vec::new();
        let previous_stack = rule_stack.filter(|stack| !stack.entries.is_empty());
        let mut stack = match previous_stack {
            Some(previous) => {
                let stack = previous.clone();
                for entry in &stack.entries {
                    if let Some(scope) = &entry.scope_name {
                        open_scope_tags.push(registry.start_id_for_scope(scope));
                    }
                    if let Some(scope) = &entry.content_scope_name {
                        open_scope_tags.push(registry.start_id_for_scope(scope));
                    }
                }
                stack
            }
            None => {
                let initial_rule = self.get_initial_rule()?;
                let scope_name = initial_rule.scope_name().map(str::to_string);
                let content_scope_name = initial_rule.content_scope_name().map(str::to_string);
                if let Some(scope) = &scope_name {
                    tags.push(registry.start_id_for_scope(scope));
                }
                if let Some(scope) = &content_scope_name {
                    tags.push(registry.start_id_for_scope(scope));
                }
                RuleStack {
                    entries: vec![StackEntry {
                        rule: initial_rule,
                        scope_name,
                        content_scope_name,
                        zero_width_match: false,
                    }],
                }
            }
        };

        let base_scope = stack.entries[0].rule.grammar_scope().to_string();
        let base_grammar = registry
            .grammar_for_scope_name(&base_scope)
            .unwrap_or_else(|| self.clone());

        let initial_stack_depth = stack.entries.len();
        let token_limit = self.max_tokens_per_line.saturating_sub(1);
        let mut position: usize = 0;
        let mut token_count: usize = 0;

        loop {
            let previous_stack_depth = stack.entries.len();
            let previous_position = position;

            if position > line.len() {
                break;
            }
            if token_count >= token_limit {
                truncated_line = true;
                break;
            }

            let top_rule = match stack.entries.last() {
                Some(entry) => entry.rule.clone(),
                None => break,
            };

            match top_rule.get_next_tags(
                &mut stack,
                line,
                &line_with_newline,
                position,
                first_line,
                &base_grammar,
                registry,
            )? {
                Some(next) => {
                    // Unmatched text before the next match stays in the
                    // currently open scopes.
                    if position < next.start {
                        tags.push((next.start - position) as i32);
                        token_count += 1;
                    }
                    for &tag in &next.tags {
                        if tag != 0 {
                            token_count += 1;
                        }
                    }
                    tags.extend(next.tags);
                    position = next.end;
                }
                None => {
                    if position < line.len() || line.is_empty() {
                        tags.push((line.len() - position) as i32);
                        position = line.len();
                    }
                    break;
                }
            }

            if position != previous_position {
                continue;
            }

            if stack.entries.len() == previous_stack_depth {
                // True zero-width infinite-match condition.
                warn!(
                    position,
                    line, "popping rule because it loops without advancing"
                );
                if stack.entries.len() > 1 {
                    if let Some(entry) = stack.entries.pop() {
                        if let Some(scope) = &entry.content_scope_name {
                            tags.push(registry.end_id_for_scope(scope));
                        }
                        if let Some(scope) = &entry.scope_name {
                            tags.push(registry.end_id_for_scope(scope));
                        }
                    }
                } else {
                    if position < line.len() || (line.is_empty() && tags.is_empty()) {
                        tags.push((line.len() - position) as i32);
                        position = line.len();
                    }
                    break;
                }
            } else if stack.entries.len() > previous_stack_depth {
                // Zero-width push: popping the duplicate prevents unbounded
                // stack growth when the same rule re-pushes in place.
                let depth = stack.entries.len();
                let penultimate_rule = stack.entries[depth - 2].rule.clone();
                let last_rule = stack.entries[depth - 1].rule.clone();

                let mut pop_stack = Rc::ptr_eq(&last_rule, &penultimate_rule);
                if let (Some(last_scope), Some(penultimate_scope)) =
                    (last_rule.scope_name(), penultimate_rule.scope_name())
                    && last_scope == penultimate_scope
                {
                    pop_stack = true;
                }

                if pop_stack {
                    stack.entries.pop();
                    if let Some(scope) = last_rule.scope_name() {
                        let start_id = registry.start_id_for_scope(scope);
                        if tags.last() == Some(&start_id) {
                            tags.pop();
                        }
                    }
                    tags.push((line.len() - position) as i32);
                    position = line.len();
                    break;
                }
            }
        }

        if truncated_line {
            // Widen the final text tag to cover the untokenized remainder and
            // close every context opened on this line so truncation does not
            // leak partial state into the next line.
            match tags.last_mut() {
                Some(last) if *last > 0 => *last += (input_line.len() - position) as i32,
                _ => tags.push((input_line.len() - position) as i32),
            }
            while stack.entries.len() > initial_stack_depth {
                if let Some(entry) = stack.entries.pop() {
                    if let Some(scope) = &entry.content_scope_name {
                        tags.push(registry.end_id_for_scope(scope));
                    }
                    if let Some(scope) = &entry.scope_name {
                        tags.push(registry.end_id_for_scope(scope));
                    }
                }
            }
        }

        for entry in &stack.entries {
            entry.rule.clear_anchor_position();
        }

        let tokens = registry.decode_tokens(input_line, &tags, &open_scope_tags)?;

        Ok(TokenizeLineResult {
            line: input_line.to_string(),
            open_scope_tags,
            tags,
            tokens,
            rule_stack: stack,
        })
    }
}

/// Split text into lines on `\r\n`, `\n`, or `\r`, without the terminators.
/// A trailing terminator does not produce a final empty line.
fn split_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        match bytes[index] {
            b'\n' => {
                lines.push(&text[start..index]);
                index += 1;
                start = index;
            }
            b'\r' => {
                lines.push(&text[start..index]);
                index += if bytes.get(index + 1) == Some(&b'\n') { 2 } else { 1 };
                start = index;
            }
            _ => index += 1,
        }
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
