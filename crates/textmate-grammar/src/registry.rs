use crate::definition::GrammarDefinition;
use crate::error::GrammarError;
use crate::grammar::{Grammar, Token};
use crate::scope::ScopeRegistry;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// Scope of the built-in fallback grammar.
pub const NULL_GRAMMAR_SCOPE: &str = "text.plain.null-grammar";

/// Registry-level limits applied to grammars that do not declare their own
/// `maxTokensPerLine` / `maxLineLength`.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Per-line token budget; the rest of the line becomes one filler token.
    pub max_tokens_per_line: usize,
    /// Maximum line length in bytes before truncation.
    pub max_line_length: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_tokens_per_line: usize::MAX,
            max_line_length: usize::MAX,
        }
    }
}

/// Loads grammar definition files into [`Grammar`] objects, resolves
/// cross-grammar `include` references, and owns the scope-ID table shared by
/// every grammar it loads.
///
/// Single-threaded by design: tokenization interns scope IDs through interior
/// mutability, so a registry (and the grammars it owns) must stay confined to
/// one thread.
#[derive(Debug)]
pub struct GrammarRegistry {
    options: RegistryOptions,
    grammars: Vec<Rc<Grammar>>,
    grammars_by_scope_name: HashMap<String, Rc<Grammar>>,
    scopes: RefCell<ScopeRegistry>,
}

impl Default for GrammarRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GrammarRegistry {
    /// Create a registry with unlimited line length and token budget.
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    /// Create a registry with explicit limits.
    pub fn with_options(options: RegistryOptions) -> Self {
        let mut registry = Self {
            options,
            grammars: Vec::new(),
            grammars_by_scope_name: HashMap::new(),
            scopes: RefCell::new(ScopeRegistry::new()),
        };
        let null_definition = GrammarDefinition {
            name: Some(String::from("Null Grammar")),
            scope_name: String::from(NULL_GRAMMAR_SCOPE),
            ..GrammarDefinition::default()
        };
        let null_grammar = Rc::new(
            Grammar::from_definition(null_definition, &registry.options)
                .expect("null grammar definition is valid"),
        );
        registry.register(null_grammar);
        registry
    }

    /// The built-in fallback grammar: no patterns, so every line tokenizes as
    /// a single `text.plain.null-grammar` token. Callers whose grammar file
    /// fails to load are expected to fall back to this.
    pub fn null_grammar(&self) -> Rc<Grammar> {
        self.grammars_by_scope_name[NULL_GRAMMAR_SCOPE].clone()
    }

    /// Load and register a grammar definition file.
    ///
    /// Supported formats by extension: `.tmLanguage` / `.plist` (XML property
    /// list) and `.json`. CSON grammars are recognized but not supported.
    pub fn load_grammar(&mut self, path: impl AsRef<Path>) -> Result<Rc<Grammar>, GrammarError> {
        let path = path.as_ref();
        let definition = self.read_grammar(path)?;
        let grammar = Rc::new(Grammar::from_definition(definition, &self.options)?);
        self.register(grammar.clone());
        debug!(path = %path.display(), "loaded grammar file");
        Ok(grammar)
    }

    /// Register an in-memory grammar definition.
    pub fn add_grammar(
        &mut self,
        definition: GrammarDefinition,
    ) -> Result<Rc<Grammar>, GrammarError> {
        let grammar = Rc::new(Grammar::from_definition(definition, &self.options)?);
        self.register(grammar.clone());
        Ok(grammar)
    }

    fn read_grammar(&self, path: &Path) -> Result<GrammarDefinition, GrammarError> {
        let bytes = fs::read(path)?;
        let content = skip_leading_comment_lines(&bytes);
        let format = path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let definition: GrammarDefinition = match format.as_str() {
            "tmlanguage" | "plist" => plist::from_bytes(content)?,
            "json" => serde_json::from_slice(content)?,
            _ => {
                return Err(GrammarError::UnsupportedFormat {
                    path: path.to_path_buf(),
                    format,
                });
            }
        };

        if definition.scope_name.is_empty() {
            return Err(GrammarError::MissingScopeName(path.display().to_string()));
        }
        Ok(definition)
    }

    fn register(&mut self, grammar: Rc<Grammar>) {
        self.grammars.push(grammar.clone());
        self.grammars_by_scope_name
            .insert(grammar.scope_name().to_string(), grammar.clone());
        self.grammar_updated(grammar.scope_name());
    }

    /// All registered grammars, the null grammar included.
    pub fn grammars(&self) -> &[Rc<Grammar>] {
        &self.grammars
    }

    /// Look up a registered grammar by its root scope.
    pub fn grammar_for_scope_name(&self, scope_name: &str) -> Option<Rc<Grammar>> {
        self.grammars_by_scope_name.get(scope_name).cloned()
    }

    /// Unregister a grammar and invalidate grammars that included it.
    pub fn remove_grammar_for_scope_name(&mut self, scope_name: &str) -> Option<Rc<Grammar>> {
        let grammar = self.grammars_by_scope_name.remove(scope_name)?;
        self.grammars
            .retain(|registered| !Rc::ptr_eq(registered, &grammar));
        self.grammar_updated(scope_name);
        Some(grammar)
    }

    /// Invalidate the compiled rules of every grammar that (transitively)
    /// includes `scope_name`, so the next tokenization re-resolves the
    /// reference against the current registry contents.
    pub fn grammar_updated(&self, scope_name: &str) {
        let mut pending = vec![scope_name.to_string()];
        let mut visited = HashSet::new();
        while let Some(scope) = pending.pop() {
            if !visited.insert(scope.clone()) {
                continue;
            }
            for grammar in &self.grammars {
                if grammar.includes_grammar_scope(&scope) {
                    grammar.clear_rules();
                    pending.push(grammar.scope_name().to_string());
                }
            }
        }
    }

    /// Get (or allocate) the start ID for a scope name.
    pub fn start_id_for_scope(&self, scope_name: &str) -> i32 {
        self.scopes.borrow_mut().start_id_for_scope(scope_name)
    }

    /// Get (or allocate) the end ID for a scope name.
    pub fn end_id_for_scope(&self, scope_name: &str) -> i32 {
        self.scopes.borrow_mut().end_id_for_scope(scope_name)
    }

    /// The scope name for a previously allocated start or end ID.
    pub fn scope_for_id(&self, id: i32) -> Result<String, GrammarError> {
        self.scopes.borrow().scope_for_id(id).map(str::to_string)
    }

    /// Decode a tag stream into tokens. See
    /// [`ScopeRegistry::decode_tokens`](crate::ScopeRegistry::decode_tokens).
    pub fn decode_tokens(
        &self,
        line: &str,
        tags: &[i32],
        open_scope_tags: &[i32],
    ) -> Result<Vec<Token>, GrammarError> {
        self.scopes.borrow().decode_tokens(line, tags, open_scope_tags)
    }
}

/// Grammar files in the wild sometimes start with `<!--` comment lines before
/// the XML declaration; skip whole leading comment lines before parsing.
fn skip_leading_comment_lines(content: &[u8]) -> &[u8] {
    let mut rest = content;
    while rest.starts_with(b"<!--") {
        match rest.iter().position(|&byte| byte == b'\n') {
            Some(newline) => rest = &rest[newline + 1..],
            None => return &[],
        }
    }
    rest
}
