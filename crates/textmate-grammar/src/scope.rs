use crate::error::GrammarError;
use crate::grammar::Token;
use std::collections::HashMap;

/// Interns scope name strings to small negative integer IDs.
///
/// Every scope name maps to a (start, end) ID pair where `end = start - 1`.
/// Start IDs are odd negative numbers (−1, −3, −5, …) so they never collide
/// with the non-negative text-length tags in a tag stream, and the parity of
/// an ID tells start from end without a second table.
#[derive(Debug)]
pub struct ScopeRegistry {
    id_counter: i32,
    ids_by_scope: HashMap<String, i32>,
    scopes_by_id: HashMap<i32, String>,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            id_counter: -1,
            ids_by_scope: HashMap::new(),
            scopes_by_id: HashMap::new(),
        }
    }

    /// Get (or allocate) the start ID for a scope name.
    pub fn start_id_for_scope(&mut self, scope: &str) -> i32 {
        if let Some(&id) = self.ids_by_scope.get(scope) {
            return id;
        }
        let id = self.id_counter;
        self.id_counter -= 2;
        self.ids_by_scope.insert(scope.to_string(), id);
        self.scopes_by_id.insert(id, scope.to_string());
        id
    }

    /// Get (or allocate) the end ID for a scope name.
    pub fn end_id_for_scope(&mut self, scope: &str) -> i32 {
        self.start_id_for_scope(scope) - 1
    }

    /// Return the scope name for a previously allocated start or end ID.
    pub fn scope_for_id(&self, id: i32) -> Result<&str, GrammarError> {
        let start_id = if is_start_id(id) { id } else { id + 1 };
        self.scopes_by_id
            .get(&start_id)
            .map(String::as_str)
            .ok_or(GrammarError::UnknownScopeId(id))
    }

    /// Decode a tag stream into concrete tokens.
    ///
    /// `open_scope_tags` seeds the live scope stack with the start IDs of
    /// scopes still open from the previous line. A non-negative tag consumes
    /// that many bytes of `line` into a token carrying a copy of the current
    /// stack (most specific scope last); start tags push; end tags pop and
    /// must match the most recently pushed scope.
    pub fn decode_tokens(
        &self,
        line: &str,
        tags: &[i32],
        open_scope_tags: &[i32],
    ) -> Result<Vec<Token>, GrammarError> {
        let mut scope_names = Vec::with_capacity(open_scope_tags.len());
        for &tag in open_scope_tags {
            scope_names.push(self.scope_for_id(tag)?.to_string());
        }

        let mut tokens = Vec::new();
        let mut offset = 0usize;
        for &tag in tags {
            if tag >= 0 {
                let start = offset.min(line.len());
                let end = (offset + tag as usize).min(line.len());
                let value = line.get(start..end).unwrap_or_default().to_string();
                tokens.push(Token {
                    value,
                    scopes: scope_names.clone(),
                });
                offset += tag as usize;
            } else if is_start_id(tag) {
                scope_names.push(self.scope_for_id(tag)?.to_string());
            } else {
                let expected = self.scope_for_id(tag + 1)?.to_string();
                let found = scope_names.pop().ok_or_else(|| GrammarError::ScopeMismatch {
                    expected: expected.clone(),
                    found: String::from("<empty scope stack>"),
                })?;
                if found != expected {
                    return Err(GrammarError::ScopeMismatch { expected, found });
                }
            }
        }
        Ok(tokens)
    }
}

/// Start IDs are odd negative numbers; end IDs are even.
fn is_start_id(id: i32) -> bool {
    id < 0 && id % 2 == -1
}
