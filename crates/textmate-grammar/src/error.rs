use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors produced by the grammar loader/compiler/tokenizer.
pub enum GrammarError {
    #[error("I/O error: {0}")]
    /// Filesystem I/O failed.
    Io(#[from] std::io::Error),

    #[error("plist parse error: {0}")]
    /// Parsing an XML property-list grammar failed.
    Plist(#[from] plist::Error),

    #[error("JSON parse error: {0}")]
    /// Parsing a JSON grammar failed.
    Json(#[from] serde_json::Error),

    #[error("cannot read grammar file '{}': unsupported format '{format}'", path.display())]
    /// The grammar file extension is not a supported format.
    UnsupportedFormat {
        /// Path of the rejected grammar file.
        path: PathBuf,
        /// The file extension that was not recognized.
        format: String,
    },

    #[error("grammar missing required scopeName property: {0}")]
    /// A grammar definition has no (or an empty) `scopeName`.
    MissingScopeName(String),

    #[error("regex compile error for pattern '{pattern}': {message}")]
    /// A regex pattern failed to compile.
    RegexCompile {
        /// The regex pattern string.
        pattern: String,
        /// The compiler error message.
        message: String,
    },

    #[error("unsupported grammar feature: {0}")]
    /// A feature from the grammar format is not implemented.
    Unsupported(&'static str),

    #[error("expected popped scope to be '{expected}', but it was '{found}'")]
    /// Tag decoding popped a scope that does not match its start tag.
    ///
    /// This indicates a bug in tag generation, not bad input data.
    ScopeMismatch {
        /// The scope name paired with the end tag.
        expected: String,
        /// The scope name actually on top of the open-scope stack.
        found: String,
    },

    #[error("unknown scope id {0}")]
    /// A scope ID was looked up that was never interned.
    UnknownScopeId(i32),
}
