#![warn(missing_docs)]
//! `textmate-grammar` - a TextMate/first-mate grammar interpreter and
//! incremental line tokenizer.
//!
//! A [`GrammarRegistry`] loads declarative grammar files (`.tmLanguage` XML
//! plists or JSON) into [`Grammar`] objects. [`Grammar::tokenize_line`] walks
//! a line with a rule stack carried over from the previous line and produces
//! a [`TokenizeLineResult`]: `{value, scopes}` tokens for styling plus the
//! outgoing rule stack to thread into the next line.
//!
//! ```no_run
//! use textmate_grammar::GrammarRegistry;
//!
//! # fn main() -> Result<(), textmate_grammar::GrammarError> {
//! let mut registry = GrammarRegistry::new();
//! let grammar = registry.load_grammar("grammars/Python.tmLanguage")?;
//! for result in grammar.tokenize_lines("import sys\n", &registry)? {
//!     for token in &result.tokens {
//!         println!("{:?} {:?}", token.value, token.scopes);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod definition;
mod error;
mod grammar;
mod pattern;
mod registry;
mod rule;
mod scanner;
mod scope;

pub use definition::{FlagValue, GrammarDefinition, RawCapture, RawPattern};
pub use error::GrammarError;
pub use grammar::{Grammar, Token, TokenizeLineResult};
pub use registry::{GrammarRegistry, NULL_GRAMMAR_SCOPE, RegistryOptions};
pub use rule::RuleStack;
pub use scope::ScopeRegistry;
