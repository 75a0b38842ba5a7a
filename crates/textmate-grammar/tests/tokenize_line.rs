use pretty_assertions::assert_eq;
use std::rc::Rc;
use textmate_grammar::{Grammar, GrammarError, GrammarRegistry, Token};

fn add_grammar(registry: &mut GrammarRegistry, json: &str) -> Rc<Grammar> {
    let definition = serde_json::from_str(json).expect("grammar json parses");
    registry.add_grammar(definition).expect("grammar compiles")
}

fn token(value: &str, scopes: &[&str]) -> Token {
    Token {
        value: value.to_string(),
        scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
    }
}

/// Sum of the non-negative tags must equal the line length.
fn assert_tag_length(tags: &[i32], line: &str) {
    let total: i64 = tags.iter().filter(|&&tag| tag >= 0).map(|&tag| tag as i64).sum();
    assert_eq!(total, line.len() as i64, "tag lengths must cover the line");
}

#[test]
fn match_pattern_produces_scoped_token() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.digits",
            "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
        }"##,
    );

    let result = grammar
        .tokenize_line("abc123def", None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("abc", &["source.digits"]),
            token("123", &["source.digits", "constant.numeric"]),
            token("def", &["source.digits"]),
        ]
    );
    assert_tag_length(&result.tags, "abc123def");
    assert_eq!(result.rule_stack.depth(), 1);
}

#[test]
fn begin_end_span_is_scoped_and_pops() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.str",
            "patterns": [{ "begin": "\"", "end": "\"", "name": "string.quoted" }]
        }"##,
    );

    let line = r#"he said "hi" ok"#;
    let result = grammar
        .tokenize_line(line, None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("he said ", &["source.str"]),
            token("\"", &["source.str", "string.quoted"]),
            token("hi", &["source.str", "string.quoted"]),
            token("\"", &["source.str", "string.quoted"]),
            token(" ok", &["source.str"]),
        ]
    );
    assert_tag_length(&result.tags, line);
    assert_eq!(result.rule_stack.depth(), 1, "span closed on the same line");
}

#[test]
fn capture_groups_scope_their_spans() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.kv",
            "patterns": [{
                "match": "(\\w+)=(\\d+)",
                "captures": {
                    "1": { "name": "variable.other" },
                    "2": { "name": "constant.numeric" }
                }
            }]
        }"##,
    );

    let result = grammar
        .tokenize_line("a=1", None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("a", &["source.kv", "variable.other"]),
            token("=", &["source.kv"]),
            token("1", &["source.kv", "constant.numeric"]),
        ]
    );
}

#[test]
fn nested_captures_wrap_child_captures() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.call",
            "patterns": [{
                "match": "((\\w+)\\()",
                "captures": {
                    "1": { "name": "meta.call" },
                    "2": { "name": "entity.name.function" }
                }
            }]
        }"##,
    );

    let result = grammar
        .tokenize_line("foo(", None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("foo", &["source.call", "meta.call", "entity.name.function"]),
            token("(", &["source.call", "meta.call"]),
        ]
    );
}

#[test]
fn repository_includes_resolve() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.repo",
            "patterns": [{ "include": "#word" }],
            "repository": {
                "word": { "match": "\\w+", "name": "meta.word" }
            }
        }"##,
    );

    let result = grammar
        .tokenize_line("hi there", None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("hi", &["source.repo", "meta.word"]),
            token(" ", &["source.repo"]),
            token("there", &["source.repo", "meta.word"]),
        ]
    );
}

#[test]
fn cross_grammar_includes_resolve_through_the_registry() {
    let mut registry = GrammarRegistry::new();
    add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.guest",
            "patterns": [{ "match": "\\d+", "name": "constant.guest" }]
        }"##,
    );
    let host = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.host",
            "patterns": [{ "include": "source.guest" }]
        }"##,
    );

    let result = host
        .tokenize_line("a1b", None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(
        result.tokens,
        vec![
            token("a", &["source.host"]),
            token("1", &["source.host", "constant.guest"]),
            token("b", &["source.host"]),
        ]
    );
}

#[test]
fn empty_line_yields_one_empty_token() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.digits",
            "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
        }"##,
    );

    let result = grammar
        .tokenize_line("", None, true, true, &registry)
        .expect("tokenize");
    assert_eq!(result.tokens, vec![token("", &["source.digits"])]);
}

#[test]
fn zero_width_match_terminates_with_filler_token() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.loop",
            "patterns": [{ "match": "", "name": "meta.empty" }]
        }"##,
    );

    let result = grammar
        .tokenize_line("abc", None, true, true, &registry)
        .expect("tokenize must terminate");

    let text: String = result.tokens.iter().map(|t| t.value.as_str()).collect();
    assert_eq!(text, "abc", "remaining text becomes a filler token");
    assert_tag_length(&result.tags, "abc");
}

#[test]
fn zero_width_push_of_identical_rule_is_popped() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.zw",
            "patterns": [{
                "begin": "(?=a)",
                "end": "x",
                "name": "meta.block",
                "patterns": [{ "include": "$self" }]
            }]
        }"##,
    );

    let result = grammar
        .tokenize_line("aaa", None, true, true, &registry)
        .expect("tokenize must terminate");

    let text: String = result.tokens.iter().map(|t| t.value.as_str()).collect();
    assert_eq!(text, "aaa");
    let last = result.tokens.last().expect("has tokens");
    assert!(last.scopes.contains(&"meta.block".to_string()));
}

#[test]
fn token_budget_absorbs_the_rest_of_the_line() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.budget",
            "maxTokensPerLine": 4,
            "patterns": [{ "match": "\\d", "name": "constant.numeric" }]
        }"##,
    );

    let line = "1 2 3 4 5";
    let result = grammar
        .tokenize_line(line, None, true, true, &registry)
        .expect("tokenize");

    let text: String = result.tokens.iter().map(|t| t.value.as_str()).collect();
    assert_eq!(text, line, "the last token absorbs the unmatched remainder");
    assert_eq!(
        result.tokens,
        vec![
            token("1", &["source.budget", "constant.numeric"]),
            token(" 2 3 4 5", &["source.budget"]),
        ]
    );
    assert_eq!(result.rule_stack.depth(), 1);
}

#[test]
fn long_lines_are_truncated_and_patched() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.maxlen",
            "maxLineLength": 4,
            "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
        }"##,
    );

    let line = "12 456789";
    let result = grammar
        .tokenize_line(line, None, true, true, &registry)
        .expect("tokenize");

    let text: String = result.tokens.iter().map(|t| t.value.as_str()).collect();
    assert_eq!(text, line);
    assert_tag_length(&result.tags, line);
    // Only the prefix inside the limit was actually scanned.
    assert_eq!(result.tokens[0], token("12", &["source.maxlen", "constant.numeric"]));
    assert_eq!(result.tokens.last().unwrap().scopes, vec!["source.maxlen"]);
}

#[test]
fn truncation_pops_spans_opened_on_the_line() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.trunc",
            "maxLineLength": 6,
            "patterns": [{ "begin": "\\(", "end": "\\)", "name": "meta.paren" }]
        }"##,
    );

    let result = grammar
        .tokenize_line("ab (cd efgh)", None, true, true, &registry)
        .expect("tokenize");

    // The paren span opened inside the truncated prefix must not leak into
    // the next line's state.
    assert_eq!(result.rule_stack.depth(), 1);
    let text: String = result.tokens.iter().map(|t| t.value.as_str()).collect();
    assert_eq!(text, "ab (cd efgh)");
}

#[test]
fn scope_name_templates_are_rejected() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.tpl",
            "patterns": [{ "match": "(a+)", "name": "meta.$1.thing" }]
        }"##,
    );

    let error = grammar
        .tokenize_line("aaa", None, true, true, &registry)
        .expect_err("templated scope names are unsupported");
    assert!(matches!(error, GrammarError::Unsupported(_)));
}

#[test]
fn capture_patterns_are_rejected() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.cap",
            "patterns": [{
                "match": "(ab)",
                "captures": {
                    "1": { "name": "meta.inner", "patterns": [{ "match": "a" }] }
                }
            }]
        }"##,
    );

    let error = grammar
        .tokenize_line("ab", None, true, true, &registry)
        .expect_err("capture sub-patterns are unsupported");
    assert!(matches!(error, GrammarError::Unsupported(_)));
}

#[test]
fn retokenizing_is_idempotent() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.str",
            "patterns": [{ "begin": "\"", "end": "\"", "name": "string.quoted" }]
        }"##,
    );

    let line = r#"a "b" c"#;
    let first = grammar
        .tokenize_line(line, None, true, true, &registry)
        .expect("tokenize");
    let second = grammar
        .tokenize_line(line, None, true, true, &registry)
        .expect("tokenize");

    assert_eq!(first.tokens, second.tokens);
    assert_eq!(first.tags, second.tags);
    assert_eq!(
        first.rule_stack.scope_names(),
        second.rule_stack.scope_names()
    );
    assert_eq!(first.rule_stack.depth(), second.rule_stack.depth());
}
