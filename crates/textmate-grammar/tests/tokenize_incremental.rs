use pretty_assertions::assert_eq;
use std::rc::Rc;
use textmate_grammar::{Grammar, GrammarRegistry, Token};

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

const C_COMMENTS: &str = r##"{
    "scopeName": "source.c",
    "patterns": [{ "begin": "/\\*", "end": "\\*/", "name": "comment.block" }]
}"##;

#[test]
fn open_span_carries_across_lines() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(&mut registry, C_COMMENTS);

    let first = grammar
        .tokenize_line("int x; /* note", None, true, true, &registry)
        .expect("tokenize line 1");
    assert_eq!(
        first.tokens,
        vec![
            token("int x; ", &["source.c"]),
            token("/*", &["source.c", "comment.block"]),
            token(" note", &["source.c", "comment.block"]),
        ]
    );
    assert_eq!(first.rule_stack.depth(), 2);
    assert!(
        first
            .rule_stack
            .scope_names()
            .contains(&"comment.block".to_string())
    );

    let second = grammar
        .tokenize_line(
            "more */ done",
            Some(&first.rule_stack),
            false,
            false,
            &registry,
        )
        .expect("tokenize line 2");
    assert_eq!(
        second.tokens,
        vec![
            token("more ", &["source.c", "comment.block"]),
            token("*/", &["source.c", "comment.block"]),
            token(" done", &["source.c"]),
        ]
    );
    assert_eq!(second.rule_stack.depth(), 1, "comment closed");
}

#[test]
fn tokenize_lines_threads_the_rule_stack() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(&mut registry, C_COMMENTS);

    let results = grammar
        .tokenize_lines("int x; /* note\nmore */ done", &registry)
        .expect("tokenize document");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rule_stack.depth(), 2);
    assert_eq!(results[1].rule_stack.depth(), 1);
    assert_eq!(
        results[1].tokens.first().unwrap().scopes,
        vec!["source.c", "comment.block"]
    );
}

#[test]
fn whole_document_matches_per_line_threading() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(&mut registry, C_COMMENTS);

    let text = "a /* one\ntwo\nthree */ b\nplain";
    let whole = grammar.tokenize_lines(text, &registry).expect("tokenize");

    let lines: Vec<&str> = text.split('\n').collect();
    let mut stack = None;
    for (line_number, line) in lines.iter().enumerate() {
        let result = grammar
            .tokenize_line(
                line,
                stack.as_ref(),
                line_number == 0,
                line_number != lines.len() - 1,
                &registry,
            )
            .expect("tokenize line");
        assert_eq!(whole[line_number].tokens, result.tokens, "line {line_number}");
        assert_eq!(whole[line_number].tags, result.tags, "line {line_number}");
        stack = Some(result.rule_stack);
    }
}

#[test]
fn end_pattern_back_references_match_begin_captures() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "text.xml",
            "patterns": [{ "begin": "<(\\w+)>", "end": "</\\1>", "name": "meta.tag" }]
        }"##,
    );

    let result = grammar
        .tokenize_line("<div>text</div>", None, true, true, &registry)
        .expect("tokenize");
    assert_eq!(
        result.tokens,
        vec![
            token("<div>", &["text.xml", "meta.tag"]),
            token("text", &["text.xml", "meta.tag"]),
            token("</div>", &["text.xml", "meta.tag"]),
        ]
    );
    assert_eq!(result.rule_stack.depth(), 1);
}

#[test]
fn unresolved_end_tag_does_not_close_the_span() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "text.xml",
            "patterns": [{ "begin": "<(\\w+)>", "end": "</\\1>", "name": "meta.tag" }]
        }"##,
    );

    // `</b>` must not close a span opened by `<div>`.
    let first = grammar
        .tokenize_line("<div>a</b>c", None, true, true, &registry)
        .expect("tokenize line 1");
    assert_eq!(first.rule_stack.depth(), 2, "span still open");

    let second = grammar
        .tokenize_line("b</div>after", Some(&first.rule_stack), false, false, &registry)
        .expect("tokenize line 2");
    assert_eq!(
        second.tokens,
        vec![
            token("b", &["text.xml", "meta.tag"]),
            token("</div>", &["text.xml", "meta.tag"]),
            token("after", &["text.xml"]),
        ]
    );
    assert_eq!(second.rule_stack.depth(), 1);
}

#[test]
fn content_name_scopes_only_the_span_interior() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.here",
            "patterns": [{
                "begin": "<<",
                "end": ">>",
                "name": "meta.heredoc",
                "contentName": "string.unquoted.heredoc"
            }]
        }"##,
    );

    let result = grammar
        .tokenize_line("<<body>>", None, true, true, &registry)
        .expect("tokenize");
    assert_eq!(
        result.tokens,
        vec![
            token("<<", &["source.here", "meta.heredoc"]),
            token(
                "body",
                &["source.here", "meta.heredoc", "string.unquoted.heredoc"]
            ),
            token(">>", &["source.here", "meta.heredoc"]),
        ]
    );
}

#[test]
fn document_start_anchor_only_matches_the_first_line() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.first",
            "patterns": [{ "match": "\\Atop", "name": "keyword.first" }]
        }"##,
    );

    let results = grammar
        .tokenize_lines("top\ntop", &registry)
        .expect("tokenize");
    assert_eq!(
        results[0].tokens[0],
        token("top", &["source.first", "keyword.first"])
    );
    assert_eq!(results[1].tokens, vec![token("top", &["source.first"])]);
}

#[test]
fn scan_position_anchor_is_live_only_at_the_begin_boundary() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.g",
            "patterns": [{
                "begin": ":",
                "end": "$",
                "name": "meta.directive",
                "patterns": [{ "match": "\\G\\w+", "name": "markup.bold" }]
            }]
        }"##,
    );

    let result = grammar
        .tokenize_line(":ab cd", None, true, true, &registry)
        .expect("tokenize");

    let bold: Vec<&Token> = result
        .tokens
        .iter()
        .filter(|token| token.scopes.iter().any(|scope| scope == "markup.bold"))
        .collect();
    assert_eq!(bold.len(), 1, "only the word at the anchor is bold");
    assert_eq!(bold[0].value, "ab");

    let trailing = result
        .tokens
        .iter()
        .find(|token| token.value == " cd")
        .expect("trailing text token");
    assert_eq!(trailing.scopes, vec!["source.g", "meta.directive"]);
}

#[test]
fn apply_end_pattern_last_lets_inner_patterns_win() {
    let mut registry = GrammarRegistry::new();
    let grammar = add_grammar(
        &mut registry,
        r##"{
            "scopeName": "source.esc",
            "patterns": [{
                "begin": "'",
                "end": "'",
                "name": "string.quoted.single",
                "applyEndPatternLast": 1,
                "patterns": [{ "match": "''", "name": "constant.character.escape" }]
            }]
        }"##,
    );

    // With the end pattern applied last, the doubled quote is an escape
    // instead of closing and reopening the string.
    let result = grammar
        .tokenize_line("'a''b' c", None, true, true, &registry)
        .expect("tokenize");
    assert_eq!(
        result.tokens,
        vec![
            token("'", &["source.esc", "string.quoted.single"]),
            token("a", &["source.esc", "string.quoted.single"]),
            token(
                "''",
                &["source.esc", "string.quoted.single", "constant.character.escape"]
            ),
            token("b", &["source.esc", "string.quoted.single"]),
            token("'", &["source.esc", "string.quoted.single"]),
            token(" c", &["source.esc"]),
        ]
    );
    assert_eq!(result.rule_stack.depth(), 1);
}
