use tree_sitter::{Language, Node, Parser};

/// An ordered slice of a file's text. Boundaries are deterministic for a
/// given file content, which keeps content ids stable across runs. Kind and
/// name come from the grammar when one is available.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_index: u32,
    pub kind: String,
    pub name: Option<String>,
    pub text: String,
    pub start_byte: u32,
    pub end_byte: u32,
    pub start_line: u32,
    pub end_line: u32,
}

fn get_language(lang: &str) -> Option<Language> {
    match lang {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" | "jsx" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "c" => Some(tree_sitter_c::LANGUAGE.into()),
        _ => None,
    }
}

struct Span {
    start: usize,
    end: usize,
    kind: String,
    name: Option<String>,
}

/// Chunk file content into structural units using tree-sitter, falling back
/// to fixed-size line windows for unsupported languages. Empty content
/// yields an empty sequence.
pub fn chunk_file(content: &str, language: Option<&str>) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut spans = language
        .and_then(get_language)
        .and_then(|ts| structural_spans(content, ts, language.unwrap_or_default()))
        .unwrap_or_default();

    if spans.is_empty() {
        spans = window_spans(content);
    }

    spans.sort_by_key(|s| (s.start, s.end));
    spans.dedup_by(|a, b| a.start == b.start && a.end == b.end);

    spans
        .into_iter()
        .enumerate()
        .map(|(i, span)| {
            let text = &content[span.start..span.end];
            let start_line = 1 + content[..span.start].matches('\n').count() as u32;
            let end_line = start_line + text.matches('\n').count() as u32;
            Chunk {
                chunk_index: i as u32,
                kind: span.kind,
                name: span.name,
                text: text.to_string(),
                start_byte: span.start as u32,
                end_byte: span.end as u32,
                start_line,
                end_line,
            }
        })
        .collect()
}

fn structural_spans(content: &str, language: Language, lang: &str) -> Option<Vec<Span>> {
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;

    let mut spans = Vec::new();
    collect_spans(tree.root_node(), content, lang, &mut spans);
    Some(spans)
}

/// Containers recurse so their members become individual chunks; a
/// container with no chunkable children still gets captured whole.
const CONTAINER_KINDS: &[&str] = &["impl", "trait", "module", "class", "export"];

fn collect_spans(node: Node, source: &str, lang: &str, spans: &mut Vec<Span>) {
    if let Some((kind, name)) = classify_node(&node, source, lang) {
        if CONTAINER_KINDS.contains(&kind.as_str()) {
            let before = spans.len();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                collect_spans(child, source, lang, spans);
            }
            if spans.len() == before {
                spans.push(Span { start: node.start_byte(), end: node.end_byte(), kind, name });
            }
            return;
        }
        spans.push(Span { start: node.start_byte(), end: node.end_byte(), kind, name });
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_spans(child, source, lang, spans);
    }
}

/// Classify a tree-sitter node into a chunk kind + optional name. Returns
/// None for nodes that should not become standalone chunks.
fn classify_node(node: &Node, source: &str, lang: &str) -> Option<(String, Option<String>)> {
    let kind = node.kind();
    match lang {
        "rust" => classify_rust(node, kind, source),
        "python" => classify_python(node, kind, source),
        "javascript" | "jsx" | "typescript" | "tsx" => classify_js_ts(node, kind, source),
        "go" => classify_go(node, kind, source),
        "c" => classify_c(node, kind, source),
        _ => None,
    }
}

fn named_child_text(node: &Node, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field).map(|n| node_text(&n, source).to_string())
}

fn node_text<'a>(node: &Node, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

fn classify_rust(node: &Node, kind: &str, source: &str) -> Option<(String, Option<String>)> {
    match kind {
        "function_item" => Some(("function".into(), named_child_text(node, "name", source))),
        "struct_item" => Some(("struct".into(), named_child_text(node, "name", source))),
        "enum_item" => Some(("enum".into(), named_child_text(node, "name", source))),
        "impl_item" => Some(("impl".into(), named_child_text(node, "type", source))),
        "trait_item" => Some(("trait".into(), named_child_text(node, "name", source))),
        "mod_item" => Some(("module".into(), named_child_text(node, "name", source))),
        "type_item" => Some(("type_alias".into(), named_child_text(node, "name", source))),
        "const_item" | "static_item" => {
            Some(("constant".into(), named_child_text(node, "name", source)))
        }
        "macro_definition" => Some(("macro".into(), named_child_text(node, "name", source))),
        _ => None,
    }
}

fn classify_python(node: &Node, kind: &str, source: &str) -> Option<(String, Option<String>)> {
    match kind {
        "function_definition" => Some(("function".into(), named_child_text(node, "name", source))),
        "class_definition" => Some(("class".into(), named_child_text(node, "name", source))),
        "decorated_definition" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if let Some(result) = classify_python(&child, child.kind(), source) {
                    return Some(result);
                }
            }
            None
        }
        _ => None,
    }
}

fn classify_js_ts(node: &Node, kind: &str, source: &str) -> Option<(String, Option<String>)> {
    match kind {
        "function_declaration" => Some(("function".into(), named_child_text(node, "name", source))),
        "class_declaration" => Some(("class".into(), named_child_text(node, "name", source))),
        "method_definition" => Some(("method".into(), named_child_text(node, "name", source))),
        "interface_declaration" => {
            Some(("interface".into(), named_child_text(node, "name", source)))
        }
        "type_alias_declaration" => {
            Some(("type_alias".into(), named_child_text(node, "name", source)))
        }
        "enum_declaration" => Some(("enum".into(), named_child_text(node, "name", source))),
        "lexical_declaration" | "variable_declaration" => {
            let text = node_text(node, source);
            if text.contains("=>") || text.contains("function") {
                let name = node
                    .child(1)
                    .and_then(|d| d.child_by_field_name("name"))
                    .map(|n| node_text(&n, source).to_string());
                Some(("function".into(), name))
            } else {
                None
            }
        }
        "export_statement" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if let Some(result) = classify_js_ts(&child, child.kind(), source) {
                    return Some(result);
                }
            }
            None
        }
        _ => None,
    }
}

fn classify_go(node: &Node, kind: &str, source: &str) -> Option<(String, Option<String>)> {
    match kind {
        "function_declaration" => Some(("function".into(), named_child_text(node, "name", source))),
        "method_declaration" => Some(("method".into(), named_child_text(node, "name", source))),
        "type_declaration" => {
            let name = node.child(1).map(|n| node_text(&n, source).to_string());
            Some(("type".into(), name))
        }
        _ => None,
    }
}

fn classify_c(node: &Node, kind: &str, source: &str) -> Option<(String, Option<String>)> {
    match kind {
        "function_definition" => {
            let name = node
                .child_by_field_name("declarator")
                .and_then(|d| d.child_by_field_name("declarator"))
                .map(|n| node_text(&n, source).to_string());
            Some(("function".into(), name))
        }
        "struct_specifier" => Some(("struct".into(), named_child_text(node, "name", source))),
        "enum_specifier" => Some(("enum".into(), named_child_text(node, "name", source))),
        _ => None,
    }
}

const WINDOW_LINES: usize = 64;

/// Fixed-size line windows for content without a grammar. Window boundaries
/// depend only on the content, so indices stay stable.
fn window_spans(content: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut lines_in_window = 0usize;

    for (offset, _) in content.match_indices('\n') {
        lines_in_window += 1;
        if lines_in_window == WINDOW_LINES {
            spans.push(Span { start, end: offset + 1, kind: "raw".into(), name: None });
            start = offset + 1;
            lines_in_window = 0;
        }
    }
    if start < content.len() {
        spans.push(Span { start, end: content.len(), kind: "raw".into(), name: None });
    }
    spans
}
