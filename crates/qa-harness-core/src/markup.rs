//! Structural markup chunking.
//!
//! The markup extraction collaborator hands the core a [`MarkupNode`] tree
//! with interactive-element selectors already identified. This module renders
//! that tree into one line per node and packs whole lines into chunks, so an
//! interactive element's definition is never split across a boundary.
//!
//! ```text
//! <form id="checkout">
//!   <label for="discount-code">
//!     Discount code
//!   <input id="discount-code" name="discount" type="text"></input>     ← atomic
//!   <button id="apply-discount" type="button">Apply</button>          ← atomic
//! ```
//!
//! Each emitted chunk lists the selectors of every interactive element whose
//! line lies wholly inside it.

use serde::{Deserialize, Serialize};

use crate::chunk::{byte_offsets, chunking_error, make_chunk, ChunkParams};
use crate::error::QaResult;
use crate::models::{CharSpan, Chunk, SourceKind};

/// Tags whose elements are interactive.
pub const INTERACTIVE_TAGS: &[&str] = &["input", "button", "a", "select", "textarea"];

/// Attributes carried into the rendered line of an element.
const RENDERED_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "type",
    "class",
    "for",
    "href",
    "placeholder",
    "value",
    "role",
    "aria-label",
    "data-testid",
    "maxlength",
    "minlength",
    "required",
    "pattern",
];

/// Node of the structural tree of the target page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkupNode {
    /// Lower-case tag name; empty for text nodes.
    pub tag: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    /// Text content for text nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Selector of this element when it is interactive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub children: Vec<MarkupNode>,
}

impl MarkupNode {
    pub fn element(tag: &str, attributes: &[(&str, &str)], children: Vec<MarkupNode>) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            text: None,
            selector: None,
            children,
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn is_text(&self) -> bool {
        self.tag.is_empty()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this element is an interactive control.
    pub fn is_interactive(&self) -> bool {
        if !INTERACTIVE_TAGS.contains(&self.tag.as_str()) {
            return false;
        }
        !(self.tag == "input" && self.attr("type") == Some("hidden"))
    }

    /// Concatenated descendant text, whitespace-collapsed.
    pub fn inner_text(&self) -> String {
        let mut parts = Vec::new();
        collect_text(self, &mut parts);
        parts.join(" ")
    }

    /// Every selector recorded in the tree, in document order.
    pub fn selectors(&self) -> Vec<String> {
        let mut out = Vec::new();
        walk_selectors(self, &mut out);
        out
    }
}

fn collect_text(node: &MarkupNode, out: &mut Vec<String>) {
    if let Some(t) = &node.text {
        let collapsed = collapse_whitespace(t);
        if !collapsed.is_empty() {
            out.push(collapsed);
        }
    }
    for child in &node.children {
        collect_text(child, out);
    }
}

fn walk_selectors(node: &MarkupNode, out: &mut Vec<String>) {
    if let Some(s) = &node.selector {
        out.push(s.clone());
    }
    for child in &node.children {
        walk_selectors(child, out);
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Assign a canonical selector to every interactive element of the tree.
///
/// `#id` when the element has an id, `tag[name="…"]` when it has a name,
/// otherwise a positional CSS path anchored at the nearest ancestor with an id.
/// An anonymous interactive root is addressed by its tag.
pub fn assign_selectors(root: &mut MarkupNode) {
    assign_rec(root, &[]);
}

fn assign_rec(node: &mut MarkupNode, path: &[String]) {
    if node.is_text() {
        return;
    }
    if node.is_interactive() {
        node.selector = Some(match (node.attr("id"), node.attr("name")) {
            (Some(id), _) if !id.trim().is_empty() => format!("#{}", id.trim()),
            (_, Some(name)) if !name.trim().is_empty() => {
                format!("{}[name=\"{}\"]", node.tag, name.trim())
            }
            _ if path.is_empty() => node.tag.clone(),
            _ => path.join(" > "),
        });
    }

    let mut seen: Vec<(String, usize)> = Vec::new();
    let mut child_paths = Vec::with_capacity(node.children.len());
    for child in &node.children {
        if child.is_text() {
            child_paths.push(Vec::new());
            continue;
        }
        let nth = match seen.iter_mut().find(|(t, _)| *t == child.tag) {
            Some((_, n)) => {
                *n += 1;
                *n
            }
            None => {
                seen.push((child.tag.clone(), 1));
                1
            }
        };
        let step = match child.attr("id") {
            Some(id) if !id.trim().is_empty() => format!("#{}", id.trim()),
            _ => format!("{}:nth-of-type({})", child.tag, nth),
        };
        let mut p = if step.starts_with('#') {
            Vec::new()
        } else {
            path.to_vec()
        };
        p.push(step);
        child_paths.push(p);
    }
    for (child, p) in node.children.iter_mut().zip(child_paths) {
        assign_rec(child, &p);
    }
}

/// Canonical comparison form of a selector.
///
/// `input#discount-code`, `[id="discount-code"]`, and `#discount-code` all
/// normalize to `#discount-code`; single quotes become double quotes.
pub fn normalize_selector(selector: &str) -> String {
    let s = collapse_whitespace(selector.trim()).replace('\'', "\"");

    if let Some(inner) = s
        .strip_prefix("[id=\"")
        .and_then(|rest| rest.strip_suffix("\"]"))
    {
        return format!("#{}", inner);
    }

    if let Some(pos) = s.find('#') {
        let (tag, rest) = s.split_at(pos);
        let tag_only = !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        let simple_id = rest[1..]
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '>' | '+' | '~' | '[' | ':' | '.'));
        if tag_only && simple_id {
            return rest.to_string();
        }
    }
    s
}

struct Line {
    text: String,
    atomic: bool,
    selector: Option<String>,
}

/// Render the tree into lines, one per node; interactive elements collapse
/// their whole subtree into a single atomic line.
fn render_lines(node: &MarkupNode, depth: usize, out: &mut Vec<Line>) {
    let indent = "  ".repeat(depth);
    if node.is_text() {
        let text = node.text.as_deref().map(collapse_whitespace).unwrap_or_default();
        if !text.is_empty() {
            out.push(Line {
                text: format!("{}{}\n", indent, text),
                atomic: false,
                selector: None,
            });
        }
        return;
    }
    if matches!(node.tag.as_str(), "script" | "style") {
        return;
    }

    let synthetic = node.tag.starts_with('#');
    let child_depth = if synthetic { depth } else { depth + 1 };

    if !synthetic {
        let open = open_tag(node);
        if node.is_interactive() {
            out.push(Line {
                text: format!("{}{}{}</{}>\n", indent, open, node.inner_text(), node.tag),
                atomic: true,
                selector: node.selector.clone(),
            });
            return;
        }
        out.push(Line {
            text: format!("{}{}\n", indent, open),
            atomic: false,
            selector: None,
        });
    }
    for child in &node.children {
        render_lines(child, child_depth, out);
    }
}

fn open_tag(node: &MarkupNode) -> String {
    let mut s = format!("<{}", node.tag);
    for name in RENDERED_ATTRIBUTES {
        if let Some(v) = node.attr(name) {
            s.push_str(&format!(" {}=\"{}\"", name, collapse_whitespace(v)));
        }
    }
    s.push('>');
    s
}

/// Render the tree to the text that markup chunk spans index into.
pub fn render(root: &MarkupNode) -> String {
    let mut lines = Vec::new();
    render_lines(root, 0, &mut lines);
    lines.into_iter().map(|l| l.text).collect()
}

/// A packing unit: a whole line, or a piece of a long non-atomic line.
struct Unit {
    chars: usize,
    selector: Option<String>,
}

fn units_for(lines: Vec<Line>, max_size: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    for line in lines {
        let len = line.text.chars().count();
        if line.atomic || len <= max_size {
            units.push(Unit {
                chars: len,
                selector: line.selector,
            });
            continue;
        }
        // Long text runs are split at whitespace into pieces of at most max_size.
        let chars: Vec<char> = line.text.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let hard_end = (start + max_size).min(chars.len());
            let end = if hard_end < chars.len() {
                (start + 1..=hard_end)
                    .rev()
                    .find(|&p| chars[p - 1].is_whitespace())
                    .unwrap_or(hard_end)
            } else {
                hard_end
            };
            units.push(Unit {
                chars: end - start,
                selector: None,
            });
            start = end;
        }
    }
    units
}

/// Chunk a markup tree along line boundaries.
///
/// An atomic line longer than `max_size` becomes its own oversized chunk;
/// keeping a selector intact wins over the size bound.
pub fn chunk_markup(source_id: &str, root: &MarkupNode, params: &ChunkParams) -> QaResult<Vec<Chunk>> {
    params.validate(source_id)?;

    let mut lines = Vec::new();
    render_lines(root, 0, &mut lines);
    let rendered: String = lines.iter().map(|l| l.text.as_str()).collect();
    if rendered.trim().is_empty() {
        return Err(chunking_error(source_id, "markup tree renders to empty text"));
    }

    let units = units_for(lines, params.max_size);
    let mut bounds = Vec::with_capacity(units.len() + 1);
    bounds.push(0usize);
    for u in &units {
        let last = bounds[bounds.len() - 1];
        bounds.push(last + u.chars);
    }
    let m = units.len();
    let offsets = byte_offsets(&rendered);

    let mut chunks = Vec::new();
    let mut start_idx = 0usize;
    loop {
        let mut end_idx = start_idx + 1;
        while end_idx < m && bounds[end_idx + 1] - bounds[start_idx] <= params.max_size {
            end_idx += 1;
        }

        let span = CharSpan {
            start: bounds[start_idx],
            end: bounds[end_idx],
        };
        let selectors: Vec<String> = units[start_idx..end_idx]
            .iter()
            .filter_map(|u| u.selector.clone())
            .collect();
        let text = &rendered[offsets[span.start]..offsets[span.end]];
        chunks.push(make_chunk(
            source_id,
            SourceKind::Markup,
            chunks.len(),
            span,
            text,
            Some(selectors),
        ));

        if end_idx == m {
            break;
        }

        // Back up to the earliest unit boundary within `overlap` of the end
        // from which the next chunk can still take the following unit.
        let target = bounds[end_idx].saturating_sub(params.overlap);
        start_idx = (start_idx + 1..=end_idx)
            .find(|&j| bounds[j] >= target && bounds[end_idx + 1] - bounds[j] <= params.max_size)
            .unwrap_or(end_idx);
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QaError;

    fn checkout_page() -> MarkupNode {
        let mut root = MarkupNode::element(
            "#document",
            &[],
            vec![MarkupNode::element(
                "body",
                &[],
                vec![
                    MarkupNode::element("h1", &[], vec![MarkupNode::text("Checkout")]),
                    MarkupNode::element(
                        "form",
                        &[("id", "checkout")],
                        vec![
                            MarkupNode::element(
                                "label",
                                &[("for", "discount-code")],
                                vec![MarkupNode::text("Discount code")],
                            ),
                            MarkupNode::element(
                                "input",
                                &[("id", "discount-code"), ("type", "text")],
                                vec![],
                            ),
                            MarkupNode::element(
                                "button",
                                &[("id", "apply-discount"), ("type", "button")],
                                vec![MarkupNode::text("Apply")],
                            ),
                            MarkupNode::element("input", &[("name", "email")], vec![]),
                            MarkupNode::element("button", &[], vec![MarkupNode::text("Pay Now")]),
                            MarkupNode::element("input", &[("type", "hidden"), ("name", "csrf")], vec![]),
                        ],
                    ),
                ],
            )],
        );
        assign_selectors(&mut root);
        root
    }

    #[test]
    fn test_assign_selectors() {
        let page = checkout_page();
        assert_eq!(
            page.selectors(),
            vec![
                "#discount-code".to_string(),
                "#apply-discount".to_string(),
                "input[name=\"email\"]".to_string(),
                "#checkout > button:nth-of-type(2)".to_string(),
            ]
        );
    }

    #[test]
    fn test_anonymous_interactive_root_gets_tag_selector() {
        let mut root = MarkupNode::element("a", &[("href", "/")], vec![MarkupNode::text("Home")]);
        assign_selectors(&mut root);
        assert_eq!(root.selector.as_deref(), Some("a"));
        assert!(root.selectors().iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_single_chunk_records_all_selectors() {
        let page = checkout_page();
        let chunks = chunk_markup("checkout.html", &page, &ChunkParams { max_size: 2000, overlap: 100 }).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_kind, SourceKind::Markup);
        assert_eq!(chunks[0].selectors().len(), 4);
        assert!(chunks[0].text.contains("<button id=\"apply-discount\" type=\"button\">Apply</button>"));
        assert!(chunks[0].selectors().iter().all(|s| !s.contains("csrf")));
    }

    #[test]
    fn test_selectors_never_split() {
        let page = checkout_page();
        let rendered = render(&page);
        let params = ChunkParams { max_size: 60, overlap: 20 };
        let chunks = chunk_markup("checkout.html", &page, &params).unwrap();
        assert!(chunks.len() > 2);

        let mut seen = Vec::new();
        for c in &chunks {
            for sel in c.selectors() {
                if !seen.contains(sel) {
                    seen.push(sel.clone());
                }
                let id = sel.trim_start_matches('#');
                if sel.starts_with('#') && !sel.contains(' ') {
                    assert!(c.text.contains(&format!("id=\"{}\"", id)));
                }
            }
        }
        assert_eq!(seen, page.selectors());

        let mut covered = 0;
        for c in &chunks {
            assert!(c.char_span.start <= covered);
            assert!(covered - c.char_span.start <= params.overlap);
            covered = c.char_span.end;
        }
        assert_eq!(covered, rendered.chars().count());
    }

    #[test]
    fn test_oversized_atomic_line_kept_whole() {
        let long_label = "x".repeat(80);
        let mut root = MarkupNode::element(
            "body",
            &[],
            vec![
                MarkupNode::element("p", &[], vec![MarkupNode::text("intro")]),
                MarkupNode::element("button", &[("id", "big")], vec![MarkupNode::text(&long_label)]),
            ],
        );
        assign_selectors(&mut root);
        let chunks = chunk_markup("p.html", &root, &ChunkParams { max_size: 30, overlap: 5 }).unwrap();
        let holder: Vec<_> = chunks.iter().filter(|c| !c.selectors().is_empty()).collect();
        assert_eq!(holder.len(), 1);
        assert!(holder[0].text.contains(&long_label));
        assert!(holder[0].char_span.len() > 30);
    }

    #[test]
    fn test_empty_tree_rejected() {
        let root = MarkupNode::element("body", &[], vec![]);
        let rendered = render(&root);
        assert_eq!(rendered, "<body>\n");
        let empty = MarkupNode::element("#document", &[], vec![]);
        let err = chunk_markup("e.html", &empty, &ChunkParams { max_size: 10, overlap: 0 }).unwrap_err();
        assert!(matches!(err, QaError::Chunking { .. }));
    }

    #[test]
    fn test_deterministic() {
        let page = checkout_page();
        let params = ChunkParams { max_size: 50, overlap: 10 };
        assert_eq!(
            chunk_markup("c.html", &page, &params).unwrap(),
            chunk_markup("c.html", &page, &params).unwrap()
        );
    }

    #[test]
    fn test_normalize_selector() {
        assert_eq!(normalize_selector("input#discount-code"), "#discount-code");
        assert_eq!(normalize_selector("#discount-code"), "#discount-code");
        assert_eq!(normalize_selector("[id='discount-code']"), "#discount-code");
        assert_eq!(normalize_selector("input[name='email']"), "input[name=\"email\"]");
        assert_eq!(normalize_selector("form#checkout > button"), "form#checkout > button");
    }
}
