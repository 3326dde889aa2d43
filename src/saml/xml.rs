//! Namespace-aware XML tree for response signature checks.
//!
//! Responses are parsed from `quick-xml` events into an arena of nodes so that
//! signature verification can canonicalize exactly the subtree a signature
//! references, and the validator reads its claims from those same verified
//! nodes.
//!
//! Only elements, attributes, namespace declarations and text are kept. Comments and processing instructions are dropped (canonical XML
//! without comments ignores them), and document type declarations are refused
//! outright so no entity expansion ever takes place.

use std::collections::{BTreeMap, HashSet};

use quick_xml::{
    Reader,
    escape::unescape,
    events::{BytesStart, Event},
};

/// Namespace bound to the `xml` prefix.
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting accepted from untrusted input.
const MAX_DEPTH: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("document type declarations are not allowed")]
    DoctypeNotAllowed,

    #[error("unbound namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("document has no root element")]
    NoRoot,

    #[error("content outside the root element")]
    OutsideRoot,

    #[error("element nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("duplicate ID attribute '{0}'")]
    DuplicateId(String),
}

pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Attribute {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    value: String,
}

#[derive(Debug, Clone)]
struct ElementData {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    /// Declarations made on this element; `None` is the default namespace.
    declarations: Vec<(Option<String>, String)>,
    attributes: Vec<Attribute>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// A parsed XML document.
#[derive(Debug, Clone)]
pub struct XmlDocument {
    nodes: Vec<Node>,
    root: NodeId,
}

impl XmlDocument {
    /// Parse a document. Any well-formedness problem is an error.
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        let mut builder = TreeBuilder::default();
        let mut reader = Reader::from_str(input);

        loop {
            match reader
                .read_event()
                .map_err(|e| XmlError::Syntax(e.to_string()))?
            {
                Event::Start(start) => builder.open(&start, false)?,
                Event::Empty(start) => builder.open(&start, true)?,
                Event::End(_) => builder.close()?,
                Event::Text(text) => {
                    let raw = std::str::from_utf8(&text)
                        .map_err(|e| XmlError::Syntax(e.to_string()))?;
                    let normalized = normalize_line_endings(raw);
                    let value =
                        unescape(&normalized).map_err(|e| XmlError::Syntax(e.to_string()))?;
                    builder.text(&value)?;
                }
                Event::CData(data) => {
                    let raw = std::str::from_utf8(&data)
                        .map_err(|e| XmlError::Syntax(e.to_string()))?;
                    builder.text(&normalize_line_endings(raw))?;
                }
                Event::DocType(_) => return Err(XmlError::DoctypeNotAllowed),
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) => {}
                Event::Eof => break,
            }
        }

        builder.finish()
    }

    pub fn root(&self) -> Element<'_> {
        match &self.nodes[self.root].kind {
            NodeKind::Element(data) => Element {
                doc: self,
                id: self.root,
                data,
            },
            // `finish` only records element nodes as the root.
            NodeKind::Text(_) => unreachable!("document root is always an element"),
        }
    }

    fn element(&self, id: NodeId) -> Option<Element<'_>> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element(data) => Some(Element { doc: self, id, data }),
            NodeKind::Text(_) => None,
        }
    }

    /// Fail if two elements carry the same `ID` attribute. Signature
    /// references resolve by ID, so duplicates make the signed element
    /// ambiguous.
    pub fn ensure_unique_ids(&self) -> Result<(), XmlError> {
        let mut seen = HashSet::new();
        for element in self.root().descendants() {
            if let Some(id) = element.attribute("ID")
                && !seen.insert(id)
            {
                return Err(XmlError::DuplicateId(id.to_string()));
            }
        }
        Ok(())
    }

    /// The element whose `ID` attribute equals `id`.
    #[cfg(test)]
    pub fn find_by_id(&self, id: &str) -> Option<Element<'_>> {
        self.root()
            .descendants()
            .into_iter()
            .find(|e| e.attribute("ID") == Some(id))
    }

    /// Exclusive XML canonicalization (without comments) of `element`.
    ///
    /// `exclude` names a subtree left out of the output, which is how the
    /// enveloped-signature transform drops the signature being verified.
    /// `inclusive_prefixes` is the `InclusiveNamespaces PrefixList`;
    /// `#default` stands for the default namespace.
    pub fn canonicalize(
        &self,
        element: Element<'_>,
        exclude: Option<NodeId>,
        inclusive_prefixes: &[String],
    ) -> String {
        let mut out = String::new();
        self.write_canonical(
            element.id,
            exclude,
            inclusive_prefixes,
            &BTreeMap::new(),
            &mut out,
        );
        out
    }

    fn data(&self, id: NodeId) -> Option<&ElementData> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element(data) => Some(data),
            NodeKind::Text(_) => None,
        }
    }

    /// Namespace bound to `prefix` in scope at `id`.
    fn lookup_namespace(&self, id: NodeId, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NS);
        }
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(data) = self.data(node)
                && let Some((_, uri)) = data
                    .declarations
                    .iter()
                    .find(|(p, _)| p.as_deref() == prefix)
            {
                return if uri.is_empty() { None } else { Some(uri) };
            }
            current = self.nodes[node].parent;
        }
        None
    }

    fn write_canonical(
        &self,
        id: NodeId,
        exclude: Option<NodeId>,
        inclusive_prefixes: &[String],
        rendered: &BTreeMap<String, String>,
        out: &mut String,
    ) {
        let Some(data) = self.data(id) else { return };

        // Namespaces visibly utilized by this element, keyed by prefix ("" = default).
        let mut utilized: BTreeMap<String, String> = BTreeMap::new();
        utilized.insert(
            data.prefix.clone().unwrap_or_default(),
            data.namespace.clone().unwrap_or_default(),
        );
        for attr in &data.attributes {
            if let (Some(prefix), Some(ns)) = (&attr.prefix, &attr.namespace)
                && prefix != "xml"
            {
                utilized.insert(prefix.clone(), ns.clone());
            }
        }
        for listed in inclusive_prefixes {
            let key = if listed == "#default" {
                String::new()
            } else {
                listed.clone()
            };
            if utilized.contains_key(&key) {
                continue;
            }
            let prefix = (!key.is_empty()).then_some(key.as_str());
            if let Some(uri) = self.lookup_namespace(id, prefix) {
                utilized.insert(key, uri.to_string());
            }
        }

        let mut scope = rendered.clone();
        let mut declarations = Vec::new();
        for (prefix, uri) in utilized {
            let inherited = rendered.get(&prefix).map(String::as_str).unwrap_or("");
            if uri == inherited {
                continue;
            }
            declarations.push((prefix.clone(), uri.clone()));
            scope.insert(prefix, uri);
        }

        let qname = qualified_name(data.prefix.as_deref(), &data.local);
        out.push('<');
        out.push_str(&qname);
        for (prefix, uri) in &declarations {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_attribute_into(uri, out);
            out.push('"');
        }

        let mut attributes: Vec<&Attribute> = data.attributes.iter().collect();
        attributes.sort_by(|a, b| {
            (a.namespace.as_deref().unwrap_or(""), a.local.as_str())
                .cmp(&(b.namespace.as_deref().unwrap_or(""), b.local.as_str()))
        });
        for attr in attributes {
            out.push(' ');
            out.push_str(&qualified_name(attr.prefix.as_deref(), &attr.local));
            out.push_str("=\"");
            escape_attribute_into(&attr.value, out);
            out.push('"');
        }
        out.push('>');

        for &child in &data.children {
            if Some(child) == exclude {
                continue;
            }
            match &self.nodes[child].kind {
                NodeKind::Element(_) => {
                    self.write_canonical(child, exclude, inclusive_prefixes, &scope, out)
                }
                NodeKind::Text(text) => escape_text_into(text, out),
            }
        }

        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
}

/// Borrowed handle to an element of an [`XmlDocument`].
#[derive(Clone, Copy)]
pub struct Element<'a> {
    doc: &'a XmlDocument,
    id: NodeId,
    data: &'a ElementData,
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("name", &self.local_name())
            .finish()
    }
}

impl<'a> Element<'a> {
    pub fn node_id(self) -> NodeId {
        self.id
    }

    pub fn local_name(self) -> &'a str {
        &self.data.local
    }

    fn namespace(self) -> Option<&'a str> {
        self.data.namespace.as_deref()
    }

    /// True when the element has the given namespace and local name.
    pub fn is(self, namespace: &str, local: &str) -> bool {
        self.namespace() == Some(namespace) && self.local_name() == local
    }

    /// Value of an unqualified attribute.
    pub fn attribute(self, name: &str) -> Option<&'a str> {
        self.data
            .attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local == name)
            .map(|a| a.value.as_str())
    }

    /// Child elements in document order.
    fn children(self) -> impl Iterator<Item = Element<'a>> {
        let doc = self.doc;
        self.data
            .children
            .iter()
            .filter_map(move |&child| doc.element(child))
    }

    /// Child elements with the given name.
    pub fn children_named(
        self,
        namespace: &'a str,
        local: &'a str,
    ) -> impl Iterator<Item = Element<'a>> {
        self.children().filter(move |c| c.is(namespace, local))
    }

    /// First child element with the given name.
    pub fn child(self, namespace: &str, local: &str) -> Option<Element<'a>> {
        self.children().find(|c| c.is(namespace, local))
    }

    /// This element and every element below it, in document order.
    fn descendants(self) -> Vec<Element<'a>> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(element) = stack.pop() {
            found.push(element);
            let children: Vec<_> = element.children().collect();
            stack.extend(children.into_iter().rev());
        }
        found
    }

    /// Concatenated text content of direct text children.
    pub fn text(self) -> String {
        self.data
            .children
            .iter()
            .filter_map(|&child| match &self.doc.nodes[child].kind {
                NodeKind::Text(text) => Some(text.as_str()),
                NodeKind::Element(_) => None,
            })
            .collect()
    }

    /// Text content with surrounding whitespace removed, or `None` if blank.
    pub fn trimmed_text(self) -> Option<String> {
        let text = self.text();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[derive(Default)]
struct TreeBuilder {
    nodes: Vec<Node>,
    stack: Vec<NodeId>,
    root: Option<NodeId>,
}

impl TreeBuilder {
    fn open(&mut self, start: &BytesStart<'_>, empty: bool) -> Result<(), XmlError> {
        let parent = self.stack.last().copied();
        if parent.is_none() && self.root.is_some() {
            return Err(XmlError::OutsideRoot);
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(XmlError::TooDeep);
        }

        let qname = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| XmlError::Syntax(e.to_string()))?
            .to_string();

        let mut declarations = Vec::new();
        let mut raw_attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Syntax(e.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| XmlError::Syntax(e.to_string()))?;
            let raw = std::str::from_utf8(&attr.value)
                .map_err(|e| XmlError::Syntax(e.to_string()))?;
            let value = normalize_attribute_value(raw)?;

            if key == "xmlns" {
                declarations.push((None, value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(XmlError::Syntax(format!(
                        "prefix '{prefix}' bound to an empty namespace"
                    )));
                }
                declarations.push((Some(prefix.to_string()), value));
            } else {
                raw_attributes.push((key.to_string(), value));
            }
        }

        let id = self.nodes.len();
        let (prefix, local) = split_qname(&qname);
        self.nodes.push(Node {
            parent,
            kind: NodeKind::Element(ElementData {
                prefix: prefix.clone(),
                local,
                namespace: None,
                declarations,
                attributes: Vec::new(),
                children: Vec::new(),
            }),
        });

        // Declarations are in place, so names on this element can be resolved.
        let namespace = self.resolve(id, prefix.as_deref(), true)?;
        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (prefix, local) = split_qname(&key);
            let namespace = match prefix.as_deref() {
                Some(p) => self.resolve(id, Some(p), false)?,
                None => None,
            };
            attributes.push(Attribute {
                prefix,
                local,
                namespace,
                value,
            });
        }

        if let NodeKind::Element(data) = &mut self.nodes[id].kind {
            data.namespace = namespace;
            data.attributes = attributes;
        }

        match parent {
            Some(parent) => {
                if let NodeKind::Element(data) = &mut self.nodes[parent].kind {
                    data.children.push(id);
                }
            }
            None => self.root = Some(id),
        }

        if !empty {
            self.stack.push(id);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), XmlError> {
        self.stack
            .pop()
            .map(|_| ())
            .ok_or_else(|| XmlError::Syntax("unexpected closing tag".into()))
    }

    fn text(&mut self, value: &str) -> Result<(), XmlError> {
        let Some(&parent) = self.stack.last() else {
            if value.trim().is_empty() {
                return Ok(());
            }
            return Err(XmlError::OutsideRoot);
        };
        if value.is_empty() {
            return Ok(());
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            kind: NodeKind::Text(value.to_string()),
        });
        if let NodeKind::Element(data) = &mut self.nodes[parent].kind {
            data.children.push(id);
        }
        Ok(())
    }

    fn finish(self) -> Result<XmlDocument, XmlError> {
        if !self.stack.is_empty() {
            return Err(XmlError::Syntax("unclosed element at end of input".into()));
        }
        let root = self.root.ok_or(XmlError::NoRoot)?;
        Ok(XmlDocument {
            nodes: self.nodes,
            root,
        })
    }

    fn resolve(
        &self,
        id: NodeId,
        prefix: Option<&str>,
        is_element: bool,
    ) -> Result<Option<String>, XmlError> {
        if prefix == Some("xml") {
            return Ok(Some(XML_NS.to_string()));
        }
        if prefix.is_none() && !is_element {
            return Ok(None);
        }
        let mut current = Some(id);
        while let Some(node) = current {
            if let NodeKind::Element(data) = &self.nodes[node].kind
                && let Some((_, uri)) = data
                    .declarations
                    .iter()
                    .find(|(p, _)| p.as_deref() == prefix)
            {
                return Ok((!uri.is_empty()).then(|| uri.clone()));
            }
            current = self.nodes[node].parent;
        }
        match prefix {
            Some(p) => Err(XmlError::UnboundPrefix(p.to_string())),
            None => Ok(None),
        }
    }
}

fn split_qname(qname: &str) -> (Option<String>, String) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qname.to_string()),
    }
}

fn qualified_name(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Attribute-value normalization: literal whitespace becomes a space before
/// character references are expanded, so `&#xA;` survives as a newline.
fn normalize_attribute_value(raw: &str) -> Result<String, XmlError> {
    let normalized: String = normalize_line_endings(raw)
        .chars()
        .map(|c| if matches!(c, '\t' | '\n') { ' ' } else { c })
        .collect();
    unescape(&normalized)
        .map(|v| v.into_owned())
        .map_err(|e| XmlError::Syntax(e.to_string()))
}

fn escape_text_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c14n(xml: &str) -> String {
        let doc = XmlDocument::parse(xml).unwrap();
        doc.canonicalize(doc.root(), None, &[])
    }

    #[test]
    fn test_parse_resolves_namespaces() {
        let doc = XmlDocument::parse(
            r#"<?xml version="1.0"?>
<a:Root xmlns:a="urn:a" xmlns="urn:default"><Child attr="v"/><a:Other/></a:Root>"#,
        )
        .unwrap();

        let root = doc.root();
        assert!(root.is("urn:a", "Root"));

        let children: Vec<_> = root.children().collect();
        assert_eq!(children.len(), 2);
        assert!(children[0].is("urn:default", "Child"));
        assert_eq!(children[0].attribute("attr"), Some("v"));
        assert!(children[1].is("urn:a", "Other"));
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = r#"<!DOCTYPE r [<!ENTITY x "boom">]><r>&x;</r>"#;
        assert!(matches!(
            XmlDocument::parse(xml),
            Err(XmlError::DoctypeNotAllowed)
        ));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(matches!(
            XmlDocument::parse("<x:r/>"),
            Err(XmlError::UnboundPrefix(_))
        ));
        assert!(XmlDocument::parse("<r><a></r>").is_err());
        assert!(matches!(XmlDocument::parse("<r/><r/>"), Err(XmlError::OutsideRoot)));
        assert!(matches!(XmlDocument::parse("   "), Err(XmlError::NoRoot)));
        assert!(XmlDocument::parse("not xml at all").is_err());
        assert!(XmlDocument::parse(r#"<r a="1" a="2"/>"#).is_err());
    }

    #[test]
    fn test_text_is_unescaped_and_line_endings_normalized() {
        let doc = XmlDocument::parse("<r>a &amp; b\r\nc<![CDATA[<d>]]></r>").unwrap();
        assert_eq!(doc.root().text(), "a & b\nc<d>");
    }

    #[test]
    fn test_c14n_renders_only_utilized_namespaces() {
        let xml = r#"<a:Root xmlns:b="urn:b" xmlns:a="urn:a" z="1" a:y="2"><a:Child>t &amp; &lt; &gt; "</a:Child><Empty/></a:Root>"#;
        assert_eq!(
            c14n(xml),
            r#"<a:Root xmlns:a="urn:a" z="1" a:y="2"><a:Child>t &amp; &lt; &gt; "</a:Child><Empty></Empty></a:Root>"#
        );
    }

    #[test]
    fn test_c14n_subtree_declares_inherited_namespaces() {
        let doc = XmlDocument::parse(
            r#"<a:Root xmlns:a="urn:a" xmlns:b="urn:b"><a:Child b:x="1">t</a:Child></a:Root>"#,
        )
        .unwrap();
        let child = doc.root().child("urn:a", "Child").unwrap();

        assert_eq!(
            doc.canonicalize(child, None, &[]),
            r#"<a:Child xmlns:a="urn:a" xmlns:b="urn:b" b:x="1">t</a:Child>"#
        );
    }

    #[test]
    fn test_c14n_inclusive_prefix_list() {
        let doc = XmlDocument::parse(
            r#"<a:Root xmlns:a="urn:a" xmlns:xs="urn:xs"><a:Child>t</a:Child></a:Root>"#,
        )
        .unwrap();
        let child = doc.root().child("urn:a", "Child").unwrap();

        assert_eq!(
            doc.canonicalize(child, None, &["xs".to_string()]),
            r#"<a:Child xmlns:a="urn:a" xmlns:xs="urn:xs">t</a:Child>"#
        );
    }

    #[test]
    fn test_c14n_default_namespace_undeclaration() {
        assert_eq!(
            c14n(r#"<Root xmlns="urn:x"><Inner xmlns=""/></Root>"#),
            r#"<Root xmlns="urn:x"><Inner xmlns=""></Inner></Root>"#
        );
        assert_eq!(
            c14n(r#"<Root xmlns="urn:x"><Inner xmlns="urn:x"/></Root>"#),
            r#"<Root xmlns="urn:x"><Inner></Inner></Root>"#
        );
    }

    #[test]
    fn test_c14n_attribute_normalization() {
        assert_eq!(
            c14n("<r b=\"p\nq\" a=\"x&#xA;y &quot;\"/>"),
            r#"<r a="x&#xA;y &quot;" b="p q"></r>"#
        );
    }

    #[test]
    fn test_c14n_excludes_subtree() {
        let doc = XmlDocument::parse(r#"<r><keep/><drop><x/></drop>tail</r>"#).unwrap();
        let drop = doc
            .root()
            .children()
            .find(|c| c.local_name() == "drop")
            .unwrap();

        assert_eq!(
            doc.canonicalize(doc.root(), Some(drop.node_id()), &[]),
            "<r><keep></keep>tail</r>"
        );
    }

    #[test]
    fn test_ids() {
        let doc = XmlDocument::parse(r#"<r ID="a"><c ID="b"/></r>"#).unwrap();
        assert!(doc.ensure_unique_ids().is_ok());
        assert_eq!(doc.find_by_id("b").map(|e| e.local_name()), Some("c"));
        assert!(doc.find_by_id("missing").is_none());

        let doc = XmlDocument::parse(r#"<r ID="a"><c ID="a"/></r>"#).unwrap();
        assert!(matches!(
            doc.ensure_unique_ids(),
            Err(XmlError::DuplicateId(id)) if id == "a"
        ));
    }
}
