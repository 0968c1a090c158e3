//! Newick reader and writer for height-annotated trees.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! Every non-root node needs a branch length. Heights are derived from the
//! lengths so that the deepest leaf sits at height zero; the parsed tree has
//! each leaf as its own single-copy haplotype.

use crate::tree::{NodeId, QsNode, QsTree};
use cyanea_core::{CyaneaError, Result};

/// Parse a Newick format string into a `QsTree`.
pub fn parse(input: &str) -> Result<QsTree> {
    let bytes = input.as_bytes();
    let mut parser = Parser::new(bytes);
    let root = parser.parse_tree()?;
    let nodes = parser.into_nodes(root)?;
    let mut tree = QsTree::from_nodes(nodes, root)?;
    tree.assign_haplotype_branches()?;
    Ok(tree)
}

/// Serialize a `QsTree` to a Newick format string.
pub fn write(tree: &QsTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &QsTree, id: NodeId, buf: &mut String) {
    let Some(node) = tree.get_node(id) else {
        return;
    };
    if !node.children.is_empty() {
        buf.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, buf);
        }
        buf.push(')');
    }
    if let Some(ref name) = node.name {
        buf.push_str(name);
    }
    if let Some(parent) = node.parent.and_then(|p| tree.get_node(p)) {
        buf.push(':');
        let s = format!("{:.10}", parent.height - node.height);
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        buf.push_str(s);
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<QsNode>,
    lengths: Vec<Option<f64>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
            lengths: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<NodeId> {
        self.skip_whitespace();
        let root = self.parse_subtree(None)?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(CyaneaError::Parse("expected ';' at end of Newick string".into()));
        }
        self.pos += 1;
        Ok(root)
    }

    /// Turn branch lengths into heights measured back from the deepest leaf.
    fn into_nodes(mut self, root: NodeId) -> Result<Vec<QsNode>> {
        let mut depth = vec![0.0; self.nodes.len()];
        // parents are allocated before their children
        for id in 0..self.nodes.len() {
            if id == root {
                continue;
            }
            let len = self.lengths[id].ok_or_else(|| {
                CyaneaError::Parse(format!(
                    "missing branch length for node {}",
                    self.nodes[id].name.as_deref().unwrap_or("<unnamed>")
                ))
            })?;
            if len < 0.0 {
                return Err(CyaneaError::Parse(format!("negative branch length: {}", len)));
            }
            let parent = self.nodes[id].parent.unwrap_or(root);
            depth[id] = depth[parent] + len;
        }
        let max_depth = depth.iter().copied().fold(0.0, f64::max);
        for (node, d) in self.nodes.iter_mut().zip(&depth) {
            node.height = max_depth - d;
        }
        Ok(self.nodes)
    }

    fn parse_subtree(&mut self, parent: Option<NodeId>) -> Result<NodeId> {
        self.skip_whitespace();
        let id = self.alloc_node(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1;
            let first_child = self.parse_subtree(Some(id))?;
            self.nodes[id].children.push(first_child);

            loop {
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                    let child = self.parse_subtree(Some(id))?;
                    self.nodes[id].children.push(child);
                } else {
                    break;
                }
            }
            self.skip_whitespace();
            if self.peek() != Some(b')') {
                return Err(CyaneaError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1;
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: NodeId) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(CyaneaError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str.parse().map_err(|_| {
                CyaneaError::Parse(format!("invalid branch length: '{}'", len_str))
            })?;
            self.lengths[id] = Some(len);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' | b',' | b')' | b'(' | b';' => break,
                b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') = self.peek() {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc_node(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(QsNode::new(id, parent, 0.0, None));
        self.lengths.push(None);
        id
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn height_of(tree: &QsTree, name: &str) -> f64 {
        let id = tree.node_by_name(name).unwrap();
        tree.get_node(id).unwrap().height
    }

    #[test]
    fn parse_simple_pair() {
        let tree = parse("(A:1,B:1);").unwrap();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(tree.leaf_names(), vec!["A", "B"]);
        assert_eq!(tree.get_node(tree.root()).unwrap().height, 1.0);
    }

    #[test]
    fn heights_from_branch_lengths() {
        let tree = parse("((A:0.5,B:1.0)AB:1.0,C:2.0)root;").unwrap();
        assert_eq!(height_of(&tree, "root"), 2.0);
        assert_eq!(height_of(&tree, "AB"), 1.0);
        assert_eq!(height_of(&tree, "A"), 0.5);
        assert_eq!(height_of(&tree, "B"), 0.0);
        assert_eq!(height_of(&tree, "C"), 0.0);
    }

    #[test]
    fn parsed_leaves_are_singleton_haplotypes() {
        let tree = parse("((A:1,B:1):1,C:2);").unwrap();
        for leaf in tree.leaves() {
            let node = tree.get_node(leaf).unwrap();
            assert_eq!(node.haplo_above, Some(leaf));
            assert_eq!(node.continuing, Some(leaf));
            tree.validate_junction(leaf).unwrap();
        }
        tree.validate_junction(tree.root()).unwrap();
    }

    #[test]
    fn parse_whitespace() {
        let tree = parse("  ( A : 0.1 , B : 0.2 ) ; ").unwrap();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn parse_error_missing_length() {
        let err = parse("(A:1,B);").unwrap_err();
        assert!(err.to_string().contains("missing branch length for node B"), "{}", err);
    }

    #[test]
    fn parse_error_negative_length() {
        assert!(parse("(A:-1,B:1);").is_err());
    }

    #[test]
    fn parse_error_unbalanced_parens() {
        assert!(parse("((A:1,B:1);").is_err());
    }

    #[test]
    fn parse_error_missing_semicolon() {
        assert!(parse("(A:1,B:1)").is_err());
    }

    #[test]
    fn parse_error_bad_float() {
        assert!(parse("(A:abc,B:1);").is_err());
    }

    #[test]
    fn write_uses_height_differences() {
        let tree = parse("((A:0.5,B:1)AB:1,C:2);").unwrap();
        assert_eq!(write(&tree), "((A:0.5,B:1)AB:1,C:2);");
    }
}
