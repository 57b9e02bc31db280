use std::str::FromStr;

use roxmltree::Node;

use crate::error::{parse_error, Result};

/// Attribute accessors over input nodes. Decoding failures surface as
/// Results so the import path can default-and-record instead of panicking.
pub fn req_attr(node: &Node, name: &str) -> Result<String> {
    node.attribute(name)
        .map(|s| s.to_string())
        .ok_or_else(|| {
            parse_error(format!(
                "Missing attribute {} on <{}>",
                name,
                node.tag_name().name()
            ))
        })
}

pub fn parse_attr<T: FromStr>(node: &Node, name: &str) -> Result<Option<T>> {
    match node.attribute(name) {
        Some(s) => s.parse::<T>().map(Some).map_err(|_| {
            parse_error(format!(
                "Bad value {:?} for attribute {} on <{}>",
                s,
                name,
                node.tag_name().name()
            ))
        }),
        None => Ok(None),
    }
}

pub fn parse_attr_or<T: FromStr>(node: &Node, name: &str, default: T) -> Result<T> {
    Ok(parse_attr(node, name)?.unwrap_or(default))
}

/// Element children only, skipping text and comments.
pub fn elements<'a, 'i>(node: &Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}
