use std::fmt::Write as _;

/// One output element: tag, attributes in insertion order, children, text.
/// Built completely before it is sequenced and serialized; nothing mutates
/// an element while its siblings are being consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct Elem {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Elem>,
    pub text: Option<String>,
}

impl Elem {
    pub fn new(tag: &str) -> Self {
        Elem {
            tag: tag.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_child(mut self, child: Elem) -> Self {
        self.children.push(child);
        self
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        if let Some(kv) = self.attrs.iter_mut().find(|(k, _)| k == key) {
            kv.1 = value.to_string();
        } else {
            self.attrs.push((key.to_string(), value.to_string()));
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, child: Elem) {
        self.children.push(child);
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, 0);
        out
    }

    /// Full document with XML declaration.
    pub fn to_document(&self) -> String {
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", self.to_xml())
    }

    fn write(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = write!(out, "{}<{}", pad, self.tag);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", k, escape(v));
        }
        match (&self.text, self.children.is_empty()) {
            (None, true) => {
                let _ = writeln!(out, "/>");
            }
            (Some(t), true) => {
                let _ = writeln!(out, ">{}</{}>", escape(t), self.tag);
            }
            (text, _) => {
                let _ = writeln!(out, ">");
                if let Some(t) = text {
                    let _ = writeln!(out, "{}  {}", pad, escape(t));
                }
                for c in &self.children {
                    c.write(out, depth + 1);
                }
                let _ = writeln!(out, "{}</{}>", pad, self.tag);
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialize_nested() {
        let e = Elem::new("cell")
            .with_attr("id", "c0")
            .with_child(Elem::new("notes").with_text("a <note>"));
        assert_eq!(
            e.to_xml(),
            "<cell id=\"c0\">\n  <notes>a &lt;note&gt;</notes>\n</cell>\n"
        );
    }

    #[test]
    fn attrs_keep_insertion_order() {
        let e = Elem::new("segment").with_attr("id", "1").with_attr("name", "soma");
        assert_eq!(
            e.attrs,
            vec![
                ("id".to_string(), "1".to_string()),
                ("name".to_string(), "soma".to_string())
            ]
        );
        assert_eq!(e.attr("name"), Some("soma"));
    }

    #[test]
    fn empty_element_self_closes() {
        assert_eq!(Elem::new("proximal").to_xml(), "<proximal/>\n");
    }
}
