//! Explicit namespace scope chain.
//!
//! Each open element gets a scope whose parent pointer is the enclosing
//! element's scope; prefix lookup walks the chain outward. One chain per
//! stream, so concurrent sessions never share namespace state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ns;

#[derive(Debug)]
pub struct NsScope {
    parent: Option<Arc<NsScope>>,
    /// Default namespace declared at this level, if any. An empty string
    /// undeclares the default namespace (xmlns="").
    default_ns: Option<String>,
    prefixes: HashMap<String, String>,
}

impl NsScope {
    /// The outermost scope. Binds the predefined `xml` and `xmlns`
    /// prefixes per the XML namespaces spec.
    pub fn root() -> Arc<Self> {
        let mut prefixes = HashMap::new();
        prefixes.insert("xml".to_string(), ns::XML.to_string());
        prefixes.insert("xmlns".to_string(), ns::XMLNS.to_string());

        Arc::new(Self {
            parent: None,
            default_ns: None,
            prefixes,
        })
    }

    /// Derive a child scope from the declarations on one open tag.
    ///
    /// `declarations` holds raw attribute pairs; only `xmlns` and
    /// `xmlns:prefix` entries are consulted.
    pub fn child(parent: &Arc<Self>, declarations: &[(String, String)]) -> Arc<Self> {
        let mut default_ns = None;
        let mut prefixes = HashMap::new();

        for (name, value) in declarations {
            if name == "xmlns" {
                default_ns = Some(value.clone());
            } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                prefixes.insert(prefix.to_string(), value.clone());
            }
        }

        if default_ns.is_none() && prefixes.is_empty() {
            // Nothing declared here; share the parent scope.
            return Arc::clone(parent);
        }

        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            default_ns,
            prefixes,
        })
    }

    /// Resolve a prefix by walking the chain outward.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<&str> {
        let mut scope = self;
        loop {
            if let Some(uri) = scope.prefixes.get(prefix) {
                return Some(uri);
            }
            match &scope.parent {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Resolve the in-scope default namespace, if one is declared.
    pub fn resolve_default(&self) -> Option<&str> {
        let mut scope = self;
        loop {
            if let Some(uri) = &scope.default_ns {
                // xmlns="" undeclares the default.
                return if uri.is_empty() { None } else { Some(uri) };
            }
            match &scope.parent {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Resolve a qualified element name `prefix:local` or bare `local`
    /// into `(namespace, local)`. An unknown prefix is an error the
    /// caller must treat as fatal.
    pub fn resolve_element(&self, qname: &str) -> Result<(Option<String>, String), String> {
        match qname.split_once(':') {
            Some((prefix, local)) => match self.resolve_prefix(prefix) {
                Some(uri) => Ok((Some(uri.to_string()), local.to_string())),
                None => Err(format!("unbound namespace prefix '{prefix}'")),
            },
            None => Ok((
                self.resolve_default().map(|uri| uri.to_string()),
                qname.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn child_inherits_parent_bindings() {
        let root = NsScope::root();
        let outer = NsScope::child(&root, &decls(&[("xmlns", "jabber:client")]));
        let inner = NsScope::child(&outer, &decls(&[]));

        assert_eq!(inner.resolve_default(), Some("jabber:client"));
    }

    #[test]
    fn child_redeclaration_shadows_parent() {
        let root = NsScope::root();
        let outer = NsScope::child(&root, &decls(&[("xmlns", "jabber:client")]));
        let inner = NsScope::child(&outer, &decls(&[("xmlns", "urn:example:other")]));

        assert_eq!(inner.resolve_default(), Some("urn:example:other"));
        assert_eq!(outer.resolve_default(), Some("jabber:client"));
    }

    #[test]
    fn empty_default_undeclares() {
        let root = NsScope::root();
        let outer = NsScope::child(&root, &decls(&[("xmlns", "jabber:client")]));
        let inner = NsScope::child(&outer, &decls(&[("xmlns", "")]));

        assert_eq!(inner.resolve_default(), None);
    }

    #[test]
    fn prefix_lookup_walks_chain() {
        let root = NsScope::root();
        let outer = NsScope::child(
            &root,
            &decls(&[("xmlns:stream", "http://etherx.jabber.org/streams")]),
        );
        let inner = NsScope::child(&outer, &decls(&[("xmlns", "jabber:client")]));

        assert_eq!(
            inner.resolve_prefix("stream"),
            Some("http://etherx.jabber.org/streams")
        );
        assert_eq!(inner.resolve_prefix("nope"), None);
    }

    #[test]
    fn resolve_element_reports_unbound_prefix() {
        let root = NsScope::root();
        let scope = NsScope::child(&root, &decls(&[("xmlns", "jabber:client")]));

        assert!(scope.resolve_element("bogus:item").is_err());
        let (ns, local) = scope.resolve_element("message").expect("bare name resolves");
        assert_eq!(ns.as_deref(), Some("jabber:client"));
        assert_eq!(local, "message");
    }

    #[test]
    fn xml_prefix_is_predefined() {
        let root = NsScope::root();
        assert_eq!(
            root.resolve_prefix("xml"),
            Some("http://www.w3.org/XML/1998/namespace")
        );
    }
}
