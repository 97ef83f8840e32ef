//! Namespace-aware lookups along the SOAP 1.1 fault path.
//!
//! Every step follows all matching siblings, not only the first, so a
//! `NoPermissionFault` in a second `detail` or `Fault` element is still found.

use roxmltree::{Document, Node};

pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const VIM25_NS: &str = "urn:vim25";

pub const NO_PERMISSION_FAULT: &str = "NoPermissionFault";

fn is_element(node: &Node<'_, '_>, namespace: Option<&str>, name: &str) -> bool {
    let tag = node.tag_name();
    node.is_element() && tag.namespace() == namespace && tag.name() == name
}

/// Child elements with the exact expanded name, in document order. `None`
/// namespace only matches unqualified elements.
pub fn child_elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    namespace: Option<&'a str>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |child| is_element(child, namespace, name))
}

pub fn child_element<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    namespace: Option<&'a str>,
    name: &'a str,
) -> Option<Node<'a, 'input>> {
    child_elements(node, namespace, name).next()
}

/// Every `Envelope/Body/Fault/detail`, with `detail` unqualified as SOAP 1.1
/// emits it. Empty unless the root is a SOAP envelope.
pub fn fault_details<'a, 'input: 'a>(
    doc: &'a Document<'input>,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    let envelope = doc.root_element();
    is_element(&envelope, Some(SOAP_ENVELOPE_NS), "Envelope")
        .then_some(envelope)
        .into_iter()
        .flat_map(|envelope| child_elements(envelope, Some(SOAP_ENVELOPE_NS), "Body"))
        .flat_map(|body| child_elements(body, Some(SOAP_ENVELOPE_NS), "Fault"))
        .flat_map(|fault| child_elements(fault, None, "detail"))
}

pub fn permission_faults<'a, 'input: 'a>(
    doc: &'a Document<'input>,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    fault_details(doc).flat_map(|detail| child_elements(detail, Some(VIM25_NS), NO_PERMISSION_FAULT))
}

pub fn permission_fault<'a, 'input: 'a>(doc: &'a Document<'input>) -> Option<Node<'a, 'input>> {
    permission_faults(doc).next()
}

/// First `{urn:vim25}<name>` child across all `NoPermissionFault` elements.
pub fn permission_fault_child<'a, 'input: 'a>(
    doc: &'a Document<'input>,
    name: &'a str,
) -> Option<Node<'a, 'input>> {
    permission_faults(doc).find_map(|fault| child_element(fault, Some(VIM25_NS), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unqualified_lookup_skips_namespaced_elements() {
        let doc = Document::parse(r#"<root xmlns:a="urn:a"><a:detail/><detail/></root>"#)
            .expect("parse");
        let found = child_element(doc.root_element(), None, "detail").expect("detail");
        assert_eq!(found.tag_name().namespace(), None);
    }

    #[test]
    fn root_must_be_a_soap_envelope() {
        let doc = Document::parse(
            r#"<Envelope><Body><Fault><detail/></Fault></Body></Envelope>"#,
        )
        .expect("parse");
        assert_eq!(fault_details(&doc).count(), 0);
    }

    #[test]
    fn every_detail_element_is_visited() {
        let xml = format!(
            r#"<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}"><s:Body>
                 <s:Fault><detail/></s:Fault>
                 <s:Fault><detail/><detail/></s:Fault>
               </s:Body></s:Envelope>"#
        );
        let doc = Document::parse(&xml).expect("parse");
        assert_eq!(fault_details(&doc).count(), 3);
    }

    #[test]
    fn later_fault_supplies_missing_child() {
        let xml = format!(
            r#"<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}"><s:Body><s:Fault><detail>
                 <NoPermissionFault xmlns="urn:vim25"/>
                 <NoPermissionFault xmlns="urn:vim25"><privilegeId>System.View</privilegeId></NoPermissionFault>
               </detail></s:Fault></s:Body></s:Envelope>"#
        );
        let doc = Document::parse(&xml).expect("parse");
        assert_eq!(permission_faults(&doc).count(), 2);
        let privilege = permission_fault_child(&doc, "privilegeId").expect("privilegeId");
        assert_eq!(privilege.text(), Some("System.View"));
    }
}
