//! Roster query construction and item extraction (RFC 6121 section 2).

use minidom::Element;
use skua_core::{RosterItem, Subscription};

use crate::ns;

/// Build the initial roster `get` IQ.
pub fn build_roster_get(id: &str) -> Element {
    Element::builder("iq", ns::CLIENT)
        .attr("type", "get")
        .attr("id", id)
        .append(Element::bare("query", ns::ROSTER))
        .build()
}

/// Extract roster items from a `<query xmlns='jabber:iq:roster'/>` in
/// document order. Items without a jid are skipped.
pub fn parse_roster_items(query: &Element) -> Vec<RosterItem> {
    query
        .children()
        .filter(|child| child.is("item", ns::ROSTER))
        .filter_map(|item| {
            let jid = item.attr("jid")?.to_string();
            let subscription = item
                .attr("subscription")
                .unwrap_or("none")
                .parse()
                .unwrap_or(Subscription::None);
            let groups = item
                .children()
                .filter(|c| c.is("group", ns::ROSTER))
                .map(|g| g.text())
                .collect();

            Some(RosterItem {
                jid,
                name: item.attr("name").map(|n| n.to_string()),
                subscription,
                groups,
            })
        })
        .collect()
}

/// Acknowledge a roster push with an empty `result` IQ of matching id.
pub fn build_push_ack(push: &Element) -> Option<Element> {
    let id = push.attr("id")?;
    let mut ack = Element::builder("iq", ns::CLIENT)
        .attr("type", "result")
        .attr("id", id)
        .build();
    if let Some(from) = push.attr("from") {
        ack.set_attr("to", from);
    }
    Some(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_get_has_query_child() {
        let iq = build_roster_get("roster-1");
        assert_eq!(iq.attr("type"), Some("get"));
        assert_eq!(iq.attr("id"), Some("roster-1"));
        assert!(iq.get_child("query", ns::ROSTER).is_some());
    }

    #[test]
    fn parses_items_in_document_order() {
        let query: Element = "<query xmlns='jabber:iq:roster'>\
             <item jid='a@x' name='Alice' subscription='both'><group>Friends</group></item>\
             <item jid='b@x' subscription='to'/>\
             <item jid='c@x'/>\
             </query>"
            .parse()
            .expect("valid query");

        let items = parse_roster_items(&query);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].jid, "a@x");
        assert_eq!(items[0].name.as_deref(), Some("Alice"));
        assert_eq!(items[0].subscription, Subscription::Both);
        assert_eq!(items[0].groups, vec!["Friends".to_string()]);
        assert_eq!(items[1].subscription, Subscription::To);
        assert_eq!(items[2].subscription, Subscription::None);
    }

    #[test]
    fn item_without_jid_is_skipped() {
        let query: Element = "<query xmlns='jabber:iq:roster'><item name='ghost'/></query>"
            .parse()
            .expect("valid query");
        assert!(parse_roster_items(&query).is_empty());
    }

    #[test]
    fn push_ack_mirrors_id_and_sender() {
        let push: Element = "<iq xmlns='jabber:client' type='set' id='push7' \
             from='alice@example.com'>\
             <query xmlns='jabber:iq:roster'><item jid='b@x' subscription='remove'/></query>\
             </iq>"
            .parse()
            .expect("valid push");

        let ack = build_push_ack(&push).expect("ack built");
        assert_eq!(ack.attr("type"), Some("result"));
        assert_eq!(ack.attr("id"), Some("push7"));
        assert_eq!(ack.attr("to"), Some("alice@example.com"));
        assert_eq!(ack.children().count(), 0);
    }

    #[test]
    fn push_without_id_gets_no_ack() {
        let push: Element = "<iq xmlns='jabber:client' type='set'>\
             <query xmlns='jabber:iq:roster'/></iq>"
            .parse()
            .expect("valid push");
        assert!(build_push_ack(&push).is_none());
    }
}
