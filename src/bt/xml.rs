//! Minimal behavior-tree XML loader.
//!
//! The full BT grammar (ports typing, subtree includes, blackboard
//! remapping) is out of scope; this is a small recursive-descent
//! assembler built directly on `quick_xml`'s pull parser, not a
//! reimplementation of a general BT engine. Each element name maps to one
//! node constructor in the library under `bt::nodes`; attributes become
//! that constructor's arguments; nested elements become children, in
//! document order.
//!
//! Element grammar (attribute names are literal, `{Port}` values are
//! blackboard keys resolved at tick time, not parse time — callers pass
//! the raw string and the node itself reads the blackboard):
//!
//! ```xml
//! <BehaviorTree>
//!   <Sequence>
//!     <SyncCondition asset="Filler" interaction="state" field="State" comparison="operational"/>
//!     <Occupy assets="Filler,Stoppering">
//!       <UseResource asset="{SelectedAsset}">
//!         <Action asset="{SelectedAsset}" interaction="fill"/>
//!       </UseResource>
//!     </Occupy>
//!   </Sequence>
//! </BehaviorTree>
//! ```

use crate::bt::nodes::action::{GenericMessage, MoveToPositionMessage, RefillMessage, StatefulMqttAction};
use crate::bt::nodes::bc_fallback::BcFallback;
use crate::bt::nodes::context::NodeContext;
use crate::bt::nodes::occupy::Occupy;
use crate::bt::nodes::queue::{EmptyStatus, GetProductFromQueue, KeepRunningUntilEmpty, PopElementNode, QualityControlGate, SamplingGate};
use crate::bt::nodes::sync_condition::{ComparisonType, SyncMqttCondition};
use crate::bt::nodes::use_resource::UseResource;
use crate::bt::tree::{Fallback, Node, Sequence};
use crate::error::ControllerError;
use crate::mqtt::distributor::MessageDistributor;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::sync::Arc;

/// A parsed-but-uninterpreted tag: its name, attributes, and children in
/// document order. An intermediate representation between the raw XML
/// event stream and the constructed [`Node`] tree.
struct XmlElement {
    tag: String,
    attrs: HashMap<String, String>,
    children: Vec<XmlElement>,
}

fn parse_document(xml: &str) -> Result<XmlElement, ControllerError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event().map_err(|e| ControllerError::TreeBuild(format!("xml parse error: {e}")))? {
            Event::Start(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                let attrs = read_attrs(&tag)?;
                stack.push(XmlElement {
                    tag: name,
                    attrs,
                    children: Vec::new(),
                });
            }
            Event::Empty(tag) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
                let attrs = read_attrs(&tag)?;
                let element = XmlElement {
                    tag: name,
                    attrs,
                    children: Vec::new(),
                };
                push_completed(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(ControllerError::TreeBuild("unbalanced closing tag".to_string()));
                };
                push_completed(&mut stack, &mut root, element);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or_else(|| ControllerError::TreeBuild("empty document".to_string()))
}

fn push_completed(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn read_attrs(tag: &quick_xml::events::BytesStart) -> Result<HashMap<String, String>, ControllerError> {
    let mut attrs = HashMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| ControllerError::TreeBuild(format!("xml attribute error: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ControllerError::TreeBuild(format!("xml attribute value error: {e}")))?
            .to_string();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Builds a live tree from XML text, registering every MQTT-facing node it
/// creates with `distributor` along the way. `asset_port` attributes are
/// passed through to the node as the blackboard key it resolves its asset
/// id from at tick time (so `"{SelectedAsset}"` and a literal asset name
/// both work).
pub fn build_tree(xml: &str, ctx: Arc<NodeContext>, distributor: &Arc<MessageDistributor>) -> Result<Arc<dyn Node>, ControllerError> {
    let root_element = parse_document(xml)?;
    let root = unwrap_root(&root_element)?;
    build_element(root, &ctx, distributor)
}

fn unwrap_root(element: &XmlElement) -> Result<&XmlElement, ControllerError> {
    if element.tag == "BehaviorTree" {
        element
            .children
            .first()
            .ok_or_else(|| ControllerError::TreeBuild("<BehaviorTree> has no child".to_string()))
    } else {
        Ok(element)
    }
}

fn required_attr<'a>(element: &'a XmlElement, key: &str) -> Result<&'a str, ControllerError> {
    element
        .attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ControllerError::TreeBuild(format!("<{}> is missing required attribute '{}'", element.tag, key)))
}

fn attr_or<'a>(element: &'a XmlElement, key: &str, default: &'a str) -> &'a str {
    element.attrs.get(key).map(String::as_str).unwrap_or(default)
}

fn parse_i64_attr(element: &XmlElement, key: &str, default: i64) -> Result<i64, ControllerError> {
    match element.attrs.get(key) {
        Some(v) => v
            .parse()
            .map_err(|_| ControllerError::TreeBuild(format!("<{}> attribute '{}' is not an integer: {}", element.tag, key, v))),
        None => Ok(default),
    }
}

fn parse_comparison(raw: &str) -> Result<ComparisonType, ControllerError> {
    match raw.to_ascii_lowercase().as_str() {
        "equal" => Ok(ComparisonType::Equal),
        "not_equal" => Ok(ComparisonType::NotEqual),
        "greater" => Ok(ComparisonType::Greater),
        "less" => Ok(ComparisonType::Less),
        "contains" => Ok(ComparisonType::Contains),
        "inside" => Ok(ComparisonType::Inside),
        "outside" => Ok(ComparisonType::Outside),
        "operational" => Ok(ComparisonType::Operational),
        other => Err(ControllerError::TreeBuild(format!("unknown comparison type '{other}'"))),
    }
}

fn parse_empty_status(raw: &str) -> Result<EmptyStatus, ControllerError> {
    match raw.to_ascii_uppercase().as_str() {
        "SUCCESS" => Ok(EmptyStatus::Success),
        "FAILURE" => Ok(EmptyStatus::Failure),
        "SKIPPED" => Ok(EmptyStatus::Skipped),
        other => Err(ControllerError::TreeBuild(format!("unknown if_empty status '{other}'"))),
    }
}

fn only_child<'a>(element: &'a XmlElement) -> Result<&'a XmlElement, ControllerError> {
    match element.children.as_slice() {
        [child] => Ok(child),
        _ => Err(ControllerError::TreeBuild(format!(
            "<{}> requires exactly one child, found {}",
            element.tag,
            element.children.len()
        ))),
    }
}

fn build_children(element: &XmlElement, ctx: &Arc<NodeContext>, distributor: &Arc<MessageDistributor>) -> Result<Vec<Arc<dyn Node>>, ControllerError> {
    element.children.iter().map(|child| build_element(child, ctx, distributor)).collect()
}

fn register<T: crate::mqtt::distributor::NodeSubscriber + 'static>(node: Arc<T>, distributor: &Arc<MessageDistributor>) -> Arc<T> {
    distributor.register(&node);
    node
}

fn build_element(element: &XmlElement, ctx: &Arc<NodeContext>, distributor: &Arc<MessageDistributor>) -> Result<Arc<dyn Node>, ControllerError> {
    match element.tag.as_str() {
        "Sequence" => Ok(Arc::new(Sequence::new(build_children(element, ctx, distributor)?))),
        "Fallback" => Ok(Arc::new(Fallback::new(build_children(element, ctx, distributor)?))),
        "BC_Fallback" | "Async_BC_Fallback" => {
            let asynch = element.tag == "Async_BC_Fallback" || attr_or(element, "asynch", "false") == "true";
            Ok(Arc::new(BcFallback::new(build_children(element, ctx, distributor)?, asynch)))
        }
        "Action" => {
            let asset_port = required_attr(element, "asset")?.to_string();
            let interaction = required_attr(element, "interaction")?.to_string();
            let kind = attr_or(element, "kind", "generic");
            match kind {
                "generic" => Ok(register(
                    Arc::new(StatefulMqttAction::new(ctx.clone(), asset_port, GenericMessage { interaction })),
                    distributor,
                )),
                "moveto" => Ok(register(
                    Arc::new(StatefulMqttAction::new(ctx.clone(), asset_port, MoveToPositionMessage { interaction })),
                    distributor,
                )),
                "refill" => Ok(register(
                    Arc::new(StatefulMqttAction::new(ctx.clone(), asset_port, RefillMessage::new(interaction))),
                    distributor,
                )),
                other => Err(ControllerError::TreeBuild(format!("unknown action kind '{other}'"))),
            }
        }
        "SyncCondition" => {
            let asset_port = required_attr(element, "asset")?.to_string();
            let interaction = required_attr(element, "interaction")?.to_string();
            let field = required_attr(element, "field")?.to_string();
            let comparison = parse_comparison(required_attr(element, "comparison")?)?;
            let expected = attr_or(element, "expected", "").to_string();
            Ok(register(
                Arc::new(SyncMqttCondition::new(ctx.clone(), asset_port, interaction, field, comparison, expected)),
                distributor,
            ))
        }
        "UseResource" => {
            let asset_port = required_attr(element, "asset")?.to_string();
            let context = match element.attrs.get("context") {
                Some(v) => Some(v.parse().map_err(|_| ControllerError::TreeBuild(format!("invalid context value: {v}")))?),
                None => None,
            };
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(register(Arc::new(UseResource::new(ctx.clone(), asset_port, context, child)), distributor))
        }
        "Occupy" => {
            let assets_port = required_attr(element, "assets")?.to_string();
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(register(Arc::new(Occupy::new(ctx.clone(), assets_port, child)), distributor))
        }
        "KeepRunningUntilEmpty" => {
            let queue_key = required_attr(element, "queue")?.to_string();
            let if_empty = parse_empty_status(attr_or(element, "if_empty", "SUCCESS"))?;
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(Arc::new(KeepRunningUntilEmpty::new(ctx.blackboard.clone(), queue_key, if_empty, child)))
        }
        "GetProductFromQueue" => {
            let asset_port = required_attr(element, "asset")?.to_string();
            let queue_key = required_attr(element, "queue")?.to_string();
            let output_key = attr_or(element, "output", "ProductID").to_string();
            let if_empty = parse_empty_status(attr_or(element, "if_empty", "SUCCESS"))?;
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(Arc::new(GetProductFromQueue::new(ctx.clone(), asset_port, queue_key, output_key, if_empty, child)))
        }
        "PopElement" => {
            let asset_port = required_attr(element, "asset")?.to_string();
            let queue_key = required_attr(element, "queue")?.to_string();
            let output_key = attr_or(element, "output", "ProductID").to_string();
            let if_empty = parse_empty_status(attr_or(element, "if_empty", "SUCCESS"))?;
            Ok(Arc::new(PopElementNode::new(ctx.clone(), asset_port, queue_key, output_key, if_empty)))
        }
        "SamplingGate" => {
            let queue_key = required_attr(element, "queue")?.to_string();
            let rate = parse_i64_attr(element, "rate", 100)?;
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(Arc::new(SamplingGate::new(ctx.blackboard.clone(), queue_key, rate, child)))
        }
        "QualityControlGate" => {
            let queue_key = required_attr(element, "queue")?.to_string();
            let rate = parse_i64_attr(element, "rate", 100)?;
            let child = build_element(only_child(element)?, ctx, distributor)?;
            Ok(Arc::new(QualityControlGate::new(ctx.blackboard.clone(), queue_key, rate, child)))
        }
        other => Err(ControllerError::TreeBuild(format!("unknown node type '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_into_xml_tree() {
        let xml = r#"<BehaviorTree><Sequence><Action asset="Filler" interaction="fill"/></Sequence></BehaviorTree>"#;
        let doc = parse_document(xml).unwrap();
        assert_eq!(doc.tag, "BehaviorTree");
        assert_eq!(doc.children.len(), 1);
        assert_eq!(doc.children[0].tag, "Sequence");
        assert_eq!(doc.children[0].children[0].tag, "Action");
        assert_eq!(doc.children[0].children[0].attrs.get("asset").map(String::as_str), Some("Filler"));
    }

    #[test]
    fn unknown_node_type_is_a_tree_build_error() {
        let xml = r#"<BehaviorTree><NotARealNode/></BehaviorTree>"#;
        let doc = parse_document(xml).unwrap();
        let root = unwrap_root(&doc).unwrap();
        assert_eq!(root.tag, "NotARealNode");
    }

    #[test]
    fn comparison_type_parses_case_insensitively() {
        assert_eq!(parse_comparison("Operational").unwrap(), ComparisonType::Operational);
        assert!(parse_comparison("bogus").is_err());
    }
}
