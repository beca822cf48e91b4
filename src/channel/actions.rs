//! The `play/gather/redirect/hangup` action union parsed out of an IVR
//! action-script XML response, plus the XML parser itself.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionName {
    Play,
    Gather,
    Redirect,
    Hangup,
}

impl ActionName {
    fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "play" => Some(Self::Play),
            "gather" => Some(Self::Gather),
            "redirect" => Some(Self::Redirect),
            "hangup" => Some(Self::Hangup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedAction {
    pub name: Option<ActionName>,
    pub data: String,
    pub attributes: HashMap<String, String>,
}

impl ParsedAction {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attr(key).and_then(|v| v.parse().ok())
    }
}

/// Parse a `<Response>...</Response>` document into its ordered list of
/// top-level actions. Robust to either self-closing (`<Gather .../>`)
/// or container (`<Play>...</Play>`) element forms.
pub fn parse_actions(xml: &str) -> Result<Vec<ParsedAction>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut actions = Vec::new();
    let mut current: Option<ParsedAction> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if let Some(name) = ActionName::parse(&tag) {
                    let mut action = ParsedAction { name: Some(name), ..Default::default() };
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr
                            .decode_and_unescape_value(&reader)
                            .map(|c| c.to_string())
                            .unwrap_or_default();
                        action.attributes.insert(key, value);
                    }
                    current = Some(action);
                }
            }
            Ok(Event::Empty(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if let Some(name) = ActionName::parse(&tag) {
                    let mut action = ParsedAction { name: Some(name), ..Default::default() };
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr
                            .decode_and_unescape_value(&reader)
                            .map(|c| c.to_string())
                            .unwrap_or_default();
                        action.attributes.insert(key, value);
                    }
                    actions.push(action);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(action) = current.as_mut() {
                    action.data = t.unescape().map(|c| c.to_string()).unwrap_or_default();
                }
            }
            Ok(Event::End(_)) => {
                if let Some(action) = current.take() {
                    actions.push(action);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OrchestratorError::Parse { reason: e.to_string() }),
            _ => {}
        }
        buf.clear();
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_and_gather() {
        let xml = r#"<Response><Play timeout="5">custom/x/answer</Play><Gather input="speech dtmf" action="http://x/action/gather" timeout="5" numDigits="4"/></Response>"#;
        let actions = parse_actions(xml).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, Some(ActionName::Play));
        assert_eq!(actions[0].data, "custom/x/answer");
        assert_eq!(actions[0].attr_u64("timeout"), Some(5));
        assert_eq!(actions[1].name, Some(ActionName::Gather));
        assert_eq!(actions[1].attr("action"), Some("http://x/action/gather"));
        assert_eq!(actions[1].attr_u64("numDigits"), Some(4));
    }

    #[test]
    fn parses_redirect_and_hangup() {
        let xml = r#"<Response><Redirect>http://x/action/next</Redirect></Response>"#;
        let actions = parse_actions(xml).unwrap();
        assert_eq!(actions[0].name, Some(ActionName::Redirect));
        assert_eq!(actions[0].data, "http://x/action/next");

        let xml = r#"<Response><Hangup/></Response>"#;
        let actions = parse_actions(xml).unwrap();
        assert_eq!(actions[0].name, Some(ActionName::Hangup));
    }
}
