//! Typed INDI property model
//!
//! Properties are cached by the client as they are defined and updated on the wire.
//! Callers receive clones, mutate element values locally and hand them back to
//! [`crate::IndiClient::send_new_property`].

use serde::{Deserialize, Serialize};

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyKind {
    /// Kind from an XML tag such as `defNumberVector` or `setSwitchVector`
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag.contains("Switch") {
            Some(PropertyKind::Switch)
        } else if tag.contains("Number") {
            Some(PropertyKind::Number)
        } else if tag.contains("Text") {
            Some(PropertyKind::Text)
        } else if tag.contains("Light") {
            Some(PropertyKind::Light)
        } else if tag.contains("BLOB") {
            Some(PropertyKind::Blob)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::Text => "Text",
            PropertyKind::Number => "Number",
            PropertyKind::Switch => "Switch",
            PropertyKind::Light => "Light",
            PropertyKind::Blob => "BLOB",
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Ok" => PropertyState::Ok,
            "Busy" => PropertyState::Busy,
            "Alert" => PropertyState::Alert,
            _ => PropertyState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "OK",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permission {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ro" => Permission::ReadOnly,
            "wo" => Permission::WriteOnly,
            _ => Permission::ReadWrite,
        }
    }
}

/// Switch vector rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

impl SwitchRule {
    pub fn parse(s: &str) -> Self {
        match s {
            "AtMostOne" => SwitchRule::AtMostOne,
            "AnyOfMany" => SwitchRule::AnyOfMany,
            _ => SwitchRule::OneOfMany,
        }
    }
}

/// Value held by a single element
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Text(String),
    Number {
        value: f64,
        min: f64,
        max: f64,
        step: f64,
        format: String,
    },
    Switch(bool),
    Light(PropertyState),
    Blob {
        format: String,
        size: usize,
    },
}

impl ElementValue {
    /// Empty value for an element of the given kind
    pub fn empty(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Text => ElementValue::Text(String::new()),
            PropertyKind::Number => ElementValue::Number {
                value: 0.0,
                min: 0.0,
                max: 0.0,
                step: 0.0,
                format: "%g".to_string(),
            },
            PropertyKind::Switch => ElementValue::Switch(false),
            PropertyKind::Light => ElementValue::Light(PropertyState::Idle),
            PropertyKind::Blob => ElementValue::Blob {
                format: String::new(),
                size: 0,
            },
        }
    }

    /// Apply the text content of a `one*`/`def*` element
    pub fn apply_text(&mut self, text: &str) {
        match self {
            ElementValue::Text(v) => *v = text.to_string(),
            ElementValue::Number { value, .. } => {
                if let Some(v) = crate::protocol::parse_number(text) {
                    *value = v;
                }
            }
            ElementValue::Switch(on) => *on = text.trim().eq_ignore_ascii_case("on"),
            ElementValue::Light(state) => *state = PropertyState::parse(text.trim()),
            ElementValue::Blob { .. } => {}
        }
    }
}

/// One element of a property vector
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub label: String,
    pub value: ElementValue,
}

/// An INDI property vector
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub kind: PropertyKind,
    pub state: PropertyState,
    pub perm: Permission,
    pub rule: Option<SwitchRule>,
    pub timeout: f64,
    pub elements: Vec<Element>,
}

impl Property {
    pub fn new(device: &str, name: &str, kind: PropertyKind) -> Self {
        Self {
            device: device.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            group: String::new(),
            kind,
            state: PropertyState::Idle,
            perm: Permission::ReadWrite,
            rule: if kind == PropertyKind::Switch {
                Some(SwitchRule::OneOfMany)
            } else {
                None
            },
            timeout: 0.0,
            elements: Vec::new(),
        }
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    /// Add an element, or replace the value of an existing one
    pub fn upsert_element(&mut self, element: Element) {
        match self.element_mut(&element.name) {
            Some(existing) => *existing = element,
            None => self.elements.push(element),
        }
    }

    pub fn number(&self, element: &str) -> Option<f64> {
        match self.element(element).map(|e| &e.value) {
            Some(ElementValue::Number { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn switch(&self, element: &str) -> Option<bool> {
        match self.element(element).map(|e| &e.value) {
            Some(ElementValue::Switch(on)) => Some(*on),
            _ => None,
        }
    }

    pub fn text(&self, element: &str) -> Option<&str> {
        match self.element(element).map(|e| &e.value) {
            Some(ElementValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn light(&self, element: &str) -> Option<PropertyState> {
        match self.element(element).map(|e| &e.value) {
            Some(ElementValue::Light(state)) => Some(*state),
            _ => None,
        }
    }

    /// Turn every switch element off
    pub fn reset_switches(&mut self) {
        for element in &mut self.elements {
            if let ElementValue::Switch(on) = &mut element.value {
                *on = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch_property() -> Property {
        let mut prop = Property::new("Telescope Simulator", "TELESCOPE_PARK", PropertyKind::Switch);
        for (name, on) in [("PARK", true), ("UNPARK", false)] {
            prop.upsert_element(Element {
                name: name.to_string(),
                label: name.to_string(),
                value: ElementValue::Switch(on),
            });
        }
        prop
    }

    #[test]
    fn test_switch_access_and_reset() {
        let mut prop = switch_property();
        assert_eq!(prop.switch("PARK"), Some(true));
        assert_eq!(prop.rule, Some(SwitchRule::OneOfMany));
        prop.reset_switches();
        assert_eq!(prop.switch("PARK"), Some(false));
        assert_eq!(prop.number("PARK"), None);
    }

    #[test]
    fn test_apply_text() {
        let mut value = ElementValue::empty(PropertyKind::Number);
        value.apply_text("5:30");
        assert!(matches!(value, ElementValue::Number { value, .. } if (value - 5.5).abs() < 1e-9));

        let mut value = ElementValue::empty(PropertyKind::Switch);
        value.apply_text(" On ");
        assert_eq!(value, ElementValue::Switch(true));

        let mut value = ElementValue::empty(PropertyKind::Light);
        value.apply_text("Alert");
        assert_eq!(value, ElementValue::Light(PropertyState::Alert));
    }

    #[test]
    fn test_kind_from_tag() {
        assert_eq!(PropertyKind::from_tag("defNumberVector"), Some(PropertyKind::Number));
        assert_eq!(PropertyKind::from_tag("setBLOBVector"), Some(PropertyKind::Blob));
        assert_eq!(PropertyKind::from_tag("message"), None);
    }
}
