//! MTConnect agent document parsing (probe and current responses).

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Identity fields gathered from an MTConnect Devices or Streams document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MtconnectIdentity {
    pub root: String,
    pub sender: Option<String>,
    pub version: Option<String>,
    pub device_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

fn parse_attrs(e: &BytesStart) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in e.attributes().filter_map(Result::ok) {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        attrs.insert(key, value);
    }
    attrs
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

fn set_once(slot: &mut Option<String>, value: Option<&String>) {
    if slot.is_none() {
        if let Some(v) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
            *slot = Some(v.to_string());
        }
    }
}

/// Parse identity out of an MTConnect document. Returns `None` unless the
/// document parses and its root element name contains `MTConnect`.
pub fn parse_identity(xml: &str) -> Option<MtconnectIdentity> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut identity = MtconnectIdentity::default();
    let mut saw_root = false;
    // Name of the element whose text we are waiting for
    let mut capture: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(ref e)) | Ok(XmlEvent::Empty(ref e)) => {
                let tag = local_name(e);
                if !saw_root {
                    if !tag.contains("MTConnect") {
                        return None;
                    }
                    identity.root = tag.clone();
                    saw_root = true;
                }
                let attrs = parse_attrs(e);
                match tag.as_str() {
                    "Header" => {
                        set_once(&mut identity.sender, attrs.get("sender"));
                        set_once(&mut identity.version, attrs.get("version"));
                    }
                    "Device" | "DeviceStream" => {
                        set_once(&mut identity.device_name, attrs.get("name"));
                    }
                    "Description" => {
                        set_once(&mut identity.manufacturer, attrs.get("manufacturer"));
                        set_once(&mut identity.model, attrs.get("model"));
                        set_once(&mut identity.serial, attrs.get("serialNumber"));
                    }
                    "Manufacturer" | "Model" | "SerialNumber" => capture = Some(tag),
                    _ => {}
                }
            }
            Ok(XmlEvent::Text(t)) => {
                if let Some(tag) = capture.take() {
                    let text = t.unescape().map(|s| s.to_string()).ok();
                    match tag.as_str() {
                        "Manufacturer" => set_once(&mut identity.manufacturer, text.as_ref()),
                        "Model" => set_once(&mut identity.model, text.as_ref()),
                        "SerialNumber" => set_once(&mut identity.serial, text.as_ref()),
                        _ => {}
                    }
                }
            }
            Ok(XmlEvent::End(_)) => capture = None,
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    saw_root.then_some(identity)
}

const SECTIONS: [&str; 3] = ["Samples", "Events", "Condition"];

/// One observation element from a `current` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Element name, e.g. `Execution` or `RotaryVelocity`.
    pub tag: String,
    pub name: Option<String>,
    pub data_item_id: Option<String>,
    /// The `type` attribute, present on some agents, e.g. `EXECUTION`.
    pub data_type: Option<String>,
    pub sub_type: Option<String>,
    pub text: String,
}

/// Collect the observation elements inside `Samples`, `Events` and
/// `Condition` sections. Returns `None` for documents that are not MTConnect.
pub fn parse_current_items(xml: &str) -> Option<Vec<Observation>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut out = Vec::new();
    let mut saw_root = false;
    let mut section_depth = 0usize;
    let mut pending: Option<Observation> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(ref e)) => {
                let tag = local_name(e);
                if !saw_root {
                    if !tag.contains("MTConnect") {
                        return None;
                    }
                    saw_root = true;
                }
                if SECTIONS.contains(&tag.as_str()) {
                    section_depth += 1;
                } else if section_depth > 0 {
                    let mut attrs = parse_attrs(e);
                    pending = Some(Observation {
                        tag,
                        name: attrs.remove("name"),
                        data_item_id: attrs.remove("dataItemId"),
                        data_type: attrs.remove("type"),
                        sub_type: attrs.remove("subType"),
                        text: String::new(),
                    });
                }
            }
            Ok(XmlEvent::Text(t)) => {
                if let Some(mut obs) = pending.take() {
                    let Ok(text) = t.unescape() else {
                        continue;
                    };
                    obs.text = text.trim().to_string();
                    if !obs.text.is_empty() {
                        out.push(obs);
                    }
                }
            }
            Ok(XmlEvent::End(ref e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if SECTIONS.contains(&tag.as_str()) {
                    section_depth = section_depth.saturating_sub(1);
                }
                pending = None;
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    saw_root.then_some(out)
}

/// Flatten the observations of a `current` document into metric name →
/// value. Names come from the `name` attribute, falling back to
/// `dataItemId`; `UNAVAILABLE` observations are dropped and numeric text is
/// parsed as a number.
pub fn parse_current_observations(xml: &str) -> Option<BTreeMap<String, Value>> {
    let items = parse_current_items(xml)?;
    Some(
        items
            .into_iter()
            .filter(|obs| obs.text != "UNAVAILABLE")
            .filter_map(|obs| {
                let value = observation_value(&obs.text);
                obs.name.or(obs.data_item_id).map(|name| (name, value))
            })
            .collect(),
    )
}

pub fn observation_value(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::String(text.to_string()),
    }
}
