use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use serde_json::Value;

use crate::core::FieldLocation;
use crate::http::{render_slots, url_slots, Body, Element, HttpRequest};

/// Where a single variant was mutated and with what.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzTarget {
    pub location: FieldLocation,
    /// Field name or path, e.g. `user.tags[1]`, `X-Auth`, `user/name#text`.
    pub field: String,
    pub payload: String,
}

/// One mutated copy of a baseline request.
#[derive(Debug, Clone)]
pub struct FuzzVariant {
    pub name: String,
    pub request: HttpRequest,
    pub target: FuzzTarget,
}

#[derive(Debug, Clone, PartialEq)]
enum PathStep {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum MarkupSlot {
    Text,
    Attribute(String),
}

/// A single mutable spot in the targeted field.
#[derive(Debug, Clone, PartialEq)]
enum Position {
    /// Leaf of a JSON body. If the last step is a marked key, the whole
    /// value under it is replaced and the marker dropped from the key.
    Json(Vec<PathStep>),
    /// Text or attribute of the element reached through child indices.
    Markup(Vec<usize>, MarkupSlot),
    /// `key=value` pair of a form-like raw body.
    FormPair(usize),
    Header(String),
    Param(String),
    /// n-th named url slot.
    UrlSlot(usize),
}

/// Lazily yields `<prefix>str<i>_model<j>` variants: payload `i` applied at
/// position `j`, payloads in the outer loop, positions in pre-order inside.
///
/// Every variant is a deep copy of the baseline with exactly one position
/// changed. The iterator is finite and cannot be restarted.
pub struct FuzzVariants {
    base: HttpRequest,
    location: FieldLocation,
    marker: String,
    prefix: String,
    payloads: Vec<String>,
    positions: Vec<(Position, String)>,
    payload_index: usize,
    position_index: usize,
}

/// Builds the variant sequence for `location` of `base`.
///
/// `marker` is the template context's fuzz marker token: keys carrying it
/// are targeted as a whole and come out with the marker stripped.
pub fn generate(
    base: &HttpRequest,
    location: FieldLocation,
    payloads: &[String],
    marker: &str,
    prefix: &str,
) -> FuzzVariants {
    FuzzVariants {
        positions: positions(base, location, marker),
        base: base.clone(),
        location,
        marker: marker.to_string(),
        prefix: prefix.to_string(),
        payloads: payloads.to_vec(),
        payload_index: 0,
        position_index: 0,
    }
}

impl FuzzVariants {
    /// Number of mutable positions found in the target field.
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Field labels in generation order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.positions.iter().map(|(_, label)| label.as_str())
    }
}

impl Iterator for FuzzVariants {
    type Item = FuzzVariant;

    fn next(&mut self) -> Option<FuzzVariant> {
        if self.positions.is_empty() || self.payload_index >= self.payloads.len() {
            return None;
        }

        let payload = &self.payloads[self.payload_index];
        let (position, label) = &self.positions[self.position_index];

        let mut request = self.base.clone();
        apply(&mut request, position, payload, &self.marker);

        let variant = FuzzVariant {
            name: format!(
                "{}str{}_model{}",
                self.prefix,
                self.payload_index + 1,
                self.position_index + 1
            ),
            request,
            target: FuzzTarget {
                location: self.location,
                field: label.clone(),
                payload: payload.clone(),
            },
        };

        self.position_index += 1;
        if self.position_index == self.positions.len() {
            self.position_index = 0;
            self.payload_index += 1;
        }

        Some(variant)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.positions.is_empty() {
            0
        } else {
            (self.payloads.len().saturating_sub(self.payload_index)) * self.positions.len()
                - self.position_index
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FuzzVariants {}

fn positions(req: &HttpRequest, location: FieldLocation, marker: &str) -> Vec<(Position, String)> {
    let mut out = Vec::new();
    match location {
        FieldLocation::Body => match &req.body {
            Body::Structured(value) => json_positions(value, &mut Vec::new(), marker, &mut out),
            Body::Markup(element) => markup_positions(element, &mut Vec::new(), "", &mut out),
            Body::Raw(raw) => form_positions(raw, marker, &mut out),
        },
        FieldLocation::Header => {
            for key in req.headers.keys() {
                out.push((Position::Header(key.clone()), key.replace(marker, "")));
            }
        }
        FieldLocation::Param => {
            for key in req.params.keys() {
                out.push((Position::Param(key.clone()), key.replace(marker, "")));
            }
        }
        FieldLocation::Url => {
            let named = url_slots(&req.url).into_iter().filter(|s| s.default.is_some());
            for (index, slot) in named.enumerate() {
                out.push((Position::UrlSlot(index), slot.name));
            }
        }
    }
    out
}

fn is_marked(key: &str, marker: &str) -> bool {
    !marker.is_empty() && key.contains(marker)
}

fn json_label(path: &[PathStep], marker: &str) -> String {
    let mut label = String::new();
    for step in path {
        match step {
            PathStep::Key(key) => {
                if !label.is_empty() {
                    label.push('.');
                }
                label.push_str(&key.replace(marker, ""));
            }
            PathStep::Index(index) => label.push_str(&format!("[{}]", index)),
        }
    }
    label
}

/// Pre-order walk over a JSON tree. Objects are descended into; list
/// elements are positions in their own right unless they are objects.
fn json_positions(
    value: &Value,
    path: &mut Vec<PathStep>,
    marker: &str,
    out: &mut Vec<(Position, String)>,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathStep::Key(key.clone()));
                if is_marked(key, marker) {
                    out.push((Position::Json(path.clone()), json_label(path, marker)));
                } else {
                    json_positions(child, path, marker, out);
                }
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                path.push(PathStep::Index(index));
                if item.is_object() {
                    json_positions(item, path, marker, out);
                } else {
                    out.push((Position::Json(path.clone()), json_label(path, marker)));
                }
                path.pop();
            }
        }
        _ => out.push((Position::Json(path.clone()), json_label(path, marker))),
    }
}

fn markup_positions(
    element: &Element,
    path: &mut Vec<usize>,
    parent_label: &str,
    out: &mut Vec<(Position, String)>,
) {
    let label = if parent_label.is_empty() {
        element.tag.clone()
    } else {
        format!("{}/{}", parent_label, element.tag)
    };
    out.push((
        Position::Markup(path.clone(), MarkupSlot::Text),
        format!("{}#text", label),
    ));
    for name in element.attributes.keys() {
        out.push((
            Position::Markup(path.clone(), MarkupSlot::Attribute(name.clone())),
            format!("{}@{}", label, name),
        ));
    }
    for (index, child) in element.children.iter().enumerate() {
        path.push(index);
        markup_positions(child, path, &label, out);
        path.pop();
    }
}

fn form_positions(raw: &str, marker: &str, out: &mut Vec<(Position, String)>) {
    if raw.is_empty() {
        return;
    }
    for (index, pair) in raw.split('&').enumerate() {
        if let Some((key, _)) = pair.split_once('=') {
            if !key.is_empty() {
                out.push((Position::FormPair(index), key.replace(marker, "")));
            }
        }
    }
}

fn apply(req: &mut HttpRequest, position: &Position, payload: &str, marker: &str) {
    match position {
        Position::Json(path) => {
            if let Body::Structured(value) = &mut req.body {
                mutate_json(value, path, payload, marker);
            }
        }
        Position::Markup(path, slot) => {
            if let Body::Markup(root) = &mut req.body {
                mutate_markup(root, path, slot, payload, marker);
            }
        }
        Position::FormPair(index) => {
            if let Body::Raw(raw) = &mut req.body {
                *raw = mutate_form_pair(raw, *index, payload, marker);
            }
        }
        Position::Header(key) => {
            replace_entry(&mut req.headers, key, key.replace(marker, ""), payload.to_string());
        }
        Position::Param(key) => {
            replace_entry(&mut req.params, key, key.replace(marker, ""), payload.to_string());
        }
        Position::UrlSlot(index) => {
            req.url = render_slots(&req.url, Some((*index, payload)));
        }
    }
}

/// Swaps the entry under `key` for `(new_key, value)` in place.
fn replace_entry(map: &mut IndexMap<String, String>, key: &str, new_key: String, value: String) {
    if new_key == key {
        if let Some(slot) = map.get_mut(key) {
            *slot = value;
        }
        return;
    }
    *map = std::mem::take(map)
        .into_iter()
        .map(|(k, v)| if k == key { (new_key.clone(), value.clone()) } else { (k, v) })
        .collect();
}

fn json_child<'a>(value: &'a mut Value, step: &PathStep) -> Option<&'a mut Value> {
    match step {
        PathStep::Key(key) => value.get_mut(key.as_str()),
        PathStep::Index(index) => value.get_mut(*index),
    }
}

fn mutate_json(root: &mut Value, path: &[PathStep], payload: &str, marker: &str) {
    let Some((last, parents)) = path.split_last() else {
        *root = Value::String(payload.to_string());
        return;
    };

    let mut current = root;
    for step in parents {
        match json_child(current, step) {
            Some(next) => current = next,
            None => return,
        }
    }

    match last {
        PathStep::Key(key) if is_marked(key, marker) => {
            if let Value::Object(map) = current {
                let stripped = key.replace(marker, "");
                *map = std::mem::take(map)
                    .into_iter()
                    .map(|(k, v)| {
                        if &k == key {
                            (stripped.clone(), Value::String(payload.to_string()))
                        } else {
                            (k, v)
                        }
                    })
                    .collect();
            }
        }
        step => {
            if let Some(target) = json_child(current, step) {
                *target = Value::String(payload.to_string());
            }
        }
    }
}

fn mutate_markup(root: &mut Element, path: &[usize], slot: &MarkupSlot, payload: &str, marker: &str) {
    let mut current = root;
    for &index in path {
        match current.children.get_mut(index) {
            Some(child) => current = child,
            None => return,
        }
    }
    match slot {
        MarkupSlot::Text => current.text = Some(payload.to_string()),
        MarkupSlot::Attribute(name) => replace_entry(
            &mut current.attributes,
            name,
            name.replace(marker, ""),
            payload.to_string(),
        ),
    }
}

fn mutate_form_pair(raw: &str, target: usize, payload: &str, marker: &str) -> String {
    raw.split('&')
        .enumerate()
        .map(|(index, pair)| match pair.split_once('=') {
            Some((key, _)) if index == target => format!(
                "{}={}",
                key.replace(marker, ""),
                utf8_percent_encode(payload, NON_ALPHANUMERIC)
            ),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{self, ExtensionRegistry, TemplateContext};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;

    const MARK: &str = "FUZZMARK0000000000000001";

    fn payloads(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn json_request(body: Value) -> HttpRequest {
        let mut req = HttpRequest::new(Method::POST, "http://test.com/api");
        req.headers.insert("Content-Type".to_string(), "application/json".to_string());
        req.body = Body::Structured(body);
        req
    }

    #[test]
    fn test_body_variants_are_n_times_m_and_differ_in_one_place() {
        let base = json_request(json!({
            "user": {"name": "john", "age": 25},
            "active": true,
            "tags": ["a", "b"]
        }));
        let pays = payloads(&["' OR 1=1", "<script>", "../../etc/passwd"]);

        let variants: Vec<FuzzVariant> =
            generate(&base, FieldLocation::Body, &pays, MARK, "").collect();

        // name, age, active, tags[0], tags[1]
        assert_eq!(variants.len(), 5 * 3);

        for (i, a) in variants.iter().enumerate() {
            assert_ne!(a.request, base);
            assert_eq!(a.request.headers, base.headers);
            assert_eq!(a.request.url, base.url);
            for b in &variants[i + 1..] {
                assert_ne!(a.request, b.request);
            }
        }

        let Body::Structured(first) = &variants[0].request.body else {
            panic!("body variant changed");
        };
        assert_eq!(first["user"]["name"], "' OR 1=1");
        assert_eq!(first["user"]["age"], 25);
        assert_eq!(first["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_names_follow_payload_then_position_order() {
        let base = json_request(json!({"a": 1, "b": 2}));
        let names: Vec<String> = generate(&base, FieldLocation::Body, &payloads(&["x", "y"]), MARK, "t_")
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["t_str1_model1", "t_str1_model2", "t_str2_model1", "t_str2_model2"]);
    }

    #[test]
    fn test_list_elements_and_nested_objects() {
        let base = json_request(json!({"users": [{"name": "alice"}, "bob", [1, 2]]}));
        let variants = generate(&base, FieldLocation::Body, &payloads(&["P"]), MARK, "");
        let fields: Vec<String> = variants.fields().map(str::to_string).collect();
        assert_eq!(fields, vec!["users[0].name", "users[1]", "users[2]"]);

        let all: Vec<FuzzVariant> = variants.collect();
        let Body::Structured(third) = &all[2].request.body else {
            panic!("body variant changed");
        };
        assert_eq!(third, &json!({"users": [{"name": "alice"}, "bob", "P"]}));
    }

    #[test]
    fn test_marked_key_is_replaced_whole_and_unmarked() {
        let key = format!("{}filter", MARK);
        let mut body = serde_json::Map::new();
        body.insert("id".to_string(), json!(1));
        body.insert(key, json!({"deep": "x"}));
        let base = json_request(Value::Object(body));

        let variants: Vec<FuzzVariant> =
            generate(&base, FieldLocation::Body, &payloads(&["P"]), MARK, "").collect();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[1].target.field, "filter");

        let Body::Structured(Value::Object(map)) = &variants[1].request.body else {
            panic!("body variant changed");
        };
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["id", "filter"]);
        assert_eq!(map["filter"], "P");
    }

    #[test]
    fn test_baseline_untouched() {
        let base = json_request(json!({"a": "1"}));
        let snapshot = base.clone();
        let _ = generate(&base, FieldLocation::Body, &payloads(&["x"]), MARK, "").count();
        assert_eq!(base, snapshot);
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        let base = HttpRequest::new(Method::GET, "http://test.com/");
        let mut variants = generate(&base, FieldLocation::Body, &payloads(&["x", "y"]), MARK, "");
        assert_eq!(variants.len(), 0);
        assert!(variants.next().is_none());
    }

    #[test]
    fn test_url_slots_scenario() {
        let ctx = TemplateContext::new(Arc::new(ExtensionRegistry::with_builtins()));
        let base = template::parse(
            "GET /v1/{id:123} HTTP/1.1\nAccept: application/json\n\n",
            "http://test.com",
            &ctx,
        )
        .unwrap();
        assert_eq!(base.url, "http://test.com/v1/{id:123}");

        let variants: Vec<FuzzVariant> = generate(
            &base,
            FieldLocation::Url,
            &payloads(&["' OR 1=1", "<script>"]),
            ctx.marker(),
            "",
        )
        .collect();

        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].name, "str1_model1");
        assert_eq!(variants[1].name, "str2_model1");
        assert_eq!(variants[0].request.url, "http://test.com/v1/' OR 1=1");
        assert_eq!(variants[1].request.url, "http://test.com/v1/<script>");
        for v in &variants {
            assert_eq!(v.request.headers, base.headers);
            assert_eq!(v.request.body, base.body);
            assert_eq!(v.target.field, "id");
        }
    }

    #[test]
    fn test_url_renders_other_slots_and_skips_unnamed() {
        let base = HttpRequest::new(Method::GET, "http://t/{a:1}/{b}/{c:2}");
        let urls: Vec<String> = generate(&base, FieldLocation::Url, &payloads(&["P"]), MARK, "")
            .map(|v| v.request.url)
            .collect();
        assert_eq!(urls, vec!["http://t/P/{b}/2", "http://t/1/{b}/P"]);
    }

    #[test]
    fn test_header_and_param_targets() {
        let mut base = HttpRequest::new(Method::GET, "http://t/a");
        base.headers.insert("Accept".to_string(), "*/*".to_string());
        base.headers.insert(format!("X-{}Token", MARK), "abc".to_string());
        base.params.insert("q".to_string(), "1".to_string());

        let headers: Vec<FuzzVariant> =
            generate(&base, FieldLocation::Header, &payloads(&["P"]), MARK, "").collect();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].request.headers.get("Accept").map(String::as_str), Some("P"));
        assert_eq!(headers[0].request.params, base.params);
        let second: Vec<(&str, &str)> = headers[1]
            .request
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(second, vec![("Accept", "*/*"), ("X-Token", "P")]);

        let params: Vec<FuzzVariant> =
            generate(&base, FieldLocation::Param, &payloads(&["P"]), MARK, "").collect();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].request.params.get("q").map(String::as_str), Some("P"));
        assert_eq!(params[0].request.headers, base.headers);
    }

    #[test]
    fn test_markup_walk() {
        let root = Element::parse(r#"<user id="7"><name>bob</name></user>"#).unwrap();
        let mut base = HttpRequest::new(Method::POST, "http://t/a");
        base.body = Body::Markup(root);

        let variants = generate(&base, FieldLocation::Body, &payloads(&["P"]), MARK, "");
        let fields: Vec<String> = variants.fields().map(str::to_string).collect();
        assert_eq!(fields, vec!["user#text", "user@id", "user/name#text"]);

        let all: Vec<FuzzVariant> = variants.collect();
        let Body::Markup(third) = &all[2].request.body else {
            panic!("body variant changed");
        };
        assert_eq!(third.children[0].text.as_deref(), Some("P"));
        assert_eq!(third.attributes.get("id").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_form_body_pairs() {
        let mut base = HttpRequest::new(Method::POST, "http://t/login");
        base.body = Body::Raw("username=admin&password=secret".to_string());

        let bodies: Vec<Body> = generate(&base, FieldLocation::Body, &payloads(&["a b'"]), MARK, "")
            .map(|v| v.request.body)
            .collect();
        assert_eq!(
            bodies,
            vec![
                Body::Raw("username=a%20b%27&password=secret".to_string()),
                Body::Raw("username=admin&password=a%20b%27".to_string()),
            ]
        );
    }

    #[test]
    fn test_size_hint_counts_down() {
        let base = json_request(json!({"a": 1, "b": 2}));
        let mut variants = generate(&base, FieldLocation::Body, &payloads(&["x", "y"]), MARK, "");
        assert_eq!(variants.len(), 4);
        variants.next();
        assert_eq!(variants.len(), 3);
        variants.next();
        variants.next();
        assert_eq!(variants.len(), 1);
    }
}
