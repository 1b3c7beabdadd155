use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::api::ElementError;

/// Fixed allowance added to every serialized document when estimating request sizes.
pub const DOCUMENT_OVERHEAD_BYTES: usize = 32;

const VERTEX_RESERVED: &[&str] = &["id", "label"];
const EDGE_RESERVED: &[&str] = &[
    "id",
    "label",
    "_isEdge",
    "_vertexId",
    "_vertexLabel",
    "_sink",
    "_sinkLabel",
    "_sinkPartition",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::Boolean(b) => Value::Bool(*b),
            ScalarValue::Integer(i) => Value::from(*i),
            ScalarValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ScalarValue::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::String(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Integer(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Integer(value.into())
    }
}

impl From<u32> for ScalarValue {
    fn from(value: u32) -> Self {
        ScalarValue::Integer(value.into())
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: String,
    pub label: String,
    /// Repeated values for the same name make a multi-value property.
    pub properties: BTreeMap<String, Vec<ScalarValue>>,
}

impl Vertex {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Vertex {
            id: id.into(),
            label: label.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<ScalarValue>) {
        self.properties
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    pub fn property(&self, name: &str) -> Option<&[ScalarValue]> {
        self.properties.get(name).map(Vec::as_slice)
    }
}

/// An edge is stored alongside its source ("out") vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub label: String,
    pub out_vertex_id: String,
    pub in_vertex_id: String,
    pub out_vertex_label: String,
    pub in_vertex_label: String,
    pub out_vertex_partition_key: Option<ScalarValue>,
    pub in_vertex_partition_key: Option<ScalarValue>,
    pub properties: BTreeMap<String, ScalarValue>,
}

impl Edge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        out_vertex_id: impl Into<String>,
        in_vertex_id: impl Into<String>,
        out_vertex_label: impl Into<String>,
        in_vertex_label: impl Into<String>,
        out_vertex_partition_key: impl Into<ScalarValue>,
        in_vertex_partition_key: impl Into<ScalarValue>,
    ) -> Self {
        Edge {
            id: id.into(),
            label: label.into(),
            out_vertex_id: out_vertex_id.into(),
            in_vertex_id: in_vertex_id.into(),
            out_vertex_label: out_vertex_label.into(),
            in_vertex_label: in_vertex_label.into(),
            out_vertex_partition_key: Some(out_vertex_partition_key.into()),
            in_vertex_partition_key: Some(in_vertex_partition_key.into()),
            properties: BTreeMap::new(),
        }
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<ScalarValue>) {
        self.properties.insert(name.into(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphElement {
    Vertex(Vertex),
    Edge(Edge),
}

impl From<Vertex> for GraphElement {
    fn from(vertex: Vertex) -> Self {
        GraphElement::Vertex(vertex)
    }
}

impl From<Edge> for GraphElement {
    fn from(edge: Edge) -> Self {
        GraphElement::Edge(edge)
    }
}

impl GraphElement {
    pub fn id(&self) -> &str {
        match self {
            GraphElement::Vertex(v) => &v.id,
            GraphElement::Edge(e) => &e.id,
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            GraphElement::Vertex(v) => v.id = id,
            GraphElement::Edge(e) => e.id = id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GraphElement::Vertex(_) => "vertex",
            GraphElement::Edge(_) => "edge",
        }
    }

    /// The value this element is partitioned by. Edges use their source vertex's value.
    pub fn partition_key(&self, partition_key_path: &str) -> Result<&ScalarValue, ElementError> {
        let value = match self {
            GraphElement::Vertex(v) => match v.property(partition_key_path) {
                None | Some([]) => {
                    return Err(ElementError::InvalidPartitionKey(format!(
                        "vertex has no value for partition key property '{partition_key_path}'"
                    )))
                }
                Some([value]) => value,
                Some(_) => {
                    return Err(ElementError::InvalidPartitionKey(format!(
                        "partition key property '{partition_key_path}' has multiple values"
                    )))
                }
            },
            GraphElement::Edge(e) => e.out_vertex_partition_key.as_ref().ok_or_else(|| {
                ElementError::InvalidPartitionKey(
                    "edge has no source vertex partition key".to_string(),
                )
            })?,
        };

        if let ScalarValue::Float(f) = value {
            if !f.is_finite() {
                return Err(ElementError::InvalidPartitionKey(format!(
                    "unsupported partition key value {f}"
                )));
            }
        }

        Ok(value)
    }

    /// Render the JSON document the backing store persists for this element.
    pub fn to_document(&self, partition_key_path: &str) -> Result<Value, ElementError> {
        let partition_key = self.partition_key(partition_key_path)?.to_json();
        let mut doc = Map::new();

        match self {
            GraphElement::Vertex(v) => {
                check_reserved(v.properties.keys(), VERTEX_RESERVED)?;
                doc.insert("id".into(), Value::String(v.id.clone()));
                doc.insert("label".into(), Value::String(v.label.clone()));
                doc.insert(partition_key_path.to_string(), partition_key);
                for (name, values) in &v.properties {
                    if name == partition_key_path {
                        continue;
                    }
                    let values = values
                        .iter()
                        .map(|value| json!({ "_value": value.to_json() }))
                        .collect();
                    doc.insert(name.clone(), Value::Array(values));
                }
            }
            GraphElement::Edge(e) => {
                check_reserved(e.properties.keys(), EDGE_RESERVED)?;
                doc.insert("id".into(), Value::String(e.id.clone()));
                doc.insert("label".into(), Value::String(e.label.clone()));
                doc.insert("_isEdge".into(), Value::Bool(true));
                doc.insert("_vertexId".into(), Value::String(e.out_vertex_id.clone()));
                doc.insert(
                    "_vertexLabel".into(),
                    Value::String(e.out_vertex_label.clone()),
                );
                doc.insert("_sink".into(), Value::String(e.in_vertex_id.clone()));
                doc.insert("_sinkLabel".into(), Value::String(e.in_vertex_label.clone()));
                doc.insert(
                    "_sinkPartition".into(),
                    e.in_vertex_partition_key
                        .as_ref()
                        .map_or(Value::Null, ScalarValue::to_json),
                );
                doc.insert(partition_key_path.to_string(), partition_key);
                for (name, value) in &e.properties {
                    if name == partition_key_path {
                        continue;
                    }
                    doc.insert(name.clone(), value.to_json());
                }
            }
        }

        Ok(Value::Object(doc))
    }
}

fn check_reserved<'a>(
    mut names: impl Iterator<Item = &'a String>,
    reserved: &[&str],
) -> Result<(), ElementError> {
    match names.find(|name| reserved.contains(&name.as_str())) {
        Some(name) => Err(ElementError::MalformedElement(format!(
            "property name '{name}' is reserved"
        ))),
        None => Ok(()),
    }
}

/// A graph element serialized for the backing store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub sequence: u64,
    pub id: String,
    pub partition_key: ScalarValue,
    pub body: Bytes,
    pub element: GraphElement,
}

impl Document {
    /// Serializes the element. On failure the element is handed back with the cause.
    pub fn new(
        sequence: u64,
        element: GraphElement,
        partition_key_path: &str,
    ) -> Result<Document, (GraphElement, ElementError)> {
        let rendered = element
            .to_document(partition_key_path)
            .and_then(|doc| {
                serde_json::to_vec(&doc)
                    .map_err(|e| ElementError::MalformedElement(e.to_string()))
            });
        let body = match rendered {
            Ok(body) => body,
            Err(cause) => return Err((element, cause)),
        };
        // to_document already validated the key
        let partition_key = match element.partition_key(partition_key_path).cloned() {
            Ok(value) => value,
            Err(cause) => return Err((element, cause)),
        };

        Ok(Document {
            sequence,
            id: element.id().to_string(),
            partition_key,
            body: Bytes::from(body),
            element,
        })
    }

    pub fn estimated_size(&self) -> usize {
        self.body.len() + DOCUMENT_OVERHEAD_BYTES
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vertex(id: &str, pk: i64) -> Vertex {
        let mut v = Vertex::new(id, "person");
        v.add_property("pk", pk);
        v
    }

    #[test]
    fn vertex_partition_key_is_the_named_property() {
        let element = GraphElement::from(vertex("1", 7));
        assert_eq!(element.partition_key("pk"), Ok(&ScalarValue::Integer(7)));
    }

    #[test]
    fn missing_or_repeated_partition_key_is_invalid() {
        let element = GraphElement::from(Vertex::new("1", "person"));
        assert!(matches!(
            element.partition_key("pk"),
            Err(ElementError::InvalidPartitionKey(_))
        ));

        let mut v = vertex("1", 7);
        v.add_property("pk", 8);
        assert!(matches!(
            GraphElement::from(v).partition_key("pk"),
            Err(ElementError::InvalidPartitionKey(_))
        ));

        let mut v = Vertex::new("1", "person");
        v.add_property("pk", f64::NAN);
        assert!(matches!(
            GraphElement::from(v).partition_key("pk"),
            Err(ElementError::InvalidPartitionKey(_))
        ));
    }

    #[test]
    fn vertex_document_layout() {
        let mut v = vertex("1", 7);
        v.add_property("name", "ada");
        v.add_property("name", "lovelace");
        let doc = GraphElement::from(v).to_document("pk").unwrap();

        assert_eq!(
            doc,
            json!({
                "id": "1",
                "label": "person",
                "pk": 7,
                "name": [{"_value": "ada"}, {"_value": "lovelace"}],
            })
        );
    }

    #[test]
    fn edge_document_layout() {
        let mut e = Edge::new("e0", "knows", "0", "1", "vertex", "vertex", 0, 1);
        e.add_property("duration", 0);
        let doc = GraphElement::from(e).to_document("pk").unwrap();

        assert_eq!(
            doc,
            json!({
                "id": "e0",
                "label": "knows",
                "_isEdge": true,
                "_vertexId": "0",
                "_vertexLabel": "vertex",
                "_sink": "1",
                "_sinkLabel": "vertex",
                "_sinkPartition": 1,
                "pk": 0,
                "duration": 0,
            })
        );
    }

    #[test]
    fn reserved_property_names_are_malformed() {
        let mut v = vertex("1", 7);
        v.add_property("label", "oops");
        assert!(matches!(
            GraphElement::from(v).to_document("pk"),
            Err(ElementError::MalformedElement(_))
        ));
    }

    #[test]
    fn document_hands_back_element_on_failure() {
        let element = GraphElement::from(Vertex::new("1", "person"));
        let (returned, cause) = Document::new(3, element.clone(), "pk").unwrap_err();
        assert_eq!(returned, element);
        assert!(matches!(cause, ElementError::InvalidPartitionKey(_)));

        let doc = Document::new(3, vertex("1", 7).into(), "pk").unwrap();
        assert_eq!(doc.sequence, 3);
        assert_eq!(doc.id, "1");
        assert_eq!(doc.estimated_size(), doc.body.len() + DOCUMENT_OVERHEAD_BYTES);
    }
}
