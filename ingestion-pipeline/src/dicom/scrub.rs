use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use common::error::AppError;
use serde_json::{Map, Number, Value as JsonValue};

use super::{tags, DataSet, DicomHeader, Element, Value, Vr};

/// Copy of `dataset` with every binary value, LUT data and the VOI LUT
/// sequence nulled, at any nesting depth.
pub fn scrub(dataset: &DataSet) -> DataSet {
    let mut scrubbed = DataSet::new();
    for (tag, element) in dataset.iter() {
        let value = if *tag == tags::VOI_LUT_SEQUENCE || *tag == tags::LUT_DATA {
            Value::Null
        } else {
            match &element.value {
                Value::Binary(_) => Value::Null,
                Value::Sequence(items) => Value::Sequence(items.iter().map(scrub).collect()),
                other => other.clone(),
            }
        };
        scrubbed.insert(
            *tag,
            Element {
                vr: element.vr,
                value,
            },
        );
    }
    scrubbed
}

/// The scrubbed data set as a DICOM JSON document.
pub fn metadata_document(header: &DicomHeader) -> Result<Bytes, AppError> {
    let json = to_json(&scrub(&header.dataset));
    Ok(Bytes::from(serde_json::to_vec(&json)?))
}

/// DICOM JSON model of a data set.
pub fn to_json(dataset: &DataSet) -> JsonValue {
    let object: Map<String, JsonValue> = dataset
        .iter()
        .map(|(tag, element)| (tag.json_key(), element_json(element)))
        .collect();
    JsonValue::Object(object)
}

fn element_json(element: &Element) -> JsonValue {
    let vr = element.vr;
    let mut object = Map::new();
    object.insert("vr".into(), JsonValue::from(vr.as_str()));

    match &element.value {
        // Nulled binaries keep their VR; anything else nulled disappears whole.
        Value::Null if vr.is_binary() => {
            object.insert("InlineBinary".into(), JsonValue::Null);
        }
        Value::Null => return JsonValue::Null,
        Value::Binary(bytes) => {
            object.insert("InlineBinary".into(), JsonValue::from(STANDARD.encode(bytes)));
        }
        Value::Text(values) if !values.is_empty() => {
            let values = values.iter().map(|value| text_json(vr, value)).collect();
            object.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Int(values) if !values.is_empty() => {
            object.insert("Value".into(), values.iter().copied().map(JsonValue::from).collect());
        }
        Value::Float(values) if !values.is_empty() => {
            let values = values
                .iter()
                .map(|value| Number::from_f64(*value).map_or(JsonValue::Null, JsonValue::Number))
                .collect();
            object.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Tags(values) if !values.is_empty() => {
            let values = values.iter().map(|tag| JsonValue::from(tag.json_key())).collect();
            object.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Sequence(items) if !items.is_empty() => {
            object.insert("Value".into(), items.iter().map(to_json).collect());
        }
        _ => {}
    }
    JsonValue::Object(object)
}

fn text_json(vr: Vr, value: &str) -> JsonValue {
    match vr {
        Vr::PN => {
            let mut name = Map::new();
            name.insert("Alphabetic".into(), JsonValue::from(value));
            JsonValue::Object(name)
        }
        Vr::IS => value
            .parse::<i64>()
            .map_or_else(|_| JsonValue::from(value), JsonValue::from),
        Vr::DS => value
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or_else(|| JsonValue::from(value), JsonValue::Number),
        _ => JsonValue::from(value),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dicom::{
        parse_header,
        testing::{sample_image, DicomBuilder},
        Tag,
    };

    fn element(vr: Vr, value: Value) -> Element {
        Element { vr, value }
    }

    /// Whether any pixel data element in `json` still carries content.
    fn has_pixel_content(json: &JsonValue) -> bool {
        match json {
            JsonValue::Object(map) => map.iter().any(|(key, value)| {
                let pixel = key == &Tag::PIXEL_DATA.json_key()
                    && (value.get("InlineBinary").is_some_and(|b| !b.is_null())
                        || value.get("Value").is_some());
                pixel || has_pixel_content(value)
            }),
            JsonValue::Array(items) => items.iter().any(has_pixel_content),
            _ => false,
        }
    }

    #[test]
    fn nulls_pixel_data_and_lookup_tables_at_any_depth() {
        let mut icon = DataSet::new();
        icon.insert(Tag(0x0028, 0x0010), element(Vr::US, Value::Int(vec![64])));
        icon.insert(Tag::PIXEL_DATA, element(Vr::OB, Value::Binary(vec![1, 2, 3])));

        let mut dataset = DataSet::new();
        dataset.insert(tags::PATIENT_ID, element(Vr::LO, Value::Text(vec!["Covid10".into()])));
        dataset.insert(Tag(0x0088, 0x0200), element(Vr::SQ, Value::Sequence(vec![icon])));
        dataset.insert(
            tags::VOI_LUT_SEQUENCE,
            element(Vr::SQ, Value::Sequence(vec![DataSet::new()])),
        );
        dataset.insert(Tag::PIXEL_DATA, element(Vr::OW, Value::Binary(vec![9; 32])));
        let original = dataset.clone();

        let json = to_json(&scrub(&dataset));
        assert_eq!(dataset, original);
        assert!(!has_pixel_content(&json));
        assert!(has_pixel_content(&to_json(&dataset)));
        assert_eq!(json["7FE00010"], json!({"vr": "OW", "InlineBinary": null}));
        assert_eq!(json["00283010"], JsonValue::Null);
        assert_eq!(json["00100020"], json!({"vr": "LO", "Value": ["Covid10"]}));
        assert_eq!(
            json["00880200"]["Value"][0]["7FE00010"],
            json!({"vr": "OB", "InlineBinary": null})
        );
        assert_eq!(json["00880200"]["Value"][0]["00280010"]["Value"], json!([64]));
    }

    #[test]
    fn metadata_document_of_a_parsed_image_is_clean() {
        for implicit in [false, true] {
            let header = parse_header(&sample_image("Covid10", implicit, 256))
                .expect("parse")
                .header;
            let document = metadata_document(&header).expect("document");
            let json: JsonValue = serde_json::from_slice(&document).expect("json");

            assert!(!has_pixel_content(&json));
            assert_eq!(json["00283010"], JsonValue::Null);
            assert_eq!(json["00100010"]["Value"][0]["Alphabetic"], json!("Doe^Jane"));
            assert_eq!(json["00080060"]["Value"], json!(["DX"]));
            // The private blob is binary, so it is nulled too.
            assert_eq!(json["00091010"]["InlineBinary"], JsonValue::Null);
            assert!(json.get("00020010").is_none());
        }
    }

    #[test]
    fn implicit_files_keep_every_ordinary_attribute() {
        for implicit in [false, true] {
            let builder = || {
                if implicit {
                    DicomBuilder::implicit()
                } else {
                    DicomBuilder::explicit()
                }
            };
            let reference = builder()
                .text(Tag(0x0008, 0x1150), b"UI", "1.2.840.10008.5.1.4.1.1.1")
                .text(Tag(0x0008, 0x1155), b"UI", "1.2.3.9");
            let file = builder()
                .text(Tag(0x0008, 0x0005), b"CS", "ISO_IR 100")
                .sequence(Tag(0x0008, 0x1140), vec![reference], false)
                .text(tags::PATIENT_ID, b"LO", "Covid10")
                .text(Tag(0x0018, 0x5101), b"CS", "PA")
                .text(Tag(0x0028, 0x0008), b"IS", "1")
                .raw(tags::LUT_DATA, b"US", vec![1, 0, 2, 0])
                .pixel_data(16)
                .file();

            let header = parse_header(&file).expect("parse").header;
            let document = metadata_document(&header).expect("document");
            let json: JsonValue = serde_json::from_slice(&document).expect("json");

            assert_eq!(json["00080005"]["Value"], json!(["ISO_IR 100"]), "implicit={implicit}");
            assert_eq!(json["00185101"], json!({"vr": "CS", "Value": ["PA"]}), "implicit={implicit}");
            assert_eq!(json["00280008"]["Value"], json!([1]), "implicit={implicit}");
            assert_eq!(
                json["00081140"]["Value"][0]["00081155"]["Value"],
                json!(["1.2.3.9"]),
                "implicit={implicit}"
            );
            assert!(json["00283006"].get("Value").is_none(), "implicit={implicit}");
            assert!(!has_pixel_content(&json));
        }
    }

    #[test]
    fn numeric_strings_become_numbers() {
        assert_eq!(text_json(Vr::IS, "12"), json!(12));
        assert_eq!(text_json(Vr::DS, "0.5"), json!(0.5));
        assert_eq!(text_json(Vr::DS, "n/a"), json!("n/a"));
        assert_eq!(text_json(Vr::CS, "12"), json!("12"));
    }
}
