//! Request serialization and file-attachment splicing.
//!
//! File-data objects do not embed their file content. Instead the object's
//! "file path" entry is replaced by a placeholder entry whose value is
//! [`FILE_CONTENT_MARKER`]; at send time the file bytes are spliced into the
//! serialized JSON in place of the marker.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::{IaCloudError, RequestBody};

/// Sentinel replaced by the attachment bytes in the serialized request.
pub const FILE_CONTENT_MARKER: &str = "__= file content__";

const FILE_PATH_NAME: &str = "file path";
const ENCODED_DATA_NAME: &str = "Encoded data";

/// Serializes `body`, splicing `attachment` at [`FILE_CONTENT_MARKER`].
///
/// When either the marker or the attachment is absent the plain JSON form is
/// returned.
pub fn serialize_request(
    body: &RequestBody,
    attachment: Option<&[u8]>,
) -> Result<Vec<u8>, IaCloudError> {
    let json = serde_json::to_string(body)?;
    match (attachment, json.split_once(FILE_CONTENT_MARKER)) {
        (Some(bytes), Some((head, tail))) => {
            let mut payload = Vec::with_capacity(head.len() + bytes.len() + tail.len());
            payload.extend_from_slice(head.as_bytes());
            payload.extend_from_slice(bytes);
            payload.extend_from_slice(tail.as_bytes());
            Ok(payload)
        }
        _ => Ok(json.into_bytes()),
    }
}

/// Returns `true` for an `iaCloudObject` whose content type is `Filedata`.
pub fn is_file_data(data_object: &Value) -> bool {
    data_object["objectType"] == "iaCloudObject"
        && data_object["objectContent"]["contentType"] == "Filedata"
}

/// Prepares a file-data object for sending.
///
/// Removes the "file path" entry from `objectContent.contentData`, appends the
/// placeholder entry, and returns the path whose content must be attached.
/// Returns `Ok(None)` for objects that are not file data.
pub fn detach_file_path(data_object: &mut Value) -> Result<Option<PathBuf>, IaCloudError> {
    if !is_file_data(data_object) {
        return Ok(None);
    }
    let entries = data_object
        .get_mut("objectContent")
        .and_then(|content| content.get_mut("contentData"))
        .and_then(Value::as_array_mut)
        .ok_or_else(|| IaCloudError::invalid("file data object has no contentData list"))?;

    let index = entries
        .iter()
        .position(|entry| entry["commonName"] == FILE_PATH_NAME)
        .ok_or_else(|| IaCloudError::invalid("no file path"))?;
    let entry = entries.remove(index);
    let path = entry["dataValue"]
        .as_str()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| IaCloudError::invalid("file path entry has no dataValue"))?
        .to_owned();

    entries.push(json!({
        "commonName": ENCODED_DATA_NAME,
        "dataValue": FILE_CONTENT_MARKER,
    }));
    Ok(Some(PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_object(entries: Value) -> Value {
        json!({
            "objectType": "iaCloudObject",
            "objectKey": "camera-1",
            "objectContent": {
                "contentType": "Filedata",
                "contentData": entries
            }
        })
    }

    #[test]
    fn splices_attachment_at_marker() {
        let mut body = RequestBody::new();
        body.insert("request".into(), "store".into());
        body.insert("data".into(), FILE_CONTENT_MARKER.into());

        let payload = serialize_request(&body, Some(b"QUJD")).unwrap();
        let sent: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(sent, json!({"request": "store", "data": "QUJD"}));
    }

    #[test]
    fn attachment_without_marker_is_ignored() {
        let mut body = RequestBody::new();
        body.insert("request".into(), "retrieve".into());
        let payload = serialize_request(&body, Some(b"ignored")).unwrap();
        assert_eq!(payload, br#"{"request":"retrieve"}"#);
    }

    #[test]
    fn detach_replaces_file_path_with_placeholder() {
        let mut object = file_object(json!([
            {"commonName": "file name", "dataValue": "a.png"},
            {"commonName": "file path", "dataValue": "/tmp/a.png"}
        ]));
        let path = detach_file_path(&mut object).unwrap();
        assert_eq!(path, Some(PathBuf::from("/tmp/a.png")));

        let entries = object["objectContent"]["contentData"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["commonName"], "Encoded data");
        assert_eq!(entries[1]["dataValue"], FILE_CONTENT_MARKER);
    }

    #[test]
    fn detach_without_file_path_is_a_precondition_failure() {
        let mut object = file_object(json!([{"commonName": "file name", "dataValue": "a.png"}]));
        let err = detach_file_path(&mut object).unwrap_err();
        assert!(matches!(err, IaCloudError::InvalidRequest { .. }));
    }

    #[test]
    fn plain_objects_are_left_alone() {
        let mut object = json!({"objectType": "iaCloudObject", "objectContent": {"contentType": "iaCloudData"}});
        let before = object.clone();
        assert_eq!(detach_file_path(&mut object).unwrap(), None);
        assert_eq!(object, before);
    }
}
