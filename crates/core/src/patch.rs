//! JSON Patch (RFC 6902) documents that write a record into pod template annotations.

use serde_json::{json, Map, Value as Json};

use crate::{Record, TriggerError};

/// Escape one JSON Pointer reference token (RFC 6901). `~` goes first so the
/// `~1` produced for `/` is not escaped again.
pub fn escape_pointer_segment(seg: &str) -> String {
    seg.replace('~', "~0").replace('/', "~1")
}

/// Inverse of [`escape_pointer_segment`].
pub fn unescape_pointer_segment(seg: &str) -> String {
    seg.replace("~1", "/").replace("~0", "~")
}

/// Build the patch writing `rec` under `key` in the annotation map at `annotations_ptr`.
///
/// When the map does not exist yet (`annotations_present == false`) an `add` on
/// a child path would be rejected, so the whole map is created instead.
pub fn generate_patch(
    rec: &Record,
    key: &str,
    annotations_ptr: &str,
    annotations_present: bool,
) -> Result<Vec<u8>, TriggerError> {
    let val = rec.encode().map_err(TriggerError::PatchGeneration)?;
    let op = if annotations_present {
        json!({
            "op": "add",
            "path": format!("{}/{}", annotations_ptr, escape_pointer_segment(key)),
            "value": val,
        })
    } else {
        let mut annotations = Map::new();
        annotations.insert(key.to_string(), Json::String(val));
        json!({
            "op": "add",
            "path": annotations_ptr,
            "value": Json::Object(annotations),
        })
    };
    serde_json::to_vec(&Json::Array(vec![op])).map_err(TriggerError::PatchGeneration)
}
