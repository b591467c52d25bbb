//! Default-parameter / overlay merging.

use chorus_types::ParamMap;
use serde_json::Value;

/// Overlay caller parameters onto a provider's defaults.
///
/// Nested objects merge key by key so that setting one field of a
/// sub-object (e.g. `generationConfig.temperature`) keeps its sibling
/// defaults. Arrays and scalars are replaced wholesale, and a `null` in the
/// overlay removes the key.
pub fn merge_parameters(defaults: &ParamMap, overlay: &ParamMap) -> ParamMap {
    let mut merged = defaults.clone();
    merge_into(&mut merged, overlay);
    merged
}

fn merge_into(target: &mut ParamMap, overlay: &ParamMap) {
    for (key, value) in overlay {
        if value.is_null() {
            target.remove(key);
            continue;
        }
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (target.get_mut(key), value)
        {
            merge_into(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}
