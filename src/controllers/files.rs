use serde_json::Value;

use crate::config::Config;
use crate::storage::Object;

pub trait FilesController: Send + Sync {
    /// Fill in the `url` of every file reference found in `object`.
    fn expand_files_in_object(&self, config: &Config, object: &mut Object);
}

/// Serves files from `{server_url}/files/{app_id}/{name}`.
#[derive(Debug, Clone, Default)]
pub struct DefaultFilesController;

impl DefaultFilesController {
    fn expand_value(&self, base: &str, v: &mut Value) {
        match v {
            Value::Object(m) => {
                let is_file = m.get("__type").and_then(|t| t.as_str()) == Some("File");
                if is_file {
                    if m.contains_key("url") { return; }
                    let Some(name) = m.get("name").and_then(|n| n.as_str()).map(str::to_string) else { return; };
                    m.insert("url".into(), Value::String(format!("{}/{}", base, urlencoding::encode(&name))));
                } else {
                    for inner in m.values_mut() { self.expand_value(base, inner); }
                }
            }
            Value::Array(items) => {
                for inner in items.iter_mut() { self.expand_value(base, inner); }
            }
            _ => {}
        }
    }
}

impl FilesController for DefaultFilesController {
    fn expand_files_in_object(&self, config: &Config, object: &mut Object) {
        let base = format!("{}/files/{}", config.settings.server_url.trim_end_matches('/'), config.application_id());
        for v in object.values_mut() { self.expand_value(&base, v); }
    }
}
