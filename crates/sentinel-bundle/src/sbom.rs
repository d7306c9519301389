//! SBOM generation.
//!
//! Produces a CycloneDX 1.5 document describing the listener, route,
//! upstream, and agent declarations of a bundle's configuration source.
//! Served with content type `application/vnd.cyclonedx+json`.

use serde_json::{Value, json};
use uuid::Uuid;

use sentinel_types::clock;

/// Content type for serialized SBOM documents.
pub const CONTENT_TYPE: &str = "application/vnd.cyclonedx+json";

const DECLARATION_KINDS: &[&str] = &["listener", "route", "upstream", "agent"];

/// Build the CycloneDX document for one bundle.
pub fn generate(bundle_id: Uuid, version: &str, config_source: &str) -> Value {
    let mut components = Vec::new();
    for kind in DECLARATION_KINDS {
        for name in crate::risk::declaration_names(config_source, kind) {
            components.push(json!({
                "type": "application",
                "name": name,
                "properties": [
                    { "name": "sentinel:kind", "value": kind }
                ]
            }));
        }
    }

    json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.5",
        "serialNumber": format!("urn:uuid:{bundle_id}"),
        "version": 1,
        "metadata": {
            "timestamp": clock::now().to_rfc3339(),
            "component": {
                "type": "application",
                "name": format!("bundle-{bundle_id}"),
                "version": version,
            }
        },
        "components": components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
listener "web" { port 8080 }
route "api" { upstream "backend" }
upstream "backend" { endpoint "10.0.0.1:80" }
agent "telemetry" { interval 30 }
"#;

    #[test]
    fn document_shape_is_cyclonedx_1_5() {
        let doc = generate(sentinel_types::new_id(), "1.2.0", SOURCE);
        assert_eq!(doc["bomFormat"], "CycloneDX");
        assert_eq!(doc["specVersion"], "1.5");
        assert_eq!(doc["metadata"]["component"]["version"], "1.2.0");
    }

    #[test]
    fn components_cover_all_declaration_kinds() {
        let doc = generate(sentinel_types::new_id(), "1.0.0", SOURCE);
        let components = doc["components"].as_array().expect("components");
        assert_eq!(components.len(), 4);
        let kinds: Vec<&str> = components
            .iter()
            .map(|c| c["properties"][0]["value"].as_str().expect("kind"))
            .collect();
        for kind in DECLARATION_KINDS {
            assert!(kinds.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn empty_source_yields_empty_components() {
        let doc = generate(sentinel_types::new_id(), "1.0.0", "");
        assert!(doc["components"].as_array().expect("components").is_empty());
    }

    #[test]
    fn serial_number_is_the_bundle_urn() {
        let id = sentinel_types::new_id();
        let doc = generate(id, "1.0.0", SOURCE);
        assert_eq!(doc["serialNumber"], format!("urn:uuid:{id}"));
    }
}
