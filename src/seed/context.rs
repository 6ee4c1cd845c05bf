//! Template context building
//!
//! Builds the context for seed template rendering from a deployment.

use minijinja::value::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::network::{indent_block, render_interfaces};
use crate::DeployError;
use crate::deployment::DeploymentSpec;

/// Deterministic instance id for a deployment
///
/// Derived from node and VM name so re-rendering the same deployment yields
/// the same id, while a VM re-created under another name is a new instance
/// to cloud-init.
pub fn instance_id(spec: &DeploymentSpec) -> String {
    let key = format!("{}/{}", spec.node, spec.name);
    format!("iid-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

/// Build the template context from a deployment
pub fn build_context(spec: &DeploymentSpec) -> Result<HashMap<String, Value>, DeployError> {
    let cloud_init = &spec.cloud_init;
    let hostname = spec.hostname();
    if hostname.is_empty() {
        return Err(DeployError::TemplateRender(
            "missing required field 'hostname'".into(),
        ));
    }

    let mut ctx = HashMap::new();

    ctx.insert("instance_id".to_string(), Value::from(instance_id(spec)));
    ctx.insert("hostname".to_string(), Value::from(hostname));
    ctx.insert("fqdn".to_string(), Value::from(cloud_init.fqdn.clone()));
    ctx.insert("timezone".to_string(), Value::from(cloud_init.timezone.clone()));

    // Optional sections are always present (possibly none) so that strict
    // undefined handling only trips on genuinely unknown names
    ctx.insert("users".to_string(), Value::from_serialize(&cloud_init.users));
    ctx.insert("packages".to_string(), Value::from_serialize(&cloud_init.packages));
    ctx.insert("package_upgrade".to_string(), Value::from(cloud_init.package_upgrade));
    ctx.insert("puppet".to_string(), Value::from_serialize(&cloud_init.puppet));

    ctx.insert(
        "interface".to_string(),
        Value::from(cloud_init.network.interface.clone()),
    );
    let stanza = render_interfaces(&cloud_init.network)
        .map_err(|e| DeployError::TemplateRender(e.to_string()))?;
    ctx.insert(
        "network_interfaces".to_string(),
        Value::from(indent_block(&stanza, 2)),
    );

    ctx.insert("serial_console".to_string(), Value::from(spec.serial_console));

    Ok(ctx)
}

/// Merge additional variables into context
pub fn merge_context(base: &mut HashMap<String, Value>, additional: HashMap<String, Value>) {
    for (key, value) in additional {
        base.insert(key, value);
    }
}
