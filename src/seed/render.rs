//! Jinja2-compatible rendering of the NoCloud seed files

use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::DeployError;

/// Built-in `meta-data` template
pub const META_DATA_TEMPLATE: &str = include_str!("templates/meta-data.j2");

/// Built-in `user-data` template
pub const USER_DATA_TEMPLATE: &str = include_str!("templates/user-data.j2");

/// Quote a value as a YAML double-quoted scalar
fn quote(value: String) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Render one seed file
///
/// Undefined variables are errors, so a template asking for a field the
/// deployment does not provide fails instead of emitting an empty value.
pub fn render_seed_file(
    name: &str,
    template: &str,
    context: &HashMap<String, Value>,
) -> Result<String, DeployError> {
    debug!("Rendering seed file {}", name);

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.add_filter("quote", quote);

    env.add_template(name, template)
        .map_err(|e| DeployError::TemplateRender(format!("{} template parse error: {}", name, e)))?;

    let tmpl = env
        .get_template(name)
        .map_err(|e| DeployError::TemplateRender(format!("{} template error: {}", name, e)))?;

    tmpl.render(context)
        .map_err(|e| DeployError::TemplateRender(format!("{} render error: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::tests::sample_spec;
    use crate::deployment::{Addressing, PuppetHandoff, UserSpec};
    use crate::seed::context::build_context;

    #[test]
    fn test_render_meta_data() {
        let ctx = build_context(&sample_spec()).unwrap();
        let rendered = render_seed_file("meta-data", META_DATA_TEMPLATE, &ctx).unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["local-hostname"].as_str(), Some("web01"));
        assert!(parsed["instance-id"].as_str().unwrap().starts_with("iid-"));
        assert_eq!(
            parsed["network-interfaces"].as_str(),
            Some("auto eth0\niface eth0 inet dhcp\n")
        );
    }

    #[test]
    fn test_render_user_data_minimal() {
        let ctx = build_context(&sample_spec()).unwrap();
        let rendered = render_seed_file("user-data", USER_DATA_TEMPLATE, &ctx).unwrap();

        assert!(rendered.starts_with("#cloud-config\n"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["hostname"].as_str(), Some("web01"));
        assert!(parsed.get("users").is_none());
        assert!(parsed.get("puppet").is_none());
    }

    #[test]
    fn test_render_user_data_full() {
        let mut spec = sample_spec();
        spec.cloud_init.fqdn = Some("web01.example.com".to_string());
        spec.cloud_init.timezone = Some("Europe/Amsterdam".to_string());
        spec.cloud_init.packages = vec!["nginx".to_string()];
        spec.cloud_init.users = vec![UserSpec {
            name: "deploy".to_string(),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAAC3Nz deploy@laptop".to_string()],
            sudo: true,
            password_hash: Some("$6$salt$hash".to_string()),
            shell: "/bin/zsh".to_string(),
            groups: vec!["adm".to_string(), "docker".to_string()],
        }];
        spec.cloud_init.puppet = Some(PuppetHandoff {
            server: "puppet.example.com".to_string(),
            environment: Some("production".to_string()),
            certname: None,
        });

        let ctx = build_context(&spec).unwrap();
        let rendered = render_seed_file("user-data", USER_DATA_TEMPLATE, &ctx).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(parsed["fqdn"].as_str(), Some("web01.example.com"));
        assert_eq!(parsed["timezone"].as_str(), Some("Europe/Amsterdam"));
        assert_eq!(parsed["packages"][0].as_str(), Some("nginx"));

        let user = &parsed["users"][1];
        assert_eq!(user["name"].as_str(), Some("deploy"));
        assert_eq!(user["shell"].as_str(), Some("/bin/zsh"));
        assert_eq!(user["groups"].as_str(), Some("adm, docker"));
        assert_eq!(user["passwd"].as_str(), Some("$6$salt$hash"));
        assert_eq!(
            user["ssh_authorized_keys"][0].as_str(),
            Some("ssh-ed25519 AAAAC3Nz deploy@laptop")
        );

        let agent = &parsed["puppet"]["conf"]["agent"];
        assert_eq!(agent["server"].as_str(), Some("puppet.example.com"));
        assert_eq!(agent["environment"].as_str(), Some("production"));
        assert!(agent.get("certname").is_none());
    }

    #[test]
    fn test_render_static_network() {
        let mut spec = sample_spec();
        spec.cloud_init.network.addressing = Addressing::Static {
            address: "10.0.0.5/16".to_string(),
            gateway: Some("10.0.0.1".to_string()),
            nameservers: vec![],
            search: vec![],
        };

        let ctx = build_context(&spec).unwrap();
        let rendered = render_seed_file("meta-data", META_DATA_TEMPLATE, &ctx).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        let stanza = parsed["network-interfaces"].as_str().unwrap();

        assert!(stanza.contains("iface eth0 inet static"));
        assert!(stanza.contains("netmask 255.255.0.0"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let ctx = build_context(&sample_spec()).unwrap();
        let first = render_seed_file("user-data", USER_DATA_TEMPLATE, &ctx).unwrap();
        let second = render_seed_file("user-data", USER_DATA_TEMPLATE, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_undefined_variable_fails() {
        let ctx = build_context(&sample_spec()).unwrap();
        let result = render_seed_file("user-data", "hostname: {{ missing_var }}", &ctx);
        assert!(matches!(result, Err(DeployError::TemplateRender(_))));
    }

    #[test]
    fn test_render_invalid_syntax() {
        let ctx = build_context(&sample_spec()).unwrap();
        let result = render_seed_file("user-data", "value: {{ invalid", &ctx);
        assert!(matches!(result, Err(DeployError::TemplateRender(_))));
    }
}
