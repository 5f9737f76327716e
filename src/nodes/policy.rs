//! Platform-specific command policies for node invocations

use std::collections::HashSet;

use super::types::NodeSession;

/// Platform-specific default allowed commands
#[must_use]
pub fn platform_defaults(platform: &str) -> HashSet<&'static str> {
    let mut cmds: HashSet<&'static str> = [
        "device.info",
        "device.status",
        "canvas.present",
        "canvas.hide",
        "canvas.navigate",
        "canvas.eval",
        "canvas.snapshot",
    ]
    .into_iter()
    .collect();

    match platform {
        "darwin" | "linux" | "windows" => {
            cmds.extend(["system.run", "system.which", "system.notify", "browser.proxy"]);
        }
        "ios" | "android" => {
            cmds.extend([
                "camera.list",
                "camera.snap",
                "location.get",
                "contacts.search",
                "calendar.events",
                "photos.latest",
            ]);
        }
        _ => {}
    }

    cmds
}

/// Which commands the gateway lets through to a node
///
/// A command must be a platform default, declared by the node at handshake
/// and absent from the deny list.
#[derive(Debug, Clone, Default)]
pub struct NodeCommandPolicy {
    deny: HashSet<String>,
}

impl NodeCommandPolicy {
    #[must_use]
    pub fn new<I, S>(deny: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, node: &NodeSession, command: &str) -> bool {
        platform_defaults(&node.platform).contains(command)
            && node.commands.iter().any(|c| c == command)
            && !self.deny.contains(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientInfo;

    fn node(platform: &str, commands: &[&str]) -> NodeSession {
        NodeSession {
            node_id: "n1".to_string(),
            conn_id: "c1".to_string(),
            client: ClientInfo::default(),
            display_name: None,
            platform: platform.to_string(),
            version: "1.0.0".to_string(),
            device_family: None,
            model_identifier: None,
            remote_ip: None,
            caps: Vec::new(),
            commands: commands.iter().map(|c| (*c).to_string()).collect(),
            permissions: std::collections::HashMap::new(),
            path_env: None,
            connected_at_ms: 0,
        }
    }

    #[test]
    fn desktop_has_system_commands() {
        let cmds = platform_defaults("darwin");
        assert!(cmds.contains("system.run"));
        assert!(cmds.contains("browser.proxy"));
        assert!(!cmds.contains("camera.snap"));
    }

    #[test]
    fn mobile_has_device_commands() {
        let cmds = platform_defaults("ios");
        assert!(cmds.contains("camera.snap"));
        assert!(!cmds.contains("system.run"));
    }

    #[test]
    fn allowed_requires_platform_and_declaration() {
        let policy = NodeCommandPolicy::default();
        let desktop = node("darwin", &["device.info", "system.run"]);

        assert!(policy.is_allowed(&desktop, "device.info"));
        assert!(policy.is_allowed(&desktop, "system.run"));
        // Not declared
        assert!(!policy.is_allowed(&desktop, "browser.proxy"));
        // Declared but not a mobile default
        assert!(!policy.is_allowed(&node("ios", &["system.run"]), "system.run"));
    }

    #[test]
    fn deny_list_blocks_command() {
        let policy = NodeCommandPolicy::new(["system.run"]);
        assert!(!policy.is_allowed(&node("linux", &["system.run"]), "system.run"));
    }
}
