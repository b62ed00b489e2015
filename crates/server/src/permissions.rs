//! Permission resolution: request identity → role → capability set.
//!
//! The mapping is total (any identity, including none, resolves to the
//! `default` role) and monotone: each tier's capabilities are built by
//! extending the tier below, so a higher-privilege role can never lose
//! a tool a lower one has. Only the identity → role step may be
//! cached, with a bounded TTL; the capability set itself is computed
//! fresh per request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relay_protocol::Role;
use tracing::debug;

use crate::sanitize::{append_dangerous_patterns, pattern_matches};

/// Derived, per-request capability set. Never persisted.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    pub role: Role,
    pub allowed_tools: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub denied_patterns: Vec<String>,
}

impl PermissionContext {
    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == name)
    }

    pub fn allows_command(&self, command: &str) -> bool {
        if self
            .denied_patterns
            .iter()
            .any(|p| pattern_matches(p, command))
        {
            return false;
        }
        self.allowed_commands
            .iter()
            .any(|p| pattern_matches(p, command))
    }

    /// An empty effective capability set rejects the request outright
    pub fn is_empty(&self) -> bool {
        self.allowed_tools.is_empty() && self.allowed_commands.is_empty()
    }
}

/// Build the capability set for a role. Tiers extend each other so
/// monotonicity holds by construction.
pub fn context_for_role(role: Role) -> PermissionContext {
    let mut tools: Vec<&str> = vec!["Read"];
    let mut commands: Vec<&str> = vec!["/help", "/status"];
    // Everything below Developer is denied write-capable tools
    let mut denied: Vec<&str> = vec!["Bash*", "Write*", "Edit*"];

    if matches!(role, Role::Viewer | Role::Developer | Role::Admin) {
        tools.extend(["Glob", "Grep"]);
        commands.push("/compact");
    }
    if matches!(role, Role::Developer | Role::Admin) {
        tools.extend(["Edit", "Write", "Bash", "WebFetch"]);
        commands.push("/*");
        denied.clear();
    }
    if matches!(role, Role::Admin) {
        tools.extend(["WebSearch", "KillShell"]);
    }

    let mut denied: Vec<String> = denied.into_iter().map(String::from).collect();
    append_dangerous_patterns(&mut denied);

    PermissionContext {
        role,
        allowed_tools: tools.into_iter().map(String::from).collect(),
        allowed_commands: commands.into_iter().map(String::from).collect(),
        denied_patterns: denied,
    }
}

/// Map an identity token to a role. Tokens carry a role prefix
/// (`admin:alice`); anything unrecognized or absent is `default`.
fn role_for_identity(identity: Option<&str>) -> Role {
    let Some(identity) = identity else {
        return Role::Default;
    };
    match identity.split(':').next() {
        Some("admin") => Role::Admin,
        Some("developer") => Role::Developer,
        Some("viewer") => Role::Viewer,
        _ => Role::Default,
    }
}

/// Resolver with a TTL-bounded cache in front of the identity → role
/// lookup. A zero TTL disables caching.
pub struct PermissionResolver {
    ttl: Duration,
    cache: Mutex<HashMap<String, (Role, Instant)>>,
}

impl PermissionResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an identity into a fresh permission context.
    pub fn resolve(&self, identity: Option<&str>) -> PermissionContext {
        let role = match identity {
            Some(id) if !self.ttl.is_zero() => self.cached_role(id),
            other => role_for_identity(other),
        };

        debug!(
            component = "permissions",
            event = "permissions.resolved",
            identity_present = identity.is_some(),
            role = ?role,
            "Resolved permission context"
        );

        context_for_role(role)
    }

    fn cached_role(&self, identity: &str) -> Role {
        let now = Instant::now();
        let mut cache = self.cache.lock().expect("role cache poisoned");

        if let Some((role, at)) = cache.get(identity) {
            if now.duration_since(*at) < self.ttl {
                return *role;
            }
        }

        let role = role_for_identity(Some(identity));
        cache.insert(identity.to_string(), (role, now));
        role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_total() {
        assert_eq!(role_for_identity(None), Role::Default);
        assert_eq!(role_for_identity(Some("")), Role::Default);
        assert_eq!(role_for_identity(Some("garbage")), Role::Default);
        assert_eq!(role_for_identity(Some("admin:alice")), Role::Admin);
        assert_eq!(role_for_identity(Some("viewer:bob")), Role::Viewer);
    }

    #[test]
    fn roles_are_monotone() {
        let tiers = [Role::Default, Role::Viewer, Role::Developer, Role::Admin];
        for pair in tiers.windows(2) {
            let lower = context_for_role(pair[0]);
            let higher = context_for_role(pair[1]);
            for tool in &lower.allowed_tools {
                assert!(
                    higher.allowed_tools.contains(tool),
                    "{:?} lost tool {} that {:?} has",
                    pair[1],
                    tool,
                    pair[0]
                );
            }
            for cmd in &lower.allowed_commands {
                assert!(higher.allowed_commands.contains(cmd));
            }
        }
    }

    #[test]
    fn dangerous_patterns_denied_for_every_role() {
        for role in [Role::Default, Role::Viewer, Role::Developer, Role::Admin] {
            let ctx = context_for_role(role);
            assert!(!ctx.allows_command("rm -rf /"), "role {:?}", role);
        }
    }

    #[test]
    fn default_role_cannot_run_arbitrary_commands() {
        let ctx = context_for_role(Role::Default);
        assert!(ctx.allows_command("/help"));
        assert!(!ctx.allows_command("/anything-else"));
        assert!(!ctx.allows_tool("Bash"));
    }

    #[test]
    fn developer_gets_wildcard_commands() {
        let ctx = context_for_role(Role::Developer);
        assert!(ctx.allows_command("/model"));
        assert!(ctx.allows_tool("Bash"));
    }

    #[test]
    fn cache_honors_ttl() {
        let resolver = PermissionResolver::new(Duration::from_secs(60));
        let first = resolver.resolve(Some("developer:carol"));
        let second = resolver.resolve(Some("developer:carol"));
        assert_eq!(first.role, second.role);
        assert_eq!(second.role, Role::Developer);
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let resolver = PermissionResolver::new(Duration::ZERO);
        assert_eq!(resolver.resolve(Some("admin:x")).role, Role::Admin);
        assert!(resolver.cache.lock().unwrap().is_empty());
    }
}
