//! Connected-client registry.
//!
//! Maps socket identities to the declared id, role, latency, status and
//! metadata of every registered client. Declared ids are unique across
//! the session; a second login under a taken id is refused.

use std::collections::HashMap;
use uuid::Uuid;

use blocksync_core::command::{AuthRequest, AuthRole, ClientInfo, ClientStatus};
use blocksync_core::config::PROTOCOL_VERSION;

/// Validate credentials and protocol version for a login attempt.
/// Returns the refusal reason on mismatch.
pub fn validate_credentials(request: &AuthRequest, password: &str) -> Result<(), String> {
    if request.auth_id.is_empty() {
        return Err("empty client id".to_string());
    }
    if request.auth_type == AuthRole::Admin && request.password.as_deref() != Some(password) {
        return Err("wrong password".to_string());
    }
    if request.version != PROTOCOL_VERSION {
        return Err(format!(
            "wrong client version ({} != {})",
            request.version, PROTOCOL_VERSION
        ));
    }
    Ok(())
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<Uuid, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Fails when the declared id is already taken.
    pub fn register(&mut self, identity: Uuid, id: &str, admin: bool) -> Result<(), String> {
        if self.clients.values().any(|c| c.id == id) {
            return Err("client already logged in".to_string());
        }
        self.clients.insert(
            identity,
            ClientInfo {
                id: id.to_string(),
                admin,
                latency_ms: 999,
                status: ClientStatus::Lobby,
                metadata: HashMap::new(),
                connected_since: chrono::Utc::now().timestamp(),
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, identity: Uuid) -> Option<ClientInfo> {
        self.clients.remove(&identity)
    }

    pub fn get(&self, identity: Uuid) -> Option<&ClientInfo> {
        self.clients.get(&identity)
    }

    pub fn contains(&self, identity: Uuid) -> bool {
        self.clients.contains_key(&identity)
    }

    pub fn is_admin(&self, identity: Uuid) -> bool {
        self.clients.get(&identity).is_some_and(|c| c.admin)
    }

    /// Socket identity of the client with the given declared id.
    pub fn identity_of(&self, id: &str) -> Option<Uuid> {
        self.clients
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(identity, _)| *identity)
    }

    pub fn identities(&self) -> Vec<Uuid> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn set_status(&mut self, identity: Uuid, status: ClientStatus) {
        if let Some(client) = self.clients.get_mut(&identity) {
            client.status = status;
        }
    }

    pub fn set_latency(&mut self, identity: Uuid, latency_ms: u64) {
        if let Some(client) = self.clients.get_mut(&identity) {
            client.latency_ms = latency_ms;
        }
    }

    pub fn merge_metadata(&mut self, identity: Uuid, metadata: HashMap<String, String>) {
        if let Some(client) = self.clients.get_mut(&identity) {
            client.metadata.extend(metadata);
        }
    }

    /// The roster broadcast to every client, keyed by declared id.
    pub fn roster(&self) -> HashMap<String, ClientInfo> {
        self.clients
            .values()
            .map(|c| (c.id.clone(), c.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, role: AuthRole, password: Option<&str>) -> AuthRequest {
        AuthRequest {
            auth_type: role,
            auth_id: id.to_string(),
            password: password.map(str::to_string),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    #[test]
    fn test_duplicate_id_refused() {
        let mut registry = ClientRegistry::new();
        registry.register(Uuid::new_v4(), "alice", false).unwrap();
        let err = registry.register(Uuid::new_v4(), "alice", false).unwrap_err();
        assert_eq!(err, "client already logged in");
    }

    #[test]
    fn test_admin_password_checked() {
        let ok = request("root", AuthRole::Admin, Some("secret"));
        assert!(validate_credentials(&ok, "secret").is_ok());

        let bad = request("root", AuthRole::Admin, Some("nope"));
        assert_eq!(validate_credentials(&bad, "secret").unwrap_err(), "wrong password");

        let missing = request("root", AuthRole::Admin, None);
        assert!(validate_credentials(&missing, "secret").is_err());
    }

    #[test]
    fn test_client_role_skips_password() {
        let req = request("alice", AuthRole::Client, None);
        assert!(validate_credentials(&req, "secret").is_ok());
    }

    #[test]
    fn test_version_mismatch_refused() {
        let mut req = request("alice", AuthRole::Client, None);
        req.version = "0.0.0-dev".to_string();
        let err = validate_credentials(&req, "secret").unwrap_err();
        assert!(err.contains("wrong client version"));
    }

    #[test]
    fn test_kick_lookup_and_removal() {
        let mut registry = ClientRegistry::new();
        let bob = Uuid::new_v4();
        registry.register(bob, "bob", false).unwrap();

        assert_eq!(registry.identity_of("bob"), Some(bob));
        assert_eq!(registry.identity_of("ghost"), None);

        let removed = registry.remove(bob).unwrap();
        assert_eq!(removed.id, "bob");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_roster_keyed_by_declared_id() {
        let mut registry = ClientRegistry::new();
        let alice = Uuid::new_v4();
        registry.register(alice, "alice", true).unwrap();
        registry.set_latency(alice, 12);
        registry.merge_metadata(alice, HashMap::from([("color".to_string(), "red".to_string())]));

        let roster = registry.roster();
        let entry = roster.get("alice").unwrap();
        assert!(entry.admin);
        assert_eq!(entry.latency_ms, 12);
        assert_eq!(entry.metadata.get("color").map(String::as_str), Some("red"));
    }
}
