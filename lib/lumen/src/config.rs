use serde_derive::Deserialize;

/// Deployment profile of the host application. Handheld deployments share a
/// single process-wide connection and broadcast to a list of delegates;
/// desktop deployments keep one connection and one delegate per identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Handheld,
    Desktop,
}

/// Proxy endpoint the engine connects through when one is supplied by the
/// host environment. Discovery is not performed here.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Ambient client configuration. Connections snapshot it at construction;
/// later changes never reconfigure an open connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote origin host all traffic is multiplexed onto.
    pub origin: String,
    /// Start connections at the strict security level.
    pub secure_preferred: bool,
    /// Permit dropping from strict to lenient validation when the remote
    /// refuses the stricter handshake.
    pub can_reduce_security: bool,
    /// Permit dropping all the way to cleartext as a last resort.
    pub can_fall_back_to_cleartext: bool,
    pub profile: Profile,
    pub proxy: Option<ProxyConfig>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            origin: "pubsub.example.net".to_string(),
            secure_preferred: true,
            can_reduce_security: false,
            can_fall_back_to_cleartext: false,
            profile: Profile::Desktop,
            proxy: None,
        }
    }
}

impl ClientConfig {
    /// Parses a configuration from its TOML representation.
    pub fn from_toml(raw: &str) -> Result<ClientConfig, String> {
        serdeconv::from_toml_str(raw).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();

        assert!(config.secure_preferred);
        assert!(!config.can_reduce_security);
        assert!(!config.can_fall_back_to_cleartext);
        assert_eq!(config.profile, Profile::Desktop);
        assert_eq!(config.proxy, None);
    }

    #[test]
    fn test_from_toml() {
        let config = ClientConfig::from_toml(
            r#"
origin = "stream.example.org"
secure_preferred = true
can_reduce_security = true
profile = "handheld"

[proxy]
host = "10.0.0.1"
port = 3128
"#,
        )
        .unwrap();

        assert_eq!(config.origin, "stream.example.org");
        assert!(config.can_reduce_security);
        assert!(!config.can_fall_back_to_cleartext);
        assert_eq!(config.profile, Profile::Handheld);
        assert_eq!(
            config.proxy,
            Some(ProxyConfig {
                host: "10.0.0.1".to_string(),
                port: 3128
            })
        );
    }

    #[test]
    fn test_from_toml_partial_falls_back_to_defaults() {
        let config = ClientConfig::from_toml("origin = \"stream.example.org\"").unwrap();

        assert_eq!(config.origin, "stream.example.org");
        assert!(config.secure_preferred);
        assert_eq!(config.profile, Profile::Desktop);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(ClientConfig::from_toml("origin = 42").is_err());
    }
}
