//! Credential model and layered resolution.
//!
//! Resolution precedence, first match wins: explicit credentials passed by
//! the caller, process environment, provider CLI state on disk, the
//! encrypted secret store, and finally the provider SDK's ambient identity
//! (instance roles, metadata servers) where one exists. The resolver logs
//! which source answered, never the values.

pub mod secret_store;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use object_storage::Scheme;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use secret_store::{ProfileRecord, SecretStore, SecretStoreError};

/// Per-scheme credential material. `Debug` never prints secret fields.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    S3 {
        access_key: String,
        secret: String,
        #[serde(default)]
        session_token: Option<String>,
        region: String,
    },
    Gcs {
        #[serde(default)]
        project_id: Option<String>,
        /// Path to a service-account key file.
        #[serde(default)]
        key_file: Option<Utf8PathBuf>,
        /// Inline service-account key JSON.
        #[serde(default)]
        json_blob: Option<String>,
    },
    Azure {
        #[serde(default)]
        connection_string: Option<String>,
        #[serde(default)]
        account: Option<String>,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        sas: Option<String>,
    },
    Aifs {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
    },
    /// The local filesystem needs none.
    File,
}

impl Credential {
    pub fn scheme(&self) -> Scheme {
        match self {
            Credential::S3 { .. } => Scheme::S3,
            Credential::Gcs { .. } => Scheme::Gcs,
            Credential::Azure { .. } => Scheme::Az,
            Credential::Aifs { .. } => Scheme::Aifs,
            Credential::File => Scheme::File,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::S3 { region, .. } => f
                .debug_struct("S3")
                .field("access_key", &"[redacted]")
                .field("region", region)
                .finish_non_exhaustive(),
            Credential::Gcs {
                project_id,
                key_file,
                ..
            } => f
                .debug_struct("Gcs")
                .field("project_id", project_id)
                .field("key_file", key_file)
                .finish_non_exhaustive(),
            Credential::Azure { account, .. } => f
                .debug_struct("Azure")
                .field("account", account)
                .finish_non_exhaustive(),
            Credential::Aifs { endpoint, token } => f
                .debug_struct("Aifs")
                .field("endpoint", endpoint)
                .field("token", &token.as_deref().map(|_| "[redacted]"))
                .finish(),
            Credential::File => f.write_str("File"),
        }
    }
}

/// A stored backend profile: one configured provider, encrypted at rest.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub scheme: Scheme,
    pub display_name: String,
    pub enabled: bool,
    pub cred: Credential,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_profile_version")]
    pub version: u32,
}

pub const PROFILE_VERSION: u32 = 1;

fn default_profile_version() -> u32 {
    PROFILE_VERSION
}

impl fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("id", &self.id)
            .field("scheme", &self.scheme)
            .field("display_name", &self.display_name)
            .field("enabled", &self.enabled)
            .field("cred", &self.cred)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Environment,
    CliConfig,
    SecretStore,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub cred: Credential,
    pub source: CredentialSource,
}

pub struct CredentialResolver {
    secret_store: Option<Arc<SecretStore>>,
    home: Option<Utf8PathBuf>,
}

impl CredentialResolver {
    pub fn new(secret_store: Option<Arc<SecretStore>>) -> Self {
        let home = std::env::var("HOME").ok().map(Utf8PathBuf::from);
        Self { secret_store, home }
    }

    /// Resolves credentials for `scheme`.
    ///
    /// `Ok(None)` means no configured source answered and the backend
    /// should fall back to the provider's ambient identity chain (instance
    /// role, metadata server), where one exists.
    pub async fn resolve(
        &self,
        scheme: Scheme,
        explicit: Option<Credential>,
    ) -> Result<Option<ResolvedCredential>, SecretStoreError> {
        if scheme == Scheme::File {
            return Ok(Some(ResolvedCredential {
                cred: Credential::File,
                source: CredentialSource::Explicit,
            }));
        }

        if let Some(cred) = explicit {
            debug_assert_eq!(cred.scheme(), scheme);
            info!("credentials for {scheme}: using explicit credentials");
            return Ok(Some(ResolvedCredential {
                cred,
                source: CredentialSource::Explicit,
            }));
        }

        if let Some(cred) = from_env(scheme, &|name| std::env::var(name).ok()) {
            info!("credentials for {scheme}: resolved from the environment");
            return Ok(Some(ResolvedCredential {
                cred,
                source: CredentialSource::Environment,
            }));
        }

        if let Some(home) = &self.home {
            match from_cli_state(scheme, home, &|name| std::env::var(name).ok()).await {
                Some(cred) => {
                    info!("credentials for {scheme}: resolved from provider CLI state");
                    return Ok(Some(ResolvedCredential {
                        cred,
                        source: CredentialSource::CliConfig,
                    }));
                }
                None => debug!("credentials for {scheme}: no provider CLI state found"),
            }
        }

        if let Some(store) = &self.secret_store {
            for record in store.list_profiles().await? {
                match record {
                    ProfileRecord::Readable(profile)
                        if profile.scheme == scheme && profile.enabled =>
                    {
                        info!(
                            "credentials for {scheme}: resolved from the secret store \
                             (profile '{}')",
                            profile.id
                        );
                        return Ok(Some(ResolvedCredential {
                            cred: profile.cred,
                            source: CredentialSource::SecretStore,
                        }));
                    }
                    ProfileRecord::Readable(_) => {}
                    ProfileRecord::Unreadable { id } => {
                        // Surfaced, not dropped: a wrong passphrase must not
                        // look like a missing profile.
                        tracing::warn!("secret store profile '{id}' is unreadable, skipping");
                    }
                }
            }
        }

        info!("credentials for {scheme}: no configured source, falling back to ambient identity");
        Ok(None)
    }
}

/// Environment resolution, in each scheme's documented variable form.
fn from_env(scheme: Scheme, env: &dyn Fn(&str) -> Option<String>) -> Option<Credential> {
    match scheme {
        Scheme::File => Some(Credential::File),
        Scheme::S3 => {
            let access_key = env("AWS_ACCESS_KEY_ID")?;
            let secret = env("AWS_SECRET_ACCESS_KEY")?;
            let region = env("AWS_REGION")
                .or_else(|| env("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string());
            Some(Credential::S3 {
                access_key,
                secret,
                session_token: env("AWS_SESSION_TOKEN"),
                region,
            })
        }
        Scheme::Gcs => {
            let key_file = env("GOOGLE_APPLICATION_CREDENTIALS")?;
            Some(Credential::Gcs {
                project_id: env("GOOGLE_CLOUD_PROJECT"),
                key_file: Some(Utf8PathBuf::from(key_file)),
                json_blob: None,
            })
        }
        Scheme::Az => {
            if let Some(connection_string) = env("AZURE_STORAGE_CONNECTION_STRING") {
                return Some(Credential::Azure {
                    connection_string: Some(connection_string),
                    account: None,
                    key: None,
                    sas: None,
                });
            }
            let account = env("AZURE_STORAGE_ACCOUNT")?;
            if let Some(key) = env("AZURE_STORAGE_KEY") {
                return Some(Credential::Azure {
                    connection_string: None,
                    account: Some(account),
                    key: Some(key),
                    sas: None,
                });
            }
            let sas = env("AZURE_STORAGE_SAS_TOKEN")?;
            Some(Credential::Azure {
                connection_string: None,
                account: Some(account),
                key: None,
                sas: Some(sas),
            })
        }
        Scheme::Aifs => {
            let endpoint = env("AIFS_ENDPOINT")?;
            Some(Credential::Aifs {
                endpoint,
                token: env("AIFS_TOKEN"),
            })
        }
    }
}

/// Provider CLI state on disk, at each platform's standard location.
async fn from_cli_state(
    scheme: Scheme,
    home: &Utf8Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<Credential> {
    match scheme {
        Scheme::File => Some(Credential::File),
        Scheme::S3 => {
            let profile = env("AWS_PROFILE").unwrap_or_else(|| "default".to_string());
            let credentials = tokio::fs::read_to_string(home.join(".aws/credentials"))
                .await
                .ok()?;
            let sections = parse_ini(&credentials);
            let section = sections.get(&profile)?;
            let access_key = section.get("aws_access_key_id")?.clone();
            let secret = section.get("aws_secret_access_key")?.clone();

            // Region lives in the sibling config file, under `[profile X]`
            // for anything but the default profile.
            let region = match tokio::fs::read_to_string(home.join(".aws/config")).await {
                Ok(config) => {
                    let sections = parse_ini(&config);
                    let key = if profile == "default" {
                        profile.clone()
                    } else {
                        format!("profile {profile}")
                    };
                    sections
                        .get(&key)
                        .and_then(|s| s.get("region"))
                        .cloned()
                        .unwrap_or_else(|| "us-east-1".to_string())
                }
                Err(_) => "us-east-1".to_string(),
            };

            Some(Credential::S3 {
                access_key,
                secret,
                session_token: section.get("aws_session_token").cloned(),
                region,
            })
        }
        Scheme::Gcs => {
            let adc = home.join(".config/gcloud/application_default_credentials.json");
            tokio::fs::metadata(&adc).await.ok()?;
            Some(Credential::Gcs {
                project_id: None,
                key_file: Some(adc),
                json_blob: None,
            })
        }
        // The Azure CLI profile stores subscriptions, not storage account
        // keys, so there is nothing usable here; the env and secret-store
        // sources carry the account material instead.
        Scheme::Az => None,
        Scheme::Aifs => None,
    }
}

/// Minimal INI parsing, enough for the AWS credentials/config format.
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            sections.entry(name.trim().to_string()).or_default();
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .get_mut(section)
                .expect("section was just inserted")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn s3_env_form() {
        let env = env_from(&[
            ("AWS_ACCESS_KEY_ID", "AKIATEST"),
            ("AWS_SECRET_ACCESS_KEY", "shhh"),
            ("AWS_REGION", "eu-west-1"),
        ]);
        let cred = from_env(Scheme::S3, &env).unwrap();
        match cred {
            Credential::S3 {
                access_key, region, ..
            } => {
                assert_eq!(access_key, "AKIATEST");
                assert_eq!(region, "eu-west-1");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn azure_env_prefers_connection_string() {
        let env = env_from(&[
            ("AZURE_STORAGE_CONNECTION_STRING", "DefaultEndpoints..."),
            ("AZURE_STORAGE_ACCOUNT", "acct"),
            ("AZURE_STORAGE_KEY", "key"),
        ]);
        match from_env(Scheme::Az, &env).unwrap() {
            Credential::Azure {
                connection_string: Some(_),
                account: None,
                ..
            } => {}
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn missing_env_vars_resolve_nothing() {
        let env = env_from(&[]);
        assert!(from_env(Scheme::S3, &env).is_none());
        assert!(from_env(Scheme::Gcs, &env).is_none());
        assert!(from_env(Scheme::Az, &env).is_none());
        assert!(from_env(Scheme::Aifs, &env).is_none());
    }

    #[tokio::test]
    async fn aws_cli_state_is_read_from_ini() {
        let home = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(home.path().join(".aws"))
            .await
            .unwrap();
        tokio::fs::write(
            home.path().join(".aws/credentials"),
            "[default]\naws_access_key_id = AKIAFILE\naws_secret_access_key = filesecret\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            home.path().join(".aws/config"),
            "[default]\nregion = ap-southeast-2\n",
        )
        .await
        .unwrap();

        let env = |_: &str| None;
        let cred = from_cli_state(Scheme::S3, home.path(), &env).await.unwrap();
        match cred {
            Credential::S3 {
                access_key, region, ..
            } => {
                assert_eq!(access_key, "AKIAFILE");
                assert_eq!(region, "ap-southeast-2");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn debug_redacts_secrets() {
        let cred = Credential::S3 {
            access_key: "AKIATEST".into(),
            secret: "the-secret-value".into(),
            session_token: None,
            region: "us-east-1".into(),
        };
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("the-secret-value"));
        assert!(!rendered.contains("AKIATEST"));

        let profile = ProviderProfile {
            id: "p1".into(),
            scheme: Scheme::S3,
            display_name: "prod".into(),
            enabled: true,
            cred,
            settings: Default::default(),
            version: PROFILE_VERSION,
        };
        assert!(!format!("{profile:?}").contains("the-secret-value"));
    }

    #[test]
    fn ini_parser_handles_sections_and_comments() {
        let parsed = parse_ini(
            "# comment\n[default]\na = 1\n\n[profile two]\nb=2\n; trailing comment\n",
        );
        assert_eq!(parsed["default"]["a"], "1");
        assert_eq!(parsed["profile two"]["b"], "2");
    }
}
