//! Bridges stored provider profiles onto live backend instances.
//!
//! A [`ProviderProfile`] carries resolved credentials plus free-form
//! settings; this module maps that onto the per-backend configuration
//! structs and installs the result in the scheme registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use credstore::{Credential, ProviderProfile};
use object_storage::registry::StoreRegistry;
use object_storage::{
    AifsConfig, AzureConfig, FileConfig, GcsConfig, GenericObjectStore, ObjectStorageConfig,
    S3Config, StorageKind, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_REQUEST_TIMEOUT,
};

fn setting_str(profile: &ProviderProfile, key: &str) -> Option<String> {
    profile
        .settings
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn concurrency_limit(profile: &ProviderProfile) -> std::num::NonZeroUsize {
    profile
        .settings
        .get("concurrency_limit")
        .and_then(|v| v.as_u64())
        .and_then(|v| std::num::NonZeroUsize::new(v as usize))
        .unwrap_or_else(|| std::num::NonZeroUsize::new(DEFAULT_CONCURRENCY_LIMIT).unwrap())
}

/// Builds a backend for the profile's credentials and settings.
pub async fn store_from_profile(
    profile: &ProviderProfile,
) -> anyhow::Result<GenericObjectStore> {
    let timeout = profile
        .settings
        .get("request_timeout_secs")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    let storage = match &profile.cred {
        Credential::File => StorageKind::LocalFs(FileConfig::default()),
        Credential::S3 {
            access_key,
            secret,
            session_token,
            region,
        } => StorageKind::AwsS3(S3Config {
            region: region.clone(),
            endpoint: setting_str(profile, "endpoint"),
            access_key_id: Some(access_key.clone()),
            secret_access_key: Some(secret.clone()),
            session_token: session_token.clone(),
            concurrency_limit: concurrency_limit(profile),
            max_keys_per_list_response: None,
        }),
        Credential::Gcs {
            key_file,
            json_blob,
            ..
        } => {
            let service_account_json = match (json_blob, key_file) {
                (Some(json), _) => Some(json.clone()),
                (None, Some(path)) => Some(
                    tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("reading GCS key file {path}"))?,
                ),
                (None, None) => None,
            };
            StorageKind::Gcs(GcsConfig {
                service_account_json,
                endpoint: setting_str(profile, "endpoint"),
                concurrency_limit: concurrency_limit(profile),
            })
        }
        Credential::Azure {
            connection_string,
            account,
            key,
            sas,
        } => StorageKind::AzureContainer(AzureConfig {
            account: account.clone().unwrap_or_default(),
            access_key: key.clone(),
            sas_token: sas.clone(),
            connection_string: connection_string.clone(),
            concurrency_limit: concurrency_limit(profile),
            copy_timeout: profile
                .settings
                .get("copy_timeout_secs")
                .and_then(|v| v.as_u64())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(600)),
        }),
        Credential::Aifs { endpoint, token } => StorageKind::Aifs(AifsConfig {
            endpoint: endpoint.clone(),
            token: token.clone(),
            concurrency_limit: concurrency_limit(profile),
        }),
    };

    GenericObjectStore::from_config(&ObjectStorageConfig { storage, timeout })
        .with_context(|| format!("building the backend for profile '{}'", profile.id))
}

/// Installs the profile's backend in the registry, honoring its enabled
/// flag.
pub async fn register_profile(
    registry: &StoreRegistry,
    profile: &ProviderProfile,
) -> anyhow::Result<()> {
    let store = store_from_profile(profile).await?;
    let scheme = profile.scheme;
    registry.register(scheme, Arc::new(store), profile.id.clone());
    if !profile.enabled {
        registry.set_enabled(scheme, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use credstore::PROFILE_VERSION;
    use object_storage::Scheme;

    use super::*;

    fn profile(cred: Credential, scheme: Scheme) -> ProviderProfile {
        ProviderProfile {
            id: "p1".into(),
            scheme,
            display_name: "test".into(),
            enabled: true,
            cred,
            settings: Default::default(),
            version: PROFILE_VERSION,
        }
    }

    #[tokio::test]
    async fn file_profile_builds_and_registers() {
        let registry = StoreRegistry::new();
        register_profile(&registry, &profile(Credential::File, Scheme::File))
            .await
            .unwrap();
        assert!(registry.get(Scheme::File).is_ok());
    }

    #[tokio::test]
    async fn disabled_profile_registers_disabled() {
        let registry = StoreRegistry::new();
        let mut p = profile(Credential::File, Scheme::File);
        p.enabled = false;
        register_profile(&registry, &p).await.unwrap();
        assert!(registry.get(Scheme::File).is_err());
    }

    #[tokio::test]
    async fn s3_profile_maps_credentials() {
        let cred = Credential::S3 {
            access_key: "AKIATEST".into(),
            secret: "shhh".into(),
            session_token: None,
            region: "eu-central-1".into(),
        };
        let store = store_from_profile(&profile(cred, Scheme::S3)).await.unwrap();
        assert_eq!(store.scheme(), Scheme::S3);
    }

    #[tokio::test]
    async fn aifs_profile_maps_endpoint() {
        let cred = Credential::Aifs {
            endpoint: "http://aifs.internal:50052".into(),
            token: Some("tok".into()),
        };
        let store = store_from_profile(&profile(cred, Scheme::Aifs)).await.unwrap();
        assert_eq!(store.scheme(), Scheme::Aifs);
    }
}
