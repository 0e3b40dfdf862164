//! Secret listing abstraction.
//!
//! The scraper depends on the [`SecretSource`] trait only. [`KubeSecretSource`]
//! is the production implementation backed by the [`kube`] client, which talks
//! to the cluster using in-cluster configuration or a kubeconfig file. Tests
//! provide in-memory implementations.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::error::Error;
use std::path::Path;
use tracing::{debug, info};

use crate::error::ListingError;

/// Parameters of a single page-limited listing call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListRequest {
    /// Opaque label selector, empty selects everything
    pub label_selector: String,
    /// Maximum number of secrets in the returned page
    pub limit: u32,
    /// Continue token returned by the previous page
    pub continue_token: Option<String>,
}

/// One page of listed secrets.
#[derive(Debug, Clone, Default)]
pub struct SecretPage {
    pub secrets: Vec<Secret>,
    /// Token for the next page, `None` once the listing is exhausted
    pub continue_token: Option<String>,
}

/// Read-only access to the secrets stored in the cluster.
///
/// Implementations must be safe to share between concurrent scrapes.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Lists one page of secrets in `namespace`.
    ///
    /// An empty namespace selects the default namespace of the source.
    async fn list_secrets(
        &self,
        namespace: &str,
        request: &ListRequest,
    ) -> Result<SecretPage, ListingError>;
}

/// [`SecretSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        KubeSecretSource { client }
    }

    /// Connects to the cluster.
    ///
    /// With an explicit kubeconfig path that file is used. Otherwise the
    /// in-cluster service account is tried first, then the ambient kubeconfig
    /// (`$KUBECONFIG` or `~/.kube/config`).
    pub async fn connect(
        kubeconfig: Option<&Path>,
    ) -> Result<KubeSecretSource, Box<dyn Error + Send + Sync>> {
        let config = match kubeconfig {
            Some(path) => {
                info!(path = %path.display(), "Using kubeconfig file");
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => match Config::incluster() {
                Ok(config) => {
                    info!("Using in-cluster configuration");
                    config
                }
                Err(e) => {
                    debug!(error = %e, "In-cluster configuration unavailable, inferring");
                    Config::infer().await?
                }
            },
        };
        let client = Client::try_from(config)?;
        Ok(KubeSecretSource::new(client))
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        if namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn list_secrets(
        &self,
        namespace: &str,
        request: &ListRequest,
    ) -> Result<SecretPage, ListingError> {
        let list = self
            .api(namespace)
            .list(&list_params(request))
            .await
            .map_err(|source| ListingError::Api {
                namespace: namespace.to_string(),
                source,
            })?;

        Ok(SecretPage {
            secrets: list.items,
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
        })
    }
}

fn list_params(request: &ListRequest) -> ListParams {
    let mut params = ListParams::default().limit(request.limit);
    if !request.label_selector.is_empty() {
        params = params.labels(&request.label_selector);
    }
    if let Some(token) = &request.continue_token {
        params = params.continue_token(token);
    }
    params
}
