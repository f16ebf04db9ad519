use k8s_openapi::api::authentication::v1::SelfSubjectReview;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/* ============================= TYPES ============================= */

/// Where the cluster identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentitySource {
    #[serde(rename = "cluster-self-review")]
    ClusterSelfReview,
    #[serde(rename = "kubeconfig")]
    Kubeconfig,
    #[serde(rename = "unknown")]
    #[default]
    Unknown,
}

/// How much the identity can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentityConfidence {
    #[serde(rename = "verified")]
    Verified,
    #[serde(rename = "parsed")]
    Parsed,
    #[serde(rename = "none")]
    #[default]
    None,
}

/// The acting user recorded in audit bundles and rate-limit entries.
/// OS fields are always populated (possibly empty strings); cluster
/// fields depend on how far the resolution cascade got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub cluster_context: String,
    pub cluster_user: String,
    pub os_user: String,
    pub machine: String,
    pub source: IdentitySource,
    pub confidence: IdentityConfidence,
}

impl Identity {
    /// True when a cluster identity was established by any means.
    pub fn is_recorded(&self) -> bool {
        self.source != IdentitySource::Unknown
    }

    /// Best available user string for rate-limit entries.
    pub fn user_label(&self) -> &str {
        if !self.cluster_user.is_empty() {
            &self.cluster_user
        } else {
            &self.os_user
        }
    }
}

/* ============================= RESOLUTION ============================= */

/// Resolve the acting identity.
///
/// Cascade: OS user and hostname are always recorded; a successful
/// `SelfSubjectReview` yields a verified cluster identity (the context
/// name still comes from the kubeconfig); otherwise the kubeconfig's
/// current context is parsed; if both fail the identity stays unknown.
pub async fn resolve(client: Option<&Client>, kubeconfig_path: Option<&Path>) -> Identity {
    let mut identity = Identity {
        os_user: whoami::fallible::username().unwrap_or_default(),
        machine: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default(),
        ..Default::default()
    };

    let kubeconfig = read_kubeconfig(kubeconfig_path);
    if let Some((context, user)) = kubeconfig.as_ref().and_then(current_context_user) {
        identity.cluster_context = context;
        identity.cluster_user = user;
        identity.source = IdentitySource::Kubeconfig;
        identity.confidence = IdentityConfidence::Parsed;
    }

    if let Some(client) = client {
        match self_subject_username(client).await {
            Some(username) => {
                identity.cluster_user = username;
                identity.source = IdentitySource::ClusterSelfReview;
                identity.confidence = IdentityConfidence::Verified;
            }
            None => {
                debug!("self_subject_review_unavailable");
            }
        }
    }

    identity
}

fn read_kubeconfig(path: Option<&Path>) -> Option<kube::config::Kubeconfig> {
    match path {
        Some(p) => kube::config::Kubeconfig::read_from(p).ok(),
        None => kube::config::Kubeconfig::read().ok(),
    }
}

/// Pull (context name, user reference) for the current context.
fn current_context_user(kubeconfig: &kube::config::Kubeconfig) -> Option<(String, String)> {
    let current = kubeconfig.current_context.as_deref()?;
    let named = kubeconfig.contexts.iter().find(|c| c.name == current)?;
    let context = named.context.as_ref()?;
    Some((current.to_string(), context.user.clone()))
}

/// Ask the API server who we are. Returns the authenticated username
/// on success, `None` on any failure.
async fn self_subject_username(client: &Client) -> Option<String> {
    let api: Api<SelfSubjectReview> = Api::all(client.clone());
    let review = api
        .create(&PostParams::default(), &SelfSubjectReview::default())
        .await
        .ok()?;
    review.status?.user_info?.username
}

/* ============================= TESTS ============================= */
