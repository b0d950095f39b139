//! Per-request decisions
//!
//! The [`Pipeline`] runs every container image of a pod through the
//! [`ImagePolicy`]. The mutate path turns the rewrites into a
//! [`PatchDocument`]; the validate path stops at the first image the policy
//! does not admit.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use crate::error::AdmissionError;
use crate::notify::Notify;
use crate::patch::{ContainerKind, PatchBuilder, PatchDocument, PodMetadata};
use crate::policy::ImagePolicy;
use crate::registry::RegistryLookup;

/// Settings the pipeline reads on every request
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Namespaces that bypass the policy
    pub whitelist_namespaces: Vec<String>,
    /// Pull secret injected into rewritten pods
    pub registry_secret: Option<String>,
    /// Only rewrite when the new image exists
    pub if_exists: bool,
}

impl Settings {
    /// True when a whitelist entry equals or contains the namespace
    ///
    /// Note the direction: the entry must contain the namespace. Registry
    /// trust checks the opposite way round. An empty namespace is contained in
    /// every entry and is therefore never whitelisted.
    pub fn namespace_whitelisted(&self, namespace: &str) -> bool {
        !namespace.is_empty()
            && self
                .whitelist_namespaces
                .iter()
                .any(|entry| entry == namespace || entry.contains(namespace))
    }
}

/// One container image and where it sits in the pod spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub kind: ContainerKind,
    pub index: usize,
    pub name: String,
    pub image: String,
}

/// The parts of a pod the pipeline looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub metadata: PodMetadata,
    /// Containers first, then init containers, each indexed in its own list
    pub images: Vec<ContainerImage>,
}

impl Workload {
    pub fn from_pod(pod: &Pod) -> Self {
        let spec = pod.spec.as_ref();
        let containers = spec.map(|spec| spec.containers.as_slice()).unwrap_or_default();
        let init_containers = spec
            .and_then(|spec| spec.init_containers.as_deref())
            .unwrap_or_default();

        let listed = |kind: ContainerKind, containers: &[Container]| {
            containers
                .iter()
                .enumerate()
                .map(|(index, container)| ContainerImage {
                    kind,
                    index,
                    name: container.name.clone(),
                    image: container.image.clone().unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        };

        let mut images = listed(ContainerKind::Container, containers);
        images.extend(listed(ContainerKind::Init, init_containers));

        Self {
            metadata: PodMetadata {
                has_annotations: pod.metadata.annotations.is_some(),
                has_labels: pod.metadata.labels.is_some(),
            },
            images,
        }
    }
}

impl TryFrom<&DynamicObject> for Workload {
    type Error = AdmissionError;

    fn try_from(object: &DynamicObject) -> Result<Self, Self::Error> {
        let pod: Pod = serde_json::to_value(object)
            .and_then(serde_json::from_value)
            .map_err(AdmissionError::InvalidObject)?;
        Ok(Self::from_pod(&pod))
    }
}

/// Outcome of the validate path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// The first image the policy does not admit
    Denied { image: String, message: String },
}

/// Message sent and returned when an image is rejected
pub fn untrusted_image_message(image: &str) -> String {
    format!("Image is not being pulled from Private Registry: {image}")
}

/// Applies the image policy to admission requests
pub struct Pipeline {
    settings: Settings,
    policy: ImagePolicy,
    registry: Arc<dyn RegistryLookup>,
    notifier: Arc<dyn Notify>,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        policy: ImagePolicy,
        registry: Arc<dyn RegistryLookup>,
        notifier: Arc<dyn Notify>,
    ) -> Self {
        Self {
            settings,
            policy,
            registry,
            notifier,
        }
    }

    /// Whether requests from `namespace` skip the policy entirely
    pub fn bypasses(&self, namespace: &str) -> bool {
        let bypass = self.settings.namespace_whitelisted(namespace);
        if bypass {
            info!(namespace = %namespace, "namespace is whitelisted");
        }
        bypass
    }

    /// Builds the patch rewriting every non-compliant image of the pod
    ///
    /// The document is empty when nothing changed.
    pub async fn mutate(&self, workload: &Workload) -> PatchDocument {
        let mut builder = PatchBuilder::new();

        for container in &workload.images {
            debug!(
                image = %container.image,
                container = %container.name,
                "evaluating container image"
            );
            let decision = self
                .policy
                .decide(&container.image, self.registry.as_ref())
                .await;

            if let Some(missing) = &decision.missing_target {
                let message = format!("{missing} does not exist in private registry");
                info!(image = %container.image, "{message}");
                self.notifier.notify(&message).await;
            }

            if !decision.changed {
                continue;
            }

            if self.settings.if_exists && !self.registry.exists(&decision.image).await {
                let message = format!(
                    "{} does not exist in private registry, skipping patching of {}",
                    decision.image, container.name
                );
                warn!(image = %container.image, "{message}");
                self.notifier.notify(&message).await;
                continue;
            }

            info!(from = %decision.original, to = %decision.image, "changing image");
            builder.rewrite_image(
                container.kind,
                container.index,
                &decision.original,
                &decision.image,
            );
        }

        builder.finish(workload.metadata, self.settings.registry_secret.as_deref())
    }

    /// Checks containers, then init containers, and reports only the first
    /// image that is not admitted
    pub async fn validate(&self, workload: &Workload) -> Verdict {
        for container in &workload.images {
            if self
                .policy
                .admits(&container.image, self.registry.as_ref())
                .await
            {
                debug!(image = %container.image, "image is being pulled from private registry");
                continue;
            }

            let message = untrusted_image_message(&container.image);
            warn!(image = %container.image, container = %container.name, "{message}");
            self.notifier.notify(&message).await;
            return Verdict::Denied {
                image: container.image.clone(),
                message,
            };
        }

        Verdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use warp::Filter;

    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use crate::notify::{Notifier, NotifierConfig};
    use crate::patch::{Op, PatchValue};
    use crate::policy::{LegacyPolicy, Policy};
    use crate::registry::StaticRegistry;

    const TRUSTED: &str = "private-registry.cluster.local";

    fn pod(containers: &[&str], init_containers: &[&str]) -> Pod {
        let list = |images: &[&str]| {
            images
                .iter()
                .enumerate()
                .map(|(i, image)| json!({ "name": format!("c{i}"), "image": image }))
                .collect::<Vec<_>>()
        };
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "myapp", "namespace": "foobar" },
            "spec": {
                "containers": list(containers),
                "initContainers": list(init_containers),
            }
        }))
        .unwrap()
    }

    fn legacy_pipeline(
        settings: Settings,
        registry: StaticRegistry,
    ) -> (Pipeline, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let policy = LegacyPolicy::new(vec![TRUSTED.into()], Some(TRUSTED.into()));
        let pipeline = Pipeline::new(
            settings,
            policy.into(),
            Arc::new(registry),
            notifier.clone(),
        );
        (pipeline, notifier)
    }

    fn settings() -> Settings {
        Settings {
            whitelist_namespaces: vec!["kube-system".into()],
            registry_secret: Some("regcred".into()),
            if_exists: false,
        }
    }

    #[test]
    fn namespace_whitelist_matches_entry_containing_namespace() {
        let settings = settings();
        assert!(settings.namespace_whitelisted("kube-system"));
        // substring of an entry counts
        assert!(settings.namespace_whitelisted("kube"));
        // but an entry inside the namespace does not
        assert!(!settings.namespace_whitelisted("kube-system-extra"));
        assert!(!settings.namespace_whitelisted("foobar"));
        assert!(!settings.namespace_whitelisted(""));
    }

    #[test]
    fn workload_lists_containers_before_init_containers() {
        let workload = Workload::from_pod(&pod(&["nginx", "mysql"], &["busybox"]));
        let listed: Vec<_> = workload
            .images
            .iter()
            .map(|c| (c.kind, c.index, c.image.as_str()))
            .collect();

        assert_eq!(
            listed,
            vec![
                (ContainerKind::Container, 0, "nginx"),
                (ContainerKind::Container, 1, "mysql"),
                (ContainerKind::Init, 0, "busybox"),
            ]
        );
        assert_eq!(workload.metadata, PodMetadata::default());
    }

    #[test]
    fn workload_rejects_non_pod_objects() {
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "broken" },
            "spec": { "containers": "not a list" }
        }))
        .unwrap();

        assert!(matches!(
            Workload::try_from(&object),
            Err(AdmissionError::InvalidObject(_))
        ));
    }

    #[tokio::test]
    async fn legacy_mutation_rewrites_untrusted_containers() {
        let (pipeline, _) = legacy_pipeline(settings(), StaticRegistry::default());
        let workload = Workload::from_pod(&pod(&["nginx", "mysql"], &[]));

        let document = pipeline.mutate(&workload).await;
        let ops = document.ops();

        let replaces: Vec<_> = ops.iter().filter(|op| op.op == Op::Replace).collect();
        assert_eq!(replaces.len(), 2);
        assert_eq!(replaces[0].path.to_string(), "/spec/containers/0/image");
        assert_eq!(replaces[0].value, PatchValue::Text(format!("{TRUSTED}/nginx")));
        assert_eq!(replaces[1].path.to_string(), "/spec/containers/1/image");

        let annotations: Vec<_> = ops
            .iter()
            .filter(|op| op.path.to_string().starts_with("/metadata/annotations/"))
            .map(|op| op.path.to_string())
            .collect();
        assert_eq!(
            annotations,
            vec![
                "/metadata/annotations/tugger-original-image-0",
                "/metadata/annotations/tugger-original-image-1",
            ]
        );

        let tail: Vec<_> = ops[ops.len() - 2..]
            .iter()
            .map(|op| op.path.to_string())
            .collect();
        assert_eq!(
            tail,
            vec!["/spec/imagePullSecrets", "/metadata/labels/tugger-modified"]
        );
        assert_eq!(
            ops.iter()
                .filter(|op| op.path.to_string() == "/spec/imagePullSecrets")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn trusted_pod_is_not_patched() {
        let (pipeline, notifier) = legacy_pipeline(settings(), StaticRegistry::default());
        let image = format!("{TRUSTED}/nginx");
        let workload = Workload::from_pod(&pod(&[image.as_str()], &[image.as_str()]));

        assert!(pipeline.mutate(&workload).await.is_empty());
        assert_eq!(pipeline.validate(&workload).await, Verdict::Allowed);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn if_exists_discards_rewrites_to_missing_images() {
        let settings = Settings {
            if_exists: true,
            ..settings()
        };
        let registry = StaticRegistry::with_images(["private-registry.cluster.local/nginx"]);
        let (pipeline, notifier) = legacy_pipeline(settings, registry);
        let workload = Workload::from_pod(&pod(&["nginx", "mysql"], &[]));

        let document = pipeline.mutate(&workload).await;
        let replaced: Vec<_> = document
            .ops()
            .iter()
            .filter(|op| op.op == Op::Replace)
            .map(|op| op.path.to_string())
            .collect();

        assert_eq!(replaced, vec!["/spec/containers/0/image"]);
        assert_eq!(
            notifier.messages(),
            vec![
                "private-registry.cluster.local/mysql does not exist in private registry, skipping patching of c1"
            ]
        );
    }

    #[tokio::test]
    async fn if_exists_applies_to_rule_policy() {
        let policy = Policy::from_yaml("rules:\n- pattern: (.*)\n  replacement: mirror/$1\n")
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Pipeline::new(
            Settings {
                if_exists: true,
                ..settings()
            },
            policy.into(),
            Arc::new(StaticRegistry::with_images(["mirror/nginx"])),
            notifier.clone(),
        );

        let document = pipeline
            .mutate(&Workload::from_pod(&pod(&["nginx", "mysql"], &[])))
            .await;
        let replaced: Vec<_> = document
            .ops()
            .iter()
            .filter(|op| op.op == Op::Replace)
            .map(|op| (op.path.to_string(), op.value.clone()))
            .collect();

        assert_eq!(
            replaced,
            vec![(
                "/spec/containers/0/image".to_string(),
                PatchValue::Text("mirror/nginx".into())
            )]
        );
        assert_eq!(
            notifier.messages(),
            vec!["mirror/mysql does not exist in private registry, skipping patching of c1"]
        );
    }

    #[tokio::test]
    async fn stalled_webhook_does_not_delay_validation() {
        let route = warp::post().and_then(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, warp::Rejection>("ok")
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let notifier = Notifier::new(&NotifierConfig {
            webhook_url: Some(format!("http://{addr}/")),
            timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .unwrap();
        let pipeline = Pipeline::new(
            settings(),
            LegacyPolicy::new(vec![TRUSTED.into()], Some(TRUSTED.into())).into(),
            Arc::new(StaticRegistry::default()),
            Arc::new(notifier),
        );
        let workload = Workload::from_pod(&pod(&["nginx", "mysql"], &["redis"]));

        let started = Instant::now();
        let verdict = pipeline.validate(&workload).await;
        let document = pipeline.mutate(&workload).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(verdict, Verdict::Denied { image, .. } if image == "nginx"));
        assert!(!document.is_empty());
    }

    #[tokio::test]
    async fn policy_miss_is_notified() {
        let policy = Policy::from_yaml(
            "rules:\n- pattern: (.*)\n  replacement: mirror/$1\n  condition: Exists\n",
        )
        .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Pipeline::new(
            settings(),
            policy.into(),
            Arc::new(StaticRegistry::default()),
            notifier.clone(),
        );

        let document = pipeline
            .mutate(&Workload::from_pod(&pod(&["nginx"], &[])))
            .await;

        assert!(document.is_empty());
        assert_eq!(
            notifier.messages(),
            vec!["mirror/nginx does not exist in private registry"]
        );
    }

    #[tokio::test]
    async fn validation_reports_first_untrusted_image() {
        let (pipeline, notifier) = legacy_pipeline(settings(), StaticRegistry::default());
        let trusted = format!("{TRUSTED}/nginx");
        let workload = Workload::from_pod(&pod(
            &[trusted.as_str(), trusted.as_str()],
            &[trusted.as_str(), "mysql", "redis"],
        ));

        let verdict = pipeline.validate(&workload).await;
        assert_eq!(
            verdict,
            Verdict::Denied {
                image: "mysql".into(),
                message: "Image is not being pulled from Private Registry: mysql".into(),
            }
        );
        assert_eq!(
            notifier.messages(),
            vec!["Image is not being pulled from Private Registry: mysql"]
        );
    }

    #[tokio::test]
    async fn validation_checks_containers_before_init_containers() {
        let (pipeline, _) = legacy_pipeline(settings(), StaticRegistry::default());
        let workload = Workload::from_pod(&pod(&["nginx"], &["mysql"]));

        assert!(matches!(
            pipeline.validate(&workload).await,
            Verdict::Denied { image, .. } if image == "nginx"
        ));
    }
}
