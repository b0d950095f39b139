//! Remote image existence checks
//!
//! Rules with `condition: Exists` and the `--if-exists` mutation gate need to
//! know whether an image reference resolves in its registry. [`RegistryLookup`]
//! is that capability; [`HttpRegistry`] implements it against the OCI
//! distribution API with anonymous or basic-auth bearer tokens.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const DOCKER_HUB: &str = "index.docker.io";
const DEFAULT_TAG: &str = "latest";
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Answers whether an image exists in its registry
///
/// Implementations must not fail: anything that prevents a positive answer is
/// reported as `false`.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn exists(&self, image: &str) -> bool;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid repository {0:?}")]
    Repository(String),
    #[error("invalid tag {0:?}")]
    Tag(String),
    #[error("invalid digest {0:?}")]
    Digest(String),
}

/// An image reference split into the parts the registry API needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageReference {
    fn scheme(&self) -> &'static str {
        let host = self.registry.split(':').next().unwrap_or_default();
        if host == "localhost" || host == "127.0.0.1" {
            "http"
        } else {
            "https"
        }
    }

    pub fn manifest_url(&self) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme(),
            self.registry,
            self.repository,
            self.reference
        )
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.reference.contains(':') { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.reference
        )
    }
}

fn is_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                })
        })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty() && !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(image: &str) -> Result<Self, Self::Err> {
        if image.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (image, None),
        };

        let (name, tag) = match name.rfind(':') {
            Some(idx) if !name[idx + 1..].contains('/') => (&name[..idx], Some(&name[idx + 1..])),
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry(first) => (first, rest.to_string()),
            _ => (DOCKER_HUB, name.to_string()),
        };
        let registry = if registry == "docker.io" {
            DOCKER_HUB
        } else {
            registry
        };
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if !valid_repository(&repository) {
            return Err(ReferenceError::Repository(repository));
        }
        if let Some(tag) = tag
            && !valid_tag(tag)
        {
            return Err(ReferenceError::Tag(tag.to_string()));
        }
        if let Some(digest) = digest
            && !valid_digest(digest)
        {
            return Err(ReferenceError::Digest(digest.to_string()));
        }

        let reference = digest.or(tag).unwrap_or(DEFAULT_TAG).to_string();
        Ok(Self {
            registry: registry.to_string(),
            repository,
            reference,
        })
    }
}

/// Basic credentials presented when a registry asks for them
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
enum LookupError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unsupported authentication challenge {0:?}")]
    Challenge(String),
    #[error("token response carried no token")]
    MissingToken,
}

/// A parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in auth_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self::Bearer {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Splits `key="value",key2=value2` pairs, honouring commas inside quotes
fn auth_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut quoted = false;

    for c in params.chars() {
        match c {
            '"' if in_value => quoted = !quoted,
            '=' if !in_value => in_value = true,
            ',' if !quoted => {
                pairs.push((key.trim().to_string(), value.trim().to_string()));
                key.clear();
                value.clear();
                in_value = false;
            }
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    pairs
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client speaking the distribution API over HTTP
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    credentials: Option<Credentials>,
}

impl HttpRegistry {
    /// Creates a client whose requests give up after `timeout`
    pub fn new(timeout: Duration, credentials: Option<Credentials>) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn manifest_request(&self, reference: &ImageReference) -> RequestBuilder {
        self.client
            .head(reference.manifest_url())
            .header(ACCEPT, MANIFEST_TYPES)
    }

    async fn token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
        reference: &ImageReference,
    ) -> Result<String, LookupError> {
        let default_scope = format!("repository:{}:pull", reference.repository);
        let mut query = vec![("scope", scope.unwrap_or(default_scope.as_str()))];
        if let Some(service) = service {
            query.push(("service", service));
        }

        let mut request = self.client.get(realm).query(&query);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let body: TokenResponse = request.send().await?.error_for_status()?.json().await?;
        body.token
            .or(body.access_token)
            .ok_or(LookupError::MissingToken)
    }

    async fn check(&self, reference: &ImageReference) -> Result<bool, LookupError> {
        let response = self.manifest_request(reference).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response.status().is_success());
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let retry = match Challenge::parse(&header) {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let token = self
                    .token(&realm, service.as_deref(), scope.as_deref(), reference)
                    .await?;
                self.manifest_request(reference).bearer_auth(token)
            }
            Some(Challenge::Basic) => match &self.credentials {
                Some(credentials) => self
                    .manifest_request(reference)
                    .basic_auth(&credentials.username, Some(&credentials.password)),
                None => return Ok(false),
            },
            None => return Err(LookupError::Challenge(header)),
        };

        Ok(retry.send().await?.status().is_success())
    }
}

#[async_trait]
impl RegistryLookup for HttpRegistry {
    async fn exists(&self, image: &str) -> bool {
        let reference = match image.parse::<ImageReference>() {
            Ok(reference) => reference,
            Err(err) => {
                warn!(image = %image, error = %err, "could not parse image");
                return false;
            }
        };

        match self.check(&reference).await {
            Ok(found) => {
                debug!(image = %image, reference = %reference, found, "checked registry");
                found
            }
            Err(err) => {
                warn!(image = %image, error = %err, "could not fetch image");
                false
            }
        }
    }
}

/// In-memory registry for tests, counting lookups
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct StaticRegistry {
    images: std::collections::HashSet<String>,
    lookups: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StaticRegistry {
    pub(crate) fn with_images<const N: usize>(images: [&str; N]) -> Self {
        Self {
            images: images.into_iter().map(String::from).collect(),
            lookups: Default::default(),
        }
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl RegistryLookup for StaticRegistry {
    async fn exists(&self, image: &str) -> bool {
        self.lookups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.images.contains(image)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use warp::http::StatusCode as WarpStatus;
    use warp::{Filter, Reply};

    use super::*;

    #[test]
    fn parses_docker_hub_shorthand() {
        let reference: ImageReference = "nginx".parse().unwrap();
        assert_eq!(reference.registry, "index.docker.io");
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.reference, "latest");
        assert_eq!(
            reference.manifest_url(),
            "https://index.docker.io/v2/library/nginx/manifests/latest"
        );
    }

    #[test]
    fn parses_user_repository_with_tag() {
        let reference: ImageReference = "jainishshah17/nginx:notexist".parse().unwrap();
        assert_eq!(reference.registry, "index.docker.io");
        assert_eq!(reference.repository, "jainishshah17/nginx");
        assert_eq!(reference.reference, "notexist");
    }

    #[test]
    fn parses_registry_with_port_and_digest() {
        let digest = "sha256:0123456789abcdef";
        let reference: ImageReference = format!("localhost:5000/team/app@{digest}")
            .parse()
            .unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.reference, digest);
        assert_eq!(
            reference.manifest_url(),
            format!("http://localhost:5000/v2/team/app/manifests/{digest}")
        );
        assert_eq!(reference.to_string(), format!("localhost:5000/team/app@{digest}"));
    }

    #[test]
    fn normalises_docker_io() {
        let reference: ImageReference = "docker.io/redis:7".parse().unwrap();
        assert_eq!(reference.registry, "index.docker.io");
        assert_eq!(reference.repository, "library/redis");
    }

    #[test]
    fn rejects_malformed_references() {
        assert_eq!("".parse::<ImageReference>(), Err(ReferenceError::Empty));
        assert!(matches!(
            "doesn't parse".parse::<ImageReference>(),
            Err(ReferenceError::Repository(_))
        ));
        assert!(matches!(
            "Upper/Case".parse::<ImageReference>(),
            Err(ReferenceError::Repository(_))
        ));
        assert!(matches!(
            "nginx:-bad".parse::<ImageReference>(),
            Err(ReferenceError::Tag(_))
        ));
        assert!(matches!(
            "nginx@sha256".parse::<ImageReference>(),
            Err(ReferenceError::Digest(_))
        ));
    }

    #[test]
    fn parses_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        );
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".into(),
                service: Some("registry.docker.io".into()),
                scope: Some("repository:library/nginx:pull,push".into()),
            })
        );
        assert_eq!(Challenge::parse("Basic realm=\"x\""), Some(Challenge::Basic));
        assert_eq!(Challenge::parse("Negotiate"), None);
        assert_eq!(Challenge::parse("Bearer service=\"x\""), None);
    }

    /// Serves `library/nginx:latest` anonymously and `private/app:1.0` behind
    /// a bearer token, everything else is unknown.
    async fn fake_registry() -> SocketAddr {
        let public = warp::head()
            .and(warp::path!("v2" / "library" / "nginx" / "manifests" / "latest"))
            .map(warp::reply);

        let private = warp::head()
            .and(warp::path!("v2" / "private" / "app" / "manifests" / "1.0"))
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::header::<String>("host"))
            .map(|auth: Option<String>, host: String| {
                if auth.as_deref() == Some("Bearer secret-token") {
                    return warp::reply::with_status(warp::reply(), WarpStatus::OK)
                        .into_response();
                }
                let challenge = format!(
                    r#"Bearer realm="http://{host}/token",service="fake",scope="repository:private/app:pull""#
                );
                warp::reply::with_header(
                    warp::reply::with_status(warp::reply(), WarpStatus::UNAUTHORIZED),
                    "www-authenticate",
                    challenge,
                )
                .into_response()
            });

        let token = warp::get()
            .and(warp::path("token"))
            .and(warp::query::<std::collections::HashMap<String, String>>())
            .map(|query: std::collections::HashMap<String, String>| {
                assert_eq!(
                    query.get("scope").map(String::as_str),
                    Some("repository:private/app:pull")
                );
                warp::reply::json(&serde_json::json!({ "token": "secret-token" }))
            });

        let missing =
            warp::any().map(|| warp::reply::with_status(warp::reply(), WarpStatus::NOT_FOUND));

        let (addr, server) = warp::serve(public.or(private).or(token).or(missing))
            .bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn client() -> HttpRegistry {
        HttpRegistry::new(Duration::from_secs(5), None).unwrap()
    }

    #[tokio::test]
    async fn finds_existing_image() {
        let addr = fake_registry().await;
        assert!(client().exists(&format!("{addr}/library/nginx")).await);
    }

    #[tokio::test]
    async fn missing_image_does_not_exist() {
        let addr = fake_registry().await;
        assert!(!client().exists(&format!("{addr}/jainishshah17/nginx:notexist")).await);
    }

    #[tokio::test]
    async fn follows_bearer_challenge() {
        let addr = fake_registry().await;
        assert!(client().exists(&format!("{addr}/private/app:1.0")).await);
    }

    #[tokio::test]
    async fn unparseable_image_does_not_exist() {
        assert!(!client().exists("doesn't parse").await);
    }

    #[tokio::test]
    async fn unreachable_registry_does_not_exist() {
        let registry = HttpRegistry::new(Duration::from_millis(500), None).unwrap();
        assert!(!registry.exists("127.0.0.1:1/library/nginx").await);
    }
}
