//! # Resource Reference Resolution
//!
//! Resolves [`ResourceRef`]s to strings, and the git credentials a Stack
//! points at either inline (`gitAuth`) or through a legacy `gitAuthSecret`.

use crate::constants::{
    GIT_SECRET_ACCESS_TOKEN, GIT_SECRET_PASSWORD, GIT_SECRET_SSH_PRIVATE_KEY, GIT_SECRET_USERNAME,
};
use crate::controller::reconciler::store::{ResourceStore, StoreError};
use crate::crd::{GitRepo, ResourceRef};
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("missing value for environment variable: {0}")]
    EnvNotSet(String),
    #[error("reading path {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("configmap {namespace}/{name} not found")]
    ConfigMapNotFound { namespace: String, name: String },
    #[error("no key {key} found in secret {namespace}/{name}")]
    SecretKeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("resolving {name}: {source}")]
    Named {
        name: String,
        #[source]
        source: Box<ResolveError>,
    },
    #[error("gitAuth config must specify exactly one of 'accessToken', 'sshAuth' or 'basicAuth'")]
    IncompleteGitAuth,
    #[error("creating gitAuth: missing '{GIT_SECRET_PASSWORD}' secret entry")]
    MissingGitPassword,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    fn named(name: impl Into<String>, source: ResolveError) -> Self {
        Self::Named {
            name: name.into(),
            source: Box::new(source),
        }
    }
}

/// Credentials used to fetch a git source
#[derive(Clone)]
pub enum GitAuth {
    Ssh {
        private_key: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
    Token(Zeroizing<String>),
    Basic {
        username: String,
        password: Zeroizing<String>,
    },
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh { passphrase, .. } => f
                .debug_struct("Ssh")
                .field("private_key", &"***")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"***").finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Resolves references on behalf of one Stack
///
/// Secret references without a namespace default to the Stack's namespace.
pub struct ResourceRefResolver<'a> {
    store: &'a dyn ResourceStore,
    namespace: &'a str,
}

impl std::fmt::Debug for ResourceRefResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRefResolver")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<'a> ResourceRefResolver<'a> {
    pub fn new(store: &'a dyn ResourceStore, namespace: &'a str) -> Self {
        Self { store, namespace }
    }

    pub async fn resolve(&self, reference: &ResourceRef) -> Result<String, ResolveError> {
        match reference {
            ResourceRef::Literal { literal } => Ok(literal.value.clone()),
            ResourceRef::Env { env } => std::env::var(&env.name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ResolveError::EnvNotSet(env.name.clone())),
            ResourceRef::FileSystem { filesystem } => tokio::fs::read_to_string(&filesystem.path)
                .await
                .map_err(|source| ResolveError::File {
                    path: filesystem.path.clone(),
                    source,
                }),
            ResourceRef::Secret { secret } => {
                let namespace = secret
                    .namespace
                    .as_deref()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(self.namespace);
                let data = self
                    .store
                    .get_secret(namespace, &secret.name)
                    .await?
                    .ok_or_else(|| ResolveError::SecretNotFound {
                        namespace: namespace.to_string(),
                        name: secret.name.clone(),
                    })?;
                data.get(&secret.key)
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .ok_or_else(|| ResolveError::SecretKeyNotFound {
                        namespace: namespace.to_string(),
                        name: secret.name.clone(),
                        key: secret.key.clone(),
                    })
            }
        }
    }

    /// Resolve a map of named references; the first failure is reported under its name
    pub async fn resolve_all(
        &self,
        references: &BTreeMap<String, ResourceRef>,
    ) -> Result<BTreeMap<String, String>, ResolveError> {
        let mut resolved = BTreeMap::new();
        for (name, reference) in references {
            let value = self
                .resolve(reference)
                .await
                .map_err(|e| ResolveError::named(name.clone(), e))?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Git credentials for `repo`, `None` for anonymous access
    ///
    /// Inline `gitAuth` wins over `gitAuthSecret` and must set exactly one
    /// variant. In the legacy secret, SSH takes precedence over a token, and a
    /// token over basic auth.
    pub async fn resolve_git_auth(&self, repo: &GitRepo) -> Result<Option<GitAuth>, ResolveError> {
        if let Some(auth) = &repo.git_auth {
            let variants = [
                auth.ssh_auth.is_some(),
                auth.access_token.is_some(),
                auth.basic_auth.is_some(),
            ];
            if variants.iter().filter(|set| **set).count() != 1 {
                return Err(ResolveError::IncompleteGitAuth);
            }
            if let Some(ssh) = &auth.ssh_auth {
                let private_key = self
                    .resolve(&ssh.ssh_private_key)
                    .await
                    .map_err(|e| ResolveError::named("gitAuth SSH private key", e))?;
                let passphrase = match &ssh.password {
                    Some(reference) => Some(Zeroizing::new(
                        self.resolve(reference)
                            .await
                            .map_err(|e| ResolveError::named("gitAuth SSH password", e))?,
                    )),
                    None => None,
                };
                return Ok(Some(GitAuth::Ssh {
                    private_key: Zeroizing::new(private_key),
                    passphrase,
                }));
            }
            if let Some(token) = &auth.access_token {
                let token = self
                    .resolve(token)
                    .await
                    .map_err(|e| ResolveError::named("gitAuth access token", e))?;
                return Ok(Some(GitAuth::Token(Zeroizing::new(token))));
            }
            let basic = auth
                .basic_auth
                .as_ref()
                .ok_or(ResolveError::IncompleteGitAuth)?;
            let username = self
                .resolve(&basic.user_name)
                .await
                .map_err(|e| ResolveError::named("gitAuth username", e))?;
            let password = self
                .resolve(&basic.password)
                .await
                .map_err(|e| ResolveError::named("gitAuth password", e))?;
            return Ok(Some(GitAuth::Basic {
                username,
                password: Zeroizing::new(password),
            }));
        }

        let Some(secret_name) = repo.git_auth_secret.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let data = self
            .store
            .get_secret(self.namespace, secret_name)
            .await?
            .ok_or_else(|| ResolveError::SecretNotFound {
                namespace: self.namespace.to_string(),
                name: secret_name.to_string(),
            })?;
        git_auth_from_secret(&data)
    }
}

fn git_auth_from_secret(data: &BTreeMap<String, Vec<u8>>) -> Result<Option<GitAuth>, ResolveError> {
    let text = |key: &str| {
        data.get(key)
            .map(|v| Zeroizing::new(String::from_utf8_lossy(v).into_owned()))
    };

    if let Some(private_key) = text(GIT_SECRET_SSH_PRIVATE_KEY) {
        return Ok(Some(GitAuth::Ssh {
            private_key,
            passphrase: text(GIT_SECRET_PASSWORD),
        }));
    }
    if let Some(token) = text(GIT_SECRET_ACCESS_TOKEN) {
        return Ok(Some(GitAuth::Token(token)));
    }
    if let Some(username) = text(GIT_SECRET_USERNAME) {
        let password = text(GIT_SECRET_PASSWORD).ok_or(ResolveError::MissingGitPassword)?;
        return Ok(Some(GitAuth::Basic {
            username: (*username).clone(),
            password,
        }));
    }
    Ok(None)
}
