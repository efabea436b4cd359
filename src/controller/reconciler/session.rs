//! # Reconcile Session
//!
//! State for one reconciliation pass of one Stack: a snapshot of the object,
//! the workspace holding its program and the revision that workspace came
//! from. The workspace is exclusive to the pass and removed when the session
//! is cleaned up (or dropped).

use crate::constants::{ACCESS_TOKEN_SECRET_KEY, ENV_ACCESS_TOKEN, ENV_BACKEND_URL};
use crate::controller::reconciler::events::StackEvent;
use crate::controller::reconciler::resolver::{ResolveError, ResourceRefResolver};
use crate::controller::reconciler::source::{SourceError, SourceSpec, Workspace};
use crate::controller::reconciler::stack_config;
use crate::controller::reconciler::store::StackKey;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::{Stack, StackSource};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub struct ReconcileSession<'a> {
    ctx: &'a Reconciler,
    stack: Stack,
    key: StackKey,
    workspace: Workspace,
    revision: String,
}

impl std::fmt::Debug for ReconcileSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileSession")
            .field("key", &self.key)
            .field("workspace", &self.workspace)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl<'a> ReconcileSession<'a> {
    /// Fetch the Stack's source into a fresh workspace and seed its environment
    ///
    /// Failures publish `GitAuthenticationFailure` (credentials could not be
    /// resolved) or `InitializationFailure` (anything else) before returning.
    pub async fn acquire(ctx: &'a Reconciler, stack: Stack) -> Result<Self, ReconcilerError> {
        let key = StackKey::from_stack(&stack);
        let resolver = ResourceRefResolver::new(ctx.store.as_ref(), &key.namespace);

        let acquired = match stack.spec.source()? {
            StackSource::Git(repo) => {
                let auth = match resolver.resolve_git_auth(repo).await {
                    Ok(auth) => auth,
                    Err(e) => {
                        ctx.events
                            .publish(
                                &stack,
                                StackEvent::GitAuthenticationFailure,
                                format!("Failed to setup git authentication: {e}"),
                            )
                            .await;
                        return Err(e.into());
                    }
                };
                ctx.sources
                    .acquire(
                        SourceSpec::Git {
                            repo,
                            auth: auth.as_ref(),
                        },
                        stack.spec.repo_dir.as_deref(),
                    )
                    .await
            }
            StackSource::Artifact(source_ref) => {
                match ctx.store.get_source_object(&key.namespace, source_ref).await {
                    Ok(Some(object)) => {
                        ctx.sources
                            .acquire(
                                SourceSpec::Artifact { object: &object },
                                stack.spec.repo_dir.as_deref(),
                            )
                            .await
                    }
                    Ok(None) => Err(SourceError::InvalidSourceObject(format!(
                        "{} {}/{} not found",
                        source_ref.kind, key.namespace, source_ref.name
                    ))),
                    Err(e) => {
                        initialization_failure(ctx, &stack, &e).await;
                        return Err(e.into());
                    }
                }
            }
        };

        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                initialization_failure(ctx, &stack, &e).await;
                return Err(e.into());
            }
        };

        let mut session = Self {
            ctx,
            stack,
            key,
            workspace: acquired.workspace,
            revision: acquired.revision,
        };
        if let Err(e) = session.seed_environment().await {
            initialization_failure(ctx, &session.stack, &e).await;
            return Err(e.into());
        }
        info!(
            stack = %session.key,
            revision = %session.revision,
            "Workspace ready"
        );
        Ok(session)
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn key(&self) -> &StackKey {
        &self.key
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Fully qualified engine stack name
    pub fn stack_name(&self) -> &str {
        &self.stack.spec.stack
    }

    fn resolver(&self) -> ResourceRefResolver<'_> {
        ResourceRefResolver::new(self.ctx.store.as_ref(), &self.key.namespace)
    }

    /// Backend URL, access token and `envRefs`
    async fn seed_environment(&mut self) -> Result<(), ResolveError> {
        let mut env = BTreeMap::new();
        if let Some(backend) = self.stack.spec.backend.as_deref().filter(|b| !b.is_empty()) {
            env.insert(ENV_BACKEND_URL.to_string(), backend.to_string());
        }
        if let Some(token) = self.access_token().await? {
            env.insert(ENV_ACCESS_TOKEN.to_string(), token);
        }
        env.extend(self.resolver().resolve_all(&self.stack.spec.env_refs).await?);
        self.workspace.set_env_vars(env);
        Ok(())
    }

    /// Token from `accessTokenSecret`; a missing Secret or key is not an error
    async fn access_token(&self) -> Result<Option<String>, ResolveError> {
        let Some(name) = self
            .stack
            .spec
            .access_token_secret
            .as_deref()
            .filter(|n| !n.is_empty())
        else {
            return Ok(None);
        };
        let Some(data) = self.ctx.store.get_secret(&self.key.namespace, name).await? else {
            warn!(stack = %self.key, secret = name, "Access token secret not found, continuing without it");
            return Ok(None);
        };
        match data.get(ACCESS_TOKEN_SECRET_KEY) {
            Some(token) if !token.is_empty() => {
                Ok(Some(String::from_utf8_lossy(token).into_owned()))
            }
            _ => {
                warn!(
                    stack = %self.key,
                    secret = name,
                    key = ACCESS_TOKEN_SECRET_KEY,
                    "Access token secret has no token, continuing without it"
                );
                Ok(None)
            }
        }
    }

    /// Select or create the engine stack and apply settings, config and dependencies
    pub async fn ensure_stack(&self) -> Result<(), ReconcilerError> {
        let result = self.try_ensure_stack().await;
        if let Err(e) = &result {
            self.ctx
                .events
                .publish(
                    &self.stack,
                    StackEvent::InitializationFailure,
                    format!("Failed to initialize stack: {e}"),
                )
                .await;
        }
        result
    }

    async fn try_ensure_stack(&self) -> Result<(), ReconcilerError> {
        let driver = self.ctx.driver.as_ref();
        let spec = &self.stack.spec;
        let name = self.stack_name();

        driver
            .select_stack(&self.workspace, name, !spec.use_local_stack_only)
            .await?;

        match driver.get_all_config(&self.workspace, name).await {
            Ok(current) => debug!(
                stack = %self.key,
                keys = ?current.keys().collect::<Vec<_>>(),
                "Current stack config"
            ),
            Err(e) => warn!(stack = %self.key, error = %e, "Could not read current stack config"),
        }

        driver
            .save_stack_settings(&self.workspace, name, spec.secrets_provider.as_deref())
            .await?;

        let secret_refs = self.resolver().resolve_all(&spec.secret_refs).await?;
        let config = stack_config::assemble(spec, secret_refs);
        driver.set_all_config(&self.workspace, name, &config).await?;

        driver.install_dependencies(&self.workspace).await?;
        Ok(())
    }

    /// Export the data of legacy `envs` ConfigMaps and `envSecrets` Secrets
    ///
    /// Variables already set from `envRefs` are kept.
    pub async fn inject_legacy_envs(&mut self) -> Result<(), ReconcilerError> {
        let namespace = self.key.namespace.as_str();
        let mut legacy: BTreeMap<String, String> = BTreeMap::new();

        for name in &self.stack.spec.envs {
            let data = self
                .ctx
                .store
                .get_config_map(namespace, name)
                .await
                .map_err(ResolveError::from)?
                .ok_or_else(|| ResolveError::ConfigMapNotFound {
                    namespace: namespace.to_string(),
                    name: name.clone(),
                })?;
            legacy.extend(data);
        }
        for name in &self.stack.spec.secret_envs {
            let data = self
                .ctx
                .store
                .get_secret(namespace, name)
                .await
                .map_err(ResolveError::from)?
                .ok_or_else(|| ResolveError::SecretNotFound {
                    namespace: namespace.to_string(),
                    name: name.clone(),
                })?;
            legacy.extend(
                data.into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned())),
            );
        }

        legacy.retain(|name, _| {
            let shadowed = self.stack.spec.env_refs.contains_key(name);
            if shadowed {
                warn!(stack = %self.key, variable = %name, "envRefs value overrides legacy envs entry");
            }
            !shadowed
        });
        self.workspace.set_env_vars(legacy);
        Ok(())
    }

    /// Destroy the managed infrastructure and remove the engine stack, when requested
    pub async fn finalize(&self) -> Result<(), ReconcilerError> {
        if !self.stack.spec.destroy_on_finalize {
            info!(stack = %self.key, "Finalizing without destroy");
            return Ok(());
        }
        info!(stack = %self.key, stack.name = %self.stack_name(), "Destroying stack resources");
        let driver = self.ctx.driver.as_ref();
        driver.destroy(&self.workspace, self.stack_name()).await?;
        driver.remove_stack(&self.workspace, self.stack_name()).await?;
        info!(stack = %self.key, "Stack destroyed and removed");
        Ok(())
    }

    pub fn cleanup(self) {
        self.workspace.cleanup();
    }
}

async fn initialization_failure(
    ctx: &Reconciler,
    stack: &Stack,
    error: &(dyn std::fmt::Display + Sync),
) {
    ctx.events
        .publish(
            stack,
            StackEvent::InitializationFailure,
            format!("Failed to initialize stack: {error}"),
        )
        .await;
}
