//! Publication and action registries.
//!
//! Both are plain name-keyed maps populated by explicit registration calls at
//! startup and immutable afterwards: the registry moves into the gateway by
//! value, so nothing can register late. Duplicate names are rejected at
//! registration time, not discovered at dispatch time.

use crate::error::{GatewayError, Result};
use crate::identity::IdentityData;
use crate::types::{ActionResult, PublicationResult, QueryParams};
use std::collections::HashMap;

pub type AuthorizeFn = Box<dyn Fn(&QueryParams, &IdentityData) -> Result<bool> + Send + Sync>;
pub type SharedExecFn = Box<dyn Fn(&QueryParams) -> Result<PublicationResult> + Send + Sync>;
pub type ScopedExecFn =
    Box<dyn Fn(&QueryParams, &IdentityData) -> Result<PublicationResult> + Send + Sync>;
pub type ActionExecFn =
    Box<dyn Fn(&QueryParams, &IdentityData) -> Result<ActionResult> + Send + Sync>;

/// How a publication executes, decided once at registration.
pub enum PublicationExec {
    /// One result for everyone with the same params.
    Shared(SharedExecFn),
    /// Result depends on the subscribing identity; the identity id joins the
    /// query digest, so different identities get different queries.
    IdentityScoped(ScopedExecFn),
}

/// A named data source clients subscribe to.
pub struct Publication {
    name: String,
    authorize: Option<AuthorizeFn>,
    exec: PublicationExec,
}

impl Publication {
    pub fn shared(
        name: impl Into<String>,
        exec: impl Fn(&QueryParams) -> Result<PublicationResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            authorize: None,
            exec: PublicationExec::Shared(Box::new(exec)),
        }
    }

    pub fn identity_scoped(
        name: impl Into<String>,
        exec: impl Fn(&QueryParams, &IdentityData) -> Result<PublicationResult>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            authorize: None,
            exec: PublicationExec::IdentityScoped(Box::new(exec)),
        }
    }

    pub fn with_authorize(
        mut self,
        authorize: impl Fn(&QueryParams, &IdentityData) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.authorize = Some(Box::new(authorize));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_identity_scoped(&self) -> bool {
        matches!(self.exec, PublicationExec::IdentityScoped(_))
    }

    pub fn exec(&self) -> &PublicationExec {
        &self.exec
    }

    /// Run the authorize hook; absent hook means allowed.
    pub fn authorize(&self, params: &QueryParams, identity: &IdentityData) -> Result<bool> {
        match &self.authorize {
            Some(hook) => hook(params, identity),
            None => Ok(true),
        }
    }
}

/// A named mutating operation clients invoke. Reports which tags its
/// mutation affected so dependent queries re-execute.
pub struct Action {
    name: String,
    authorize: Option<AuthorizeFn>,
    exec: ActionExecFn,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        exec: impl Fn(&QueryParams, &IdentityData) -> Result<ActionResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            authorize: None,
            exec: Box::new(exec),
        }
    }

    pub fn with_authorize(
        mut self,
        authorize: impl Fn(&QueryParams, &IdentityData) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.authorize = Some(Box::new(authorize));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authorize(&self, params: &QueryParams, identity: &IdentityData) -> Result<bool> {
        match &self.authorize {
            Some(hook) => hook(params, identity),
            None => Ok(true),
        }
    }

    pub fn exec(&self, params: &QueryParams, identity: &IdentityData) -> Result<ActionResult> {
        (self.exec)(params, identity)
    }
}

/// Everything the server can do for clients, registered once at startup.
#[derive(Default)]
pub struct Registry {
    publications: HashMap<String, Publication>,
    actions: HashMap<String, Action>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_publication(&mut self, publication: Publication) -> Result<()> {
        if self.publications.contains_key(publication.name()) {
            return Err(GatewayError::DuplicatePublication(
                publication.name().to_string(),
            ));
        }
        self.publications
            .insert(publication.name().to_string(), publication);
        Ok(())
    }

    pub fn add_action(&mut self, action: Action) -> Result<()> {
        if self.actions.contains_key(action.name()) {
            return Err(GatewayError::DuplicateAction(action.name().to_string()));
        }
        self.actions.insert(action.name().to_string(), action);
        Ok(())
    }

    pub fn publication(&self, name: &str) -> Option<&Publication> {
        self.publications.get(name)
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }
}
