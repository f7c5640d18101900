//! Deployment description: which actor functions run on which hosts.

use std::{collections::BTreeMap, future::Future, path::Path, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::{
    context::ActorContext,
    error::{read_file, SimError},
};

/// Actor function which can be referenced from a deployment description.
pub type ActorFunction = Rc<dyn Fn(ActorContext, Vec<String>) -> LocalBoxFuture<'static, ()>>;

/// Actor started by a deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActorDeployment {
    /// Actor name, the function name by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of a function from the [FunctionRegistry].
    pub function: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_time: Option<f64>,
    #[serde(default)]
    pub daemon: bool,
    /// Start the actor again when its host is turned back on after a failure.
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ActorDeployment {
    pub fn new(function: &str, host: &str) -> Self {
        Self {
            name: None,
            function: function.to_string(),
            host: host.to_string(),
            args: Vec::new(),
            start_time: None,
            kill_time: None,
            daemon: false,
            auto_restart: false,
            properties: BTreeMap::new(),
        }
    }
}

/// Description of the actors started at the beginning of a simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub actors: Vec<ActorDeployment>,
}

impl DeploymentConfig {
    /// Reads deployment description from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(file: P) -> Result<Self, SimError> {
        Self::from_yaml_str(&read_file(file.as_ref())?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SimError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String, SimError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Named actor functions available to deployments.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, ActorFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function receiving the actor context and the deployment arguments.
    pub fn register<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(ActorContext, Vec<String>) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.functions
            .insert(name.to_string(), Rc::new(move |ctx, args| f(ctx, args).boxed_local()));
    }

    pub fn get(&self, name: &str) -> Result<ActorFunction, SimError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::UnknownFunction(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|name| name.as_str())
    }
}
