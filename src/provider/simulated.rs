//! File-backed simulated provider.
//!
//! Serves every capability trait from an in-memory model that is written to
//! a JSON snapshot after each mutation. The CLI uses it as the compute
//! backend; tests use it for multi-step scenarios, with faults and
//! interleaved state changes injected per operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{IngressRule, TargetKind, UserDataHash};
use crate::error::{ConvergeError, ProviderError, Result};
use crate::tags::Tags;

use super::api::{
    AutoScalingApi, InstanceApi, LaunchTemplateApi, LoadBalancerApi, NetworkApi, ObjectStoreApi,
    SecretsApi, TaggingApi,
};
use super::types::{
    AutoScalingGroup, GroupSettings, Image, ImageFilter, Instance, InstanceFilter,
    InstanceRefresh, InstanceState, LaunchTemplate, LaunchTemplateData, LaunchTemplateVersion,
    LoadBalancer, LoadBalancerTarget, NetworkInterface, ProviderRefreshStatus, RefreshPreferences,
    SecurityGroup, TargetHealth, TargetHealthState, TemplateRef, Vpc,
};

/// One-shot mutation run when an operation is called.
pub type StateHook = Box<dyn FnOnce(&mut SimulatedState) + Send>;

/// Region used in generated ARNs.
const DEFAULT_REGION: &str = "us-east-1";

/// Account used in generated ARNs.
const ACCOUNT_ID: &str = "000000000000";

/// A launch template together with its versions and idempotency tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTemplate {
    template: LaunchTemplate,
    versions: BTreeMap<u64, LaunchTemplateVersion>,
    next_version: u64,
    create_token: String,
    #[serde(default)]
    version_tokens: BTreeMap<String, u64>,
}

/// A load balancer together with its registered targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLoadBalancer {
    load_balancer: LoadBalancer,
    #[serde(default)]
    targets: BTreeMap<String, TargetHealthState>,
}

/// Provider-side truth held by the simulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedState {
    #[serde(default)]
    launch_templates: BTreeMap<String, StoredTemplate>,
    #[serde(default)]
    images: Vec<Image>,
    #[serde(default)]
    instances: BTreeMap<String, Instance>,
    #[serde(default)]
    groups: BTreeMap<String, AutoScalingGroup>,
    #[serde(default)]
    refreshes: Vec<InstanceRefresh>,
    #[serde(default)]
    load_balancers: BTreeMap<String, StoredLoadBalancer>,
    #[serde(default)]
    vpcs: BTreeMap<String, Vpc>,
    #[serde(default)]
    security_groups: BTreeMap<String, SecurityGroup>,
    #[serde(default)]
    tags: BTreeMap<String, Tags>,
    #[serde(default)]
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    #[serde(default)]
    interfaces: BTreeMap<String, NetworkInterface>,
    #[serde(default)]
    secrets: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Injections {
    faults: HashMap<String, VecDeque<ProviderError>>,
    hooks: HashMap<String, Vec<(u32, StateHook)>>,
    calls: HashMap<String, u32>,
}

/// Simulated cloud provider.
pub struct SimulatedProvider {
    state: Mutex<SimulatedState>,
    injections: Mutex<Injections>,
    snapshot: Option<PathBuf>,
    region: String,
}

fn new_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..17])
}

fn lb_key(kind: TargetKind, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Matches `name` against a pattern with `*` and `?` wildcards.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..])),
            (Some('?'), Some(_)) => matches(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    matches(&p, &n)
}

fn with_user_data_hash(data: &LaunchTemplateData, user_data: &[u8]) -> LaunchTemplateData {
    let mut data = data.clone();
    data.user_data_hash = (!user_data.is_empty()).then(|| UserDataHash::of(user_data));
    data
}

impl SimulatedState {
    fn tags_of(&self, resource_id: &str) -> Tags {
        self.tags.get(resource_id).cloned().unwrap_or_default()
    }

    fn resource_exists(&self, resource_id: &str) -> bool {
        self.launch_templates.contains_key(resource_id)
            || self.instances.contains_key(resource_id)
            || self.groups.contains_key(resource_id)
            || self.vpcs.contains_key(resource_id)
            || self.security_groups.contains_key(resource_id)
            || self.buckets.contains_key(resource_id)
            || self.secrets.contains_key(resource_id)
            || self
                .load_balancers
                .values()
                .any(|lb| lb.load_balancer.resource_id() == resource_id)
    }

    fn template_mut(&mut self, template_id: &str) -> Result<&mut StoredTemplate> {
        self.launch_templates
            .get_mut(template_id)
            .ok_or_else(|| ProviderError::not_found("launch template", template_id).into())
    }

    fn group_mut(&mut self, name: &str) -> Result<&mut AutoScalingGroup> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("autoscaling group", name).into())
    }

    fn load_balancer_for(&mut self, target: &LoadBalancerTarget) -> Result<&mut StoredLoadBalancer> {
        self.load_balancers
            .values_mut()
            .find(|lb| lb.load_balancer.target() == *target)
            .ok_or_else(|| ProviderError::not_found("load balancer", target.to_string()).into())
    }

    fn security_group_mut(&mut self, group_id: &str) -> Result<&mut SecurityGroup> {
        self.security_groups
            .get_mut(group_id)
            .ok_or_else(|| ProviderError::not_found("security group", group_id).into())
    }

    /// Registers a machine image.
    pub fn add_image(&mut self, image: Image) {
        self.images.push(image);
    }

    /// Launches an instance and returns its id.
    pub fn run_instance(&mut self, launch_template: Option<TemplateRef>, tags: Tags) -> String {
        let id = new_id("i");
        self.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                state: InstanceState::Running,
                launch_template,
                tags: Tags::new(),
            },
        );
        self.tags.insert(id.clone(), tags);
        self.attach_interface(&id, &[]);
        id
    }

    /// Attaches a network interface carrying `group_ids` to an instance.
    pub fn attach_interface(&mut self, instance_id: &str, group_ids: &[&str]) -> String {
        let id = new_id("eni");
        self.interfaces.insert(
            id.clone(),
            NetworkInterface {
                id: id.clone(),
                instance_id: instance_id.to_string(),
                security_group_ids: group_ids.iter().map(|g| (*g).to_string()).collect(),
            },
        );
        id
    }

    /// Returns the interfaces of an instance, ordered by id.
    #[must_use]
    pub fn interfaces_of(&self, instance_id: &str) -> Vec<NetworkInterface> {
        self.interfaces
            .values()
            .filter(|i| i.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Creates or overwrites a secret, bypassing the secrets API.
    pub fn insert_secret(&mut self, name: &str, value: &[u8], tags: Tags) {
        self.secrets.insert(name.to_string(), value.to_vec());
        self.tags.insert(name.to_string(), tags);
    }

    /// Returns the value of a secret.
    #[must_use]
    pub fn secret_value(&self, name: &str) -> Option<&[u8]> {
        self.secrets.get(name).map(Vec::as_slice)
    }

    /// Returns the names of all secrets.
    #[must_use]
    pub fn secret_names(&self) -> Vec<String> {
        self.secrets.keys().cloned().collect()
    }

    /// Changes the lifecycle state of an instance.
    pub fn set_instance_state(&mut self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Forgets an instance entirely, as the provider does some time after
    /// termination.
    pub fn purge_instance(&mut self, instance_id: &str) {
        self.instances.remove(instance_id);
        self.tags.remove(instance_id);
    }

    /// Adds an instance to an autoscaling group.
    pub fn attach_instance(&mut self, group: &str, instance_id: &str) {
        if let Some(group) = self.groups.get_mut(group) {
            group.instance_ids.push(instance_id.to_string());
        }
    }

    /// Records a refresh with the given status and start time.
    pub fn add_refresh(
        &mut self,
        group: &str,
        status: ProviderRefreshStatus,
        started_at: DateTime<Utc>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.refreshes.push(InstanceRefresh {
            id: id.clone(),
            group: group.to_string(),
            status,
            started_at,
            percentage_complete: 0,
            status_reason: None,
        });
        id
    }

    /// Moves a refresh to a new status.
    pub fn set_refresh_status(&mut self, refresh_id: &str, status: ProviderRefreshStatus) {
        if let Some(refresh) = self.refreshes.iter_mut().find(|r| r.id == refresh_id) {
            refresh.status = status;
            if status == ProviderRefreshStatus::Successful {
                refresh.percentage_complete = 100;
            }
        }
    }

    /// Overrides the health of a registered target.
    pub fn set_target_health(
        &mut self,
        target: &LoadBalancerTarget,
        instance_id: &str,
        state: TargetHealthState,
    ) {
        if let Ok(lb) = self.load_balancer_for(target) {
            lb.targets.insert(instance_id.to_string(), state);
        }
    }

    /// Points an autoscaling group at another launch template reference.
    pub fn set_group_template(&mut self, group: &str, template: TemplateRef) {
        if let Some(group) = self.groups.get_mut(group) {
            group.launch_template = template;
        }
    }

    /// Overwrites the tags of a resource, bypassing the tagging API.
    pub fn set_tags(&mut self, resource_id: &str, tags: Tags) {
        self.tags.insert(resource_id.to_string(), tags);
    }

    /// Creates a template version as the provider would, honouring client
    /// tokens already seen.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the template does not exist.
    pub fn insert_version(
        &mut self,
        template_id: &str,
        data: &LaunchTemplateData,
        user_data: &[u8],
        client_token: &str,
    ) -> Result<LaunchTemplateVersion> {
        let stored = self.template_mut(template_id)?;

        if let Some(existing) = stored
            .version_tokens
            .get(client_token)
            .and_then(|n| stored.versions.get(n))
        {
            return Ok(existing.clone());
        }

        let number = stored.next_version;
        stored.next_version += 1;
        let version = LaunchTemplateVersion {
            template_id: template_id.to_string(),
            number,
            data: with_user_data_hash(data, user_data),
            created_at: Utc::now(),
        };
        stored.versions.insert(number, version.clone());
        stored
            .version_tokens
            .insert(client_token.to_string(), number);
        stored.template.latest_version = number;
        Ok(version)
    }

    /// Creates an empty autoscaling group as the provider would.
    pub fn add_group(&mut self, name: &str, settings: &GroupSettings, tags: Tags) -> AutoScalingGroup {
        let group = AutoScalingGroup {
            name: name.to_string(),
            launch_template: settings.launch_template.clone(),
            min_size: settings.min_size,
            max_size: settings.max_size,
            desired_capacity: settings.desired_capacity,
            subnet_ids: settings.subnet_ids.clone(),
            suspended_processes: BTreeSet::new(),
            instance_ids: Vec::new(),
            created_at: Utc::now(),
        };
        self.groups.insert(name.to_string(), group.clone());
        self.tags.insert(name.to_string(), tags);
        group
    }

    /// Creates a VPC as the provider would.
    pub fn add_vpc(&mut self, cidr: &str, tags: Tags) -> String {
        let id = new_id("vpc");
        self.vpcs.insert(
            id.clone(),
            Vpc {
                id: id.clone(),
                cidr: cidr.to_string(),
                tags: Tags::new(),
            },
        );
        self.tags.insert(id.clone(), tags);
        id
    }

    /// Returns the ids of all VPCs.
    #[must_use]
    pub fn vpc_ids(&self) -> Vec<String> {
        self.vpcs.keys().cloned().collect()
    }

    /// Returns the number of VPCs.
    #[must_use]
    pub fn vpc_count(&self) -> usize {
        self.vpcs.len()
    }

    /// Creates an empty security group as the provider would.
    pub fn add_security_group(&mut self, vpc_id: &str, name: &str, tags: Tags) -> String {
        let id = new_id("sg");
        self.security_groups.insert(
            id.clone(),
            SecurityGroup {
                id: id.clone(),
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
                description: String::new(),
                ingress: BTreeSet::new(),
                tags: Tags::new(),
            },
        );
        self.tags.insert(id.clone(), tags);
        id
    }

    /// Returns the number of security groups in a VPC.
    #[must_use]
    pub fn security_group_count(&self, vpc_id: &str) -> usize {
        self.security_groups
            .values()
            .filter(|g| g.vpc_id == vpc_id)
            .count()
    }

    /// Returns the number of stored versions of a template.
    #[must_use]
    pub fn version_count(&self, template_id: &str) -> usize {
        self.launch_templates
            .get(template_id)
            .map_or(0, |t| t.versions.len())
    }

    fn describe_template(stored: &StoredTemplate) -> LaunchTemplate {
        let mut template = stored.template.clone();
        template.latest_version = stored.versions.keys().next_back().copied().unwrap_or(0);
        template
    }

    fn describe_instance(&self, instance: &Instance) -> Instance {
        let mut instance = instance.clone();
        instance.tags = self.tags_of(&instance.id);
        instance
    }
}

impl std::fmt::Debug for Injections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injections")
            .field("faults", &self.faults)
            .field("hooks", &self.hooks.values().map(Vec::len).sum::<usize>())
            .field("calls", &self.calls)
            .finish()
    }
}

impl std::fmt::Debug for SimulatedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProvider")
            .field("snapshot", &self.snapshot)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SimulatedProvider {
    /// Creates an empty provider that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SimulatedState::default()),
            injections: Mutex::new(Injections::default()),
            snapshot: None,
            region: String::from(DEFAULT_REGION),
        }
    }

    /// Opens the provider backed by a snapshot file, loading it if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            info!("Loading provider snapshot from: {}", path.display());
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                ConvergeError::internal(format!(
                    "Failed to parse provider snapshot {}: {e}",
                    path.display()
                ))
            })?
        } else {
            debug!("Provider snapshot does not exist yet: {}", path.display());
            SimulatedState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            injections: Mutex::new(Injections::default()),
            snapshot: Some(path),
            region: String::from(DEFAULT_REGION),
        })
    }

    /// Sets the region used in generated ARNs.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Returns the snapshot path, if persisted.
    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Makes the next call(s) to `operation` fail with `error`, once per
    /// injected fault.
    pub fn inject_fault(&self, operation: &str, error: ProviderError) {
        if let Ok(mut inj) = self.injections.lock() {
            inj.faults
                .entry(operation.to_string())
                .or_default()
                .push_back(error);
        }
    }

    /// Runs `hook` against the state when `operation` is called for the
    /// `nth` time (1-based), before the call itself is served.
    pub fn on_call(&self, operation: &str, nth: u32, hook: StateHook) {
        if let Ok(mut inj) = self.injections.lock() {
            inj.hooks
                .entry(operation.to_string())
                .or_default()
                .push((nth, hook));
        }
    }

    /// Returns how many times `operation` has been called.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> u32 {
        self.injections
            .lock()
            .map(|inj| inj.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Applies a direct change to the state, outside of any API call.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn seed<T>(&self, f: impl FnOnce(&mut SimulatedState) -> T) -> Result<T> {
        let mut state = self.lock()?;
        Ok(f(&mut state))
    }

    /// Reads the state directly, outside of any API call.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn inspect<T>(&self, f: impl FnOnce(&SimulatedState) -> T) -> Result<T> {
        let state = self.lock()?;
        Ok(f(&state))
    }

    /// Writes the current state to the snapshot file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save(&self) -> Result<()> {
        let content = {
            let state = self.lock()?;
            Self::serialize(&state)?
        };
        self.write_snapshot(content).await
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimulatedState>> {
        self.state
            .lock()
            .map_err(|_| ConvergeError::internal("simulated provider state lock poisoned"))
    }

    fn serialize(state: &SimulatedState) -> Result<String> {
        serde_json::to_string_pretty(state)
            .map_err(|e| ConvergeError::internal(format!("Failed to serialize provider snapshot: {e}")))
    }

    async fn write_snapshot(&self, content: String) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await?;

        debug!("Provider snapshot saved: {}", path.display());
        Ok(())
    }

    /// Counts the call, runs due hooks and pops an injected fault.
    fn enter(&self, operation: &str) -> Result<()> {
        let (fault, due) = {
            let mut inj = self
                .injections
                .lock()
                .map_err(|_| ConvergeError::internal("fault injection lock poisoned"))?;

            let calls = inj.calls.entry(operation.to_string()).or_insert(0);
            *calls += 1;
            let count = *calls;

            let fault = inj.faults.get_mut(operation).and_then(VecDeque::pop_front);
            let due: Vec<StateHook> = match inj.hooks.get_mut(operation) {
                Some(hooks) => {
                    let (due, pending): (Vec<_>, Vec<_>) =
                        std::mem::take(hooks).into_iter().partition(|(n, _)| *n == count);
                    *hooks = pending;
                    due.into_iter().map(|(_, hook)| hook).collect()
                }
                None => Vec::new(),
            };
            (fault, due)
        };

        if !due.is_empty() {
            let mut state = self.lock()?;
            for hook in due {
                hook(&mut state);
            }
        }

        match fault {
            Some(err) => {
                debug!(operation = %operation, error = %err, "Injected provider fault");
                Err(err.into())
            }
            None => Ok(()),
        }
    }

    fn read<T>(&self, operation: &str, f: impl FnOnce(&SimulatedState) -> Result<T>) -> Result<T> {
        self.enter(operation)?;
        let state = self.lock()?;
        f(&state)
    }

    async fn mutate<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut SimulatedState) -> Result<T> + Send,
        T: Send,
    {
        self.enter(operation)?;
        let (value, snapshot) = {
            let mut state = self.lock()?;
            let value = f(&mut state)?;
            let snapshot = if self.snapshot.is_some() {
                Some(Self::serialize(&state)?)
            } else {
                None
            };
            (value, snapshot)
        };
        if let Some(content) = snapshot {
            self.write_snapshot(content).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl LaunchTemplateApi for SimulatedProvider {
    async fn describe_launch_template_by_name(&self, name: &str) -> Result<Option<LaunchTemplate>> {
        self.read("DescribeLaunchTemplates", |s| {
            Ok(s.launch_templates
                .values()
                .find(|t| t.template.name == name)
                .map(SimulatedState::describe_template))
        })
    }

    async fn describe_launch_template(&self, template_id: &str) -> Result<Option<LaunchTemplate>> {
        self.read("DescribeLaunchTemplates", |s| {
            Ok(s.launch_templates
                .get(template_id)
                .map(SimulatedState::describe_template))
        })
    }

    async fn describe_launch_template_versions(
        &self,
        template_id: &str,
    ) -> Result<Vec<LaunchTemplateVersion>> {
        self.read("DescribeLaunchTemplateVersions", |s| {
            s.launch_templates
                .get(template_id)
                .map(|t| t.versions.values().cloned().collect())
                .ok_or_else(|| ProviderError::not_found("launch template", template_id).into())
        })
    }

    async fn create_launch_template(
        &self,
        name: &str,
        data: &LaunchTemplateData,
        user_data: &[u8],
        tags: &Tags,
        client_token: &str,
    ) -> Result<LaunchTemplate> {
        self.mutate("CreateLaunchTemplate", |s| {
            if let Some(existing) = s.launch_templates.values().find(|t| t.template.name == name) {
                if existing.create_token == client_token {
                    return Ok(SimulatedState::describe_template(existing));
                }
                return Err(ProviderError::already_exists("launch template", name).into());
            }

            let id = new_id("lt");
            let now = Utc::now();
            let version = LaunchTemplateVersion {
                template_id: id.clone(),
                number: 1,
                data: with_user_data_hash(data, user_data),
                created_at: now,
            };
            let template = LaunchTemplate {
                id: id.clone(),
                name: name.to_string(),
                default_version: 1,
                latest_version: 1,
                created_at: now,
            };
            s.launch_templates.insert(
                id.clone(),
                StoredTemplate {
                    template: template.clone(),
                    versions: BTreeMap::from([(1, version)]),
                    next_version: 2,
                    create_token: client_token.to_string(),
                    version_tokens: BTreeMap::new(),
                },
            );
            s.tags.insert(id, tags.clone());
            Ok(template)
        })
        .await
    }

    async fn create_launch_template_version(
        &self,
        template_id: &str,
        data: &LaunchTemplateData,
        user_data: &[u8],
        client_token: &str,
    ) -> Result<LaunchTemplateVersion> {
        self.mutate("CreateLaunchTemplateVersion", |s| {
            s.insert_version(template_id, data, user_data, client_token)
        })
        .await
    }

    async fn modify_default_version(&self, template_id: &str, version: u64) -> Result<()> {
        self.mutate("ModifyLaunchTemplate", |s| {
            let stored = s.template_mut(template_id)?;
            if !stored.versions.contains_key(&version) {
                return Err(ProviderError::not_found(
                    "launch template version",
                    format!("{template_id}:{version}"),
                )
                .into());
            }
            stored.template.default_version = version;
            Ok(())
        })
        .await
    }

    async fn delete_launch_template_versions(&self, template_id: &str, versions: &[u64])
        -> Result<()> {
        self.mutate("DeleteLaunchTemplateVersions", |s| {
            let stored = s.template_mut(template_id)?;
            if versions.contains(&stored.template.default_version) {
                return Err(ProviderError::Conflict {
                    message: format!(
                        "cannot delete default version {} of {template_id}",
                        stored.template.default_version
                    ),
                }
                .into());
            }

            let missing: Vec<u64> = versions
                .iter()
                .copied()
                .filter(|n| stored.versions.remove(n).is_none())
                .collect();
            stored.template.latest_version =
                stored.versions.keys().next_back().copied().unwrap_or(0);

            if missing.is_empty() {
                Ok(())
            } else {
                Err(ProviderError::not_found(
                    "launch template version",
                    format!("{template_id}:{missing:?}"),
                )
                .into())
            }
        })
        .await
    }

    async fn delete_launch_template(&self, template_id: &str) -> Result<()> {
        self.mutate("DeleteLaunchTemplate", |s| {
            s.launch_templates
                .remove(template_id)
                .ok_or_else(|| ConvergeError::from(ProviderError::not_found("launch template", template_id)))?;
            s.tags.remove(template_id);
            Ok(())
        })
        .await
    }

    async fn describe_images(&self, filter: &ImageFilter) -> Result<Vec<Image>> {
        self.read("DescribeImages", |s| {
            Ok(s.images
                .iter()
                .filter(|i| i.owner == filter.owner && i.architecture == filter.architecture)
                .filter(|i| glob_match(&filter.name_pattern, &i.name))
                .cloned()
                .collect())
        })
    }
}

#[async_trait]
impl InstanceApi for SimulatedProvider {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        self.read("DescribeInstances", |s| {
            Ok(s.instances.get(instance_id).map(|i| s.describe_instance(i)))
        })
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        self.read("DescribeInstances", |s| {
            Ok(s.instances
                .values()
                .map(|i| s.describe_instance(i))
                .filter(|i| filter.include_terminated || i.state != InstanceState::Terminated)
                .filter(|i| {
                    filter
                        .tag
                        .as_ref()
                        .is_none_or(|(k, v)| i.tags.get(k) == Some(v))
                })
                .filter(|i| {
                    filter.launch_template_id.as_ref().is_none_or(|id| {
                        i.launch_template
                            .as_ref()
                            .is_some_and(|r| &r.template_id == id)
                    })
                })
                .collect())
        })
    }

    async fn describe_network_interfaces(&self, instance_id: &str)
        -> Result<Vec<NetworkInterface>> {
        self.read("DescribeNetworkInterfaces", |s| {
            match s.instances.get(instance_id) {
                Some(i) if i.state != InstanceState::Terminated => Ok(s.interfaces_of(instance_id)),
                _ => Err(ProviderError::not_found("instance", instance_id).into()),
            }
        })
    }

    async fn modify_network_interface_security_groups(
        &self,
        interface_id: &str,
        group_ids: &[String],
    ) -> Result<()> {
        self.mutate("ModifyNetworkInterfaceAttribute", |s| {
            let interface = s
                .interfaces
                .get_mut(interface_id)
                .ok_or_else(|| ProviderError::not_found("network interface", interface_id))?;
            interface.security_group_ids = group_ids.iter().cloned().collect();
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AutoScalingApi for SimulatedProvider {
    async fn describe_group(&self, name: &str) -> Result<Option<AutoScalingGroup>> {
        self.read("DescribeAutoScalingGroups", |s| Ok(s.groups.get(name).cloned()))
    }

    async fn describe_groups_using_template(&self, template_id: &str)
        -> Result<Vec<AutoScalingGroup>> {
        self.read("DescribeAutoScalingGroups", |s| {
            Ok(s.groups
                .values()
                .filter(|g| g.launch_template.template_id == template_id)
                .cloned()
                .collect())
        })
    }

    async fn create_group(
        &self,
        name: &str,
        settings: &GroupSettings,
        tags: &Tags,
    ) -> Result<AutoScalingGroup> {
        self.mutate("CreateAutoScalingGroup", |s| {
            if s.groups.contains_key(name) {
                return Err(ProviderError::already_exists("autoscaling group", name).into());
            }
            Ok(s.add_group(name, settings, tags.clone()))
        })
        .await
    }

    async fn update_group(&self, name: &str, settings: &GroupSettings) -> Result<()> {
        self.mutate("UpdateAutoScalingGroup", |s| {
            let group = s.group_mut(name)?;
            group.launch_template = settings.launch_template.clone();
            group.min_size = settings.min_size;
            group.max_size = settings.max_size;
            group.desired_capacity = settings.desired_capacity;
            group.subnet_ids = settings.subnet_ids.clone();
            Ok(())
        })
        .await
    }

    async fn delete_group(&self, name: &str) -> Result<()> {
        self.mutate("DeleteAutoScalingGroup", |s| {
            let group = s
                .groups
                .remove(name)
                .ok_or_else(|| ConvergeError::from(ProviderError::not_found("autoscaling group", name)))?;
            for id in &group.instance_ids {
                s.set_instance_state(id, InstanceState::ShuttingDown);
            }
            s.tags.remove(name);
            Ok(())
        })
        .await
    }

    async fn suspend_processes(&self, name: &str, processes: &[String]) -> Result<()> {
        self.mutate("SuspendProcesses", |s| {
            s.group_mut(name)?
                .suspended_processes
                .extend(processes.iter().cloned());
            Ok(())
        })
        .await
    }

    async fn resume_processes(&self, name: &str, processes: &[String]) -> Result<()> {
        self.mutate("ResumeProcesses", |s| {
            let group = s.group_mut(name)?;
            for process in processes {
                group.suspended_processes.remove(process);
            }
            Ok(())
        })
        .await
    }

    async fn describe_instance_refreshes(&self, name: &str) -> Result<Vec<InstanceRefresh>> {
        self.read("DescribeInstanceRefreshes", |s| {
            Ok(s.refreshes
                .iter()
                .filter(|r| r.group == name)
                .cloned()
                .collect())
        })
    }

    async fn start_instance_refresh(
        &self,
        name: &str,
        preferences: &RefreshPreferences,
    ) -> Result<String> {
        self.mutate("StartInstanceRefresh", |s| {
            if !s.groups.contains_key(name) {
                return Err(ProviderError::not_found("autoscaling group", name).into());
            }
            if s.refreshes
                .iter()
                .any(|r| r.group == name && r.status.is_active())
            {
                return Err(ProviderError::RefreshInProgress {
                    group: name.to_string(),
                }
                .into());
            }
            debug!(
                group = %name,
                min_healthy = preferences.min_healthy_percentage,
                "Simulated refresh accepted"
            );
            Ok(s.add_refresh(name, ProviderRefreshStatus::Pending, Utc::now()))
        })
        .await
    }
}

#[async_trait]
impl LoadBalancerApi for SimulatedProvider {
    async fn describe_load_balancer(&self, name: &str, kind: TargetKind)
        -> Result<Option<LoadBalancer>> {
        self.read("DescribeLoadBalancers", |s| {
            Ok(s.load_balancers
                .get(&lb_key(kind, name))
                .map(|lb| lb.load_balancer.clone()))
        })
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        kind: TargetKind,
        port: u16,
        tags: &Tags,
    ) -> Result<LoadBalancer> {
        let region = self.region.clone();
        self.mutate("CreateLoadBalancer", move |s| {
            let key = lb_key(kind, name);
            if s.load_balancers.contains_key(&key) {
                return Err(ProviderError::already_exists("load balancer", name).into());
            }
            let arn = (kind == TargetKind::TargetGroup).then(|| {
                let suffix = Uuid::new_v4().simple().to_string();
                format!(
                    "arn:aws:elasticloadbalancing:{region}:{ACCOUNT_ID}:targetgroup/{name}/{}",
                    &suffix[..16]
                )
            });
            let load_balancer = LoadBalancer {
                name: name.to_string(),
                kind,
                arn,
                port,
            };
            s.tags
                .insert(load_balancer.resource_id().to_string(), tags.clone());
            s.load_balancers.insert(
                key,
                StoredLoadBalancer {
                    load_balancer: load_balancer.clone(),
                    targets: BTreeMap::new(),
                },
            );
            Ok(load_balancer)
        })
        .await
    }

    async fn delete_load_balancer(&self, name: &str, kind: TargetKind) -> Result<()> {
        self.mutate("DeleteLoadBalancer", |s| {
            let stored = s
                .load_balancers
                .remove(&lb_key(kind, name))
                .ok_or_else(|| ConvergeError::from(ProviderError::not_found("load balancer", name)))?;
            s.tags.remove(stored.load_balancer.resource_id());
            Ok(())
        })
        .await
    }

    async fn describe_target_health(&self, target: &LoadBalancerTarget)
        -> Result<Vec<TargetHealth>> {
        self.read("DescribeTargetHealth", |s| {
            s.load_balancers
                .values()
                .find(|lb| lb.load_balancer.target() == *target)
                .map(|lb| {
                    lb.targets
                        .iter()
                        .map(|(id, state)| TargetHealth {
                            instance_id: id.clone(),
                            state: *state,
                        })
                        .collect()
                })
                .ok_or_else(|| ProviderError::not_found("load balancer", target.to_string()).into())
        })
    }

    async fn register_instances(&self, target: &LoadBalancerTarget, instance_ids: &[String])
        -> Result<()> {
        self.mutate("RegisterTargets", |s| {
            let mut states = Vec::with_capacity(instance_ids.len());
            for id in instance_ids {
                let state = match s.instances.get(id).map(|i| i.state) {
                    Some(InstanceState::Running) => TargetHealthState::Healthy,
                    Some(InstanceState::Pending) => TargetHealthState::Initial,
                    _ => {
                        return Err(ProviderError::Validation {
                            message: format!("invalid instance {id}"),
                        }
                        .into());
                    }
                };
                states.push((id.clone(), state));
            }
            s.load_balancer_for(target)?.targets.extend(states);
            Ok(())
        })
        .await
    }

    async fn deregister_instances(
        &self,
        target: &LoadBalancerTarget,
        instance_ids: &[String],
    ) -> Result<()> {
        self.mutate("DeregisterTargets", |s| {
            let lb = s.load_balancer_for(target)?;
            for id in instance_ids {
                if lb.targets.remove(id).is_none() {
                    return Err(ProviderError::not_found("target", id).into());
                }
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl NetworkApi for SimulatedProvider {
    async fn describe_vpc_by_tag(&self, key: &str, value: &str) -> Result<Option<Vpc>> {
        self.read("DescribeVpcs", |s| {
            Ok(s.vpcs
                .values()
                .find(|v| s.tags_of(&v.id).get(key).is_some_and(|t| t == value))
                .map(|v| Vpc {
                    tags: s.tags_of(&v.id),
                    ..v.clone()
                }))
        })
    }

    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> Result<Vpc> {
        self.mutate("CreateVpc", |s| {
            let id = s.add_vpc(cidr, tags.clone());
            Ok(Vpc {
                id,
                cidr: cidr.to_string(),
                tags: tags.clone(),
            })
        })
        .await
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<()> {
        self.mutate("DeleteVpc", |s| {
            if !s.vpcs.contains_key(vpc_id) {
                return Err(ProviderError::not_found("vpc", vpc_id).into());
            }
            if s.security_groups.values().any(|g| g.vpc_id == vpc_id) {
                return Err(ProviderError::Conflict {
                    message: format!("vpc {vpc_id} has dependent security groups"),
                }
                .into());
            }
            s.vpcs.remove(vpc_id);
            s.tags.remove(vpc_id);
            Ok(())
        })
        .await
    }

    async fn describe_security_groups(&self, vpc_id: &str) -> Result<Vec<SecurityGroup>> {
        self.read("DescribeSecurityGroups", |s| {
            Ok(s.security_groups
                .values()
                .filter(|g| g.vpc_id == vpc_id)
                .map(|g| SecurityGroup {
                    tags: s.tags_of(&g.id),
                    ..g.clone()
                })
                .collect())
        })
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> Result<SecurityGroup> {
        self.mutate("CreateSecurityGroup", |s| {
            if !s.vpcs.contains_key(vpc_id) {
                return Err(ProviderError::not_found("vpc", vpc_id).into());
            }
            if s.security_groups
                .values()
                .any(|g| g.vpc_id == vpc_id && g.name == name)
            {
                return Err(ProviderError::already_exists("security group", name).into());
            }
            let id = new_id("sg");
            let group = SecurityGroup {
                id: id.clone(),
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
                description: description.to_string(),
                ingress: BTreeSet::new(),
                tags: Tags::new(),
            };
            s.security_groups.insert(id.clone(), group.clone());
            s.tags.insert(id, tags.clone());
            Ok(SecurityGroup {
                tags: tags.clone(),
                ..group
            })
        })
        .await
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        self.mutate("AuthorizeSecurityGroupIngress", |s| {
            s.security_group_mut(group_id)?
                .ingress
                .extend(rules.iter().cloned());
            Ok(())
        })
        .await
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        self.mutate("RevokeSecurityGroupIngress", |s| {
            let group = s.security_group_mut(group_id)?;
            for rule in rules {
                group.ingress.remove(rule);
            }
            Ok(())
        })
        .await
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.mutate("DeleteSecurityGroup", |s| {
            s.security_groups
                .remove(group_id)
                .ok_or_else(|| ConvergeError::from(ProviderError::not_found("security group", group_id)))?;
            s.tags.remove(group_id);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaggingApi for SimulatedProvider {
    async fn describe_tags(&self, resource_id: &str) -> Result<Tags> {
        self.read("DescribeTags", |s| {
            if s.resource_exists(resource_id) {
                Ok(s.tags_of(resource_id))
            } else {
                Err(ProviderError::not_found("resource", resource_id).into())
            }
        })
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        self.mutate("CreateTags", |s| {
            if !s.resource_exists(resource_id) {
                return Err(ProviderError::not_found("resource", resource_id).into());
            }
            s.tags
                .entry(resource_id.to_string())
                .or_default()
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
        .await
    }

    async fn delete_tags(&self, resource_id: &str, keys: &BTreeSet<String>) -> Result<()> {
        self.mutate("DeleteTags", |s| {
            if !s.resource_exists(resource_id) {
                return Err(ProviderError::not_found("resource", resource_id).into());
            }
            if let Some(tags) = s.tags.get_mut(resource_id) {
                tags.retain(|k, _| !keys.contains(k));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ObjectStoreApi for SimulatedProvider {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.read("HeadBucket", |s| Ok(s.buckets.contains_key(bucket)))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.mutate("CreateBucket", |s| {
            if s.buckets.contains_key(bucket) {
                return Err(ProviderError::already_exists("bucket", bucket).into());
            }
            s.buckets.insert(bucket.to_string(), BTreeMap::new());
            Ok(())
        })
        .await
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.mutate("DeleteBucket", |s| {
            match s.buckets.get(bucket) {
                None => return Err(ProviderError::not_found("bucket", bucket).into()),
                Some(objects) if !objects.is_empty() => {
                    return Err(ProviderError::Conflict {
                        message: format!("bucket {bucket} is not empty"),
                    }
                    .into());
                }
                Some(_) => {}
            }
            s.buckets.remove(bucket);
            s.tags.remove(bucket);
            Ok(())
        })
        .await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.read("ListObjectsV2", |s| {
            s.buckets
                .get(bucket)
                .map(|objects| {
                    objects
                        .keys()
                        .filter(|k| k.starts_with(prefix))
                        .cloned()
                        .collect()
                })
                .ok_or_else(|| ProviderError::not_found("bucket", bucket).into())
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.mutate("PutObject", |s| {
            s.buckets
                .get_mut(bucket)
                .ok_or_else(|| ConvergeError::from(ProviderError::not_found("bucket", bucket)))?
                .insert(key.to_string(), data.to_vec());
            Ok(())
        })
        .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.mutate("DeleteObject", |s| {
            if let Some(objects) = s.buckets.get_mut(bucket) {
                objects.remove(key);
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SecretsApi for SimulatedProvider {
    async fn create_secret(&self, name: &str, value: &[u8], tags: &Tags) -> Result<()> {
        self.mutate("CreateSecret", |s| {
            if s.secrets.contains_key(name) {
                return Err(ProviderError::already_exists("secret", name).into());
            }
            s.secrets.insert(name.to_string(), value.to_vec());
            s.tags.insert(name.to_string(), tags.clone());
            Ok(())
        })
        .await
    }

    async fn put_secret_value(&self, name: &str, value: &[u8]) -> Result<()> {
        self.mutate("PutSecretValue", |s| {
            let stored = s
                .secrets
                .get_mut(name)
                .ok_or_else(|| ProviderError::not_found("secret", name))?;
            *stored = value.to_vec();
            Ok(())
        })
        .await
    }

    async fn list_secrets(&self, prefix: &str) -> Result<Vec<String>> {
        self.read("ListSecrets", |s| {
            Ok(s.secrets
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.mutate("DeleteSecret", |s| {
            if s.secrets.remove(name).is_none() {
                return Err(ProviderError::not_found("secret", name).into());
            }
            s.tags.remove(name);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::VersionRef;
    use tempfile::TempDir;

    fn data(instance_type: &str) -> LaunchTemplateData {
        LaunchTemplateData {
            instance_type: instance_type.to_string(),
            ..LaunchTemplateData::default()
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("capa-ami-ubuntu-22.04-?1.29.1-*", "capa-ami-ubuntu-22.04-v1.29.1-1700000000"));
        assert!(glob_match("capa-ami-ubuntu-22.04-?1.29.1-*", "capa-ami-ubuntu-22.04-11.29.1-x"));
        assert!(!glob_match("capa-ami-ubuntu-22.04-?1.29.1-*", "capa-ami-ubuntu-22.04-1.29.1-x"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_version_numbers_never_reused() {
        let provider = SimulatedProvider::in_memory();
        let template = provider
            .create_launch_template("lt", &data("m5.large"), b"", &Tags::new(), "t0")
            .await
            .expect("create");

        for (i, token) in ["t1", "t2"].iter().enumerate() {
            let v = provider
                .create_launch_template_version(&template.id, &data(&format!("m5.{i}")), b"", token)
                .await
                .expect("version");
            assert_eq!(v.number, i as u64 + 2);
        }

        provider
            .delete_launch_template_versions(&template.id, &[3])
            .await
            .expect("delete");
        let v = provider
            .create_launch_template_version(&template.id, &data("c5.large"), b"", "t3")
            .await
            .expect("version");
        assert_eq!(v.number, 4);
    }

    #[tokio::test]
    async fn test_client_token_replay_returns_same_version() {
        let provider = SimulatedProvider::in_memory();
        let template = provider
            .create_launch_template("lt", &data("m5.large"), b"", &Tags::new(), "t0")
            .await
            .expect("create");

        let first = provider
            .create_launch_template_version(&template.id, &data("m5.xlarge"), b"ud", "same")
            .await
            .expect("version");
        let second = provider
            .create_launch_template_version(&template.id, &data("m5.xlarge"), b"ud", "same")
            .await
            .expect("version");

        assert_eq!(first, second);
        assert_eq!(provider.inspect(|s| s.version_count(&template.id)).expect("inspect"), 2);
        assert_eq!(first.data.user_data_hash, Some(UserDataHash::of(b"ud")));
    }

    #[tokio::test]
    async fn test_default_version_cannot_be_deleted() {
        let provider = SimulatedProvider::in_memory();
        let template = provider
            .create_launch_template("lt", &data("m5.large"), b"", &Tags::new(), "t0")
            .await
            .expect("create");

        let err = provider
            .delete_launch_template_versions(&template.id, &[1])
            .await
            .expect_err("default is protected");
        assert_eq!(err.class(), crate::error::ErrorClass::Conflict);
    }

    #[tokio::test]
    async fn test_refresh_mutual_exclusion() {
        let provider = SimulatedProvider::in_memory();
        let settings = GroupSettings {
            launch_template: TemplateRef {
                template_id: String::from("lt-1"),
                version: VersionRef::Latest,
            },
            min_size: 1,
            max_size: 3,
            desired_capacity: None,
            subnet_ids: Vec::new(),
        };
        provider
            .create_group("pool-a", &settings, &Tags::new())
            .await
            .expect("group");

        let prefs = RefreshPreferences {
            min_healthy_percentage: 90,
            instance_warmup_secs: None,
        };
        provider
            .start_instance_refresh("pool-a", &prefs)
            .await
            .expect("first start");
        let err = provider
            .start_instance_refresh("pool-a", &prefs)
            .await
            .expect_err("second start");

        assert!(matches!(
            err.provider_error(),
            Some(ProviderError::RefreshInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let provider = SimulatedProvider::in_memory();
        provider.inject_fault(
            "DescribeLaunchTemplates",
            ProviderError::Throttled { retry_after_secs: 1 },
        );

        assert!(provider.describe_launch_template_by_name("lt").await.is_err());
        assert!(provider
            .describe_launch_template_by_name("lt")
            .await
            .expect("second call")
            .is_none());
        assert_eq!(provider.call_count("DescribeLaunchTemplates"), 2);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("state").join("provider.json");

        let provider = SimulatedProvider::open(&path).await.expect("open");
        let vpc = provider
            .create_vpc("10.0.0.0/16", &Tags::from([(String::from("k"), String::from("v"))]))
            .await
            .expect("vpc");
        assert!(path.exists());

        let reopened = SimulatedProvider::open(&path).await.expect("reopen");
        let found = reopened
            .describe_vpc_by_tag("k", "v")
            .await
            .expect("describe")
            .expect("vpc persisted");
        assert_eq!(found.id, vpc.id);
        assert_eq!(found.cidr, "10.0.0.0/16");
    }

    #[tokio::test]
    async fn test_tags_on_missing_resource() {
        let provider = SimulatedProvider::in_memory();
        let err = provider
            .describe_tags("i-missing")
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }
}
