//! Configuration module for the convergence engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `infra-converge.yaml`
//! - Validation of the desired state
//! - Hashing user data and launch template data for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::{ConfigHasher, UserDataHash};
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    ClusterConfig, ControlPlaneConfig, ConvergeConfig, HttpTokens, ImageLookup, ImageSpec,
    IngressRule, LaunchTemplateSpec, LoadBalancerConfig, MachinePoolConfig, MetadataOptions,
    NetworkConfig, ObjectStoreBackend, ObjectStoreConfig, ProviderConfig, RefreshConfig,
    RetentionPolicy, RetryConfig, RootVolume, SecurityGroupSpec, ServiceEndpoint, TargetKind,
};
pub use validator::{ConfigValidator, ValidationResult};
