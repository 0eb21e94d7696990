//! The Cloud Abstraction Layer: CRUD on scaling groups, launch
//! configurations, IAM roles, managed node groups, fargate profiles, and the
//! instance-type catalog, behind traits so the provisioners and Discovery
//! are testable without real AWS credentials.

mod aws;
mod error;
mod traits;
pub mod types;

pub use aws::AwsCloud;
pub use error::CloudError;
pub use traits::{
    CloudAbstractionLayer, FargateProfileSpec, FargateProfiles, IamRoles, InstanceTypeCatalog,
    LaunchConfigSpec, LaunchConfigs, ManagedNodeGroupSpec, ManagedNodeGroups, OwnershipTags,
    ScalingGroupSpec, ScalingGroups,
};
