//! proxmox-deploy-rs library
//!
//! Provisions cloud-init enabled virtual machines on a Proxmox VE host that
//! is reachable only over SSH.
//!
//! A deployment renders a NoCloud seed image, allocates and fills a boot
//! volume and a seed volume, defines the VM, attaches both disks (boot disk
//! first), configures a serial console and network interface, and
//! optionally starts it. When a step fails, everything created so far is
//! removed again in reverse order.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **One primitive**: every remote side effect is a single command run
//!   through [`remote::RemoteShell`]
//! - **Recoverable failures**: a failed run reports exactly what it could
//!   not clean up

pub mod config;
pub mod deployment;
pub mod orchestrator;
pub mod provision;
pub mod remote;
pub mod seed;
pub mod storage;
pub mod upload;

mod error;

pub use deployment::{ByteSize, DeploymentSpec};
pub use error::{DeployError, ErrorKind};
pub use orchestrator::{CleanupReport, Deployment, DeploymentFailure, DeploymentOrchestrator, RemoteResource};
pub use provision::{ProvisionState, VmHandle};
