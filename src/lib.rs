//! vm-agent library
//!
//! First-boot provisioning for infrastructure VMs. The agent asks the
//! inventory service which role this node plays, then prepares the node for
//! it: data disks are partitioned, formatted and mounted, configuration is
//! copied off FAT config volumes attached as extra disks, ownership and modes
//! are fixed up, services are started and, for vault nodes, the vault is
//! unsealed.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **Idempotent**: A rerun skips busy disks, existing filesystems and
//!   existing certificates
//! - **Testable**: OS tools, filesystems and HTTP endpoints sit behind traits

pub mod config;
pub mod copy;
pub mod disk;
pub mod exec;
pub mod filesystem;
pub mod hostname;
pub mod inventory;
pub mod ownership;
pub mod poll;
pub mod roles;
pub mod service;
pub mod vault;

mod error;

pub use error::AgentError;
pub use roles::Role;
