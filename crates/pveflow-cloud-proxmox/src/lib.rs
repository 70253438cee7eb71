//! Proxmox VE client for pveflow
//!
//! This crate implements [`pveflow_cloud::ResourceClient`] on top of the
//! Proxmox VE REST API (`/api2/json`), authenticated with an API token.
//!
//! # Features
//!
//! - SDN zones, VNets and subnets, applied through a cluster-wide SDN reload
//! - LXC containers created from an OS template
//! - QEMU virtual machines cloned from a cloud-init template
//! - Task (UPID) status mapped onto [`pveflow_cloud::TaskStatus`]
//!
//! # Credentials
//!
//! The token is read from `PVE_TOKEN_ID` and `PVE_TOKEN_SECRET`; it never
//! appears in configuration files or logs.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod guest;
pub mod params;
pub mod sdn;

pub use client::ProxmoxClient;
pub use config::{ProxmoxConfig, TOKEN_ID_ENV, TOKEN_SECRET_ENV};
pub use error::{ProxmoxError, Result};
