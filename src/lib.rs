//! Multi-tenant RBAC policy enforcement.
//!
//! Permission tuples `(tenant, subject, object, action)` and grouping tuples
//! `(tenant, subject, role)` live in a pluggable async [`PolicyStore`]. The
//! [`PolicyEngine`] keeps one [`TenantPolicySet`] per tenant in memory, loads
//! it on first use and answers checks by walking the subject's role closure.
//! Mutations are written to the store before they become visible. Checks
//! fail closed: any error means the decision could not be verified.
//!
//! # Examples
//!
//! Basic authorization flow using the in-memory store (enable `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # async fn demo() -> rs_tenant_policy::Result<()> {
//! use rs_tenant_policy::{ActionId, EngineBuilder, MemoryStore, ObjectId, SubjectId, TenantId};
//!
//! let engine = EngineBuilder::new(MemoryStore::new()).build();
//! let tenant = TenantId::try_from("tenant_1")?;
//! let alice = SubjectId::try_from("alice")?;
//! let editor = SubjectId::try_from("editor")?;
//!
//! engine
//!     .grant(&tenant, &editor, &ObjectId::question(), &ActionId::publish())
//!     .await?;
//! engine.grant_role(&tenant, &alice, &editor).await?;
//!
//! let allowed = engine
//!     .check(&tenant, &alice, &ObjectId::question(), &ActionId::publish())
//!     .await?;
//! assert!(allowed);
//! # Ok(())
//! # }
//! ```
//!
//! Tuning the cache:
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # {
//! use rs_tenant_policy::{EngineBuilder, MemoryStore};
//! use std::time::Duration;
//! let engine = EngineBuilder::new(MemoryStore::new())
//!     .cache_capacity(1024)
//!     .invalidation_interval(Duration::from_secs(30))
//!     .store_timeout(Duration::from_secs(2))
//!     .build();
//! # let _ = engine;
//! # }
//! ```
#![forbid(unsafe_code)]

mod audit;
mod cache;
mod config;
mod engine;
mod error;
mod policy_set;
mod store;
mod tuple;
mod types;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "postgres-store")]
mod postgres_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::cache::PolicyCache;
pub use crate::config::EngineConfig;
pub use crate::engine::{EngineBuilder, PolicyEngine};
pub use crate::error::{BoxError, Error, Result, StoreError};
pub use crate::policy_set::TenantPolicySet;
pub use crate::store::PolicyStore;
pub use crate::tuple::{GroupingTuple, PermissionTuple, Policies};
pub use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::{CallCounts, MemoryStore, StoreOp};

#[cfg(feature = "postgres-store")]
pub use crate::postgres_store::PostgresStore;
