//! The creation collaborator.
//!
//! The pool never speaks the backing protocol itself. A [`Resource`] knows how
//! to open a connection, probe it, and close it; the pool decides when.

use std::future::Future;

use crate::error::Result;

/// Connection factory and lifecycle probe for a pool.
///
/// Methods with defaults may be left alone for resources that cannot go stale
/// (in-memory handles, test doubles).
pub trait Resource: Send + Sync + 'static {
    /// The live connection handed out by the pool.
    type Instance: Send + Sync + 'static;

    /// Unique string identifier for this resource type (e.g. "postgres").
    fn id(&self) -> &str;

    /// Open a new connection.
    ///
    /// Failures surface as [`Error::Creation`](crate::Error::Creation) to the
    /// caller that triggered the creation, or are logged by the prototyper.
    fn create(&self) -> impl Future<Output = Result<Self::Instance>> + Send;

    /// Report whether the connection has already been closed underneath us.
    ///
    /// Some drivers keep handing out objects after the server went away, so
    /// housekeeping asks before running any probe.
    fn is_closed(&self, _instance: &Self::Instance) -> bool {
        false
    }

    /// Run the housekeeping test statement against an idle connection.
    ///
    /// An error means the connection is bad and will be expired.
    fn validate(
        &self,
        _instance: &Self::Instance,
        _test_query: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Physically close a connection that is leaving the pool.
    ///
    /// Errors are logged by the pool and never block its bookkeeping.
    fn cleanup(&self, instance: Self::Instance) -> impl Future<Output = Result<()>> + Send {
        async move {
            drop(instance);
            Ok(())
        }
    }
}
