//! State shared by admin handlers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::launcher::LauncherState;
use crate::registry::MemberRegistry;
use crate::reseed::ReseedHandle;

#[derive(Clone)]
pub struct AdminState {
    inner: Arc<AdminStateInner>,
}

struct AdminStateInner {
    cluster_name: String,
    registry: Arc<MemberRegistry>,
    reseed: ReseedHandle,
    launcher: watch::Receiver<LauncherState>,
}

impl AdminState {
    pub fn new(
        cluster_name: impl Into<String>,
        registry: Arc<MemberRegistry>,
        reseed: ReseedHandle,
        launcher: watch::Receiver<LauncherState>,
    ) -> Self {
        Self {
            inner: Arc::new(AdminStateInner {
                cluster_name: cluster_name.into(),
                registry,
                reseed,
                launcher,
            }),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.inner.cluster_name
    }

    pub fn registry(&self) -> &MemberRegistry {
        &self.inner.registry
    }

    pub fn reseed(&self) -> &ReseedHandle {
        &self.inner.reseed
    }

    pub fn launcher_state(&self) -> LauncherState {
        *self.inner.launcher.borrow()
    }
}
