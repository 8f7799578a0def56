use std::sync::Arc;

use winsys_drm::{DrmError, FenceFlags, FenceToken, KernelDriver};

/// Where the fence manager gets authoritative completion state from.
pub trait FenceBackend: Send + Sync {
    /// Which of `mask` the token has completed.
    fn signaled(&self, token: FenceToken, mask: FenceFlags) -> Result<FenceFlags, DrmError>;

    /// Block until the token completes `mask`.
    fn finish(&self, token: FenceToken, mask: FenceFlags, lazy: bool) -> Result<(), DrmError>;

    /// Release the token; called exactly once per token.
    fn unreference(&self, token: FenceToken);
}

/// Fence backend forwarding to the kernel driver.
pub struct DriverFences {
    driver: Arc<dyn KernelDriver>,
}

impl DriverFences {
    pub fn new(driver: Arc<dyn KernelDriver>) -> Self {
        Self { driver }
    }
}

impl FenceBackend for DriverFences {
    fn signaled(&self, token: FenceToken, mask: FenceFlags) -> Result<FenceFlags, DrmError> {
        self.driver.fence_signaled(token, mask)
    }

    fn finish(&self, token: FenceToken, mask: FenceFlags, lazy: bool) -> Result<(), DrmError> {
        self.driver.fence_wait(token, mask, lazy)
    }

    fn unreference(&self, token: FenceToken) {
        self.driver.fence_unreference(token);
    }
}
