use std::future::Future;

use anyhow::Result;

use crate::{DeviceMap, Pipeline};

/// Builds a [`Pipeline`], typically by fetching weights and moving them onto a device.
pub trait Loader: Send + Sync {
    type Pipeline: Pipeline + 'static;

    fn load(&self, device_map: DeviceMap) -> impl Future<Output = Result<Self::Pipeline>> + Send;

    /// Identifier of the model this loader produces, for logs and diagnostics.
    fn model_id(&self) -> &str;
}
