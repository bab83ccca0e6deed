use crate::{config::Config, runtime::ContainerRuntime, source::SourceHost};

/// The collaborators every engine operation needs, bundled so they can be passed around as one value.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    /// Process configuration.
    pub config: &'a Config,
    /// Container runtime used to build and run images.
    pub runtime: &'a dyn ContainerRuntime,
    /// Host serving engine repositories.
    pub host: &'a dyn SourceHost,
}

impl<'a> Services<'a> {
    /// Bundles the given collaborators.
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ContainerRuntime,
        host: &'a dyn SourceHost,
    ) -> Self {
        Self {
            config,
            runtime,
            host,
        }
    }
}
