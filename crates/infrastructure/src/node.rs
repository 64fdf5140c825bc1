use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::ports::NodeRegistry;
use procq_domain::NodeRef;

/// Node identity taken from the host name, resolved once at startup.
pub struct HostnameNodeRegistry {
    node: NodeRef,
}

impl HostnameNodeRegistry {
    pub fn new() -> SchedulerResult<Self> {
        let name = hostname::get()
            .map_err(|e| SchedulerError::Configuration(format!("cannot resolve hostname: {e}")))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            node: NodeRef::new(name),
        })
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            node: NodeRef::new(name),
        }
    }
}

impl NodeRegistry for HostnameNodeRegistry {
    fn current_node(&self) -> NodeRef {
        self.node.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_name_wins() {
        let registry = HostnameNodeRegistry::with_name("node-a");
        assert_eq!(registry.current_node().name, "node-a");
    }

    #[test]
    fn hostname_is_never_empty() {
        let registry = HostnameNodeRegistry::new().unwrap();
        assert!(!registry.current_node().name.is_empty());
    }
}
