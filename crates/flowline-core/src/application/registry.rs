use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::fiber::FlowLogic;
use crate::error::{CoreError, FlowError};
use crate::types::Payload;

/// Builds a flow instance from its start arguments
pub type FlowConstructor = Arc<dyn Fn(&Payload) -> Result<Arc<dyn FlowLogic>, FlowError> + Send + Sync>;

/// Creates flow instances by type name
pub trait FlowFactory: Send + Sync {
    /// Construct a flow
    fn create(&self, flow_type: &str, args: &Payload) -> Result<Arc<dyn FlowLogic>, CoreError>;

    /// Flow type that responds to sessions opened under `protocol`
    fn responder_for(&self, protocol: &str) -> Option<String>;
}

/// Explicitly constructed table of flow constructors and responder bindings
#[derive(Default, Clone)]
pub struct FlowRegistry {
    constructors: HashMap<String, FlowConstructor>,
    responders: HashMap<String, String>,
}

impl FlowRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow constructor
    pub fn register<F>(mut self, flow_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Payload) -> Result<Arc<dyn FlowLogic>, FlowError> + Send + Sync + 'static,
    {
        let flow_type = flow_type.into();
        debug!("Registering flow type {}", flow_type);
        self.constructors.insert(flow_type, Arc::new(constructor));
        self
    }

    /// Bind a responder flow type to an initiating protocol
    pub fn register_responder(mut self, protocol: impl Into<String>, responder: impl Into<String>) -> Self {
        self.responders.insert(protocol.into(), responder.into());
        self
    }

    /// Whether a flow type has a constructor
    pub fn contains(&self, flow_type: &str) -> bool {
        self.constructors.contains_key(flow_type)
    }
}

impl FlowFactory for FlowRegistry {
    fn create(&self, flow_type: &str, args: &Payload) -> Result<Arc<dyn FlowLogic>, CoreError> {
        let constructor = self
            .constructors
            .get(flow_type)
            .ok_or_else(|| CoreError::FlowFactoryError(format!("Unknown flow type: {}", flow_type)))?;

        constructor(args)
            .map_err(|e| CoreError::FlowFactoryError(format!("Cannot construct {}: {}", flow_type, e)))
    }

    fn responder_for(&self, protocol: &str) -> Option<String> {
        self.responders
            .get(protocol)
            .filter(|responder| self.constructors.contains_key(responder.as_str()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fiber::FlowContext;
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct GreetArgs {
        name: String,
    }

    struct GreetFlow {
        name: String,
    }

    #[async_trait]
    impl FlowLogic for GreetFlow {
        fn flow_type(&self) -> &str {
            "Greet"
        }

        async fn call(&self, _ctx: &mut FlowContext) -> Result<Payload, FlowError> {
            Ok(Payload::new(format!("hello {}", self.name).into_bytes()))
        }
    }

    fn registry() -> FlowRegistry {
        FlowRegistry::new()
            .register("Greet", |args: &Payload| {
                let args: GreetArgs = args.to()?;
                Ok(Arc::new(GreetFlow { name: args.name }) as Arc<dyn FlowLogic>)
            })
            .register_responder("Ping", "Greet")
            .register_responder("Orphan", "Missing")
    }

    #[test]
    fn test_create_registered_flow() {
        let flow = registry()
            .create("Greet", &Payload::json(serde_json::json!({"name": "bob"})))
            .unwrap();
        assert_eq!(flow.flow_type(), "Greet");
    }

    #[test]
    fn test_unknown_flow_type() {
        let result = registry().create("Nope", &Payload::empty());
        match result {
            Err(CoreError::FlowFactoryError(msg)) => assert!(msg.contains("Unknown flow type: Nope")),
            _ => panic!("Expected FlowFactoryError"),
        }
    }

    #[test]
    fn test_bad_arguments() {
        let result = registry().create("Greet", &Payload::new(b"{}".to_vec()));
        assert!(matches!(result, Err(CoreError::FlowFactoryError(_))));
    }

    #[test]
    fn test_responder_lookup() {
        let registry = registry();
        assert_eq!(registry.responder_for("Ping"), Some("Greet".to_string()));
        assert_eq!(registry.responder_for("Orphan"), None);
        assert_eq!(registry.responder_for("Unknown"), None);
    }
}
