//! Pipeline element trait and registry
//!
//! Elements are named processing nodes with typed ports and lifecycle
//! hooks. Local elements are created through [`ElementRegistry`]: factory
//! keys are `module::class_name` with a bare `class_name` fallback, which
//! is this runtime's resolution of the definition's module/class pair.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::definition::ElementDefinition;
use crate::sexpr::SMap;
use crate::stream::{Frame, Stream, StreamEvent};
use crate::{Error, Result};

/// A processing node in the pipeline graph
///
/// `process_frame` receives the bound input slice; the frame is available
/// read-only for elements that look at the whole swag (Inspect does).
/// Outputs are returned keyed by the element's declared output port names
/// and merged into the swag by the pipeline.
pub trait PipelineElement: Send + std::fmt::Debug {
    /// Called once per stream, in topological order
    fn start_stream(&mut self, _stream: &mut Stream) -> StreamEvent {
        StreamEvent::Okay
    }

    /// Process one frame's bound inputs
    fn process_frame(
        &mut self,
        stream: &mut Stream,
        frame: &Frame,
        inputs: &SMap,
    ) -> (StreamEvent, SMap);

    /// Called once per stream in reverse topological order
    fn stop_stream(&mut self, _stream: &mut Stream) -> StreamEvent {
        StreamEvent::Okay
    }
}

/// Creates element instances for one class name
pub trait ElementFactory: Send + Sync {
    /// Instantiate an element for the given definition
    fn create(&self, definition: &ElementDefinition) -> Result<Box<dyn PipelineElement>>;
}

struct FnFactory<F>(F);

impl<F> ElementFactory for FnFactory<F>
where
    F: Fn(&ElementDefinition) -> Result<Box<dyn PipelineElement>> + Send + Sync,
{
    fn create(&self, definition: &ElementDefinition) -> Result<Box<dyn PipelineElement>> {
        (self.0)(definition)
    }
}

/// Registry of element factories keyed by class name
#[derive(Default, Clone)]
pub struct ElementRegistry {
    factories: HashMap<String, Arc<dyn ElementFactory>>,
}

impl ElementRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in elements
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::pipeline::elements::register_builtins(&mut registry);
        registry
    }

    /// Register a factory under a key (`class_name` or `module::class`)
    pub fn register(&mut self, key: impl Into<String>, factory: Arc<dyn ElementFactory>) {
        self.factories.insert(key.into(), factory);
    }

    /// Register a factory function under a key
    pub fn register_fn(
        &mut self,
        key: impl Into<String>,
        create: impl Fn(&ElementDefinition) -> Result<Box<dyn PipelineElement>>
            + Send
            + Sync
            + 'static,
    ) {
        self.register(key, Arc::new(FnFactory(create)));
    }

    /// Resolve `module` + `class_name` and instantiate
    ///
    /// The qualified `module::class` key wins over the bare class name.
    /// A missing symbol is a load failure naming exactly what was looked
    /// up, and aborts pipeline startup.
    pub fn create(
        &self,
        module: &str,
        class_name: &str,
        definition: &ElementDefinition,
    ) -> Result<Box<dyn PipelineElement>> {
        let qualified = format!("{}::{}", module, class_name);
        let factory = self
            .factories
            .get(&qualified)
            .or_else(|| self.factories.get(class_name))
            .ok_or_else(|| {
                Error::Load(format!(
                    "element {}: no class {} in module {} (known: {:?})",
                    definition.name,
                    class_name,
                    module,
                    self.keys()
                ))
            })?;
        factory.create(definition)
    }

    /// True when a key is registered
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullElement;

    impl PipelineElement for NullElement {
        fn process_frame(
            &mut self,
            _stream: &mut Stream,
            _frame: &Frame,
            _inputs: &SMap,
        ) -> (StreamEvent, SMap) {
            (StreamEvent::Okay, SMap::new())
        }
    }

    fn definition(name: &str) -> ElementDefinition {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "deploy": {"local": {"module": "test"}}
        }))
        .unwrap()
    }

    #[test]
    fn qualified_key_wins_over_bare() {
        let mut registry = ElementRegistry::new();
        registry.register_fn("Null", |_| Ok(Box::new(NullElement)));
        registry.register_fn("test::Null", |_| Ok(Box::new(NullElement)));

        assert!(registry.create("test", "Null", &definition("PE_0")).is_ok());
        assert!(registry.create("other", "Null", &definition("PE_0")).is_ok());
    }

    #[test]
    fn missing_class_is_a_load_error_naming_the_symbol() {
        let registry = ElementRegistry::new();
        let error = registry
            .create("test", "Missing", &definition("PE_0"))
            .unwrap_err();
        let Error::Load(message) = error else {
            panic!("expected load error");
        };
        assert!(message.contains("Missing"));
        assert!(message.contains("PE_0"));
    }

    #[test]
    fn created_element_processes() {
        let mut registry = ElementRegistry::new();
        registry.register_fn("Null", |_| Ok(Box::new(NullElement)));
        let mut element = registry.create("m", "Null", &definition("PE_0")).unwrap();

        let mut stream = Stream::new(0, SMap::new(), 0.0);
        let frame = Frame::new(0, 0, SMap::new());
        let (event, outputs) = element.process_frame(&mut stream, &frame, &SMap::new());
        assert_eq!(event, StreamEvent::Okay);
        assert!(outputs.is_empty());
    }
}
