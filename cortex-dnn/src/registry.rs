use std::collections::HashMap;

use cortex_core::{Error, Result};
use serde_json::Value;

use crate::{
    layer::Layer,
    layers::{
        Activation, BackLink, Dropout, EltwiseDiv, EltwiseMax, EltwiseMul, EltwiseNegMul,
        EltwiseSub, EltwiseSum, FullyConnected, Lstm, Merge, Recurrent, Sink, Source, Split,
    },
};

/// Builds a layer from the version and body of its record.
pub type LayerFactory = fn(u32, Value, &LayerRegistry) -> Result<Box<dyn Layer>>;

/// Maps layer kinds to the factories that rebuild them from an archive.
///
/// [`LayerRegistry::default`] knows every layer of this crate; custom layers
/// are added with [`LayerRegistry::register`].
pub struct LayerRegistry {
    factories: HashMap<&'static str, LayerFactory>,
}

impl LayerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, factory: LayerFactory) -> &mut Self {
        if self.factories.insert(kind, factory).is_some() {
            log::debug!("replaced the factory of layer kind `{}`", kind);
        }
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn create(&self, kind: &str, version: u32, body: Value) -> Result<Box<dyn Layer>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::Configuration(format!("unknown layer kind `{}`", kind)))?;
        factory(version, body, self)
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Source::KIND, Source::load)
            .register(Sink::KIND, Sink::load)
            .register(EltwiseSum::KIND, EltwiseSum::load)
            .register(EltwiseSub::KIND, EltwiseSub::load)
            .register(EltwiseMul::KIND, EltwiseMul::load)
            .register(EltwiseNegMul::KIND, EltwiseNegMul::load)
            .register(EltwiseMax::KIND, EltwiseMax::load)
            .register(EltwiseDiv::KIND, EltwiseDiv::load)
            .register(Split::KIND, Split::load)
            .register(Merge::KIND, Merge::load)
            .register(FullyConnected::KIND, FullyConnected::load)
            .register(Activation::KIND, Activation::load)
            .register(Dropout::KIND, Dropout::load)
            .register(BackLink::KIND, BackLink::load)
            .register(Recurrent::KIND, Recurrent::load)
            .register(Lstm::KIND, Lstm::load);
        registry
    }
}
