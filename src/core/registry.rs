//! Explicit registries mapping text tags to constructors.
//!
//! Persistence and command line tools need to turn a tag such as `EDGE_SE2` or a
//! kernel name such as `Huber` into an object. The registries are ordinary values
//! owned by the application and handed to whoever needs them.

use crate::core::robust_kernel::{
    CauchyKernel, DcsKernel, FairKernel, GemanMcClureKernel, HuberKernel, PseudoHuberKernel,
    SaturatedKernel, ScaleDeltaKernel, TukeyKernel, WelschKernel,
};
use crate::core::{CoreError, CoreResult, Edge, RobustKernel, Vertex};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

type VertexFactory = Box<dyn Fn() -> Box<dyn Vertex> + Send + Sync>;
type EdgeFactory = Box<dyn Fn() -> Box<dyn Edge> + Send + Sync>;
type KernelFactory = Box<dyn Fn(f64) -> CoreResult<Box<dyn RobustKernel>> + Send + Sync>;

/// Vertex and edge constructors keyed by tag, with the reverse mapping from
/// concrete type to tag used when writing.
#[derive(Default)]
pub struct TypeRegistry {
    vertices: BTreeMap<String, VertexFactory>,
    edges: BTreeMap<String, EdgeFactory>,
    tags: HashMap<TypeId, String>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("vertices", &self.vertices.keys().collect::<Vec<_>>())
            .field("edges", &self.edges.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vertex type under `tag`. Fails if the tag or type is already known.
    pub fn register_vertex<T>(&mut self, tag: &str) -> CoreResult<()>
    where
        T: Vertex + Default + 'static,
    {
        self.check_free(tag, TypeId::of::<T>())?;
        self.vertices
            .insert(tag.to_string(), Box::new(|| Box::new(T::default())));
        self.tags.insert(TypeId::of::<T>(), tag.to_string());
        Ok(())
    }

    /// Register an edge type under `tag`. Fails if the tag or type is already known.
    pub fn register_edge<T>(&mut self, tag: &str) -> CoreResult<()>
    where
        T: Edge + Default + 'static,
    {
        self.check_free(tag, TypeId::of::<T>())?;
        self.edges
            .insert(tag.to_string(), Box::new(|| Box::new(T::default())));
        self.tags.insert(TypeId::of::<T>(), tag.to_string());
        Ok(())
    }

    fn check_free(&self, tag: &str, type_id: TypeId) -> CoreResult<()> {
        if self.vertices.contains_key(tag) || self.edges.contains_key(tag) {
            return Err(CoreError::Registry(format!("tag '{}' is already registered", tag)).log());
        }
        if let Some(existing) = self.tags.get(&type_id) {
            return Err(CoreError::Registry(format!(
                "type is already registered as '{}'",
                existing
            ))
            .log());
        }
        Ok(())
    }

    pub fn is_vertex_tag(&self, tag: &str) -> bool {
        self.vertices.contains_key(tag)
    }

    pub fn is_edge_tag(&self, tag: &str) -> bool {
        self.edges.contains_key(tag)
    }

    pub fn create_vertex(&self, tag: &str) -> CoreResult<Box<dyn Vertex>> {
        self.vertices
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| CoreError::Registry(format!("unknown vertex tag '{}'", tag)))
    }

    pub fn create_edge(&self, tag: &str) -> CoreResult<Box<dyn Edge>> {
        self.edges
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| CoreError::Registry(format!("unknown edge tag '{}'", tag)))
    }

    /// Tag of a vertex's concrete type.
    pub fn vertex_tag(&self, vertex: &dyn Vertex) -> Option<&str> {
        self.tags.get(&vertex.as_any().type_id()).map(String::as_str)
    }

    /// Tag of an edge's concrete type.
    pub fn edge_tag(&self, edge: &dyn Edge) -> Option<&str> {
        self.tags.get(&edge.as_any().type_id()).map(String::as_str)
    }

    pub fn vertex_tags(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    pub fn edge_tags(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }
}

/// Robust kernel constructors keyed by name.
#[derive(Default)]
pub struct RobustKernelRegistry {
    kernels: BTreeMap<String, KernelFactory>,
}

impl std::fmt::Debug for RobustKernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kernels.keys()).finish()
    }
}

impl RobustKernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every kernel shipped with the library.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert("Huber", |d| Ok(Box::new(HuberKernel::new(d)?)));
        registry.insert("PseudoHuber", |d| Ok(Box::new(PseudoHuberKernel::new(d)?)));
        registry.insert("Cauchy", |d| Ok(Box::new(CauchyKernel::new(d)?)));
        registry.insert("GemanMcClure", |d| Ok(Box::new(GemanMcClureKernel::new(d)?)));
        registry.insert("Welsch", |d| Ok(Box::new(WelschKernel::new(d)?)));
        registry.insert("Fair", |d| Ok(Box::new(FairKernel::new(d)?)));
        registry.insert("Tukey", |d| Ok(Box::new(TukeyKernel::new(d)?)));
        registry.insert("Saturated", |d| Ok(Box::new(SaturatedKernel::new(d)?)));
        registry.insert("DCS", |d| Ok(Box::new(DcsKernel::new(d)?)));
        registry.insert("ScaleDelta", |d| Ok(Box::new(ScaleDeltaKernel::new(d)?)));
        registry
    }

    /// Register a kernel constructor, replacing any previous one with the same name.
    pub fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(f64) -> CoreResult<Box<dyn RobustKernel>> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, delta: f64) -> CoreResult<Box<dyn RobustKernel>> {
        let factory = self.kernels.get(name).ok_or_else(|| {
            CoreError::Registry(format!(
                "unknown robust kernel '{}', available: {}",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
            .log()
        })?;
        factory(delta)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }
}
