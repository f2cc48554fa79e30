// ============================================================================
// Deployment Descriptors
// ============================================================================
//
// The already-validated configuration graph the container consumes at deploy
// time. There is no metadata parsing here: callers assemble descriptors with
// the builder API and the container reads them, never writes them.
//
// Method dispatch is a static table: each method name maps to a strategy
// object invoked through an explicit `invoke(context, args)` call. Entity
// fields resolve to accessor pairs over cache-row slots, fixed at deploy time.
// ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheRow;
use crate::core::{AppError, InvocationId, StateMap, Value};

/// Deployed component types, keyed by component name.
pub type DeploymentMap = HashMap<String, Arc<ComponentDescriptor>>;

/// What flavour of managed object a descriptor deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// One conversation per client, state held across calls
    Stateful,
    /// Persistent identity backed by a transaction-scoped cache row
    Entity,
}

/// Declared transaction attribute of one business method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAttribute {
    Required,
    RequiresNew,
    Supports,
    NotSupported,
    Mandatory,
    Never,
}

/// Relationship cardinality as seen from the declaring side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Persistent field of an entity component, bound to one cache-row slot.
#[derive(Debug, Clone)]
pub struct CmpField {
    pub name: String,
    pub slot: usize,
}

/// Directional association between two entity components.
///
/// Physical join information is opaque to the container; cardinality and the
/// cascade-delete flag are all the lifecycle engine needs.
#[derive(Debug, Clone)]
pub struct RelationshipField {
    pub name: String,
    pub slot: usize,
    pub related_component: String,
    pub cardinality: Cardinality,
    pub cascade_delete: bool,
}

/// Mutable view handed to business methods and lifecycle callbacks.
///
/// Stateful methods see their conversational state; entity methods
/// additionally see their current cache row. The invocation id identifies
/// the call frame itself: a method that calls back into the container
/// passes it as the request chain so its own guard admits the re-entry.
pub struct MethodContext<'a> {
    pub invocation: InvocationId,
    pub state: &'a mut StateMap,
    pub row: Option<&'a mut CacheRow>,
}

impl MethodContext<'_> {
    /// Read a conversational state value
    pub fn get(&self, name: &str) -> Value {
        self.state.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Write a conversational state value
    pub fn set(&mut self, name: &str, value: Value) {
        self.state.insert(name.to_string(), value);
    }
}

/// One entry in a component's static dispatch table.
#[async_trait]
pub trait BusinessMethod: Send + Sync {
    async fn invoke(
        &self,
        ctx: &mut MethodContext<'_>,
        args: &[Value],
    ) -> std::result::Result<Value, AppError>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F> BusinessMethod for FnMethod<F>
where
    F: Fn(&mut MethodContext<'_>, &[Value]) -> std::result::Result<Value, AppError>
        + Send
        + Sync,
{
    async fn invoke(
        &self,
        ctx: &mut MethodContext<'_>,
        args: &[Value],
    ) -> std::result::Result<Value, AppError> {
        (self.0)(ctx, args)
    }
}

/// Wrap a plain closure as a [`BusinessMethod`]
pub fn method_fn<F>(f: F) -> Arc<dyn BusinessMethod>
where
    F: Fn(&mut MethodContext<'_>, &[Value]) -> std::result::Result<Value, AppError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMethod(f))
}

/// Lifecycle hook registered at deploy time.
///
/// Failures are reported as plain strings; the container classifies them
/// (propagate on business paths, log-and-swallow on scheduler paths).
pub type Callback =
    Arc<dyn Fn(&mut MethodContext<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// The full set of lifecycle hooks a component may register.
#[derive(Default, Clone)]
pub struct LifecycleCallbacks {
    pub post_construct: Option<Callback>,
    pub pre_destroy: Option<Callback>,
    pub pre_passivate: Option<Callback>,
    pub post_activate: Option<Callback>,
    pub before_create: Option<Callback>,
    pub after_create: Option<Callback>,
    pub before_load: Option<Callback>,
    pub after_store: Option<Callback>,
}

/// Business method plus its declared transaction attribute.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub tx_attribute: TxAttribute,
    pub method: Arc<dyn BusinessMethod>,
}

/// Validated deployment metadata for one managed-object type.
#[derive(Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub kind: ComponentKind,
    pub methods: HashMap<String, MethodDescriptor>,
    pub callbacks: LifecycleCallbacks,
    pub fields: Vec<CmpField>,
    pub relationships: Vec<RelationshipField>,
    /// Per-component override of the container-wide access timeout
    pub access_timeout: Option<Duration>,
    /// Per-component override of the idle timeout
    pub idle_timeout: Option<Duration>,
    /// Per-component override of the hard session timeout
    pub session_timeout: Option<Duration>,
}

impl ComponentDescriptor {
    /// Start a stateful component descriptor
    pub fn stateful(name: impl Into<String>) -> Self {
        Self::new(name, ComponentKind::Stateful)
    }

    /// Start an entity component descriptor
    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(name, ComponentKind::Entity)
    }

    fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            methods: HashMap::new(),
            callbacks: LifecycleCallbacks::default(),
            fields: Vec::new(),
            relationships: Vec::new(),
            access_timeout: None,
            idle_timeout: None,
            session_timeout: None,
        }
    }

    /// Register a business method under the given transaction attribute
    pub fn method(
        mut self,
        name: impl Into<String>,
        tx_attribute: TxAttribute,
        method: Arc<dyn BusinessMethod>,
    ) -> Self {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            MethodDescriptor {
                name,
                tx_attribute,
                method,
            },
        );
        self
    }

    /// Declare a persistent field; slots are assigned in declaration order
    pub fn field(mut self, name: impl Into<String>) -> Self {
        let slot = self.fields.len() + self.relationships.len();
        self.fields.push(CmpField {
            name: name.into(),
            slot,
        });
        self
    }

    /// Declare a relationship field
    pub fn relationship(
        mut self,
        name: impl Into<String>,
        related_component: impl Into<String>,
        cardinality: Cardinality,
        cascade_delete: bool,
    ) -> Self {
        let slot = self.fields.len() + self.relationships.len();
        self.relationships.push(RelationshipField {
            name: name.into(),
            slot,
            related_component: related_component.into(),
            cardinality,
            cascade_delete,
        });
        self
    }

    pub fn post_construct(mut self, cb: Callback) -> Self {
        self.callbacks.post_construct = Some(cb);
        self
    }

    pub fn pre_destroy(mut self, cb: Callback) -> Self {
        self.callbacks.pre_destroy = Some(cb);
        self
    }

    pub fn pre_passivate(mut self, cb: Callback) -> Self {
        self.callbacks.pre_passivate = Some(cb);
        self
    }

    pub fn post_activate(mut self, cb: Callback) -> Self {
        self.callbacks.post_activate = Some(cb);
        self
    }

    pub fn before_create(mut self, cb: Callback) -> Self {
        self.callbacks.before_create = Some(cb);
        self
    }

    pub fn after_create(mut self, cb: Callback) -> Self {
        self.callbacks.after_create = Some(cb);
        self
    }

    pub fn before_load(mut self, cb: Callback) -> Self {
        self.callbacks.before_load = Some(cb);
        self
    }

    pub fn after_store(mut self, cb: Callback) -> Self {
        self.callbacks.after_store = Some(cb);
        self
    }

    /// Override the container-wide access timeout for this component
    pub fn access_timeout(mut self, timeout: Duration) -> Self {
        self.access_timeout = Some(timeout);
        self
    }

    /// Override the container-wide idle timeout for this component
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Override the container-wide session timeout for this component
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Total slot count of an entity row (fields plus relationships)
    pub fn slot_count(&self) -> usize {
        self.fields.len() + self.relationships.len()
    }

    /// Look up a persistent field by name
    pub fn find_field(&self, name: &str) -> Option<&CmpField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relationship by name
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipField> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Look up a business method by name
    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Validate descriptor consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Component name cannot be empty".to_string());
        }

        if self.kind == ComponentKind::Stateful
            && (!self.fields.is_empty() || !self.relationships.is_empty())
        {
            return Err(format!(
                "Stateful component '{}' cannot declare persistent fields",
                self.name
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("fields", &self.fields)
            .field("relationships", &self.relationships)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateful_descriptor_builder() {
        let desc = ComponentDescriptor::stateful("Cart")
            .method(
                "add_item",
                TxAttribute::Required,
                method_fn(|ctx, args| {
                    let count = ctx.get("count").as_integer().unwrap_or(0);
                    ctx.set("count", Value::Integer(count + args.len() as i64));
                    Ok(Value::Null)
                }),
            )
            .access_timeout(Duration::from_millis(250));

        assert_eq!(desc.kind, ComponentKind::Stateful);
        assert!(desc.find_method("add_item").is_some());
        assert!(desc.find_method("missing").is_none());
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_entity_slot_assignment() {
        let desc = ComponentDescriptor::entity("Order")
            .field("total")
            .field("status")
            .relationship("line_items", "LineItem", Cardinality::Many, true);

        assert_eq!(desc.slot_count(), 3);
        assert_eq!(desc.find_field("status").unwrap().slot, 1);
        assert_eq!(desc.find_relationship("line_items").unwrap().slot, 2);
        assert!(desc.find_relationship("line_items").unwrap().cascade_delete);
    }

    #[test]
    fn test_stateful_with_fields_is_invalid() {
        let desc = ComponentDescriptor::stateful("Cart").field("oops");
        assert!(desc.validate().is_err());
    }

    #[tokio::test]
    async fn test_method_fn_invocation() {
        let method = method_fn(|ctx, _args| {
            ctx.set("touched", Value::Boolean(true));
            Ok(Value::Integer(1))
        });

        let mut state = StateMap::new();
        let mut ctx = MethodContext {
            invocation: InvocationId::new(),
            state: &mut state,
            row: None,
        };

        let result = method.invoke(&mut ctx, &[]).await.unwrap();
        assert_eq!(result, Value::Integer(1));
        assert_eq!(state.get("touched"), Some(&Value::Boolean(true)));
    }
}
