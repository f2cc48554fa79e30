// ============================================================================
// Dispatch Pipeline
// ============================================================================
//
// Every container-mediated call runs through an ordered chain of stages:
// exception translation, transaction policy, cache scoping, connection
// tracking, instance binding, security, and finally business dispatch. Each
// stage wraps the rest of the chain via an explicit continuation, so a stage
// can act before and after the stages inside it.
//
// All per-call state travels in the `InvocationContext`; there is no ambient
// current-transaction or current-instance anywhere.
// ============================================================================

pub mod stages;

pub use stages::{
    BusinessDispatchStage, CacheScopeStage, ConnectionTrackingStage, ExceptionTranslationStage,
    InstanceBindingStage, SecurityStage, TransactionPolicyStage,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{ContainerError, InstanceId, InvocationId, Outcome, StateMap, Value};
use crate::descriptor::ComponentDescriptor;
use crate::instance::InstanceEntry;
use crate::transaction::TransactionId;

/// What a call is aimed at.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationTarget {
    /// No specific target yet (entity create)
    None,
    /// A stateful conversation
    Session(InstanceId),
    /// An entity row by primary key
    Entity(Value),
}

/// Immutable description of one incoming call.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub component: String,
    pub method: String,
    pub args: Vec<Value>,
    pub target: InvocationTarget,
    /// Caller principal, if the transport authenticated one
    pub caller: Option<String>,
    /// Invocation this call nests under. A business method calling back
    /// into its own instance passes its own id here so the concurrency
    /// guard recognizes the re-entry instead of timing out against itself.
    pub chain: Option<InvocationId>,
}

/// Mutable per-call state threaded through the stage chain.
pub struct InvocationContext {
    pub invocation: InvocationId,
    pub request: InvocationRequest,
    pub descriptor: Option<Arc<ComponentDescriptor>>,
    /// Transaction this call currently runs under
    pub transaction: Option<TransactionId>,
    /// Whether this call began `transaction` itself (and must complete it)
    pub owns_transaction: bool,
    /// Bound stateful instance, guard held, between binding and checkin
    pub entry: Option<Arc<InstanceEntry>>,
    /// Scratch state handed to entity callbacks, which have no conversation
    pub scratch: StateMap,
    /// Labels of resources the connection-tracking stage releases on unwind
    pub tracked_connections: Vec<String>,
}

impl InvocationContext {
    pub fn new(request: InvocationRequest) -> Self {
        Self {
            invocation: request.chain.unwrap_or_else(InvocationId::new),
            request,
            descriptor: None,
            transaction: None,
            owns_transaction: false,
            entry: None,
            scratch: StateMap::new(),
            tracked_connections: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Arc<ComponentDescriptor>) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Run under an already-open, caller-managed transaction
    pub fn in_transaction(mut self, txn_id: TransactionId) -> Self {
        self.transaction = Some(txn_id);
        self
    }

    pub fn descriptor(&self) -> Result<&Arc<ComponentDescriptor>, ContainerError> {
        self.descriptor.as_ref().ok_or_else(|| {
            ContainerError::Execution(format!(
                "No descriptor bound for component '{}'",
                self.request.component
            ))
        })
    }
}

/// One layer of the dispatch chain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Outcome;
}

/// Continuation handed to each stage: the remainder of the chain.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut InvocationContext) -> Outcome {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(ctx, Next { stages: rest }).await,
            None => Outcome::System(ContainerError::Execution(
                "Dispatch chain ended without a terminal stage".to_string(),
            )),
        }
    }
}

/// An assembled stage chain.
pub struct DispatchPipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl DispatchPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder { stages: Vec::new() }
    }

    pub async fn run(&self, ctx: &mut InvocationContext) -> Outcome {
        Next {
            stages: &self.stages,
        }
        .run(ctx)
        .await
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Assembles a pipeline outermost-first.
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> DispatchPipeline {
        DispatchPipeline {
            stages: self.stages,
        }
    }
}
