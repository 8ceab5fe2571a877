use std::sync::Arc;

use async_trait::async_trait;
use aws_mutation_gate_mcp::{
    GateDecision, MutationGate, MutationRequest, OperationKind, OwnershipGate, ServerConfig, ServerMode,
    TagInspector, TagLookup, TagLookupError,
};

/// Pretends every broker was created by this server.
struct OwnedEverywhere;

#[async_trait]
impl TagInspector for OwnedEverywhere {
    async fn fetch_ownership_tag(&self, _resource_id: &str) -> Result<TagLookup, TagLookupError> {
        Ok(TagLookup::from_tags([("mcp_server_version", env!("CARGO_PKG_VERSION"))]))
    }
}

#[tokio::main]
async fn main() {
    let arn = "arn:aws:mq:us-west-2:123456789012:broker:orders:b-1234";
    let requests = [
        MutationRequest::read(),
        MutationRequest::create(),
        MutationRequest::on_resource(OperationKind::Update, arn),
        MutationRequest::on_resource(OperationKind::RebootOrRestart, arn),
    ];

    for mode in [ServerMode::ReadOnly, ServerMode::AllowWrite, ServerMode::AllowCreate] {
        let gate = MutationGate::new(&ServerConfig::with_mode(mode), Arc::new(OwnedEverywhere));
        println!("mode: {}", gate.mode());
        for request in &requests {
            let verdict = match gate.authorize(request).await {
                GateDecision::Allow => "allowed".to_string(),
                GateDecision::AllowCreate(obligation) => {
                    format!("allowed, tag new resource with {}={}", obligation.tag().key, obligation.tag().value)
                }
                GateDecision::Deny(reason) => format!("denied ({})", reason),
            };
            println!("  {:<18} {}", request.operation.as_str(), verdict);
        }
    }
}
