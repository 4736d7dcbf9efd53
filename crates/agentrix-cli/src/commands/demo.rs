//! End-to-end walk through the core, entirely in memory

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use colored::*;
use rust_decimal::Decimal;
use serde::Serialize;

use agentrix_audit::{
    verify_merkle_proof, AnchorService, AuditLedger, AuditProof, AuditStore, InMemoryAuditStore,
};
use agentrix_authz::{
    AuthorizationRegistry, CreateAuthorization, EvaluationContext, InMemoryAuthorizationStore,
    InMemoryPaymentHistory, InMemoryPolicyStore, PolicyEvaluator, UsageAggregator,
};
use agentrix_budget::{
    ApproveMilestone, ApprovalType, Artifact, BudgetEngine, CreateMilestone, CreatePool, FundPool,
    FundingSource, GateOperator, Participant, QualityGate, SettlementGateway,
};
use agentrix_gateway::{
    AgentPaymentGateway, AgentPaymentRequest, ExecutionReceipt, PaymentExecutor, PaymentOrder,
    PaymentOutcome, RequestSignature,
};
use agentrix_split::{PaymentType, PayoutLine, PlanSelector, PreviewRequest, ProductType, SplitEngine};
use agentrix_types::{
    AgentId, EngineConfig, Keypair, MerchantId, MicroAmount, MilestoneId, PaymentId,
    PaymentIntentId, Result, UserId,
};

use crate::display;

/// Settles every payment immediately
struct InstantExecutor;

#[async_trait]
impl PaymentExecutor for InstantExecutor {
    async fn execute(&self, order: &PaymentOrder) -> Result<ExecutionReceipt> {
        Ok(ExecutionReceipt {
            payment_id: PaymentId::new(),
            reference: Some(format!("demo-tx-{}", order.payment_intent_id)),
            completed_at: Utc::now(),
        })
    }
}

struct InstantSettlement;

#[async_trait]
impl SettlementGateway for InstantSettlement {
    async fn settle(&self, milestone_id: &MilestoneId, payouts: &[PayoutLine]) -> Result<String> {
        Ok(format!("demo-settlement-{}-{}", milestone_id, payouts.len()))
    }
}

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub outcomes: Vec<PaymentOutcome>,
    pub daily_remaining: Option<Decimal>,
    pub payouts: Vec<PayoutLine>,
    pub merkle_root: Option<String>,
    pub chain_length: usize,
    pub chain_valid: bool,
}

pub async fn run(export: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let (summary, proofs) = execute(!json).await?;

    if let Some(path) = export {
        std::fs::write(&path, serde_json::to_string_pretty(&proofs)?)?;
        if !json {
            display::success(&format!("Exported {} proofs to {}", proofs.len(), path.display()));
        }
    }

    if json {
        display::json(&summary)?;
    } else {
        println!();
        println!("{}", "Demo complete".bright_green().bold());
    }
    Ok(())
}

/// Run the flow, returning its summary and the agent's audit chain
pub async fn execute(verbose: bool) -> anyhow::Result<(DemoSummary, Vec<AuditProof>)> {
    let say = |f: &dyn Fn()| {
        if verbose {
            f()
        }
    };

    let config = EngineConfig::from_env();
    let offset = config.day_offset();
    let user = UserId::from_raw("demo-user");
    let agent = AgentId::from_raw("demo-agent");
    let agent_key = Keypair::generate();

    let registry = AuthorizationRegistry::new(Arc::new(InMemoryAuthorizationStore::new()), offset);
    let evaluator = PolicyEvaluator::new(
        registry.clone(),
        UsageAggregator::new(Arc::new(InMemoryPaymentHistory::new()), offset),
        Arc::new(InMemoryPolicyStore::new()),
    );
    let store = Arc::new(InMemoryAuditStore::new());
    let ledger = Arc::new(AuditLedger::new(store.clone(), config.chain_append_retries));
    let gateway = AgentPaymentGateway::new(evaluator, ledger.clone(), Arc::new(InstantExecutor), &config);

    // ------------------------------------------------------------------
    say(&|| display::section("1. Spending grant"));
    let grant = registry
        .create(CreateAuthorization {
            user_id: user.clone(),
            agent_id: Some(agent.clone()),
            description: Some("demo grant".to_string()),
            single_tx_limit: Some(Decimal::from(100)),
            daily_limit: Some(Decimal::from(250)),
            ..Default::default()
        })
        .await?;
    say(&|| {
        display::success(&format!("Grant {} issued to {}", grant.id, agent));
        display::kv("single tx limit", "100");
        display::kv("daily limit", "250");
    });

    // ------------------------------------------------------------------
    say(&|| display::section("2. Agent payments"));
    let payment = |amount: i64| AgentPaymentRequest {
        payment_intent_id: PaymentIntentId::new(),
        idempotency_key: None,
        user_id: user.clone(),
        agent_id: agent.clone(),
        merchant_id: MerchantId::from_raw("demo-merchant"),
        amount: Decimal::from(amount),
        currency: "USD".to_string(),
        context: EvaluationContext::default(),
        signature: None,
    };

    let mut outcomes = Vec::new();

    let mut signed = payment(40);
    signed.signature = Some(RequestSignature {
        public_key: agent_key.public_key_hex(),
        signature: agent_key.sign(&signed.signing_payload()?),
    });
    let first = gateway.execute(signed).await?;
    say(&|| describe(&first, "40 (signed)"));
    outcomes.push(first);

    let over_limit = gateway.execute(payment(150)).await?;
    say(&|| describe(&over_limit, "150"));
    if let PaymentOutcome::PendingConfirmation { confirmation_id, .. } = &over_limit {
        let confirmed = gateway.confirm(&user, confirmation_id).await?;
        say(&|| describe(&confirmed, "150 after user confirmation"));
        outcomes.push(over_limit.clone());
        outcomes.push(confirmed);
    } else {
        outcomes.push(over_limit);
    }

    let mut forged = payment(10);
    forged.signature = Some(RequestSignature {
        public_key: agent_key.public_key_hex(),
        signature: Keypair::generate().sign(&forged.signing_payload()?),
    });
    let denied = gateway.execute(forged).await?;
    say(&|| describe(&denied, "10 (forged signature)"));
    outcomes.push(denied);

    let headroom = gateway.evaluator().quick_evaluation(&user, &agent).await?;
    say(&|| {
        display::labeled(
            "Daily headroom",
            &headroom
                .daily_remaining
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
        )
    });

    // ------------------------------------------------------------------
    say(&|| display::section("3. Split preview"));
    let splits = SplitEngine::new(&config);
    let preview = splits.preview(&PreviewRequest {
        amount: MicroAmount::from_decimal(Decimal::from(100))?,
        plan: PlanSelector::ProductType {
            owner: None,
            product_type: ProductType::Skill,
        },
        payment_type: PaymentType::Onramp,
        split: None,
        recipients: [
            ("{{executor}}".to_string(), "alice".to_string()),
            ("{{referrer}}".to_string(), "bob".to_string()),
        ]
        .into_iter()
        .collect(),
    })?;
    say(&|| {
        display::kv("fees", &display::units(preview.fees.total));
        for line in &preview.allocations {
            display::kv(&line.recipient, &display::units(line.amount));
        }
        display::kv("merchant net", &display::units(preview.merchant_net));
    });

    // ------------------------------------------------------------------
    say(&|| display::section("4. Budget pool and milestone"));
    let budget = BudgetEngine::new().with_settlement(Arc::new(InstantSettlement));
    let pool = budget
        .create_pool(
            &user,
            CreatePool {
                name: "Demo project".to_string(),
                description: None,
                currency: "USD".to_string(),
                total_budget: MicroAmount::from_decimal(Decimal::from(1000))?,
                funding_source: FundingSource::Wallet,
                split_plan_id: None,
                expires_at: None,
            },
        )
        .await?;
    let pool = budget
        .fund_pool(
            &user,
            &pool.id,
            FundPool {
                amount: pool.total_budget,
                wallet_address: Some("0xdemo".to_string()),
                ..Default::default()
            },
        )
        .await?;
    say(&|| display::success(&format!("Pool {} is {}", pool.id, pool.status)));

    let milestone = budget
        .create_milestone(
            &user,
            &pool.id,
            CreateMilestone::new(
                "Deliver report",
                MicroAmount::from_decimal(Decimal::from(400))?,
                ApprovalType::QualityGate,
            )
            .with_participants(vec![
                Participant::new("alice", "executor").with_share(7000),
                Participant::new("bob", "reviewer").with_share(3000),
            ])
            .with_gate(QualityGate {
                metric: "accuracy".to_string(),
                threshold: Decimal::from(80),
                operator: GateOperator::Gte,
            }),
        )
        .await?;

    let alice = UserId::from_raw("alice");
    budget.start_milestone(&alice, &milestone.id).await?;
    budget
        .submit_milestone(
            &alice,
            &milestone.id,
            vec![Artifact {
                name: "report".to_string(),
                uri: "https://example.invalid/report.pdf".to_string(),
            }],
        )
        .await?;
    budget
        .approve_milestone(
            &user,
            &milestone.id,
            ApproveMilestone {
                reviewer: user.to_string(),
                quality_score: Some(Decimal::from(92)),
                note: None,
            },
        )
        .await?;
    let released = budget.release_milestone(&user, &milestone.id).await?;
    let stats = budget.pool_stats(&pool.id).await?;
    say(&|| {
        display::success(&format!("Milestone {} released", released.id));
        for line in &released.payouts {
            display::kv(&line.recipient, &display::units(line.amount));
        }
        display::kv("pool available", &display::units(stats.available));
    });

    // ------------------------------------------------------------------
    say(&|| display::section("5. Anchoring and verification"));
    let anchors = AnchorService::new(store.clone(), config.anchor_window());
    let anchor = anchors
        .anchor_previous_window(Utc::now() + config.anchor_window())
        .await?;

    let proofs = store.chain(agent.as_str()).await?;
    if let (Some(anchor), Some(first)) = (&anchor, proofs.first()) {
        let inclusion = anchors.inclusion_proof(anchor, &first.id).await?;
        let included = verify_merkle_proof(&inclusion.leaf, &inclusion.steps, &anchor.merkle_root);
        say(&|| {
            display::labeled("Window", &anchor.window_id);
            display::labeled("Merkle root", &display::short_hash(&anchor.merkle_root));
            if included {
                display::success("First proof is included in the anchored root");
            } else {
                display::error("Inclusion proof did not verify");
            }
        });
    }

    let report = ledger.verify_chain(agent.as_str(), None).await?;
    say(&|| {
        if report.valid {
            display::success(&format!("Audit chain of {} proofs verifies", report.length));
        } else {
            display::error("Audit chain is broken");
        }
    });

    let summary = DemoSummary {
        outcomes,
        daily_remaining: headroom.daily_remaining,
        payouts: released.payouts,
        merkle_root: anchor.map(|a| a.merkle_root),
        chain_length: report.length,
        chain_valid: report.valid,
    };
    Ok((summary, proofs))
}

fn describe(outcome: &PaymentOutcome, label: &str) {
    match outcome {
        PaymentOutcome::Executed { payment_id, .. } => {
            display::success(&format!("{} executed as {}", label, payment_id))
        }
        PaymentOutcome::PendingConfirmation { reason, expires_at, .. } => display::warning(&format!(
            "{} needs user confirmation ({}), expires {}",
            label, reason, expires_at
        )),
        PaymentOutcome::Failed { reason, .. } => display::error(&format!("{} failed: {}", label, reason)),
        PaymentOutcome::Denied { code, .. } => display::error(&format!("{} denied: {}", label, code)),
    }
}
