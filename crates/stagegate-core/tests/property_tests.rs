//! # Property-Based Tests
//!
//! Invariants of token signing, material shortage arithmetic and the
//! one-active-token rule, checked with proptest.

use proptest::prelude::*;
use stagegate_core::primitives::DEFAULT_MAX_TOKEN_LIFETIME_SECS;
use stagegate_core::{
    CapabilitySet, HandoffOutcome, ManualClock, MaterialGate, MaterialRequirement, MemoryStore,
    OrderId, Principal, Quantity, RequirementBook, RetryPolicy, Stage, StageEngine, StageIndex,
    StageRegistry, StockTable, TokenError, TokenSigner, TokenState,
};
use std::sync::Arc;

const SECRET: &[u8] = b"property-test-secret-with-32-bytes!";
const T0: u64 = 1_760_000_000;

fn signer() -> TokenSigner {
    TokenSigner::new(SECRET, DEFAULT_MAX_TOKEN_LIFETIME_SECS).expect("signer")
}

fn gate_with(required: i64, available: i64) -> MaterialGate {
    let stock = Arc::new(StockTable::default());
    stock
        .set_stock("Foam-35", Quantity::from_milli(available))
        .expect("stock");
    MaterialGate::new(
        RequirementBook::new(vec![MaterialRequirement {
            stage_index: StageIndex(1),
            material_name: "Foam-35".to_string(),
            required_quantity: Quantity::from_milli(required),
            unit: "sheet".to_string(),
            is_required: true,
        }]),
        stock,
    )
}

// =============================================================================
// TOKENS
// =============================================================================

proptest! {
    /// A freshly signed token verifies back to the same binding.
    #[test]
    fn signed_token_verifies_to_its_binding(
        order in 1u64..1_000_000,
        stage in 0u32..64,
        age in 0u64..=DEFAULT_MAX_TOKEN_LIFETIME_SECS,
    ) {
        let signer = signer();
        let token = signer.sign(OrderId(order), StageIndex(stage), T0);

        let verified = signer.verify(&token.to_json().expect("json"), T0 + age).expect("valid");
        prop_assert_eq!(verified.order_id, OrderId(order));
        prop_assert_eq!(verified.stage_id, StageIndex(stage));
        prop_assert_eq!(verified.issued_at, T0);

        let scanned = signer.verify(&token.to_scan_code().expect("scan"), T0 + age).expect("valid");
        prop_assert_eq!(scanned, verified);
    }

    /// Changing any single signature character is detected.
    #[test]
    fn signature_mutation_is_tampered(
        order in 1u64..1_000_000,
        position in 0usize..64,
        replacement in 0u8..16,
    ) {
        let signer = signer();
        let mut token = signer.sign(OrderId(order), StageIndex(2), T0);
        let mut chars: Vec<char> = token.signature.chars().collect();
        let new = char::from_digit(u32::from(replacement), 16).expect("hex digit");
        prop_assume!(chars[position] != new);
        chars[position] = new;
        token.signature = chars.into_iter().collect();

        let result = signer.verify(&token.to_json().expect("json"), T0);
        prop_assert_eq!(result, Err(TokenError::Tampered));
    }

    /// Rebinding a signature to another order or stage is detected.
    #[test]
    fn rebinding_is_tampered(
        order in 1u64..1_000_000,
        other in 1u64..1_000_000,
        stage in 0u32..16,
    ) {
        prop_assume!(order != other);
        let signer = signer();
        let mut token = signer.sign(OrderId(order), StageIndex(stage), T0);
        token.order_id = OrderId(other);
        prop_assert_eq!(
            signer.verify(&token.to_json().expect("json"), T0),
            Err(TokenError::Tampered)
        );

        let mut token = signer.sign(OrderId(order), StageIndex(stage), T0);
        token.stage_id = StageIndex(stage + 1);
        prop_assert_eq!(
            signer.verify(&token.to_json().expect("json"), T0),
            Err(TokenError::Tampered)
        );
    }

    /// Tokens expire strictly after the configured lifetime.
    #[test]
    fn expiry_boundary(lifetime in 1u64..100_000, past in 1u64..1_000) {
        let signer = TokenSigner::new(SECRET, lifetime).expect("signer");
        let raw = signer.sign(OrderId(1), StageIndex(0), T0).to_json().expect("json");

        prop_assert!(signer.verify(&raw, T0 + lifetime).is_ok());
        let expired = matches!(
            signer.verify(&raw, T0 + lifetime + past),
            Err(TokenError::Expired { .. })
        );
        prop_assert!(expired);
    }
}

// =============================================================================
// MATERIAL GATE
// =============================================================================

proptest! {
    /// Missing quantity is max(0, required - available).
    #[test]
    fn shortage_is_never_negative(required in 0i64..1_000_000, available in 0i64..1_000_000) {
        let missing = Quantity::from_milli(required)
            .shortage_against(Quantity::from_milli(available));
        prop_assert_eq!(missing.milli(), (required - available).max(0));
    }

    /// The gate is clear exactly when stock covers the requirement.
    #[test]
    fn gate_clear_iff_stock_covers(required in 1i64..100_000, available in 0i64..100_000) {
        let decision = gate_with(required, available).evaluate(OrderId(1), StageIndex(1), &[], T0);

        prop_assert_eq!(decision.is_clear(), available >= required);
        if let Some(shortage) = decision.shortages.first() {
            prop_assert_eq!(shortage.missing.milli(), required - available);
            prop_assert_eq!(decision.writes.len(), 1);
        }
    }
}

// =============================================================================
// SINGLE ACTIVE TOKEN
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However many times a handoff is requested, only the newest token is active.
    #[test]
    fn one_active_token_per_order(gaps in proptest::collection::vec(1u64..600, 1..8)) {
        let registry = StageRegistry::new(vec![Stage::new(0, "KB"), Stage::new(1, "Frame")])
            .expect("registry");
        let clock = Arc::new(ManualClock::new(T0));
        let engine = StageEngine::new(
            Arc::new(registry),
            gate_with(1_000, 1_000),
            signer(),
            Arc::new(MemoryStore::new()),
        )
        .with_clock(clock.clone())
        .with_retry(RetryPolicy::immediate(3));
        let lead = Principal::new("lead", CapabilitySet::supervisor());
        engine.register_order(&lead, OrderId(9), Some(StageIndex(0))).expect("register");

        let mut issued = Vec::new();
        for gap in gaps {
            clock.advance(gap);
            match engine.request_handoff(&lead, OrderId(9), StageIndex(1)).expect("request") {
                HandoffOutcome::Issued(handoff) => issued.push(handoff),
                HandoffOutcome::Blocked(report) => prop_assert!(false, "blocked: {:?}", report),
            }
        }

        let newest = issued.last().expect("issued").token_id;
        let summary = engine.order_summary(OrderId(9)).expect("summary");
        prop_assert_eq!(summary.active_token, Some(newest));

        let active = issued
            .iter()
            .filter(|h| engine.inspect_token(&h.raw).expect("inspect").state == TokenState::Active)
            .count();
        prop_assert_eq!(active, 1);
    }
}
