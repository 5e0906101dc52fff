//! Integration tests for the stock ledger pipeline.
//!
//! Tests: request → MaterialStock aggregate → StockStore commit → EventBus
//!
//! Verifies:
//! - Weighted-average receipts land with exactly one movement each
//! - Rejected requests write nothing
//! - Commits are all-or-nothing and conflicts surface immediately
//! - Concurrent receipts on one material reconcile
//! - Tenant isolation is preserved

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use stockledger_core::{
        AggregateRoot, ExpectedVersion, LedgerContext, MovementId, TenantId, UserId,
    };
    use stockledger_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use stockledger_inventory::{
        ConsumeStock, HistoryEntry, HistoryKind, MaterialId, MaterialStock, ReceiveStock,
        RegisterMaterial, StockMovement,
    };

    use crate::config::{HistoryMode, LedgerConfig};
    use crate::ledger::{LedgerError, StockLedger};
    use crate::store::{
        ConsumptionWrite, InMemoryStockStore, ReceiptWrite, StockStore, StoreError,
    };

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn ctx() -> LedgerContext {
        LedgerContext::new(TenantId::new(), UserId::new())
    }

    fn ledger_with(config: LedgerConfig) -> StockLedger<Arc<InMemoryStockStore>, Bus> {
        StockLedger::new(
            Arc::new(InMemoryStockStore::new()),
            Arc::new(InMemoryEventBus::new()),
            config,
        )
    }

    fn ledger() -> StockLedger<Arc<InMemoryStockStore>, Bus> {
        ledger_with(LedgerConfig::default())
    }

    fn register<S: StockStore, B: EventBus<EventEnvelope<JsonValue>>>(
        ledger: &StockLedger<S, B>,
        ctx: &LedgerContext,
        name: &str,
        safety_minimum: Decimal,
    ) -> MaterialId {
        let material_id = MaterialId::generate();
        ledger
            .register_material(
                ctx,
                RegisterMaterial {
                    material_id,
                    name: name.to_string(),
                    unit: "kg".to_string(),
                    safety_minimum,
                    occurred_at: Utc::now(),
                },
            )
            .unwrap();
        material_id
    }

    fn receipt(material_id: MaterialId, quantity: Decimal, total_cost: Decimal) -> ReceiveStock {
        ReceiveStock {
            material_id,
            quantity_received: quantity,
            total_cost,
            supplier: Some("Metales Industriales".to_string()),
            invoice_reference: Some("FAC-2024-118".to_string()),
            occurred_at: Utc::now(),
        }
    }

    fn consumption(material_id: MaterialId, quantity: Decimal) -> ConsumeStock {
        ConsumeStock {
            material_id,
            quantity,
            reference: Some("OP-301".to_string()),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn receipt_on_existing_stock_moves_weighted_average() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Steel sheet", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(100), dec!(1000))).unwrap();

        let outcome = ledger.receive_stock(&ctx, receipt(id, dec!(100), dec!(2000))).unwrap();

        assert_eq!(outcome.material.quantity_on_hand(), dec!(200));
        assert_eq!(outcome.material.unit_cost(), dec!(15));
        assert_eq!(outcome.movement.quantity_received, dec!(100));
        assert_eq!(outcome.movement.total_cost, dec!(2000));
        assert_eq!(outcome.movement.incoming_unit_cost, dec!(20));
        assert_eq!(outcome.movement.recorded_by, ctx.user_id);
        assert_eq!(outcome.movement.supplier.as_deref(), Some("Metales Industriales"));

        let movements = ledger.movements(&ctx, id).unwrap();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1], outcome.movement);
        assert_eq!(ledger.get_material(&ctx, id).unwrap(), outcome.material);
    }

    #[test]
    fn first_receipt_sets_cost_from_incoming_price() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Copper rod", dec!(0));

        let outcome = ledger.receive_stock(&ctx, receipt(id, dec!(50), dec!(1000))).unwrap();

        assert_eq!(outcome.material.quantity_on_hand(), dec!(50));
        assert_eq!(outcome.material.unit_cost(), dec!(20));
        assert_eq!(outcome.material.version(), 2);
    }

    #[test]
    fn backdated_receipt_is_recorded_at_write_time() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Cast iron", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(1), dec!(10))).unwrap();

        let backdated = DateTime::parse_from_rfc3339("2001-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut request = receipt(id, dec!(1), dec!(30));
        request.occurred_at = backdated;

        let before = Utc::now();
        let outcome = ledger.receive_stock(&ctx, request).unwrap();

        assert_eq!(outcome.movement.occurred_at, backdated);
        assert!(outcome.movement.recorded_at >= before);

        // Listing follows write order, not business time.
        let movements = ledger.movements(&ctx, id).unwrap();
        assert_eq!(movements.last(), Some(&outcome.movement));
        assert!(movements[0].recorded_at <= movements[1].recorded_at);

        let last = ledger.history(&ctx, id).unwrap().pop().unwrap();
        assert_eq!(last.kind, HistoryKind::Receipt);
        assert_eq!(last.occurred_at, backdated);
        assert!(last.recorded_at >= before);
    }

    #[test]
    fn invalid_receipts_leave_state_unchanged() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Resin", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(100))).unwrap();
        let before = ledger.get_material(&ctx, id).unwrap();

        for (qty, cost) in [
            (dec!(0), dec!(10)),
            (dec!(-5), dec!(10)),
            (dec!(5), dec!(-1)),
            (dec!(5), dec!(0)),
        ] {
            let err = ledger.receive_stock(&ctx, receipt(id, qty, cost)).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidArgument(_)), "{qty}/{cost}: {err:?}");
        }

        assert_eq!(ledger.get_material(&ctx, id).unwrap(), before);
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 1);
    }

    #[test]
    fn zero_cost_receipt_allowed_when_configured() {
        let ledger = ledger_with(LedgerConfig {
            allow_zero_cost_receipts: true,
            ..LedgerConfig::default()
        });
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Sample pellets", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(100))).unwrap();

        let outcome = ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(0))).unwrap();
        assert_eq!(outcome.material.quantity_on_hand(), dec!(20));
        assert_eq!(outcome.material.unit_cost(), dec!(5));
        assert_eq!(outcome.movement.incoming_unit_cost, dec!(0));
    }

    #[test]
    fn unknown_material_is_not_found_and_writes_nothing() {
        let ledger = ledger();
        let ctx = ctx();
        let id = MaterialId::generate();

        let err = ledger.receive_stock(&ctx, receipt(id, dec!(5), dec!(50))).unwrap_err();
        assert_eq!(err, LedgerError::NotFound(id));
        assert_eq!(
            ledger.consume_stock(&ctx, consumption(id, dec!(1))).unwrap_err(),
            LedgerError::NotFound(id)
        );
        assert_eq!(ledger.get_material(&ctx, id).unwrap_err(), LedgerError::NotFound(id));

        assert!(ledger.list_materials(&ctx).unwrap().is_empty());
        assert!(ledger.store().list_movements(ctx.tenant_id, id).unwrap().is_empty());
        assert!(ledger.store().list_history(ctx.tenant_id, id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Zinc", dec!(5));

        let err = ledger
            .register_material(
                &ctx,
                RegisterMaterial {
                    material_id: id,
                    name: "Zinc again".to_string(),
                    unit: "kg".to_string(),
                    safety_minimum: dec!(0),
                    occurred_at: Utc::now(),
                },
            )
            .unwrap_err();

        assert_eq!(err, LedgerError::AlreadyExists(id));
        assert_eq!(ledger.get_material(&ctx, id).unwrap().name(), "Zinc");
    }

    #[test]
    fn identical_inputs_give_identical_state() {
        let tenant_id = TenantId::new();
        let user_id = UserId::new();
        let ctx = LedgerContext::new(tenant_id, user_id);
        let material_id = MaterialId::generate();
        let at = Utc::now();

        let run = || {
            let ledger = ledger();
            ledger
                .register_material(
                    &ctx,
                    RegisterMaterial {
                        material_id,
                        name: "Aluminium".to_string(),
                        unit: "kg".to_string(),
                        safety_minimum: dec!(20),
                        occurred_at: at,
                    },
                )
                .unwrap();
            for (qty, cost) in [(dec!(30), dec!(99.99)), (dec!(7), dec!(41.3)), (dec!(11), dec!(0.07))] {
                let mut request = receipt(material_id, qty, cost);
                request.occurred_at = at;
                ledger.receive_stock(&ctx, request).unwrap();
            }
            let mut request = consumption(material_id, dec!(12.5));
            request.occurred_at = at;
            ledger.consume_stock(&ctx, request).unwrap()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn concurrent_receipts_reconcile() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Brass fittings", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(100), dec!(1000))).unwrap();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = [(dec!(10), dec!(130)), (dec!(20), dec!(470))]
            .into_iter()
            .map(|(qty, cost)| {
                let ledger = ledger.clone();
                thread::spawn(move || ledger.receive_stock(&ctx, receipt(id, qty, cost)))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let material = ledger.get_material(&ctx, id).unwrap();
        assert_eq!(material.quantity_on_hand(), dec!(130));
        assert_eq!(material.version(), 4);

        // Each receipt rounds to 2 dp; the error per step is at most half a cent per unit.
        let expected_value = dec!(1000) + dec!(130) + dec!(470);
        let actual_value = material.quantity_on_hand() * material.unit_cost();
        assert!((actual_value - expected_value).abs() <= dec!(130) * dec!(0.005) * dec!(2));
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 3);
    }

    #[test]
    fn many_threads_on_one_material_lose_no_updates() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Bolts M8", dec!(0));
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        ledger.receive_stock(&ctx, receipt(id, dec!(1), dec!(2))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let material = ledger.get_material(&ctx, id).unwrap();
        assert_eq!(material.quantity_on_hand(), dec!(80));
        assert_eq!(material.unit_cost(), dec!(2));
        assert_eq!(material.version(), 81);
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 80);
    }

    #[test]
    fn consumption_keeps_cost_and_refuses_to_go_negative() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Paint base", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(40), dec!(600))).unwrap();

        let after = ledger.consume_stock(&ctx, consumption(id, dec!(15))).unwrap();
        assert_eq!(after.quantity_on_hand(), dec!(25));
        assert_eq!(after.unit_cost(), dec!(15));

        let err = ledger.consume_stock(&ctx, consumption(id, dec!(25.01))).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                available: dec!(25),
                requested: dec!(25.01),
            }
        );
        assert!(matches!(
            ledger.consume_stock(&ctx, consumption(id, dec!(0))),
            Err(LedgerError::InvalidArgument(_))
        ));
        assert_eq!(ledger.get_material(&ctx, id).unwrap(), after);
        // Consumption writes history only, never a movement.
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 1);
    }

    #[test]
    fn committed_changes_are_published_in_order() {
        let ledger = ledger();
        let sub = ledger.bus().subscribe();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Nickel", dec!(50));
        ledger.receive_stock(&ctx, receipt(id, dec!(100), dec!(500))).unwrap();
        ledger.consume_stock(&ctx, consumption(id, dec!(60))).unwrap();

        let published = sub.drain();
        let types: Vec<&str> = published.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "inventory.material.registered",
                "inventory.material.stock_received",
                "inventory.material.stock_consumed",
                "inventory.material.below_safety_minimum",
            ]
        );
        let sequences: Vec<u64> = published.iter().map(|e| e.sequence_number()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert!(published.iter().all(|e| e.tenant_id() == ctx.tenant_id));
        assert!(published.iter().all(|e| e.aggregate_id() == id.0));

        // Version tracks the last published sequence.
        assert_eq!(ledger.get_material(&ctx, id).unwrap().version(), 4);
    }

    #[test]
    fn rejected_requests_publish_nothing() {
        let ledger = ledger();
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Glass fibre", dec!(0));
        let sub = ledger.bus().subscribe();

        let _ = ledger.receive_stock(&ctx, receipt(id, dec!(-1), dec!(10)));
        let _ = ledger.consume_stock(&ctx, consumption(id, dec!(1)));

        assert!(sub.drain().is_empty());
    }

    #[test]
    fn history_follows_every_change_in_atomic_mode() {
        let ledger = ledger_with(LedgerConfig {
            history_mode: HistoryMode::Atomic,
            ..LedgerConfig::default()
        });
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Solder wire", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(8), dec!(96))).unwrap();
        ledger.consume_stock(&ctx, consumption(id, dec!(3))).unwrap();

        let history = ledger.history(&ctx, id).unwrap();
        let kinds: Vec<HistoryKind> = history.iter().map(|h| h.kind).collect();
        assert_eq!(
            kinds,
            vec![HistoryKind::Registration, HistoryKind::Receipt, HistoryKind::Consumption]
        );
        assert_eq!(history[1].quantity_after, dec!(8));
        assert_eq!(history[1].unit_cost_after, dec!(12));
        assert_eq!(history[2].quantity_delta, dec!(-3));
        assert!(history.iter().all(|h| h.recorded_by == ctx.user_id));
    }

    #[test]
    fn low_stock_and_valuation_summary() {
        let ledger = ledger();
        let ctx = ctx();
        let low = register(&ledger, &ctx, "Cobalt", dec!(50));
        let ok = register(&ledger, &ctx, "Aluminium", dec!(10));
        ledger.receive_stock(&ctx, receipt(low, dec!(100), dec!(250))).unwrap();
        ledger.consume_stock(&ctx, consumption(low, dec!(60))).unwrap();
        ledger.receive_stock(&ctx, receipt(ok, dec!(100), dec!(1000))).unwrap();
        ledger.receive_stock(&ctx, receipt(ok, dec!(100), dec!(2000))).unwrap();

        let low_stock = ledger.low_stock(&ctx).unwrap();
        assert_eq!(low_stock.len(), 1);
        assert_eq!(low_stock[0].id_typed(), low);

        let names: Vec<String> = ledger
            .list_materials(&ctx)
            .unwrap()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["Aluminium", "Cobalt"]);

        let summary = ledger.valuation_summary(&ctx).unwrap();
        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.below_minimum, 1);
        assert_eq!(summary.total_quantity, dec!(240));
        // 40 @ 2.50 + 200 @ 15
        assert_eq!(summary.total_value, dec!(3100));
    }

    #[test]
    fn tenants_are_isolated() {
        let ledger = ledger();
        let a = ctx();
        let b = ctx();
        let id = register(&ledger, &a, "Titanium", dec!(0));
        ledger.receive_stock(&a, receipt(id, dec!(5), dec!(500))).unwrap();

        assert_eq!(ledger.get_material(&b, id).unwrap_err(), LedgerError::NotFound(id));
        assert_eq!(
            ledger.receive_stock(&b, receipt(id, dec!(5), dec!(5))).unwrap_err(),
            LedgerError::NotFound(id)
        );
        assert!(ledger.list_materials(&b).unwrap().is_empty());
        assert_eq!(ledger.valuation_summary(&b).unwrap().total_items, 0);
        assert_eq!(ledger.get_material(&a, id).unwrap().quantity_on_hand(), dec!(5));
    }

    /// Wraps the in-memory store with switchable failures.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStockStore,
        fail_commits: AtomicBool,
        fail_history: AtomicBool,
        /// Sneak in a competing write just before the next commit.
        interfere: AtomicBool,
    }

    impl FlakyStore {
        fn competing_write(&self, tenant_id: TenantId, material: &MaterialStock) {
            if !self.interfere.swap(false, Ordering::SeqCst) {
                return;
            }
            let current = self
                .inner
                .get_material(tenant_id, material.id_typed())
                .unwrap()
                .unwrap();
            let bumped = MaterialStock::restore(
                current.id_typed(),
                tenant_id,
                current.name().to_string(),
                current.unit().to_string(),
                current.quantity_on_hand(),
                current.unit_cost(),
                current.safety_minimum(),
                current.version() + 1,
            );
            self.inner
                .commit_consumption(
                    tenant_id,
                    ConsumptionWrite {
                        material: bumped,
                        expected_version: ExpectedVersion::Exact(current.version()),
                        history: None,
                    },
                )
                .unwrap();
        }
    }

    impl StockStore for FlakyStore {
        fn insert_material(
            &self,
            tenant_id: TenantId,
            material: &MaterialStock,
            history: Option<&HistoryEntry>,
        ) -> Result<(), StoreError> {
            self.inner.insert_material(tenant_id, material, history)
        }

        fn get_material(
            &self,
            tenant_id: TenantId,
            material_id: MaterialId,
        ) -> Result<Option<MaterialStock>, StoreError> {
            self.inner.get_material(tenant_id, material_id)
        }

        fn list_materials(&self, tenant_id: TenantId) -> Result<Vec<MaterialStock>, StoreError> {
            self.inner.list_materials(tenant_id)
        }

        fn commit_receipt(
            &self,
            tenant_id: TenantId,
            write: ReceiptWrite,
        ) -> Result<StockMovement, StoreError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.competing_write(tenant_id, &write.material);
            self.inner.commit_receipt(tenant_id, write)
        }

        fn commit_consumption(
            &self,
            tenant_id: TenantId,
            write: ConsumptionWrite,
        ) -> Result<(), StoreError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.competing_write(tenant_id, &write.material);
            self.inner.commit_consumption(tenant_id, write)
        }

        fn append_history(
            &self,
            tenant_id: TenantId,
            entry: &HistoryEntry,
        ) -> Result<(), StoreError> {
            if self.fail_history.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("history table unavailable".to_string()));
            }
            self.inner.append_history(tenant_id, entry)
        }

        fn list_movements(
            &self,
            tenant_id: TenantId,
            material_id: MaterialId,
        ) -> Result<Vec<StockMovement>, StoreError> {
            self.inner.list_movements(tenant_id, material_id)
        }

        fn list_history(
            &self,
            tenant_id: TenantId,
            material_id: MaterialId,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            self.inner.list_history(tenant_id, material_id)
        }
    }

    fn flaky_ledger(mode: HistoryMode) -> StockLedger<Arc<FlakyStore>, Bus> {
        StockLedger::new(
            Arc::new(FlakyStore::default()),
            Arc::new(InMemoryEventBus::new()),
            LedgerConfig {
                history_mode: mode,
                ..LedgerConfig::default()
            },
        )
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let ledger = flaky_ledger(HistoryMode::Atomic);
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Magnesium", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(100))).unwrap();
        let before = ledger.get_material(&ctx, id).unwrap();
        let history_before = ledger.history(&ctx, id).unwrap();
        let sub = ledger.bus().subscribe();

        ledger.store().fail_commits.store(true, Ordering::SeqCst);
        let err = ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(300))).unwrap_err();

        assert!(matches!(err, LedgerError::StorageFailure(_)));
        assert!(!err.is_retryable());
        assert_eq!(ledger.get_material(&ctx, id).unwrap(), before);
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 1);
        assert_eq!(ledger.history(&ctx, id).unwrap(), history_before);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn stale_version_is_a_conflict_and_leaves_no_movement() {
        let ledger = flaky_ledger(HistoryMode::Atomic);
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Lead", dec!(0));
        ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(100))).unwrap();

        ledger.store().interfere.store(true, Ordering::SeqCst);
        let err = ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(300))).unwrap_err();

        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        assert!(err.is_retryable());
        let material = ledger.get_material(&ctx, id).unwrap();
        assert_eq!(material.quantity_on_hand(), dec!(10));
        assert_eq!(material.unit_cost(), dec!(10));
        assert_eq!(ledger.movements(&ctx, id).unwrap().len(), 1);
        assert_eq!(ledger.history(&ctx, id).unwrap().len(), 2);

        // The caller retries against the fresh version.
        let retried = ledger.receive_stock(&ctx, receipt(id, dec!(10), dec!(300))).unwrap();
        assert_eq!(retried.material.quantity_on_hand(), dec!(20));
        assert_eq!(retried.material.unit_cost(), dec!(20));
    }

    #[test]
    fn best_effort_history_failure_does_not_fail_the_receipt() {
        let ledger = flaky_ledger(HistoryMode::BestEffort);
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Tin", dec!(0));

        ledger.store().fail_history.store(true, Ordering::SeqCst);
        let outcome = ledger.receive_stock(&ctx, receipt(id, dec!(4), dec!(44))).unwrap();
        ledger.consume_stock(&ctx, consumption(id, dec!(1))).unwrap();

        assert_eq!(outcome.material.unit_cost(), dec!(11));
        assert_eq!(ledger.get_material(&ctx, id).unwrap().quantity_on_hand(), dec!(3));
        assert_eq!(ledger.movements(&ctx, id).unwrap(), vec![outcome.movement]);
        let kinds: Vec<HistoryKind> =
            ledger.history(&ctx, id).unwrap().iter().map(|h| h.kind).collect();
        assert_eq!(kinds, vec![HistoryKind::Registration]);
    }

    #[test]
    fn atomic_history_failure_rolls_back_the_receipt() {
        let ledger = flaky_ledger(HistoryMode::Atomic);
        let ctx = ctx();
        let id = register(&ledger, &ctx, "Chromium", dec!(0));
        let before = ledger.get_material(&ctx, id).unwrap();

        // A receipt whose history row collides is rejected as a whole.
        let current = ledger.store().get_material(ctx.tenant_id, id).unwrap().unwrap();
        let existing = ledger.history(&ctx, id).unwrap().remove(0);
        let next = MaterialStock::restore(
            id,
            ctx.tenant_id,
            current.name().to_string(),
            current.unit().to_string(),
            dec!(5),
            dec!(3),
            current.safety_minimum(),
            current.version() + 1,
        );
        let movement = StockMovement {
            id: MovementId::new(),
            tenant_id: ctx.tenant_id,
            material_id: id,
            quantity_received: dec!(5),
            total_cost: dec!(15),
            incoming_unit_cost: dec!(3),
            supplier: None,
            invoice_reference: None,
            recorded_by: ctx.user_id,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
        };
        let err = ledger
            .store()
            .commit_receipt(
                ctx.tenant_id,
                ReceiptWrite {
                    material: next,
                    expected_version: ExpectedVersion::Exact(current.version()),
                    movement,
                    history: Some(existing),
                },
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(ledger.get_material(&ctx, id).unwrap(), before);
        assert!(ledger.movements(&ctx, id).unwrap().is_empty());
        assert_eq!(ledger.history(&ctx, id).unwrap().len(), 1);
    }
}
