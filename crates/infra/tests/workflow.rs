//! End-to-end lifecycle tests against the in-memory store.

mod common;

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use quoteflow_core::{CategoryId, PartyId, ProductId};
use quoteflow_infra::event_store::EventStore;
use quoteflow_infra::{DispatchError, NewRequest, WorkflowConfig, WorkflowError};
use quoteflow_purchasing::PurchaseLineRef;
use quoteflow_quotation::{
    GroupingStrategy, Priority, PurchasingTerms, QuotationRequestId, RequestRevision, Stage,
};

use common::{eur, harness, harness_with, margin, usd, Harness};

fn new_request(h: &Harness, terms: PurchasingTerms) -> QuotationRequestId {
    h.controller
        .create_request(
            &h.ctx,
            NewRequest {
                terms,
                ..NewRequest::new(ProductId::new(), dec!(3))
            },
        )
        .unwrap()
}

fn in_progress(h: &Harness, terms: PurchasingTerms) -> (QuotationRequestId, PurchaseLineRef) {
    let id = new_request(h, terms);
    h.controller.aggregate(&h.ctx, &[id]).unwrap();
    let line = h
        .controller
        .request(h.ctx.company_id, id)
        .unwrap()
        .purchase_line()
        .unwrap();
    (id, line)
}

fn dispatch_error(err: WorkflowError) -> DispatchError {
    match err {
        WorkflowError::Dispatch(e) => e,
        other => panic!("expected a dispatch error, got {other:?}"),
    }
}

#[test]
fn quote_flows_from_sales_line_to_purchase_order_and_back() {
    let h = harness();
    let (line, _) = h.sales_line(dec!(3), dec!(20), false);
    let product_id = h
        .controller
        .sales_order(h.ctx.company_id, line.order_id)
        .unwrap()
        .line(line.line_no)
        .unwrap()
        .product_id;

    let request_id = h
        .controller
        .create_request(&h.ctx, NewRequest::new(product_id, dec!(3)).for_line(line))
        .unwrap();
    let request = h.controller.request(h.ctx.company_id, request_id).unwrap();
    assert_eq!(request.stage(), Stage::New);
    assert_eq!(request.origin(), Some(line));
    assert_eq!(request.sales().sales_value_snapshot, Some(dec!(60)));

    let orders = h.controller.aggregate(&h.ctx, &[request_id]).unwrap();
    assert_eq!(orders.len(), 1);

    let order = h.controller.purchase_order(h.ctx.company_id, orders[0]).unwrap();
    assert_eq!(order.lines().len(), 1);
    assert_eq!(order.lines()[0].product_id, product_id);
    assert_eq!(order.lines()[0].quantity, dec!(3));
    assert_eq!(order.lines()[0].unit_price, dec!(0));
    assert_eq!(order.lines()[0].description, request.reference());

    let request = h.controller.request(h.ctx.company_id, request_id).unwrap();
    assert_eq!(request.stage(), Stage::InProgress);
    let purchase_line = request.purchase_line().unwrap();
    assert_eq!(purchase_line.order_id, orders[0]);

    h.controller
        .record_supplier_quote(&h.ctx, purchase_line, dec!(50))
        .unwrap();
    assert_eq!(h.controller.import_price(&h.ctx, &[request_id]).unwrap(), 1);
    assert!(h.controller.set_margin(&h.ctx, request_id, margin(dec!(1.1))).unwrap());
    assert_eq!(h.controller.finalize(&h.ctx, &[request_id]).unwrap(), 1);

    let request = h.controller.request(h.ctx.company_id, request_id).unwrap();
    assert_eq!(request.stage(), Stage::Done);
    assert_eq!(request.initial_purchase_price(), Some(dec!(50)));
    assert_eq!(request.final_sale_value(), Some(dec!(55.0)));
    assert_eq!(request.completed_on(), Some(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()));

    let sales_order = h.controller.sales_order(h.ctx.company_id, line.order_id).unwrap();
    let sales_line = sales_order.line(line.line_no).unwrap();
    assert_eq!(sales_line.unit_price, dec!(55.0));
    assert_eq!(sales_line.quantity, dec!(3));

    let summary = h.controller.directory().get(h.ctx.company_id, &request_id).unwrap();
    assert_eq!(summary.stage, Stage::Done);
    assert_eq!(summary.final_sale_value, Some(dec!(55.0)));
}

#[test]
fn currency_only_strategy_groups_by_currency_under_the_company_partner() {
    let h = harness();
    let stop_early = h.ctx.now + Duration::days(3);
    let stop_late = h.ctx.now + Duration::days(10);

    let first = h
        .controller
        .create_request(
            &h.ctx,
            NewRequest {
                period_stop: Some(stop_late),
                ..NewRequest::new(ProductId::new(), dec!(1))
            },
        )
        .unwrap();
    let second = h
        .controller
        .create_request(
            &h.ctx,
            NewRequest {
                terms: PurchasingTerms {
                    currency: Some(eur()),
                    ..PurchasingTerms::default()
                },
                ..NewRequest::new(ProductId::new(), dec!(2))
            },
        )
        .unwrap();
    let third = h
        .controller
        .create_request(
            &h.ctx,
            NewRequest {
                terms: PurchasingTerms {
                    currency: Some(usd()),
                    supplier_id: Some(PartyId::new()),
                    ..PurchasingTerms::default()
                },
                period_stop: Some(stop_early),
                ..NewRequest::new(ProductId::new(), dec!(3))
            },
        )
        .unwrap();

    let orders = h.controller.aggregate(&h.ctx, &[first, second, third]).unwrap();
    assert_eq!(orders.len(), 2);

    // First group by appearance is the company currency (USD).
    let usd_order = h.controller.purchase_order(h.ctx.company_id, orders[0]).unwrap();
    assert_eq!(usd_order.currency(), Some(&usd()));
    assert_eq!(usd_order.counterparty(), Some(h.ctx.company_partner));
    assert_eq!(usd_order.date_planned(), Some(stop_early));
    assert_eq!(usd_order.lines().len(), 2);

    let eur_order = h.controller.purchase_order(h.ctx.company_id, orders[1]).unwrap();
    assert_eq!(eur_order.currency(), Some(&eur()));
    assert_eq!(eur_order.date_planned(), None);
    assert_eq!(eur_order.lines().len(), 1);

    for id in [first, second, third] {
        let request = h.controller.request(h.ctx.company_id, id).unwrap();
        assert_eq!(request.stage(), Stage::InProgress);
        let line = request.purchase_line().unwrap();
        assert!(orders.contains(&line.order_id));
    }
    assert_eq!(h.controller.requests_for_order(&h.ctx, orders[0]).len(), 2);
}

#[test]
fn supplier_strategy_without_supplier_fails_the_whole_batch() {
    let h = harness_with(WorkflowConfig {
        grouping_strategy: GroupingStrategy::SupplierAndCurrency,
        ..WorkflowConfig::default()
    });
    let with_supplier = new_request(
        &h,
        PurchasingTerms {
            supplier_id: Some(PartyId::new()),
            ..PurchasingTerms::default()
        },
    );
    let without_supplier = new_request(&h, PurchasingTerms::default());

    let err = h
        .controller
        .aggregate(&h.ctx, &[with_supplier, without_supplier])
        .unwrap_err();
    assert!(err.is_user_actionable());
    match dispatch_error(err) {
        DispatchError::Precondition { reason, .. } => assert_eq!(reason, "supplier is not set"),
        other => panic!("expected Precondition, got {other:?}"),
    }

    let purchase_events = h
        .store
        .load_by_type(h.ctx.company_id, quoteflow_purchasing::AGGREGATE_TYPE)
        .unwrap();
    assert!(purchase_events.is_empty());
    assert_eq!(h.controller.directory().by_stage(h.ctx.company_id, Stage::New).len(), 2);
}

#[test]
fn supplier_strategy_sends_orders_to_each_supplier() {
    let h = harness_with(WorkflowConfig {
        grouping_strategy: GroupingStrategy::SupplierAndCurrency,
        ..WorkflowConfig::default()
    });
    let supplier = PartyId::new();
    let terms = PurchasingTerms {
        supplier_id: Some(supplier),
        ..PurchasingTerms::default()
    };
    let a = new_request(&h, terms.clone());
    let b = new_request(&h, terms);

    let orders = h.controller.aggregate(&h.ctx, &[a, b]).unwrap();
    assert_eq!(orders.len(), 1);
    let order = h.controller.purchase_order(h.ctx.company_id, orders[0]).unwrap();
    assert_eq!(order.counterparty(), Some(supplier));
}

#[test]
fn aggregating_nothing_is_rejected() {
    let h = harness();
    let err = h.controller.aggregate(&h.ctx, &[]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::NoEligibleRequests(_)));
    assert!(
        h.store
            .load_by_type(h.ctx.company_id, quoteflow_purchasing::AGGREGATE_TYPE)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn a_request_cannot_be_aggregated_twice() {
    let h = harness();
    let (id, _) = in_progress(&h, PurchasingTerms::default());
    let fresh = new_request(&h, PurchasingTerms::default());

    let err = h.controller.aggregate(&h.ctx, &[fresh, id]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Precondition { .. }));

    // Nothing from the failed batch was committed.
    let fresh_state = h.controller.request(h.ctx.company_id, fresh).unwrap();
    assert_eq!(fresh_state.stage(), Stage::New);
    assert_eq!(
        h.store
            .load_by_type(h.ctx.company_id, quoteflow_purchasing::AGGREGATE_TYPE)
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "purchasing.order.created")
            .count(),
        1
    );
}

#[test]
fn aggregating_only_in_progress_requests_has_no_eligible_requests() {
    let h = harness();
    let (id, _) = in_progress(&h, PurchasingTerms::default());

    let err = h.controller.aggregate(&h.ctx, &[id]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::NoEligibleRequests(_)));
    assert_eq!(
        h.store
            .load_by_type(h.ctx.company_id, quoteflow_purchasing::AGGREGATE_TYPE)
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "purchasing.order.created")
            .count(),
        1
    );
}

#[test]
fn initial_price_seeds_the_purchase_line() {
    let h = harness();
    let (_, line) = in_progress(
        &h,
        PurchasingTerms {
            initial_purchase_price: Some(dec!(40)),
            ..PurchasingTerms::default()
        },
    );
    let order = h.controller.purchase_order(h.ctx.company_id, line.order_id).unwrap();
    assert_eq!(order.line(line.line_no).unwrap().unit_price, dec!(40));
}

#[test]
fn import_ignores_zero_price_and_copies_positive_price() {
    let h = harness();
    let (id, line) = in_progress(
        &h,
        PurchasingTerms {
            initial_purchase_price: Some(dec!(40)),
            ..PurchasingTerms::default()
        },
    );

    h.controller.record_supplier_quote(&h.ctx, line, dec!(0)).unwrap();
    assert_eq!(h.controller.import_price(&h.ctx, &[id]).unwrap(), 0);
    let request = h.controller.request(h.ctx.company_id, id).unwrap();
    assert_eq!(request.initial_purchase_price(), Some(dec!(40)));

    h.controller.record_supplier_quote(&h.ctx, line, dec!(50)).unwrap();
    assert_eq!(h.controller.import_price(&h.ctx, &[id]).unwrap(), 1);
    let request = h.controller.request(h.ctx.company_id, id).unwrap();
    assert_eq!(request.initial_purchase_price(), Some(dec!(50)));
    assert_eq!(request.stage(), Stage::InProgress);
}

#[test]
fn out_of_range_final_price_fails_import_margin_and_finalize() {
    let h = harness();
    let huge = Decimal::MAX / dec!(2);
    let (id, line) = in_progress(
        &h,
        PurchasingTerms {
            margin: Some(margin(dec!(3))),
            ..PurchasingTerms::default()
        },
    );

    h.controller.record_supplier_quote(&h.ctx, line, huge).unwrap();
    let err = h.controller.import_price(&h.ctx, &[id]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Validation(_)));
    let request = h.controller.request(h.ctx.company_id, id).unwrap();
    assert_eq!(request.initial_purchase_price(), None);

    let (priced, line) = in_progress(&h, PurchasingTerms::default());
    h.controller.record_supplier_quote(&h.ctx, line, huge).unwrap();
    assert_eq!(h.controller.import_price(&h.ctx, &[priced]).unwrap(), 1);

    let err = h.controller.set_margin(&h.ctx, priced, margin(dec!(3))).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Validation(_)));
    let request = h.controller.request(h.ctx.company_id, priced).unwrap();
    assert_eq!(request.margin(), None);
    assert_eq!(request.final_purchase_price(), Some(huge));

    // The failed import left the first request unpriced, so it closes at zero.
    h.controller.finalize(&h.ctx, &[id]).unwrap();
    assert_eq!(
        h.controller.request(h.ctx.company_id, id).unwrap().final_sale_value(),
        Some(dec!(0))
    );
}

#[test]
fn finalize_fails_when_the_sale_value_leaves_the_decimal_range() {
    let h = harness();
    let (id, _) = in_progress(
        &h,
        PurchasingTerms {
            initial_purchase_price: Some(Decimal::MAX / dec!(2)),
            margin: Some(margin(dec!(3))),
            ..PurchasingTerms::default()
        },
    );

    let err = h.controller.finalize(&h.ctx, &[id]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Validation(_)));
    assert_eq!(
        h.controller.request(h.ctx.company_id, id).unwrap().stage(),
        Stage::InProgress
    );
}

#[test]
fn import_skips_requests_that_are_still_new() {
    let h = harness();
    let id = new_request(&h, PurchasingTerms::default());
    assert_eq!(h.controller.import_price(&h.ctx, &[id]).unwrap(), 0);
    assert_eq!(
        h.controller.request(h.ctx.company_id, id).unwrap().stage(),
        Stage::New
    );
}

#[test]
fn import_prefills_the_category_margin() {
    let h = harness();
    let category_id = CategoryId::new();
    h.margins.set(h.ctx.company_id, category_id, margin(dec!(1.25)));

    let id = h
        .controller
        .create_request(
            &h.ctx,
            NewRequest {
                category_id: Some(category_id),
                ..NewRequest::new(ProductId::new(), dec!(1))
            },
        )
        .unwrap();
    h.controller.aggregate(&h.ctx, &[id]).unwrap();
    let line = h.controller.request(h.ctx.company_id, id).unwrap().purchase_line().unwrap();

    h.controller.record_supplier_quote(&h.ctx, line, dec!(80)).unwrap();
    h.controller.import_price(&h.ctx, &[id]).unwrap();

    let request = h.controller.request(h.ctx.company_id, id).unwrap();
    assert_eq!(request.margin(), Some(margin(dec!(1.25))));
    assert_eq!(request.final_purchase_price(), Some(dec!(100.00)));
}

#[test]
fn import_prices_for_order_covers_every_linked_request() {
    let h = harness();
    let a = new_request(&h, PurchasingTerms::default());
    let b = new_request(&h, PurchasingTerms::default());
    let orders = h.controller.aggregate(&h.ctx, &[a, b]).unwrap();
    assert_eq!(orders.len(), 1);

    let linked = h.controller.requests_for_order(&h.ctx, orders[0]);
    assert_eq!(linked.iter().map(|s| s.request_id).collect::<Vec<_>>(), vec![a, b]);

    for (summary, price) in linked.iter().zip([dec!(12), dec!(30)]) {
        h.controller
            .record_supplier_quote(&h.ctx, summary.purchase_line.unwrap(), price)
            .unwrap();
    }
    assert_eq!(h.controller.import_prices_for_order(&h.ctx, orders[0]).unwrap(), 2);
    assert_eq!(
        h.controller.request(h.ctx.company_id, b).unwrap().initial_purchase_price(),
        Some(dec!(30))
    );
}

#[test]
fn finalize_without_margin_keeps_the_stage() {
    let h = harness();
    let (id, line) = in_progress(&h, PurchasingTerms::default());
    h.controller.record_supplier_quote(&h.ctx, line, dec!(50)).unwrap();
    h.controller.import_price(&h.ctx, &[id]).unwrap();

    let err = h.controller.finalize(&h.ctx, &[id]).unwrap_err();
    match dispatch_error(err) {
        DispatchError::Precondition { reason, .. } => assert_eq!(reason, "margin is not set"),
        other => panic!("expected Precondition, got {other:?}"),
    }
    assert_eq!(
        h.controller.request(h.ctx.company_id, id).unwrap().stage(),
        Stage::InProgress
    );
}

#[test]
fn a_failing_request_fails_the_whole_finalize_batch() {
    let h = harness();
    let (ready, _) = in_progress(
        &h,
        PurchasingTerms {
            initial_purchase_price: Some(dec!(100)),
            margin: Some(margin(dec!(1.2))),
            ..PurchasingTerms::default()
        },
    );
    let (unready, _) = in_progress(&h, PurchasingTerms::default());

    assert!(h.controller.finalize(&h.ctx, &[ready, unready]).is_err());
    assert_eq!(
        h.controller.request(h.ctx.company_id, ready).unwrap().stage(),
        Stage::InProgress
    );

    assert_eq!(h.controller.finalize(&h.ctx, &[ready]).unwrap(), 1);
    let done = h.controller.request(h.ctx.company_id, ready).unwrap();
    assert_eq!(done.final_sale_value(), Some(dec!(120.0)));
}

#[test]
fn finalize_nothing_is_rejected() {
    let h = harness();
    let err = h.controller.finalize(&h.ctx, &[]).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::NoEligibleRequests(_)));
}

#[test]
fn revise_is_only_allowed_while_new() {
    let h = harness();
    let id = new_request(&h, PurchasingTerms::default());

    let revised = h
        .controller
        .revise_request(
            &h.ctx,
            id,
            RequestRevision {
                quantity: Some(dec!(7)),
                priority: Some(Priority::Urgent),
                date_delivery: NaiveDate::from_ymd_opt(2026, 4, 1),
                ..RequestRevision::default()
            },
        )
        .unwrap();
    assert!(revised);

    let summary = h.controller.directory().get(h.ctx.company_id, &id).unwrap();
    assert_eq!(summary.quantity, dec!(7));
    assert_eq!(summary.priority, Priority::Urgent);

    h.controller.aggregate(&h.ctx, &[id]).unwrap();
    let err = h
        .controller
        .revise_request(
            &h.ctx,
            id,
            RequestRevision {
                quantity: Some(dec!(9)),
                ..RequestRevision::default()
            },
        )
        .unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Precondition { .. }));
}

#[test]
fn margin_can_be_set_until_the_request_is_done() {
    let h = harness();
    let (id, line) = in_progress(&h, PurchasingTerms::default());
    h.controller.record_supplier_quote(&h.ctx, line, dec!(100)).unwrap();
    h.controller.import_price(&h.ctx, &[id]).unwrap();

    h.controller.set_margin(&h.ctx, id, margin(dec!(1.2))).unwrap();
    assert_eq!(
        h.controller.request(h.ctx.company_id, id).unwrap().final_purchase_price(),
        Some(dec!(120.0))
    );
    // Same margin again is a no-op.
    assert!(!h.controller.set_margin(&h.ctx, id, margin(dec!(1.2))).unwrap());

    h.controller.finalize(&h.ctx, &[id]).unwrap();
    let err = h.controller.set_margin(&h.ctx, id, margin(dec!(1.3))).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::Precondition { .. }));
}

#[test]
fn direct_submission_from_a_line_refuses_a_second_open_request() {
    let h = harness();
    let (line, _) = h.sales_line(dec!(2), dec!(15), false);

    let first = h
        .controller
        .request_quote_for_line(&h.ctx, line, PurchasingTerms::default(), Priority::Urgent)
        .unwrap();
    let request = h.controller.request(h.ctx.company_id, first).unwrap();
    assert_eq!(request.quantity(), dec!(2));
    assert_eq!(request.priority(), Priority::Urgent);

    let order = h.controller.sales_order(h.ctx.company_id, line.order_id).unwrap();
    assert_eq!(order.line(line.line_no).unwrap().quotation_request, Some(first.0));

    let err = h
        .controller
        .request_quote_for_line(&h.ctx, line, PurchasingTerms::default(), Priority::Normal)
        .unwrap_err();
    assert!(!err.is_invariant_breach());
    match dispatch_error(err) {
        DispatchError::Precondition { reference, .. } => assert_eq!(reference, request.reference()),
        other => panic!("expected Precondition, got {other:?}"),
    }
    assert_eq!(h.controller.directory().open_for_line(h.ctx.company_id, line).len(), 1);
}

#[test]
fn references_come_from_the_configured_sequence() {
    let h = harness_with(WorkflowConfig {
        reference_prefix: "PQ".to_string(),
        reference_padding: 4,
        ..WorkflowConfig::default()
    });
    let a = new_request(&h, PurchasingTerms::default());
    let b = new_request(&h, PurchasingTerms::default());

    let directory = h.controller.directory();
    assert_eq!(directory.get(h.ctx.company_id, &a).unwrap().reference, "PQ/0001");
    assert_eq!(directory.get(h.ctx.company_id, &b).unwrap().reference, "PQ/0002");
}

#[test]
fn directory_rebuild_matches_live_directory() {
    let h = harness();
    let (_, line) = in_progress(&h, PurchasingTerms::default());
    new_request(&h, PurchasingTerms::default());
    h.controller.record_supplier_quote(&h.ctx, line, dec!(5)).unwrap();

    let before = h.controller.directory().list(h.ctx.company_id);
    let replayed = h.controller.rebuild_directory(h.ctx.company_id).unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(h.controller.directory().list(h.ctx.company_id), before);
}

#[test]
fn unknown_request_is_not_found() {
    let h = harness();
    let missing = QuotationRequestId::new(quoteflow_core::AggregateId::new());
    let err = h.controller.set_margin(&h.ctx, missing, margin(dec!(1.1))).unwrap_err();
    assert!(matches!(dispatch_error(err), DispatchError::NotFound));
}
