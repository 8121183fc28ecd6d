mod common;

use iql_core::{
    AggregateOp, CompileContext, IqlError, MetricRegistry, Session, Stat, StatOp, StatStack, Token,
};
use pretty_assertions::assert_eq;

use common::traffic_session;

#[test]
fn reference_offset_is_distance_below_the_top() {
    let mut stack = StatStack::new();
    let metrics = MetricRegistry::new();
    let first = stack.push(&Stat::count());
    let second = stack.push(&Stat::int_field("latency"));
    stack.push(&Stat::constant(1));

    let ctx = CompileContext::new(&stack, &metrics);
    assert_eq!(ctx.depth(), 3);
    assert_eq!(
        Stat::reference(&first).unwrap().compile(&ctx).unwrap(),
        vec![Token::Ref(2)]
    );
    assert_eq!(
        Stat::reference(&second).unwrap().compile(&ctx).unwrap(),
        vec![Token::Ref(1)]
    );
}

#[test]
fn offset_follows_the_stack_at_each_compile() {
    let mut stack = StatStack::new();
    let metrics = MetricRegistry::new();
    let base = stack.push(&Stat::count());
    let stat = Stat::reference(&base).unwrap();

    assert_eq!(
        stat.compile(&CompileContext::new(&stack, &metrics)).unwrap(),
        vec![Token::Ref(0)]
    );
    stack.push(&Stat::constant(2));
    assert_eq!(
        stat.compile(&CompileContext::new(&stack, &metrics)).unwrap(),
        vec![Token::Ref(1)]
    );
}

#[test]
fn popped_reference_is_stale_even_after_the_slot_is_reused() {
    let mut stack = StatStack::new();
    let metrics = MetricRegistry::new();
    let old = stack.push(&Stat::count());
    assert!(stack.is_valid(&old));
    assert_eq!(stack.pop().unwrap(), 1);
    assert!(!stack.is_valid(&old));

    let new = stack.push(&Stat::count());
    assert_eq!(new.depth(), old.depth());
    assert!(stack.is_valid(&new));
    assert!(!stack.is_valid(&old));

    let err = Stat::reference(&old)
        .unwrap()
        .compile(&CompileContext::new(&stack, &metrics))
        .unwrap_err();
    assert!(matches!(err, IqlError::StaleReference { depth: 0 }));
}

#[test]
fn references_do_not_cross_stacks() {
    let mut first = StatStack::new();
    let second = StatStack::new();
    let reference = first.push(&Stat::count());
    assert!(!second.is_valid(&reference));
}

#[test]
fn aggregate_pushes_two_slots_and_pops_both() {
    let mut stack = StatStack::new();
    let agg = Stat::aggregate(AggregateOp::Divide, Stat::int_field("a"), Stat::count()).unwrap();
    let reference = stack.push(&agg);
    assert_eq!(stack.depth(), 2);
    assert_eq!(stack.len(), 1);
    assert_eq!(reference.read(&[9.0, 3.0]), 3.0);

    assert!(matches!(
        Stat::reference(&reference),
        Err(IqlError::AggregateOperand { .. })
    ));

    assert_eq!(stack.pop().unwrap(), 2);
    assert!(stack.is_empty());
    assert!(!stack.is_valid(&reference));
    assert!(matches!(stack.pop(), Err(IqlError::StackUnderflow)));
}

#[test]
fn invalidated_metric_can_no_longer_be_used() {
    let mut metrics = MetricRegistry::new();
    let boost = metrics.register("boost");
    assert!(metrics.is_valid(&boost));
    assert!(metrics.invalidate("boost"));
    assert!(!metrics.invalidate("boost"));

    let err = Stat::dynamic(&boost, &metrics).unwrap_err();
    assert!(matches!(err, IqlError::StaleMetric { ref name } if name == "boost"));

    let again = metrics.register("boost");
    assert!(metrics.is_valid(&again));
    assert!(!metrics.is_valid(&boost));
}

#[test]
fn metric_invalidated_after_construction_fails_at_push() {
    let mut session = traffic_session();
    let boost = session
        .register_metric("boost", vec![1, 2, 3, 4, 5, 6])
        .unwrap();
    let stat = Stat::dynamic(&boost, session.metrics()).unwrap();

    let reference = session.push_stat(&stat).unwrap();
    assert_eq!(session.group_stats(&reference).unwrap(), vec![0.0, 21.0]);
    session.pop_stat().unwrap();

    session.metrics_mut().invalidate_all();
    assert!(matches!(
        session.push_stat(&stat),
        Err(IqlError::StaleMetric { .. })
    ));
    assert_eq!(session.current_stack_depth(), 0);
}

#[test]
fn session_evaluates_back_references() {
    let mut session = traffic_session();
    let latency = session.push_stat(&Stat::int_field("latency")).unwrap();
    let doubled = Stat::bin_op(
        StatOp::Multiply,
        vec![Stat::reference(&latency).unwrap(), Stat::constant(2)],
    )
    .unwrap();
    let reference = session.push_stat(&doubled).unwrap();
    assert_eq!(session.group_stats(&reference).unwrap(), vec![0.0, 420.0]);

    session.pop_stat().unwrap();
    session.pop_stat().unwrap();
    assert!(matches!(
        session.group_stats(&latency),
        Err(IqlError::StaleReference { .. })
    ));
}

#[test]
fn metrics_do_not_cross_registries() {
    let mut first = MetricRegistry::new();
    let mut second = MetricRegistry::new();
    let boost = first.register("boost");
    second.register("boost");
    assert!(first.is_valid(&boost));
    assert!(!second.is_valid(&boost));
}
