mod common;

use iql_core::{
    Deadline, EngineConfig, FieldGrouping, FieldGroupingOptions, GroupKey, GroupKeyMap, Grouping,
    IqlError, Query, QueryEngine, Session, SplitMode, Stat,
};
use pretty_assertions::assert_eq;

use common::{browser, country, key, latency, rows, traffic_session};

fn by_browser(options: FieldGroupingOptions) -> FieldGrouping {
    FieldGrouping::new(browser(), options, &EngineConfig::default()).unwrap()
}

#[test]
fn mode_follows_options() {
    assert_eq!(by_browser(FieldGroupingOptions::default()).mode(), SplitMode::Explode);
    assert_eq!(by_browser(FieldGroupingOptions::top(3)).mode(), SplitMode::TopK(3));
    assert_eq!(
        by_browser(FieldGroupingOptions::no_explode()).mode(),
        SplitMode::Passthrough
    );
    assert!(by_browser(FieldGroupingOptions::bottom(1)).is_bottom());
}

#[test]
fn explode_emits_one_row_per_term_and_group_in_stream_order() {
    let mut session = traffic_session();
    let query = Query::new()
        .stat(Stat::count())
        .grouping(FieldGrouping::explode(country(), &EngineConfig::default()).unwrap())
        .grouping(FieldGrouping::explode(browser(), &EngineConfig::default()).unwrap());

    let table = QueryEngine::default().execute(&mut session, query).unwrap();
    assert_eq!(table.columns, vec!["count()".to_string()]);
    assert_eq!(
        rows(&table),
        vec![
            ("UK/chrome".to_string(), vec![2.0]),
            ("US/chrome".to_string(), vec![2.0]),
            ("US/firefox".to_string(), vec![1.0]),
            ("UK/safari".to_string(), vec![1.0]),
        ]
    );
    assert!(session.stat_stack().is_empty());
}

#[test]
fn top_k_keeps_best_term_per_parent_group() {
    let mut session = traffic_session();
    session.assign_groups(vec![1, 1, 1, 2, 2, 2]).unwrap();
    let keys = GroupKeyMap::from([(1, key(&["US"])), (2, key(&["UK"]))]);
    let count = session.push_stat(&Stat::count()).unwrap();

    let grouping = Grouping::from(by_browser(FieldGroupingOptions::top(1)));
    let rows: Vec<_> = grouping
        .collect_group_stats(&mut session, &keys, &[count], &Deadline::none())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let keys: Vec<String> = rows.iter().map(|r| r.key.to_string()).collect();
    assert_eq!(keys, vec!["US/chrome", "UK/chrome"]);
    assert_eq!(rows[0].values, vec![2.0]);
    // The sort stat pushed for ranking is gone again.
    assert_eq!(session.current_stack_depth(), 1);
}

#[test]
fn bottom_k_keeps_smallest_sort_values() {
    let mut session = traffic_session();
    let query = Query::new()
        .named_stat("views", Stat::count())
        .grouping(FieldGrouping::explode(country(), &EngineConfig::default()).unwrap())
        .grouping(by_browser(FieldGroupingOptions::bottom(1)));

    let table = QueryEngine::default().execute(&mut session, query).unwrap();
    assert_eq!(
        rows(&table),
        vec![
            ("UK/safari".to_string(), vec![1.0]),
            ("US/firefox".to_string(), vec![1.0]),
        ]
    );
}

#[test]
fn top_k_ranks_by_explicit_sort_stat() {
    let mut session = traffic_session();
    let options = FieldGroupingOptions::top(1).with_sort_stat(Stat::int_field("latency"));
    let query = Query::new()
        .named_stat("latency", Stat::int_field("latency"))
        .grouping(by_browser(options));

    let table = QueryEngine::default().execute(&mut session, query).unwrap();
    assert_eq!(rows(&table), vec![("chrome".to_string(), vec![130.0])]);
}

#[test]
fn top_k_regroup_drops_unselected_terms() {
    let mut session = traffic_session();
    let query = Query::new()
        .stat(Stat::count())
        .grouping(FieldGrouping::explode(country(), &EngineConfig::default()).unwrap())
        .grouping(by_browser(FieldGroupingOptions::top(1)))
        .grouping(FieldGrouping::explode(latency(), &EngineConfig::default()).unwrap());

    let table = QueryEngine::default().execute(&mut session, query).unwrap();
    assert_eq!(
        rows(&table),
        vec![
            ("US/chrome/10".to_string(), vec![1.0]),
            ("US/chrome/20".to_string(), vec![1.0]),
            ("UK/chrome/40".to_string(), vec![1.0]),
            ("UK/chrome/60".to_string(), vec![1.0]),
        ]
    );
}

#[test]
fn top_k_larger_than_group_limit_is_rejected() {
    let config = EngineConfig::default().with_group_limit(10);
    let err = FieldGrouping::new(browser(), FieldGroupingOptions::top(11), &config).unwrap_err();
    assert!(matches!(
        err,
        IqlError::TopKExceedsLimit { requested: 11, limit: 10, .. }
    ));
    assert!(err.to_string().contains("please simplify the query"));

    assert!(FieldGrouping::new(browser(), FieldGroupingOptions::top(10), &config).is_ok());
}

#[test]
fn explode_past_group_limit_fails() {
    let mut session = iql_core::InMemorySession::new(
        common::traffic_docs(),
        &EngineConfig::default().with_group_limit(3),
    );
    let keys = GroupKeyMap::from([(1, GroupKey::root())]);
    let grouping = Grouping::from(by_browser(FieldGroupingOptions::default()));
    assert!(matches!(
        grouping.regroup(&mut session, &keys),
        Err(IqlError::GroupLimitExceeded { groups: 3, limit: 3 })
    ));
}

#[test]
fn no_explode_streams_lazily() {
    let mut session = traffic_session().fail_stream_after(2);
    session.assign_groups(vec![1, 1, 1, 2, 2, 2]).unwrap();
    let keys = GroupKeyMap::from([(1, key(&["US"])), (2, key(&["UK"]))]);
    let count = session.push_stat(&Stat::count()).unwrap();

    let grouping = Grouping::from(by_browser(FieldGroupingOptions::no_explode()));
    let mut iter = grouping
        .collect_group_stats(&mut session, &keys, &[count], &Deadline::none())
        .unwrap();

    let first = iter.next().unwrap().unwrap();
    assert_eq!(first.key.to_string(), "US/chrome");
    let second = iter.next().unwrap().unwrap();
    assert_eq!(second.key.to_string(), "UK/chrome");
    assert!(matches!(iter.next(), Some(Err(IqlError::StreamAborted { .. }))));
}

#[test]
fn no_explode_keeps_parent_groups_on_regroup() {
    let mut session = traffic_session();
    let keys = GroupKeyMap::from([(1, GroupKey::root())]);
    let grouping = Grouping::from(by_browser(FieldGroupingOptions::no_explode()));
    assert_eq!(grouping.regroup(&mut session, &keys).unwrap(), keys);
}

#[test]
fn empty_group_keys_collect_nothing() {
    let mut session = traffic_session();
    let count = session.push_stat(&Stat::count()).unwrap();
    let grouping = Grouping::from(by_browser(FieldGroupingOptions::top(2)));
    let rows: Vec<_> = grouping
        .collect_group_stats(&mut session, &GroupKeyMap::new(), &[count], &Deadline::none())
        .unwrap()
        .collect();
    assert!(rows.is_empty());
    assert_eq!(session.current_stack_depth(), 1);
}

#[test]
fn stale_stat_reference_fails_collection() {
    let mut session = traffic_session();
    let count = session.push_stat(&Stat::count()).unwrap();
    session.pop_stat().unwrap();
    let keys = GroupKeyMap::from([(1, GroupKey::root())]);
    let grouping = Grouping::from(by_browser(FieldGroupingOptions::default()));
    assert!(matches!(
        grouping.collect_group_stats(&mut session, &keys, &[count], &Deadline::none()),
        Err(IqlError::StaleReference { .. })
    ));
}

#[test]
fn aggregate_stats_combine_per_group() {
    let mut session = traffic_session();
    let mean = Stat::aggregate(
        iql_core::AggregateOp::Divide,
        Stat::int_field("latency"),
        Stat::count(),
    )
    .unwrap();
    let query = Query::new()
        .named_stat("mean latency", mean)
        .grouping(FieldGrouping::explode(country(), &EngineConfig::default()).unwrap());

    let table = QueryEngine::default().execute(&mut session, query).unwrap();
    assert_eq!(
        rows(&table),
        vec![
            ("UK".to_string(), vec![50.0]),
            ("US".to_string(), vec![20.0]),
        ]
    );
}

#[test]
fn top_k_regroup_yields_one_child_per_parent() {
    let mut docs = Vec::new();
    let mut groups = Vec::new();
    for (group, country) in [(1, "US"), (2, "UK")] {
        for (browser, views) in [("chrome", 10), ("firefox", 5)] {
            for _ in 0..views {
                docs.push(
                    iql_core::Document::new()
                        .with_str("country", country)
                        .with_str("browser", browser),
                );
                groups.push(group);
            }
        }
    }
    let mut session = iql_core::InMemorySession::new(docs, &EngineConfig::default());
    session.assign_groups(groups).unwrap();
    let parents = GroupKeyMap::from([(1, key(&["US"])), (2, key(&["UK"]))]);

    let grouping = Grouping::from(by_browser(FieldGroupingOptions::top(1)));
    let children = grouping.regroup(&mut session, &parents).unwrap();
    assert_eq!(
        children,
        GroupKeyMap::from([(1, key(&["US", "chrome"])), (2, key(&["UK", "chrome"]))])
    );
    assert_eq!(session.group_count(), 3);
    assert_eq!(session.current_stack_depth(), 0);
}

#[test]
fn top_k_regroup_breaks_ties_by_term_order() {
    let docs = ["safari", "chrome", "safari", "chrome", "edge"]
        .into_iter()
        .map(|b| iql_core::Document::new().with_str("browser", b))
        .collect();
    let mut session = iql_core::InMemorySession::new(docs, &EngineConfig::default());
    let root = GroupKeyMap::from([(1, GroupKey::root())]);

    let top = Grouping::from(by_browser(FieldGroupingOptions::top(1)));
    assert_eq!(
        top.regroup(&mut session, &root).unwrap(),
        GroupKeyMap::from([(1, key(&["chrome"]))])
    );

    // The streamed selection agrees with the split on the same tie.
    let mut session = traffic_session();
    let count = session.push_stat(&Stat::count()).unwrap();
    let bottom = Grouping::from(by_browser(FieldGroupingOptions::bottom(1)));
    let streamed: Vec<String> = bottom
        .collect_group_stats(&mut session, &root, &[count], &Deadline::none())
        .unwrap()
        .map(|row| row.map(|r| r.key.to_string()))
        .collect::<Result<_, _>>()
        .unwrap();
    let split = bottom.regroup(&mut session, &root).unwrap();
    assert_eq!(streamed, vec!["firefox"]);
    assert_eq!(split, GroupKeyMap::from([(1, key(&["firefox"]))]));
}
